/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright (c) 2019, Clemens Lutz <lutzcle@cml.li>
 * Author: Clemens Lutz <clemens.lutz@dfki.de>
 */

pub type Result<T> = std::result::Result<T, Error>;

/// Why a relation couldn't be generated.
#[derive(Clone, Debug, PartialEq)]
pub enum ErrorKind {
    /// A generated key doesn't fit into the key type.
    IntegerOverflow(String),
    /// A generator parameter is out of its domain.
    InvalidArgument(String),
    /// A relation of the chain cannot be generated as specified.
    InvalidChain { depth: usize, reason: String },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Error {
    kind: ErrorKind,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn invalid_chain(depth: usize, reason: &str) -> Self {
        Self {
            kind: ErrorKind::InvalidChain {
                depth,
                reason: reason.to_string(),
            },
        }
    }
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self.kind {
            ErrorKind::IntegerOverflow(s) => write!(f, "key overflow: {}", s),
            ErrorKind::InvalidArgument(s) => write!(f, "invalid generator argument: {}", s),
            ErrorKind::InvalidChain { depth, reason } => {
                write!(f, "invalid chain at depth {}: {}", depth, reason)
            }
        }
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self { kind }
    }
}
