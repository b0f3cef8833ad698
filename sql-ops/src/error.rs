/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright 2018-2019 Clemens Lutz, German Research Center for Artificial Intelligence
 * Author: Clemens Lutz <clemens.lutz@dfki.de>
 */

use std::convert::From;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum ErrorKind {
    DeviceError(device_runtime::error::Error),
    IntegerOverflow(String),
    InvalidArgument(String),
    /// An invariant of the planner or executor was violated.
    InternalError(String),
    HashBuild(String),
    KernelCompile { source: String, build_log: String },
    KernelExecution(String),
    Timeout(String),
    Evaluation(String),
    Msg(String),
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// The execution stage that failed, if the error is attributed to one.
    pub fn stage(&self) -> Option<&'static str> {
        match self.kind {
            ErrorKind::HashBuild(_) => Some("hash build"),
            ErrorKind::KernelCompile { .. } => Some("kernel compile"),
            ErrorKind::KernelExecution(_) | ErrorKind::Timeout(_) => Some("kernel execution"),
            _ => None,
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self.kind {
            ErrorKind::DeviceError(ref e) => Some(e),
            _ => None,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.kind, f)
    }
}

impl From<device_runtime::error::Error> for Error {
    fn from(error: device_runtime::error::Error) -> Self {
        Self {
            kind: ErrorKind::DeviceError(error),
        }
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self { kind }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ErrorKind::DeviceError(ref e) => e.fmt(f),
            ErrorKind::IntegerOverflow(ref s) => write!(f, "IntegerOverflow: {}", s),
            ErrorKind::InvalidArgument(ref s) => write!(f, "InvalidArgument: {}", s),
            ErrorKind::InternalError(ref s) => write!(f, "InternalError: {}", s),
            ErrorKind::HashBuild(ref s) => write!(f, "hash build failed: {}", s),
            ErrorKind::KernelCompile {
                ref source,
                ref build_log,
            } => write!(
                f,
                "kernel compile failed:\n{}\nsource:\n{}",
                build_log, source
            ),
            ErrorKind::KernelExecution(ref s) => write!(f, "kernel execution failed: {}", s),
            ErrorKind::Timeout(ref s) => write!(f, "kernel execution failed: {}", s),
            ErrorKind::Evaluation(ref s) => write!(f, "Evaluation: {}", s),
            ErrorKind::Msg(ref s) => write!(f, "Msg: {}", s),
        }
    }
}

impl From<String> for ErrorKind {
    fn from(s: String) -> Self {
        ErrorKind::Msg(s)
    }
}

impl<'a> From<&'a str> for ErrorKind {
    fn from(s: &'a str) -> Self {
        ErrorKind::Msg(s.to_string())
    }
}
