/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright (c) 2019, Clemens Lutz <lutzcle@cml.li>
 * Author: Clemens Lutz <clemens.lutz@dfki.de>
 */

use serde_derive::Serialize;
use structopt::clap::arg_enum;

arg_enum! {
    #[derive(Copy, Clone, Debug, PartialEq)]
    pub enum ArgDataSet {
        Test,
        Small,
        Chain3,
        Custom,
    }
}

arg_enum! {
    #[derive(Copy, Clone, Debug, PartialEq, Serialize)]
    pub enum ArgExecutionMode {
        Row,
        Bulk,
    }
}

arg_enum! {
    #[derive(Copy, Clone, Debug, PartialEq, Serialize)]
    pub enum ArgDistribution {
        Uniform,
        Dense,
        Zipf,
    }
}

/// Relation sizes of a data set.
#[derive(Clone, Debug, PartialEq)]
pub struct DataSetSizes {
    pub outer: usize,
    pub inners: Vec<usize>,
}

impl ArgDataSet {
    /// The relation sizes of a pre-defined data set. `None` for `Custom`.
    pub fn sizes(self) -> Option<DataSetSizes> {
        let (outer, inners) = match self {
            ArgDataSet::Test => (1_000, vec![100]),
            ArgDataSet::Small => (1_000_000, vec![10_000]),
            ArgDataSet::Chain3 => (100_000, vec![10_000, 1_000]),
            ArgDataSet::Custom => return None,
        };
        Some(DataSetSizes { outer, inners })
    }
}
