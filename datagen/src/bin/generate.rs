/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright (c) 2019, Clemens Lutz <lutzcle@cml.li>
 * Author: Clemens Lutz <clemens.lutz@dfki.de>
 */

use datagen::chain::{ChainSpec, KeyDistribution, Relation};
use serde_derive::Serialize;
use std::path::{Path, PathBuf};
use structopt::clap::arg_enum;
use structopt::StructOpt;

type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

fn main() -> Result<()> {
    let cmd = CmdOpt::from_args();

    let distribution = match cmd.distribution {
        ArgDistribution::Uniform => KeyDistribution::Uniform,
        ArgDistribution::Dense => KeyDistribution::Dense,
        ArgDistribution::Zipf => KeyDistribution::Zipf {
            exponent: cmd.zipf_exponent,
        },
    };
    let spec = ChainSpec {
        outer_len: cmd.outer_rel_tuples,
        inner_lens: cmd.inner_rel_tuples.clone(),
        selectivity: cmd.selectivity,
        distribution,
        payload_len: cmd.payload_len,
        seed: cmd.seed,
    };
    let chain = spec.generate()?;

    let delimiter = match cmd.file_type {
        ArgFileType::Csv => b',',
        ArgFileType::Tsv => b'\t',
    };
    let extension = cmd.file_type.to_string().to_lowercase();

    write_relation(
        &cmd.out_dir.join(format!("outer.{}", extension)),
        &chain.outer,
        delimiter,
    )?;
    for (index, inner) in chain.inners.iter().enumerate() {
        write_relation(
            &cmd.out_dir.join(format!("inner_{}.{}", index + 1, extension)),
            inner,
            delimiter,
        )?;
    }

    Ok(())
}

arg_enum! {
    #[derive(Copy, Clone, Debug, PartialEq)]
    pub enum ArgFileType {
        Csv,
        Tsv,
    }
}

arg_enum! {
    #[derive(Copy, Clone, Debug, PartialEq)]
    pub enum ArgDistribution {
        Uniform,
        Dense,
        Zipf,
    }
}

#[derive(StructOpt)]
#[structopt(
    name = "generate",
    about = "Generates the relations of a chain join as CSV files"
)]
struct CmdOpt {
    /// Set the output file type
    #[structopt(
        long = "file-type",
        default_value = "Csv",
        possible_values = &ArgFileType::variants(),
        case_insensitive = true
    )]
    file_type: ArgFileType,

    /// Distribution of the foreign keys
    #[structopt(
        long = "distribution",
        default_value = "Uniform",
        possible_values = &ArgDistribution::variants(),
        case_insensitive = true
    )]
    distribution: ArgDistribution,

    /// Exponent of the Zipf distribution
    #[structopt(long = "zipf-exponent", default_value = "1.0")]
    zipf_exponent: f64,

    /// Percentage of primary keys that find a join partner
    #[structopt(long = "selectivity")]
    selectivity: Option<u32>,

    /// Characters per payload attribute
    #[structopt(long = "payload-len", default_value = "8")]
    payload_len: usize,

    /// Seed of the random number generator
    #[structopt(long = "seed")]
    seed: Option<u64>,

    /// Outer relation size (tuples)
    #[structopt(long = "outer-rel-tuples")]
    outer_rel_tuples: usize,

    /// Inner relation sizes (tuples), starting at depth 1 (e.g.: 1000,100)
    #[structopt(long = "inner-rel-tuples", require_delimiter = true)]
    inner_rel_tuples: Vec<usize>,

    /// Output directory
    #[structopt(parse(from_os_str))]
    out_dir: PathBuf,
}

#[derive(Debug, Serialize)]
struct Record<'a> {
    key: Option<i64>,
    foreign_key: Option<i64>,
    payload: &'a str,
}

fn write_relation(path: &Path, relation: &Relation, delimiter: u8) -> Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(true)
        .delimiter(delimiter)
        .from_path(path)?;

    for (index, payload) in relation.payload.iter().enumerate() {
        writer.serialize(Record {
            key: relation.primary_key.get(index).copied(),
            foreign_key: relation.foreign_key.get(index).copied(),
            payload,
        })?;
    }
    writer.flush()?;

    Ok(())
}
