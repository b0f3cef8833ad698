/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright 2018 German Research Center for Artificial Intelligence (DFKI)
 * Author: Clemens Lutz <clemens.lutz@dfki.de>
 */

mod error;
mod measurement;
mod types;

use crate::error::{ErrorKind, Result};
use crate::measurement::data_point::DataPoint;
use crate::measurement::harness;
use crate::measurement::hash_join_bench::{HashJoinBenchBuilder, HashJoinPoint};
use crate::types::*;

use datagen::chain::KeyDistribution;
use device_runtime::Device;
use sql_ops::join::GpuHashJoinConfig;

use std::path::PathBuf;
use std::time::Duration;

use structopt::StructOpt;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    // Parse commandline arguments
    let cmd = CmdOpt::from_args();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let device = Device::builder()
        .compute_units(cmd.compute_units)
        .queues(cmd.queues)
        .mem_capacity(cmd.device_mem_mib * 1024 * 1024)
        .max_work_group_size(cmd.max_work_group_size)
        .build()?;

    let config = GpuHashJoinConfig::default()
        .max_async_chunks(cmd.max_async_chunks)
        .chunk_size(cmd.chunk_bytes)
        .max_alloc_size(cmd.max_alloc_bytes)
        .row_population_max(cmd.row_population_max)
        .queue_timeout(Duration::from_secs(cmd.queue_timeout_secs))
        .perfmon(true);

    let sizes = match cmd.data_set.sizes() {
        Some(sizes) => sizes,
        None => match cmd.outer_rel_tuples {
            Some(outer) if !cmd.inner_rel_tuples.is_empty() => DataSetSizes {
                outer,
                inners: cmd.inner_rel_tuples.clone(),
            },
            _ => Err(ErrorKind::InvalidArgument(
                "--data-set Custom requires --outer-rel-tuples and --inner-rel-tuples"
                    .to_string(),
            ))?,
        },
    };

    let distribution = match cmd.distribution {
        ArgDistribution::Uniform => KeyDistribution::Uniform,
        ArgDistribution::Dense => KeyDistribution::Dense,
        ArgDistribution::Zipf => KeyDistribution::Zipf {
            exponent: cmd.zipf_exponent,
        },
    };

    let (hjb, gen_time) = HashJoinBenchBuilder::default()
        .outer_len(sizes.outer)
        .inner_lens(sizes.inners)
        .distribution(distribution)
        .selectivity(cmd.selectivity)
        .payload_len(cmd.payload_len)
        .seed(cmd.seed)
        .build_with_data_gen()?;

    let template = DataPoint::new()?
        .fill_from_cmd_options(&cmd)
        .fill_from_device(&device, &config)
        .fill_from_hash_join_bench(&hjb)
        .set_init_time(gen_time);

    let mode = cmd.execution_mode;
    let mut explain = cmd.explain;
    let hjc: Box<dyn FnMut() -> Result<HashJoinPoint> + '_> = Box::new(|| {
        // Print the plan only for the warm-up run
        let point = hjb.run(&device, &config, mode, explain)?;
        explain = false;
        Ok(point)
    });

    harness::measure("chain_hash_join", cmd.repeat, cmd.csv.clone(), template, hjc)?;

    Ok(())
}

#[derive(StructOpt)]
#[structopt(
    name = "hashjoin",
    about = "A benchmark of the GPU hash join operator on a chain of relations"
)]
pub struct CmdOpt {
    /// Number of times to repeat benchmark
    #[structopt(short = "r", long = "repeat", default_value = "30")]
    repeat: u32,

    /// Output filename for measurement CSV file
    #[structopt(long = "csv", parse(from_os_str))]
    csv: Option<PathBuf>,

    /// Print the analyzed plan after the first run
    #[structopt(long = "explain")]
    explain: bool,

    /// Use a pre-defined or custom data set.
    //   test: A small data set for testing on the laptop
    //   small: One inner relation that fits into the hash buffer
    //   chain3: A chain of three relations
    #[structopt(
        short = "s",
        long = "data-set",
        default_value = "Test",
        possible_values = &ArgDataSet::variants(),
        case_insensitive = true
    )]
    data_set: ArgDataSet,

    /// Set the outer relation size (tuples); required for `--data-set Custom`
    #[structopt(long = "outer-rel-tuples", required_if("data_set", "Custom"))]
    outer_rel_tuples: Option<usize>,

    /// Set the inner relation sizes (tuples), starting at depth 1; required for `--data-set Custom`
    #[structopt(long = "inner-rel-tuples", require_delimiter = true)]
    inner_rel_tuples: Vec<usize>,

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

    /// Execute the join row by row or return result batches.
    #[structopt(
        long = "execution-mode",
        default_value = "Row",
        possible_values = &ArgExecutionMode::variants(),
        case_insensitive = true
    )]
    execution_mode: ArgExecutionMode,

    /// Number of worker threads that execute kernels
    #[structopt(long = "compute-units", default_value = "4")]
    compute_units: usize,

    /// Number of command queues that process submissions concurrently
    #[structopt(long = "queues", default_value = "2")]
    queues: usize,

    /// Device memory capacity (MiB)
    #[structopt(long = "device-mem-mib", default_value = "1024")]
    device_mem_mib: usize,

    #[structopt(long = "max-work-group-size", default_value = "1024")]
    max_work_group_size: usize,

    /// Maximum number of join sessions in flight
    #[structopt(long = "max-async-chunks", default_value = "32")]
    max_async_chunks: usize,

    /// Byte budget of an outer relation chunk
    #[structopt(long = "chunk-bytes", default_value = "1048576")]
    chunk_bytes: usize,

    /// Maximum size of a hash buffer (bytes)
    #[structopt(long = "max-alloc-bytes", default_value = "1073741824")]
    max_alloc_bytes: usize,

    /// Upper bound of result rows per outer row used for sizing result buffers
    #[structopt(long = "row-population-max", default_value = "5.0")]
    row_population_max: f64,

    /// Timeout for waiting on a join session (seconds)
    #[structopt(long = "queue-timeout-secs", default_value = "30")]
    queue_timeout_secs: u64,
}
