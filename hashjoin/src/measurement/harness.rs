/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright 2019-2021 Clemens Lutz
 * Author: Clemens Lutz <lutzcle@cml.li>
 */

use super::data_point::DataPoint;
use super::hash_join_bench::HashJoinPoint;
use crate::error::Result;
use std::path::PathBuf;
use tracing::info;

/// Runs `func` `repeat` times after one warm-up run, and writes one data
/// point per run to `out_file_name`.
pub fn measure(
    name: &str,
    repeat: u32,
    out_file_name: Option<PathBuf>,
    template: DataPoint,
    mut func: Box<dyn FnMut() -> Result<HashJoinPoint> + '_>,
) -> Result<()> {
    let measurements = (0..=repeat)
        .zip(std::iter::once(true).chain(std::iter::repeat(false)))
        .map(|(run, warm_up)| -> Result<DataPoint> {
            let p = func()?;
            info!(
                benchmark = name,
                run,
                warm_up,
                join_ns = p.join_ns.unwrap_or_default(),
                "finished run"
            );
            Ok(DataPoint {
                warm_up: Some(warm_up),
                relation_gen_ns: if warm_up {
                    template.relation_gen_ns
                } else {
                    None
                },
                plan_ns: p.plan_ns,
                join_ns: p.join_ns,
                hash_build_ns: p.hash_build_ns,
                outer_load_ns: p.outer_load_ns,
                materialize_ns: p.materialize_ns,
                dma_send_ns: p.dma_send_ns,
                kern_exec_ns: p.kern_exec_ns,
                kern_proj_ns: p.kern_proj_ns,
                dma_recv_ns: p.dma_recv_ns,
                result_tuples: p.result_tuples,
                sessions: p.sessions,
                retries: p.retries,
                dma_send_bytes: p.dma_send_bytes,
                dma_recv_bytes: p.dma_recv_bytes,
                ..template.clone()
            })
        })
        .collect::<Result<Vec<_>>>()?;

    if let Some(ofn) = out_file_name {
        let csv_file = std::fs::File::create(ofn)?;
        let mut csv = csv::Writer::from_writer(csv_file);
        for row in &measurements {
            csv.serialize(row)?;
        }
        csv.flush()?;
    }

    Ok(())
}
