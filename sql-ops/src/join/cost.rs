// Copyright 2019-2022 Clemens Lutz
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Size and cost estimation of the multi-level hash buffer.
//!
//! Each inner relation is loaded in `nloops` chunks. The estimate starts with
//! a single chunk per relation. While the estimated buffer exceeds the
//! allocation ceiling, the relation with the largest chunk is split into one
//! more chunk. Every split multiplies the number of outer scans.

use super::multi_hash::{multihash_header_len, table_header_len, ENTRY_HEADER_LEN};
use super::plan::GpuHashJoinConfig;
use crate::data_store::align8;
use crate::error::{ErrorKind, Result};
use std::cmp;

/// Margin on the estimated row count that avoids splitting the hash table
/// on small estimation errors.
const NTUPLES_MARGIN: f64 = 1.15;

/// Lower bound of the estimated row count, for relations without statistics.
const NTUPLES_MIN: f64 = 1000.0;

const CPU_TUPLE_COST: f64 = 0.01;
const GPU_OPERATOR_COST: f64 = 0.000_25;

/// Planner estimates of one inner relation.
#[derive(Clone, Debug)]
pub struct InnerEstimate {
    pub rows: f64,
    pub width: usize,
    pub ncols: usize,
    pub nclauses: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DepthCost {
    pub nloops: u32,
    pub ntuples: u32,
    pub nslots: u32,
    pub chunk_size: usize,
    /// Share of the buffer that the tables of this and all deeper depths
    /// may use.
    pub threshold_ratio: f64,
}

#[derive(Clone, Debug)]
pub struct HashTableEstimate {
    /// Per inner relation, starting at depth 1.
    pub depths: Vec<DepthCost>,
    pub hashtable_size: usize,
    pub numbatches: u32,
    pub startup_cost: f64,
    pub total_cost: f64,
}

fn estimate_once(inners: &[InnerEstimate], nloops: &[u32]) -> (Vec<DepthCost>, usize) {
    let mut total = multihash_header_len(inners.len());
    let mut depths: Vec<DepthCost> = inners
        .iter()
        .zip(nloops)
        .map(|(inner, &nloops)| {
            let ntuples = f64::max(NTUPLES_MARGIN * inner.rows, NTUPLES_MIN) / nloops as f64;
            let ntuples = cmp::max(ntuples as u32, 1);
            let bitmap_len = (inner.ncols + 7) / 8;
            let entry_size = ENTRY_HEADER_LEN + align8(bitmap_len) + align8(inner.width);
            let chunk_size = table_header_len(inner.ncols)
                + align8(8 * ntuples as usize)
                + entry_size * ntuples as usize;
            total += chunk_size;

            DepthCost {
                nloops,
                ntuples,
                nslots: ntuples,
                chunk_size,
                threshold_ratio: 0.0,
            }
        })
        .collect();

    let mut threshold = 0;
    for depth in depths.iter_mut().rev() {
        threshold += depth.chunk_size;
        depth.threshold_ratio = threshold as f64 / total as f64;
    }

    (depths, total)
}

/// Estimates the hash buffer size for the inner relations of depths 1..N.
///
/// `outer_rows` and `join_rows` are the estimated row counts of the outer
/// relation and the join result.
pub fn estimate_hashtable_size(
    inners: &[InnerEstimate],
    outer_rows: f64,
    join_rows: f64,
    config: &GpuHashJoinConfig,
) -> Result<HashTableEstimate> {
    if inners.is_empty() {
        Err(ErrorKind::InvalidArgument(
            "hash join requires at least one inner relation".to_string(),
        ))?;
    }

    let mut nloops = vec![1_u32; inners.len()];
    let (depths, total) = loop {
        let (depths, total) = estimate_once(inners, &nloops);
        if total <= config.max_alloc_size {
            break (depths, total);
        }

        let (largest, cost) = depths
            .iter()
            .enumerate()
            .max_by_key(|(_, d)| d.chunk_size)
            .ok_or_else(|| ErrorKind::InternalError("no inner relation".to_string()))?;
        if cost.ntuples <= 1 {
            Err(ErrorKind::InvalidArgument(format!(
                "hash tables of {} bytes don't fit into max_alloc_size of {} bytes",
                total, config.max_alloc_size
            )))?;
        }
        nloops[largest] += 1;
    };

    let numbatches = depths
        .iter()
        .fold(1_u32, |acc, d| acc.saturating_mul(d.nloops));

    let startup_cost: f64 = inners.iter().map(|i| i.rows * CPU_TUPLE_COST).sum();
    let run_cost: f64 = inners
        .iter()
        .map(|i| GPU_OPERATOR_COST * i.nclauses as f64 * outer_rows * 0.5)
        .sum::<f64>()
        + CPU_TUPLE_COST * join_rows;

    Ok(HashTableEstimate {
        depths,
        hashtable_size: cmp::min(
            cmp::max(total, config.min_hashtable_size),
            config.max_alloc_size,
        ),
        numbatches,
        startup_cost,
        total_cost: startup_cost + run_cost * numbatches as f64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inner(rows: f64) -> InnerEstimate {
        InnerEstimate {
            rows,
            width: 16,
            ncols: 2,
            nclauses: 1,
        }
    }

    #[test]
    fn small_relations_use_one_batch() {
        let config = GpuHashJoinConfig::default();
        let est = estimate_hashtable_size(&[inner(10.0), inner(20.0)], 100.0, 100.0, &config)
            .unwrap();
        assert_eq!(est.numbatches, 1);
        assert_eq!(est.depths[0].ntuples, 1000);
        assert_eq!(est.hashtable_size, config.min_hashtable_size);
    }

    #[test]
    fn threshold_ratio_is_cumulative_from_innermost() {
        let config = GpuHashJoinConfig::default();
        let est = estimate_hashtable_size(
            &[inner(10_000.0), inner(5_000.0), inner(20_000.0)],
            1.0,
            1.0,
            &config,
        )
        .unwrap();

        let ratios: Vec<f64> = est.depths.iter().map(|d| d.threshold_ratio).collect();
        assert!(ratios[0] > ratios[1] && ratios[1] > ratios[2]);
        assert!(ratios[0] < 1.0);

        let chunks: usize = est.depths.iter().map(|d| d.chunk_size).sum();
        let total = chunks + multihash_header_len(3);
        assert!((ratios[0] - chunks as f64 / total as f64).abs() < 1e-9);
        assert!((ratios[2] - est.depths[2].chunk_size as f64 / total as f64).abs() < 1e-9);
    }

    #[test]
    fn ceiling_splits_largest_relation() {
        let config = GpuHashJoinConfig::default()
            .max_alloc_size(1 << 20)
            .min_hashtable_size(1 << 16);
        let est = estimate_hashtable_size(&[inner(100_000.0), inner(1_000.0)], 1.0, 1.0, &config)
            .unwrap();

        assert!(est.depths[0].nloops > 1);
        assert_eq!(est.depths[1].nloops, 1);
        assert_eq!(est.numbatches, est.depths[0].nloops);
        assert!(est.hashtable_size <= 1 << 20);
    }

    #[test]
    fn impossible_ceiling_is_rejected() {
        let config = GpuHashJoinConfig::default().max_alloc_size(64);
        assert!(estimate_hashtable_size(&[inner(10.0)], 1.0, 1.0, &config).is_err());
    }
}
