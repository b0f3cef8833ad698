/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright (c) 2019, Clemens Lutz <lutzcle@cml.li>
 * Author: Clemens Lutz <clemens.lutz@dfki.de>
 */

use crate::error::{ErrorKind, Result};
use crate::types::ArgExecutionMode;
use datagen::chain::{ChainRelations, ChainSpec, KeyDistribution, Relation};
use device_runtime::Device;
use sql_ops::eval::HostEvaluator;
use sql_ops::expr::{Expr, TargetEntry, VarNo};
use sql_ops::join::{
    DepthClauses, ExplainOptions, GpuHashJoin, GpuHashJoinConfig, GpuHashJoinPlanner,
    GpuHashJoinStrategy, InnerRelationSpec, JoinSpec, KernelSourceTranslator, OuterRelationSpec,
};
use sql_ops::row_source::MemoryRelation;
use sql_ops::types::{Datum, Row, TypeInfo};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Attribute numbers of a generated relation.
#[derive(Clone, Copy, Debug)]
struct Columns {
    primary_key: Option<u16>,
    foreign_key: Option<u16>,
    payload: u16,
}

impl Columns {
    fn of(relation: &Relation) -> Self {
        let mut next = 1..;
        let mut take = |present: bool| {
            if present {
                next.next()
            } else {
                None
            }
        };
        let primary_key = take(!relation.primary_key.is_empty());
        let foreign_key = take(!relation.foreign_key.is_empty());
        let payload = take(true).unwrap_or(1);
        Self {
            primary_key,
            foreign_key,
            payload,
        }
    }
}

/// A generated relation, converted to rows once and scanned by every run.
struct ScanRelation {
    range_index: u32,
    columns: Columns,
    types: Arc<[TypeInfo]>,
    rows: Arc<Vec<Row>>,
}

impl ScanRelation {
    fn new(range_index: u32, relation: &Relation) -> Self {
        let columns = Columns::of(relation);
        let key = |k: i64| if k < 0 { Datum::Null } else { Datum::Int8(k) };

        let mut types = Vec::new();
        if columns.primary_key.is_some() {
            types.push(TypeInfo::int8());
        }
        if columns.foreign_key.is_some() {
            types.push(TypeInfo::int8());
        }
        types.push(TypeInfo::text());

        let rows = (0..relation.len())
            .map(|index| {
                let mut row = Vec::with_capacity(types.len());
                if let Some(&pk) = relation.primary_key.get(index) {
                    row.push(key(pk));
                }
                if let Some(&fk) = relation.foreign_key.get(index) {
                    row.push(key(fk));
                }
                row.push(Datum::Text(relation.payload[index].clone()));
                row
            })
            .collect();

        Self {
            range_index,
            columns,
            types: types.into(),
            rows: Arc::new(rows),
        }
    }

    fn var(&self, attno: u16) -> Expr {
        let ty = self.types[attno as usize - 1].clone();
        Expr::var(VarNo::Rel(self.range_index), attno, ty)
    }

    fn column_name(&self, attno: u16) -> String {
        let name = if Some(attno) == self.columns.primary_key {
            "pk"
        } else if Some(attno) == self.columns.foreign_key {
            "fk"
        } else {
            "payload"
        };
        format!("r{}_{}", self.range_index, name)
    }

    fn tlist(&self) -> Vec<TargetEntry> {
        (1..=self.types.len() as u16)
            .map(|attno| TargetEntry::new(self.var(attno), &self.column_name(attno)))
            .collect()
    }

    fn scan(&self, bulk: bool) -> Result<MemoryRelation> {
        let relation = MemoryRelation::from_shared(self.types.clone(), self.rows.clone())?;
        Ok(if bulk { relation.with_bulk() } else { relation })
    }
}

/// A chain join over generated relations.
pub struct HashJoinBench {
    pub outer_len: usize,
    pub inner_lens: Vec<usize>,
    /// The number of result rows, computed on the host.
    pub expected_rows: usize,
    /// The planner's estimate of the result rows.
    pub estimated_rows: f64,
    outer: ScanRelation,
    inners: Vec<ScanRelation>,
}

pub struct HashJoinBenchBuilder {
    spec: ChainSpec,
}

#[derive(Debug, Default)]
pub struct HashJoinPoint {
    pub plan_ns: Option<f64>,
    pub join_ns: Option<f64>,
    pub hash_build_ns: Option<f64>,
    pub outer_load_ns: Option<f64>,
    pub materialize_ns: Option<f64>,
    pub dma_send_ns: Option<f64>,
    pub kern_exec_ns: Option<f64>,
    pub kern_proj_ns: Option<f64>,
    pub dma_recv_ns: Option<f64>,
    pub result_tuples: Option<usize>,
    pub sessions: Option<u64>,
    pub retries: Option<u64>,
    pub dma_send_bytes: Option<u64>,
    pub dma_recv_bytes: Option<u64>,
}

impl Default for HashJoinBenchBuilder {
    fn default() -> HashJoinBenchBuilder {
        HashJoinBenchBuilder {
            spec: ChainSpec::default(),
        }
    }
}

impl HashJoinBenchBuilder {
    pub fn outer_len(&mut self, outer_len: usize) -> &mut Self {
        self.spec.outer_len = outer_len;
        self
    }

    pub fn inner_lens(&mut self, inner_lens: Vec<usize>) -> &mut Self {
        self.spec.inner_lens = inner_lens;
        self
    }

    pub fn distribution(&mut self, distribution: KeyDistribution) -> &mut Self {
        self.spec.distribution = distribution;
        self
    }

    pub fn selectivity(&mut self, selectivity: Option<u32>) -> &mut Self {
        self.spec.selectivity = selectivity;
        self
    }

    pub fn payload_len(&mut self, payload_len: usize) -> &mut Self {
        self.spec.payload_len = payload_len;
        self
    }

    pub fn seed(&mut self, seed: Option<u64>) -> &mut Self {
        self.spec.seed = seed;
        self
    }

    /// Generates the relations. Returns the benchmark and the time spent on
    /// generating the data.
    pub fn build_with_data_gen(&self) -> Result<(HashJoinBench, Duration)> {
        let gen_timer = Instant::now();
        let chain = self.spec.generate()?;
        let gen_time = gen_timer.elapsed();

        let expected_rows = count_chain_matches(&chain);
        let match_ratio = self.spec.selectivity.unwrap_or(100) as f64 / 100.0;
        let estimated_rows =
            chain.outer.len() as f64 * match_ratio.powi(chain.inners.len() as i32);
        debug!(
            expected_rows,
            estimated_rows, "generated chain of {} relations",
            chain.inners.len() + 1
        );

        let outer = ScanRelation::new(1, &chain.outer);
        let inners = chain
            .inners
            .iter()
            .zip(2..)
            .map(|(relation, range_index)| ScanRelation::new(range_index, relation))
            .collect();

        let bench = HashJoinBench {
            outer_len: self.spec.outer_len,
            inner_lens: self.spec.inner_lens.clone(),
            expected_rows,
            estimated_rows,
            outer,
            inners,
        };

        Ok((bench, gen_time))
    }
}

/// Counts the outer rows whose foreign keys resolve through the whole chain.
///
/// Primary keys are unique, thus each outer row yields at most one result.
fn count_chain_matches(chain: &ChainRelations) -> usize {
    let indexes: Vec<HashMap<i64, usize>> = chain
        .inners
        .iter()
        .map(|inner| {
            inner
                .primary_key
                .iter()
                .enumerate()
                .filter(|(_, &pk)| pk >= 0)
                .map(|(index, &pk)| (pk, index))
                .collect()
        })
        .collect();

    chain
        .outer
        .foreign_key
        .iter()
        .filter(|&&fk| {
            let mut key = fk;
            for (depth, index) in indexes.iter().enumerate() {
                match index.get(&key) {
                    Some(&row) => {
                        if let Some(&next) = chain.inners[depth].foreign_key.get(row) {
                            key = next;
                        }
                    }
                    None => return false,
                }
            }
            true
        })
        .count()
}

impl HashJoinBench {
    /// Joins the outer relation with each inner relation on
    /// `r{d}_fk = r{d+1}_pk`, and returns all payloads.
    fn join_spec(&self, bulk: bool) -> Result<JoinSpec> {
        let mut previous = &self.outer;
        let mut inners = Vec::with_capacity(self.inners.len());
        for inner in &self.inners {
            let (fk, pk) = match (previous.columns.foreign_key, inner.columns.primary_key) {
                (Some(fk), Some(pk)) => (fk, pk),
                _ => Err(ErrorKind::InvalidArgument(format!(
                    "relation {} has no key to join with relation {}",
                    previous.range_index, inner.range_index
                )))?,
            };
            inners.push(InnerRelationSpec {
                source: Box::new(inner.scan(false)?),
                tlist: inner.tlist(),
                clauses: DepthClauses {
                    hash: vec![Expr::equal(previous.var(fk), inner.var(pk))],
                    ..DepthClauses::default()
                },
            });
            previous = inner;
        }

        let tlist = std::iter::once(&self.outer)
            .chain(self.inners.iter())
            .map(|relation| {
                let attno = relation.columns.payload;
                TargetEntry::new(relation.var(attno), &relation.column_name(attno))
            })
            .collect();

        Ok(JoinSpec {
            outer: OuterRelationSpec {
                source: Box::new(self.outer.scan(bulk)?),
                tlist: self.outer.tlist(),
            },
            inners,
            tlist,
            join_rows: self.estimated_rows,
        })
    }

    /// Plans and executes the join once, and checks the number of result rows.
    pub fn run(
        &self,
        device: &Device,
        config: &GpuHashJoinConfig,
        mode: ArgExecutionMode,
        explain: bool,
    ) -> Result<HashJoinPoint> {
        let bulk = mode == ArgExecutionMode::Bulk;

        let plan_timer = Instant::now();
        let planner = GpuHashJoinPlanner::new(
            vec![Arc::new(GpuHashJoinStrategy)],
            Arc::new(KernelSourceTranslator),
            config.clone(),
        );
        let plan = planner.plan(self.join_spec(bulk)?)?;
        let mut join = GpuHashJoin::new(plan, device, Arc::new(HostEvaluator))?;
        let plan_time = plan_timer.elapsed();

        if bulk && !join.supports_bulk() {
            Err(ErrorKind::InvalidArgument(
                "the join doesn't support bulk execution".to_string(),
            ))?;
        }

        let join_timer = Instant::now();
        let mut result_tuples = 0;
        if bulk {
            while let Some(batch) = join.next_bulk()? {
                result_tuples += batch.nvisible();
            }
        } else {
            while join.next_row()?.is_some() {
                result_tuples += 1;
            }
        }
        let join_time = join_timer.elapsed();

        if result_tuples != self.expected_rows {
            Err(ErrorKind::ResultMismatch(self.expected_rows, result_tuples))?;
        }

        if explain {
            println!(
                "{}",
                join.explain(ExplainOptions {
                    verbose: true,
                    analyze: true,
                })
            );
        }

        let perfmon = join.perfmon();
        let ns = |d: Duration| Some(d.as_nanos() as f64);
        Ok(HashJoinPoint {
            plan_ns: ns(plan_time),
            join_ns: ns(join_time),
            hash_build_ns: ns(perfmon.time_inner_load),
            outer_load_ns: ns(perfmon.time_outer_load),
            materialize_ns: ns(perfmon.time_materialize),
            dma_send_ns: ns(perfmon.time_dma_send),
            kern_exec_ns: ns(perfmon.time_kern_exec),
            kern_proj_ns: ns(perfmon.time_kern_proj),
            dma_recv_ns: ns(perfmon.time_dma_recv),
            result_tuples: Some(result_tuples),
            sessions: Some(perfmon.num_sessions),
            retries: Some(perfmon.num_retries),
            dma_send_bytes: Some(perfmon.bytes_dma_send),
            dma_recv_bytes: Some(perfmon.bytes_dma_recv),
        })
    }
}
