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

//! Planning of a GPU hash join.
//!
//! The planner receives the enabled accelerator strategies at construction.
//! A strategy decides whether it can execute a join. For an accepted join,
//! the planner runs the cost model, resolves the pseudo relation, and
//! generates the device program.

use super::codegen::{DeviceCodeTranslator, GeneratedKernel, KernelCodeGenerator};
use super::cost::{estimate_hashtable_size, HashTableEstimate, InnerEstimate};
use super::hash_builder::LevelSpec;
use super::pseudo_schema::{DepthClauses, PseudoSchema, ResolvedJoin};
use crate::error::{ErrorKind, Result};
use crate::expr::{Expr, TargetEntry, VarNo};
use crate::row_source::RowSource;
use serde_derive::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Tuning knobs of the hash join.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GpuHashJoinConfig {
    /// The maximum number of join sessions in flight.
    pub max_async_chunks: usize,
    /// Byte budget of an outer chunk.
    pub chunk_size: usize,
    /// Hard ceiling of a hash buffer in bytes.
    pub max_alloc_size: usize,
    /// Lower bound of the initial hash buffer size in bytes.
    pub min_hashtable_size: usize,
    pub row_population_max: f64,
    pub row_population_margin: f64,
    pub queue_timeout: Duration,
    pub enable_bulkload: bool,
    pub perfmon: bool,
}

impl Default for GpuHashJoinConfig {
    fn default() -> Self {
        Self {
            max_async_chunks: 32,
            chunk_size: 1 << 20,
            max_alloc_size: 1 << 30,
            min_hashtable_size: 1 << 20,
            row_population_max: 5.0,
            row_population_margin: 1.1,
            queue_timeout: Duration::from_secs(30),
            enable_bulkload: true,
            perfmon: false,
        }
    }
}

macro_rules! config_setters {
    ($($field:ident: $ty:ty),*) => {
        impl GpuHashJoinConfig {
            $(
                pub fn $field(mut self, $field: $ty) -> Self {
                    self.$field = $field;
                    self
                }
            )*
        }
    };
}

config_setters!(
    max_async_chunks: usize,
    chunk_size: usize,
    max_alloc_size: usize,
    min_hashtable_size: usize,
    row_population_max: f64,
    row_population_margin: f64,
    queue_timeout: Duration,
    enable_bulkload: bool,
    perfmon: bool
);

impl GpuHashJoinConfig {
    fn validate(&self) -> Result<()> {
        if self.max_async_chunks == 0 {
            Err(ErrorKind::InvalidArgument(
                "max_async_chunks must be at least 1".to_string(),
            ))?;
        }
        if self.chunk_size == 0 {
            Err(ErrorKind::InvalidArgument("chunk_size must not be 0".to_string()))?;
        }
        // Result tuples store entry offsets as u32.
        if self.max_alloc_size > u32::MAX as usize {
            Err(ErrorKind::InvalidArgument(format!(
                "max_alloc_size of {} bytes exceeds {} bytes",
                self.max_alloc_size,
                u32::MAX
            )))?;
        }
        if self.min_hashtable_size > self.max_alloc_size {
            Err(ErrorKind::InvalidArgument(format!(
                "min_hashtable_size of {} bytes exceeds max_alloc_size of {} bytes",
                self.min_hashtable_size, self.max_alloc_size
            )))?;
        }
        if !(self.row_population_margin > 0.0) || !(self.row_population_max >= 1.0) {
            Err(ErrorKind::InvalidArgument(format!(
                "invalid row population bounds: max {}, margin {}",
                self.row_population_max, self.row_population_margin
            )))?;
        }
        Ok(())
    }
}

/// The outer relation of a join, at depth 0.
pub struct OuterRelationSpec {
    pub source: Box<dyn RowSource>,
    /// The columns the source produces, in order.
    pub tlist: Vec<TargetEntry>,
}

/// An inner relation of a join and the clauses that join it.
pub struct InnerRelationSpec {
    pub source: Box<dyn RowSource>,
    pub tlist: Vec<TargetEntry>,
    pub clauses: DepthClauses,
}

/// A join as handed over by the surrounding planner.
pub struct JoinSpec {
    pub outer: OuterRelationSpec,
    /// `inners[0]` is the relation at depth 1.
    pub inners: Vec<InnerRelationSpec>,
    pub tlist: Vec<TargetEntry>,
    /// Estimated number of result rows.
    pub join_rows: f64,
}

/// Decides whether an accelerator can execute a join.
pub trait AcceleratorStrategy: Send + Sync {
    fn name(&self) -> &str;

    fn accepts(&self, spec: &JoinSpec) -> bool;
}

/// Accepts inner equi-joins with at least one hash clause per depth.
#[derive(Clone, Copy, Debug, Default)]
pub struct GpuHashJoinStrategy;

impl AcceleratorStrategy for GpuHashJoinStrategy {
    fn name(&self) -> &str {
        "GpuHashJoin"
    }

    fn accepts(&self, spec: &JoinSpec) -> bool {
        !spec.inners.is_empty() && spec.inners.iter().all(|i| !i.clauses.hash.is_empty())
    }
}

/// What a plan looks like, independently of its relations.
#[derive(Clone, Debug)]
pub struct PlanDescription {
    pub strategy: String,
    pub schema: PseudoSchema,
    pub resolved: ResolvedJoin,
    pub kernel: GeneratedKernel,
    pub estimate: HashTableEstimate,
    pub row_population_ratio: f64,
}

impl PlanDescription {
    /// True if the target list is exactly the host pseudo columns in order,
    /// so that result batches can be returned without projection.
    pub fn is_pseudo_tlist(&self) -> bool {
        self.resolved.tlist.len() == self.schema.nhost()
            && self.resolved.tlist.iter().enumerate().all(|(index, tle)| {
                matches!(&tle.expr, Expr::Var(var)
                    if var.varno == VarNo::Pseudo && var.attno as usize == index + 1)
            })
    }
}

pub struct GpuHashJoinPlan {
    pub description: PlanDescription,
    pub config: GpuHashJoinConfig,
    pub(crate) outer: Box<dyn RowSource>,
    pub(crate) levels: Vec<LevelSpec>,
}

impl std::fmt::Debug for GpuHashJoinPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("GpuHashJoinPlan")
            .field("description", &self.description)
            .field("config", &self.config)
            .finish()
    }
}

pub struct GpuHashJoinPlanner {
    strategies: Vec<Arc<dyn AcceleratorStrategy>>,
    translator: Arc<dyn DeviceCodeTranslator>,
    config: GpuHashJoinConfig,
}

fn check_tlist(source: &dyn RowSource, tlist: &[TargetEntry], depth: usize) -> Result<()> {
    let ncols = source.types().len();
    if tlist.len() != ncols {
        Err(ErrorKind::InvalidArgument(format!(
            "target list of depth {} has {} entries, relation produces {} columns",
            depth,
            tlist.len(),
            ncols
        )))?;
    }
    Ok(())
}

impl GpuHashJoinPlanner {
    pub fn new(
        strategies: Vec<Arc<dyn AcceleratorStrategy>>,
        translator: Arc<dyn DeviceCodeTranslator>,
        config: GpuHashJoinConfig,
    ) -> Self {
        Self {
            strategies,
            translator,
            config,
        }
    }

    pub fn config(&self) -> &GpuHashJoinConfig {
        &self.config
    }

    /// The first enabled strategy that accepts the join.
    pub fn strategy_for(&self, spec: &JoinSpec) -> Option<&Arc<dyn AcceleratorStrategy>> {
        self.strategies.iter().find(|s| s.accepts(spec))
    }

    pub fn plan(&self, spec: JoinSpec) -> Result<GpuHashJoinPlan> {
        self.config.validate()?;
        let strategy = self
            .strategy_for(&spec)
            .ok_or_else(|| {
                ErrorKind::InvalidArgument("no enabled strategy accepts the join".to_string())
            })?
            .name()
            .to_string();

        check_tlist(spec.outer.source.as_ref(), &spec.outer.tlist, 0)?;
        for (index, inner) in spec.inners.iter().enumerate() {
            check_tlist(inner.source.as_ref(), &inner.tlist, index + 1)?;
        }

        let sources: Vec<Vec<TargetEntry>> = std::iter::once(spec.outer.tlist.clone())
            .chain(spec.inners.iter().map(|i| i.tlist.clone()))
            .collect();
        let clauses: Vec<DepthClauses> = spec.inners.iter().map(|i| i.clauses.clone()).collect();
        let (schema, resolved) = PseudoSchema::resolve(&sources, &spec.tlist, &clauses)?;

        let source_types = std::iter::once(spec.outer.source.types())
            .chain(spec.inners.iter().map(|i| i.source.types()))
            .collect();
        let kernel = KernelCodeGenerator::new(self.translator.clone()).generate(
            &schema,
            &resolved,
            source_types,
        )?;

        let outer_rows = spec.outer.source.estimated_rows();
        let inner_estimates: Vec<InnerEstimate> = spec
            .inners
            .iter()
            .map(|i| InnerEstimate {
                rows: i.source.estimated_rows(),
                width: i.source.estimated_width(),
                ncols: i.source.types().len(),
                nclauses: i.clauses.hash.len() + i.clauses.qual.len(),
            })
            .collect();
        let estimate =
            estimate_hashtable_size(&inner_estimates, outer_rows, spec.join_rows, &self.config)?;

        let row_population_ratio = self.row_population_ratio(outer_rows, spec.join_rows);

        let levels = spec
            .inners
            .into_iter()
            .zip(&resolved.depths)
            .zip(&estimate.depths)
            .map(|((inner, depth), cost)| LevelSpec {
                source: inner.source,
                hash_keys: depth.hash_inner.clone(),
                nslots: cost.nslots as usize,
                threshold_ratio: cost.threshold_ratio,
            })
            .collect();

        Ok(GpuHashJoinPlan {
            description: PlanDescription {
                strategy,
                schema,
                resolved,
                kernel,
                estimate,
                row_population_ratio,
            },
            config: self.config.clone(),
            outer: spec.outer.source,
            levels,
        })
    }

    /// The estimated ratio of result rows to outer rows, clamped to
    /// `[1.0, row_population_max]`.
    fn row_population_ratio(&self, outer_rows: f64, join_rows: f64) -> f64 {
        let ratio = if outer_rows > 0.0 {
            join_rows / outer_rows
        } else {
            1.0
        };
        if ratio > self.config.row_population_max {
            info!(
                ratio,
                max = self.config.row_population_max,
                "row population ratio is too large, clamped to the maximum"
            );
            return self.config.row_population_max;
        }
        ratio.max(1.0)
    }
}
