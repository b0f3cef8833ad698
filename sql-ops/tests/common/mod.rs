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

#![allow(dead_code)]

use device_runtime::Device;
use itertools::Itertools;
use once_cell::sync::Lazy;
use sql_ops::error::{ErrorKind, Result as OpsResult};
use sql_ops::eval::{ExprEvaluator, HostEvaluator, TupleAccess};
use sql_ops::expr::{Expr, TargetEntry, Var, VarNo};
use sql_ops::join::{
    DepthClauses, GpuHashJoin, GpuHashJoinConfig, GpuHashJoinPlanner, GpuHashJoinStrategy,
    InnerRelationSpec, JoinSpec, KernelSourceTranslator, OuterRelationSpec,
};
use sql_ops::row_source::MemoryRelation;
use sql_ops::types::{Datum, Row, TypeInfo};
use std::error::Error;
use std::sync::Arc;

pub static DEVICE: Lazy<Device> = Lazy::new(|| {
    Device::builder()
        .name("test device")
        .compute_units(4)
        .queues(2)
        .build()
        .expect("Couldn't build the test device")
});

/// A row of a test relation: an `int4` key and a `text` value.
pub type KeyValue = (Option<i32>, String);

pub fn key_value(key: i32, value: &str) -> KeyValue {
    (Some(key), value.to_string())
}

pub fn key(rel: u32) -> Expr {
    Expr::var(VarNo::Rel(rel), 1, TypeInfo::int4())
}

pub fn value(rel: u32) -> Expr {
    Expr::var(VarNo::Rel(rel), 2, TypeInfo::text())
}

pub fn key_value_row((k, v): &KeyValue) -> Row {
    vec![k.map_or(Datum::Null, Datum::Int4), Datum::Text(v.clone())]
}

pub fn relation(rows: &[KeyValue]) -> Result<MemoryRelation, Box<dyn Error>> {
    let rows = rows.iter().map(key_value_row).collect();
    Ok(MemoryRelation::new(
        vec![TypeInfo::int4(), TypeInfo::text()],
        rows,
    )?)
}

pub fn relation_tlist(rel: u32) -> Vec<TargetEntry> {
    vec![
        TargetEntry::new(key(rel), &format!("r{}_key", rel)),
        TargetEntry::new(value(rel), &format!("r{}_value", rel)),
    ]
}

/// Joins relation 1 with relations 2..=n on their keys. Each relation is
/// joined with the previous one. The target list is the outer key followed
/// by the values of all relations.
pub fn chain_spec(relations: Vec<MemoryRelation>, join_rows: f64) -> JoinSpec {
    let nrels = relations.len() as u32;
    let mut relations = relations.into_iter();
    let outer = relations.next().expect("chain without outer relation");

    let inners = relations
        .zip(2..)
        .map(|(source, rel)| InnerRelationSpec {
            source: Box::new(source),
            tlist: relation_tlist(rel),
            clauses: DepthClauses {
                hash: vec![Expr::equal(key(rel - 1), key(rel))],
                ..DepthClauses::default()
            },
        })
        .collect();

    let tlist = std::iter::once(TargetEntry::new(key(1), "r1_key"))
        .chain((1..=nrels).map(|rel| TargetEntry::new(value(rel), &format!("r{}_value", rel))))
        .collect();

    JoinSpec {
        outer: OuterRelationSpec {
            source: Box::new(outer),
            tlist: relation_tlist(1),
        },
        inners,
        tlist,
        join_rows,
    }
}

pub fn planner(config: GpuHashJoinConfig) -> GpuHashJoinPlanner {
    GpuHashJoinPlanner::new(
        vec![Arc::new(GpuHashJoinStrategy)],
        Arc::new(KernelSourceTranslator),
        config,
    )
}

pub fn hash_join(
    spec: JoinSpec,
    config: GpuHashJoinConfig,
) -> Result<GpuHashJoin, Box<dyn Error>> {
    let plan = planner(config).plan(spec)?;
    Ok(GpuHashJoin::new(plan, &DEVICE, Arc::new(HostEvaluator))?)
}

pub fn collect_rows(join: &mut GpuHashJoin) -> Result<Vec<Row>, Box<dyn Error>> {
    let mut rows = Vec::new();
    while let Some(row) = join.next_row()? {
        rows.push(row);
    }
    Ok(rows)
}

pub fn collect_bulk(join: &mut GpuHashJoin) -> Result<Vec<Row>, Box<dyn Error>> {
    let mut rows = Vec::new();
    while let Some(batch) = join.next_bulk()? {
        rows.extend(batch.visible_rows()?);
    }
    Ok(rows)
}

/// Brings rows into a canonical order. The join doesn't define an order
/// among the matches of one outer row.
pub fn sorted(rows: Vec<Row>) -> Vec<Row> {
    rows.into_iter()
        .sorted_by_key(|row| format!("{:?}", row))
        .collect()
}

/// Joins two relations with a nested loop. NULL keys never match.
pub fn reference_join(outer: &[KeyValue], inner: &[KeyValue]) -> Vec<Row> {
    let rows = outer
        .iter()
        .cartesian_product(inner.iter())
        .filter(|((ok, _), (ik, _))| ok.is_some() && ok == ik)
        .map(|((ok, ov), (_, iv))| {
            vec![
                ok.map_or(Datum::Null, Datum::Int4),
                Datum::Text(ov.clone()),
                Datum::Text(iv.clone()),
            ]
        })
        .collect();
    sorted(rows)
}

/// The rows of base relations that a reference join combines, keyed by
/// range table index.
pub struct RelationRows<'a>(pub Vec<(u32, &'a Row)>);

impl<'a> TupleAccess for RelationRows<'a> {
    fn var(&self, var: &Var) -> OpsResult<Datum> {
        let rel = match var.varno {
            VarNo::Rel(rel) => rel,
            other => Err(ErrorKind::Evaluation(format!("unexpected {:?}", other)))?,
        };
        self.0
            .iter()
            .find(|(r, _)| *r == rel)
            .and_then(|(_, row)| row.get(var.attno as usize - 1))
            .cloned()
            .ok_or_else(|| ErrorKind::Evaluation(format!("no column {:?}", var)).into())
    }
}

/// Joins two relations with a nested loop and evaluates the unrewritten
/// clauses and target list against each pair of base rows.
pub fn reference_rows(
    outer: &[KeyValue],
    inner: &[KeyValue],
    clauses: &[Expr],
    tlist: &[TargetEntry],
) -> Result<Vec<Row>, Box<dyn Error>> {
    let outer_rows: Vec<Row> = outer.iter().map(key_value_row).collect();
    let inner_rows: Vec<Row> = inner.iter().map(key_value_row).collect();

    let mut rows = Vec::new();
    for (o, i) in outer_rows.iter().cartesian_product(inner_rows.iter()) {
        let tuple = RelationRows(vec![(1, o), (2, i)]);
        if HostEvaluator.qual(clauses, &tuple)? {
            let row = tlist
                .iter()
                .map(|te| HostEvaluator.eval(&te.expr, &tuple))
                .collect::<OpsResult<Row>>()?;
            rows.push(row);
        }
    }
    Ok(sorted(rows))
}
