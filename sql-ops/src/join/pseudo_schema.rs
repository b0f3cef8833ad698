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

//! The pseudo relation of the join result.
//!
//! Every column that the join's output or any of its clauses refers to
//! becomes a column of the pseudo relation. Each pseudo column records the
//! relation depth and column it originates from. Depth 0 is the outer
//! relation, depths 1..N are the inner relations.
//!
//! Columns referenced on the host are numbered before columns referenced
//! only by device code. Thus, the host-visible part of the pseudo relation
//! is a dense prefix.

use crate::error::{ErrorKind, Result};
use crate::expr::{BinaryOp, Expr, TargetEntry, Var, VarNo};
use crate::types::TypeInfo;

/// One column of the pseudo relation.
#[derive(Clone, Debug, PartialEq)]
pub struct PseudoEntry {
    /// Column number in the pseudo relation, starting at 1.
    pub resno: u16,
    pub srcdepth: usize,
    /// Column index in the target list of the source relation.
    pub srcresno: usize,
    pub resname: String,
    pub ty: TypeInfo,
    pub ref_host: bool,
    pub ref_device: bool,
    pub expr: Expr,
}

/// The clauses of one inner relation, in terms of the base relations.
#[derive(Clone, Debug, Default)]
pub struct DepthClauses {
    /// Equality clauses between this relation and shallower depths.
    pub hash: Vec<Expr>,
    /// Further clauses evaluated by device code.
    pub qual: Vec<Expr>,
    /// Clauses only the host can evaluate.
    pub host: Vec<Expr>,
}

/// The clauses of one depth, rewritten for execution.
#[derive(Clone, Debug, Default)]
pub struct ResolvedDepth {
    /// Hash keys in terms of the inner relation (`VarNo::Scan`).
    pub hash_inner: Vec<Expr>,
    /// Hash keys in terms of the pseudo relation, evaluated for outer rows.
    pub hash_outer: Vec<Expr>,
    /// The hash clauses in terms of the pseudo relation.
    pub hash_clauses: Vec<Expr>,
    pub qual: Vec<Expr>,
}

/// All expressions of a join, rewritten to the pseudo relation.
#[derive(Clone, Debug, Default)]
pub struct ResolvedJoin {
    /// Per inner relation, starting at depth 1.
    pub depths: Vec<ResolvedDepth>,
    pub host: Vec<Expr>,
    pub tlist: Vec<TargetEntry>,
}

#[derive(Clone, Debug)]
pub struct PseudoSchema {
    entries: Vec<PseudoEntry>,
}

struct LeafRef {
    expr: Expr,
    ref_host: bool,
    ref_device: bool,
}

fn collect(refs: &mut Vec<LeafRef>, expr: &Expr, host: bool) {
    for leaf in expr.leaves() {
        match refs.iter_mut().find(|r| r.expr == leaf) {
            Some(r) => {
                r.ref_host |= host;
                r.ref_device |= !host;
            }
            None => refs.push(LeafRef {
                expr: leaf,
                ref_host: host,
                ref_device: !host,
            }),
        }
    }
}

impl PseudoSchema {
    /// Builds the pseudo relation and rewrites the join's expressions.
    ///
    /// `sources[d]` is the target list of the relation at depth `d`.
    /// `clauses[d - 1]` holds the clauses of depth `d`.
    pub fn resolve(
        sources: &[Vec<TargetEntry>],
        tlist: &[TargetEntry],
        clauses: &[DepthClauses],
    ) -> Result<(PseudoSchema, ResolvedJoin)> {
        if sources.len() != clauses.len() + 1 {
            Err(ErrorKind::InvalidArgument(format!(
                "{} source relations for {} inner relations",
                sources.len(),
                clauses.len()
            )))?;
        }

        let mut refs = Vec::new();
        for entry in tlist {
            collect(&mut refs, &entry.expr, true);
        }
        for clause in clauses.iter().flat_map(|c| &c.host) {
            collect(&mut refs, clause, true);
        }
        for clause in clauses.iter().flat_map(|c| &c.hash) {
            collect(&mut refs, clause, false);
        }
        for clause in clauses.iter().flat_map(|c| &c.qual) {
            collect(&mut refs, clause, false);
        }

        // Column numbers follow the collection order, host references first.
        let mut pending: Vec<(usize, LeafRef)> = refs.into_iter().enumerate().collect();
        let mut entries = Vec::with_capacity(pending.len());
        for (depth, source) in sources.iter().enumerate() {
            pending.retain(|(index, leaf)| {
                match source.iter().position(|tle| tle.expr == leaf.expr) {
                    Some(srcresno) => {
                        entries.push(PseudoEntry {
                            resno: (*index + 1) as u16,
                            srcdepth: depth,
                            srcresno,
                            resname: source[srcresno].resname.clone(),
                            ty: leaf.expr.ty(),
                            ref_host: leaf.ref_host,
                            ref_device: leaf.ref_device,
                            expr: leaf.expr.clone(),
                        });
                        false
                    }
                    None => true,
                }
            });
        }
        if let Some((_, leaf)) = pending.first() {
            Err(ErrorKind::InternalError(format!(
                "reference {:?} has no source relation",
                leaf.expr
            )))?;
        }
        entries.sort_by_key(|e| e.resno);

        let schema = PseudoSchema { entries };
        schema.check_dense_prefix()?;

        let resolved = ResolvedJoin {
            depths: clauses
                .iter()
                .enumerate()
                .map(|(index, c)| schema.resolve_depth(index + 1, c))
                .collect::<Result<_>>()?,
            host: clauses
                .iter()
                .flat_map(|c| &c.host)
                .map(|clause| schema.to_pseudo(clause))
                .collect::<Result<_>>()?,
            tlist: tlist
                .iter()
                .map(|tle| {
                    Ok(TargetEntry {
                        expr: schema.to_pseudo(&tle.expr)?,
                        resname: tle.resname.clone(),
                    })
                })
                .collect::<Result<_>>()?,
        };

        Ok((schema, resolved))
    }

    pub fn entries(&self) -> &[PseudoEntry] {
        &self.entries
    }

    /// The number of host-visible columns, which form a dense prefix.
    pub fn nhost(&self) -> usize {
        self.entries.iter().filter(|e| e.ref_host).count()
    }

    pub fn host_entries(&self) -> &[PseudoEntry] {
        &self.entries[..self.nhost()]
    }

    pub fn entry(&self, resno: u16) -> Option<&PseudoEntry> {
        self.entries.get((resno as usize).checked_sub(1)?)
    }

    pub fn lookup(&self, leaf: &Expr) -> Option<&PseudoEntry> {
        self.entries.iter().find(|e| &e.expr == leaf)
    }

    /// Verifies that host-referenced columns precede all device-only columns.
    pub fn check_dense_prefix(&self) -> Result<()> {
        let nhost = self.nhost();
        for (index, entry) in self.entries.iter().enumerate() {
            if entry.resno as usize != index + 1 || entry.ref_host != (index < nhost) {
                Err(ErrorKind::InternalError(format!(
                    "pseudo column {} breaks the dense host prefix",
                    entry.resno
                )))?;
            }
        }
        Ok(())
    }

    fn lookup_leaf(&self, leaf: &Expr) -> Result<&PseudoEntry> {
        self.lookup(leaf).ok_or_else(|| {
            ErrorKind::InternalError(format!("reference {:?} is not in the pseudo relation", leaf))
                .into()
        })
    }

    /// Rewrites all leaves to columns of the pseudo relation.
    pub fn to_pseudo(&self, expr: &Expr) -> Result<Expr> {
        expr.mutate(&mut |node| {
            if !node.is_leaf() {
                return Ok(None);
            }
            let entry = self.lookup_leaf(node)?;
            Ok(Some(Expr::Var(Var {
                varno: VarNo::Pseudo,
                attno: entry.resno,
                ty: entry.ty.clone(),
            })))
        })
    }

    /// Rewrites all leaves to columns of the scanned relation at `depth`.
    fn to_scan(&self, expr: &Expr, depth: usize) -> Result<Expr> {
        expr.mutate(&mut |node| {
            if !node.is_leaf() {
                return Ok(None);
            }
            let entry = self.lookup_leaf(node)?;
            if entry.srcdepth != depth {
                Err(ErrorKind::InternalError(format!(
                    "reference {:?} of depth {} in hash key of depth {}",
                    node, entry.srcdepth, depth
                )))?;
            }
            Ok(Some(Expr::Var(Var {
                varno: VarNo::Scan,
                attno: (entry.srcresno + 1) as u16,
                ty: entry.ty.clone(),
            })))
        })
    }

    /// The depths of the relations that `expr` refers to.
    fn leaf_depths(&self, expr: &Expr) -> Result<Vec<usize>> {
        expr.leaves()
            .iter()
            .map(|leaf| self.lookup_leaf(leaf).map(|e| e.srcdepth))
            .collect()
    }

    fn clause_in_depth(&self, expr: &Expr, depth: usize) -> Result<bool> {
        let depths = self.leaf_depths(expr)?;
        Ok(!depths.is_empty() && depths.iter().all(|&d| d == depth))
    }

    fn clause_below_depth(&self, expr: &Expr, depth: usize) -> Result<bool> {
        Ok(self.leaf_depths(expr)?.iter().all(|&d| d < depth))
    }

    fn resolve_depth(&self, depth: usize, clauses: &DepthClauses) -> Result<ResolvedDepth> {
        let mut resolved = ResolvedDepth::default();

        for clause in &clauses.hash {
            let (left, right) = match clause {
                Expr::Op {
                    op: BinaryOp::Eq,
                    args,
                    ..
                } if args.len() == 2 => (&args[0], &args[1]),
                _ => Err(ErrorKind::InternalError(format!(
                    "malformed hash clause at depth {}: {:?}",
                    depth, clause
                )))?,
            };

            let (inner, outer) = if self.clause_in_depth(left, depth)?
                && self.clause_below_depth(right, depth)?
            {
                (left, right)
            } else if self.clause_in_depth(right, depth)?
                && self.clause_below_depth(left, depth)?
            {
                (right, left)
            } else {
                Err(ErrorKind::InternalError(format!(
                    "hash clause at depth {} does not join depth {} with a shallower depth",
                    depth, depth
                )))?
            };

            resolved.hash_inner.push(self.to_scan(inner, depth)?);
            resolved.hash_outer.push(self.to_pseudo(outer)?);
            resolved.hash_clauses.push(self.to_pseudo(clause)?);
        }

        for clause in &clauses.qual {
            if !self.clause_below_depth(clause, depth + 1)? {
                Err(ErrorKind::InternalError(format!(
                    "qual clause at depth {} refers to a deeper relation",
                    depth
                )))?;
            }
            resolved.qual.push(self.to_pseudo(clause)?);
        }

        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Datum;

    fn col(rel: u32, attno: u16) -> Expr {
        Expr::var(VarNo::Rel(rel), attno, TypeInfo::int4())
    }

    fn sources() -> Vec<Vec<TargetEntry>> {
        vec![
            vec![TargetEntry::new(col(1, 1), "o_id"), TargetEntry::new(col(1, 2), "o_val")],
            vec![TargetEntry::new(col(2, 1), "i_id"), TargetEntry::new(col(2, 2), "i_val")],
        ]
    }

    #[test]
    fn device_only_columns_follow_host_columns() {
        let clauses = vec![DepthClauses {
            hash: vec![Expr::equal(col(1, 1), col(2, 1))],
            qual: vec![],
            host: vec![],
        }];
        let tlist = vec![TargetEntry::new(col(2, 2), "i_val"), TargetEntry::new(col(1, 2), "o_val")];
        let (schema, resolved) = PseudoSchema::resolve(&sources(), &tlist, &clauses).unwrap();

        let names: Vec<&str> = schema.entries().iter().map(|e| e.resname.as_str()).collect();
        assert_eq!(names, vec!["i_val", "o_val", "o_id", "i_id"]);
        assert_eq!(schema.nhost(), 2);
        assert_eq!(schema.entries()[2].srcdepth, 0);
        assert_eq!(schema.entries()[3].srcdepth, 1);

        let depth = &resolved.depths[0];
        assert_eq!(depth.hash_inner, vec![Expr::var(VarNo::Scan, 1, TypeInfo::int4())]);
        assert_eq!(depth.hash_outer, vec![Expr::var(VarNo::Pseudo, 3, TypeInfo::int4())]);
        assert_eq!(
            resolved.tlist[0].expr,
            Expr::var(VarNo::Pseudo, 1, TypeInfo::int4())
        );
    }

    #[test]
    fn reversed_hash_clause_is_recognized() {
        let clauses = vec![DepthClauses {
            hash: vec![Expr::equal(col(2, 1), col(1, 1))],
            ..Default::default()
        }];
        let tlist = vec![TargetEntry::new(col(1, 1), "o_id")];
        let (_, resolved) = PseudoSchema::resolve(&sources(), &tlist, &clauses).unwrap();
        assert_eq!(
            resolved.depths[0].hash_inner,
            vec![Expr::var(VarNo::Scan, 1, TypeInfo::int4())]
        );
        assert_eq!(
            resolved.depths[0].hash_outer,
            vec![Expr::var(VarNo::Pseudo, 1, TypeInfo::int4())]
        );
    }

    #[test]
    fn unknown_reference_is_internal_error() {
        let tlist = vec![TargetEntry::new(col(3, 1), "missing")];
        let clauses = vec![DepthClauses::default()];
        match PseudoSchema::resolve(&sources(), &tlist, &clauses) {
            Err(e) => match e.kind() {
                ErrorKind::InternalError(_) => {}
                other => panic!("unexpected error kind {:?}", other),
            },
            Ok(_) => panic!("resolved an unknown reference"),
        }
    }

    #[test]
    fn non_equality_hash_clause_is_rejected() {
        let clauses = vec![DepthClauses {
            hash: vec![Expr::binary(BinaryOp::Lt, col(1, 1), col(2, 1))],
            ..Default::default()
        }];
        assert!(PseudoSchema::resolve(&sources(), &[], &clauses).is_err());
    }

    #[test]
    fn hash_clause_within_one_depth_is_rejected() {
        let clauses = vec![DepthClauses {
            hash: vec![Expr::equal(
                col(2, 1),
                Expr::binary(BinaryOp::Add, col(2, 2), Expr::Const(Datum::Int4(1), TypeInfo::int4())),
            )],
            ..Default::default()
        }];
        assert!(PseudoSchema::resolve(&sources(), &[], &clauses).is_err());
    }
}
