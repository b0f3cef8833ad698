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

//! Expression trees of filters and projections.
//!
//! Expressions compare by structure. Two `Var` nodes are the same column if
//! they have the same relation, attribute number, and type.

use crate::error::Result;
use crate::types::{Datum, TypeInfo};

/// The relation a `Var` refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VarNo {
    /// A base relation of the query, identified by its range table index.
    Rel(u32),
    /// The output of the relation currently being scanned, e.g., an inner
    /// relation while its hash table is built.
    Scan,
    /// The pseudo relation of the join result.
    Pseudo,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Var {
    pub varno: VarNo,
    /// Attribute number, starting at 1.
    pub attno: u16,
    pub ty: TypeInfo,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        !matches!(self, BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul)
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Eq => "=",
            BinaryOp::Ne => "<>",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
        }
    }

    /// Suffix of the device function implementing the operator.
    pub fn func_suffix(self) -> &'static str {
        match self {
            BinaryOp::Eq => "eq",
            BinaryOp::Ne => "ne",
            BinaryOp::Lt => "lt",
            BinaryOp::Le => "le",
            BinaryOp::Gt => "gt",
            BinaryOp::Ge => "ge",
            BinaryOp::Add => "pl",
            BinaryOp::Sub => "mi",
            BinaryOp::Mul => "mul",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BoolOp {
    And,
    Or,
    Not,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Var(Var),
    /// A value computed below the join and passed up like a column.
    PlaceHolder { phid: u32, expr: Box<Expr> },
    Const(Datum, TypeInfo),
    Param(u32, TypeInfo),
    Op {
        op: BinaryOp,
        args: Vec<Expr>,
        ty: TypeInfo,
    },
    Bool { op: BoolOp, args: Vec<Expr> },
    NullTest { arg: Box<Expr>, is_null: bool },
}

impl Expr {
    pub fn var(varno: VarNo, attno: u16, ty: TypeInfo) -> Self {
        Expr::Var(Var { varno, attno, ty })
    }

    /// A binary operator. Comparisons yield `bool`, arithmetic yields the
    /// type of the left argument.
    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Self {
        let ty = if op.is_comparison() {
            TypeInfo::bool()
        } else {
            left.ty()
        };
        Expr::Op {
            op,
            args: vec![left, right],
            ty,
        }
    }

    pub fn equal(left: Expr, right: Expr) -> Self {
        Self::binary(BinaryOp::Eq, left, right)
    }

    pub fn and(args: Vec<Expr>) -> Self {
        Expr::Bool {
            op: BoolOp::And,
            args,
        }
    }

    pub fn ty(&self) -> TypeInfo {
        match self {
            Expr::Var(var) => var.ty.clone(),
            Expr::PlaceHolder { expr, .. } => expr.ty(),
            Expr::Const(_, ty) | Expr::Param(_, ty) | Expr::Op { ty, .. } => ty.clone(),
            Expr::Bool { .. } | Expr::NullTest { .. } => TypeInfo::bool(),
        }
    }

    /// True for nodes that the join resolves as columns of a source relation.
    pub fn is_leaf(&self) -> bool {
        matches!(self, Expr::Var(_) | Expr::PlaceHolder { .. })
    }

    /// Appends all leaves in depth-first order. Placeholders are leaves, their
    /// contained expression is not visited.
    pub fn pull_leaves(&self, leaves: &mut Vec<Expr>) {
        match self {
            Expr::Var(_) | Expr::PlaceHolder { .. } => leaves.push(self.clone()),
            Expr::Const(..) | Expr::Param(..) => {}
            Expr::Op { args, .. } | Expr::Bool { args, .. } => {
                args.iter().for_each(|arg| arg.pull_leaves(leaves))
            }
            Expr::NullTest { arg, .. } => arg.pull_leaves(leaves),
        }
    }

    pub fn leaves(&self) -> Vec<Expr> {
        let mut leaves = Vec::new();
        self.pull_leaves(&mut leaves);
        leaves
    }

    /// Rebuilds the tree bottom-up, replacing each node for which `f`
    /// returns a substitute. Substitutes are not visited again.
    pub fn mutate<F>(&self, f: &mut F) -> Result<Expr>
    where
        F: FnMut(&Expr) -> Result<Option<Expr>>,
    {
        if let Some(replacement) = f(self)? {
            return Ok(replacement);
        }

        let expr = match self {
            Expr::Op { op, args, ty } => Expr::Op {
                op: *op,
                args: args.iter().map(|a| a.mutate(f)).collect::<Result<_>>()?,
                ty: ty.clone(),
            },
            Expr::Bool { op, args } => Expr::Bool {
                op: *op,
                args: args.iter().map(|a| a.mutate(f)).collect::<Result<_>>()?,
            },
            Expr::NullTest { arg, is_null } => Expr::NullTest {
                arg: Box::new(arg.mutate(f)?),
                is_null: *is_null,
            },
            other => other.clone(),
        };

        Ok(expr)
    }

    /// Renders the expression as SQL text. `var_name` names the columns.
    pub fn deparse<F>(&self, var_name: &F) -> String
    where
        F: Fn(&Var) -> String,
    {
        match self {
            Expr::Var(var) => var_name(var),
            Expr::PlaceHolder { expr, .. } => expr.deparse(var_name),
            Expr::Const(datum, ty) => deparse_const(datum, ty),
            Expr::Param(id, _) => format!("${}", id),
            Expr::Op { op, args, .. } => match args.as_slice() {
                [l, r] => format!(
                    "({} {} {})",
                    l.deparse(var_name),
                    op.symbol(),
                    r.deparse(var_name)
                ),
                _ => format!(
                    "{}({})",
                    op.func_suffix(),
                    args.iter()
                        .map(|a| a.deparse(var_name))
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            },
            Expr::Bool { op: BoolOp::Not, args } => format!(
                "(NOT {})",
                args.iter()
                    .map(|a| a.deparse(var_name))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            Expr::Bool { op, args } => {
                let sep = if *op == BoolOp::And { " AND " } else { " OR " };
                format!(
                    "({})",
                    args.iter()
                        .map(|a| a.deparse(var_name))
                        .collect::<Vec<_>>()
                        .join(sep)
                )
            }
            Expr::NullTest { arg, is_null } => format!(
                "({} IS {}NULL)",
                arg.deparse(var_name),
                if *is_null { "" } else { "NOT " }
            ),
        }
    }
}

fn deparse_const(datum: &Datum, ty: &TypeInfo) -> String {
    match datum {
        Datum::Null => "NULL".to_string(),
        Datum::Bool(v) => v.to_string(),
        Datum::Int2(v) => v.to_string(),
        Datum::Int4(v) => v.to_string(),
        Datum::Int8(v) => v.to_string(),
        Datum::Float4(v) => v.to_string(),
        Datum::Float8(v) => v.to_string(),
        Datum::Text(s) => format!("'{}'::{}", s.replace('\'', "''"), ty.name),
        Datum::Bytes(b) => format!("'\\x{}'::{}", hex(b), ty.name),
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// An output column of a relation or of the join.
#[derive(Clone, Debug, PartialEq)]
pub struct TargetEntry {
    pub expr: Expr,
    pub resname: String,
}

impl TargetEntry {
    pub fn new(expr: Expr, resname: &str) -> Self {
        Self {
            expr,
            resname: resname.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(rel: u32, attno: u16) -> Expr {
        Expr::var(VarNo::Rel(rel), attno, TypeInfo::int4())
    }

    #[test]
    fn leaves_in_depth_first_order() {
        let expr = Expr::and(vec![
            Expr::equal(col(1, 1), col(2, 1)),
            Expr::NullTest {
                arg: Box::new(col(1, 2)),
                is_null: false,
            },
        ]);
        assert_eq!(expr.leaves(), vec![col(1, 1), col(2, 1), col(1, 2)]);
    }

    #[test]
    fn mutate_replaces_leaves() {
        let expr = Expr::equal(col(1, 1), Expr::Const(Datum::Int4(3), TypeInfo::int4()));
        let rewritten = expr
            .mutate(&mut |e| {
                Ok(match e {
                    Expr::Var(v) => Some(Expr::var(VarNo::Pseudo, v.attno + 10, v.ty.clone())),
                    _ => None,
                })
            })
            .unwrap();
        assert_eq!(
            rewritten,
            Expr::equal(
                Expr::var(VarNo::Pseudo, 11, TypeInfo::int4()),
                Expr::Const(Datum::Int4(3), TypeInfo::int4())
            )
        );
    }

    #[test]
    fn deparse_binary_op() {
        let expr = Expr::equal(col(1, 1), Expr::Const(Datum::Text("x".into()), TypeInfo::text()));
        let text = expr.deparse(&|v: &Var| format!("r{}.c{}", 1, v.attno));
        assert_eq!(text, "(r1.c1 = 'x'::text)");
    }
}
