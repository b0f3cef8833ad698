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

//! Expression evaluation on the host.

use crate::error::{ErrorKind, Result};
use crate::expr::{BinaryOp, BoolOp, Expr, Var};
use crate::types::Datum;
use std::cmp::Ordering;
use std::collections::HashMap;

/// Values of the executor parameters, keyed by parameter id.
pub type ParamValues = HashMap<u32, Datum>;

/// Access to the columns and parameters an expression refers to.
pub trait TupleAccess {
    fn var(&self, var: &Var) -> Result<Datum>;

    fn param(&self, id: u32) -> Result<Datum> {
        Err(ErrorKind::Evaluation(format!("no value bound for parameter ${}", id)).into())
    }
}

/// Evaluates expressions against tuples.
///
/// Filters use SQL's three-valued logic. A filter passes only if it yields
/// `true`. Both NULL and `false` reject the tuple.
pub trait ExprEvaluator: Send + Sync {
    fn eval(&self, expr: &Expr, tuple: &dyn TupleAccess) -> Result<Datum>;

    fn qual(&self, clauses: &[Expr], tuple: &dyn TupleAccess) -> Result<bool> {
        for clause in clauses {
            if self.eval(clause, tuple)? != Datum::Bool(true) {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// The default interpreter of expression trees.
#[derive(Clone, Copy, Debug, Default)]
pub struct HostEvaluator;

impl HostEvaluator {
    fn eval_op(&self, op: BinaryOp, args: &[Expr], expr: &Expr, tuple: &dyn TupleAccess) -> Result<Datum> {
        let (left, right) = match args {
            [l, r] => (self.eval(l, tuple)?, self.eval(r, tuple)?),
            _ => Err(ErrorKind::Evaluation(format!(
                "operator {} expects two arguments, got {}",
                op.symbol(),
                args.len()
            )))?,
        };

        if left.is_null() || right.is_null() {
            return Ok(Datum::Null);
        }

        if op.is_comparison() {
            let ord = left.compare(&right).ok_or_else(|| {
                ErrorKind::Evaluation(format!("cannot compare {:?} and {:?}", left, right))
            })?;
            let result = match op {
                BinaryOp::Eq => ord == Ordering::Equal,
                BinaryOp::Ne => ord != Ordering::Equal,
                BinaryOp::Lt => ord == Ordering::Less,
                BinaryOp::Le => ord != Ordering::Greater,
                BinaryOp::Gt => ord == Ordering::Greater,
                _ => ord != Ordering::Less,
            };
            return Ok(Datum::Bool(result));
        }

        let non_numeric =
            || ErrorKind::Evaluation(format!("operator {} on non-numeric values", op.symbol()));
        let (li, lf) = left.numeric_parts().ok_or_else(non_numeric)?;
        let (ri, rf) = right.numeric_parts().ok_or_else(non_numeric)?;

        let int = match (li, ri) {
            (Some(l), Some(r)) => {
                let checked = match op {
                    BinaryOp::Add => l.checked_add(r),
                    BinaryOp::Sub => l.checked_sub(r),
                    _ => l.checked_mul(r),
                };
                Some(checked.ok_or_else(|| {
                    ErrorKind::Evaluation(format!("{} out of range", expr.ty().name))
                })?)
            }
            _ => None,
        };
        let float = match op {
            BinaryOp::Add => lf + rf,
            BinaryOp::Sub => lf - rf,
            _ => lf * rf,
        };

        Datum::from_numeric(&expr.ty(), int, float)
    }

    fn eval_bool(&self, op: BoolOp, args: &[Expr], tuple: &dyn TupleAccess) -> Result<Datum> {
        match op {
            BoolOp::Not => {
                let arg = args.first().ok_or_else(|| {
                    ErrorKind::Evaluation("NOT requires an argument".to_string())
                })?;
                Ok(match self.eval(arg, tuple)? {
                    Datum::Bool(v) => Datum::Bool(!v),
                    _ => Datum::Null,
                })
            }
            BoolOp::And | BoolOp::Or => {
                let decisive = op == BoolOp::Or;
                let mut saw_null = false;
                for arg in args {
                    match self.eval(arg, tuple)? {
                        Datum::Bool(v) if v == decisive => return Ok(Datum::Bool(decisive)),
                        Datum::Bool(_) => {}
                        Datum::Null => saw_null = true,
                        other => Err(ErrorKind::Evaluation(format!(
                            "boolean operator on non-boolean value {:?}",
                            other
                        )))?,
                    }
                }
                Ok(if saw_null {
                    Datum::Null
                } else {
                    Datum::Bool(!decisive)
                })
            }
        }
    }
}

impl ExprEvaluator for HostEvaluator {
    fn eval(&self, expr: &Expr, tuple: &dyn TupleAccess) -> Result<Datum> {
        match expr {
            Expr::Var(var) => tuple.var(var),
            Expr::PlaceHolder { expr, .. } => self.eval(expr, tuple),
            Expr::Const(datum, _) => Ok(datum.clone()),
            Expr::Param(id, _) => tuple.param(*id),
            Expr::Op { op, args, .. } => self.eval_op(*op, args, expr, tuple),
            Expr::Bool { op, args } => self.eval_bool(*op, args, tuple),
            Expr::NullTest { arg, is_null } => {
                Ok(Datum::Bool(self.eval(arg, tuple)?.is_null() == *is_null))
            }
        }
    }
}

/// A tuple given as a row in the layout of one relation.
///
/// Columns are addressed by attribute number regardless of the `Var`'s
/// relation, which suits expressions already rewritten to a single relation.
pub struct RowAccess<'a> {
    pub row: &'a [Datum],
    pub params: &'a dyn Fn(u32) -> Option<Datum>,
}

impl<'a> TupleAccess for RowAccess<'a> {
    fn var(&self, var: &Var) -> Result<Datum> {
        let index = (var.attno as usize).checked_sub(1).ok_or_else(|| {
            ErrorKind::Evaluation("attribute numbers start at 1".to_string())
        })?;
        self.row.get(index).cloned().ok_or_else(|| {
            ErrorKind::Evaluation(format!(
                "attribute {} out of range of row with {} columns",
                var.attno,
                self.row.len()
            ))
            .into()
        })
    }

    fn param(&self, id: u32) -> Result<Datum> {
        (self.params)(id).ok_or_else(|| {
            ErrorKind::Evaluation(format!("no value bound for parameter ${}", id)).into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::VarNo;
    use crate::types::TypeInfo;

    fn no_params(_: u32) -> Option<Datum> {
        None
    }

    fn eval(expr: &Expr, row: &[Datum]) -> Result<Datum> {
        let access = RowAccess {
            row,
            params: &no_params,
        };
        HostEvaluator.eval(expr, &access)
    }

    fn col(attno: u16) -> Expr {
        Expr::var(VarNo::Scan, attno, TypeInfo::int4())
    }

    #[test]
    fn null_comparison_is_null() {
        let expr = Expr::equal(col(1), col(2));
        assert_eq!(eval(&expr, &[Datum::Null, Datum::Int4(1)]).unwrap(), Datum::Null);
    }

    #[test]
    fn and_with_false_dominates_null() {
        let expr = Expr::and(vec![
            Expr::equal(col(1), col(2)),
            Expr::Const(Datum::Bool(false), TypeInfo::bool()),
        ]);
        assert_eq!(
            eval(&expr, &[Datum::Null, Datum::Int4(1)]).unwrap(),
            Datum::Bool(false)
        );
    }

    #[test]
    fn qual_rejects_null() {
        let access = RowAccess {
            row: &[Datum::Null, Datum::Int4(1)],
            params: &no_params,
        };
        let clauses = vec![Expr::equal(col(1), col(2))];
        assert_eq!(HostEvaluator.qual(&clauses, &access).unwrap(), false);
    }

    #[test]
    fn integer_overflow_is_an_evaluation_error() {
        let expr = Expr::binary(BinaryOp::Add, col(1), col(2));
        let result = eval(&expr, &[Datum::Int4(i32::max_value()), Datum::Int4(1)]);
        match result {
            Err(e) => match e.kind() {
                ErrorKind::Evaluation(_) => {}
                other => panic!("unexpected error kind {:?}", other),
            },
            Ok(v) => panic!("expected overflow, got {:?}", v),
        }
    }

    #[test]
    fn missing_param_is_an_evaluation_error() {
        let expr = Expr::Param(1, TypeInfo::int4());
        assert!(eval(&expr, &[]).is_err());
    }
}
