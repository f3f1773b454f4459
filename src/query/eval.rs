//! Expression evaluation.
//!
//! [`Evaluator::evaluate`] walks a tree bottom-up, dispatching on opcode
//! and caching each node's result in its value slot. Immediate
//! expressions (`path`, `depth`, attribute lookup, ...) are instead
//! computed at match-event time by [`Evaluator::immed_evaluate`] and only
//! read back during the normal walk.

use std::cell::RefCell;

use crate::engine::context::{Context, PassType};
use crate::query::aggregate::Aggregate;
use crate::query::expr::{arg, col_flags, expr_flags, num_args, path_flags, ExprRef};
use crate::query::ops::{aggr_kind, flags as op_flags, Opcode};
use crate::text;
use crate::value::{format_timestamp, TypeTag, Value};

pub struct Evaluator<'a> {
    ctx: &'a RefCell<Context>,
    aggrs: Option<&'a mut Vec<Aggregate>>,
}

impl<'a> Evaluator<'a> {
    pub fn new(ctx: &'a RefCell<Context>) -> Self {
        Evaluator { ctx, aggrs: None }
    }

    pub fn with_aggregates(ctx: &'a RefCell<Context>, aggrs: &'a mut Vec<Aggregate>) -> Self {
        Evaluator {
            ctx,
            aggrs: Some(aggrs),
        }
    }

    /// True when every path reference under `expr` has matched.
    pub fn was_matched(&self, expr: &ExprRef) -> bool {
        if expr.borrow().opcode() == Opcode::PathRef {
            let path_ref = expr.borrow().path_ref.clone().expect("path ref set");
            let matched = path_ref.borrow().has_flag(path_flags::MATCHED);
            return matched;
        }
        for i in 0..num_args(expr) {
            if !self.was_matched(&arg(expr, i)) {
                return false;
            }
        }
        true
    }

    pub fn evaluate(&mut self, expr: &ExprRef) -> Value {
        let op = expr.borrow().op;

        if op.has_flag(op_flags::IMMED_EVALUATE) {
            // Already evaluated at match time.
            return expr.borrow().value.clone();
        }

        let nargs = num_args(expr);
        for i in 0..nargs {
            let child = arg(expr, i);
            self.evaluate(&child);
        }

        let v0 = if nargs >= 1 {
            arg(expr, 0).borrow().value.clone()
        } else {
            Value::Unknown
        };
        let v1 = if nargs >= 2 {
            arg(expr, 1).borrow().value.clone()
        } else {
            Value::Unknown
        };

        let set = |v: Value| expr.borrow_mut().set_value(v);

        match op.opcode {
            Opcode::Type => {
                let name = match v0.tag() {
                    TypeTag::Real => "real",
                    TypeTag::Integer => "int",
                    TypeTag::Boolean => "bool",
                    TypeTag::DateTime => "datetime",
                    _ => "str",
                };
                set(Value::Str(name.to_string()));
            }

            Opcode::ColumnRef => self.evaluate_column_ref(expr),

            Opcode::PathRef => {
                let path_ref = expr.borrow().path_ref.clone().expect("path ref set");
                let v = path_ref.borrow().value.clone();
                set(v);
            }

            Opcode::Real | Opcode::Int | Opcode::Bool | Opcode::DateTime => set(v0),

            Opcode::Str => {
                if nargs == 1 {
                    set(v0);
                } else {
                    let precision = v1.as_int().max(0) as usize;
                    set(Value::Str(v0.to_display(0, precision)));
                }
            }

            Opcode::Not => set(Value::Bool(!v0.as_bool())),

            Opcode::Neg => match &v0 {
                // Pass-through, used to sort strings in reverse order.
                Value::Unknown | Value::Str(_) => set(v0),
                Value::Int(i) => set(Value::Int(-i)),
                other => set(Value::Real(-other.as_real())),
            },

            Opcode::Abs => match &v0 {
                Value::Int(i) => set(Value::Int(i.wrapping_abs())),
                other => set(Value::Real(other.as_real().abs())),
            },

            Opcode::Concat => set(Value::Str(format!("{}{}", v0.as_str(), v1.as_str()))),

            Opcode::Add => match (&v0, &v1) {
                (Value::Int(a), Value::Int(b)) => set(Value::Int(a.wrapping_add(*b))),
                _ => set(Value::Real(v0.as_real() + v1.as_real())),
            },

            Opcode::Sub => match (&v0, &v1) {
                (Value::Int(a), Value::Int(b)) => set(Value::Int(a.wrapping_sub(*b))),
                _ => set(Value::Real(v0.as_real() - v1.as_real())),
            },

            Opcode::Mul => match (&v0, &v1) {
                (Value::Int(a), Value::Int(b)) => set(Value::Int(a.wrapping_mul(*b))),
                _ => set(Value::Real(v0.as_real() * v1.as_real())),
            },

            Opcode::Div => match (&v0, &v1) {
                (Value::Int(a), Value::Int(b)) => {
                    // No NaN encoding for integers.
                    set(Value::Int(if *b == 0 { 0 } else { a.wrapping_div(*b) }));
                }
                _ => {
                    let d = v1.as_real();
                    if d == 0.0 {
                        set(Value::Real(f64::NAN));
                    } else {
                        set(Value::Real(v0.as_real() / d));
                    }
                }
            },

            Opcode::Mod => {
                let b = v1.as_int();
                set(Value::Int(if b == 0 {
                    -1
                } else {
                    v0.as_int().wrapping_rem(b)
                }));
            }

            Opcode::Or => set(Value::Bool(v0.as_bool() || v1.as_bool())),
            Opcode::Xor => set(Value::Bool(v0.as_bool() ^ v1.as_bool())),
            Opcode::And => set(Value::Bool(v0.as_bool() && v1.as_bool())),

            Opcode::Min => {
                let v = if Value::compare(&v0, &v1) == std::cmp::Ordering::Greater {
                    v1
                } else {
                    v0
                };
                set(v);
            }

            Opcode::Max => {
                let v = if Value::compare(&v0, &v1) == std::cmp::Ordering::Less {
                    v1
                } else {
                    v0
                };
                set(v);
            }

            Opcode::If => {
                let v2 = arg(expr, 2).borrow().value.clone();
                set(if v0.as_bool() { v1 } else { v2 });
            }

            Opcode::Sqrt => set(Value::Real(v0.as_real().sqrt())),

            Opcode::Log => {
                if nargs == 1 {
                    set(Value::Real(v0.as_real().ln()));
                } else {
                    set(Value::Real(v0.as_real().ln() / v1.as_real().ln()));
                }
            }

            Opcode::Exp => set(Value::Real(v0.as_real().exp())),
            Opcode::Pow => set(Value::Real(v0.as_real().powf(v1.as_real()))),

            Opcode::Floor => match &v0 {
                Value::Int(i) => set(Value::Int(*i)),
                other => set(Value::Int(other.as_real().floor() as i64)),
            },

            Opcode::Ceil => match &v0 {
                Value::Int(i) => set(Value::Int(*i)),
                other => set(Value::Int(other.as_real().ceil() as i64)),
            },

            Opcode::Len => set(Value::Int(v0.as_str().len() as i64)),

            Opcode::Left => {
                let n = v1.as_int();
                if n <= 0 {
                    set(Value::Str(String::new()));
                } else {
                    let s = v0.as_str();
                    set(Value::Str(s.chars().take(n as usize).collect()));
                }
            }

            Opcode::Right => {
                let n = v1.as_int();
                if n <= 0 {
                    set(Value::Str(String::new()));
                } else {
                    let s = v0.as_str();
                    let len = s.chars().count();
                    let take = len.min(n as usize);
                    set(Value::Str(s.chars().skip(len - take).collect()));
                }
            }

            Opcode::Lower => set(Value::Str(v0.as_str().to_ascii_lowercase())),
            Opcode::Upper => set(Value::Str(v0.as_str().to_ascii_uppercase())),

            Opcode::Contains => {
                let needle = v1.as_str();
                let found = !needle.is_empty() && v0.as_str().contains(&needle);
                set(Value::Bool(found));
            }

            Opcode::Find => {
                let needle = v1.as_str();
                let idx = if needle.is_empty() {
                    -1
                } else {
                    v0.as_str().find(&needle).map(|i| i as i64).unwrap_or(-1)
                };
                set(Value::Int(idx));
            }

            // Given (fractional) epoch seconds or milliseconds, format a
            // local date-time.
            Opcode::FormatSec => set(format_timestamp(&v0, false)),
            Opcode::FormatMs => set(format_timestamp(&v0, true)),

            Opcode::Round => match &v0 {
                Value::Int(i) => set(Value::Int(*i)),
                other => {
                    let r = other.as_real();
                    let digits = v1.as_int();
                    let rounded = if r == 0.0 {
                        0.0
                    } else if digits == 0 {
                        if r > 0.0 {
                            (r + 0.5).floor()
                        } else {
                            (r - 0.5).ceil()
                        }
                    } else {
                        let a = r + (if r < 0.0 { -0.5 } else { 0.5 })
                            * 10f64.powi(-(digits as i32));
                        let p = 10f64.powi(digits as i32);
                        ((a * p) as i64) as f64 / p
                    };
                    set(Value::Real(rounded));
                }
            },

            Opcode::Eq => set(Value::Bool(
                Value::compare(&v0, &v1) == std::cmp::Ordering::Equal,
            )),
            Opcode::Ne => set(Value::Bool(
                Value::compare(&v0, &v1) != std::cmp::Ordering::Equal,
            )),
            Opcode::Le => set(Value::Bool(
                Value::compare(&v0, &v1) != std::cmp::Ordering::Greater,
            )),
            Opcode::Ge => set(Value::Bool(
                Value::compare(&v0, &v1) != std::cmp::Ordering::Less,
            )),
            Opcode::Lt => set(Value::Bool(
                Value::compare(&v0, &v1) == std::cmp::Ordering::Less,
            )),
            Opcode::Gt => set(Value::Bool(
                Value::compare(&v0, &v1) == std::cmp::Ordering::Greater,
            )),

            Opcode::RowNum => {
                let n = self.ctx.borrow().num_rows_output as i64 + 1;
                set(Value::Int(n));
            }

            Opcode::Any
            | Opcode::Sum
            | Opcode::MinAggr
            | Opcode::MaxAggr
            | Opcode::Avg
            | Opcode::Stdev
            | Opcode::Var
            | Opcode::Count
            | Opcode::Cov
            | Opcode::Corr => {
                let idx = expr.borrow().aggr_idx;
                let pass = self.ctx.borrow().pass;
                match pass {
                    PassType::Main => {
                        let aggrs = self
                            .aggrs
                            .as_mut()
                            .expect("aggregate evaluation needs aggregate slots");
                        let aggr = &mut aggrs[idx];
                        if op.opcode == Opcode::Any {
                            aggr.update_any(&v0);
                        } else if nargs == 1 {
                            aggr.update(v0.as_real());
                        } else {
                            aggr.update2(v0.as_real(), v1.as_real());
                        }
                        set(Value::Real(0.0));
                    }
                    PassType::StoredValues => {
                        let aggrs = self
                            .aggrs
                            .as_mut()
                            .expect("aggregate evaluation needs aggregate slots");
                        let v = aggrs[idx].get(aggr_kind(op.opcode));
                        set(v);
                    }
                    _ => {}
                }
            }

            // identity functions
            Opcode::Where | Opcode::Sync => set(v0),

            _ => {}
        }

        let result = expr.borrow().value.clone();
        result
    }

    fn evaluate_column_ref(&mut self, expr: &ExprRef) {
        let column = expr.borrow().column_ref.clone().expect("resolved column");
        let joined = column.borrow().has_flag(col_flags::JOINED_COLUMN);
        let (empty_outer, pass) = {
            let ctx = self.ctx.borrow();
            (ctx.empty_outer_join, ctx.pass)
        };

        if joined && empty_outer {
            expr.borrow_mut().set_value(Value::Unknown);
            return;
        }

        let join_value = if joined {
            let ctx = self.ctx.borrow();
            ctx.join_table.as_ref().map(|table| {
                let row = &table[ctx.join_table_row_idx];
                row[column.borrow().index].clone()
            })
        } else {
            None
        };
        if let Some(v) = join_value {
            expr.borrow_mut().set_value(v);
            return;
        }

        let column_expr = column.borrow().expr.clone();
        if pass == PassType::StoredValues
            && column_expr
                .borrow()
                .has_flag(expr_flags::SUBTREE_CONTAINS_AGGREGATE)
        {
            // Aggregate columns are recomputed per stored row; refresh the
            // cached value.
            self.evaluate(&column_expr);
        }
        // The same column can be cited with different types, so convert.
        let v = column_expr.borrow().value.clone();
        expr.borrow_mut().set_value(v);
    }

    /// Evaluate a match-time expression against the current parse state.
    /// Runs at the start-tag or end-tag event of its path argument.
    pub fn immed_evaluate(&self, expr: &ExprRef) {
        let op = expr.borrow().op;
        debug_assert!(op.has_flag(op_flags::IMMED_EVALUATE));
        let nargs = num_args(expr);

        let v1 = if nargs >= 2 {
            arg(expr, 1).borrow().value.clone()
        } else {
            Value::Unknown
        };

        match op.opcode {
            Opcode::Path
            | Opcode::Depth
            | Opcode::NodeNum
            | Opcode::NodeName
            | Opcode::NodeStart
            | Opcode::NodeEnd => {
                let ctx = self.ctx.borrow();
                // The tags that made the match are excluded: path(bar.baz)
                // for <foo><bar><baz> refers to foo.
                let curr_depth = ctx.node_stack.len() as i32;
                let relative_depth = ctx.relative_depth - 1;
                if curr_depth < relative_depth {
                    drop(ctx);
                    let ty = expr.borrow().ty;
                    if ty == TypeTag::Integer {
                        expr.borrow_mut().set_value(Value::Int(0));
                    } else {
                        expr.borrow_mut().set_value(Value::empty_string());
                    }
                    return;
                }
                let base_idx = (curr_depth - relative_depth).min(curr_depth - 1);

                let value = match op.opcode {
                    Opcode::Path => {
                        let mut s = String::new();
                        for i in 0..base_idx.max(0) {
                            if i > 0 {
                                s.push('.');
                            }
                            s.push_str(&ctx.node_stack[i as usize].name);
                        }
                        Value::Str(s)
                    }

                    Opcode::Depth => Value::Int(base_idx.max(0) as i64),

                    Opcode::NodeNum => {
                        let idx = if nargs == 1 {
                            base_idx
                        } else if arg(expr, 1).borrow().ty == TypeTag::Integer {
                            base_idx - v1.as_int() as i32
                        } else {
                            // Walk backward for an ancestor by name.
                            let name = v1.as_str();
                            let mut idx = base_idx;
                            while idx >= 0 {
                                if text::eq_fold(
                                    &ctx.node_stack[idx as usize].name,
                                    &name,
                                    ctx.case_sensitive,
                                ) {
                                    break;
                                }
                                idx -= 1;
                            }
                            idx
                        };
                        let result = if idx >= 0 && idx <= base_idx {
                            ctx.node_stack[idx as usize].node_start as i64
                        } else {
                            0
                        };
                        Value::Int(result)
                    }

                    Opcode::NodeName => {
                        let idx = if nargs == 1 {
                            base_idx
                        } else {
                            base_idx - v1.as_int() as i32
                        };
                        if idx >= 0 && idx <= base_idx {
                            Value::Str(ctx.node_stack[idx as usize].name.clone())
                        } else {
                            Value::empty_string()
                        }
                    }

                    Opcode::NodeStart => {
                        if base_idx >= 0 {
                            Value::Int(ctx.node_stack[base_idx as usize].node_start as i64)
                        } else {
                            Value::Int(0)
                        }
                    }

                    Opcode::NodeEnd => Value::Int(ctx.num_nodes as i64),

                    _ => unreachable!(),
                };
                drop(ctx);
                expr.borrow_mut().set_value(value);
            }

            Opcode::Attr => {
                let ctx = self.ctx.borrow();
                let name = v1.as_str();
                let mut found = None;
                for (attr_name, attr_value) in ctx.attr_stack.iter().rev() {
                    if text::eq_fold(attr_name, &name, ctx.case_sensitive)
                        && !attr_value.is_empty()
                    {
                        found = Some(attr_value.clone());
                        break;
                    }
                }
                drop(ctx);
                expr.borrow_mut()
                    .set_value(Value::Str(found.unwrap_or_default()));
            }

            Opcode::LineNum => {
                let n = self.ctx.borrow().num_lines as i64;
                expr.borrow_mut().set_value(Value::Int(n));
            }

            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::context::Context;
    use crate::query::expr::Expr;
    use crate::query::ops;
    use crate::query::types;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn ctx() -> RefCell<Context> {
        RefCell::new(Context::new(Arc::new(AtomicBool::new(false))))
    }

    fn literal(v: Value) -> ExprRef {
        let e = Expr::new();
        e.borrow_mut().set_op(ops::by_opcode(Opcode::Literal));
        e.borrow_mut().set_value_and_type(v);
        e
    }

    fn call(name: &str, args: Vec<ExprRef>) -> ExprRef {
        let e = Expr::new();
        e.borrow_mut().set_op(ops::lookup(name).unwrap());
        e.borrow_mut().args = args;
        types::infer(&e);
        e
    }

    fn eval(expr: &ExprRef) -> Value {
        let c = ctx();
        let mut ev = Evaluator::new(&c);
        ev.evaluate(expr)
    }

    #[test]
    fn test_arithmetic() {
        let e = call("+", vec![literal(Value::Int(2)), literal(Value::Int(3))]);
        assert_eq!(eval(&e).as_int(), 5);

        let e = call("*", vec![literal(Value::Real(2.5)), literal(Value::Int(2))]);
        assert_eq!(eval(&e).as_real(), 5.0);
    }

    #[test]
    fn test_division_by_zero() {
        let e = call("/", vec![literal(Value::Real(1.0)), literal(Value::Real(0.0))]);
        assert!(eval(&e).as_real().is_nan());

        let e = call("/", vec![literal(Value::Int(1)), literal(Value::Int(0))]);
        assert_eq!(eval(&e).as_int(), 0);

        let e = call("%", vec![literal(Value::Int(5)), literal(Value::Int(0))]);
        assert_eq!(eval(&e).as_int(), -1);
    }

    #[test]
    fn test_concat_acts_as_string() {
        let e = call("&", vec![literal(Value::Int(1)), literal(Value::Str("x".into()))]);
        assert_eq!(eval(&e).as_str(), "1x");
    }

    #[test]
    fn test_round() {
        let e = call("round", vec![literal(Value::Real(2.345)), literal(Value::Real(2.0))]);
        assert_eq!(eval(&e).as_real(), 2.35);

        let e = call("round", vec![literal(Value::Real(-2.5))]);
        assert_eq!(eval(&e).as_real(), -3.0);

        let e = call("round", vec![literal(Value::Real(2.5))]);
        assert_eq!(eval(&e).as_real(), 3.0);
    }

    #[test]
    fn test_string_functions() {
        let s = || literal(Value::Str("hello world".into()));
        assert_eq!(eval(&call("len", vec![s()])).as_int(), 11);
        assert_eq!(
            eval(&call("left", vec![s(), literal(Value::Real(5.0))])).as_str(),
            "hello"
        );
        assert_eq!(
            eval(&call("right", vec![s(), literal(Value::Real(5.0))])).as_str(),
            "world"
        );
        assert_eq!(eval(&call("upper", vec![s()])).as_str(), "HELLO WORLD");
        assert_eq!(
            eval(&call("contains", vec![s(), literal(Value::Str("lo w".into()))])).as_bool(),
            true
        );
        assert_eq!(
            eval(&call("contains", vec![s(), literal(Value::Str("".into()))])).as_bool(),
            false
        );
        assert_eq!(
            eval(&call("find", vec![s(), literal(Value::Str("world".into()))])).as_int(),
            6
        );
        assert_eq!(
            eval(&call("find", vec![s(), literal(Value::Str("zzz".into()))])).as_int(),
            -1
        );
    }

    #[test]
    fn test_comparisons() {
        let e = call("<", vec![literal(Value::Real(1.0)), literal(Value::Real(2.0))]);
        assert!(eval(&e).as_bool());
        let e = call("==", vec![
            literal(Value::Str("a".into())),
            literal(Value::Str("a".into())),
        ]);
        assert!(eval(&e).as_bool());
    }

    #[test]
    fn test_if() {
        let e = call(
            "if",
            vec![
                literal(Value::Bool(true)),
                literal(Value::Real(1.0)),
                literal(Value::Real(2.0)),
            ],
        );
        assert_eq!(eval(&e).as_real(), 1.0);
    }

    #[test]
    fn test_min_max_binary() {
        let e = call("min", vec![literal(Value::Real(3.0)), literal(Value::Real(1.0))]);
        assert_eq!(eval(&e).as_real(), 1.0);
        let e = call("max", vec![
            literal(Value::Str("a".into())),
            literal(Value::Str("b".into())),
        ]);
        assert_eq!(eval(&e).as_str(), "b");
    }

    #[test]
    fn test_neg_string_passthrough() {
        let e = Expr::new();
        e.borrow_mut().set_op(ops::by_opcode(Opcode::Neg));
        e.borrow_mut().args = vec![literal(Value::Str("abc".into()))];
        types::infer(&e);
        assert_eq!(eval(&e).as_str(), "abc");
    }

    #[test]
    fn test_aggregate_roundtrip() {
        let sum = call("sum", vec![literal(Value::Real(0.0))]);
        sum.borrow_mut().aggr_idx = 0;

        let c = ctx();
        c.borrow_mut().pass = PassType::Main;
        let mut aggrs = vec![Aggregate::default()];
        {
            let mut ev = Evaluator::with_aggregates(&c, &mut aggrs);
            for x in [1.0, 2.0, 3.0] {
                sum.borrow_mut().args[0]
                    .borrow_mut()
                    .set_value_and_type(Value::Real(x));
                ev.evaluate(&sum);
            }
        }
        c.borrow_mut().pass = PassType::StoredValues;
        let mut ev = Evaluator::with_aggregates(&c, &mut aggrs);
        assert_eq!(ev.evaluate(&sum).as_real(), 6.0);
    }

    #[test]
    fn test_type_function() {
        let e = call("type", vec![literal(Value::Real(2.0))]);
        assert_eq!(eval(&e).as_str(), "real");
        let e = call("type", vec![literal(Value::Str("x".into()))]);
        assert_eq!(eval(&e).as_str(), "str");
    }

    #[test]
    fn test_str_with_precision() {
        let e = call(
            "str",
            vec![literal(Value::Real(2.0 / 3.0)), literal(Value::Real(3.0))],
        );
        assert_eq!(eval(&e).as_str(), "0.667");
    }

    #[test]
    fn test_attr_lookup_walks_stack() {
        let c = ctx();
        c.borrow_mut()
            .attr_stack
            .push(("id".to_string(), "outer".to_string()));
        c.borrow_mut()
            .attr_stack
            .push(("id".to_string(), "inner".to_string()));

        let e = Expr::new();
        e.borrow_mut().set_op(ops::by_opcode(Opcode::Attr));
        e.borrow_mut().args = vec![literal(Value::Str("a".into())), literal(Value::Str("id".into()))];
        e.borrow_mut().ty = TypeTag::String;

        let ev = Evaluator::new(&c);
        ev.immed_evaluate(&e);
        assert_eq!(e.borrow().value.as_str(), "inner");
    }

    #[test]
    fn test_linenum_immediate() {
        let c = ctx();
        c.borrow_mut().num_lines = 42;
        let e = Expr::new();
        e.borrow_mut().set_op(ops::by_opcode(Opcode::LineNum));
        e.borrow_mut().args = vec![literal(Value::Str("a".into()))];
        e.borrow_mut().ty = TypeTag::Integer;
        let ev = Evaluator::new(&c);
        ev.immed_evaluate(&e);
        assert_eq!(e.borrow().value.as_int(), 42);
    }
}
