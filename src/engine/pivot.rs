//! Pivoting: collapse a partition of matched rows into one output row
//! with a column per distinct name.
//!
//! A partition is the contiguous run of matches under one parent node.
//! The partition boundary is learned ("trained") from the structural
//! depth between the first rows, then detected whenever depth falls below
//! the trained level.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::debug;

use crate::engine::context::Context;
use crate::engine::rows::Row;
use crate::error::{Error, Result};
use crate::query::eval::Evaluator;
use crate::query::expr::{arg, col_flags, expr_flags, Column, ColumnHandle, Expr};
use crate::query::ops::{self, Opcode};
use crate::query::spec::QuerySpec;
use crate::value::{TypeTag, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    StartNewPartition,
    Partitioning,
}

/// What `try_pivot` did, and how to undo it when the resulting row is
/// rejected by filters.
pub struct PivotOutcome {
    pivoted: bool,
    new_columns: Vec<ColumnHandle>,
}

impl PivotOutcome {
    pub fn was_pivoted(&self) -> bool {
        self.pivoted
    }
}

pub struct Pivoter {
    ctx: Rc<RefCell<Context>>,
    spec: Rc<RefCell<QuerySpec>>,
    column: Option<ColumnHandle>,
    first_pass: bool,
    collecting_columns: bool,
    training_partition_depth: bool,
    partition_depth: i32,
    state: State,
    jagged: bool,
    spread_idx: Option<usize>,
    names: Vec<String>,
    values: Vec<Value>,
}

impl Pivoter {
    pub fn new(ctx: Rc<RefCell<Context>>, spec: Rc<RefCell<QuerySpec>>) -> Self {
        Pivoter {
            ctx,
            spec,
            column: None,
            first_pass: true,
            collecting_columns: true,
            training_partition_depth: true,
            partition_depth: 0,
            state: State::StartNewPartition,
            jagged: false,
            spread_idx: None,
            names: Vec::new(),
            values: Vec::new(),
        }
    }

    /// Bind the pivot column and its declared output names (which may
    /// include the `...` spread).
    pub fn bind_columns(
        &mut self,
        pivot_column: ColumnHandle,
        column_names: &[String],
    ) -> Result<()> {
        if column_names.is_empty() {
            return Err(Error::parse(
                "Pivot function requires column names, which can include spread (...)",
            ));
        }

        let expr = pivot_column.borrow().expr.clone();
        let names_arg = arg(&expr, 0);
        let values_arg = arg(&expr, 1);
        if names_arg
            .borrow()
            .has_flag(expr_flags::SUBTREE_CONTAINS_AGGREGATE)
        {
            return Err(Error::parse(
                "Pivot names argument must not contain aggregate functions",
            ));
        }
        if values_arg
            .borrow()
            .has_flag(expr_flags::SUBTREE_CONTAINS_AGGREGATE)
        {
            return Err(Error::parse(
                "Pivot values argument must not contain aggregate functions",
            ));
        }
        if names_arg
            .borrow()
            .has_flag(expr_flags::SUBTREE_CONTAINS_JOIN_PATH_REF)
        {
            return Err(Error::parse(
                "Pivot names argument must not contain joined paths",
            ));
        }
        if values_arg
            .borrow()
            .has_flag(expr_flags::SUBTREE_CONTAINS_JOIN_PATH_REF)
        {
            return Err(Error::parse(
                "Pivot values argument must not contain joined paths",
            ));
        }

        self.spread_idx = None;
        let mut next_column_idx = pivot_column.borrow().index;
        for name in column_names {
            if name == "..." {
                self.spread_idx = Some(next_column_idx);
            } else {
                let column = self.insert_new_column(name, Some(next_column_idx));
                next_column_idx = column.borrow().index + 1;
            }
        }

        self.jagged = expr.borrow().args.len() == 3 && {
            let third = arg(&expr, 2);
            let b = third.borrow();
            b.ty == TypeTag::Boolean && b.value.as_bool()
        };
        self.column = Some(pivot_column);
        Ok(())
    }

    pub fn enabled(&self) -> bool {
        self.column.is_some()
    }

    /// Jagged pivots need a prepass to discover column names across
    /// partitions.
    pub fn require_prepass(&self) -> bool {
        self.enabled() && self.jagged
    }

    pub fn reset(&mut self) {
        if self.enabled() {
            self.state = State::StartNewPartition;
            self.collecting_columns = self.first_pass;
            self.first_pass = false;
        }
    }

    pub fn partition_size(&self) -> usize {
        debug_assert_eq!(self.names.len(), self.values.len());
        self.names.len()
    }

    /// Record the pivot name/value pair for the current match.
    pub fn accumulate_row(&mut self, evaluator: &mut Evaluator<'_>) {
        debug_assert!(self.enabled());

        if self.state == State::StartNewPartition && self.training_partition_depth {
            self.partition_depth = self.ctx.borrow().curr_depth;
        }
        self.state = State::Partitioning;

        let expr = self.column.as_ref().expect("pivot bound").borrow().expr.clone();
        let name = evaluator.evaluate(&arg(&expr, 0)).as_str();
        let value = evaluator.evaluate(&arg(&expr, 1));
        self.names.push(name);
        self.values.push(value);
    }

    /// At a partition boundary, collapse the accumulated pairs into the
    /// pivot-result columns and trim the partition's staging rows.
    pub fn try_pivot(&mut self, rows: &mut Vec<Row>) -> PivotOutcome {
        let mut outcome = PivotOutcome {
            pivoted: false,
            new_columns: Vec::new(),
        };

        if !self.enabled() || !self.is_at_end_of_partition() {
            return outcome;
        }

        // Clear previous values on existing pivot columns.
        {
            let spec = self.spec.borrow();
            for column in &spec.columns {
                if column.borrow().is_pivot_result() {
                    column
                        .borrow()
                        .expr
                        .borrow_mut()
                        .set_value_and_type(Value::empty_string());
                }
            }
        }

        let partition_size = self.partition_size();
        debug_assert!(partition_size <= rows.len());
        let first_row_idx = rows.len() - partition_size;
        for idx in 0..partition_size {
            let col_name = self.names[idx].clone();
            let mut column = self.spec.borrow().get_column(&col_name);
            if column.is_none() && self.collecting_columns {
                if let Some(spread) = self.spread_idx {
                    let new_column = self.insert_new_column(&col_name, Some(spread));
                    debug!(column = %col_name, "pivot discovered column");
                    outcome.new_columns.push(new_column.clone());
                    self.spread_idx = Some(spread + 1);
                    column = Some(new_column);
                }
            }
            if let Some(column) = column {
                column.borrow_mut().flags |= col_flags::PIVOT_RESULT_REFERENCED;
                // The row engine transfers this value into the stored row.
                column
                    .borrow()
                    .expr
                    .borrow_mut()
                    .set_value_and_type(self.values[idx].clone());
            }
        }

        self.names.clear();
        self.values.clear();

        if !outcome.new_columns.is_empty() {
            // Row width changed; restage a fresh row of the new size.
            rows.truncate(first_row_idx);
            rows.push(vec![Value::Unknown; self.spec.borrow().row_size()]);
        } else {
            // Keep the first partition row for recycling.
            rows.truncate(first_row_idx + 1);
        }

        outcome.pivoted = true;
        outcome
    }

    /// The pivoted row passed filtering; newly discovered columns stay.
    pub fn accept(&mut self) {
        debug_assert!(self.enabled());
        if !self.jagged {
            self.collecting_columns = false;
        }
    }

    /// The pivoted row was filtered out; roll back columns that were just
    /// added. Returns true when the staged row can be recycled.
    pub fn reject(&mut self, outcome: &PivotOutcome) -> bool {
        debug_assert!(self.enabled());
        for column in &outcome.new_columns {
            self.spec.borrow_mut().delete_column(column);
            if let Some(spread) = self.spread_idx {
                debug_assert!(spread > 0);
                self.spread_idx = Some(spread - 1);
            }
        }
        outcome.new_columns.is_empty()
    }

    /// Fatal if a declared pivot column name never appeared in the input.
    pub fn check_unreferenced(&self) -> Result<()> {
        let spec = self.spec.borrow();
        let mut missing = Vec::new();
        for column in &spec.columns {
            let col = column.borrow();
            if col.is_pivot_result() && !col.has_flag(col_flags::PIVOT_RESULT_REFERENCED) {
                missing.push(col.name.clone());
            }
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::lookup(format!(
                "Pivot columns not found in input: {}",
                missing.join(", ")
            )))
        }
    }

    fn is_at_end_of_partition(&mut self) -> bool {
        let curr_depth = self.ctx.borrow().curr_depth;
        if self.enabled() && self.state == State::Partitioning {
            // Train the depth between the first and second rows, letting
            // it dip so the encapsulating group's depth is inferred.
            if self.partition_size() >= 2 || curr_depth == 0 {
                self.training_partition_depth = false;
            }
            if self.training_partition_depth {
                self.partition_depth = curr_depth.min(self.partition_depth);
                return false;
            }
            if curr_depth < self.partition_depth {
                self.state = State::StartNewPartition;
                return true;
            }
        }
        false
    }

    fn insert_new_column(&self, col_name: &str, idx: Option<usize>) -> ColumnHandle {
        let expr = Expr::new();
        expr.borrow_mut().set_op(ops::by_opcode(Opcode::Literal));
        expr.borrow_mut().ty = TypeTag::String;
        expr.borrow_mut().value = Value::empty_string();
        let column = Column::new(col_name, expr, col_flags::OUTPUT | col_flags::PIVOT_RESULT);
        self.spec.borrow_mut().insert_column(column.clone(), idx);
        column
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::parser::parse_query;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn make_pivoter(args: &[&str]) -> (Pivoter, Rc<RefCell<Context>>) {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        let parsed = parse_query(&args).expect("parse");
        let ctx = Rc::new(RefCell::new(Context::new(Arc::new(AtomicBool::new(false)))));
        let mut pivoter = Pivoter::new(ctx.clone(), parsed.spec.clone());
        let (column, names) = parsed.pivot_binding.expect("pivot");
        pivoter.bind_columns(column, &names).expect("bind");
        (pivoter, ctx)
    }

    #[test]
    fn test_bind_declares_columns() {
        let (pivoter, _ctx) = make_pivoter(&["a,b:pivot[n,v]", "k"]);
        assert!(pivoter.enabled());
        assert!(!pivoter.require_prepass());
        let spec = pivoter.spec.borrow();
        assert!(spec.get_column("a").is_some());
        assert!(spec.get_column("b").is_some());
        assert!(spec.get_column("a").unwrap().borrow().is_pivot_result());
    }

    #[test]
    fn test_jagged_needs_prepass() {
        let (pivoter, _ctx) = make_pivoter(&["...:pivot[n,v,true]", "k"]);
        assert!(pivoter.require_prepass());
    }

    #[test]
    fn test_unreferenced_columns_fatal() {
        let (pivoter, _ctx) = make_pivoter(&["a:pivot[n,v]", "k"]);
        let err = pivoter.check_unreferenced().unwrap_err();
        assert!(err.message().contains("Pivot columns not found"));
    }

    #[test]
    fn test_pivot_collapses_partition() {
        let (mut pivoter, ctx) = make_pivoter(&["a,b:pivot[n,v]", "k"]);
        let spec = pivoter.spec.clone();

        // Two name/value pairs accumulate at depth 2, then depth drops.
        {
            let n = spec.borrow().input.path_refs.get("n").unwrap().clone();
            let v = spec.borrow().input.path_refs.get("v").unwrap().clone();
            ctx.borrow_mut().curr_depth = 2;

            n.borrow_mut().value = Value::Str("a".into());
            v.borrow_mut().value = Value::Str("1".into());
            let mut ev = Evaluator::new(&ctx);
            pivoter.accumulate_row(&mut ev);

            n.borrow_mut().value = Value::Str("b".into());
            v.borrow_mut().value = Value::Str("2".into());
            let mut ev = Evaluator::new(&ctx);
            pivoter.accumulate_row(&mut ev);
        }

        let row_size = spec.borrow().row_size();
        let mut rows: Vec<Row> = vec![vec![Value::Unknown; row_size]; 2];
        ctx.borrow_mut().curr_depth = 1;
        let outcome = pivoter.try_pivot(&mut rows);
        assert!(outcome.was_pivoted());
        assert_eq!(rows.len(), 1);

        let a = spec.borrow().get_column("a").unwrap();
        assert_eq!(a.borrow().expr.borrow().value.as_str(), "1");
        let b = spec.borrow().get_column("b").unwrap();
        assert_eq!(b.borrow().expr.borrow().value.as_str(), "2");
        assert!(pivoter.check_unreferenced().is_ok());
    }

    #[test]
    fn test_spread_discovers_columns() {
        let (mut pivoter, ctx) = make_pivoter(&["...:pivot[n,v]", "k"]);
        let spec = pivoter.spec.clone();
        {
            let n = spec.borrow().input.path_refs.get("n").unwrap().clone();
            let v = spec.borrow().input.path_refs.get("v").unwrap().clone();
            ctx.borrow_mut().curr_depth = 2;
            n.borrow_mut().value = Value::Str("discovered".into());
            v.borrow_mut().value = Value::Str("42".into());
            let mut ev = Evaluator::new(&ctx);
            pivoter.accumulate_row(&mut ev);
        }
        // Partition of one: training needs the depth to drop to zero.
        let mut rows: Vec<Row> = vec![vec![Value::Unknown; spec.borrow().row_size()]];
        ctx.borrow_mut().curr_depth = 0;
        let outcome = pivoter.try_pivot(&mut rows);
        assert!(outcome.was_pivoted());
        assert!(spec.borrow().get_column("discovered").is_some());

        // Rejecting rolls the discovered column back.
        assert!(!pivoter.reject(&outcome));
        assert!(spec.borrow().get_column("discovered").is_none());
    }
}
