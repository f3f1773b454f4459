//! The row engine: allocates rows, probes the join index, filters,
//! deduplicates, aggregates, sorts, and hands finished rows to the output
//! callback.

use std::cell::RefCell;
use std::rc::Rc;

use indexmap::IndexMap;
use tracing::debug;

use crate::engine::context::{Context, PassType};
use crate::engine::pivot::Pivoter;
use crate::engine::rows::{hash_values, IndexedRows, Row, RowKey};
use crate::query::aggregate::Aggregate;
use crate::query::eval::Evaluator;
use crate::query::expr::expr_flags;
use crate::query::spec::{spec_flags, QuerySpec};
use crate::value::Value;

/// Called once per output row with the row values and its repeat count.
pub type RowCallback<'a> = Box<dyn FnMut(&[Value], usize) + 'a>;

mod engine_flags {
    pub const STORE_ROWS: u32 = 0x2;
    pub const INVOKE_ROW_CALLBACK: u32 = 0x4;
    pub const PARSE_STOPPED: u32 = 0x8;
    pub const RECYCLE_STORAGE: u32 = 0x10;
}

pub struct RowEngine<'a> {
    flags: u32,
    ctx: Rc<RefCell<Context>>,
    spec: Rc<RefCell<QuerySpec>>,
    pub pivoter: Pivoter,
    row_callback: Option<RowCallback<'a>>,

    /// Staging and sequential storage; holds one recycled row when
    /// streaming or deduplicating, or every accepted row otherwise.
    seq_rows: Vec<Row>,
    /// Deduplicated storage for the distinct/aggregate cases.
    stored_rows: Vec<Row>,
    /// Dedupe registry: output-value prefix -> index into `row_refs`.
    distinct_rows: IndexMap<RowKey, usize>,
    /// Sortable view; `(row index, repeat count)`.
    row_refs: Vec<(usize, usize)>,
    aggregates: Vec<Vec<Aggregate>>,
    indexed_join: IndexedRows,
    join_key: Vec<Value>,
}

impl<'a> RowEngine<'a> {
    pub fn new(ctx: Rc<RefCell<Context>>, spec: Rc<RefCell<QuerySpec>>) -> Self {
        let pivoter = Pivoter::new(ctx.clone(), spec.clone());
        RowEngine {
            flags: 0,
            ctx,
            spec,
            pivoter,
            row_callback: None,
            seq_rows: Vec::new(),
            stored_rows: Vec::new(),
            distinct_rows: IndexMap::new(),
            row_refs: Vec::new(),
            aggregates: Vec::new(),
            indexed_join: IndexedRows::new(),
            join_key: Vec::new(),
        }
    }

    pub fn set_flag(&mut self, flag: u32, set: bool) {
        if set {
            self.flags |= flag;
        } else {
            self.flags &= !flag;
        }
    }

    fn is_flag_set(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    pub fn parse_stopped(&self) -> bool {
        self.is_flag_set(engine_flags::PARSE_STOPPED)
    }

    pub fn stop_parse(&mut self) {
        self.flags |= engine_flags::PARSE_STOPPED;
    }

    pub fn set_row_callback(&mut self, callback: RowCallback<'a>) {
        self.row_callback = Some(callback);
    }

    pub fn set_indexed_join(&mut self, indexed_join: IndexedRows) {
        self.indexed_join = indexed_join;
    }

    pub fn reset(&mut self, pass: PassType, last_pass: PassType) {
        self.set_flag(engine_flags::PARSE_STOPPED, false);

        let streaming = self.spec.borrow().streaming();
        if pass == PassType::Main {
            self.set_flag(engine_flags::STORE_ROWS, !streaming);
        } else {
            self.set_flag(engine_flags::STORE_ROWS, pass == PassType::StoredValues);
        }
        self.set_flag(engine_flags::INVOKE_ROW_CALLBACK, pass == last_pass);

        self.pivoter.reset();
        if pass == PassType::Main {
            self.seq_rows.clear();
            self.stored_rows.clear();
            self.row_refs.clear();
            self.aggregates.clear();
            self.distinct_rows.clear();
        }
        self.remove_recycled_row();
    }

    pub fn check_unreferenced(&self) -> crate::error::Result<()> {
        self.pivoter.check_unreferenced()
    }

    fn streaming(&self) -> bool {
        self.spec.borrow().streaming()
    }

    fn distinct(&self) -> bool {
        self.spec.borrow().distinct()
    }

    fn aggregated(&self) -> bool {
        self.spec.borrow().aggregated()
    }

    fn needs_sorting(&self) -> bool {
        self.spec.borrow().needs_sorting()
    }

    fn row_storage(&self, ref_idx: usize) -> &Row {
        let row_idx = self.row_refs[ref_idx].0;
        if self.distinct() {
            &self.stored_rows[row_idx]
        } else {
            &self.seq_rows[row_idx]
        }
    }

    /// Pivot partitions are committed when structural depth closes them.
    pub fn on_end_tag(&mut self) {
        if !self.pivoter.enabled() {
            return;
        }
        let outcome = self.pivoter.try_pivot(&mut self.seq_rows);
        if outcome.was_pivoted() {
            let row_idx = self.seq_rows.len() - 1;
            if self.join_and_commit_row(row_idx) {
                self.pivoter.accept();
            } else if self.pivoter.reject(&outcome) {
                self.set_flag(engine_flags::RECYCLE_STORAGE, true);
                self.remove_recycled_row();
            }
        }
    }

    /// A complete path match: either accumulate into the pivot partition
    /// or evaluate/commit a row now.
    pub fn emit_row(&mut self) {
        if self.pivoter.enabled() {
            self.alloc_row(self.pivoter.partition_size());
            let mut evaluator = Evaluator::new(&self.ctx);
            self.pivoter.accumulate_row(&mut evaluator);
        } else {
            self.alloc_row(0);
            let row_idx = self.seq_rows.len() - 1;
            if !self.join_and_commit_row(row_idx) {
                self.set_flag(engine_flags::RECYCLE_STORAGE, true);
                self.remove_recycled_row();
            }
        }
    }

    fn alloc_row(&mut self, curr_partition_size: usize) {
        // Streaming and distinct recycle a single build row; the stored
        // non-distinct cases keep every row. Pivot partitions always stage
        // additional rows.
        let keep_all_rows = !self.distinct() && !self.streaming();

        if (keep_all_rows && !self.is_flag_set(engine_flags::RECYCLE_STORAGE))
            || curr_partition_size > 0
            || self.seq_rows.is_empty()
        {
            let size = self.spec.borrow().row_size();
            self.seq_rows.push(vec![Value::Unknown; size]);
        }
        self.set_flag(engine_flags::RECYCLE_STORAGE, !keep_all_rows);
    }

    fn remove_recycled_row(&mut self) {
        if self.is_flag_set(engine_flags::RECYCLE_STORAGE) && !self.seq_rows.is_empty() {
            self.seq_rows.pop();
        }
        self.set_flag(engine_flags::RECYCLE_STORAGE, false);
    }

    /// Returns false when every join candidate was filtered out.
    fn join_and_commit_row(&mut self, row_idx: usize) -> bool {
        let mut committed = false;

        let left_side_of_join = self.spec.borrow().is_flag_set(spec_flags::LEFT_SIDE_OF_JOIN);
        if left_side_of_join {
            // Hash the equality-key expressions and look up the bucket.
            let equality_exprs = self.spec.borrow().join.equality_exprs.clone();
            self.join_key.clear();
            {
                let mut evaluator = Evaluator::new(&self.ctx);
                for expr in &equality_exprs {
                    self.join_key.push(evaluator.evaluate(expr));
                }
            }
            let index = hash_values(&self.join_key);
            match self.indexed_join.get(&index) {
                Some(bucket) => {
                    self.ctx.borrow_mut().set_join_table(bucket.clone());
                }
                None => {
                    if self.spec.borrow().join.outer {
                        self.ctx.borrow_mut().empty_outer_join = true;
                    } else {
                        return false; // no rows meet the equality constraints
                    }
                }
            }
        }

        loop {
            {
                let ctx = self.ctx.borrow();
                if left_side_of_join {
                    if let Some(table) = &ctx.join_table {
                        if ctx.join_table_row_idx == table.len() {
                            break; // join candidates exhausted
                        }
                    }
                }
            }

            if self.check_first_n_rows_condition() {
                self.stop_parse();
                break;
            }

            self.evaluate_non_aggregate_and_sort_values(row_idx);

            if self.test_filters_on_non_aggregate_columns() {
                committed = true;
                if !self.store_row(row_idx) {
                    if self.check_top_n_rows_condition() {
                        self.stop_parse();
                    } else if self.streaming()
                        && self.is_flag_set(engine_flags::INVOKE_ROW_CALLBACK)
                    {
                        if let Some(callback) = &mut self.row_callback {
                            callback(&self.seq_rows[row_idx], 1);
                        }
                    }
                }
            }

            let empty_outer = self.ctx.borrow().empty_outer_join;
            if !left_side_of_join || empty_outer {
                break;
            }
            self.ctx.borrow_mut().join_table_row_idx += 1;
        }

        self.ctx.borrow_mut().reset_join_table();
        committed
    }

    fn evaluate_non_aggregate_and_sort_values(&mut self, row_idx: usize) {
        let columns = self.spec.borrow().columns.clone();
        let sort_column = self.spec.borrow().sort_column.clone();
        let num_value_columns = self.spec.borrow().num_value_columns();

        let mut evaluator = Evaluator::new(&self.ctx);
        for column in &columns {
            let is_sort = sort_column
                .as_ref()
                .is_some_and(|s| Rc::ptr_eq(s, column));
            if is_sort {
                // Non-aggregate sort keys go after the output values; the
                // aggregate keys are evaluated when it's time to sort.
                let sort_expr = column.borrow().expr.clone();
                let mut value_idx = num_value_columns;
                for i in 0..sort_expr.borrow().args.len() {
                    let key_expr = sort_expr.borrow().args[i].clone();
                    let has_aggr = key_expr
                        .borrow()
                        .has_flag(expr_flags::SUBTREE_CONTAINS_AGGREGATE);
                    if !has_aggr {
                        self.seq_rows[row_idx][value_idx] = evaluator.evaluate(&key_expr);
                    }
                    value_idx += 1;
                }
            } else {
                let col = column.borrow();
                if col.is_pivot_result() && col.is_output() {
                    // The pivoter wrote the value into the column expression.
                    let value_idx = col.value_idx.expect("output column has slot");
                    self.seq_rows[row_idx][value_idx] = col.expr.borrow().value.clone();
                } else if !col.is_aggregate() && col.is_output() {
                    let value_idx = col.value_idx.expect("output column has slot");
                    let expr = col.expr.clone();
                    drop(col);
                    self.seq_rows[row_idx][value_idx] = evaluator.evaluate(&expr);
                }
            }
        }
    }

    /// Filters on aggregate columns run later, on stored rows.
    fn test_filters_on_non_aggregate_columns(&mut self) -> bool {
        let columns = self.spec.borrow().columns.clone();
        let empty_outer = self.ctx.borrow().empty_outer_join;
        let mut evaluator = Evaluator::new(&self.ctx);
        for column in &columns {
            let col = column.borrow();
            if col.is_aggregate() || !col.is_filter() {
                continue;
            }
            let expr = col.expr.clone();
            drop(col);
            if empty_outer
                && expr.borrow().has_flag(expr_flags::JOIN_EQUALITY_WHERE)
            {
                // Outer joins producing empty join values pass their
                // equality filters.
                continue;
            }
            if !evaluator.evaluate(&expr).as_bool() {
                return false;
            }
        }
        true
    }

    /// Returns false for non-batched (immediate output) storage.
    fn store_row(&mut self, row_idx: usize) -> bool {
        if !self.distinct() && !self.needs_sorting() {
            self.ctx.borrow_mut().num_rows_output += 1;
            return false;
        }

        let num_value_columns = self.spec.borrow().num_value_columns();
        let key = RowKey(self.seq_rows[row_idx][..num_value_columns].to_vec());

        let stored_idx = match self.distinct_rows.get(&key) {
            Some(&ref_idx) => {
                self.row_refs[ref_idx].1 += 1;
                ref_idx
            }
            None => {
                let ref_idx = self.row_refs.len();
                if self.distinct() {
                    self.stored_rows.push(self.seq_rows[row_idx].clone());
                    self.row_refs.push((self.stored_rows.len() - 1, 1));
                } else {
                    self.row_refs.push((row_idx, 1));
                }
                self.distinct_rows.insert(key, ref_idx);
                if self.aggregated() {
                    let count = self.spec.borrow().aggr_count;
                    self.aggregates.push(vec![Aggregate::default(); count]);
                }
                self.ctx.borrow_mut().num_rows_output += 1;
                ref_idx
            }
        };

        if self.aggregated() {
            let columns = self.spec.borrow().columns.clone();
            let aggrs = &mut self.aggregates[stored_idx];
            let mut evaluator = Evaluator::with_aggregates(&self.ctx, aggrs);
            for column in &columns {
                if column.borrow().is_aggregate() {
                    let expr = column.borrow().expr.clone();
                    evaluator.evaluate(&expr);
                }
            }
        }

        true
    }

    /// The stored-values pass: project aggregates, sort, truncate, emit.
    pub fn output_stored_rows(&mut self) {
        debug_assert!(self.is_flag_set(engine_flags::STORE_ROWS));

        let mut aggregate_filters = Vec::new();
        if self.aggregated() {
            debug_assert!(self.distinct());
            let mut max_rows = self.row_refs.len();
            let (top_n_set, top_n) = {
                let spec = self.spec.borrow();
                (spec.is_flag_set(spec_flags::TOP_N_ROWS), spec.top_n_rows)
            };
            if !self.needs_sorting() && top_n_set {
                max_rows = max_rows.min(top_n);
            }
            let columns = self.spec.borrow().columns.clone();
            for ref_idx in 0..max_rows {
                let row_idx = self.row_refs[ref_idx].0;
                let mut evaluator =
                    Evaluator::with_aggregates(&self.ctx, &mut self.aggregates[ref_idx]);
                for column in &columns {
                    let col = column.borrow();
                    if col.is_aggregate() {
                        let value_idx = col.value_idx.expect("aggregate column has slot");
                        let expr = col.expr.clone();
                        drop(col);
                        self.stored_rows[row_idx][value_idx] = evaluator.evaluate(&expr);
                    } else if col.is_output() {
                        // Refresh cached column values so per-row column
                        // references resolve against this row.
                        let value_idx = col.value_idx.expect("output column has slot");
                        col.expr
                            .borrow_mut()
                            .set_value(self.stored_rows[row_idx][value_idx].clone());
                    }
                }
            }
            for column in &columns {
                let col = column.borrow();
                if col.is_aggregate() && col.is_filter() {
                    aggregate_filters.push(column.clone());
                }
            }
        } else if !self.distinct() {
            // Sequentially stored rows; build the sortable view now that
            // the storage is stable.
            self.row_refs = (0..self.seq_rows.len()).map(|i| (i, 1)).collect();
        }

        if self.needs_sorting() {
            self.sort_rows();
        }

        let mut max_rows = self.row_refs.len();
        {
            let spec = self.spec.borrow();
            if spec.is_flag_set(spec_flags::TOP_N_ROWS) {
                max_rows = max_rows.min(spec.top_n_rows);
            }
        }
        debug!(rows = max_rows, "emitting stored rows");
        for ref_idx in 0..max_rows {
            let mut output_row = true;
            for column in &aggregate_filters {
                let value_idx = column.borrow().value_idx.expect("filter slot");
                output_row &= self.row_storage(ref_idx)[value_idx].as_bool();
            }
            if output_row {
                let repeat = self.row_repeat_count(ref_idx);
                if let Some(callback) = &mut self.row_callback {
                    let row_idx = self.row_refs[ref_idx].0;
                    let row = if self.spec.borrow().distinct() {
                        &self.stored_rows[row_idx]
                    } else {
                        &self.seq_rows[row_idx]
                    };
                    callback(row, repeat);
                }
            }
        }
    }

    fn row_repeat_count(&self, ref_idx: usize) -> usize {
        if self.streaming() || self.distinct() {
            return 1;
        }
        self.row_refs[ref_idx].1
    }

    fn sort_rows(&mut self) {
        debug_assert!(self.needs_sorting());

        let sort_column = self.spec.borrow().sort_column.clone().expect("sort column");
        let sort_expr = sort_column.borrow().expr.clone();

        if self.aggregated() {
            // Evaluate the aggregate sort keys into the row tails.
            let num_value_columns = self.spec.borrow().num_value_columns();
            for ref_idx in 0..self.row_refs.len() {
                let row_idx = self.row_refs[ref_idx].0;
                let mut evaluator =
                    Evaluator::with_aggregates(&self.ctx, &mut self.aggregates[ref_idx]);
                let mut value_idx = num_value_columns;
                for i in 0..sort_expr.borrow().args.len() {
                    let key_expr = sort_expr.borrow().args[i].clone();
                    let has_aggr = key_expr
                        .borrow()
                        .has_flag(expr_flags::SUBTREE_CONTAINS_AGGREGATE);
                    if has_aggr {
                        self.stored_rows[row_idx][value_idx] = evaluator.evaluate(&key_expr);
                    }
                    value_idx += 1;
                }
            }
        }

        let first_sort_value = self.spec.borrow().num_value_columns();
        let num_sort_values = self.spec.borrow().num_sort_values();
        let reversed = self.spec.borrow().reversed_string_sorts.clone();
        let distinct = self.distinct();
        let stored_rows = &self.stored_rows;
        let seq_rows = &self.seq_rows;

        self.row_refs.sort_by(|left, right| {
            let (lrow, rrow) = if distinct {
                (&stored_rows[left.0], &stored_rows[right.0])
            } else {
                (&seq_rows[left.0], &seq_rows[right.0])
            };
            for i in 0..num_sort_values {
                let cmp = Value::compare(
                    &lrow[first_sort_value + i],
                    &rrow[first_sort_value + i],
                );
                if cmp != std::cmp::Ordering::Equal {
                    // A reversed string key flips the direction.
                    return if reversed.get(i).copied().unwrap_or(false) {
                        cmp.reverse()
                    } else {
                        cmp
                    };
                }
            }
            std::cmp::Ordering::Equal
        });
    }

    fn check_first_n_rows_condition(&mut self) -> bool {
        self.ctx.borrow_mut().num_rows_matched += 1;
        let spec = self.spec.borrow();
        spec.is_flag_set(spec_flags::FIRST_N_ROWS)
            && self.ctx.borrow().num_rows_matched > spec.first_n_rows
    }

    fn check_top_n_rows_condition(&self) -> bool {
        if self.needs_sorting() {
            return false;
        }
        let spec = self.spec.borrow();
        spec.is_flag_set(spec_flags::TOP_N_ROWS)
            && self.ctx.borrow().num_rows_output > spec.top_n_rows
    }
}
