//! Per-query mutable parse state, shared by the scanner, matcher, row
//! engine, and evaluator.

use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::engine::rows::Row;

/// The three pass kinds of the plan, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassType {
    NotSet,
    /// Reads input for precomputed facts (jagged pivot names); no output.
    GatherData,
    /// Reads input (again); evaluates, buffers or streams rows.
    Main,
    /// Outputs rows saved for sorting, aggregation, and distinct.
    StoredValues,
}

/// One entry of the open-tag stack.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub name: String,
    pub node_start: usize,
}

#[derive(Debug)]
pub struct Context {
    pub pass: PassType,
    pub appending_values: bool,
    pub num_nodes: usize,
    pub num_lines: usize,
    /// Rows matched, counted before filtering.
    pub num_rows_matched: usize,
    /// Rows output, counted after filtering.
    pub num_rows_output: usize,
    /// Depth of the most recent path match relative to its anchor.
    pub relative_depth: i32,
    /// Structural depth of the current tag.
    pub curr_depth: i32,
    pub node_stack: Vec<NodeInfo>,
    pub attr_count_stack: Vec<usize>,
    pub attr_stack: Vec<(String, String)>,

    // Join cursor for the row currently being committed.
    pub join_table: Option<Rc<Vec<Row>>>,
    pub join_table_row_idx: usize,
    pub empty_outer_join: bool,

    pub case_sensitive: bool,
    cancel: Arc<AtomicBool>,
}

impl Context {
    pub fn new(cancel: Arc<AtomicBool>) -> Self {
        let mut ctx = Context {
            pass: PassType::NotSet,
            appending_values: false,
            num_nodes: 0,
            num_lines: 1,
            num_rows_matched: 0,
            num_rows_output: 0,
            relative_depth: 0,
            curr_depth: 0,
            node_stack: Vec::new(),
            attr_count_stack: Vec::new(),
            attr_stack: Vec::new(),
            join_table: None,
            join_table_row_idx: 0,
            empty_outer_join: false,
            case_sensitive: false,
            cancel,
        };
        ctx.reset(PassType::NotSet);
        ctx
    }

    pub fn reset(&mut self, pass: PassType) {
        self.pass = pass;
        self.appending_values = false;
        self.num_nodes = 0;
        self.num_lines = 1;
        self.num_rows_matched = 0;
        self.num_rows_output = 0;
        self.relative_depth = 0;
        self.curr_depth = 0;
        self.node_stack.clear();
        self.attr_count_stack.clear();
        self.attr_stack.clear();
        self.reset_join_table();
    }

    pub fn set_join_table(&mut self, table: Rc<Vec<Row>>) {
        self.join_table = Some(table);
        self.empty_outer_join = false;
        self.join_table_row_idx = 0;
    }

    pub fn reset_join_table(&mut self) {
        self.join_table = None;
        self.empty_outer_join = false;
        self.join_table_row_idx = 0;
    }

    pub fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_clears_counters() {
        let mut ctx = Context::new(Arc::new(AtomicBool::new(false)));
        ctx.num_nodes = 10;
        ctx.num_lines = 5;
        ctx.node_stack.push(NodeInfo {
            name: "a".into(),
            node_start: 1,
        });
        ctx.reset(PassType::Main);
        assert_eq!(ctx.pass, PassType::Main);
        assert_eq!(ctx.num_nodes, 0);
        assert_eq!(ctx.num_lines, 1);
        assert!(ctx.node_stack.is_empty());
    }

    #[test]
    fn test_cancel_flag_shared() {
        let flag = Arc::new(AtomicBool::new(false));
        let ctx = Context::new(flag.clone());
        assert!(!ctx.cancelled());
        flag.store(true, Ordering::Relaxed);
        assert!(ctx.cancelled());
    }
}
