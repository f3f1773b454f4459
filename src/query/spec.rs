//! The parsed, type-inferred, validated query plan.

use indexmap::IndexMap;

use crate::query::expr::{col_flags, ColumnHandle, ExprRef, PathRefHandle};

/// Query-level flags.
pub mod spec_flags {
    pub const LINE_NUM_USED: u32 = 0x1;
    pub const GATHER_DATA_PASS_REQUIRED: u32 = 0x2;
    pub const NODE_STACK_REQUIRED: u32 = 0x4;
    pub const AGGREGATES_EXIST: u32 = 0x8;
    pub const SHOW_USAGE: u32 = 0x10;
    pub const DISTINCT_USED: u32 = 0x20;
    pub const FIRST_N_ROWS: u32 = 0x40;
    pub const TOP_N_ROWS: u32 = 0x80;
    pub const ATTRIBUTES_USED: u32 = 0x100;
    pub const HAS_PIVOT: u32 = 0x200;
    pub const LEFT_SIDE_OF_JOIN: u32 = 0x400;
    pub const RIGHT_SIDE_OF_JOIN: u32 = 0x800;
    pub const COLUMNS_ADDED: u32 = 0x1000;
}

pub type PathRefs = IndexMap<String, PathRefHandle>;

/// Main-input configuration.
#[derive(Debug)]
pub struct InputSpec {
    pub header: bool,
    pub filename: String,
    /// Default scope name for the input; overridden by `name:in[..]`.
    pub scope_name: String,
    pub path_refs: PathRefs,
}

impl Default for InputSpec {
    fn default() -> Self {
        InputSpec {
            header: true,
            filename: String::new(),
            scope_name: "left".to_string(),
            path_refs: PathRefs::new(),
        }
    }
}

#[derive(Debug)]
pub struct OutputSpec {
    pub header: bool,
}

impl Default for OutputSpec {
    fn default() -> Self {
        OutputSpec { header: true }
    }
}

/// Join configuration recorded on behalf of the left-hand side. The
/// right-hand side gets its own `QuerySpec` built from these pieces via
/// [`QuerySpec::add_join_columns`].
#[derive(Debug, Default)]
pub struct JoinSpec {
    /// Flags propagated to the right-side spec.
    pub flags: u32,
    pub header: bool,
    pub outer: bool,
    pub filename: String,
    pub scope_name: String,
    pub columns: Vec<ColumnHandle>,
    pub path_refs: PathRefs,
    /// Left-side expressions computing the join equality key, parallel to
    /// the Indexed join columns.
    pub equality_exprs: Vec<ExprRef>,
}

impl JoinSpec {
    pub fn new() -> Self {
        JoinSpec {
            header: true,
            scope_name: "right".to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug)]
pub struct QuerySpec {
    pub flags: u32,
    pub input: InputSpec,
    pub output: OutputSpec,
    pub join: JoinSpec,
    pub columns: Vec<ColumnHandle>,
    col_map: IndexMap<String, ColumnHandle>,
    pub sort_column: Option<ColumnHandle>,
    pub reversed_string_sorts: Vec<bool>,
    pub pivot_column: Option<ColumnHandle>,
    pub root_node_num: usize,
    pub first_n_rows: usize,
    pub top_n_rows: usize,
    pub aggr_count: usize,
    num_value_columns: usize,
    pub case_sensitive: bool,
}

impl QuerySpec {
    pub fn new() -> Self {
        QuerySpec {
            flags: 0,
            input: InputSpec::default(),
            output: OutputSpec::default(),
            join: JoinSpec::new(),
            columns: Vec::new(),
            col_map: IndexMap::new(),
            sort_column: None,
            reversed_string_sorts: Vec::new(),
            pivot_column: None,
            root_node_num: 0,
            first_n_rows: 0,
            top_n_rows: 0,
            aggr_count: 0,
            num_value_columns: 0,
            case_sensitive: false,
        }
    }

    pub fn is_flag_set(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    pub fn get_column(&self, name: &str) -> Option<ColumnHandle> {
        self.col_map.get(&name.to_ascii_lowercase()).cloned()
    }

    pub fn get_column_index(&self, name: &str) -> Option<usize> {
        self.get_column(name).map(|c| c.borrow().index)
    }

    pub fn num_value_columns(&self) -> usize {
        self.num_value_columns
    }

    pub fn num_sort_values(&self) -> usize {
        self.sort_column
            .as_ref()
            .map(|c| c.borrow().expr.borrow().args.len())
            .unwrap_or(0)
    }

    /// Output-and-aggregate slots plus sort-key slots at the tail.
    pub fn row_size(&self) -> usize {
        self.num_value_columns + self.num_sort_values()
    }

    /// Insert at `idx` (append when `None`); reassigns all indices.
    pub fn insert_column(&mut self, column: ColumnHandle, idx: Option<usize>) -> usize {
        let idx = idx.unwrap_or(self.columns.len());
        debug_assert!(self.get_column(&column.borrow().name).is_none());
        let key = column.borrow().name.to_ascii_lowercase();
        self.columns.insert(idx, column.clone());
        self.col_map.insert(key, column);
        self.update_column_indices();
        idx
    }

    /// Remove a column (pivot rollback).
    pub fn delete_column(&mut self, column: &ColumnHandle) {
        let idx = column.borrow().index;
        if idx >= self.columns.len() {
            return;
        }
        self.columns.remove(idx);
        let key = column.borrow().name.to_ascii_lowercase();
        self.col_map.shift_remove(&key);
        self.update_column_indices();
    }

    pub fn update_column_indices(&mut self) {
        self.num_value_columns = 0;
        let mut value_idx = 0;
        for (idx, column) in self.columns.iter().enumerate() {
            let mut col = column.borrow_mut();
            col.index = idx;
            if col.is_output() || col.is_aggregate() {
                col.value_idx = Some(value_idx);
                value_idx += 1;
                self.num_value_columns += 1;
            } else {
                col.value_idx = None;
            }
        }
    }

    /// Streaming queries need no row buffering.
    pub fn streaming(&self) -> bool {
        !self.distinct() && !self.needs_sorting() && !self.aggregated()
    }

    pub fn aggregated(&self) -> bool {
        self.is_flag_set(spec_flags::AGGREGATES_EXIST)
    }

    /// Aggregation implies distinct storage: rows group by their output
    /// prefix.
    pub fn distinct(&self) -> bool {
        self.is_flag_set(spec_flags::DISTINCT_USED) || self.aggregated()
    }

    pub fn needs_sorting(&self) -> bool {
        self.sort_column.is_some() && self.num_value_columns > 0
    }

    /// Columns carrying the Indexed flag, in index order; the join table is
    /// hashed on these.
    pub fn indexed_join_columns(&self) -> Vec<usize> {
        let mut indices = Vec::new();
        for column in &self.join.columns {
            let col = column.borrow();
            if col.has_flag(col_flags::INDEXED) {
                indices.push(col.index);
            }
        }
        indices
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::expr::{Column, Expr};

    #[test]
    fn test_insert_and_lookup_case_folded() {
        let mut spec = QuerySpec::new();
        let col = Column::new("Customer Name", Expr::new(), col_flags::OUTPUT);
        spec.insert_column(col, None);
        assert!(spec.get_column("customer name").is_some());
        assert_eq!(spec.get_column_index("CUSTOMER NAME"), Some(0));
        assert_eq!(spec.num_value_columns(), 1);
    }

    #[test]
    fn test_value_indices_skip_directives() {
        let mut spec = QuerySpec::new();
        spec.insert_column(Column::new("a", Expr::new(), col_flags::OUTPUT), None);
        spec.insert_column(Column::new("w", Expr::new(), col_flags::FILTER), None);
        spec.insert_column(Column::new("b", Expr::new(), col_flags::OUTPUT), None);
        assert_eq!(spec.num_value_columns(), 2);
        assert_eq!(spec.get_column("w").unwrap().borrow().value_idx, None);
        assert_eq!(spec.get_column("b").unwrap().borrow().value_idx, Some(1));
    }

    #[test]
    fn test_insert_at_index_reorders() {
        let mut spec = QuerySpec::new();
        spec.insert_column(Column::new("a", Expr::new(), col_flags::OUTPUT), None);
        spec.insert_column(Column::new("c", Expr::new(), col_flags::OUTPUT), None);
        spec.insert_column(Column::new("b", Expr::new(), col_flags::OUTPUT), Some(1));
        let names: Vec<String> = spec.columns.iter().map(|c| c.borrow().name.clone()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(spec.get_column_index("c"), Some(2));
    }

    #[test]
    fn test_delete_column() {
        let mut spec = QuerySpec::new();
        let a = Column::new("a", Expr::new(), col_flags::OUTPUT);
        spec.insert_column(a.clone(), None);
        spec.insert_column(Column::new("b", Expr::new(), col_flags::OUTPUT), None);
        spec.delete_column(&a);
        assert!(spec.get_column("a").is_none());
        assert_eq!(spec.get_column_index("b"), Some(0));
    }

    #[test]
    fn test_streaming_classification() {
        let mut spec = QuerySpec::new();
        assert!(spec.streaming());
        spec.flags |= spec_flags::DISTINCT_USED;
        assert!(!spec.streaming());
        assert!(spec.distinct());
    }
}
