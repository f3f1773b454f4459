//! Expression nodes, path references, and columns.
//!
//! The expression tree is really a DAG: column references point at other
//! columns' expressions, and duplicate path specs share one [`PathRef`].
//! Nodes are held behind `Rc<RefCell<..>>` handles so the same node can be
//! cited from several places while its cached value stays mutable during
//! evaluation. The `VISITED` flag guards DAG traversals against revisiting
//! shared nodes.

use std::cell::RefCell;
use std::rc::Rc;

use crate::query::ops::{self, Opcode, Operator};
use crate::value::{TypeTag, Value};

pub type ExprRef = Rc<RefCell<Expr>>;
pub type PathRefHandle = Rc<RefCell<PathRef>>;
pub type ColumnHandle = Rc<RefCell<Column>>;

/// Expression structural flags.
pub mod expr_flags {
    pub const VISITED: u32 = 0x1;
    pub const SUBTREE_CONTAINS_AGGREGATE: u32 = 0x2;
    pub const SUBTREE_CONTAINS_INPUT_PATH_REF: u32 = 0x4;
    pub const SUBTREE_CONTAINS_JOIN_PATH_REF: u32 = 0x8;
    pub const SUBTREE_CONTAINS_PATH_REF: u32 =
        SUBTREE_CONTAINS_INPUT_PATH_REF | SUBTREE_CONTAINS_JOIN_PATH_REF;
    pub const JOIN_EQUALITY_WHERE: u32 = 0x10;
}

/// Path-reference flags.
pub mod path_flags {
    pub const MATCHED: u32 = 0x1;
    pub const NO_DATA: u32 = 0x2;
    pub const APPEND_DATA: u32 = 0x4;
    pub const SYNC: u32 = 0x8;
    pub const JOINED: u32 = 0x10;
}

/// Column flags.
pub mod col_flags {
    pub const OUTPUT: u32 = 0x1;
    pub const FILTER: u32 = 0x2;
    pub const AGGREGATE: u32 = 0x4;
    pub const JOINED_COLUMN: u32 = 0x8;
    /// A joined column that is also a `where[]` equality operand.
    pub const INDEXED: u32 = 0x10;
    pub const PIVOT_RESULT: u32 = 0x20;
    /// A pivot-result column whose name actually appeared in the input.
    pub const PIVOT_RESULT_REFERENCED: u32 = 0x40;
}

/// A parsed dotted path bound to a scope, carrying the last matched text
/// and the immediate expressions to run at match events.
#[derive(Debug)]
pub struct PathRef {
    pub path_spec: String,
    pub flags: u32,
    /// Written by the path matcher as text accumulates; always a String.
    pub value: Value,
    pub start_match_exprs: Vec<ExprRef>,
    pub end_match_exprs: Vec<ExprRef>,
}

impl PathRef {
    pub fn new(path_spec: impl Into<String>, flags: u32) -> PathRefHandle {
        Rc::new(RefCell::new(PathRef {
            path_spec: path_spec.into(),
            flags,
            value: Value::empty_string(),
            start_match_exprs: Vec::new(),
            end_match_exprs: Vec::new(),
        }))
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    pub fn text(&self) -> &str {
        match &self.value {
            Value::Str(s) => s,
            _ => "",
        }
    }

    pub fn clear_text(&mut self) {
        self.value = Value::empty_string();
    }

    pub fn append_text(&mut self, more: &str) {
        if let Value::Str(s) = &mut self.value {
            s.push_str(more);
        }
    }
}

/// A named output/filter/directive column.
#[derive(Debug)]
pub struct Column {
    pub name: String,
    pub expr: ExprRef,
    pub flags: u32,
    /// Position among all columns; set by the query spec.
    pub index: usize,
    /// Slot in the row vector, for Output/Aggregate columns only.
    pub value_idx: Option<usize>,
}

impl Column {
    pub fn new(name: impl Into<String>, expr: ExprRef, flags: u32) -> ColumnHandle {
        Rc::new(RefCell::new(Column {
            name: name.into(),
            expr,
            flags,
            index: usize::MAX,
            value_idx: None,
        }))
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    pub fn is_output(&self) -> bool {
        self.has_flag(col_flags::OUTPUT)
    }

    pub fn is_filter(&self) -> bool {
        self.has_flag(col_flags::FILTER)
    }

    pub fn is_aggregate(&self) -> bool {
        self.has_flag(col_flags::AGGREGATE)
    }

    pub fn is_pivot_result(&self) -> bool {
        self.has_flag(col_flags::PIVOT_RESULT)
    }
}

/// One operator node.
#[derive(Debug, Clone)]
pub struct Expr {
    pub op: &'static Operator,
    pub args: Vec<ExprRef>,
    /// Cached value of the node's declared type.
    pub value: Value,
    /// Declared type; `set_value` converts incoming values to it.
    pub ty: TypeTag,
    pub flags: u32,
    pub path_ref: Option<PathRefHandle>,
    pub column_ref: Option<ColumnHandle>,
    /// Per-use aggregate slot, assigned during post-processing.
    pub aggr_idx: usize,
}

impl Expr {
    pub fn new() -> ExprRef {
        Rc::new(RefCell::new(Expr {
            op: ops::by_opcode(Opcode::Null),
            args: Vec::new(),
            value: Value::Unknown,
            ty: TypeTag::Unknown,
            flags: 0,
            path_ref: None,
            column_ref: None,
            aggr_idx: usize::MAX,
        }))
    }

    /// Reset to a blank node (used when an infix operator takes over an
    /// already-parsed left operand).
    pub fn clear(&mut self) {
        self.op = ops::by_opcode(Opcode::Null);
        self.args.clear();
        self.value = Value::Unknown;
        self.ty = TypeTag::Unknown;
        self.flags = 0;
        self.path_ref = None;
        self.column_ref = None;
        self.aggr_idx = usize::MAX;
    }

    pub fn opcode(&self) -> Opcode {
        self.op.opcode
    }

    pub fn set_op(&mut self, op: &'static Operator) {
        self.op = op;
        self.ty = op.ty;
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    /// Store a value, converting to the declared type.
    pub fn set_value(&mut self, value: Value) {
        if value.tag() == self.ty {
            self.value = value;
        } else {
            self.value = value.convert(self.ty);
        }
    }

    /// Store a value and adopt its type (literals).
    pub fn set_value_and_type(&mut self, value: Value) {
        self.ty = value.tag();
        self.value = value;
    }

    /// Change the declared type, converting the current value.
    pub fn change_type(&mut self, ty: TypeTag) {
        self.value = self.value.convert(ty);
        self.ty = ty;
    }
}

/// Helpers for working through expression handles.
pub fn arg(expr: &ExprRef, i: usize) -> ExprRef {
    expr.borrow().args[i].clone()
}

pub fn num_args(expr: &ExprRef) -> usize {
    expr.borrow().args.len()
}

pub fn opcode_of(expr: &ExprRef) -> Opcode {
    expr.borrow().opcode()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_value_converts_to_declared_type() {
        let e = Expr::new();
        e.borrow_mut().ty = TypeTag::Integer;
        e.borrow_mut().set_value(Value::Str("42".into()));
        assert!(matches!(e.borrow().value, Value::Int(42)));
    }

    #[test]
    fn test_set_value_and_type_adopts() {
        let e = Expr::new();
        e.borrow_mut().set_value_and_type(Value::Real(2.5));
        assert_eq!(e.borrow().ty, TypeTag::Real);
    }

    #[test]
    fn test_change_type_converts_current_value() {
        let e = Expr::new();
        e.borrow_mut().set_value_and_type(Value::Real(5.0));
        e.borrow_mut().change_type(TypeTag::Integer);
        assert!(matches!(e.borrow().value, Value::Int(5)));
    }

    #[test]
    fn test_path_ref_text_accumulation() {
        let p = PathRef::new("a.b", 0);
        p.borrow_mut().append_text("hello");
        p.borrow_mut().append_text(" world");
        assert_eq!(p.borrow().text(), "hello world");
        p.borrow_mut().clear_text();
        assert_eq!(p.borrow().text(), "");
    }

    #[test]
    fn test_shared_path_ref_is_a_dag() {
        let p = PathRef::new("a", 0);
        let e1 = Expr::new();
        let e2 = Expr::new();
        e1.borrow_mut().path_ref = Some(p.clone());
        e2.borrow_mut().path_ref = Some(p.clone());
        p.borrow_mut().append_text("x");
        assert_eq!(e1.borrow().path_ref.as_ref().unwrap().borrow().text(), "x");
        assert_eq!(e2.borrow().path_ref.as_ref().unwrap().borrow().text(), "x");
    }
}
