//! The operator catalog: a fixed registry of named operators with arity,
//! nominal result type, and semantic flags.
//!
//! Infix operators take their precedence from opcode order: within the
//! infix range, a smaller opcode binds tighter. The parser relies on this
//! when it applies the left-associative fixup.

use crate::error::{Error, Result};
use crate::value::TypeTag;

/// Operator flags.
pub mod flags {
    pub const GATHER_DATA: u32 = 0x1;
    pub const AGGREGATE: u32 = 0x2;
    pub const START_MATCH_EVAL: u32 = 0x4;
    pub const END_MATCH_EVAL: u32 = 0x8;
    pub const IMMED_EVALUATE: u32 = START_MATCH_EVAL | END_MATCH_EVAL;
    pub const ONCE_ONLY: u32 = 0x10;
    pub const TOP_LEVEL_ONLY: u32 = 0x20;
    pub const BINARY_INFIX: u32 = 0x80;
    pub const DIRECTIVE: u32 = 0x100;
    pub const NO_DATA: u32 = 0x200;
    pub const UNQUOTED_STRING_FIRST_ARG: u32 = 0x400;
    pub const UNQUOTED_STRING_SECOND_ARG: u32 = 0x800;

    /// Directives never need text content from their path arguments.
    pub const DIRECTIVE_NO_DATA: u32 = DIRECTIVE | NO_DATA;
}

/// Opcodes. The declaration order of the infix group (`Mul` through `And`)
/// encodes precedence, tightest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Opcode {
    Null,
    // terminals
    ColumnRef,
    PathRef,
    Literal,
    // unary
    Neg,
    Not,
    // binary infix, decreasing precedence
    Mul,
    Div,
    Mod,
    Add,
    Sub,
    Concat,
    Eq,
    Ne,
    Le,
    Ge,
    Lt,
    Gt,
    Or,
    Xor,
    And,
    // arithmetic functions
    Min,
    Max,
    Sqrt,
    Pow,
    Log,
    Exp,
    Abs,
    Round,
    Floor,
    Ceil,
    // string functions
    Len,
    Contains,
    Find,
    Left,
    Right,
    Upper,
    Lower,
    // misc
    FormatSec,
    FormatMs,
    RowNum,
    If,
    // typing
    Real,
    Int,
    Bool,
    Str,
    DateTime,
    Type,
    // immediate functions, evaluated on path match
    Path,
    Depth,
    Attr,
    NodeNum,
    NodeName,
    NodeStart,
    NodeEnd,
    LineNum,
    // aggregate functions
    Any,
    Sum,
    MinAggr,
    MaxAggr,
    Avg,
    Stdev,
    Var,
    Cov,
    Corr,
    Count,
    // directives
    First,
    Top,
    Sort,
    Pivot,
    Distinct,
    Where,
    Sync,
    Root,
    In,
    Join,
    Case,
    InputHeader,
    JoinHeader,
    OutputHeader,
    Help,
}

/// Immutable operator metadata.
#[derive(Debug, Clone, Copy)]
pub struct Operator {
    pub name: &'static str,
    pub opcode: Opcode,
    pub min_args: usize,
    pub max_args: usize,
    pub ty: TypeTag,
    pub flags: u32,
}

impl Operator {
    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    pub fn is_directive(&self) -> bool {
        self.has_flag(flags::DIRECTIVE)
    }

    pub fn is_aggregate(&self) -> bool {
        self.has_flag(flags::AGGREGATE)
    }
}

const UNBOUNDED: usize = usize::MAX;

use self::flags::*;
use self::Opcode as Op;
use crate::value::TypeTag as T;

macro_rules! op {
    ($name:literal, $op:expr, $min:expr, $max:expr, $ty:expr) => {
        Operator { name: $name, opcode: $op, min_args: $min, max_args: $max, ty: $ty, flags: 0 }
    };
    ($name:literal, $op:expr, $min:expr, $max:expr, $ty:expr, $flags:expr) => {
        Operator { name: $name, opcode: $op, min_args: $min, max_args: $max, ty: $ty, flags: $flags }
    };
}

#[rustfmt::skip]
static CATALOG: &[Operator] = &[
    op!("<Null>",      Op::Null,      0, 0, T::Unknown),
    op!("<ColumnRef>", Op::ColumnRef, 0, 0, T::Unknown),
    op!("<PathRef>",   Op::PathRef,   0, 0, T::Unknown),
    op!("<Literal>",   Op::Literal,   0, 0, T::Unknown),
    op!("case",        Op::Case,      0, 1, T::Unknown, TOP_LEVEL_ONLY | DIRECTIVE_NO_DATA | ONCE_ONLY),
    op!("help",        Op::Help,      0, 0, T::Unknown, TOP_LEVEL_ONLY | DIRECTIVE_NO_DATA | ONCE_ONLY),
    op!("usage",       Op::Help,      0, 0, T::Unknown, TOP_LEVEL_ONLY | DIRECTIVE_NO_DATA | ONCE_ONLY), // synonym
    op!("-",           Op::Neg,       1, 1, T::Real),
    op!("in",          Op::In,        1, 1, T::Unknown, TOP_LEVEL_ONLY | DIRECTIVE_NO_DATA | ONCE_ONLY | UNQUOTED_STRING_FIRST_ARG),
    op!("inheader",    Op::InputHeader, 0, 1, T::Unknown, TOP_LEVEL_ONLY | DIRECTIVE_NO_DATA | ONCE_ONLY),
    op!("outheader",   Op::OutputHeader, 0, 1, T::Unknown, TOP_LEVEL_ONLY | DIRECTIVE_NO_DATA | ONCE_ONLY),
    op!("header",      Op::OutputHeader, 0, 1, T::Unknown, TOP_LEVEL_ONLY | DIRECTIVE_NO_DATA | ONCE_ONLY), // synonym
    op!("join",        Op::Join,      1, 2, T::Unknown, TOP_LEVEL_ONLY | DIRECTIVE_NO_DATA | ONCE_ONLY | UNQUOTED_STRING_FIRST_ARG),
    op!("joinheader",  Op::JoinHeader, 0, 1, T::Unknown, TOP_LEVEL_ONLY | DIRECTIVE_NO_DATA | ONCE_ONLY),
    op!("pivot",       Op::Pivot,     2, 3, T::Unknown, TOP_LEVEL_ONLY | DIRECTIVE_NO_DATA | ONCE_ONLY),
    op!("..",          Op::Attr,      2, 2, T::String,  NO_DATA | START_MATCH_EVAL | BINARY_INFIX),
    op!("rownum",      Op::RowNum,    0, 0, T::Integer),
    op!("linenum",     Op::LineNum,   1, 1, T::Integer, NO_DATA | START_MATCH_EVAL),
    op!("depth",       Op::Depth,     1, 1, T::Integer, NO_DATA | START_MATCH_EVAL),
    op!("sync",        Op::Sync,      1, 1, T::Unknown, TOP_LEVEL_ONLY | DIRECTIVE_NO_DATA | ONCE_ONLY | END_MATCH_EVAL),
    op!("root",        Op::Root,      1, 1, T::Unknown, TOP_LEVEL_ONLY | DIRECTIVE_NO_DATA | ONCE_ONLY | UNQUOTED_STRING_FIRST_ARG),
    op!("path",        Op::Path,      1, 1, T::String,  NO_DATA | START_MATCH_EVAL),
    op!("nodenum",     Op::NodeNum,   1, 2, T::Integer, NO_DATA | START_MATCH_EVAL | UNQUOTED_STRING_SECOND_ARG),
    op!("nodename",    Op::NodeName,  1, 2, T::String,  NO_DATA | START_MATCH_EVAL),
    op!("nodestart",   Op::NodeStart, 1, 1, T::Integer, NO_DATA | START_MATCH_EVAL),
    op!("nodeend",     Op::NodeEnd,   1, 1, T::Integer, NO_DATA | END_MATCH_EVAL),
    op!("where",       Op::Where,     1, 1, T::Unknown, TOP_LEVEL_ONLY | DIRECTIVE_NO_DATA),
    op!("first",       Op::First,     1, 1, T::Unknown, TOP_LEVEL_ONLY | DIRECTIVE_NO_DATA | ONCE_ONLY),
    op!("top",         Op::Top,       1, 1, T::Unknown, TOP_LEVEL_ONLY | DIRECTIVE_NO_DATA | ONCE_ONLY),
    op!("sort",        Op::Sort,      1, UNBOUNDED, T::Unknown, TOP_LEVEL_ONLY | DIRECTIVE_NO_DATA | ONCE_ONLY),
    op!("distinct",    Op::Distinct,  0, 0, T::Unknown, TOP_LEVEL_ONLY | DIRECTIVE_NO_DATA | ONCE_ONLY),
    op!("not",         Op::Not,       1, 1, T::Boolean),
    op!("!",           Op::Not,       1, 1, T::Boolean),
    op!("*",           Op::Mul,       2, 2, T::Real,    BINARY_INFIX),
    op!("/",           Op::Div,       2, 2, T::Real,    BINARY_INFIX),
    op!("%",           Op::Mod,       2, 2, T::Integer, BINARY_INFIX),
    op!("+",           Op::Add,       1, 2, T::Real,    BINARY_INFIX),
    op!("-",           Op::Sub,       2, 2, T::Real,    BINARY_INFIX),
    op!("eq",          Op::Eq,        2, 2, T::Boolean),
    op!("==",          Op::Eq,        2, 2, T::Boolean, BINARY_INFIX),
    op!("ne",          Op::Ne,        2, 2, T::Boolean),
    op!("!=",          Op::Ne,        2, 2, T::Boolean, BINARY_INFIX),
    op!("le",          Op::Le,        2, 2, T::Boolean),
    op!("<=",          Op::Le,        2, 2, T::Boolean, BINARY_INFIX),
    op!("ge",          Op::Ge,        2, 2, T::Boolean),
    op!(">=",          Op::Ge,        2, 2, T::Boolean, BINARY_INFIX),
    op!("lt",          Op::Lt,        2, 2, T::Boolean),
    op!("<",           Op::Lt,        2, 2, T::Boolean, BINARY_INFIX),
    op!("gt",          Op::Gt,        2, 2, T::Boolean),
    op!(">",           Op::Gt,        2, 2, T::Boolean, BINARY_INFIX),
    op!("and",         Op::And,       2, 2, T::Boolean),
    op!("&&",          Op::And,       2, 2, T::Boolean, BINARY_INFIX),
    op!("or",          Op::Or,        2, 2, T::Boolean),
    op!("||",          Op::Or,        2, 2, T::Boolean, BINARY_INFIX),
    op!("xor",         Op::Xor,       2, 2, T::Boolean),
    op!("^",           Op::Xor,       2, 2, T::Boolean, BINARY_INFIX),
    op!("if",          Op::If,        3, 3, T::Real), // retyped by inference
    op!("abs",         Op::Abs,       1, 1, T::Real),
    op!("floor",       Op::Floor,     1, 1, T::Real),
    op!("ceil",        Op::Ceil,      1, 1, T::Real),
    op!("round",       Op::Round,     1, 2, T::Real),
    op!("min",         Op::Min,       2, 2, T::Real), // 1-arg form becomes MinAggr
    op!("max",         Op::Max,       2, 2, T::Real), // 1-arg form becomes MaxAggr
    op!("sqrt",        Op::Sqrt,      1, 1, T::Real),
    op!("pow",         Op::Pow,       2, 2, T::Real),
    op!("log",         Op::Log,       1, 2, T::Real), // default base e
    op!("exp",         Op::Exp,       1, 1, T::Real),
    op!("&",           Op::Concat,    2, 2, T::String, BINARY_INFIX),
    op!("concat",      Op::Concat,    2, 2, T::String), // synonym
    op!("len",         Op::Len,       1, 1, T::Integer),
    op!("left",        Op::Left,      2, 2, T::String),
    op!("right",       Op::Right,     2, 2, T::String),
    op!("lower",       Op::Lower,     1, 1, T::String),
    op!("upper",       Op::Upper,     1, 1, T::String),
    op!("contains",    Op::Contains,  2, 2, T::Boolean),
    op!("find",        Op::Find,      2, 2, T::Integer),
    op!("formatsec",   Op::FormatSec, 1, 1, T::String),
    op!("formatms",    Op::FormatMs,  1, 1, T::String),
    op!("type",        Op::Type,      1, 1, T::String),
    op!("real",        Op::Real,      1, 1, T::Real),
    op!("int",         Op::Int,       1, 1, T::Integer),
    op!("bool",        Op::Bool,      1, 1, T::Boolean),
    op!("str",         Op::Str,       1, 2, T::String),
    op!("datetime",    Op::DateTime,  1, 1, T::DateTime),
    op!("any",         Op::Any,       1, 1, T::String,  AGGREGATE),
    op!("sum",         Op::Sum,       1, 1, T::Real,    AGGREGATE),
    op!("avg",         Op::Avg,       1, 1, T::Real,    AGGREGATE),
    op!("min",         Op::MinAggr,   1, 1, T::Real,    AGGREGATE),
    op!("max",         Op::MaxAggr,   1, 1, T::Real,    AGGREGATE),
    op!("var",         Op::Var,       1, 1, T::Real,    AGGREGATE),
    op!("cov",         Op::Cov,       2, 2, T::Real,    AGGREGATE),
    op!("corr",        Op::Corr,      2, 2, T::Real,    AGGREGATE),
    op!("stdev",       Op::Stdev,     1, 1, T::Real,    AGGREGATE),
    op!("count",       Op::Count,     1, 1, T::Integer, NO_DATA | AGGREGATE),
];

/// Look up an operator by name (case-insensitive).
pub fn lookup(name: &str) -> Result<&'static Operator> {
    CATALOG
        .iter()
        .find(|op| op.name.eq_ignore_ascii_case(name))
        .ok_or_else(|| Error::parse(format!("Unrecognized function: {}", name)))
}

/// First catalog entry for an opcode.
pub fn by_opcode(opcode: Opcode) -> &'static Operator {
    CATALOG
        .iter()
        .find(|op| op.opcode == opcode)
        .expect("every opcode has a catalog entry")
}

/// The aggregate kind an aggregate opcode accumulates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggrKind {
    Any,
    Count,
    Min,
    Max,
    Sum,
    Avg,
    Stdev,
    Var,
    Cov,
    Corr,
}

pub fn aggr_kind(opcode: Opcode) -> AggrKind {
    match opcode {
        Opcode::Any => AggrKind::Any,
        Opcode::Sum => AggrKind::Sum,
        Opcode::Avg => AggrKind::Avg,
        Opcode::MinAggr => AggrKind::Min,
        Opcode::MaxAggr => AggrKind::Max,
        Opcode::Var => AggrKind::Var,
        Opcode::Cov => AggrKind::Cov,
        Opcode::Corr => AggrKind::Corr,
        Opcode::Stdev => AggrKind::Stdev,
        Opcode::Count => AggrKind::Count,
        _ => unreachable!("not an aggregate opcode"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_case_insensitive() {
        assert_eq!(lookup("SUM").unwrap().opcode, Opcode::Sum);
        assert_eq!(lookup("Count").unwrap().opcode, Opcode::Count);
    }

    #[test]
    fn test_lookup_unknown() {
        assert!(lookup("frobnicate").is_err());
    }

    #[test]
    fn test_synonyms() {
        assert_eq!(lookup("usage").unwrap().opcode, Opcode::Help);
        assert_eq!(lookup("header").unwrap().opcode, Opcode::OutputHeader);
        assert_eq!(lookup("concat").unwrap().opcode, Opcode::Concat);
    }

    #[test]
    fn test_infix_precedence_order() {
        // Mul binds tighter than Add, Add tighter than comparison,
        // comparison tighter than boolean connectives.
        assert!(Opcode::Mul < Opcode::Add);
        assert!(Opcode::Add < Opcode::Eq);
        assert!(Opcode::Eq < Opcode::And);
        assert!(Opcode::Concat < Opcode::Eq);
    }

    #[test]
    fn test_directives_imply_no_data() {
        for op in CATALOG {
            if op.is_directive() {
                assert!(op.has_flag(flags::NO_DATA), "{} lacks NO_DATA", op.name);
            }
        }
    }

    #[test]
    fn test_min_lookup_prefers_binary() {
        // Name lookup finds the 2-arg form; the parser switches to the
        // aggregate when a single argument is supplied.
        let op = lookup("min").unwrap();
        assert_eq!(op.opcode, Opcode::Min);
        assert_eq!((op.min_args, op.max_args), (2, 2));
    }
}
