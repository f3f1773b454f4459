//! Bottom-up type inference.
//!
//! Each node is assigned a type and its children are coerced to the types
//! its operator expects: arithmetic picks Integer iff both operands are
//! Integer, comparison picks the join of its operand types and yields
//! Boolean, string functions coerce to String, and so on.

use crate::query::expr::{arg, num_args, ExprRef};
use crate::query::ops::Opcode;
use crate::value::TypeTag;

pub fn infer(expr: &ExprRef) {
    let nargs = num_args(expr);
    for i in 0..nargs {
        infer(&arg(expr, i));
    }

    let opcode = expr.borrow().opcode();

    let set_ty = |t: TypeTag| expr.borrow_mut().ty = t;
    let arg_ty = |i: usize| arg(expr, i).borrow().ty;
    let change_arg = |i: usize, t: TypeTag| {
        if i < nargs {
            arg(expr, i).borrow_mut().change_type(t);
        }
    };

    match opcode {
        Opcode::Real => {
            set_ty(TypeTag::Real);
            change_arg(0, TypeTag::Real);
        }

        Opcode::Int => {
            set_ty(TypeTag::Integer);
            change_arg(0, TypeTag::Integer);
        }

        Opcode::Bool => {
            set_ty(TypeTag::Boolean);
            change_arg(0, TypeTag::Boolean);
        }

        Opcode::Str => {
            set_ty(TypeTag::String);
            if nargs == 1 {
                change_arg(0, TypeTag::String);
            } else {
                // With a precision argument the conversion happens at
                // evaluation time from the argument's own type.
                change_arg(1, TypeTag::Integer);
            }
        }

        Opcode::DateTime => {
            set_ty(TypeTag::DateTime);
            change_arg(0, TypeTag::DateTime);
        }

        Opcode::Not => {
            change_arg(0, TypeTag::Boolean);
        }

        Opcode::Neg => {
            // For strings, -str passes through; it flags reverse sort
            // order. Unknown operands become Real.
            let t = arg_ty(0);
            let t = if t == TypeTag::String || t == TypeTag::Integer {
                t
            } else {
                TypeTag::Real
            };
            set_ty(t);
            change_arg(0, t);
        }

        Opcode::Abs => {
            let t = if arg_ty(0) == TypeTag::Integer {
                TypeTag::Integer
            } else {
                TypeTag::Real
            };
            set_ty(t);
            change_arg(0, t);
        }

        Opcode::Concat => {
            set_ty(TypeTag::String);
            change_arg(0, TypeTag::String);
            change_arg(1, TypeTag::String);
        }

        Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div => {
            let t = if arg_ty(0) == TypeTag::Integer
                && nargs >= 2
                && arg_ty(1) == TypeTag::Integer
            {
                TypeTag::Integer
            } else {
                TypeTag::Real
            };
            set_ty(t);
            change_arg(0, t);
            change_arg(1, t);
        }

        Opcode::Mod => {
            set_ty(TypeTag::Integer);
            change_arg(0, TypeTag::Integer);
            change_arg(1, TypeTag::Integer);
        }

        Opcode::Or | Opcode::Xor | Opcode::And => {
            set_ty(TypeTag::Boolean);
            change_arg(0, TypeTag::Boolean);
            change_arg(1, TypeTag::Boolean);
        }

        Opcode::Min | Opcode::Max => {
            let t = arg_ty(0).join(arg_ty(1));
            set_ty(t);
            change_arg(0, t);
            change_arg(1, t);
        }

        Opcode::If => {
            let t = arg_ty(1).join(arg_ty(2));
            set_ty(t);
            change_arg(0, TypeTag::Boolean);
            change_arg(1, t);
            change_arg(2, t);
        }

        Opcode::Sqrt | Opcode::Exp | Opcode::Log | Opcode::Pow => {
            set_ty(TypeTag::Real);
            change_arg(0, TypeTag::Real);
            change_arg(1, TypeTag::Real);
        }

        Opcode::Floor | Opcode::Ceil => {
            let t = arg_ty(0).join(TypeTag::Real);
            set_ty(TypeTag::Integer);
            change_arg(0, t);
        }

        Opcode::Len => {
            set_ty(TypeTag::Integer);
            change_arg(0, TypeTag::String);
        }

        Opcode::Left | Opcode::Right => {
            set_ty(TypeTag::String);
            change_arg(0, TypeTag::String);
            change_arg(1, TypeTag::Integer);
        }

        Opcode::Lower | Opcode::Upper => {
            set_ty(TypeTag::String);
            change_arg(0, TypeTag::String);
        }

        Opcode::Contains => {
            set_ty(TypeTag::Boolean);
            change_arg(0, TypeTag::String);
            change_arg(1, TypeTag::String);
        }

        Opcode::Find => {
            set_ty(TypeTag::Integer);
            change_arg(0, TypeTag::String);
            change_arg(1, TypeTag::String);
        }

        Opcode::FormatSec | Opcode::FormatMs => {
            change_arg(0, TypeTag::Integer);
        }

        Opcode::Round => {
            let t = arg_ty(0).join(TypeTag::Real);
            set_ty(t);
            change_arg(0, t);
            change_arg(1, TypeTag::Integer);
        }

        Opcode::Eq | Opcode::Ne | Opcode::Le | Opcode::Ge | Opcode::Lt | Opcode::Gt => {
            let t = arg_ty(0).join(arg_ty(1));
            set_ty(TypeTag::Boolean);
            change_arg(0, t);
            change_arg(1, t);
        }

        Opcode::NodeNum => {
            // Two flavors: integer ancestor offset or ancestor name lookup.
            if nargs >= 2 && arg_ty(1) != TypeTag::String {
                change_arg(1, TypeTag::Integer);
            }
        }

        Opcode::NodeName => {
            change_arg(1, TypeTag::Integer);
        }

        Opcode::Sum | Opcode::MinAggr | Opcode::MaxAggr => {
            let t = if arg_ty(0) == TypeTag::Integer {
                TypeTag::Integer
            } else {
                TypeTag::Real
            };
            arg(expr, 0).borrow_mut().ty = t;
            set_ty(t);
        }

        Opcode::Avg | Opcode::Stdev | Opcode::Var | Opcode::Cov | Opcode::Corr => {
            change_arg(0, TypeTag::Real);
            change_arg(1, TypeTag::Real);
        }

        Opcode::Count => {} // argument type doesn't matter

        Opcode::First | Opcode::Top => {
            change_arg(0, TypeTag::Integer);
        }

        Opcode::ColumnRef => {
            set_ty(TypeTag::String);
        }

        // identity: expression takes on the type of its argument
        Opcode::Where | Opcode::Sync | Opcode::Any => {
            let t = arg_ty(0);
            set_ty(t);
        }

        Opcode::Case | Opcode::InputHeader | Opcode::OutputHeader | Opcode::JoinHeader => {
            change_arg(0, TypeTag::Boolean);
        }

        Opcode::In | Opcode::Join => {
            change_arg(0, TypeTag::String);
        }

        Opcode::Root => {
            change_arg(0, TypeTag::Integer);
        }

        Opcode::Pivot => {
            change_arg(0, TypeTag::String);
            change_arg(1, TypeTag::String);
            change_arg(2, TypeTag::Boolean);
        }

        _ => {}
    }
}
