//! The streaming side: parse context, path matching, pivoting, the row
//! engine, and the push-based tag scanner.

pub mod context;
pub mod executor;
pub mod matcher;
pub mod parser;
pub mod path;
pub mod pivot;
pub mod rows;

pub use context::{Context, PassType};
pub use parser::Engine;
