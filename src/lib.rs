//! tabq: a streaming query engine over semi-structured tabular inputs.
//!
//! A query is a sequence of column expressions and directives supplied as
//! command-line arguments. The engine auto-detects the input format (XML,
//! JSON, log lines, or CSV/TSV), unifies it into one stream of tag
//! events, projects tagged values into rows, and optionally joins,
//! filters, aggregates, pivots, sorts, and dedupes before emitting CSV.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::atomic::AtomicBool;
//! use std::sync::Arc;
//!
//! let args: Vec<String> = vec![
//!     "--in=orders.csv".into(),
//!     "Customer Name".into(),
//!     "first[5]".into(),
//! ];
//! let mut out = Vec::new();
//! tabq::driver::run(&args, &mut out, Arc::new(AtomicBool::new(false))).unwrap();
//! ```

pub mod driver;
pub mod engine;
pub mod error;
pub mod input;
pub mod output;
pub mod query;
pub mod text;
pub mod value;

pub use driver::{run, RunOutcome};
pub use error::{Error, Result};
pub use value::{DateTime, TypeTag, Value};
