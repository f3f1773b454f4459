//! Crate-wide error type.
//!
//! Every failure in the query pipeline is fatal to the query and carries a
//! single-line message. The four kinds distinguish where in the pipeline the
//! failure originated, which the binary uses only for exit diagnostics.

use std::fmt;

/// A fatal query error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Query syntax or semantics: unknown function, duplicate column,
    /// circular reference, unsupported composition.
    Parse(String),
    /// Malformed or unrecognized input: buffer overflow, unterminated JSON
    /// string, illegal control byte, no detector accepted the stream.
    Input(String),
    /// A named thing was not found: missing file, path never matched,
    /// pivot column never seen.
    Lookup(String),
    /// A constraint of the execution plan was violated at run time, e.g.
    /// stdin with a two-pass plan.
    Runtime(String),
}

impl Error {
    pub fn parse(msg: impl Into<String>) -> Self {
        Error::Parse(msg.into())
    }

    pub fn input(msg: impl Into<String>) -> Self {
        Error::Input(msg.into())
    }

    pub fn lookup(msg: impl Into<String>) -> Self {
        Error::Lookup(msg.into())
    }

    pub fn runtime(msg: impl Into<String>) -> Self {
        Error::Runtime(msg.into())
    }

    /// The message without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            Error::Parse(m) | Error::Input(m) | Error::Lookup(m) | Error::Runtime(m) => m,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Input(e.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
