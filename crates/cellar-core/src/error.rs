//! Error types for cellar-core.
//!
//! Two families live here. [`Error`] is the crate's `Result` error for
//! operations that fail outright. [`ErrorRecord`] is cell-local diagnostic
//! data: parse, dispatch and runtime failures are stored on the cell rather
//! than returned.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::document::NodeId;

/// Result type for cellar-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in cellar-core.
#[derive(Debug, Error)]
pub enum Error {
    /// Failed to parse a cell expression.
    #[error("parse error at {line}:{column}: {message}")]
    Parse {
        line: usize,
        column: usize,
        message: String,
    },

    /// Cell not registered with the engine.
    #[error("cell not found: {0}")]
    CellNotFound(NodeId),

    /// Table columns disagree on their length.
    #[error("invalid table: {0}")]
    InvalidTable(String),
}

/// Which stage produced an [`ErrorRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Source could not be turned into an expression.
    Parse,
    /// No context for the cell's language, or a call with no owning cell.
    Dispatch,
    /// The context received the call but execution failed.
    Runtime,
    /// The cell sits on a dependency cycle.
    Dependency,
    /// Non-fatal; the call proceeded (e.g. an unnamed argument was dropped).
    Warning,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Parse => "parse",
            ErrorKind::Dispatch => "dispatch",
            ErrorKind::Runtime => "runtime",
            ErrorKind::Dependency => "dependency",
            ErrorKind::Warning => "warning",
        };
        f.write_str(name)
    }
}

/// A structured diagnostic attached to a cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub line: usize,
    pub column: usize,
    pub message: String,
}

impl ErrorRecord {
    pub fn new(kind: ErrorKind, line: usize, column: usize, message: impl Into<String>) -> Self {
        Self {
            kind,
            line,
            column,
            message: message.into(),
        }
    }

    pub fn parse(line: usize, column: usize, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Parse, line, column, message)
    }

    /// Dispatch errors have no meaningful source position.
    pub fn dispatch(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Dispatch, 0, 0, message)
    }

    pub fn runtime(line: usize, column: usize, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Runtime, line, column, message)
    }

    pub fn dependency(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Dependency, 0, 0, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Warning, 0, 0, message)
    }

    /// Whether this record prevents the cell from holding a value.
    pub fn is_fatal(&self) -> bool {
        self.kind != ErrorKind::Warning
    }
}

impl std::fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} error at {}:{}: {}",
            self.kind, self.line, self.column, self.message
        )
    }
}
