//! Error types for Ripple.
//!
//! Errors fall into the categories reported by [`ErrorKind`]. Only data errors may be
//! survived (when the evaluator is configured to route them); everything else stops
//! the computation.

use crate::key::Key;
use crate::row::Row;
use crate::time::Timestamp;
use core::fmt;
use thiserror::Error;

/// Result type alias for Ripple operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Failure of a user transformation on a single row.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct TransformError {
    message: String,
}

impl TransformError {
    /// Creates a transformation error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for TransformError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for TransformError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// A data-level failure with the context needed to locate it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataError {
    /// Operator name (unique within the graph).
    pub operator: String,
    /// Commit time at which the failure happened.
    pub time: Timestamp,
    /// Offending row, when one exists.
    pub row: Option<Row>,
    /// What went wrong.
    pub message: String,
}

impl fmt::Display for DataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "operator {} failed at time {}", self.operator, self.time)?;
        if let Some(row) = &self.row {
            write!(f, " on row {row}")?;
        }
        write!(f, ": {}", self.message)
    }
}

/// Category of an [`Error`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Invalid graph, detected while building it.
    Construction,
    /// A transformation failed on a specific row.
    Data,
    /// Internal state is inconsistent.
    Invariant,
    /// An iteration did not converge.
    NonTermination,
    /// Commit sequencing failed.
    Coordinator,
    /// Snapshot could not be written.
    Persistence,
    /// Snapshot could not be loaded.
    Recovery,
    /// Invalid configuration.
    Config,
}

/// Error types for Ripple operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Row-aligned operator over incompatible universes.
    #[error("universe mismatch at {operator}: {message}")]
    UniverseMismatch { operator: String, message: String },
    /// Cycle outside an iteration subgraph.
    #[error("cyclic dataflow outside an iteration: {}", nodes.join(" -> "))]
    CyclicGraph { nodes: Vec<String> },
    /// Reference to an operator that does not exist in the graph.
    #[error("unknown operator: {0}")]
    UnknownNode(String),
    /// Any other structural problem found at build time.
    #[error("invalid graph: {0}")]
    InvalidGraph(String),
    /// A transformation failed on a row.
    #[error("{0}")]
    Data(Box<DataError>),
    /// A diff that does not match the collection it is applied to.
    #[error("inconsistent diff for {key} at time {time}: {detail}")]
    InconsistentDiff {
        key: Key,
        time: Timestamp,
        detail: String,
    },
    /// Operator state is corrupted.
    #[error("invariant violated in {operator} at time {time}: {message}")]
    Invariant {
        operator: String,
        time: Timestamp,
        message: String,
    },
    /// An iteration kept producing changes.
    #[error("iteration {operator} did not reach a fixpoint within {rounds} rounds at time {time}")]
    IterationLimit {
        operator: String,
        rounds: u32,
        time: Timestamp,
    },
    /// Commit sequencing failed.
    #[error("coordinator: {0}")]
    Coordinator(String),
    /// Writing a snapshot failed.
    #[error("persistence: {0}")]
    Persistence(String),
    /// Loading a snapshot failed.
    #[error("recovery failed: {0}")]
    Recovery(String),
    /// Invalid configuration.
    #[error("configuration: {0}")]
    Config(String),
    /// IO error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Creates a universe mismatch error.
    pub fn universe_mismatch(operator: impl Into<String>, message: impl Into<String>) -> Self {
        Error::UniverseMismatch {
            operator: operator.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid graph error.
    pub fn invalid_graph(message: impl Into<String>) -> Self {
        Error::InvalidGraph(message.into())
    }

    /// Creates a data error.
    pub fn data(
        operator: impl Into<String>,
        time: Timestamp,
        row: Option<Row>,
        message: impl Into<String>,
    ) -> Self {
        Error::Data(Box::new(DataError {
            operator: operator.into(),
            time,
            row,
            message: message.into(),
        }))
    }

    /// Creates an inconsistent diff error.
    pub fn inconsistent_diff(key: Key, time: Timestamp, detail: impl Into<String>) -> Self {
        Error::InconsistentDiff {
            key,
            time,
            detail: detail.into(),
        }
    }

    /// Creates an invariant violation.
    pub fn invariant(
        operator: impl Into<String>,
        time: Timestamp,
        message: impl Into<String>,
    ) -> Self {
        Error::Invariant {
            operator: operator.into(),
            time,
            message: message.into(),
        }
    }

    /// Creates a coordinator error.
    pub fn coordinator(message: impl Into<String>) -> Self {
        Error::Coordinator(message.into())
    }

    /// Creates a persistence error.
    pub fn persistence(message: impl Into<String>) -> Self {
        Error::Persistence(message.into())
    }

    /// Creates a recovery error.
    pub fn recovery(message: impl Into<String>) -> Self {
        Error::Recovery(message.into())
    }

    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }

    /// Returns the category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::UniverseMismatch { .. }
            | Error::CyclicGraph { .. }
            | Error::UnknownNode(_)
            | Error::InvalidGraph(_) => ErrorKind::Construction,
            Error::Data(_) | Error::InconsistentDiff { .. } => ErrorKind::Data,
            Error::Invariant { .. } => ErrorKind::Invariant,
            Error::IterationLimit { .. } => ErrorKind::NonTermination,
            Error::Coordinator(_) => ErrorKind::Coordinator,
            Error::Persistence(_) | Error::Io(_) => ErrorKind::Persistence,
            Error::Recovery(_) => ErrorKind::Recovery,
            Error::Config(_) => ErrorKind::Config,
        }
    }

    /// Returns true unless the error may be survived by routing the offending row.
    pub fn is_fatal(&self) -> bool {
        self.kind() != ErrorKind::Data
    }

    /// Returns the data error details, if this is a data error.
    pub fn as_data_error(&self) -> Option<&DataError> {
        match self {
            Error::Data(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn test_error_display() {
        let err = Error::universe_mismatch("zip#3", "left and right differ");
        assert!(err.to_string().contains("zip#3"));

        let err = Error::CyclicGraph {
            nodes: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "cyclic dataflow outside an iteration: a -> b -> a");
    }

    #[test]
    fn test_data_error_names_operator_time_and_row() {
        let row = Row::new(1, vec![Value::Int64(8)]);
        let err = Error::data("map#1", Timestamp(4), Some(row), "division by zero");
        let text = err.to_string();
        assert!(text.contains("map#1"));
        assert!(text.contains("time 4"));
        assert!(text.contains("division by zero"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            Error::invariant("join#2", Timestamp(1), "missing row").kind(),
            ErrorKind::Invariant
        );
        assert!(Error::recovery("manifest missing").is_fatal());
        assert_eq!(
            Error::inconsistent_diff(Key(1), Timestamp(1), "delete of absent row").kind(),
            ErrorKind::Data
        );
    }
}
