//! Ripple Core - row, value and error types for the Ripple incremental dataflow engine.
//!
//! This crate provides the foundational types shared by every layer:
//!
//! - `Value`: runtime cell values (Boolean, Int64, Float64, String, DateTime, Bytes, Pointer, Tuple)
//! - `Key`: stable row identity, connector-assigned or content-derived
//! - `Row`: an immutable, reference-shared tuple of values plus its identity
//! - `Timestamp` / `Offset`: logical commit time and external source positions
//! - `Schema`: column declarations used to validate rows at ingestion
//! - `Error`: the error taxonomy (construction, data, invariant, recovery, ...)
//!
//! # Example
//!
//! ```rust
//! use ripple_core::{Key, Row, Value};
//!
//! let row = Row::new(1, vec![Value::Int64(1), Value::from("Alice")]);
//! assert_eq!(row.key(), Key(1));
//! assert_eq!(row.get(1), Some(&Value::from("Alice")));
//!
//! // Content-derived identities are stable across processes.
//! let a = Row::from_values(vec![Value::Int64(7)]);
//! let b = Row::from_values(vec![Value::Int64(7)]);
//! assert!(a.same_identity(&b));
//! ```

mod error;
mod key;
mod row;
pub mod schema;
mod time;
mod types;
mod value;

pub use error::{DataError, Error, ErrorKind, Result, TransformError};
pub use key::{stable_hash, Key};
pub use row::Row;
pub use schema::{Column, Schema};
pub use time::{Offset, Timestamp};
pub use types::DataType;
pub use value::Value;
