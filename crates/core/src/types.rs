//! Data type definitions for Ripple.
//!
//! This module defines the column types a source can declare. Values pushed into a
//! source are checked against (and, for numbers, coerced into) the declared type.

use serde::{Deserialize, Serialize};

/// Supported column types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    /// Accepts any value
    Any,
    /// Boolean type (true/false)
    Boolean,
    /// 64-bit signed integer
    Int64,
    /// 64-bit floating point number
    Float64,
    /// UTF-8 string
    String,
    /// Date and time stored as Unix timestamp (milliseconds)
    DateTime,
    /// Binary data
    Bytes,
    /// Reference to another row's identity
    Pointer,
    /// Ordered tuple of values
    Tuple,
}

impl DataType {
    /// Returns the name used in error messages.
    pub fn name(&self) -> &'static str {
        match self {
            DataType::Any => "any",
            DataType::Boolean => "bool",
            DataType::Int64 => "int",
            DataType::Float64 => "float",
            DataType::String => "str",
            DataType::DateTime => "datetime",
            DataType::Bytes => "bytes",
            DataType::Pointer => "pointer",
            DataType::Tuple => "tuple",
        }
    }

    /// Returns whether this type is numeric.
    pub fn is_numeric(&self) -> bool {
        matches!(self, DataType::Int64 | DataType::Float64)
    }
}

impl core::fmt::Display for DataType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}
