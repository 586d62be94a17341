//! Column declarations for source tables.
//!
//! Sources declare a schema; every pushed row is checked against it before it enters
//! the dataflow. Derived tables only track their arity.

use crate::error::TransformError;
use crate::types::DataType;
use crate::value::Value;
use serde::{Deserialize, Serialize};

/// A column definition in a source schema.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    /// Column name.
    name: String,
    /// Data type of the column.
    data_type: DataType,
    /// Whether this column allows null values.
    nullable: bool,
}

impl Column {
    /// Creates a new non-nullable column definition.
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: matches!(data_type, DataType::Any),
        }
    }

    /// Sets whether this column is nullable.
    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    /// Returns the column name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the data type.
    #[inline]
    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// Returns whether this column is nullable.
    #[inline]
    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    /// Checks a value against this column, widening integers for float columns.
    pub fn coerce(&self, value: Value) -> Result<Value, TransformError> {
        match (&value, self.data_type) {
            (Value::Null, _) if self.nullable => Ok(value),
            (Value::Null, _) => Err(TransformError::new(format!(
                "column {} is not nullable",
                self.name
            ))),
            (_, DataType::Any) => Ok(value),
            (Value::Int64(v), DataType::Float64) => Ok(Value::Float64(*v as f64)),
            (v, expected) if v.data_type() == Some(expected) => Ok(value),
            (v, expected) => Err(TransformError::new(format!(
                "cannot coerce {v} into {expected} for column {}",
                self.name
            ))),
        }
    }
}

/// Ordered column list of a source.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    columns: Vec<Column>,
}

impl Schema {
    /// Creates a schema from column definitions.
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    /// Creates a schema of untyped, nullable columns.
    pub fn untyped<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            names
                .into_iter()
                .map(|n| Column::new(n, DataType::Any))
                .collect(),
        )
    }

    /// Returns the columns.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Returns the number of columns.
    #[inline]
    pub fn arity(&self) -> usize {
        self.columns.len()
    }

    /// Returns the position of the named column.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name() == name)
    }

    /// Validates and coerces a full row of values.
    pub fn coerce_row(&self, values: Vec<Value>) -> Result<Vec<Value>, TransformError> {
        if values.len() != self.columns.len() {
            return Err(TransformError::new(format!(
                "expected {} values, got {}",
                self.columns.len(),
                values.len()
            )));
        }
        values
            .into_iter()
            .zip(&self.columns)
            .map(|(v, c)| c.coerce(v))
            .collect()
    }
}
