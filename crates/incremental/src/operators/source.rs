//! Source operator: turns pushed rows into consistent deltas.

use crate::collection::{KeyedTable, MultiplicityPolicy};
use crate::dataflow::SessionType;
use crate::delta::Delta;
use crate::operators::OpContext;
use ripple_core::{Error, Result, Row, Schema};
use serde::{Deserialize, Serialize};

/// Kind of change pushed into a source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Insert,
    Delete,
}

/// A row pushed into a source, as received from a connector.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceEvent {
    pub row: Row,
    pub op: Operation,
}

impl SourceEvent {
    /// An insertion of `row`.
    pub fn insert(row: Row) -> Self {
        Self {
            row,
            op: Operation::Insert,
        }
    }

    /// A deletion of `row`.
    pub fn delete(row: Row) -> Self {
        Self {
            row,
            op: Operation::Delete,
        }
    }
}

/// Current content of a source table.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SourceState {
    table: KeyedTable,
}

impl SourceState {
    /// Creates an empty source.
    pub fn new(policy: MultiplicityPolicy) -> Self {
        Self {
            table: KeyedTable::new(policy),
        }
    }

    /// Returns the current table.
    pub fn table(&self) -> &KeyedTable {
        &self.table
    }

    /// Applies the events of one commit in arrival order and returns the visible
    /// changes.
    ///
    /// Rows that do not fit the schema, and diffs that contradict the stored table
    /// (deleting an absent row, reinserting an identity with different values), are
    /// data errors.
    pub fn apply(
        &mut self,
        events: &[SourceEvent],
        schema: &Schema,
        session: SessionType,
        ctx: &mut OpContext,
    ) -> Result<Vec<Delta<Row>>> {
        let mut output = Vec::with_capacity(events.len());
        for event in events {
            let row = match schema.coerce_row(event.row.values().to_vec()) {
                Ok(values) if values.as_slice() == event.row.values() => event.row.clone(),
                Ok(values) => Row::new(event.row.key(), values),
                Err(e) => {
                    ctx.report_transform(&event.row, e)?;
                    continue;
                }
            };
            match (session, event.op) {
                (SessionType::Native, op) => {
                    let delta = match op {
                        Operation::Insert => Delta::insert(row),
                        Operation::Delete => Delta::delete(row),
                    };
                    match self.table.apply(&delta, ctx.time()) {
                        Ok(Some(visible)) => output.push(visible),
                        Ok(None) => {}
                        Err(e) => ctx.report(Some(&delta.data), e)?,
                    }
                }
                (SessionType::Upsert, Operation::Insert) => {
                    output.extend(self.table.upsert(row));
                }
                (SessionType::Upsert, Operation::Delete) => match self.table.remove(row.key()) {
                    Some(removed) => output.push(removed),
                    None => {
                        let err =
                            Error::inconsistent_diff(row.key(), ctx.time(), "delete of absent row");
                        ctx.report(Some(&row), err)?;
                    }
                },
            }
        }
        Ok(output)
    }
}
