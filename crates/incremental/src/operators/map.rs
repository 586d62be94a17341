//! Incremental map, project, flat-map and reindex operators.

use crate::delta::Delta;
use crate::operators::OpContext;
use ripple_core::{Error, Key, Result, Row, TransformError, Value};

/// Applies a mapper function to a batch of deltas.
///
/// Each row keeps its identity; only its values are replaced. Diffs are preserved.
pub fn map_incremental<F>(
    input: &[Delta<Row>],
    arity: usize,
    mapper: F,
    ctx: &mut OpContext,
) -> Result<Vec<Delta<Row>>>
where
    F: Fn(&Row) -> std::result::Result<Vec<Value>, TransformError>,
{
    let mut output = Vec::with_capacity(input.len());
    for d in input {
        match mapper(&d.data) {
            Ok(values) if values.len() == arity => {
                output.push(Delta::new(Row::new(d.data.key(), values), d.diff));
            }
            Ok(values) => {
                let err = Error::data(
                    ctx.operator(),
                    ctx.time(),
                    Some(d.data.clone()),
                    format!("mapper produced {} values, expected {arity}", values.len()),
                );
                ctx.report(Some(&d.data), err)?;
            }
            Err(e) => ctx.report_transform(&d.data, e)?,
        }
    }
    Ok(output)
}

/// Projects specific columns from row deltas.
pub fn project_incremental(input: &[Delta<Row>], columns: &[usize]) -> Vec<Delta<Row>> {
    input
        .iter()
        .map(|d| Delta::new(Row::new(d.data.key(), d.data.project(columns)), d.diff))
        .collect()
}

/// Applies a one-to-many mapper. The `i`-th row produced from a parent gets the
/// identity `Key::child(parent, i)`, so retracting the parent retracts exactly the
/// rows it produced.
pub fn flat_map_incremental<F>(
    input: &[Delta<Row>],
    arity: usize,
    mapper: F,
    ctx: &mut OpContext,
) -> Result<Vec<Delta<Row>>>
where
    F: Fn(&Row) -> std::result::Result<Vec<Vec<Value>>, TransformError>,
{
    let mut output = Vec::new();
    for d in input {
        let produced = match mapper(&d.data) {
            Ok(rows) => rows,
            Err(e) => {
                ctx.report_transform(&d.data, e)?;
                continue;
            }
        };
        if let Some(bad) = produced.iter().find(|values| values.len() != arity) {
            let err = Error::data(
                ctx.operator(),
                ctx.time(),
                Some(d.data.clone()),
                format!("mapper produced {} values, expected {arity}", bad.len()),
            );
            ctx.report(Some(&d.data), err)?;
            continue;
        }
        for (i, values) in produced.into_iter().enumerate() {
            output.push(Delta::new(Row::new(Key::child(d.data.key(), i), values), d.diff));
        }
    }
    Ok(output)
}

/// Re-derives identities from the given columns, keeping values.
pub fn reindex_incremental(input: &[Delta<Row>], columns: &[usize]) -> Vec<Delta<Row>> {
    input
        .iter()
        .map(|d| {
            let key = Key::for_values(&d.data.project(columns));
            Delta::new(d.data.rekeyed(key), d.diff)
        })
        .collect()
}
