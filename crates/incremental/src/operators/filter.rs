//! Incremental filter operator.

use crate::delta::Delta;
use crate::operators::OpContext;
use ripple_core::{Result, Row, TransformError};

/// Applies a filter predicate to a batch of deltas.
///
/// Only deltas whose row satisfies the predicate are passed through; diffs are
/// preserved. A predicate failure is reported against the row, which is dropped when
/// the error is routed.
pub fn filter_incremental<F>(
    input: &[Delta<Row>],
    predicate: F,
    ctx: &mut OpContext,
) -> Result<Vec<Delta<Row>>>
where
    F: Fn(&Row) -> std::result::Result<bool, TransformError>,
{
    let mut output = Vec::with_capacity(input.len());
    for d in input {
        match predicate(&d.data) {
            Ok(true) => output.push(d.clone()),
            Ok(false) => {}
            Err(e) => ctx.report_transform(&d.data, e)?,
        }
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::ErrorPolicy;
    use crate::operators::test_context;
    use ripple_core::{Timestamp, Value};

    fn row(id: u64, v: i64) -> Row {
        Row::new(id, vec![Value::Int64(v)])
    }

    fn over_eight(r: &Row) -> std::result::Result<bool, TransformError> {
        Ok(r.get(0).and_then(Value::as_i64).unwrap_or(0) > 8)
    }

    #[test]
    fn test_filter_incremental_basic() {
        let deltas = vec![
            Delta::insert(row(1, 10)),
            Delta::insert(row(2, 5)),
            Delta::insert(row(3, 15)),
            Delta::delete(row(4, 20)),
        ];
        let filtered = filter_incremental(&deltas, over_eight, &mut test_context()).unwrap();
        assert_eq!(filtered.len(), 3);
        assert!(filtered.iter().all(|d| over_eight(&d.data).unwrap()));
    }

    #[test]
    fn test_filter_incremental_preserves_diff() {
        let deltas = vec![Delta::insert(row(1, 10)), Delta::new(row(2, 20), -2)];
        let filtered = filter_incremental(&deltas, over_eight, &mut test_context()).unwrap();
        assert!(filtered[0].is_insert());
        assert_eq!(filtered[1].diff, -2);
    }

    #[test]
    fn test_filter_incremental_empty() {
        let filtered = filter_incremental(&[], over_eight, &mut test_context()).unwrap();
        assert!(filtered.is_empty());
    }

    #[test]
    fn test_filter_incremental_routes_failures() {
        let deltas = vec![Delta::insert(row(1, 10)), Delta::insert(row(2, 0))];
        let mut ctx = OpContext::new("filter#1", Timestamp(1), ErrorPolicy::Route);
        let filtered = filter_incremental(
            &deltas,
            |r| match r.get(0).and_then(Value::as_i64) {
                Some(0) => Err(TransformError::new("zero")),
                _ => Ok(true),
            },
            &mut ctx,
        )
        .unwrap();
        assert_eq!(filtered, vec![Delta::insert(row(1, 10))]);
        assert_eq!(ctx.into_errors().len(), 1);
    }
}
