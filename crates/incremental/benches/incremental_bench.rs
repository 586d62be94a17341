//! Benchmarks for ripple-incremental operators.
//!
//! Target: a single-row update through a stateful operator < 100μs

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ripple_core::{Row, Schema, Timestamp, Value};
use ripple_incremental::operators::{JoinSpec, JoinState, ReduceState};
use ripple_incremental::{
    consolidate_rows, filter_incremental, Delta, ErrorPolicy, Evaluator, EvaluatorConfig,
    GraphBuilder, JoinType, OpContext, Reducer, SourceEvent,
};
use std::collections::BTreeMap;
use std::sync::Arc;

fn make_row(id: u64, group: i64) -> Row {
    Row::new(id, vec![Value::Int64(group), Value::Int64(id as i64)])
}

fn ctx() -> OpContext {
    OpContext::new("bench", Timestamp(1), ErrorPolicy::Fail)
}

fn bench_consolidate(c: &mut Criterion) {
    let mut group = c.benchmark_group("consolidate");
    for size in [10, 100, 1000] {
        let deltas: Vec<Delta<Row>> = (0..size)
            .flat_map(|i| {
                let row = make_row(i as u64 % 50, 0);
                [Delta::insert(row.clone()), Delta::delete(row), Delta::insert(make_row(i as u64, 1))]
            })
            .collect();
        group.bench_with_input(BenchmarkId::new("rows", size), &deltas, |b, deltas| {
            b.iter(|| {
                let mut batch = deltas.clone();
                consolidate_rows(&mut batch);
                black_box(batch)
            })
        });
    }
    group.finish();
}

fn bench_filter(c: &mut Criterion) {
    let mut group = c.benchmark_group("filter");
    for size in [1, 100, 1000] {
        let deltas: Vec<Delta<Row>> = (0..size).map(|i| Delta::insert(make_row(i, 0))).collect();
        group.bench_with_input(BenchmarkId::new("id_gt_50", size), &deltas, |b, deltas| {
            b.iter(|| {
                filter_incremental(
                    black_box(deltas),
                    |row: &Row| Ok(row.get(1).and_then(Value::as_i64).unwrap_or(0) > 50),
                    &mut ctx(),
                )
            })
        });
    }
    group.finish();
}

fn bench_join_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("join");
    for size in [100, 1000, 10000] {
        let spec = JoinSpec {
            left_on: &[0],
            right_on: &[0],
            join_type: JoinType::Inner,
            left_arity: 2,
            right_arity: 2,
        };
        let mut state = JoinState::new();
        let left: Vec<Delta<Row>> = (0..size).map(|i| Delta::insert(make_row(i, (i % 100) as i64))).collect();
        let right: Vec<Delta<Row>> = (0..100).map(|i| Delta::insert(make_row(size + i, i as i64))).collect();
        let _ = state.process(&left, &right, spec, &ctx());

        group.bench_function(BenchmarkId::new("single_row_update", size), |b| {
            let row = make_row(size * 2, 7);
            b.iter(|| {
                let _ = state.process(&[Delta::insert(row.clone())], &[], spec, &ctx());
                let _ = state.process(&[Delta::delete(row.clone())], &[], spec, &ctx());
            })
        });
    }
    group.finish();
}

fn bench_reduce_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("reduce");
    let reducers = [Reducer::Count, Reducer::Sum(1), Reducer::Max(1)];
    for size in [100, 1000, 10000] {
        let mut state = ReduceState::new();
        let input: Vec<Delta<Row>> = (0..size).map(|i| Delta::insert(make_row(i, (i % 10) as i64))).collect();
        let _ = state.process(&input, &[0], &reducers, &mut ctx());

        group.bench_function(BenchmarkId::new("single_row_update", size), |b| {
            let row = make_row(size * 2, 3);
            b.iter(|| {
                let _ = state.process(&[Delta::insert(row.clone())], &[0], &reducers, &mut ctx());
                let _ = state.process(&[Delta::delete(row.clone())], &[0], &reducers, &mut ctx());
            })
        });
    }
    group.finish();
}

fn bench_evaluator_commit(c: &mut Criterion) {
    let mut builder = GraphBuilder::new();
    let orders = builder.source("orders", Schema::untyped(["customer", "amount"]));
    let customers = builder.source("customers", Schema::untyped(["customer", "region"]));
    let joined = builder.join(orders, customers, vec![0], vec![0], JoinType::Inner);
    let totals = builder.reduce(joined, vec![3], vec![Reducer::Sum(1), Reducer::Count]);
    builder.output(totals, "totals");
    let graph = match builder.build() {
        Ok(graph) => Arc::new(graph),
        Err(e) => panic!("bench graph: {e}"),
    };

    let mut evaluator = match Evaluator::new(graph, EvaluatorConfig::default()) {
        Ok(evaluator) => evaluator,
        Err(e) => panic!("bench evaluator: {e}"),
    };
    let customer_rows: Vec<SourceEvent> = (0..100u64)
        .map(|i| SourceEvent::insert(Row::new(i, vec![Value::Int64(i as i64), Value::Int64((i % 5) as i64)])))
        .collect();
    let order_rows: Vec<SourceEvent> = (0..5000u64)
        .map(|i| SourceEvent::insert(Row::new(1000 + i, vec![Value::Int64((i % 100) as i64), Value::Int64(10)])))
        .collect();
    let mut time = Timestamp(1);
    let _ = evaluator.process(time, BTreeMap::from([(customers, customer_rows), (orders, order_rows)]));

    c.bench_function("evaluator/single_order_commit", |b| {
        let row = Row::new(1_000_000, vec![Value::Int64(42), Value::Int64(99)]);
        b.iter(|| {
            time = time.next();
            let _ = evaluator.process(time, BTreeMap::from([(orders, vec![SourceEvent::insert(row.clone())])]));
            time = time.next();
            let _ = evaluator.process(time, BTreeMap::from([(orders, vec![SourceEvent::delete(row.clone())])]));
        })
    });
}

criterion_group!(
    benches,
    bench_consolidate,
    bench_filter,
    bench_join_update,
    bench_reduce_update,
    bench_evaluator_commit,
);
criterion_main!(benches);
