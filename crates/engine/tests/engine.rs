//! End-to-end tests: readers, commits, sinks, snapshots and recovery.

use ripple_core::{Error, ErrorKind, Offset, Result, Row, Schema, Timestamp, Value};
use ripple_engine::{
    CollectingSink, Computation, EngineConfig, ReadResult, Reader, RunOutcome, Runner,
    ShutdownHandle, VecReader,
};
use ripple_incremental::{Delta, Graph, GraphBuilder, JoinType, Reducer, SourceEvent, Update};
use ripple_storage::{FileStore, RecoveryMode, SnapshotStore};

fn reading(id: u64, sensor: &str, value: i64) -> Row {
    Row::new(id, vec![Value::from(sensor), Value::Int64(value)])
}

fn values(changes: &[Delta<Row>]) -> Vec<(Vec<Value>, i64)> {
    changes
        .iter()
        .map(|d| (d.data.values().to_vec(), d.diff))
        .collect()
}

/// readings(sensor, value) -> stats(sensor, count, sum, max), plus the raw rows.
fn sensor_graph() -> Graph {
    let mut b = GraphBuilder::new();
    let readings = b.source("readings", Schema::untyped(["sensor", "value"]));
    let valid = b.filter(readings, |row: &Row| {
        Ok(row.get(1).and_then(Value::as_i64).is_some_and(|v| v >= 0))
    });
    let stats = b.reduce(
        valid,
        vec![0],
        vec![Reducer::Count, Reducer::Sum(1), Reducer::Max(1)],
    );
    b.output(stats, "stats");
    b.output(readings, "raw");
    b.build().unwrap()
}

fn sensor_batches() -> Vec<Vec<SourceEvent>> {
    vec![
        vec![
            SourceEvent::insert(reading(1, "a", 5)),
            SourceEvent::insert(reading(2, "b", 3)),
        ],
        vec![SourceEvent::insert(reading(3, "a", 9))],
        vec![
            SourceEvent::delete(reading(1, "a", 5)),
            SourceEvent::insert(reading(4, "b", 7)),
        ],
        vec![SourceEvent::insert(reading(5, "a", 2))],
        vec![SourceEvent::delete(reading(3, "a", 9))],
        vec![
            SourceEvent::insert(reading(6, "c", 1)),
            SourceEvent::delete(reading(2, "b", 3)),
        ],
    ]
}

/// Fails like a dropped connection after a number of reads.
struct FailingReader {
    inner: VecReader,
    budget: usize,
}

impl Reader for FailingReader {
    fn read(&mut self) -> Result<ReadResult> {
        if self.budget == 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection lost",
            )));
        }
        self.budget -= 1;
        self.inner.read()
    }

    fn seek(&mut self, offset: &Offset) -> Result<()> {
        self.inner.seek(offset)
    }
}

/// Requests a shutdown once a number of entries were read.
struct StoppingReader {
    inner: VecReader,
    handle: ShutdownHandle,
    stop_after: usize,
}

impl Reader for StoppingReader {
    fn read(&mut self) -> Result<ReadResult> {
        let result = self.inner.read()?;
        if self.inner.position() >= self.stop_after {
            self.handle.request();
        }
        Ok(result)
    }

    fn seek(&mut self, offset: &Offset) -> Result<()> {
        self.inner.seek(offset)
    }
}

fn run_to_end(computation: Computation, reader: impl Reader + 'static) -> Vec<Update<Row>> {
    let mut computation = computation;
    let sink = CollectingSink::new();
    computation.subscribe("stats", sink.clone()).unwrap();
    let mut runner = Runner::new(computation);
    runner.add_reader("readings", reader).unwrap();
    runner.run().unwrap();
    sink.updates()
}

#[test]
fn test_update_example_stream() {
    let mut b = GraphBuilder::new();
    let events = b.source("events", Schema::untyped(["id", "value"]));
    let value = b.project(events, vec![1]);
    b.output(value, "values");
    let mut c = Computation::new(b.build().unwrap(), EngineConfig::default()).unwrap();
    let sink = CollectingSink::new();
    c.subscribe("values", sink.clone()).unwrap();

    let row = |v: i64| Row::new(1, vec![Value::Int64(1), Value::Int64(v)]);
    c.insert("events", row(8)).unwrap();
    assert_eq!(c.commit().unwrap(), Some(Timestamp(1)));
    c.delete("events", row(8)).unwrap();
    c.insert("events", row(10)).unwrap();
    assert_eq!(c.commit().unwrap(), Some(Timestamp(2)));

    assert_eq!(values(&sink.at(Timestamp(1))), vec![(vec![Value::Int64(8)], 1)]);
    assert_eq!(
        values(&sink.at(Timestamp(2))),
        vec![(vec![Value::Int64(8)], -1), (vec![Value::Int64(10)], 1)]
    );
}

#[test]
fn test_max_demotes_to_next_highest() {
    let mut b = GraphBuilder::new();
    let readings = b.source("readings", Schema::untyped(["sensor", "value"]));
    let peaks = b.reduce(readings, vec![0], vec![Reducer::Max(1)]);
    b.output(peaks, "peaks");
    let mut c = Computation::new(b.build().unwrap(), EngineConfig::default()).unwrap();
    let sink = CollectingSink::new();
    c.subscribe("peaks", sink.clone()).unwrap();

    for (id, v) in [(1, 3), (2, 8), (3, 5)] {
        c.insert("readings", reading(id, "a", v)).unwrap();
    }
    c.commit().unwrap();
    c.delete("readings", reading(2, "a", 8)).unwrap();
    c.commit().unwrap();

    let mut changes = values(&sink.at(Timestamp(2)));
    changes.sort_by_key(|(_, diff)| *diff);
    assert_eq!(
        changes,
        vec![
            (vec![Value::from("a"), Value::Int64(8)], -1),
            (vec![Value::from("a"), Value::Int64(5)], 1),
        ]
    );
}

#[test]
fn test_iteration_without_fixpoint_fails() {
    let mut b = GraphBuilder::new();
    let counters = b.source("counters", Schema::untyped(["n"]));
    let result = b
        .iterate(&[counters], &[], None, |inner, vars, _| {
            vec![inner.map(vars[0], 1, |row: &Row| {
                let n = row.get(0).and_then(Value::as_i64).unwrap_or(0);
                Ok(vec![Value::Int64(n + 1)])
            })]
        })
        .unwrap();
    b.output(result[0], "out");
    let config = EngineConfig::default().with_iteration_limit(16);
    let mut c = Computation::new(b.build().unwrap(), config).unwrap();

    c.insert("counters", Row::new(1, vec![Value::Int64(0)])).unwrap();
    let err = c.commit().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NonTermination);
    assert!(matches!(err, Error::IterationLimit { .. }));
    assert!(c.is_failed());
}

#[test]
fn test_resume_reproduces_output_stream() {
    let expected = run_to_end(
        Computation::new(sensor_graph(), EngineConfig::default()).unwrap(),
        VecReader::batches(sensor_batches()),
    );
    assert_eq!(expected.last().map(|u| u.time), Some(Timestamp(6)));

    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig::default().with_snapshot_interval(2);

    // crash while reading the fifth batch
    {
        let store = FileStore::open(dir.path()).unwrap();
        let mut computation =
            Computation::with_store(sensor_graph(), config.clone(), store).unwrap();
        let sink = CollectingSink::new();
        computation.subscribe("stats", sink.clone()).unwrap();
        let mut runner = Runner::new(computation);
        let reader = FailingReader {
            inner: VecReader::batches(sensor_batches()),
            budget: 11,
        };
        runner.add_reader("readings", reader).unwrap();
        let err = runner.run().unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(runner.computation().last_time(), Timestamp(4));
        let before: Vec<_> = expected.iter().filter(|u| u.time <= Timestamp(4)).cloned().collect();
        assert_eq!(sink.updates(), before);
    }

    let store = FileStore::open(dir.path()).unwrap();
    let computation = Computation::with_store(sensor_graph(), config.clone(), store).unwrap();
    assert_eq!(computation.resumed_from(), Some(Timestamp(4)));
    assert_eq!(computation.offset("readings"), Some(&Offset::Position(10)));
    let resumed = run_to_end(computation, VecReader::batches(sensor_batches()));
    let after: Vec<_> = expected.iter().filter(|u| u.time > Timestamp(4)).cloned().collect();
    assert_eq!(resumed, after);

    // replaying from scratch reproduces everything
    let store = FileStore::open(dir.path()).unwrap();
    let computation = Computation::with_store(
        sensor_graph(),
        config.with_recovery(RecoveryMode::Rebuild),
        store,
    )
    .unwrap();
    assert_eq!(computation.resumed_from(), None);
    let replayed = run_to_end(computation, VecReader::batches(sensor_batches()));
    assert_eq!(replayed, expected);
}

fn merged_graph() -> Graph {
    let mut b = GraphBuilder::new();
    let a = b.source("a", Schema::untyped(["v"]));
    let c = b.source("b", Schema::untyped(["v"]));
    let merged = b.concat(&[a, c]);
    b.output(merged, "out");
    b.build().unwrap()
}

fn numbers(batches: &[&[u64]]) -> VecReader {
    VecReader::batches(
        batches
            .iter()
            .map(|batch| {
                batch
                    .iter()
                    .map(|&n| SourceEvent::insert(Row::new(n, vec![Value::Int64(n as i64)])))
                    .collect()
            })
            .collect(),
    )
}

fn run_merged(computation: Computation) -> Vec<Update<Row>> {
    let mut computation = computation;
    let sink = CollectingSink::new();
    computation.subscribe("out", sink.clone()).unwrap();
    let mut runner = Runner::new(computation);
    runner.add_reader("a", numbers(&[&[1, 2], &[3]])).unwrap();
    runner.add_reader("b", numbers(&[&[11], &[12, 13]])).unwrap();
    runner.run().unwrap();
    sink.updates()
}

#[test]
fn test_commits_hold_one_batch_of_every_reader() {
    let updates = run_merged(Computation::new(merged_graph(), EngineConfig::default()).unwrap());
    let at = |t: u64| -> Vec<i64> {
        let mut ids: Vec<i64> = updates
            .iter()
            .filter(|u| u.time == Timestamp(t))
            .filter_map(|u| u.data.get(0).and_then(Value::as_i64))
            .collect();
        ids.sort_unstable();
        ids
    };
    assert_eq!(at(1), vec![1, 2, 11]);
    assert_eq!(at(2), vec![3, 12, 13]);
    assert!(at(3).is_empty());
}

#[test]
fn test_resume_with_two_readers_reproduces_tail() {
    let expected = run_merged(Computation::new(merged_graph(), EngineConfig::default()).unwrap());

    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig::default().with_snapshot_interval(1);
    {
        let store = FileStore::open(dir.path()).unwrap();
        run_merged(Computation::with_store(merged_graph(), config.clone(), store).unwrap());
    }

    let store = FileStore::open(dir.path()).unwrap();
    let computation =
        Computation::with_store(merged_graph(), config.with_recovery_at(Timestamp(1)), store)
            .unwrap();
    assert_eq!(computation.resumed_from(), Some(Timestamp(1)));
    assert_eq!(computation.offset("a"), Some(&Offset::Position(3)));
    assert_eq!(computation.offset("b"), Some(&Offset::Position(2)));
    let resumed = run_merged(computation);
    let tail: Vec<_> = expected.iter().filter(|u| u.time > Timestamp(1)).cloned().collect();
    assert!(!tail.is_empty());
    assert_eq!(resumed, tail);
}

#[test]
fn test_corrupted_snapshot_fails_loudly() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig::default().with_snapshot_interval(2);
    {
        let store = FileStore::open(dir.path()).unwrap();
        let computation = Computation::with_store(sensor_graph(), config.clone(), store).unwrap();
        run_to_end(computation, VecReader::batches(sensor_batches()));
    }

    let store = FileStore::open(dir.path()).unwrap();
    let manifest = store.read_manifest().unwrap().unwrap();
    let latest = manifest.latest().map(|s| s.time).unwrap();
    assert_eq!(latest, Timestamp(6));
    let path = store.blob_path(1, latest);
    let mut bytes = std::fs::read(&path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0x5a;
    std::fs::write(&path, bytes).unwrap();

    let err = Computation::with_store(sensor_graph(), config.clone(), store).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Recovery);

    // an explicitly chosen older snapshot still loads
    let store = FileStore::open(dir.path()).unwrap();
    let computation =
        Computation::with_store(sensor_graph(), config.with_recovery_at(Timestamp(4)), store)
            .unwrap();
    assert_eq!(computation.resumed_from(), Some(Timestamp(4)));
}

#[test]
fn test_snapshot_of_another_graph_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = FileStore::open(dir.path()).unwrap();
        let computation =
            Computation::with_store(sensor_graph(), EngineConfig::default(), store).unwrap();
        run_to_end(computation, VecReader::batches(sensor_batches()));
    }
    let mut b = GraphBuilder::new();
    let readings = b.source("readings", Schema::untyped(["sensor", "value"]));
    b.output(readings, "stats");
    let store = FileStore::open(dir.path()).unwrap();
    let err = Computation::with_store(b.build().unwrap(), EngineConfig::default(), store)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Recovery);
}

#[test]
fn test_shutdown_stops_at_commit_boundary() {
    let computation = Computation::new(sensor_graph(), EngineConfig::default()).unwrap();
    let handle = computation.shutdown_handle();
    let clock = computation.clock();
    let sink = CollectingSink::new();
    let mut runner = Runner::new(computation);
    runner.computation_mut().subscribe("raw", sink.clone()).unwrap();
    let batches = vec![
        vec![SourceEvent::insert(reading(1, "a", 1))],
        vec![SourceEvent::insert(reading(2, "a", 2))],
        vec![SourceEvent::insert(reading(3, "a", 3))],
        vec![SourceEvent::insert(reading(4, "a", 4))],
    ];
    let reader = StoppingReader {
        inner: VecReader::batches(batches),
        handle,
        stop_after: 3,
    };
    runner.add_reader("readings", reader).unwrap();

    let summary = runner.run().unwrap();
    assert_eq!(summary.outcome, RunOutcome::Stopped);
    assert_eq!(summary.commits, 2);
    assert_eq!(summary.last_time, Timestamp(2));
    assert_eq!(clock.now(), Timestamp(2));
    assert_eq!(sink.updates().len(), 2);
    assert!(sink.is_ended());
}

#[test]
fn test_worker_count_does_not_change_output() {
    fn orders_graph() -> Graph {
        let mut b = GraphBuilder::new();
        let orders = b.source("orders", Schema::untyped(["customer", "amount"]));
        let customers = b.source("customers", Schema::untyped(["id", "region"]));
        let joined = b.join(orders, customers, vec![0], vec![0], JoinType::Inner);
        let by_region = b.reduce(joined, vec![3], vec![Reducer::Sum(1), Reducer::Count]);
        let large = b.filter(orders, |row: &Row| {
            Ok(row.get(1).and_then(Value::as_i64).is_some_and(|v| v > 50))
        });
        b.output(by_region, "regions");
        b.output(large, "large");
        b.build().unwrap()
    }

    let run = |workers: usize| {
        let config = EngineConfig::default().with_workers(workers);
        let mut c = Computation::new(orders_graph(), config).unwrap();
        let regions = CollectingSink::new();
        let large = CollectingSink::new();
        c.subscribe("regions", regions.clone()).unwrap();
        c.subscribe("large", large.clone()).unwrap();
        for id in 0..20u64 {
            let region = if id % 3 == 0 { "north" } else { "south" };
            c.insert("customers", Row::new(id, vec![Value::Int64(id as i64), Value::from(region)]))
                .unwrap();
        }
        c.commit().unwrap();
        for id in 0..60u64 {
            let order = Row::new(
                100 + id,
                vec![Value::Int64((id % 20) as i64), Value::Int64((id * 7 % 100) as i64)],
            );
            c.insert("orders", order).unwrap();
            if id % 10 == 9 {
                c.commit().unwrap();
            }
        }
        c.delete("customers", Row::new(3, vec![Value::Int64(3), Value::from("north")]))
            .unwrap();
        c.commit().unwrap();
        (regions.updates(), large.updates())
    };

    assert_eq!(run(1), run(4));
}
