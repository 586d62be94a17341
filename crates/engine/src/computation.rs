//! A running computation: graph, operator state, clock, sinks and snapshots.

use crate::config::EngineConfig;
use crate::coordinator::{ClockHandle, Coordinator, ShutdownHandle};
use crate::sink::{ErrorSink, OutputSink};
use ripple_core::{DataError, Error, Offset, Result, Row, Timestamp};
use ripple_incremental::{CommitOutput, Evaluator, Graph, NodeId, OperatorSlot, SourceEvent};
use ripple_storage::{blob, Checkpointer, RecoveryMode, SnapshotStore};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

type DynCheckpointer = Checkpointer<Box<dyn SnapshotStore>>;

/// Owns everything needed to evaluate commits against one graph.
///
/// Rows pushed into sources are collected until [`commit`](Self::commit) (or the
/// configured batch size) cuts a commit. Each commit is evaluated as a whole, then
/// handed to the sinks of every output, then published on the clock.
///
/// # Example
///
/// ```rust
/// use ripple_core::{Row, Schema, Timestamp, Value};
/// use ripple_engine::{CollectingSink, Computation, EngineConfig};
/// use ripple_incremental::{Delta, GraphBuilder};
///
/// let mut builder = GraphBuilder::new();
/// let readings = builder.source("readings", Schema::untyped(["value"]));
/// builder.output(readings, "out");
///
/// let mut computation = Computation::new(builder.build().unwrap(), EngineConfig::default()).unwrap();
/// let sink = CollectingSink::new();
/// computation.subscribe("out", sink.clone()).unwrap();
///
/// let row = Row::new(1, vec![Value::Int64(8)]);
/// computation.insert("readings", row.clone()).unwrap();
/// assert_eq!(computation.commit().unwrap(), Some(Timestamp(1)));
/// assert_eq!(sink.at(Timestamp(1)), vec![Delta::insert(row)]);
/// ```
pub struct Computation {
    graph: Arc<Graph>,
    config: EngineConfig,
    evaluator: Evaluator,
    coordinator: Coordinator,
    sinks: Vec<(String, Box<dyn OutputSink>)>,
    error_sink: Option<Box<dyn ErrorSink>>,
    error_log: Vec<DataError>,
    checkpointer: Option<DynCheckpointer>,
    /// Per source, the offset consumed up to the last commit.
    offsets: BTreeMap<String, Offset>,
    since_snapshot: u64,
    last_snapshot: Timestamp,
    resumed_from: Option<Timestamp>,
    failed: bool,
    finished: bool,
}

impl Computation {
    /// Creates a computation without persistence.
    pub fn new(graph: Graph, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let graph = Arc::new(graph);
        let evaluator = Evaluator::new(Arc::clone(&graph), config.evaluator())?;
        let coordinator = Coordinator::new(config.commit.max_batch_events);
        Ok(Self {
            graph,
            config,
            evaluator,
            coordinator,
            sinks: Vec::new(),
            error_sink: None,
            error_log: Vec::new(),
            checkpointer: None,
            offsets: BTreeMap::new(),
            since_snapshot: 0,
            last_snapshot: Timestamp::ZERO,
            resumed_from: None,
            failed: false,
            finished: false,
        })
    }

    /// Creates a computation that snapshots into `store`, resuming from it as
    /// `config.persistence.recovery` says.
    pub fn with_store<S>(graph: Graph, config: EngineConfig, store: S) -> Result<Self>
    where
        S: SnapshotStore + 'static,
    {
        let mut computation = Self::new(graph, config)?;
        let store: Box<dyn SnapshotStore> = Box::new(store);
        computation.checkpointer = Some(Checkpointer::open(
            store,
            computation.graph.fingerprint(),
            computation.graph.len(),
            computation.config.persistence.retained_snapshots,
        )?);
        computation.recover()?;
        Ok(computation)
    }

    fn recover(&mut self) -> Result<()> {
        let mode = self.config.persistence.recovery;
        let Some(checkpointer) = self.checkpointer.as_mut() else {
            return Ok(());
        };
        let Some(snapshot) = checkpointer.load(mode)? else {
            if mode == RecoveryMode::Rebuild {
                checkpointer.truncate_after(Timestamp::ZERO)?;
            }
            info!(?mode, "starting from an empty state");
            return Ok(());
        };
        let slots = snapshot
            .blobs
            .iter()
            .map(|bytes| blob::decode::<OperatorSlot>(bytes))
            .collect::<Result<Vec<_>>>()?;
        self.evaluator.restore(slots, snapshot.time)?;
        self.coordinator.restore(snapshot.time)?;
        checkpointer.truncate_after(snapshot.time)?;
        info!(
            time = %snapshot.time,
            sources = snapshot.offsets.len(),
            "resumed from snapshot"
        );
        self.offsets = snapshot.offsets;
        self.last_snapshot = snapshot.time;
        self.resumed_from = Some(snapshot.time);
        Ok(())
    }

    #[inline]
    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    #[inline]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns the last fully processed commit.
    #[inline]
    pub fn last_time(&self) -> Timestamp {
        self.coordinator.now()
    }

    /// Returns a handle that reads the commit clock from other threads.
    pub fn clock(&self) -> ClockHandle {
        self.coordinator.clock()
    }

    /// Returns a handle that stops a [`Runner`](crate::Runner) at the next commit boundary.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.coordinator.shutdown_handle()
    }

    /// Returns the snapshot time this computation resumed from, if any.
    #[inline]
    pub fn resumed_from(&self) -> Option<Timestamp> {
        self.resumed_from
    }

    /// Returns the committed offset of a source.
    pub fn offset(&self, source: &str) -> Option<&Offset> {
        self.offsets.get(source)
    }

    /// Returns the committed offsets of every source.
    pub fn offsets(&self) -> &BTreeMap<String, Offset> {
        &self.offsets
    }

    /// Returns every data error routed so far.
    pub fn error_log(&self) -> &[DataError] {
        &self.error_log
    }

    /// Returns true once a commit failed; no further commit is accepted.
    #[inline]
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Returns the snapshot catalog, when persistence is enabled.
    pub fn checkpointer(&self) -> Option<&Checkpointer<Box<dyn SnapshotStore>>> {
        self.checkpointer.as_ref()
    }

    /// Attaches a sink to a named output.
    pub fn subscribe(&mut self, output: &str, sink: impl OutputSink + 'static) -> Result<()> {
        if self.graph.output(output).is_none() {
            return Err(Error::UnknownNode(output.to_string()));
        }
        self.sinks.push((output.to_string(), Box::new(sink)));
        Ok(())
    }

    /// Sets where routed data errors are delivered.
    pub fn set_error_sink(&mut self, sink: impl ErrorSink + 'static) {
        self.error_sink = Some(Box::new(sink));
    }

    fn source_id(&self, source: &str) -> Result<NodeId> {
        self.graph
            .source(source)
            .ok_or_else(|| Error::UnknownNode(source.to_string()))
    }

    /// Checks that `source` names a source of the graph.
    pub fn has_source(&self, source: &str) -> bool {
        self.graph.source(source).is_some()
    }

    fn check_usable(&self) -> Result<()> {
        if self.failed {
            return Err(Error::coordinator("computation failed at an earlier commit"));
        }
        if self.finished {
            return Err(Error::coordinator("computation already finished"));
        }
        Ok(())
    }

    /// Pushes an event into a source.
    ///
    /// Returns the commit time when the push filled the batch and cut a commit.
    pub fn push(&mut self, source: &str, event: SourceEvent) -> Result<Option<Timestamp>> {
        self.push_event(source, event, None)
    }

    /// Pushes an event read at `offset` of the source's input.
    pub fn push_with_offset(
        &mut self,
        source: &str,
        event: SourceEvent,
        offset: Offset,
    ) -> Result<Option<Timestamp>> {
        self.push_event(source, event, Some(offset))
    }

    fn push_event(
        &mut self,
        source: &str,
        event: SourceEvent,
        offset: Option<Offset>,
    ) -> Result<Option<Timestamp>> {
        self.check_usable()?;
        let id = self.source_id(source)?;
        if self.coordinator.push(id, source, event, offset)? {
            return self.commit();
        }
        Ok(None)
    }

    /// Adds an event read at `offset` to the pending batch without cutting a
    /// commit, whatever the batch size.
    pub(crate) fn stage(
        &mut self,
        source: &str,
        event: SourceEvent,
        offset: Offset,
    ) -> Result<()> {
        self.check_usable()?;
        let id = self.source_id(source)?;
        self.coordinator.push(id, source, event, Some(offset))?;
        Ok(())
    }

    pub fn insert(&mut self, source: &str, row: Row) -> Result<Option<Timestamp>> {
        self.push(source, SourceEvent::insert(row))
    }

    pub fn delete(&mut self, source: &str, row: Row) -> Result<Option<Timestamp>> {
        self.push(source, SourceEvent::delete(row))
    }

    /// Records that a source consumed input up to `offset` without producing rows.
    pub fn advance_offset(&mut self, source: &str, offset: Offset) -> Result<()> {
        self.check_usable()?;
        self.source_id(source)?;
        self.coordinator.advance_offset(source, offset)
    }

    /// Commits the pending rows.
    ///
    /// Returns the assigned time, or `None` when nothing was pending. A failed commit
    /// leaves the computation failed; its sinks never see any part of it.
    pub fn commit(&mut self) -> Result<Option<Timestamp>> {
        self.check_usable()?;
        let Some((time, batch)) = self.coordinator.begin()? else {
            let idle = self.coordinator.take_idle_offsets();
            self.offsets.extend(idle);
            return Ok(None);
        };
        debug!(time = %time, events = batch.len(), "commit started");

        let output = match self.evaluator.process(time, batch.events) {
            Ok(output) => output,
            Err(e) => return Err(self.fail(time, e)),
        };
        if let Err(e) = self.deliver(output) {
            return Err(self.fail(time, e));
        }
        self.offsets.extend(batch.offsets);
        self.coordinator.finish(time)?;
        debug!(time = %time, "commit finished");

        self.since_snapshot += 1;
        let interval = self.config.persistence.snapshot_interval;
        if interval > 0 && self.since_snapshot >= interval {
            self.snapshot()?;
        }
        Ok(Some(time))
    }

    fn fail(&mut self, time: Timestamp, e: Error) -> Error {
        error!(time = %time, kind = ?e.kind(), error = %e, "commit aborted");
        self.coordinator.abort(time);
        self.failed = true;
        e
    }

    fn deliver(&mut self, output: CommitOutput) -> Result<()> {
        let CommitOutput {
            time,
            outputs,
            errors,
        } = output;
        for (name, sink) in &mut self.sinks {
            let changes = outputs.get(name).map(Vec::as_slice).unwrap_or_default();
            sink.on_commit(time, changes)?;
        }
        if !errors.is_empty() {
            warn!(time = %time, count = errors.len(), "commit routed data errors");
            if let Some(sink) = self.error_sink.as_mut() {
                sink.on_errors(time, &errors)?;
            }
            self.error_log.extend(errors);
        }
        Ok(())
    }

    /// Writes a snapshot of the last commit.
    ///
    /// Returns false when persistence is disabled or that commit is already
    /// snapshotted.
    pub fn snapshot(&mut self) -> Result<bool> {
        if self.failed {
            return Err(Error::persistence("cannot snapshot a failed computation"));
        }
        let time = self.coordinator.now();
        if self.checkpointer.is_none() || time == Timestamp::ZERO || time == self.last_snapshot {
            return Ok(false);
        }
        let blobs = (0..self.graph.len())
            .map(|id| blob::encode(&*self.evaluator.slot(id)))
            .collect::<Result<Vec<_>>>()?;
        if let Some(checkpointer) = self.checkpointer.as_mut() {
            checkpointer.write(time, self.offsets.clone(), &blobs)?;
        }
        self.last_snapshot = time;
        self.since_snapshot = 0;
        Ok(true)
    }

    /// Commits what is pending, writes a final snapshot and notifies every sink
    /// that the run is over.
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.commit()?;
        self.snapshot()?;
        for (_, sink) in &mut self.sinks {
            sink.on_end()?;
        }
        self.finished = true;
        info!(time = %self.coordinator.now(), "computation finished");
        Ok(())
    }

    /// Names of the sources, in name order.
    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.graph.sources().keys().map(String::as_str)
    }
}

impl std::fmt::Debug for Computation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Computation")
            .field("evaluator", &self.evaluator)
            .field("coordinator", &self.coordinator)
            .field("sinks", &self.sinks.len())
            .field("persistent", &self.checkpointer.is_some())
            .field("offsets", &self.offsets)
            .field("failed", &self.failed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::CollectingSink;
    use ripple_core::{ErrorKind, Schema, TransformError, Value};
    use ripple_incremental::{Delta, ErrorPolicy, GraphBuilder};
    use ripple_storage::MemoryStore;

    fn row(id: u64, v: i64) -> Row {
        Row::new(id, vec![Value::Int64(v)])
    }

    fn passthrough() -> Graph {
        let mut b = GraphBuilder::new();
        let src = b.source("readings", Schema::untyped(["value"]));
        b.output(src, "out");
        b.build().unwrap()
    }

    fn checked() -> Graph {
        let mut b = GraphBuilder::new();
        let src = b.source("readings", Schema::untyped(["value"]));
        let checked = b.map(src, 1, |row: &Row| {
            match row.get(0).and_then(Value::as_i64) {
                Some(v) if v >= 0 => Ok(vec![Value::Int64(v)]),
                _ => Err(TransformError::new("negative reading")),
            }
        });
        b.output(checked, "out");
        b.build().unwrap()
    }

    #[test]
    fn test_commit_delivers_once_per_sink() {
        let mut c = Computation::new(passthrough(), EngineConfig::default()).unwrap();
        let a = CollectingSink::new();
        let b = CollectingSink::new();
        c.subscribe("out", a.clone()).unwrap();
        c.subscribe("out", b.clone()).unwrap();
        assert!(c.subscribe("missing", CollectingSink::new()).is_err());

        assert_eq!(c.commit().unwrap(), None);
        c.insert("readings", row(1, 8)).unwrap();
        assert_eq!(c.commit().unwrap(), Some(Timestamp(1)));
        c.delete("readings", row(1, 8)).unwrap();
        c.insert("readings", row(1, 8)).unwrap();
        // cancels out, still delivered as an empty commit
        assert_eq!(c.commit().unwrap(), Some(Timestamp(2)));

        for sink in [a, b] {
            assert_eq!(sink.commits(), vec![Timestamp(1), Timestamp(2)]);
            assert_eq!(sink.updates(), vec![Delta::insert(row(1, 8)).at(Timestamp(1))]);
        }
        assert_eq!(c.last_time(), Timestamp(2));
    }

    #[test]
    fn test_unknown_source() {
        let mut c = Computation::new(passthrough(), EngineConfig::default()).unwrap();
        let err = c.insert("nope", row(1, 1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Construction);
        assert!(c.has_source("readings"));
        assert_eq!(c.sources().collect::<Vec<_>>(), vec!["readings"]);
    }

    #[test]
    fn test_batch_size_cuts_commits() {
        let config = EngineConfig::default().with_max_batch_events(2);
        let mut c = Computation::new(passthrough(), config).unwrap();
        assert_eq!(c.insert("readings", row(1, 1)).unwrap(), None);
        assert_eq!(c.insert("readings", row(2, 2)).unwrap(), Some(Timestamp(1)));
        assert_eq!(c.insert("readings", row(3, 3)).unwrap(), None);
        assert_eq!(c.last_time(), Timestamp(1));
    }

    #[test]
    fn test_failed_commit_is_not_delivered() {
        let mut c = Computation::new(checked(), EngineConfig::default()).unwrap();
        let sink = CollectingSink::new();
        c.subscribe("out", sink.clone()).unwrap();
        c.insert("readings", row(1, 5)).unwrap();
        c.insert("readings", row(2, -5)).unwrap();
        let err = c.commit().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Data);
        assert!(c.is_failed());
        assert!(sink.commits().is_empty());
        assert_eq!(c.last_time(), Timestamp::ZERO);
        assert!(c.insert("readings", row(3, 1)).is_err());
    }

    #[test]
    fn test_routed_errors_reach_error_sink() {
        let config = EngineConfig::default().with_error_policy(ErrorPolicy::Route);
        let mut c = Computation::new(checked(), config).unwrap();
        let out = CollectingSink::new();
        let errors = CollectingSink::new();
        c.subscribe("out", out.clone()).unwrap();
        c.set_error_sink(errors.clone());
        c.insert("readings", row(1, 5)).unwrap();
        c.insert("readings", row(2, -5)).unwrap();
        c.commit().unwrap();

        assert_eq!(out.at(Timestamp(1)).len(), 1);
        assert_eq!(errors.errors().len(), 1);
        assert_eq!(c.error_log().len(), 1);
        assert_eq!(c.error_log()[0].row, Some(row(2, -5)));
    }

    #[test]
    fn test_snapshot_interval() {
        let store = MemoryStore::new();
        let config = EngineConfig::default().with_snapshot_interval(2);
        let mut c = Computation::with_store(passthrough(), config.clone(), store).unwrap();
        for (i, v) in [3, 4, 5].into_iter().enumerate() {
            c.push_with_offset(
                "readings",
                SourceEvent::insert(row(i as u64, v)),
                Offset::Position(i as u64 + 1),
            )
            .unwrap();
            c.commit().unwrap();
        }
        let manifest = c.checkpointer().unwrap().manifest();
        assert_eq!(manifest.latest().map(|s| s.time), Some(Timestamp(2)));
        assert_eq!(c.offset("readings"), Some(&Offset::Position(3)));
    }

    #[test]
    fn test_finish_snapshots_and_ends_sinks() {
        let dir = tempfile::tempdir().unwrap();
        let store = ripple_storage::FileStore::open(dir.path()).unwrap();
        let mut c = Computation::with_store(passthrough(), EngineConfig::default(), store).unwrap();
        let sink = CollectingSink::new();
        c.subscribe("out", sink.clone()).unwrap();
        c.insert("readings", row(1, 8)).unwrap();
        c.finish().unwrap();
        assert!(sink.is_ended());
        assert!(c.insert("readings", row(2, 9)).is_err());

        let store = ripple_storage::FileStore::open(dir.path()).unwrap();
        let mut resumed =
            Computation::with_store(passthrough(), EngineConfig::default(), store).unwrap();
        assert_eq!(resumed.resumed_from(), Some(Timestamp(1)));
        assert_eq!(resumed.last_time(), Timestamp(1));
        let sink = CollectingSink::new();
        resumed.subscribe("out", sink.clone()).unwrap();
        // restored state knows row 1
        resumed.delete("readings", row(1, 8)).unwrap();
        assert_eq!(resumed.commit().unwrap(), Some(Timestamp(2)));
        assert_eq!(sink.at(Timestamp(2)), vec![Delta::delete(row(1, 8))]);
    }

    #[test]
    fn test_without_store_snapshot_is_noop() {
        let mut c = Computation::new(passthrough(), EngineConfig::default()).unwrap();
        c.insert("readings", row(1, 8)).unwrap();
        c.commit().unwrap();
        assert!(!c.snapshot().unwrap());
        assert!(c.checkpointer().is_none());
    }
}
