//! Time & commit coordination.
//!
//! The [`Coordinator`] groups pushed rows into commits and assigns each commit the
//! next timestamp. A commit goes through
//!
//! ```text
//! Idle -> Collecting -> Assigning(t) -> Propagating(t) -> Idle
//! ```
//!
//! and the published clock only moves once the commit is fully propagated, so readers
//! of a [`ClockHandle`] never observe a partially applied commit.

use ripple_core::{Error, Offset, Result, Timestamp};
use ripple_incremental::{NodeId, SourceEvent};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Where the coordinator is in the commit cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitPhase {
    /// No pending rows.
    Idle,
    /// Rows are pending for the next commit.
    Collecting,
    /// A timestamp was assigned to the pending batch.
    Assigning(Timestamp),
    /// The batch is being evaluated.
    Propagating(Timestamp),
}

/// Read-only view of the last completed commit.
#[derive(Clone, Debug)]
pub struct ClockHandle {
    published: Arc<AtomicU64>,
}

impl ClockHandle {
    /// Returns the last fully propagated commit, or [`Timestamp::ZERO`].
    #[inline]
    pub fn now(&self) -> Timestamp {
        Timestamp(self.published.load(Ordering::Acquire))
    }
}

/// Requests a stop from another thread. Honored at the next commit boundary.
#[derive(Clone, Debug, Default)]
pub struct ShutdownHandle {
    requested: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn request(&self) {
        self.requested.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }
}

/// Rows and offsets of one commit.
#[derive(Debug, Default)]
pub struct Batch {
    pub events: BTreeMap<NodeId, Vec<SourceEvent>>,
    /// Per source, the offset of the last pushed event.
    pub offsets: BTreeMap<String, Offset>,
    len: usize,
}

impl Batch {
    /// Number of pending events.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Assigns timestamps and tracks the commit cycle of one computation.
#[derive(Debug)]
pub struct Coordinator {
    phase: CommitPhase,
    batch: Batch,
    /// Last assigned timestamp. Never reused, even by a failed commit.
    assigned: Timestamp,
    published: Arc<AtomicU64>,
    shutdown: ShutdownHandle,
    max_batch_events: Option<usize>,
}

impl Coordinator {
    /// Creates a coordinator that has committed nothing yet.
    pub fn new(max_batch_events: Option<usize>) -> Self {
        Self {
            phase: CommitPhase::Idle,
            batch: Batch::default(),
            assigned: Timestamp::ZERO,
            published: Arc::new(AtomicU64::new(0)),
            shutdown: ShutdownHandle::default(),
            max_batch_events,
        }
    }

    #[inline]
    pub fn phase(&self) -> CommitPhase {
        self.phase
    }

    /// Returns the last fully propagated commit.
    #[inline]
    pub fn now(&self) -> Timestamp {
        Timestamp(self.published.load(Ordering::Acquire))
    }

    pub fn clock(&self) -> ClockHandle {
        ClockHandle {
            published: Arc::clone(&self.published),
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    #[inline]
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.is_requested()
    }

    /// Returns the rows collected so far.
    pub fn pending(&self) -> &Batch {
        &self.batch
    }

    fn check_accepting(&self) -> Result<()> {
        match self.phase {
            CommitPhase::Idle | CommitPhase::Collecting => Ok(()),
            phase => Err(Error::coordinator(format!("a commit is in progress: {phase:?}"))),
        }
    }

    /// Adds an event to the pending batch. Returns true when the batch reached
    /// the configured size and should be committed.
    pub fn push(
        &mut self,
        source: NodeId,
        name: &str,
        event: SourceEvent,
        offset: Option<Offset>,
    ) -> Result<bool> {
        self.check_accepting()?;
        self.batch.events.entry(source).or_default().push(event);
        self.batch.len += 1;
        if let Some(offset) = offset {
            self.batch.offsets.insert(name.to_string(), offset);
        }
        self.phase = CommitPhase::Collecting;
        Ok(self
            .max_batch_events
            .is_some_and(|max| self.batch.len >= max))
    }

    /// Records a source position without an event, e.g. after skipped input.
    pub fn advance_offset(&mut self, name: &str, offset: Offset) -> Result<()> {
        self.check_accepting()?;
        self.batch.offsets.insert(name.to_string(), offset);
        Ok(())
    }

    /// Assigns the next timestamp. Only valid while collecting.
    pub fn next_timestamp(&mut self) -> Result<Timestamp> {
        if self.phase != CommitPhase::Collecting {
            return Err(Error::coordinator(format!(
                "cannot assign a timestamp while {:?}",
                self.phase
            )));
        }
        let time = self.assigned.next();
        self.assigned = time;
        self.phase = CommitPhase::Assigning(time);
        Ok(time)
    }

    /// Cuts the pending batch into a commit and starts propagating it.
    ///
    /// Returns `None` when nothing is pending; no timestamp is consumed then.
    pub fn begin(&mut self) -> Result<Option<(Timestamp, Batch)>> {
        self.check_accepting()?;
        if self.batch.is_empty() {
            return Ok(None);
        }
        let time = self.next_timestamp()?;
        self.phase = CommitPhase::Propagating(time);
        Ok(Some((time, std::mem::take(&mut self.batch))))
    }

    /// Takes offsets recorded without events, which need no commit.
    pub fn take_idle_offsets(&mut self) -> BTreeMap<String, Offset> {
        if self.batch.is_empty() {
            self.phase = CommitPhase::Idle;
            std::mem::take(&mut self.batch.offsets)
        } else {
            BTreeMap::new()
        }
    }

    /// Publishes a fully propagated commit.
    pub fn finish(&mut self, time: Timestamp) -> Result<()> {
        if self.phase != CommitPhase::Propagating(time) {
            return Err(Error::coordinator(format!(
                "cannot finish commit {time} while {:?}",
                self.phase
            )));
        }
        self.published.store(time.value(), Ordering::Release);
        self.phase = CommitPhase::Idle;
        Ok(())
    }

    /// Abandons a commit that failed to propagate. Its timestamp stays consumed.
    pub fn abort(&mut self, time: Timestamp) {
        if self.phase == CommitPhase::Propagating(time) {
            self.phase = CommitPhase::Idle;
        }
    }

    /// Resumes the clock after recovery from a snapshot taken at `time`.
    pub fn restore(&mut self, time: Timestamp) -> Result<()> {
        if self.phase != CommitPhase::Idle || self.assigned != Timestamp::ZERO {
            return Err(Error::coordinator(
                "the clock can only be restored before the first commit",
            ));
        }
        self.assigned = time;
        self.published.store(time.value(), Ordering::Release);
        Ok(())
    }
}
