//! Input readers and the loop that drives them.

use crate::computation::Computation;
use ripple_core::{Error, Offset, Result, Timestamp};
use ripple_incremental::SourceEvent;
use tracing::{debug, info};

/// One step of a reader.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReadResult {
    /// An event and the position just after it.
    Data(SourceEvent, Offset),
    /// The input asks for a commit boundary here; the offset is the position
    /// just after the marker.
    Commit(Offset),
    /// No more input.
    Finished,
}

/// A source of events for one input table.
pub trait Reader: Send {
    /// Reads the next step.
    fn read(&mut self) -> Result<ReadResult>;

    /// Repositions so that the next read returns what follows `offset`.
    fn seek(&mut self, offset: &Offset) -> Result<()>;
}

/// Reads events from memory.
///
/// Offsets are [`Offset::Position`] counts of consumed entries, commit markers
/// included.
#[derive(Clone, Debug, Default)]
pub struct VecReader {
    /// `None` marks a commit boundary.
    entries: Vec<Option<SourceEvent>>,
    position: usize,
}

impl VecReader {
    /// Events without commit markers.
    pub fn new(events: Vec<SourceEvent>) -> Self {
        Self {
            entries: events.into_iter().map(Some).collect(),
            position: 0,
        }
    }

    /// Events grouped into batches, each followed by a commit marker.
    pub fn batches(batches: Vec<Vec<SourceEvent>>) -> Self {
        let mut entries = Vec::new();
        for batch in batches {
            entries.extend(batch.into_iter().map(Some));
            entries.push(None);
        }
        Self {
            entries,
            position: 0,
        }
    }

    /// Number of consumed entries.
    #[inline]
    pub fn position(&self) -> usize {
        self.position
    }
}

impl Reader for VecReader {
    fn read(&mut self) -> Result<ReadResult> {
        let Some(entry) = self.entries.get(self.position) else {
            return Ok(ReadResult::Finished);
        };
        self.position += 1;
        Ok(match entry {
            Some(event) => ReadResult::Data(event.clone(), Offset::Position(self.position as u64)),
            None => ReadResult::Commit(Offset::Position(self.position as u64)),
        })
    }

    fn seek(&mut self, offset: &Offset) -> Result<()> {
        match offset {
            Offset::Position(n) if *n as usize <= self.entries.len() => {
                self.position = *n as usize;
                Ok(())
            }
            other => Err(Error::recovery(format!(
                "offset {other:?} is outside an input of {} entries",
                self.entries.len()
            ))),
        }
    }
}

/// How a run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every reader finished.
    Finished,
    /// A shutdown was requested.
    Stopped,
}

/// Summary of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunSummary {
    /// Commits made by this run.
    pub commits: usize,
    pub last_time: Timestamp,
    pub outcome: RunOutcome,
}

/// Feeds readers into a computation until they finish or a shutdown is requested.
///
/// Each round reads every active reader up to its next commit marker, then cuts
/// one commit. Commit `k` therefore holds the `k`-th batch of every reader, no
/// matter where the readers were positioned by a resume. Markers record their
/// offset, so a resumed reader continues after the last committed marker.
/// `commit.max_batch_events` does not apply to runner input: a cut inside a
/// round would not line up with the readers' batches after a resume.
pub struct Runner {
    computation: Computation,
    readers: Vec<(String, Box<dyn Reader>)>,
}

impl Runner {
    pub fn new(computation: Computation) -> Self {
        Self {
            computation,
            readers: Vec::new(),
        }
    }

    /// Attaches a reader to a source.
    pub fn add_reader(
        &mut self,
        source: impl Into<String>,
        reader: impl Reader + 'static,
    ) -> Result<()> {
        let source = source.into();
        if !self.computation.has_source(&source) {
            return Err(Error::UnknownNode(source));
        }
        if self.readers.iter().any(|(name, _)| *name == source) {
            return Err(Error::config(format!("source {source} already has a reader")));
        }
        self.readers.push((source, Box::new(reader)));
        Ok(())
    }

    #[inline]
    pub fn computation(&self) -> &Computation {
        &self.computation
    }

    #[inline]
    pub fn computation_mut(&mut self) -> &mut Computation {
        &mut self.computation
    }

    pub fn into_computation(self) -> Computation {
        self.computation
    }

    /// Runs to completion or until a shutdown request, then finishes the computation.
    pub fn run(&mut self) -> Result<RunSummary> {
        for (name, reader) in &mut self.readers {
            if let Some(offset) = self.computation.offset(name) {
                reader.seek(offset)?;
                info!(source = %name, ?offset, "reader resumed");
            }
        }

        let shutdown = self.computation.shutdown_handle();
        let mut active = vec![true; self.readers.len()];
        let mut commits = 0;
        let mut outcome = RunOutcome::Finished;
        while active.iter().any(|&a| a) {
            if shutdown.is_requested() {
                info!("shutdown requested");
                outcome = RunOutcome::Stopped;
                break;
            }
            for (i, (name, reader)) in self.readers.iter_mut().enumerate() {
                if !active[i] {
                    continue;
                }
                loop {
                    match reader.read()? {
                        ReadResult::Data(event, offset) => {
                            self.computation.stage(name, event, offset)?;
                        }
                        ReadResult::Commit(offset) => {
                            self.computation.advance_offset(name, offset)?;
                            break;
                        }
                        ReadResult::Finished => {
                            debug!(source = %name, "reader finished");
                            active[i] = false;
                            break;
                        }
                    }
                }
            }
            if self.computation.commit()?.is_some() {
                commits += 1;
            }
        }

        if self.computation.commit()?.is_some() {
            commits += 1;
        }
        self.computation.finish()?;
        Ok(RunSummary {
            commits,
            last_time: self.computation.last_time(),
            outcome,
        })
    }
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("computation", &self.computation)
            .field(
                "readers",
                &self.readers.iter().map(|(name, _)| name).collect::<Vec<_>>(),
            )
            .finish()
    }
}
