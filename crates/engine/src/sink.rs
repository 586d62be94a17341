//! Delivery of output changes and routed errors.

use parking_lot::Mutex;
use ripple_core::{DataError, Result, Row, Timestamp};
use ripple_incremental::{Delta, Update};
use std::sync::Arc;

/// Receives the changes of one output, commit by commit.
///
/// `on_commit` is called exactly once per commit, in timestamp order, with the
/// consolidated changes of that commit (possibly none). An update of a row arrives
/// as a deletion of the old value and an insertion of the new one.
pub trait OutputSink: Send {
    fn on_commit(&mut self, time: Timestamp, changes: &[Delta<Row>]) -> Result<()>;

    /// Called once when the run finishes.
    fn on_end(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Receives data errors routed during a commit.
pub trait ErrorSink: Send {
    fn on_errors(&mut self, time: Timestamp, errors: &[DataError]) -> Result<()>;
}

/// Callback type for change notifications.
pub type ChangeCallback = Box<dyn FnMut(Timestamp, &[Delta<Row>]) -> Result<()> + Send>;

/// Wraps a closure as an output sink.
pub struct CallbackSink {
    callback: ChangeCallback,
}

impl CallbackSink {
    pub fn new<F>(callback: F) -> Self
    where
        F: FnMut(Timestamp, &[Delta<Row>]) -> Result<()> + Send + 'static,
    {
        Self {
            callback: Box::new(callback),
        }
    }
}

impl OutputSink for CallbackSink {
    fn on_commit(&mut self, time: Timestamp, changes: &[Delta<Row>]) -> Result<()> {
        (self.callback)(time, changes)
    }
}

impl std::fmt::Debug for CallbackSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackSink").finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct Collected {
    updates: Vec<Update<Row>>,
    commits: Vec<Timestamp>,
    errors: Vec<DataError>,
    ended: bool,
}

/// Records everything it receives. Clones share the same record.
///
/// Useful in tests and for small embedded computations.
#[derive(Clone, Debug, Default)]
pub struct CollectingSink {
    inner: Arc<Mutex<Collected>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All received changes, stamped with their commit time.
    pub fn updates(&self) -> Vec<Update<Row>> {
        self.inner.lock().updates.clone()
    }

    /// Times of every delivered commit, including empty ones.
    pub fn commits(&self) -> Vec<Timestamp> {
        self.inner.lock().commits.clone()
    }

    /// Changes received at `time`.
    pub fn at(&self, time: Timestamp) -> Vec<Delta<Row>> {
        self.inner
            .lock()
            .updates
            .iter()
            .filter(|u| u.time == time)
            .map(|u| Delta::new(u.data.clone(), u.diff))
            .collect()
    }

    /// Routed errors, when used as an error sink.
    pub fn errors(&self) -> Vec<DataError> {
        self.inner.lock().errors.clone()
    }

    pub fn is_ended(&self) -> bool {
        self.inner.lock().ended
    }
}

impl OutputSink for CollectingSink {
    fn on_commit(&mut self, time: Timestamp, changes: &[Delta<Row>]) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.commits.push(time);
        inner
            .updates
            .extend(changes.iter().map(|d| d.clone().at(time)));
        Ok(())
    }

    fn on_end(&mut self) -> Result<()> {
        self.inner.lock().ended = true;
        Ok(())
    }
}

impl ErrorSink for CollectingSink {
    fn on_errors(&mut self, _time: Timestamp, errors: &[DataError]) -> Result<()> {
        self.inner.lock().errors.extend_from_slice(errors);
        Ok(())
    }
}
