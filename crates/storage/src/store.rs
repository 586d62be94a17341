//! Snapshot storage backends.

use crate::manifest::Manifest;
use hashbrown::HashMap;
use ripple_core::{Result, Timestamp};
use std::collections::BTreeSet;

/// Where snapshots live.
///
/// Blobs are opaque bytes keyed by `(operator, time)`; the manifest is a single
/// document replaced atomically.
pub trait SnapshotStore: Send {
    /// Stores the state of one operator as of `time`.
    fn put_blob(&mut self, operator: usize, time: Timestamp, bytes: &[u8]) -> Result<()>;

    /// Loads the state of one operator as of `time`.
    fn get_blob(&self, operator: usize, time: Timestamp) -> Result<Option<Vec<u8>>>;

    /// Removes every blob written at `time`.
    fn delete_blobs(&mut self, time: Timestamp) -> Result<()>;

    /// Loads the manifest, if one was written.
    fn read_manifest(&self) -> Result<Option<Manifest>>;

    /// Atomically replaces the manifest.
    fn write_manifest(&mut self, manifest: &Manifest) -> Result<()>;
}

/// Keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blobs: HashMap<(usize, Timestamp), Vec<u8>>,
    manifest: Option<Vec<u8>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs.
    pub fn blob_count(&self) -> usize {
        self.blobs.len()
    }

    /// Times that still have blobs, in order.
    pub fn blob_times(&self) -> Vec<Timestamp> {
        let times: BTreeSet<Timestamp> = self.blobs.keys().map(|&(_, t)| t).collect();
        times.into_iter().collect()
    }

    /// Gives mutable access to a stored blob.
    pub fn blob_mut(&mut self, operator: usize, time: Timestamp) -> Option<&mut Vec<u8>> {
        self.blobs.get_mut(&(operator, time))
    }

    /// Removes a single blob.
    pub fn remove_blob(&mut self, operator: usize, time: Timestamp) -> Option<Vec<u8>> {
        self.blobs.remove(&(operator, time))
    }
}

impl SnapshotStore for MemoryStore {
    fn put_blob(&mut self, operator: usize, time: Timestamp, bytes: &[u8]) -> Result<()> {
        self.blobs.insert((operator, time), bytes.to_vec());
        Ok(())
    }

    fn get_blob(&self, operator: usize, time: Timestamp) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.get(&(operator, time)).cloned())
    }

    fn delete_blobs(&mut self, time: Timestamp) -> Result<()> {
        self.blobs.retain(|&(_, t), _| t != time);
        Ok(())
    }

    fn read_manifest(&self) -> Result<Option<Manifest>> {
        self.manifest.as_deref().map(Manifest::from_json).transpose()
    }

    fn write_manifest(&mut self, manifest: &Manifest) -> Result<()> {
        self.manifest = Some(manifest.to_json()?);
        Ok(())
    }
}

impl<S: SnapshotStore + ?Sized> SnapshotStore for Box<S> {
    fn put_blob(&mut self, operator: usize, time: Timestamp, bytes: &[u8]) -> Result<()> {
        (**self).put_blob(operator, time, bytes)
    }

    fn get_blob(&self, operator: usize, time: Timestamp) -> Result<Option<Vec<u8>>> {
        (**self).get_blob(operator, time)
    }

    fn delete_blobs(&mut self, time: Timestamp) -> Result<()> {
        (**self).delete_blobs(time)
    }

    fn read_manifest(&self) -> Result<Option<Manifest>> {
        (**self).read_manifest()
    }

    fn write_manifest(&mut self, manifest: &Manifest) -> Result<()> {
        (**self).write_manifest(manifest)
    }
}
