//! Writing and loading consistent snapshots.

use crate::blob;
use crate::manifest::{Manifest, SnapshotEntry};
use crate::store::SnapshotStore;
use ripple_core::{Error, Offset, Result, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Which snapshot to resume from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryMode {
    /// The newest snapshot in the manifest.
    #[default]
    Latest,
    /// The snapshot taken exactly at the given time.
    At(Timestamp),
    /// Ignore existing snapshots and start from scratch.
    Rebuild,
}

/// A snapshot read back from a store.
#[derive(Debug)]
pub struct LoadedSnapshot {
    pub time: Timestamp,
    pub offsets: BTreeMap<String, Offset>,
    /// Framed blob of every operator, by operator id.
    pub blobs: Vec<Vec<u8>>,
}

/// Writes snapshots of one computation and loads them back.
///
/// A snapshot is written blob by blob; the manifest update that follows is the
/// commit point. Loading never falls back to an older snapshot on its own.
#[derive(Debug)]
pub struct Checkpointer<S> {
    store: S,
    fingerprint: u64,
    operators: usize,
    retained: usize,
    manifest: Manifest,
}

impl<S: SnapshotStore> Checkpointer<S> {
    /// Opens the snapshot catalog of a graph with the given fingerprint and operator
    /// count. Keeps the newest `retained` snapshots.
    pub fn open(store: S, fingerprint: u64, operators: usize, retained: usize) -> Result<Self> {
        let manifest = store
            .read_manifest()?
            .unwrap_or_else(|| Manifest::new(fingerprint, operators));
        Ok(Self {
            store,
            fingerprint,
            operators,
            retained: retained.max(1),
            manifest,
        })
    }

    /// Returns the manifest as last read or written.
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Returns the underlying store mutably.
    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Consumes the checkpointer and returns the store.
    pub fn into_store(self) -> S {
        self.store
    }

    /// Loads the snapshot selected by `mode`.
    ///
    /// Returns `None` when there is nothing to resume from: an empty catalog under
    /// [`RecoveryMode::Latest`], or [`RecoveryMode::Rebuild`]. Every other problem
    /// (fingerprint or operator count mismatch, missing snapshot, missing or corrupted
    /// blob) is an error.
    pub fn load(&self, mode: RecoveryMode) -> Result<Option<LoadedSnapshot>> {
        let entry = match mode {
            RecoveryMode::Rebuild => return Ok(None),
            RecoveryMode::Latest if self.manifest.snapshots.is_empty() => return Ok(None),
            RecoveryMode::Latest => self.manifest.latest(),
            RecoveryMode::At(time) => self.manifest.at(time),
        };
        self.check_graph()?;
        let entry = entry.ok_or_else(|| match mode {
            RecoveryMode::At(time) => Error::recovery(format!("no snapshot at time {time}")),
            _ => Error::recovery("no snapshot"),
        })?;

        let mut blobs = Vec::with_capacity(self.operators);
        for (operator, &expected) in entry.checksums.iter().enumerate() {
            let bytes = self.store.get_blob(operator, entry.time)?.ok_or_else(|| {
                Error::recovery(format!(
                    "snapshot {} is missing the blob of operator {operator}",
                    entry.time
                ))
            })?;
            if blob::checksum(&bytes) != expected {
                return Err(Error::recovery(format!(
                    "blob of operator {operator} does not belong to snapshot {}",
                    entry.time
                )));
            }
            blob::payload(&bytes)?;
            blobs.push(bytes);
        }
        info!(time = %entry.time, operators = blobs.len(), "snapshot loaded");
        Ok(Some(LoadedSnapshot {
            time: entry.time,
            offsets: entry.offsets.clone(),
            blobs,
        }))
    }

    fn check_graph(&self) -> Result<()> {
        if self.manifest.fingerprint != self.fingerprint {
            return Err(Error::recovery(format!(
                "snapshots belong to graph {:016x}, running graph is {:016x}",
                self.manifest.fingerprint, self.fingerprint
            )));
        }
        if self.manifest.operators != self.operators {
            return Err(Error::recovery(format!(
                "snapshots hold {} operators, graph has {}",
                self.manifest.operators, self.operators
            )));
        }
        Ok(())
    }

    /// Drops every snapshot newer than `time`.
    ///
    /// Needed after resuming from an older snapshot: the history after it is
    /// recomputed and snapshotted again.
    pub fn truncate_after(&mut self, time: Timestamp) -> Result<()> {
        let stale: Vec<Timestamp> = self
            .manifest
            .snapshots
            .iter()
            .map(|s| s.time)
            .filter(|&t| t > time)
            .collect();
        if stale.is_empty() {
            return Ok(());
        }
        let mut next = self.manifest.clone();
        next.snapshots.retain(|s| s.time <= time);
        self.store.write_manifest(&next)?;
        self.manifest = next;
        for t in &stale {
            self.store.delete_blobs(*t)?;
        }
        warn!(after = %time, dropped = stale.len(), "dropped newer snapshots");
        Ok(())
    }

    /// Writes a snapshot taken after commit `time`.
    ///
    /// `blobs` are the framed states of every operator. Snapshots of a different
    /// graph are discarded the first time this graph writes one.
    pub fn write(
        &mut self,
        time: Timestamp,
        offsets: BTreeMap<String, Offset>,
        blobs: &[Vec<u8>],
    ) -> Result<()> {
        if blobs.len() != self.operators {
            return Err(Error::persistence(format!(
                "{} blobs for {} operators",
                blobs.len(),
                self.operators
            )));
        }
        if self.check_graph().is_err() {
            warn!(
                old = self.manifest.snapshots.len(),
                "discarding snapshots of a different graph"
            );
            let stale: Vec<Timestamp> = self.manifest.snapshots.iter().map(|s| s.time).collect();
            self.manifest = Manifest::new(self.fingerprint, self.operators);
            self.store.write_manifest(&self.manifest)?;
            for t in stale {
                self.store.delete_blobs(t)?;
            }
        }

        for (operator, bytes) in blobs.iter().enumerate() {
            self.store.put_blob(operator, time, bytes)?;
        }
        let mut next = self.manifest.clone();
        next.push(SnapshotEntry {
            time,
            offsets,
            checksums: blobs.iter().map(|b| blob::checksum(b)).collect(),
        })?;
        let pruned = next.prune(self.retained);
        self.store.write_manifest(&next)?;
        self.manifest = next;
        for t in pruned {
            self.store.delete_blobs(t)?;
        }
        info!(time = %time, operators = blobs.len(), "snapshot written");
        Ok(())
    }
}
