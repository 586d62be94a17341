//! The snapshot manifest.
//!
//! The manifest lists the consistent snapshots of one computation, oldest first.
//! Writing it is the commit point of a snapshot: blobs not referenced by the manifest
//! are garbage.

use ripple_core::{Error, Offset, Result, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One consistent snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    /// Last fully applied commit.
    pub time: Timestamp,
    /// Per source, the offset consumed up to `time`.
    pub offsets: BTreeMap<String, Offset>,
    /// Checksum of every operator blob, by operator id.
    pub checksums: Vec<u32>,
}

/// Index of the snapshots of a computation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Fingerprint of the graph the snapshots belong to.
    pub fingerprint: u64,
    /// Number of operators per snapshot.
    pub operators: usize,
    /// Snapshots, oldest first.
    pub snapshots: Vec<SnapshotEntry>,
}

impl Manifest {
    /// Creates an empty manifest for a graph.
    pub fn new(fingerprint: u64, operators: usize) -> Self {
        Self {
            fingerprint,
            operators,
            snapshots: Vec::new(),
        }
    }

    /// Returns the newest snapshot.
    pub fn latest(&self) -> Option<&SnapshotEntry> {
        self.snapshots.last()
    }

    /// Returns the snapshot taken at `time`.
    pub fn at(&self, time: Timestamp) -> Option<&SnapshotEntry> {
        self.snapshots.iter().find(|s| s.time == time)
    }

    /// Appends a snapshot. Times must increase.
    pub fn push(&mut self, entry: SnapshotEntry) -> Result<()> {
        if let Some(last) = self.latest() {
            if entry.time <= last.time {
                return Err(Error::persistence(format!(
                    "snapshot at {} is not newer than {}",
                    entry.time, last.time
                )));
            }
        }
        if entry.checksums.len() != self.operators {
            return Err(Error::persistence(format!(
                "snapshot has {} operators, manifest expects {}",
                entry.checksums.len(),
                self.operators
            )));
        }
        self.snapshots.push(entry);
        Ok(())
    }

    /// Keeps the newest `retain` snapshots and returns the times of the removed ones.
    pub fn prune(&mut self, retain: usize) -> Vec<Timestamp> {
        let excess = self.snapshots.len().saturating_sub(retain.max(1));
        self.snapshots.drain(..excess).map(|s| s.time).collect()
    }

    /// Serializes to JSON.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(|e| Error::persistence(format!("manifest: {e}")))
    }

    /// Parses JSON.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::recovery(format!("manifest: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(time: u64) -> SnapshotEntry {
        SnapshotEntry {
            time: Timestamp(time),
            offsets: BTreeMap::from([("readings".to_string(), Offset::Position(time * 10))]),
            checksums: vec![1, 2],
        }
    }

    #[test]
    fn test_push_and_lookup() {
        let mut manifest = Manifest::new(0xfeed, 2);
        manifest.push(entry(3)).unwrap();
        manifest.push(entry(5)).unwrap();
        assert_eq!(manifest.latest().map(|s| s.time), Some(Timestamp(5)));
        assert!(manifest.at(Timestamp(3)).is_some());
        assert!(manifest.at(Timestamp(4)).is_none());
        assert!(manifest.push(entry(5)).is_err());
    }

    #[test]
    fn test_push_checks_operator_count() {
        let mut manifest = Manifest::new(0xfeed, 3);
        assert!(manifest.push(entry(1)).is_err());
    }

    #[test]
    fn test_prune_keeps_newest() {
        let mut manifest = Manifest::new(0xfeed, 2);
        for t in 1..=4 {
            manifest.push(entry(t)).unwrap();
        }
        assert_eq!(manifest.prune(2), vec![Timestamp(1), Timestamp(2)]);
        assert_eq!(manifest.snapshots.len(), 2);
        assert!(manifest.prune(0).len() == 1);
    }

    #[test]
    fn test_json_round_trip() {
        let mut manifest = Manifest::new(0xfeed, 2);
        manifest.push(entry(1)).unwrap();
        let bytes = manifest.to_json().unwrap();
        assert_eq!(Manifest::from_json(&bytes).unwrap(), manifest);
        assert!(Manifest::from_json(&bytes[..bytes.len() / 2]).is_err());
    }
}
