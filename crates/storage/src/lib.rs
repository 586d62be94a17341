//! Ripple Storage - snapshot persistence for Ripple computations.
//!
//! This crate provides:
//!
//! - `blob`: framing of serialized operator state (magic, version, checksum)
//! - `Manifest`: the catalog of consistent snapshots
//! - `SnapshotStore`: storage backends (`MemoryStore`, `FileStore`)
//! - `Checkpointer`: writes snapshots and loads them back for recovery
//!
//! # Example
//!
//! ```rust
//! use ripple_core::{Offset, Timestamp};
//! use ripple_storage::{blob, Checkpointer, MemoryStore, RecoveryMode};
//! use std::collections::BTreeMap;
//!
//! let mut checkpointer = Checkpointer::open(MemoryStore::new(), 0xabc, 1, 2).unwrap();
//! let state = blob::encode(&vec![1u64, 2, 3]).unwrap();
//! let offsets = BTreeMap::from([("events".to_string(), Offset::Position(3))]);
//! checkpointer.write(Timestamp(3), offsets, &[state]).unwrap();
//!
//! let snapshot = checkpointer.load(RecoveryMode::Latest).unwrap().unwrap();
//! assert_eq!(snapshot.time, Timestamp(3));
//! let restored: Vec<u64> = blob::decode(&snapshot.blobs[0]).unwrap();
//! assert_eq!(restored, vec![1, 2, 3]);
//! ```

pub mod blob;
pub mod checkpoint;
pub mod file;
pub mod manifest;
pub mod store;

pub use checkpoint::{Checkpointer, LoadedSnapshot, RecoveryMode};
pub use file::FileStore;
pub use manifest::{Manifest, SnapshotEntry};
pub use store::{MemoryStore, SnapshotStore};
