//! Filesystem snapshot store.
//!
//! Layout under the root directory:
//!
//! ```text
//! MANIFEST.json
//! blobs/<time>/<operator>.blob
//! ```

use crate::manifest::Manifest;
use crate::store::SnapshotStore;
use ripple_core::{Error, Result, Timestamp};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

const MANIFEST_FILE: &str = "MANIFEST.json";
const BLOB_DIR: &str = "blobs";

/// Stores snapshots as files under one directory.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Opens (creating if needed) a store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join(BLOB_DIR))
            .map_err(|e| Error::persistence(format!("create {}: {e}", root.display())))?;
        Ok(Self { root })
    }

    /// Returns the root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn time_dir(&self, time: Timestamp) -> PathBuf {
        self.root.join(BLOB_DIR).join(format!("{:020}", time.value()))
    }

    /// Path of the blob of `operator` at `time`.
    pub fn blob_path(&self, operator: usize, time: Timestamp) -> PathBuf {
        self.time_dir(time).join(format!("{operator:06}.blob"))
    }

    /// Writes `bytes` to `path` through a temporary file and a rename.
    fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
        let tmp = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)
    }
}

impl SnapshotStore for FileStore {
    fn put_blob(&mut self, operator: usize, time: Timestamp, bytes: &[u8]) -> Result<()> {
        let dir = self.time_dir(time);
        fs::create_dir_all(&dir)
            .map_err(|e| Error::persistence(format!("create {}: {e}", dir.display())))?;
        let path = self.blob_path(operator, time);
        Self::write_atomic(&path, bytes)
            .map_err(|e| Error::persistence(format!("write {}: {e}", path.display())))
    }

    fn get_blob(&self, operator: usize, time: Timestamp) -> Result<Option<Vec<u8>>> {
        let path = self.blob_path(operator, time);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::recovery(format!("read {}: {e}", path.display()))),
        }
    }

    fn delete_blobs(&mut self, time: Timestamp) -> Result<()> {
        let dir = self.time_dir(time);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::persistence(format!("remove {}: {e}", dir.display()))),
        }
    }

    fn read_manifest(&self) -> Result<Option<Manifest>> {
        let path = self.root.join(MANIFEST_FILE);
        match fs::read(&path) {
            Ok(bytes) => Manifest::from_json(&bytes).map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::recovery(format!("read {}: {e}", path.display()))),
        }
    }

    fn write_manifest(&mut self, manifest: &Manifest) -> Result<()> {
        let path = self.root.join(MANIFEST_FILE);
        Self::write_atomic(&path, &manifest.to_json()?)
            .map_err(|e| Error::persistence(format!("write {}: {e}", path.display())))
    }
}
