//! On-disk snapshot store.
//!
//! Each snapshot is one JSON file named after its last applied log index, so
//! a lexical listing is also a chronological one. Files are written to a
//! temporary name and renamed into place; only the newest `retain` snapshots
//! are kept.

use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;

use tracing::{debug, warn};

use crate::errors::SnapshotError;
use crate::state_machine::LockSnapshot;

const SNAPSHOT_PREFIX: &str = "snapshot-";
const SNAPSHOT_SUFFIX: &str = ".json";

/// Default number of snapshots kept on disk.
pub const DEFAULT_RETAIN: usize = 2;

pub struct FileSnapshotStore {
    dir: PathBuf,
    retain: usize,
}

impl FileSnapshotStore {
    /// Open (creating if needed) the snapshot directory.
    pub fn open(dir: impl Into<PathBuf>, retain: usize) -> Result<Self, SnapshotError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            retain: retain.max(1),
        })
    }

    /// Persist `snap` and prune older snapshots.
    pub fn save(&self, snap: &LockSnapshot) -> Result<PathBuf, SnapshotError> {
        let index = snap.last_applied_log.map(|l| l.index).unwrap_or(0);
        let path = self
            .dir
            .join(format!("{SNAPSHOT_PREFIX}{index:020}{SNAPSHOT_SUFFIX}"));
        let tmp = path.with_extension("tmp");

        {
            let mut writer = BufWriter::new(fs::File::create(&tmp)?);
            snap.serialize_to(&mut writer)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        debug!(path = %path.display(), "snapshot persisted");

        self.prune()?;
        Ok(path)
    }

    /// Load the newest snapshot, if any.
    pub fn latest(&self) -> Result<Option<LockSnapshot>, SnapshotError> {
        let Some(path) = self.list()?.pop() else {
            return Ok(None);
        };
        let reader = BufReader::new(fs::File::open(&path)?);
        let snap = LockSnapshot::read_from(reader)?;
        Ok(Some(snap))
    }

    fn list(&self) -> Result<Vec<PathBuf>, SnapshotError> {
        let mut paths = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_snapshot = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(SNAPSHOT_PREFIX) && n.ends_with(SNAPSHOT_SUFFIX))
                .unwrap_or(false);
            if is_snapshot {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    fn prune(&self) -> Result<(), SnapshotError> {
        let paths = self.list()?;
        let excess = paths.len().saturating_sub(self.retain);
        for path in &paths[..excess] {
            if let Err(e) = fs::remove_file(path) {
                warn!(path = %path.display(), error = %e, "failed to prune old snapshot");
            }
        }
        Ok(())
    }
}
