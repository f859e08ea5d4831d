//! Persistent per-task history.
//!
//! Each task owns one CBOR file inside the store directory, named after the
//! BLAKE3 digest of its id. A commit writes a sibling temporary file, syncs
//! it and renames it over the entry, so readers only ever see a complete
//! previous or a complete new history. Anything that fails to decode is
//! treated as "no history" and the task runs in full.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::core::{ArcStr, Hash32};
use crate::error::StoreError;
use crate::fingerprint::{PathFilter, Sensitivity, Snapshot, snapshot_property};

const FORMAT_VERSION: u32 = 2;

/// Input and output snapshots recorded after a task's last successful run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskHistory {
    pub inputs: Snapshot,
    pub outputs: Snapshot,
}

#[derive(Serialize)]
struct EntryRef<'a> {
    version: u32,
    task: &'a str,
    inputs: &'a Snapshot,
    outputs: &'a Snapshot,
}

#[derive(Deserialize)]
struct Entry {
    version: u32,
    task: String,
    inputs: Snapshot,
    outputs: Snapshot,
}

pub struct FingerprintStore {
    dir: Utf8PathBuf,
    /// One write barrier per task id.
    barriers: Mutex<HashMap<ArcStr, Arc<Mutex<()>>>>,
    counter: AtomicU64,
}

impl FingerprintStore {
    /// Opens the store, creating the directory if needed.
    pub fn open(dir: impl AsRef<Utf8Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_owned();
        fs::create_dir_all(&dir)?;

        Ok(Self {
            dir,
            barriers: Mutex::new(HashMap::new()),
            counter: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    /// Fingerprints `paths` as a single property named `files`.
    pub fn snapshot(&self, paths: &[Utf8PathBuf], sensitivity: Sensitivity) -> io::Result<Snapshot> {
        let property = snapshot_property("files", paths, sensitivity, &PathFilter::default())?;

        Ok(Snapshot {
            properties: vec![property],
            values: Default::default(),
        })
    }

    /// Loads the history of a task, absent if there is none or it can't be
    /// read back.
    pub fn load(&self, task: &str) -> Option<TaskHistory> {
        match self.try_load(task) {
            Ok(history) => history,
            Err(e) => {
                tracing::warn!("ignoring history of task {}: {}", task, e);
                None
            }
        }
    }

    pub fn try_load(&self, task: &str) -> Result<Option<TaskHistory>, StoreError> {
        let bytes = match fs::read(self.entry_path(task)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let entry: Entry =
            ciborium::from_reader(bytes.as_slice()).map_err(|e| StoreError::Corrupt {
                task: task.to_string(),
                reason: e.to_string(),
            })?;

        if entry.version != FORMAT_VERSION {
            return Err(StoreError::Corrupt {
                task: task.to_string(),
                reason: format!("unsupported format version {}", entry.version),
            });
        }

        if entry.task != task {
            return Err(StoreError::Corrupt {
                task: task.to_string(),
                reason: format!("entry belongs to task '{}'", entry.task),
            });
        }

        Ok(Some(TaskHistory {
            inputs: entry.inputs,
            outputs: entry.outputs,
        }))
    }

    /// Atomically replaces the history of a task.
    pub fn commit(&self, task: &str, inputs: &Snapshot, outputs: &Snapshot) -> Result<(), StoreError> {
        let entry = EntryRef {
            version: FORMAT_VERSION,
            task,
            inputs,
            outputs,
        };

        let mut bytes = Vec::new();
        ciborium::into_writer(&entry, &mut bytes).map_err(|e| StoreError::Encode {
            task: task.to_string(),
            reason: e.to_string(),
        })?;

        let barrier = self.barrier(task);
        let _guard = barrier.lock().unwrap_or_else(PoisonError::into_inner);

        let target = self.entry_path(task);
        let temp = self.dir.join(format!(
            ".{}.{}.{}.tmp",
            target.file_stem().unwrap_or("entry"),
            std::process::id(),
            self.counter.fetch_add(1, Ordering::Relaxed)
        ));

        let result = write_synced(&temp, &bytes).and_then(|()| fs::rename(&temp, &target));
        if result.is_err() {
            let _ = fs::remove_file(&temp);
        }
        result?;

        tracing::debug!("recorded history of task {}", task);
        Ok(())
    }

    /// Forgets the history of a task, returns whether there was any.
    pub fn invalidate(&self, task: &str) -> Result<bool, StoreError> {
        let barrier = self.barrier(task);
        let _guard = barrier.lock().unwrap_or_else(PoisonError::into_inner);

        match fs::remove_file(self.entry_path(task)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn entry_path(&self, task: &str) -> Utf8PathBuf {
        self.dir
            .join(Hash32::hash(task).to_hex())
            .with_extension("cbor")
    }

    fn barrier(&self, task: &str) -> Arc<Mutex<()>> {
        let mut barriers = self.barriers.lock().unwrap_or_else(PoisonError::into_inner);
        barriers.entry(ArcStr::from(task)).or_default().clone()
    }
}

fn write_synced(path: &Utf8Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}
