//! Durable run storage.
//!
//! Every scheduler owns one storage key (dataset, iteration, shard) and
//! writes two kinds of files under it:
//!
//! ```text
//! <root>/<dataset>/iter-<NNN>/shard-<i>-of-<N>/attempts.jsonl
//! <root>/<dataset>/iter-<NNN>/shard-<i>-of-<N>/batch-<NNNNN>.json
//! ```
//!
//! The attempt log is append-only and is synced after every line. Batch
//! snapshots are written to a temporary file and renamed into place, so a
//! reader never observes a half-written snapshot.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::types::{Attempt, BatchSnapshot, IterationRecord, ItemStatus};
use crate::error::StorageError;
use crate::shard::ShardKey;

const ATTEMPT_LOG: &str = "attempts.jsonl";

/// Identifies the storage owned by one scheduler instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageKey {
    pub dataset: String,
    pub iteration: u32,
    pub shard: ShardKey,
}

impl StorageKey {
    pub fn new(dataset: impl Into<String>, iteration: u32, shard: ShardKey) -> Self {
        Self {
            dataset: dataset.into(),
            iteration,
            shard,
        }
    }
}

impl std::fmt::Display for StorageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/iter-{}/{}", self.dataset, self.iteration, self.shard)
    }
}

/// Persisted progress for one storage key, readable from another process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoredProgress {
    pub batches: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub exhausted: usize,
    /// Items with logged attempts but no persisted terminal entry.
    pub open: usize,
    pub attempts_logged: usize,
}

impl StoredProgress {
    pub fn terminal(&self) -> usize {
        self.accepted + self.rejected + self.exhausted
    }
}

/// File-backed store for attempt logs and batch snapshots.
pub struct RunStore {
    root: PathBuf,
    append_lock: Mutex<()>,
}

impl RunStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            append_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dataset_dir(&self, dataset: &str) -> PathBuf {
        self.root.join(sanitize(dataset))
    }

    fn iteration_dir(&self, dataset: &str, iteration: u32) -> PathBuf {
        self.dataset_dir(dataset)
            .join(format!("iter-{:03}", iteration))
    }

    /// Directory holding every file for `key`.
    pub fn shard_dir(&self, key: &StorageKey) -> PathBuf {
        self.iteration_dir(&key.dataset, key.iteration)
            .join(key.shard.to_string())
    }

    async fn ensure_directory(&self, dir: &Path) -> Result<(), StorageError> {
        fs::create_dir_all(dir).await.map_err(|e| {
            StorageError::DirectoryCreationFailed(format!(
                "Failed to create directory {:?}: {}",
                dir, e
            ))
        })
    }

    /// Deletes everything persisted under `key`.
    pub async fn reset(&self, key: &StorageKey) -> Result<(), StorageError> {
        let dir = self.shard_dir(key);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!(key = %key, "Reset run storage");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Appends one attempt to the log and syncs it to disk.
    pub async fn append_attempt(
        &self,
        key: &StorageKey,
        attempt: &Attempt,
    ) -> Result<(), StorageError> {
        let dir = self.shard_dir(key);
        let mut line = serde_json::to_string(attempt)?;
        line.push('\n');

        let _guard = self.append_lock.lock().await;
        self.ensure_directory(&dir).await?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(ATTEMPT_LOG))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.sync_data().await?;
        Ok(())
    }

    /// Loads the attempt log grouped by item id, in append order.
    ///
    /// A torn final line (a crash mid-append) is skipped. Corruption
    /// anywhere else is an error.
    pub async fn load_attempts(
        &self,
        key: &StorageKey,
    ) -> Result<HashMap<String, Vec<Attempt>>, StorageError> {
        let path = self.shard_dir(key).join(ATTEMPT_LOG);
        let contents = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(e.into()),
        };

        let lines: Vec<&str> = contents.lines().filter(|l| !l.trim().is_empty()).collect();
        let mut by_item: HashMap<String, Vec<Attempt>> = HashMap::new();
        for (i, line) in lines.iter().enumerate() {
            match serde_json::from_str::<Attempt>(line) {
                Ok(attempt) => by_item
                    .entry(attempt.item_id.clone())
                    .or_default()
                    .push(attempt),
                Err(e) if i + 1 == lines.len() => {
                    warn!(path = ?path, error = %e, "Skipping torn final line in attempt log");
                }
                Err(e) => {
                    return Err(StorageError::InvalidData(format!(
                        "{:?} line {}: {}",
                        path,
                        i + 1,
                        e
                    )));
                }
            }
        }
        Ok(by_item)
    }

    /// Writes a batch snapshot atomically.
    ///
    /// A snapshot already on disk at the same index is never clobbered:
    /// terminal entries it holds that the new snapshot lacks are carried
    /// over. This covers reruns with a different batch size or a batch cut
    /// short by a stop.
    pub async fn write_batch(
        &self,
        key: &StorageKey,
        snapshot: &BatchSnapshot,
    ) -> Result<PathBuf, StorageError> {
        let dir = self.shard_dir(key);
        self.ensure_directory(&dir).await?;

        let path = dir.join(format!("batch-{:05}.json", snapshot.batch_index));
        let tmp = dir.join(format!("batch-{:05}.json.tmp", snapshot.batch_index));

        let mut merged = snapshot.clone();
        let carried = match fs::read_to_string(&path).await {
            Ok(contents) => {
                let previous: BatchSnapshot = serde_json::from_str(&contents)
                    .map_err(|e| StorageError::InvalidData(format!("{:?}: {}", path, e)))?;
                let present: HashSet<String> =
                    merged.entries.iter().map(|e| e.item_id.clone()).collect();
                let before = merged.entries.len();
                merged.entries.extend(previous.entries.into_iter().filter(|e| {
                    e.status.is_terminal() && !present.contains(&e.item_id)
                }));
                merged.entries.len() - before
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        if carried > 0 {
            merged.entries.sort_by_key(|e| e.index);
            debug!(
                key = %key,
                batch = snapshot.batch_index,
                carried,
                "Carried settled entries into rewritten snapshot"
            );
        }
        let json = serde_json::to_string_pretty(&merged)?;

        let mut file = fs::File::create(&tmp).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, &path).await?;

        Ok(path)
    }

    /// Loads every batch snapshot under `key`, ordered by batch index.
    pub async fn load_snapshots(&self, key: &StorageKey) -> Result<Vec<BatchSnapshot>, StorageError> {
        load_snapshots_in(&self.shard_dir(key)).await
    }

    /// Iteration numbers present for `dataset`, ascending.
    pub async fn list_iterations(&self, dataset: &str) -> Result<Vec<u32>, StorageError> {
        let mut iterations = Vec::new();
        for name in list_dir_names(&self.dataset_dir(dataset)).await? {
            if let Some(n) = name.strip_prefix("iter-").and_then(|n| n.parse().ok()) {
                iterations.push(n);
            }
        }
        iterations.sort_unstable();
        Ok(iterations)
    }

    /// Unions every shard's snapshots for one iteration.
    ///
    /// Shards that never completed a batch simply contribute nothing.
    pub async fn load_iteration(
        &self,
        dataset: &str,
        iteration: u32,
    ) -> Result<IterationRecord, StorageError> {
        let dir = self.iteration_dir(dataset, iteration);
        let mut record = IterationRecord::new(dataset, iteration);

        let mut shards = list_dir_names(&dir).await?;
        shards.retain(|name| name.starts_with("shard-"));
        shards.sort();
        for shard in shards {
            for snapshot in load_snapshots_in(&dir.join(&shard)).await? {
                record.entries.extend(snapshot.entries);
            }
        }
        record
            .entries
            .sort_by(|a, b| a.index.cmp(&b.index).then_with(|| a.item_id.cmp(&b.item_id)));
        // A rerun with a different batch size can leave an item in two snapshots
        record.entries.dedup_by(|a, b| a.item_id == b.item_id);
        Ok(record)
    }

    /// Reports persisted progress for `key`.
    pub async fn progress(&self, key: &StorageKey) -> Result<StoredProgress, StorageError> {
        let snapshots = self.load_snapshots(key).await?;
        let attempts = self.load_attempts(key).await?;

        let mut progress = StoredProgress {
            batches: snapshots.len(),
            attempts_logged: attempts.values().map(Vec::len).sum(),
            ..Default::default()
        };
        let mut terminal = HashSet::new();
        for entry in snapshots.iter().flat_map(|s| s.entries.iter()) {
            if !entry.status.is_terminal() || !terminal.insert(entry.item_id.as_str()) {
                continue;
            }
            match entry.status {
                ItemStatus::Accepted => progress.accepted += 1,
                ItemStatus::Rejected => progress.rejected += 1,
                _ => progress.exhausted += 1,
            }
        }
        progress.open = attempts
            .keys()
            .filter(|id| !terminal.contains(id.as_str()))
            .count();
        Ok(progress)
    }
}

async fn load_snapshots_in(dir: &Path) -> Result<Vec<BatchSnapshot>, StorageError> {
    let mut snapshots = Vec::new();
    for name in list_dir_names(dir).await? {
        if !(name.starts_with("batch-") && name.ends_with(".json")) {
            continue;
        }
        let contents = fs::read_to_string(dir.join(&name)).await?;
        let snapshot: BatchSnapshot = serde_json::from_str(&contents)
            .map_err(|e| StorageError::InvalidData(format!("{}: {}", name, e)))?;
        snapshots.push(snapshot);
    }
    snapshots.sort_by_key(|s| s.batch_index);
    Ok(snapshots)
}

async fn list_dir_names(dir: &Path) -> Result<Vec<String>, StorageError> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    Ok(names)
}

/// Dataset names may be hub paths like `org/name`.
fn sanitize(dataset: &str) -> String {
    dataset.replace(['/', '\\'], "__")
}
