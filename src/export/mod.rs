//! Output files: per-shard iteration entries, merged results and SFT traces.
//!
//! Everything is JSON Lines. Rows are written through [`JsonlWriter`] so a
//! long `generate` run can flush each entry as the scheduler yields it.

pub mod sft;

pub use sft::{SftExporter, SftRecord, SftTurn};

use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::fs;
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::error::StorageError;

/// Incremental JSONL file writer.
pub struct JsonlWriter {
    path: PathBuf,
    file: BufWriter<fs::File>,
    rows: usize,
}

impl JsonlWriter {
    /// Creates (or truncates) `path`, making parent directories as needed.
    pub async fn create(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(|e| {
                StorageError::DirectoryCreationFailed(format!("{:?}: {}", parent, e))
            })?;
        }
        let file = fs::File::create(&path).await?;
        Ok(Self {
            path,
            file: BufWriter::new(file),
            rows: 0,
        })
    }

    pub async fn write<T: Serialize>(&mut self, row: &T) -> Result<(), StorageError> {
        let mut line = serde_json::to_string(row)?;
        line.push('\n');
        self.file.write_all(line.as_bytes()).await?;
        self.rows += 1;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), StorageError> {
        self.file.flush().await?;
        Ok(())
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flushes and closes the file, returning the number of rows written.
    pub async fn finish(mut self) -> Result<usize, StorageError> {
        self.file.flush().await?;
        self.file.get_mut().sync_all().await?;
        Ok(self.rows)
    }
}

/// Writes `rows` to `path` in one go.
pub async fn write_jsonl<'a, T, I>(path: impl AsRef<Path>, rows: I) -> Result<usize, StorageError>
where
    T: Serialize + 'a,
    I: IntoIterator<Item = &'a T>,
{
    let mut writer = JsonlWriter::create(path).await?;
    for row in rows {
        writer.write(row).await?;
    }
    writer.finish().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trajectory::{IterationEntry, Item, ItemStatus};
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_write_jsonl_creates_parents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/out/entries.jsonl");
        let entries: Vec<IterationEntry> = (0..3)
            .map(|i| {
                let item = Item::new(format!("id-{}", i), i, "q", None);
                IterationEntry::from_item(&item, ItemStatus::Rejected, 2, None)
            })
            .collect();

        let written = write_jsonl(&path, &entries).await.unwrap();
        assert_eq!(written, 3);

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let parsed: Vec<IterationEntry> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(parsed, entries);
    }

    #[tokio::test]
    async fn test_incremental_writer_counts_rows() {
        let dir = tempdir().unwrap();
        let mut writer = JsonlWriter::create(dir.path().join("rows.jsonl")).await.unwrap();
        writer.write(&serde_json::json!({"a": 1})).await.unwrap();
        writer.write(&serde_json::json!({"a": 2})).await.unwrap();
        assert_eq!(writer.rows(), 2);
        assert_eq!(writer.finish().await.unwrap(), 2);
    }
}
