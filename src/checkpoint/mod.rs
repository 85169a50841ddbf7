// Durable ingestion progress marker, replaced atomically with compare-and-swap

#[cfg(test)]
mod tests;

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::store::Cursor;
use crate::{PipelineError, Result};

/// Everything before `cursor` has been attempted and durably resolved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub source_index: String,
    pub destination_index: String,
    pub cursor: Option<Cursor>,
    pub documents_processed: u64,
    pub batches_committed: u64,
    pub committed: u64,
    pub failed: u64,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    #[inline]
    pub fn start(source_index: &str, destination_index: &str) -> Self {
        Self {
            source_index: source_index.to_string(),
            destination_index: destination_index.to_string(),
            cursor: None,
            documents_processed: 0,
            batches_committed: 0,
            committed: 0,
            failed: 0,
            updated_at: Utc::now(),
        }
    }

    /// The checkpoint after one more resolved batch ending at `cursor`
    #[inline]
    #[must_use]
    pub fn advance(&self, cursor: Cursor, committed: u64, failed: u64) -> Self {
        Self {
            source_index: self.source_index.clone(),
            destination_index: self.destination_index.clone(),
            cursor: Some(cursor),
            documents_processed: self.documents_processed + committed + failed,
            batches_committed: self.batches_committed + 1,
            committed: self.committed + committed,
            failed: self.failed + failed,
            updated_at: Utc::now(),
        }
    }

    #[inline]
    pub fn belongs_to(&self, source_index: &str, destination_index: &str) -> bool {
        self.source_index == source_index && self.destination_index == destination_index
    }

    fn precedes(&self, next: &Self) -> bool {
        next.batches_committed >= self.batches_committed
            && next.documents_processed >= self.documents_processed
    }
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self) -> Result<Option<Checkpoint>>;

    /// Store `next` only if the current value still equals `expected` and
    /// `next` does not move progress backwards
    async fn compare_and_swap(&self, expected: Option<&Checkpoint>, next: &Checkpoint)
    -> Result<()>;

    async fn clear(&self) -> Result<()>;
}

fn check_transition(
    current: Option<&Checkpoint>,
    expected: Option<&Checkpoint>,
    next: &Checkpoint,
) -> Result<()> {
    if current != expected {
        return Err(PipelineError::Checkpoint(
            "stored checkpoint changed since it was loaded".to_string(),
        ));
    }
    if let Some(current) = current {
        if !current.precedes(next) {
            return Err(PipelineError::Checkpoint(format!(
                "refusing to move checkpoint backwards from batch {} to {}",
                current.batches_committed, next.batches_committed
            )));
        }
    }
    Ok(())
}

/// JSON file replaced by write-temp, fsync, rename, fsync-directory
#[derive(Debug)]
pub struct FileCheckpointStore {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl FileCheckpointStore {
    #[inline]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<Option<Checkpoint>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&content).map(Some).map_err(|e| {
            PipelineError::Checkpoint(format!(
                "checkpoint file {} is corrupt: {e}",
                self.path.display()
            ))
        })
    }

    async fn write_atomic(&self, checkpoint: &Checkpoint) -> Result<()> {
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        tokio::fs::create_dir_all(parent).await?;

        let file_name = self
            .path
            .file_name()
            .map_or_else(|| "checkpoint".into(), |name| name.to_string_lossy());
        let temp = parent.join(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()));

        let content = serde_json::to_vec_pretty(checkpoint)
            .map_err(|e| PipelineError::Checkpoint(format!("could not encode checkpoint: {e}")))?;

        let written = async {
            let mut file = tokio::fs::File::create(&temp).await?;
            file.write_all(&content).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&temp, &self.path).await
        }
        .await;

        if let Err(e) = written {
            if let Err(cleanup) = tokio::fs::remove_file(&temp).await {
                debug!("Could not remove {}: {}", temp.display(), cleanup);
            }
            return Err(e.into());
        }

        #[cfg(unix)]
        {
            let directory = tokio::fs::File::open(parent).await?;
            directory.sync_all().await?;
        }

        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self) -> Result<Option<Checkpoint>> {
        let _guard = self.lock.lock().await;
        self.read().await
    }

    async fn compare_and_swap(
        &self,
        expected: Option<&Checkpoint>,
        next: &Checkpoint,
    ) -> Result<()> {
        let _guard = self.lock.lock().await;
        let current = self.read().await?;
        check_transition(current.as_ref(), expected, next)?;
        self.write_atomic(next).await?;
        debug!(
            "Checkpoint saved at batch {} ({} documents)",
            next.batches_committed, next.documents_processed
        );
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!("Could not remove checkpoint {}: {}", self.path.display(), e);
                Err(e.into())
            }
        }
    }
}

/// Process-local checkpoint store
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    current: Mutex<Option<Checkpoint>>,
}

impl MemoryCheckpointStore {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn with_checkpoint(checkpoint: Checkpoint) -> Self {
        Self {
            current: Mutex::new(Some(checkpoint)),
        }
    }

    #[inline]
    pub fn current(&self) -> Option<Checkpoint> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self) -> Result<Option<Checkpoint>> {
        Ok(self.current())
    }

    async fn compare_and_swap(
        &self,
        expected: Option<&Checkpoint>,
        next: &Checkpoint,
    ) -> Result<()> {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        check_transition(current.as_ref(), expected, next)?;
        *current = Some(next.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}
