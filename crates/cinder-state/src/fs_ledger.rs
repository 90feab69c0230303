//! Filesystem-backed run ledger.
//!
//! Layout: `<root>/<run_id>.json`, one document per run holding the record and
//! its event stream. Writes go to a temp file in the same directory and are
//! renamed into place, so a reader never sees a half-written document.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::StorageError;
use crate::storage_traits::*;

#[derive(Debug, Serialize, Deserialize)]
struct RunDocument {
    record: RunRecord,
    events: Vec<RunEvent>,
}

/// Run ledger persisted as JSON documents under a directory.
#[derive(Debug)]
pub struct FsRunLedger {
    root: PathBuf,
    // Serializes read-modify-write cycles within this process.
    write_lock: Mutex<()>,
}

impl FsRunLedger {
    /// Open (and create if needed) a ledger rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    /// Directory holding the run documents.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn document_path(&self, run_id: &RunId) -> PathBuf {
        self.root.join(format!("{}.json", run_id.0))
    }

    async fn load(&self, run_id: &RunId) -> StorageResult<RunDocument> {
        let path = self.document_path(run_id);
        let bytes = tokio::fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::RunNotFound {
                    run_id: run_id.0.clone(),
                }
            } else {
                StorageError::Io(e)
            }
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn store(&self, doc: &RunDocument) -> StorageResult<()> {
        let bytes = serde_json::to_vec_pretty(doc)?;
        let dir = self.root.clone();
        let path = self.document_path(&doc.record.run_id);
        tokio::task::spawn_blocking(move || -> StorageResult<()> {
            let mut tmp = NamedTempFile::new_in(&dir)?;
            tmp.write_all(&bytes)?;
            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(|e| StorageError::Io(std::io::Error::other(e)))??;
        Ok(())
    }

    async fn close(&self, run_id: &RunId, status: RunStatus, summary: RunSummary) -> StorageResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut doc = self.load(run_id).await?;
        doc.record.close(status, summary)?;
        self.store(&doc).await
    }
}

#[async_trait]
impl RunLedger for FsRunLedger {
    async fn create_run(
        &self,
        spec_digest: &ContentDigest,
        metadata: RunMetadata,
    ) -> StorageResult<RunId> {
        let _guard = self.write_lock.lock().await;
        let run_id = RunId::new();
        let doc = RunDocument {
            record: RunRecord::new(run_id.clone(), spec_digest.clone(), metadata),
            events: Vec::new(),
        };
        self.store(&doc).await?;
        debug!(run_id = %run_id, root = %self.root.display(), "Created run document");
        Ok(run_id)
    }

    async fn append_event(&self, run_id: &RunId, event: RunEvent) -> StorageResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut doc = self.load(run_id).await?;
        doc.record.ensure_running()?;
        doc.events.push(event);
        self.store(&doc).await
    }

    async fn complete_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()> {
        self.close(run_id, RunStatus::Completed, summary).await
    }

    async fn fail_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()> {
        self.close(run_id, RunStatus::Failed, summary).await
    }

    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord> {
        Ok(self.load(run_id).await?.record)
    }

    async fn get_events(&self, run_id: &RunId) -> StorageResult<Vec<RunEvent>> {
        let mut events = self.load(run_id).await?.events;
        events.sort_by_key(|e| e.seq);
        Ok(events)
    }

    async fn list_runs(
        &self,
        spec_digest: Option<&ContentDigest>,
    ) -> StorageResult<Vec<RunRecord>> {
        let mut records = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            let doc: RunDocument = serde_json::from_slice(&bytes)?;
            if spec_digest.map(|d| doc.record.spec_digest == *d).unwrap_or(true) {
                records.push(doc.record);
            }
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }
}
