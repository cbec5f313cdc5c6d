//! Resumable job checkpoints
//!
//! A checkpoint records the source cursor after the last durably committed
//! buffer. Files live at `{dir}/{job}.json`, `{job}` being the escaped job
//! id, and are replaced atomically:
//! the new content is written to a sibling temp file, synced, then renamed
//! over the old one. A reader never sees a half-written checkpoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{IngestError, IngestResult};
use crate::paths::job_file_stem;
use crate::schema::TableSchema;
use crate::source::SourceCursor;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub job_id: String,
    pub table: TableSchema,
    pub cursor: SourceCursor,
    /// Source rows consumed up to `cursor`, accepted or rejected
    pub rows_processed: u64,
    pub saved_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(job_id: impl Into<String>, table: TableSchema, cursor: SourceCursor, rows_processed: u64) -> Self {
        Self {
            job_id: job_id.into(),
            table,
            cursor,
            rows_processed,
            saved_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", job_file_stem(job_id)))
    }

    pub async fn save(&self, checkpoint: &Checkpoint) -> IngestResult<()> {
        let job_id = checkpoint.job_id.clone();
        let path = self.path_for(&job_id);
        let json = serde_json::to_vec_pretty(checkpoint).map_err(|e| io_error(&job_id, e))?;

        let written = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let tmp = path.with_extension("json.tmp");
            std::fs::write(&tmp, &json)?;
            std::fs::File::open(&tmp)?.sync_all()?;
            std::fs::rename(&tmp, &path)
        })
        .await;

        match written {
            Ok(Ok(())) => {
                tracing::debug!(
                    job_id = %job_id,
                    rows_processed = checkpoint.rows_processed,
                    "Saved checkpoint"
                );
                Ok(())
            },
            Ok(Err(e)) => Err(io_error(&job_id, e)),
            Err(e) => Err(io_error(&job_id, e)),
        }
    }

    /// The last saved checkpoint, or `None` if the job never saved one
    ///
    /// A file recording a different job id is treated as absent.
    pub async fn load(&self, job_id: &str) -> IngestResult<Option<Checkpoint>> {
        let path = self.path_for(job_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(job_id, e)),
        };

        let checkpoint: Checkpoint = serde_json::from_slice(&bytes)
            .map_err(|e| io_error(job_id, format!("corrupt checkpoint {}: {e}", path.display())))?;

        if checkpoint.job_id != job_id {
            tracing::warn!(
                job_id = %job_id,
                recorded_job_id = %checkpoint.job_id,
                path = %path.display(),
                "Checkpoint belongs to another job, ignoring it"
            );
            return Ok(None);
        }
        Ok(Some(checkpoint))
    }

    /// Remove the job's checkpoint; a missing file is not an error
    pub async fn delete(&self, job_id: &str) -> IngestResult<bool> {
        match tokio::fs::remove_file(self.path_for(job_id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_error(job_id, e)),
        }
    }
}

fn io_error(job_id: &str, err: impl std::fmt::Display) -> IngestError {
    IngestError::CheckpointIo {
        job_id: job_id.to_string(),
        message: err.to_string(),
    }
}
