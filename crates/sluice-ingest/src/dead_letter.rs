//! Rejected-row collection
//!
//! Each job owns one [`DeadLetterCollector`]. Rejected rows are held in memory
//! and appended to `{dir}/{job}_{table}.ndjson`, one JSON object per line,
//! where `{job}` is the escaped job id so distinct jobs never share a file.
//! The file is created on the first flush that has rows, so a clean job leaves
//! nothing behind.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{IngestError, IngestResult};
use crate::paths::job_file_stem;
use crate::schema::TableSchema;

pub const DEFAULT_DEAD_LETTER_CAPACITY: usize = 10_000;

/// One rejected input row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRow {
    /// Zero-based position of the row in the source
    pub row_index: u64,
    pub raw: serde_json::Value,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterSummary {
    /// Set once at least one row has been written
    pub path: Option<PathBuf>,
    /// Rows written over the collector's lifetime
    pub count: u64,
}

pub struct DeadLetterCollector {
    path: PathBuf,
    capacity: usize,
    pending: Vec<DeadLetterRow>,
    written: u64,
}

impl DeadLetterCollector {
    pub fn new(dir: impl AsRef<Path>, job_id: &str, table: TableSchema, capacity: usize) -> Self {
        let file_name = format!("{}_{}.ndjson", job_file_stem(job_id), table.table_name());
        Self {
            path: dir.as_ref().join(file_name),
            capacity: capacity.max(1),
            pending: Vec::new(),
            written: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn add(&mut self, row_index: u64, raw: serde_json::Value, error: impl Into<String>) {
        self.pending.push(DeadLetterRow {
            row_index,
            raw,
            error: error.into(),
            timestamp: Utc::now(),
        });
    }

    /// Rows added but not yet flushed
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Rows added over the collector's lifetime
    pub fn total(&self) -> u64 {
        self.written + self.pending.len() as u64
    }

    pub fn is_over_capacity(&self) -> bool {
        self.pending.len() >= self.capacity
    }

    pub async fn flush_if_over_capacity(&mut self) -> IngestResult<()> {
        if self.is_over_capacity() {
            self.flush().await?;
        }
        Ok(())
    }

    /// Append every pending row to the file
    ///
    /// On failure the rows stay pending, so a later flush retries them.
    pub async fn flush(&mut self) -> IngestResult<DeadLetterSummary> {
        if !self.pending.is_empty() {
            let rows = std::mem::take(&mut self.pending);
            let count = rows.len() as u64;
            let path = self.path.clone();

            let joined = tokio::task::spawn_blocking(move || {
                let appended = match path.parent() {
                    Some(parent) => std::fs::create_dir_all(parent),
                    None => Ok(()),
                }
                .and_then(|()| serde_jsonlines::append_json_lines(&path, &rows));
                (rows, appended)
            })
            .await;

            let failure = match joined {
                Ok((_, Ok(()))) => None,
                Ok((rows, Err(source))) => {
                    self.restore(rows);
                    Some(source)
                },
                Err(join) => Some(std::io::Error::other(join)),
            };
            if let Some(source) = failure {
                return Err(IngestError::DeadLetterIo {
                    path: self.path.display().to_string(),
                    source,
                });
            }

            self.written += count;
            tracing::debug!(path = %self.path.display(), rows = count, "Flushed dead-letter rows");
        }

        Ok(DeadLetterSummary {
            path: (self.written > 0).then(|| self.path.clone()),
            count: self.written,
        })
    }

    /// Put rows from a failed flush back ahead of anything added since
    fn restore(&mut self, mut rows: Vec<DeadLetterRow>) {
        rows.append(&mut self.pending);
        self.pending = rows;
    }
}
