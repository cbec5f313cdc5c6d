//! Job registry
//!
//! [`JobRegistry`] owns the table of job records, the cancellation token of
//! every live run and the subscribers watching each job id. All state sits behind one
//! mutex; every mutation and the broadcast it triggers happen while that lock
//! is held, so subscribers see snapshots in the order updates were applied.
//!
//! Lifecycle: `running -> {completed, failed, cancelled}`. Terminal states are
//! final. Registering an id whose job is not running starts a fresh record.
//!
//! Records are pruned to capacity, but a live run is tracked apart from its
//! record until it reaches a terminal state. An evicted run therefore still
//! blocks a second registration of its id and can still be cancelled.

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{IngestError, IngestResult};
use crate::schema::TableSchema;
use crate::source::SourceType;

pub const DEFAULT_MAX_JOBS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Running)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Snapshot of one job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    pub table: TableSchema,
    pub source_type: SourceType,
    pub attempted_rows: u64,
    pub inserted_rows: u64,
    pub rejected_rows: u64,
    pub dead_letter_count: u64,
    /// Rows the store kept its existing version of
    pub conflicts_skipped: u64,
    pub estimated_total: Option<u64>,
    pub dead_letter_path: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Failure message, or the reason given for a cancellation
    pub error: Option<String>,
}

impl Job {
    fn new(id: &str, table: TableSchema, source_type: SourceType) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            status: JobStatus::Running,
            table,
            source_type,
            attempted_rows: 0,
            inserted_rows: 0,
            rejected_rows: 0,
            dead_letter_count: 0,
            conflicts_skipped: 0,
            estimated_total: None,
            dead_letter_path: None,
            started_at: now,
            updated_at: now,
            finished_at: None,
            error: None,
        }
    }
}

/// Counters to overwrite; `None` leaves a field unchanged
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub attempted_rows: Option<u64>,
    pub inserted_rows: Option<u64>,
    pub rejected_rows: Option<u64>,
    pub dead_letter_count: Option<u64>,
    pub conflicts_skipped: Option<u64>,
    pub estimated_total: Option<u64>,
    pub dead_letter_path: Option<String>,
}

impl ProgressUpdate {
    fn apply(self, job: &mut Job) {
        if let Some(v) = self.attempted_rows {
            job.attempted_rows = v;
        }
        if let Some(v) = self.inserted_rows {
            job.inserted_rows = v;
        }
        if let Some(v) = self.rejected_rows {
            job.rejected_rows = v;
        }
        if let Some(v) = self.dead_letter_count {
            job.dead_letter_count = v;
        }
        if let Some(v) = self.conflicts_skipped {
            job.conflicts_skipped = v;
        }
        if self.estimated_total.is_some() {
            job.estimated_total = self.estimated_total;
        }
        if self.dead_letter_path.is_some() {
            job.dead_letter_path = self.dead_letter_path;
        }
    }
}

struct Entry {
    job: Job,
    /// Registry-wide sequence number of the last change
    touched: u64,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<String, Entry>,
    /// Tokens of runs that have not reached a terminal state
    running: HashMap<String, CancellationToken>,
    subscribers: HashMap<String, Vec<(u64, mpsc::UnboundedSender<Job>)>>,
    sequence: u64,
    next_subscriber: u64,
}

impl Inner {
    fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    fn broadcast(&mut self, job: &Job) {
        if let Some(subscribers) = self.subscribers.get_mut(&job.id) {
            subscribers.retain(|(_, tx)| tx.send(job.clone()).is_ok());
            if subscribers.is_empty() {
                self.subscribers.remove(&job.id);
            }
        }
    }

    /// Drop entries until at most `capacity` remain, sparing `keep`
    fn evict(&mut self, capacity: usize, keep: &str) {
        while self.jobs.len() > capacity {
            let victim = self
                .jobs
                .iter()
                .filter(|(id, _)| id.as_str() != keep)
                .min_by_key(|(_, e)| (e.job.status == JobStatus::Running, e.touched))
                .map(|(id, _)| id.clone());
            let Some(victim) = victim else { break };

            if let Some(entry) = self.jobs.remove(&victim) {
                tracing::debug!(job_id = %victim, status = %entry.job.status, "Evicted job record");
            }
        }
    }
}

/// Process-wide job table; clones share the same state
#[derive(Clone)]
pub struct JobRegistry {
    capacity: usize,
    inner: Arc<Mutex<Inner>>,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_JOBS)
    }
}

impl JobRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Start a fresh run for `id`, returning its cancellation token
    pub fn register(
        &self,
        id: &str,
        table: TableSchema,
        source_type: SourceType,
    ) -> IngestResult<CancellationToken> {
        let mut inner = self.lock();
        if inner.running.contains_key(id) {
            return Err(IngestError::AlreadyRunning(id.to_string()));
        }

        let job = Job::new(id, table, source_type);
        let token = CancellationToken::new();
        let touched = inner.next_sequence();
        inner.running.insert(id.to_string(), token.clone());
        inner.jobs.insert(
            id.to_string(),
            Entry {
                job: job.clone(),
                touched,
            },
        );
        let capacity = self.capacity;
        inner.evict(capacity, id);
        inner.broadcast(&job);

        tracing::info!(job_id = %id, table = %table, source = %source_type, "Registered job");
        Ok(token)
    }

    /// Merge counters into the record
    ///
    /// Allowed on terminal jobs so late final counts are kept, but the status
    /// never changes here.
    pub fn update_progress(&self, id: &str, update: ProgressUpdate) -> IngestResult<Job> {
        let mut inner = self.lock();
        let touched = inner.next_sequence();
        let entry = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| IngestError::JobNotFound(id.to_string()))?;

        update.apply(&mut entry.job);
        entry.job.updated_at = Utc::now();
        entry.touched = touched;
        let job = entry.job.clone();
        inner.broadcast(&job);
        Ok(job)
    }

    pub fn complete(&self, id: &str) -> IngestResult<Job> {
        self.finish(id, JobStatus::Completed, None)
    }

    pub fn fail(&self, id: &str, error: impl Into<String>) -> IngestResult<Job> {
        self.finish(id, JobStatus::Failed, Some(error.into()))
    }

    /// Mark the job cancelled and signal its token
    pub fn cancel(&self, id: &str, reason: Option<String>) -> IngestResult<Job> {
        let job = self.finish(id, JobStatus::Cancelled, reason)?;
        tracing::info!(job_id = %id, "Cancellation requested");
        Ok(job)
    }

    fn finish(&self, id: &str, to: JobStatus, error: Option<String>) -> IngestResult<Job> {
        let mut inner = self.lock();
        let touched = inner.next_sequence();

        let Some(entry) = inner.jobs.get_mut(id) else {
            // record evicted while the run is still live
            return match inner.running.remove(id) {
                Some(token) => {
                    if to == JobStatus::Cancelled {
                        token.cancel();
                    }
                    tracing::debug!(job_id = %id, status = %to, "Finished run without a record");
                    Err(IngestError::JobNotFound(id.to_string()))
                },
                None => Err(IngestError::JobNotFound(id.to_string())),
            };
        };

        if entry.job.status.is_terminal() {
            return Err(IngestError::InvalidTransition {
                job_id: id.to_string(),
                from: entry.job.status,
                to,
            });
        }

        let now = Utc::now();
        entry.job.status = to;
        entry.job.error = error;
        entry.job.updated_at = now;
        entry.job.finished_at = Some(now);
        entry.touched = touched;
        let job = entry.job.clone();

        if let Some(token) = inner.running.remove(id) {
            if to == JobStatus::Cancelled {
                token.cancel();
            }
        }
        inner.broadcast(&job);
        Ok(job)
    }

    pub fn get_job(&self, id: &str) -> Option<Job> {
        self.lock().jobs.get(id).map(|e| e.job.clone())
    }

    /// Most recently updated first
    pub fn list_jobs(&self, limit: usize) -> Vec<Job> {
        let inner = self.lock();
        let mut entries: Vec<&Entry> = inner.jobs.values().collect();
        entries.sort_by(|a, b| b.touched.cmp(&a.touched));
        entries.into_iter().take(limit).map(|e| e.job.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Watch a job id
    ///
    /// The current snapshot, if the job exists, is the first item yielded.
    pub fn subscribe(&self, id: &str) -> JobSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();

        if let Some(entry) = inner.jobs.get(id) {
            // receiver is alive, cannot fail
            let _ = tx.send(entry.job.clone());
        }
        inner.next_subscriber += 1;
        let subscriber_id = inner.next_subscriber;
        inner
            .subscribers
            .entry(id.to_string())
            .or_default()
            .push((subscriber_id, tx));

        JobSubscription {
            job_id: id.to_string(),
            subscriber_id,
            rx,
            registry: Arc::downgrade(&self.inner),
        }
    }

    pub fn subscriber_count(&self, id: &str) -> usize {
        self.lock().subscribers.get(id).map_or(0, Vec::len)
    }
}

/// Stream of snapshots for one job; dropping it unsubscribes
pub struct JobSubscription {
    job_id: String,
    subscriber_id: u64,
    rx: mpsc::UnboundedReceiver<Job>,
    registry: Weak<Mutex<Inner>>,
}

impl JobSubscription {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub async fn recv(&mut self) -> Option<Job> {
        self.rx.recv().await
    }

    /// Next snapshot if one is already queued
    pub fn try_recv(&mut self) -> Option<Job> {
        self.rx.try_recv().ok()
    }

    pub fn unsubscribe(self) {}
}

impl Stream for JobSubscription {
    type Item = Job;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Job>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for JobSubscription {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut inner = registry.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(subscribers) = inner.subscribers.get_mut(&self.job_id) {
            subscribers.retain(|(id, _)| *id != self.subscriber_id);
            if subscribers.is_empty() {
                inner.subscribers.remove(&self.job_id);
            }
        }
    }
}
