//! Streaming pipeline orchestrator
//!
//! [`StreamingPipeline::run`] drives one job end to end:
//!
//! 1. register the job and get its cancellation token
//! 2. open the source, at the saved cursor when resuming
//! 3. validate each record; rejected rows go to the dead-letter collector,
//!    accepted rows are encoded into a pooled buffer
//! 4. hand full buffers to the [`BulkSink`] and publish settled counters
//! 5. every `checkpoint_interval_rows` source rows, flush everything and save
//!    a checkpoint
//! 6. at exhaustion flush, delete the checkpoint and mark the job completed
//!
//! Counters only move when a row's outcome is settled (rejected, or written
//! as part of a committed buffer), so every published snapshot satisfies
//! `attempted == inserted + rejected`.
//!
//! Cancellation is checked before every record and before every write. Once
//! the job is cancelled no new write starts.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::buffer_pool::{BufferPool, PooledBuffer};
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::config::IngestConfig;
use crate::dead_letter::DeadLetterCollector;
use crate::encoder::encode_row;
use crate::error::{IngestError, IngestResult};
use crate::metrics::RunMetrics;
use crate::registry::{JobRegistry, ProgressUpdate};
use crate::schema::TableSchema;
use crate::sink::BulkSink;
use crate::source::{self, RawRecord, SourceConfig, SourceCursor, SourceReader};
use crate::transform::{
    Admission, BufferKeys, ConflictPolicy, Rejection, RejectionKind, RowTransformer, ValidatedRow,
};

/// One ingestion request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    pub job_id: String,
    pub table: TableSchema,
    pub source: SourceConfig,
    #[serde(default)]
    pub on_conflict: ConflictPolicy,
    /// Fail the job on the first rejected row
    #[serde(default)]
    pub strict_mode: bool,
    /// Continue from the job's checkpoint when one exists
    #[serde(default)]
    pub resume: bool,
}

impl JobSpec {
    pub fn new(job_id: impl Into<String>, table: TableSchema, source: SourceConfig) -> Self {
        Self {
            job_id: job_id.into(),
            table,
            source,
            on_conflict: ConflictPolicy::default(),
            strict_mode: false,
            resume: false,
        }
    }

    pub fn with_on_conflict(mut self, policy: ConflictPolicy) -> Self {
        self.on_conflict = policy;
        self
    }

    pub fn with_strict_mode(mut self, strict: bool) -> Self {
        self.strict_mode = strict;
        self
    }

    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }
}

/// Summary of a completed run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingEtlResult {
    pub job_id: String,
    pub duration_ms: u64,
    pub attempted_rows: u64,
    pub inserted_rows: u64,
    pub rejected_rows: u64,
    pub conflicts_skipped: u64,
    pub rows_per_second: f64,
    pub dead_letter_path: Option<String>,
}

pub struct StreamingPipeline {
    config: IngestConfig,
    registry: JobRegistry,
    pool: Arc<BufferPool>,
    sink: Arc<dyn BulkSink>,
    checkpoints: CheckpointStore,
    metrics: Arc<RunMetrics>,
}

impl StreamingPipeline {
    pub fn new(config: IngestConfig, sink: Arc<dyn BulkSink>) -> Self {
        Self {
            registry: JobRegistry::new(config.max_jobs),
            pool: Arc::new(BufferPool::new(config.buffer_size, config.buffer_pool_capacity)),
            checkpoints: CheckpointStore::new(config.checkpoint_dir.clone()),
            metrics: Arc::new(RunMetrics::default()),
            sink,
            config,
        }
    }

    /// Share a registry with other pipelines or a control surface
    pub fn with_registry(mut self, registry: JobRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_buffer_pool(mut self, pool: Arc<BufferPool>) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<RunMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn buffer_pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub fn metrics(&self) -> &RunMetrics {
        &self.metrics
    }

    /// Run one job to completion, failure or cancellation
    ///
    /// Returns [`IngestError::Cancelled`] when the job was cancelled, and the
    /// fatal error otherwise; the registry holds the terminal state either
    /// way.
    pub async fn run(&self, spec: JobSpec) -> IngestResult<StreamingEtlResult> {
        let token = self
            .registry
            .register(&spec.job_id, spec.table, spec.source.source_type())?;
        let span = tracing::info_span!("ingest_job", job_id = %spec.job_id, table = %spec.table);

        async move {
            let started = Instant::now();
            let mut job = JobRun::new(self, &spec, token);
            let outcome = job.execute().await;
            job.finish(outcome, started).await
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    attempted: u64,
    inserted: u64,
    rejected: u64,
    conflicts_skipped: u64,
}

/// State of one running job
struct JobRun<'a> {
    pipeline: &'a StreamingPipeline,
    spec: &'a JobSpec,
    token: CancellationToken,
    transformer: RowTransformer,
    keys: BufferKeys,
    dead_letters: DeadLetterCollector,
    buffer: PooledBuffer,
    offset: usize,
    buffered_rows: u64,
    counters: Counters,
    /// Source position of the next record
    row_index: u64,
    rows_since_checkpoint: u64,
    last_published: u64,
    estimated_total: Option<u64>,
}

impl<'a> JobRun<'a> {
    fn new(pipeline: &'a StreamingPipeline, spec: &'a JobSpec, token: CancellationToken) -> Self {
        Self {
            transformer: RowTransformer::new(spec.table),
            keys: BufferKeys::new(spec.on_conflict),
            dead_letters: DeadLetterCollector::new(
                &pipeline.config.dead_letter_dir,
                &spec.job_id,
                spec.table,
                pipeline.config.dead_letter_capacity,
            ),
            buffer: pipeline.pool.take_buffer(),
            offset: 0,
            buffered_rows: 0,
            counters: Counters::default(),
            row_index: 0,
            rows_since_checkpoint: 0,
            last_published: 0,
            estimated_total: None,
            pipeline,
            spec,
            token,
        }
    }

    fn job_id(&self) -> &str {
        &self.spec.job_id
    }

    fn cancelled(&self) -> IngestError {
        IngestError::Cancelled {
            job_id: self.spec.job_id.clone(),
            reason: self
                .pipeline
                .registry
                .get_job(&self.spec.job_id)
                .and_then(|job| job.error),
        }
    }

    fn check_cancelled(&self) -> IngestResult<()> {
        if self.token.is_cancelled() {
            Err(self.cancelled())
        } else {
            Ok(())
        }
    }

    async fn execute(&mut self) -> IngestResult<()> {
        let cursor = self.resume_point().await;
        let mut source = source::open(&self.spec.source, cursor.as_ref()).await?;

        if let Some(headers) = source.headers() {
            self.transformer
                .bind_header(&headers)
                .map_err(IngestError::Source)?;
        }

        tracing::info!(
            source = %self.spec.source.source_type(),
            on_conflict = %self.spec.on_conflict,
            strict_mode = self.spec.strict_mode,
            start_row = self.row_index,
            "Ingestion started"
        );

        self.drive(&mut *source).await?;
        self.flush().await?;
        self.dead_letters.flush().await?;
        Ok(())
    }

    /// Cursor to restart from; checkpoint problems degrade to a full restart
    async fn resume_point(&mut self) -> Option<SourceCursor> {
        if !self.spec.resume {
            return None;
        }
        match self.pipeline.checkpoints.load(self.job_id()).await {
            Ok(Some(checkpoint)) if checkpoint.table == self.spec.table => {
                tracing::info!(
                    rows_processed = checkpoint.rows_processed,
                    saved_at = %checkpoint.saved_at,
                    "Resuming from checkpoint"
                );
                self.row_index = checkpoint.rows_processed;
                Some(checkpoint.cursor)
            },
            Ok(Some(checkpoint)) => {
                tracing::warn!(
                    checkpoint_table = %checkpoint.table,
                    "Checkpoint belongs to another table, starting from the beginning"
                );
                None
            },
            Ok(None) => {
                tracing::info!("No checkpoint found, starting from the beginning");
                None
            },
            Err(e) => {
                tracing::warn!(error = %e, "Checkpoint unreadable, starting from the beginning");
                None
            },
        }
    }

    async fn drive(&mut self, source: &mut dyn SourceReader) -> IngestResult<()> {
        loop {
            self.check_cancelled()?;

            let Some(record) = source.next_record().await? else {
                return Ok(());
            };
            let index = self.row_index;
            self.row_index += 1;

            match self.transformer.transform(&record) {
                Ok(row) => self.accept(index, &record, row).await?,
                Err(rejection) => self.reject(index, &record, rejection).await?,
            }

            let total = source.estimated_total();
            if total.is_some() && total != self.estimated_total {
                self.estimated_total = total;
                self.publish();
            }

            self.rows_since_checkpoint += 1;
            if self.rows_since_checkpoint >= self.pipeline.config.checkpoint_interval_rows {
                let cursor = source.cursor();
                self.checkpoint(cursor).await?;
            } else if self.counters.attempted - self.last_published
                >= self.pipeline.config.progress_interval_rows
            {
                self.publish();
            }
        }
    }

    async fn accept(&mut self, index: u64, record: &RawRecord, row: ValidatedRow) -> IngestResult<()> {
        match self.keys.admit(&row) {
            Admission::Accept => {},
            Admission::FlushFirst => {
                self.flush().await?;
                self.keys.admit(&row);
            },
            Admission::Reject(rejection) => return self.reject(index, record, rejection).await,
        }

        if let Ok(end) = encode_row(&row.values, &mut self.buffer, self.offset) {
            self.offset = end;
            self.buffered_rows += 1;
            return Ok(());
        }

        // Buffer full: write what is there and retry in the empty buffer
        self.keys.forget(&row);
        if self.buffered_rows > 0 {
            self.flush().await?;
            self.keys.admit(&row);
            if let Ok(end) = encode_row(&row.values, &mut self.buffer, self.offset) {
                self.offset = end;
                self.buffered_rows += 1;
                return Ok(());
            }
            self.keys.forget(&row);
        }

        let rejection = Rejection {
            kind: RejectionKind::Validation,
            reason: format!(
                "encoded row exceeds the {} byte write buffer",
                self.buffer.len()
            ),
        };
        self.reject(index, record, rejection).await
    }

    async fn reject(&mut self, index: u64, record: &RawRecord, rejection: Rejection) -> IngestResult<()> {
        self.dead_letters
            .add(index, record.payload(), rejection.reason.clone());
        self.counters.rejected += 1;
        self.counters.attempted += 1;

        if self.spec.strict_mode {
            self.dead_letters.flush().await?;
            return Err(match rejection.kind {
                RejectionKind::Validation => IngestError::RowValidation {
                    row_index: index,
                    reason: rejection.reason,
                },
                RejectionKind::Constraint => {
                    IngestError::Constraint(format!("row {index}: {}", rejection.reason))
                },
            });
        }

        tracing::trace!(row_index = index, reason = %rejection.reason, "Row rejected");
        self.dead_letters.flush_if_over_capacity().await
    }

    /// Commit the buffered rows
    async fn flush(&mut self) -> IngestResult<()> {
        if self.buffered_rows == 0 {
            return Ok(());
        }
        self.check_cancelled()?;

        let pool = &self.pipeline.pool;
        let full = std::mem::replace(&mut self.buffer, pool.take_buffer());
        let len = std::mem::take(&mut self.offset);
        let rows = std::mem::take(&mut self.buffered_rows);
        self.keys.clear();

        let written = self
            .pipeline
            .sink
            .write(self.spec.table, self.spec.on_conflict, &full[..len], rows)
            .await;
        pool.return_buffer(full);
        let outcome = written?;

        self.counters.attempted += rows;
        self.counters.inserted += rows;
        self.counters.conflicts_skipped += outcome.skipped;

        tracing::debug!(
            rows,
            bytes = len,
            written = outcome.written,
            skipped = outcome.skipped,
            attempted = self.counters.attempted,
            "Flushed buffer"
        );
        self.publish();
        Ok(())
    }

    /// Flush everything, then save the cursor
    async fn checkpoint(&mut self, cursor: SourceCursor) -> IngestResult<()> {
        self.flush().await?;
        self.dead_letters.flush().await?;
        self.rows_since_checkpoint = 0;

        let checkpoint = Checkpoint::new(self.job_id(), self.spec.table, cursor, self.row_index);
        if let Err(e) = self.pipeline.checkpoints.save(&checkpoint).await {
            tracing::warn!(error = %e, "Checkpoint not saved, a resume would restart earlier");
        }
        self.publish();
        Ok(())
    }

    fn progress(&self) -> ProgressUpdate {
        ProgressUpdate {
            attempted_rows: Some(self.counters.attempted),
            inserted_rows: Some(self.counters.inserted),
            rejected_rows: Some(self.counters.rejected),
            dead_letter_count: Some(self.dead_letters.total()),
            conflicts_skipped: Some(self.counters.conflicts_skipped),
            estimated_total: self.estimated_total,
            dead_letter_path: None,
        }
    }

    fn publish(&mut self) {
        self.last_published = self.counters.attempted;
        if let Err(e) = self
            .pipeline
            .registry
            .update_progress(self.job_id(), self.progress())
        {
            tracing::warn!(error = %e, "Progress update dropped");
        }
    }

    /// Record the terminal state and build the result
    async fn finish(
        mut self,
        outcome: IngestResult<()>,
        started: Instant,
    ) -> IngestResult<StreamingEtlResult> {
        let registry = &self.pipeline.registry;

        if outcome.is_err() {
            // rows already counted as rejected must reach the file
            if let Err(e) = self.dead_letters.flush().await {
                tracing::error!(error = %e, "Dead-letter rows lost");
            }
        }
        let dead_letter_path = (self.dead_letters.total() > 0)
            .then(|| self.dead_letters.path().display().to_string());
        let mut update = self.progress();
        update.dead_letter_path = dead_letter_path.clone();
        if let Err(e) = registry.update_progress(self.job_id(), update) {
            tracing::warn!(error = %e, "Final progress update dropped");
        }

        let c = self.counters;
        if let Err(err) = outcome {
            if matches!(err, IngestError::Cancelled { .. }) || self.token.is_cancelled() {
                tracing::info!(attempted = c.attempted, inserted = c.inserted, "Ingestion cancelled");
                return Err(self.cancelled());
            }
            if let Err(e) = registry.fail(self.job_id(), err.to_string()) {
                if self.token.is_cancelled() {
                    return Err(self.cancelled());
                }
                tracing::warn!(error = %e, "Could not record failure");
            }
            tracing::error!(
                error = %err,
                kind = err.kind(),
                attempted = c.attempted,
                inserted = c.inserted,
                rejected = c.rejected,
                "Ingestion failed"
            );
            return Err(err);
        }

        if let Err(e) = self.pipeline.checkpoints.delete(self.job_id()).await {
            tracing::warn!(error = %e, "Checkpoint not deleted");
        }
        match registry.complete(self.job_id()) {
            Ok(_) => {},
            Err(IngestError::InvalidTransition { .. }) if self.token.is_cancelled() => {
                tracing::info!("Cancelled while finishing");
                return Err(self.cancelled());
            },
            Err(e) => tracing::warn!(error = %e, "Could not record completion"),
        }

        let elapsed = started.elapsed();
        let result = StreamingEtlResult {
            job_id: self.spec.job_id.clone(),
            duration_ms: elapsed.as_millis() as u64,
            attempted_rows: c.attempted,
            inserted_rows: c.inserted,
            rejected_rows: c.rejected,
            conflicts_skipped: c.conflicts_skipped,
            rows_per_second: c.attempted as f64 / elapsed.as_secs_f64().max(0.001),
            dead_letter_path,
        };
        self.pipeline.metrics.record(result.clone());

        tracing::info!(
            attempted = result.attempted_rows,
            inserted = result.inserted_rows,
            rejected = result.rejected_rows,
            conflicts_skipped = result.conflicts_skipped,
            duration_ms = result.duration_ms,
            rows_per_second = format!("{:.0}", result.rows_per_second),
            "Ingestion completed"
        );
        Ok(result)
    }
}

impl Drop for JobRun<'_> {
    fn drop(&mut self) {
        self.pipeline
            .pool
            .return_buffer(std::mem::take(&mut self.buffer));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::registry::JobStatus;
    use crate::sink::MemorySink;
    use crate::source::FileSourceConfig;
    use std::io::Write;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        sink: Arc<MemorySink>,
        pipeline: StreamingPipeline,
    }

    fn fixture(configure: impl FnOnce(&mut IngestConfig)) -> Fixture {
        let dir = TempDir::new().unwrap();
        let mut config = IngestConfig {
            dead_letter_dir: dir.path().join("dlq"),
            checkpoint_dir: dir.path().join("cp"),
            ..IngestConfig::default()
        };
        configure(&mut config);
        let sink = Arc::new(MemorySink::new());
        let pipeline = StreamingPipeline::new(config, sink.clone());
        Fixture {
            dir,
            sink,
            pipeline,
        }
    }

    fn write_source(dir: &TempDir, name: &str, content: &str) -> SourceConfig {
        let path = dir.path().join(name);
        std::fs::File::create(&path)
            .unwrap()
            .write_all(content.as_bytes())
            .unwrap();
        SourceConfig::File(FileSourceConfig::new(path))
    }

    const CUSTOMERS: &str = "id,email,name\n1,a@x.io,Ada\n2,b@x.io,Bob\n3,c@x.io,Cy\n";

    #[tokio::test]
    async fn test_small_buffer_flushes_many_times() {
        let f = fixture(|c| c.buffer_size = 24);
        let source = write_source(&f.dir, "c.csv", CUSTOMERS);

        let result = f
            .pipeline
            .run(JobSpec::new("small", TableSchema::Customers, source))
            .await
            .unwrap();

        assert_eq!(result.inserted_rows, 3);
        assert_eq!(f.sink.row_count(TableSchema::Customers), 3);
        assert!(f.sink.write_count() >= 2);
    }

    #[tokio::test]
    async fn test_row_larger_than_buffer_is_rejected() {
        let f = fixture(|c| c.buffer_size = 32);
        let source = write_source(
            &f.dir,
            "c.csv",
            "id,email,name\n1,a@x.io,A\n2,very-long-address@example.com,B\n",
        );

        let result = f
            .pipeline
            .run(JobSpec::new("big-row", TableSchema::Customers, source))
            .await
            .unwrap();
        assert_eq!((result.inserted_rows, result.rejected_rows), (1, 1));
    }

    #[tokio::test]
    async fn test_update_policy_keeps_last_duplicate_in_input() {
        let f = fixture(|_| {});
        let source = write_source(
            &f.dir,
            "c.csv",
            "id,email,name\n1,a@x.io,First\n1,a@x.io,Second\n",
        );

        let result = f
            .pipeline
            .run(JobSpec::new("upd", TableSchema::Customers, source).with_on_conflict(ConflictPolicy::Update))
            .await
            .unwrap();
        assert_eq!(result.inserted_rows, 2);
        assert_eq!(f.sink.write_count(), 2);
        assert_eq!(f.sink.rows(TableSchema::Customers)[0][2].as_deref(), Some("Second"));
    }

    #[tokio::test]
    async fn test_error_policy_rejects_duplicate_within_buffer() {
        let f = fixture(|_| {});
        let source = write_source(&f.dir, "c.csv", "id,email,name\n1,a@x.io,A\n1,a@x.io,B\n2,b@x.io,C\n");

        let result = f
            .pipeline
            .run(JobSpec::new("err", TableSchema::Customers, source).with_on_conflict(ConflictPolicy::Error))
            .await
            .unwrap();
        assert_eq!((result.inserted_rows, result.rejected_rows), (2, 1));
    }

    #[tokio::test]
    async fn test_error_policy_fails_job_on_existing_key() {
        let f = fixture(|_| {});
        let source = write_source(&f.dir, "c.csv", CUSTOMERS);
        f.pipeline
            .run(JobSpec::new("first", TableSchema::Customers, source.clone()))
            .await
            .unwrap();

        let err = f
            .pipeline
            .run(JobSpec::new("second", TableSchema::Customers, source).with_on_conflict(ConflictPolicy::Error))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Constraint(_)));

        let job = f.pipeline.registry().get_job("second").unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempted_rows, 0);
        assert!(job.error.unwrap().contains("Constraint violation"));
    }

    #[tokio::test]
    async fn test_missing_required_header_fails_at_start() {
        let f = fixture(|_| {});
        let source = write_source(&f.dir, "c.csv", "id,name\n1,Ada\n");

        let err = f
            .pipeline
            .run(JobSpec::new("hdr", TableSchema::Customers, source))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Source(ref m) if m.contains("email")), "{err}");
        assert_eq!(f.sink.write_count(), 0);
    }

    #[tokio::test]
    async fn test_already_running_does_not_disturb_job() {
        let f = fixture(|_| {});
        f.pipeline
            .registry()
            .register("busy", TableSchema::Customers, crate::source::SourceType::File)
            .unwrap();
        let source = write_source(&f.dir, "c.csv", CUSTOMERS);

        let err = f
            .pipeline
            .run(JobSpec::new("busy", TableSchema::Customers, source))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::AlreadyRunning(_)));
        assert_eq!(
            f.pipeline.registry().get_job("busy").unwrap().status,
            JobStatus::Running
        );
    }

    #[tokio::test]
    async fn test_completed_run_is_recorded_in_metrics() {
        let f = fixture(|_| {});
        let source = write_source(&f.dir, "c.csv", CUSTOMERS);
        f.pipeline
            .run(JobSpec::new("m", TableSchema::Customers, source))
            .await
            .unwrap();

        let summary = f.pipeline.metrics().summary();
        assert_eq!(summary.runs, 1);
        assert_eq!(summary.total_attempted_rows, 3);
        assert!(f.pipeline.buffer_pool().idle_count() >= 1);
    }

    #[test]
    fn test_job_spec_json() {
        let spec: JobSpec = serde_json::from_value(serde_json::json!({
            "jobId": "j",
            "table": "orders",
            "source": {"type": "api", "url": "https://example.com/orders", "maxPages": 3},
            "onConflict": "update"
        }))
        .unwrap();
        assert_eq!(spec.on_conflict, ConflictPolicy::Update);
        assert!(!spec.strict_mode);
        assert!(matches!(spec.source, SourceConfig::Api(ref api) if api.max_pages == 3));
    }
}
