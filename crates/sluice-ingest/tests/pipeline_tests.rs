//! End-to-end tests for the streaming pipeline over delimited files
//!
//! Every test runs against [`MemorySink`], which applies the same per-buffer
//! atomicity and conflict rules as the PostgreSQL writer, so no database is
//! needed:
//! ```bash
//! cargo test -p sluice-ingest --test pipeline_tests
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use sluice_ingest::dead_letter::DeadLetterRow;
use sluice_ingest::source::{FileSourceConfig, SourceConfig, SourceCursor};
use sluice_ingest::{
    BulkSink, ConflictPolicy, IngestConfig, IngestError, IngestResult, JobRegistry, JobSpec,
    JobStatus, MemorySink, StreamingPipeline, TableSchema, WriteOutcome,
};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

// ============================================================================
// Test Helpers
// ============================================================================

const ORDERS_HEADER: &str = "id,customer_id,order_date,total,currency\n";

fn test_config(dir: &TempDir) -> IngestConfig {
    IngestConfig {
        dead_letter_dir: dir.path().join("dead-letter"),
        checkpoint_dir: dir.path().join("checkpoints"),
        ..IngestConfig::default()
    }
}

fn write_orders(dir: &TempDir, name: &str, rows: &[String]) -> SourceConfig {
    let path = dir.path().join(name);
    let mut content = ORDERS_HEADER.to_string();
    for row in rows {
        content.push_str(row);
        content.push('\n');
    }
    std::fs::write(&path, content).unwrap();
    SourceConfig::File(FileSourceConfig::new(path))
}

fn order(id: u64) -> String {
    format!("{id},7,2024-05-0{},{}.50,EUR", id % 9 + 1, id * 10)
}

fn read_dead_letters(path: &Path) -> Vec<DeadLetterRow> {
    serde_jsonlines::json_lines(path)
        .unwrap()
        .collect::<std::io::Result<Vec<_>>>()
        .unwrap()
}

/// Delegates to a [`MemorySink`], cancelling the job during its first write
struct CancellingSink {
    inner: Arc<MemorySink>,
    registry: JobRegistry,
    job_id: String,
}

#[async_trait]
impl BulkSink for CancellingSink {
    async fn write(
        &self,
        table: TableSchema,
        policy: ConflictPolicy,
        data: &[u8],
        rows: u64,
    ) -> IngestResult<WriteOutcome> {
        let _ = self.registry.cancel(&self.job_id, Some("test".into()));
        self.inner.write(table, policy, data, rows).await
    }
}

/// Delegates to a [`MemorySink`] but fails the n-th write
struct FlakySink {
    inner: Arc<MemorySink>,
    fail_on: u64,
    calls: AtomicU64,
}

#[async_trait]
impl BulkSink for FlakySink {
    async fn write(
        &self,
        table: TableSchema,
        policy: ConflictPolicy,
        data: &[u8],
        rows: u64,
    ) -> IngestResult<WriteOutcome> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_on {
            return Err(IngestError::Database(sqlx::Error::PoolTimedOut));
        }
        self.inner.write(table, policy, data, rows).await
    }
}

// ============================================================================
// Row Fault Isolation
// ============================================================================

#[tokio::test]
async fn test_bad_numeric_row_is_dead_lettered() {
    let dir = TempDir::new().unwrap();
    let sink = Arc::new(MemorySink::new());
    let pipeline = StreamingPipeline::new(test_config(&dir), sink.clone());
    let source = write_orders(
        &dir,
        "orders.csv",
        &[order(1), "2,7,2024-05-02,twelve,EUR".to_string(), order(3)],
    );

    let result = pipeline
        .run(JobSpec::new("scenario-a", TableSchema::Orders, source))
        .await
        .unwrap();

    assert_eq!(result.attempted_rows, 3);
    assert_eq!(result.inserted_rows, 2);
    assert_eq!(result.rejected_rows, 1);
    assert_eq!(sink.row_count(TableSchema::Orders), 2);

    let path = result.dead_letter_path.expect("dead-letter file");
    let rows = read_dead_letters(Path::new(&path));
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].row_index, 1);
    assert!(rows[0].error.contains("total"));
    assert_eq!(rows[0].raw, serde_json::json!(["2", "7", "2024-05-02", "twelve", "EUR"]));

    let job = pipeline.registry().get_job("scenario-a").unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.dead_letter_count, 1);
    assert_eq!(job.dead_letter_path.as_deref(), Some(path.as_str()));
}

#[tokio::test]
async fn test_dead_letter_count_matches_rejected_rows() {
    let dir = TempDir::new().unwrap();
    let config = IngestConfig {
        dead_letter_capacity: 2,
        ..test_config(&dir)
    };
    let pipeline = StreamingPipeline::new(config, Arc::new(MemorySink::new()));

    let rows: Vec<String> = (0..20)
        .map(|i| if i % 3 == 0 { format!("{i},7,not-a-date,1,EUR") } else { order(i) })
        .collect();
    let source = write_orders(&dir, "orders.csv", &rows);

    let result = pipeline
        .run(JobSpec::new("many-bad", TableSchema::Orders, source))
        .await
        .unwrap();
    assert_eq!(result.rejected_rows, 7);
    assert_eq!(result.attempted_rows, result.inserted_rows + result.rejected_rows);

    let dead = read_dead_letters(Path::new(&result.dead_letter_path.unwrap()));
    assert_eq!(dead.len() as u64, result.rejected_rows);
    let indices: Vec<u64> = dead.iter().map(|r| r.row_index).collect();
    assert_eq!(indices, vec![0, 3, 6, 9, 12, 15, 18]);
    assert!(dead.iter().all(|r| !r.error.is_empty()));
}

#[tokio::test]
async fn test_strict_mode_fails_on_first_rejection() {
    let dir = TempDir::new().unwrap();
    let sink = Arc::new(MemorySink::new());
    let pipeline = StreamingPipeline::new(test_config(&dir), sink.clone());
    let source = write_orders(
        &dir,
        "orders.csv",
        &[order(1), "2,,2024-05-02,1,EUR".to_string(), order(3)],
    );

    let err = pipeline
        .run(JobSpec::new("strict", TableSchema::Orders, source).with_strict_mode(true))
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::RowValidation { row_index: 1, .. }), "{err}");

    let job = pipeline.registry().get_job("strict").unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.unwrap().contains("customer_id"));
    assert_eq!(job.rejected_rows, 1);
    assert_eq!(job.attempted_rows, job.inserted_rows + job.rejected_rows);
    assert_eq!(sink.write_count(), 0);

    let dead = read_dead_letters(Path::new(&job.dead_letter_path.unwrap()));
    assert_eq!(dead.len(), 1);
}

#[tokio::test]
async fn test_invalid_utf8_row_is_dead_lettered() {
    let dir = TempDir::new().unwrap();
    let sink = Arc::new(MemorySink::new());
    let pipeline = StreamingPipeline::new(test_config(&dir), sink.clone());
    let path = dir.path().join("customers.csv");
    std::fs::write(
        &path,
        b"id,email,name\n1,ada@example.com,Ada\n2,rene@example.com,Ren\xe9\n3,bob@example.com,Bob\n",
    )
    .unwrap();
    let source = SourceConfig::File(FileSourceConfig::new(path));

    let result = pipeline
        .run(JobSpec::new("latin1", TableSchema::Customers, source))
        .await
        .unwrap();

    assert_eq!(
        (result.attempted_rows, result.inserted_rows, result.rejected_rows),
        (3, 2, 1)
    );
    assert_eq!(sink.row_count(TableSchema::Customers), 2);

    let dead = read_dead_letters(Path::new(&result.dead_letter_path.unwrap()));
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].row_index, 1);
    assert_eq!(dead[0].raw, serde_json::json!(["2", "rene@example.com", "Ren\u{fffd}"]));
    assert!(dead[0].error.contains("line 3"), "{}", dead[0].error);
}

#[tokio::test]
async fn test_similar_job_ids_write_separate_dead_letter_files() {
    let dir = TempDir::new().unwrap();
    let pipeline = StreamingPipeline::new(test_config(&dir), Arc::new(MemorySink::new()));
    let source = write_orders(&dir, "orders.csv", &[order(1), "2,7,bad,1,EUR".to_string()]);

    let dotted = pipeline
        .run(JobSpec::new("batch.1", TableSchema::Orders, source.clone()))
        .await
        .unwrap();
    let underscored = pipeline
        .run(JobSpec::new("batch_1", TableSchema::Orders, source))
        .await
        .unwrap();

    let dotted_path = dotted.dead_letter_path.clone().unwrap();
    let underscored_path = underscored.dead_letter_path.clone().unwrap();
    assert_ne!(dotted_path, underscored_path);
    for (path, result) in [(&dotted_path, &dotted), (&underscored_path, &underscored)] {
        assert_eq!(read_dead_letters(Path::new(path)).len() as u64, result.rejected_rows);
    }
}

// ============================================================================
// Conflict Policies
// ============================================================================

#[tokio::test]
async fn test_second_run_with_nothing_inserts_no_new_rows() {
    let dir = TempDir::new().unwrap();
    let sink = Arc::new(MemorySink::new());
    let pipeline = StreamingPipeline::new(test_config(&dir), sink.clone());
    let rows: Vec<String> = (1..=5).map(order).collect();
    let source = write_orders(&dir, "orders.csv", &rows);

    let first = pipeline
        .run(JobSpec::new("idem", TableSchema::Orders, source.clone()))
        .await
        .unwrap();
    let second = pipeline
        .run(JobSpec::new("idem", TableSchema::Orders, source))
        .await
        .unwrap();

    assert_eq!(first.inserted_rows, second.inserted_rows);
    assert_eq!(first.conflicts_skipped, 0);
    assert_eq!(second.conflicts_skipped, 5);
    assert_eq!(sink.row_count(TableSchema::Orders), 5);
}

#[tokio::test]
async fn test_update_policy_overwrites_existing_rows() {
    let dir = TempDir::new().unwrap();
    let sink = Arc::new(MemorySink::new());
    let pipeline = StreamingPipeline::new(test_config(&dir), sink.clone());

    let original = write_orders(&dir, "v1.csv", &[order(1)]);
    pipeline
        .run(JobSpec::new("v1", TableSchema::Orders, original))
        .await
        .unwrap();

    let changed = write_orders(&dir, "v2.csv", &["1,7,2024-05-02,99.00,USD".to_string()]);
    let result = pipeline
        .run(JobSpec::new("v2", TableSchema::Orders, changed).with_on_conflict(ConflictPolicy::Update))
        .await
        .unwrap();

    assert_eq!(result.inserted_rows, 1);
    let stored = sink.rows(TableSchema::Orders);
    assert_eq!(stored[0][3].as_deref(), Some("99.00"));
    assert_eq!(stored[0][4].as_deref(), Some("USD"));
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn test_cancel_during_write_stops_before_next_write() {
    let dir = TempDir::new().unwrap();
    let registry = JobRegistry::default();
    let memory = Arc::new(MemorySink::new());
    let sink = Arc::new(CancellingSink {
        inner: memory.clone(),
        registry: registry.clone(),
        job_id: "cancel-me".into(),
    });
    // one row per buffer
    let config = IngestConfig {
        buffer_size: 48,
        ..test_config(&dir)
    };
    let pipeline = StreamingPipeline::new(config, sink).with_registry(registry.clone());
    let rows: Vec<String> = (1..=10).map(order).collect();
    let source = write_orders(&dir, "orders.csv", &rows);

    let err = pipeline
        .run(JobSpec::new("cancel-me", TableSchema::Orders, source))
        .await
        .unwrap_err();

    assert!(matches!(err, IngestError::Cancelled { ref reason, .. } if reason.as_deref() == Some("test")));
    assert_eq!(memory.write_count(), 1);

    let job = registry.get_job("cancel-me").unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.inserted_rows, memory.row_count(TableSchema::Orders) as u64);
    assert_eq!(job.attempted_rows, job.inserted_rows + job.rejected_rows);
}

// ============================================================================
// Checkpoints and Resume
// ============================================================================

#[tokio::test]
async fn test_resume_after_failure_continues_from_checkpoint() {
    let dir = TempDir::new().unwrap();
    let memory = Arc::new(MemorySink::new());
    let config = IngestConfig {
        checkpoint_interval_rows: 4,
        ..test_config(&dir)
    };
    let rows: Vec<String> = (1..=10).map(order).collect();
    let source = write_orders(&dir, "orders.csv", &rows);

    // writes happen at each checkpoint; the second one fails
    let flaky = Arc::new(FlakySink {
        inner: memory.clone(),
        fail_on: 2,
        calls: AtomicU64::new(0),
    });
    let first = StreamingPipeline::new(config.clone(), flaky);
    let err = first
        .run(JobSpec::new("resumable", TableSchema::Orders, source.clone()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "database");
    assert_eq!(memory.row_count(TableSchema::Orders), 4);

    let checkpoint = first.checkpoints().load("resumable").await.unwrap().unwrap();
    assert_eq!(checkpoint.rows_processed, 4);
    let expected_offset = (ORDERS_HEADER.len() + (1..=4).map(|i| order(i).len() + 1).sum::<usize>()) as u64;
    assert_eq!(checkpoint.cursor, SourceCursor::ByteOffset { offset: expected_offset });

    let second = StreamingPipeline::new(config, memory.clone());
    let result = second
        .run(JobSpec::new("resumable", TableSchema::Orders, source).with_resume(true))
        .await
        .unwrap();

    assert_eq!(result.attempted_rows, 6);
    assert_eq!(memory.row_count(TableSchema::Orders), 10);
    assert!(second.checkpoints().load("resumable").await.unwrap().is_none());
}

#[tokio::test]
async fn test_resume_without_checkpoint_starts_over() {
    let dir = TempDir::new().unwrap();
    let pipeline = StreamingPipeline::new(test_config(&dir), Arc::new(MemorySink::new()));
    let source = write_orders(&dir, "orders.csv", &[order(1), order(2)]);

    let result = pipeline
        .run(JobSpec::new("fresh", TableSchema::Orders, source).with_resume(true))
        .await
        .unwrap();
    assert_eq!(result.attempted_rows, 2);
}

#[tokio::test]
async fn test_dead_letter_row_indices_continue_after_resume() {
    let dir = TempDir::new().unwrap();
    let memory = Arc::new(MemorySink::new());
    let config = IngestConfig {
        checkpoint_interval_rows: 2,
        ..test_config(&dir)
    };
    let rows = vec![order(1), order(2), order(3), "4,7,bad,1,EUR".to_string()];
    let source = write_orders(&dir, "orders.csv", &rows);

    let flaky = Arc::new(FlakySink {
        inner: memory.clone(),
        fail_on: 2,
        calls: AtomicU64::new(0),
    });
    StreamingPipeline::new(config.clone(), flaky)
        .run(JobSpec::new("idx", TableSchema::Orders, source.clone()))
        .await
        .unwrap_err();

    let result = StreamingPipeline::new(config, memory)
        .run(JobSpec::new("idx", TableSchema::Orders, source).with_resume(true))
        .await
        .unwrap();
    assert_eq!((result.inserted_rows, result.rejected_rows), (1, 1));

    let dead = read_dead_letters(Path::new(&result.dead_letter_path.unwrap()));
    assert_eq!(dead.last().unwrap().row_index, 3);
}

#[tokio::test]
async fn test_unwritable_checkpoint_dir_does_not_fail_job() {
    let dir = TempDir::new().unwrap();
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"").unwrap();
    let config = IngestConfig {
        checkpoint_dir: blocker,
        checkpoint_interval_rows: 2,
        ..test_config(&dir)
    };
    let sink = Arc::new(MemorySink::new());
    let pipeline = StreamingPipeline::new(config, sink.clone());
    let mut rows: Vec<String> = (1..=6).map(order).collect();
    rows.insert(3, "99,7,2024-05-01,oops,EUR".to_string());
    let source = write_orders(&dir, "orders.csv", &rows);

    let result = pipeline
        .run(JobSpec::new("no-checkpoints", TableSchema::Orders, source))
        .await
        .unwrap();

    assert_eq!(
        (result.attempted_rows, result.inserted_rows, result.rejected_rows),
        (7, 6, 1)
    );
    assert_eq!(sink.row_count(TableSchema::Orders), 6);
    assert!(pipeline.checkpoints().load("no-checkpoints").await.is_err());

    let job = pipeline.registry().get_job("no-checkpoints").unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.error.is_none());
}

#[tokio::test]
async fn test_resume_over_corrupt_checkpoint_restarts_from_first_row() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    std::fs::create_dir_all(&config.checkpoint_dir).unwrap();
    std::fs::write(config.checkpoint_dir.join("damaged.json"), b"{\"jobId\": \"damaged\", ").unwrap();

    let sink = Arc::new(MemorySink::new());
    let pipeline = StreamingPipeline::new(config, sink.clone());
    let source = write_orders(
        &dir,
        "orders.csv",
        &[order(1), "2,7,2024-05-02,nope,EUR".to_string(), order(3), order(4)],
    );

    let result = pipeline
        .run(JobSpec::new("damaged", TableSchema::Orders, source).with_resume(true))
        .await
        .unwrap();

    assert_eq!(
        (result.attempted_rows, result.inserted_rows, result.rejected_rows),
        (4, 3, 1)
    );
    assert_eq!(sink.row_count(TableSchema::Orders), 3);

    let dead = read_dead_letters(Path::new(&result.dead_letter_path.unwrap()));
    assert_eq!(dead[0].row_index, 1);
    // completion deletes the damaged file
    assert!(pipeline.checkpoints().load("damaged").await.unwrap().is_none());
}

// ============================================================================
// Registry
// ============================================================================

#[tokio::test]
async fn test_registry_keeps_max_jobs() {
    let dir = TempDir::new().unwrap();
    let config = IngestConfig {
        max_jobs: 5,
        ..test_config(&dir)
    };
    let pipeline = StreamingPipeline::new(config, Arc::new(MemorySink::new()));
    let source = write_orders(&dir, "orders.csv", &[order(1)]);

    for i in 0..8 {
        pipeline
            .run(JobSpec::new(format!("job-{i}"), TableSchema::Orders, source.clone()))
            .await
            .unwrap();
    }

    let jobs = pipeline.registry().list_jobs(100);
    assert_eq!(jobs.len(), 5);
    let ids: Vec<&str> = jobs.iter().map(|j| j.id.as_str()).collect();
    assert_eq!(ids, vec!["job-7", "job-6", "job-5", "job-4", "job-3"]);
}

#[tokio::test]
async fn test_subscriber_sees_monotonic_consistent_snapshots() {
    let dir = TempDir::new().unwrap();
    let config = IngestConfig {
        buffer_size: 96,
        progress_interval_rows: 1,
        ..test_config(&dir)
    };
    let pipeline = StreamingPipeline::new(config, Arc::new(MemorySink::new()));
    let rows: Vec<String> = (1..=30)
        .map(|i| if i % 7 == 0 { format!("{i},x,2024-01-01,1,EUR") } else { order(i) })
        .collect();
    let source = write_orders(&dir, "orders.csv", &rows);

    let mut subscription = pipeline.registry().subscribe("watched");
    pipeline
        .run(JobSpec::new("watched", TableSchema::Orders, source))
        .await
        .unwrap();

    let mut snapshots = Vec::new();
    while let Some(job) = subscription.try_recv() {
        snapshots.push(job);
    }
    assert!(snapshots.len() > 3, "only {} snapshots", snapshots.len());
    for pair in snapshots.windows(2) {
        assert!(pair[1].attempted_rows >= pair[0].attempted_rows);
        assert!(pair[1].inserted_rows >= pair[0].inserted_rows);
    }
    for job in &snapshots {
        assert_eq!(job.attempted_rows, job.inserted_rows + job.rejected_rows);
    }
    let last = snapshots.last().unwrap();
    assert_eq!(last.status, JobStatus::Completed);
    assert_eq!((last.attempted_rows, last.rejected_rows), (30, 4));
}
