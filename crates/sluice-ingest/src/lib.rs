//! Sluice streaming ingestion engine
//!
//! Loads delimited files and paginated JSON APIs into PostgreSQL through the
//! bulk `COPY` path, one job at a time per job id:
//!
//! - [`source`]: lazy, resumable record readers
//! - [`transform`]: validation and coercion against a closed [`schema`]
//! - [`encoder`] and [`buffer_pool`]: allocation-free COPY text encoding
//! - [`sink`]: atomic per-buffer writes with conflict handling
//! - [`dead_letter`] and [`checkpoint`]: durable side outputs
//! - [`registry`]: job lifecycle, cancellation and progress subscriptions
//! - [`pipeline`]: the orchestrator tying it together
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use sluice_ingest::{IngestConfig, JobSpec, MemorySink, StreamingPipeline, TableSchema};
//! use sluice_ingest::source::{FileSourceConfig, SourceConfig};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let pipeline = StreamingPipeline::new(IngestConfig::from_env()?, Arc::new(MemorySink::new()));
//! let spec = JobSpec::new(
//!     "orders-2024-06",
//!     TableSchema::Orders,
//!     SourceConfig::File(FileSourceConfig::new("orders.csv")),
//! );
//! let result = pipeline.run(spec).await?;
//! println!("{} rows inserted", result.inserted_rows);
//! # Ok(())
//! # }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod buffer_pool;
pub mod checkpoint;
pub mod config;
pub mod dead_letter;
pub mod encoder;
pub mod error;
pub mod metrics;
mod paths;
pub mod pipeline;
pub mod registry;
pub mod schema;
pub mod sink;
pub mod source;
pub mod transform;

pub use buffer_pool::BufferPool;
pub use checkpoint::{Checkpoint, CheckpointStore};
pub use config::{DatabaseConfig, IngestConfig};
pub use dead_letter::{DeadLetterCollector, DeadLetterRow};
pub use error::{IngestError, IngestResult};
pub use metrics::{MetricsSummary, RunMetrics};
pub use pipeline::{JobSpec, StreamingEtlResult, StreamingPipeline};
pub use registry::{Job, JobRegistry, JobStatus, JobSubscription, ProgressUpdate};
pub use schema::TableSchema;
pub use sink::{BulkSink, MemorySink, PgBulkWriter, WriteOutcome};
pub use transform::ConflictPolicy;
