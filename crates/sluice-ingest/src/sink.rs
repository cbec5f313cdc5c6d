//! Bulk writers
//!
//! A [`BulkSink`] receives one filled buffer of COPY text rows at a time and
//! applies it atomically under the job's [`ConflictPolicy`]. Either every row
//! of the buffer is committed (possibly with some skipped as conflicts) or
//! none is.
//!
//! [`PgBulkWriter`] streams the buffer through `COPY ... FROM STDIN`. For the
//! `nothing` and `update` policies rows are copied into a per-session staging
//! table and merged with `INSERT ... ON CONFLICT`, since COPY itself cannot
//! resolve conflicts. [`MemorySink`] emulates the same contract in process.

use async_trait::async_trait;
use sqlx::PgPool;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use crate::encoder::decode_rows;
use crate::error::{IngestError, IngestResult};
use crate::schema::{TableSchema, KEY_SEPARATOR};
use crate::transform::ConflictPolicy;

/// SQLSTATE codes reported as constraint violations
const CONSTRAINT_STATES: &[&str] = &["23502", "23503", "23505", "23514"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Rows inserted or updated
    pub written: u64,
    /// Rows dropped because their key already existed
    pub skipped: u64,
}

#[async_trait]
pub trait BulkSink: Send + Sync {
    /// Apply `rows` encoded rows from `data` as one transaction
    async fn write(
        &self,
        table: TableSchema,
        policy: ConflictPolicy,
        data: &[u8],
        rows: u64,
    ) -> IngestResult<WriteOutcome>;
}

pub struct PgBulkWriter {
    pool: PgPool,
}

impl PgBulkWriter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn copy_into(
        conn: &mut sqlx::PgConnection,
        target: &str,
        table: TableSchema,
        data: &[u8],
    ) -> IngestResult<u64> {
        let mut copy = conn
            .copy_in_raw(&copy_statement(target, table))
            .await
            .map_err(classify)?;
        let sent = copy.send(data).await.map(|_| ());
        if let Err(e) = sent {
            // abort so the connection is usable again
            let _ = copy.abort("client send failed").await;
            return Err(classify(e));
        }
        copy.finish().await.map_err(classify)
    }
}

#[async_trait]
impl BulkSink for PgBulkWriter {
    async fn write(
        &self,
        table: TableSchema,
        policy: ConflictPolicy,
        data: &[u8],
        rows: u64,
    ) -> IngestResult<WriteOutcome> {
        if rows == 0 {
            return Ok(WriteOutcome::default());
        }

        let mut tx = self.pool.begin().await?;

        let written = match policy {
            ConflictPolicy::Error => Self::copy_into(&mut tx, table.table_name(), table, data).await?,
            ConflictPolicy::Nothing | ConflictPolicy::Update => {
                sqlx::query(&stage_statement(table))
                    .execute(&mut *tx)
                    .await
                    .map_err(classify)?;
                Self::copy_into(&mut tx, &stage_name(table), table, data).await?;
                sqlx::query(&merge_statement(table, policy))
                    .execute(&mut *tx)
                    .await
                    .map_err(classify)?
                    .rows_affected()
            },
        };

        tx.commit().await.map_err(classify)?;

        let outcome = WriteOutcome {
            written,
            skipped: rows.saturating_sub(written),
        };
        tracing::debug!(
            table = %table,
            policy = %policy,
            bytes = data.len(),
            written = outcome.written,
            skipped = outcome.skipped,
            "Committed buffer"
        );
        Ok(outcome)
    }
}

fn stage_name(table: TableSchema) -> String {
    format!("{}__sluice_stage", table.table_name())
}

pub(crate) fn copy_statement(target: &str, table: TableSchema) -> String {
    format!(
        "COPY {target} ({}) FROM STDIN WITH (FORMAT text)",
        table.column_list()
    )
}

/// Session-local staging table emptied at every commit
pub(crate) fn stage_statement(table: TableSchema) -> String {
    format!(
        "CREATE TEMP TABLE IF NOT EXISTS {} (LIKE {} INCLUDING DEFAULTS) ON COMMIT DELETE ROWS",
        stage_name(table),
        table.table_name()
    )
}

pub(crate) fn merge_statement(table: TableSchema, policy: ConflictPolicy) -> String {
    let columns = table.column_list();
    let updates: Vec<String> = table
        .columns()
        .iter()
        .filter(|c| !c.primary_key)
        .map(|c| format!("{0} = EXCLUDED.{0}", c.name))
        .collect();

    let action = if policy == ConflictPolicy::Update && !updates.is_empty() {
        format!("DO UPDATE SET {}", updates.join(", "))
    } else {
        "DO NOTHING".to_string()
    };

    format!(
        "INSERT INTO {} ({columns}) SELECT {columns} FROM {} ON CONFLICT ({}) {action}",
        table.table_name(),
        stage_name(table),
        table.primary_key_list(),
    )
}

/// Constraint violations become [`IngestError::Constraint`]
fn classify(err: sqlx::Error) -> IngestError {
    if let sqlx::Error::Database(db) = &err {
        if db
            .code()
            .is_some_and(|code| CONSTRAINT_STATES.iter().any(|state| *state == code))
        {
            return IngestError::Constraint(db.message().to_string());
        }
    }
    IngestError::Database(err)
}

type StoredRows = BTreeMap<String, Vec<Option<String>>>;

/// In-process sink with the same transactional and conflict semantics
///
/// Used for dry runs and tests.
#[derive(Default)]
pub struct MemorySink {
    tables: Mutex<HashMap<TableSchema, StoredRows>>,
    writes: Mutex<u64>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored rows ordered by primary key
    pub fn rows(&self, table: TableSchema) -> Vec<Vec<Option<String>>> {
        self.lock_tables()
            .get(&table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn row_count(&self, table: TableSchema) -> usize {
        self.lock_tables().get(&table).map_or(0, BTreeMap::len)
    }

    /// Number of committed or failed `write` calls
    pub fn write_count(&self) -> u64 {
        *self.writes.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_tables(&self) -> std::sync::MutexGuard<'_, HashMap<TableSchema, StoredRows>> {
        self.tables.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl BulkSink for MemorySink {
    async fn write(
        &self,
        table: TableSchema,
        policy: ConflictPolicy,
        data: &[u8],
        rows: u64,
    ) -> IngestResult<WriteOutcome> {
        *self.writes.lock().unwrap_or_else(|p| p.into_inner()) += 1;

        let decoded = decode_rows(data).map_err(|e| {
            IngestError::Database(sqlx::Error::Protocol(format!("malformed COPY data: {e}")))
        })?;
        if decoded.len() as u64 != rows {
            return Err(IngestError::Database(sqlx::Error::Protocol(format!(
                "expected {rows} rows, buffer holds {}",
                decoded.len()
            ))));
        }
        let width = table.columns().len();
        if let Some(bad) = decoded.iter().find(|row| row.len() != width) {
            return Err(IngestError::Database(sqlx::Error::Protocol(format!(
                "row has {} fields, {table} has {width} columns",
                bad.len()
            ))));
        }

        let mut tables = self.lock_tables();
        let stored = tables.entry(table).or_default();
        let mut outcome = WriteOutcome::default();

        match policy {
            ConflictPolicy::Error => {
                let mut seen = HashSet::new();
                for row in &decoded {
                    let key = table.key_of(row);
                    if stored.contains_key(&key) || !seen.insert(key.clone()) {
                        return Err(IngestError::Constraint(format!(
                            "duplicate key value violates unique constraint on {table}: ({}) already exists",
                            key.replace(KEY_SEPARATOR, ", ")
                        )));
                    }
                }
                for row in decoded {
                    stored.insert(table.key_of(&row), row);
                    outcome.written += 1;
                }
            },
            ConflictPolicy::Nothing => {
                for row in decoded {
                    let key = table.key_of(&row);
                    if stored.contains_key(&key) {
                        outcome.skipped += 1;
                    } else {
                        stored.insert(key, row);
                        outcome.written += 1;
                    }
                }
            },
            ConflictPolicy::Update => {
                for row in decoded {
                    stored.insert(table.key_of(&row), row);
                    outcome.written += 1;
                }
            },
        }

        Ok(outcome)
    }
}
