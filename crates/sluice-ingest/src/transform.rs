//! Row validation and coercion
//!
//! [`RowTransformer`] maps a [`RawRecord`] onto the columns of the job's
//! [`TableSchema`], producing text values already normalised for the bulk
//! loader. Failures come back as a [`Rejection`] carrying a human readable
//! reason; the pipeline decides whether that ends the job.
//!
//! [`BufferKeys`] applies the conflict policy to keys that repeat inside one
//! unflushed buffer, which the store cannot resolve per row.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::types::BigDecimal;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use crate::schema::{Column, ColumnType, TableSchema, KEY_SEPARATOR};
use crate::source::RawRecord;

/// What happens when a row's primary key already exists at write time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Keep the existing row, drop the incoming one
    #[default]
    Nothing,
    /// Overwrite the existing row with the incoming one
    Update,
    /// Treat the duplicate as an error
    Error,
}

impl FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nothing" | "ignore" => Ok(ConflictPolicy::Nothing),
            "update" => Ok(ConflictPolicy::Update),
            "error" => Ok(ConflictPolicy::Error),
            other => Err(format!(
                "unknown conflict policy {other:?}; expected nothing, update or error"
            )),
        }
    }
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictPolicy::Nothing => f.write_str("nothing"),
            ConflictPolicy::Update => f.write_str("update"),
            ConflictPolicy::Error => f.write_str("error"),
        }
    }
}

/// A row ready for encoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedRow {
    /// One entry per schema column, `None` for NULL
    pub values: Vec<Option<String>>,
    /// Primary key values joined with a unit separator
    pub key: String,
}

impl ValidatedRow {
    /// Key with readable separators, for messages
    pub fn display_key(&self) -> String {
        self.key.replace(KEY_SEPARATOR, ", ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionKind {
    Validation,
    Constraint,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub kind: RejectionKind,
    pub reason: String,
}

impl Rejection {
    fn invalid(reason: impl Into<String>) -> Self {
        Self {
            kind: RejectionKind::Validation,
            reason: reason.into(),
        }
    }

    fn constraint(reason: impl Into<String>) -> Self {
        Self {
            kind: RejectionKind::Constraint,
            reason: reason.into(),
        }
    }
}

enum Field<'a> {
    Missing,
    Text(&'a str),
    Json(&'a Value),
}

pub struct RowTransformer {
    table: TableSchema,
    /// Header position of every schema column, once a header is bound
    positions: Option<Vec<Option<usize>>>,
}

impl RowTransformer {
    pub fn new(table: TableSchema) -> Self {
        Self {
            table,
            positions: None,
        }
    }

    pub fn table(&self) -> TableSchema {
        self.table
    }

    /// Resolve column positions from a delimited header
    ///
    /// Fails when a required column is absent, since every row would be
    /// rejected.
    pub fn bind_header(&mut self, headers: &[String]) -> Result<(), String> {
        let positions: Vec<Option<usize>> = self
            .table
            .columns()
            .iter()
            .map(|col| headers.iter().position(|h| h.eq_ignore_ascii_case(col.name)))
            .collect();

        let missing: Vec<&str> = self
            .table
            .columns()
            .iter()
            .zip(&positions)
            .filter(|(col, pos)| col.required && pos.is_none())
            .map(|(col, _)| col.name)
            .collect();
        if !missing.is_empty() {
            return Err(format!(
                "header is missing required column(s) for {}: {}",
                self.table,
                missing.join(", ")
            ));
        }

        self.positions = Some(positions);
        Ok(())
    }

    pub fn transform(&self, record: &RawRecord) -> Result<ValidatedRow, Rejection> {
        let columns = self.table.columns();
        let mut values = Vec::with_capacity(columns.len());

        match record {
            RawRecord::Delimited { headers, values: raw } => {
                if raw.len() != headers.len() {
                    return Err(Rejection::invalid(format!(
                        "expected {} fields, found {}",
                        headers.len(),
                        raw.len()
                    )));
                }
                for (i, col) in columns.iter().enumerate() {
                    let position = match &self.positions {
                        Some(positions) => positions[i],
                        None => headers.iter().position(|h| h.eq_ignore_ascii_case(col.name)),
                    };
                    let field = match position.and_then(|p| raw.get(p)) {
                        Some(text) => Field::Text(text),
                        None => Field::Missing,
                    };
                    values.push(coerce(col, field)?);
                }
            },
            RawRecord::Json(Value::Object(map)) => {
                for col in columns {
                    let field = match map.get(col.name) {
                        None | Some(Value::Null) => Field::Missing,
                        Some(Value::String(s)) => Field::Text(s),
                        Some(other) => Field::Json(other),
                    };
                    values.push(coerce(col, field)?);
                }
            },
            RawRecord::Json(other) => {
                return Err(Rejection::invalid(format!(
                    "record is {}, expected a JSON object",
                    json_kind(other)
                )));
            },
            RawRecord::Undecodable { reason, .. } => return Err(Rejection::invalid(reason.clone())),
        }

        let key = self.table.key_of(&values);

        Ok(ValidatedRow { values, key })
    }
}

fn coerce(col: &Column, field: Field<'_>) -> Result<Option<String>, Rejection> {
    let text = match field {
        Field::Missing => None,
        Field::Text(s) if s.trim().is_empty() => None,
        Field::Text(s) => Some(s),
        Field::Json(value) => return coerce_json(col, value).map(Some),
    };

    let Some(text) = text else {
        if col.required {
            return Err(Rejection::invalid(format!(
                "missing required value for {}",
                col.name
            )));
        }
        return Ok(None);
    };

    if text.contains('\0') {
        return Err(nul_error(col));
    }

    let trimmed = text.trim();
    let normalised = match col.ty {
        ColumnType::Text => text.to_string(),
        ColumnType::Integer => trimmed
            .parse::<i64>()
            .map(|n| n.to_string())
            .map_err(|_| type_error(col, text, "an integer"))?,
        ColumnType::Decimal => BigDecimal::from_str(trimmed)
            .map(|_| trimmed.to_string())
            .map_err(|_| type_error(col, text, "a decimal number"))?,
        ColumnType::Date => NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
            .map(|d| d.format("%Y-%m-%d").to_string())
            .map_err(|_| type_error(col, text, "a YYYY-MM-DD date"))?,
        ColumnType::Timestamp => parse_timestamp(trimmed)
            .map(|ts| ts.to_rfc3339())
            .ok_or_else(|| type_error(col, text, "a timestamp"))?,
        ColumnType::Boolean => parse_bool(trimmed)
            .map(|b| b.to_string())
            .ok_or_else(|| type_error(col, text, "a boolean"))?,
        ColumnType::Json => {
            let value = serde_json::from_str::<Value>(trimmed)
                .map_err(|_| type_error(col, text, "JSON"))?;
            if contains_nul(&value) {
                return Err(nul_error(col));
            }
            value.to_string()
        },
    };
    Ok(Some(normalised))
}

/// Non-string JSON input
fn coerce_json(col: &Column, value: &Value) -> Result<String, Rejection> {
    match (col.ty, value) {
        (ColumnType::Json, v) if contains_nul(v) => Err(nul_error(col)),
        (ColumnType::Json, v) => Ok(v.to_string()),
        (ColumnType::Text | ColumnType::Decimal, Value::Number(n)) => Ok(n.to_string()),
        (ColumnType::Integer, Value::Number(n)) => n
            .as_i64()
            .map(|i| i.to_string())
            .ok_or_else(|| type_error(col, &n.to_string(), "an integer")),
        (ColumnType::Boolean, Value::Bool(b)) => Ok(b.to_string()),
        (ColumnType::Text, Value::Bool(b)) => Ok(b.to_string()),
        (_, v) => Err(Rejection::invalid(format!(
            "column {}: got {}, which does not fit the column type",
            col.name,
            json_kind(v)
        ))),
    }
}

/// PostgreSQL text and jsonb values cannot hold U+0000
fn contains_nul(value: &Value) -> bool {
    match value {
        Value::String(s) => s.contains('\0'),
        Value::Array(items) => items.iter().any(contains_nul),
        Value::Object(map) => map.iter().any(|(k, v)| k.contains('\0') || contains_nul(v)),
        _ => false,
    }
}

fn nul_error(col: &Column) -> Rejection {
    Rejection::invalid(format!("column {}: value contains a NUL character", col.name))
}

fn type_error(col: &Column, raw: &str, expected: &str) -> Rejection {
    Rejection::invalid(format!("column {}: {raw:?} is not {expected}", col.name))
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "t" | "1" | "yes" | "y" => Some(true),
        "false" | "f" | "0" | "no" | "n" => Some(false),
        _ => None,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Outcome of checking a key against the rows already in the buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Accept,
    /// Flush the buffer, then admit the row into the next one
    FlushFirst,
    Reject(Rejection),
}

/// Keys encoded into the current, unflushed buffer
#[derive(Debug)]
pub struct BufferKeys {
    policy: ConflictPolicy,
    keys: HashSet<String>,
}

impl BufferKeys {
    pub fn new(policy: ConflictPolicy) -> Self {
        Self {
            policy,
            keys: HashSet::new(),
        }
    }

    pub fn admit(&mut self, row: &ValidatedRow) -> Admission {
        match self.policy {
            // ON CONFLICT DO NOTHING tolerates repeats within one statement
            ConflictPolicy::Nothing => Admission::Accept,
            ConflictPolicy::Update => {
                if self.keys.contains(&row.key) {
                    Admission::FlushFirst
                } else {
                    self.keys.insert(row.key.clone());
                    Admission::Accept
                }
            },
            ConflictPolicy::Error => {
                if self.keys.insert(row.key.clone()) {
                    Admission::Accept
                } else {
                    Admission::Reject(Rejection::constraint(format!(
                        "duplicate key ({}) earlier in the same batch",
                        row.display_key()
                    )))
                }
            },
        }
    }

    /// Forget a key whose row could not be encoded
    pub fn forget(&mut self, row: &ValidatedRow) {
        self.keys.remove(&row.key);
    }

    pub fn clear(&mut self) {
        self.keys.clear();
    }
}
