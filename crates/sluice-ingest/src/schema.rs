//! Target table catalog
//!
//! The set of tables the engine can load into is closed. A job resolves its
//! [`TableSchema`] once from the requested table name; per-row code only
//! walks the static column descriptors.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Storage type of a target column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    /// 64-bit signed integer
    Integer,
    /// Arbitrary precision numeric
    Decimal,
    /// `YYYY-MM-DD`
    Date,
    /// RFC 3339 or `YYYY-MM-DD HH:MM:SS` (interpreted as UTC)
    Timestamp,
    Boolean,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub ty: ColumnType,
    pub required: bool,
    pub primary_key: bool,
}

const fn pk(name: &'static str, ty: ColumnType) -> Column {
    Column {
        name,
        ty,
        required: true,
        primary_key: true,
    }
}

const fn required(name: &'static str, ty: ColumnType) -> Column {
    Column {
        name,
        ty,
        required: true,
        primary_key: false,
    }
}

const fn optional(name: &'static str, ty: ColumnType) -> Column {
    Column {
        name,
        ty,
        required: false,
        primary_key: false,
    }
}

const CUSTOMERS: &[Column] = &[
    pk("id", ColumnType::Integer),
    required("email", ColumnType::Text),
    required("name", ColumnType::Text),
    optional("country", ColumnType::Text),
    optional("created_at", ColumnType::Timestamp),
];

const ORDERS: &[Column] = &[
    pk("id", ColumnType::Integer),
    required("customer_id", ColumnType::Integer),
    required("order_date", ColumnType::Date),
    required("total", ColumnType::Decimal),
    required("currency", ColumnType::Text),
    optional("status", ColumnType::Text),
    optional("attributes", ColumnType::Json),
];

const PRICE_LIST: &[Column] = &[
    pk("sku", ColumnType::Text),
    pk("valid_from", ColumnType::Date),
    required("price", ColumnType::Decimal),
    required("currency", ColumnType::Text),
    optional("active", ColumnType::Boolean),
];

pub const KEY_SEPARATOR: &str = "\u{1f}";

/// One of the supported target tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableSchema {
    Customers,
    Orders,
    PriceList,
}

impl TableSchema {
    pub const ALL: [TableSchema; 3] = [
        TableSchema::Customers,
        TableSchema::Orders,
        TableSchema::PriceList,
    ];

    pub fn table_name(self) -> &'static str {
        match self {
            TableSchema::Customers => "customers",
            TableSchema::Orders => "orders",
            TableSchema::PriceList => "price_list",
        }
    }

    /// Columns in bulk-load order
    pub fn columns(self) -> &'static [Column] {
        match self {
            TableSchema::Customers => CUSTOMERS,
            TableSchema::Orders => ORDERS,
            TableSchema::PriceList => PRICE_LIST,
        }
    }

    pub fn primary_key(self) -> impl Iterator<Item = (usize, &'static Column)> {
        self.columns()
            .iter()
            .enumerate()
            .filter(|(_, c)| c.primary_key)
    }

    /// Comma separated column list for SQL statements
    pub fn column_list(self) -> String {
        self.columns()
            .iter()
            .map(|c| c.name)
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Primary key values of an ordered row, joined with a unit separator
    pub fn key_of(self, values: &[Option<String>]) -> String {
        self.primary_key()
            .map(|(i, _)| values.get(i).and_then(|v| v.as_deref()).unwrap_or_default())
            .collect::<Vec<_>>()
            .join(KEY_SEPARATOR)
    }

    pub fn primary_key_list(self) -> String {
        self.primary_key()
            .map(|(_, c)| c.name)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for TableSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

impl FromStr for TableSchema {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        match wanted.as_str() {
            "customers" => Ok(TableSchema::Customers),
            "orders" => Ok(TableSchema::Orders),
            // "pricing" is what operators tend to type
            "price_list" | "pricing" => Ok(TableSchema::PriceList),
            _ => Err(format!(
                "unsupported table {s:?}; expected one of customers, orders, price_list"
            )),
        }
    }
}
