//! Row and value types moved between source and destination.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A single column value.
///
/// Mirrors the value domain of the MySQL client protocol so a row read from
/// the source can be written back without any lossy conversion. Date and time
/// values are kept as raw components because MySQL allows zero dates that no
/// calendar type can represent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SqlValue {
    /// SQL NULL
    Null,
    /// Signed integer
    Int(i64),
    /// Unsigned integer
    UInt(u64),
    /// Single precision float
    Float(f32),
    /// Double precision float
    Double(f64),
    /// Text
    Text(String),
    /// Raw bytes (text protocol payloads, blobs, decimals)
    Bytes(Vec<u8>),
    /// DATE / DATETIME / TIMESTAMP
    DateTime {
        /// Year
        year: u16,
        /// Month
        month: u8,
        /// Day
        day: u8,
        /// Hour
        hour: u8,
        /// Minute
        minute: u8,
        /// Second
        second: u8,
        /// Microseconds
        micros: u32,
    },
    /// TIME
    Time {
        /// Negative interval
        negative: bool,
        /// Days
        days: u32,
        /// Hours
        hours: u8,
        /// Minutes
        minutes: u8,
        /// Seconds
        seconds: u8,
        /// Microseconds
        micros: u32,
    },
}

impl SqlValue {
    /// Whether the value is NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Int(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// A source row: shared column names plus one value per column.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<SqlValue>,
}

impl Row {
    /// Create a row. `values` must line up with `columns`.
    pub fn new(columns: Arc<[String]>, values: Vec<SqlValue>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    /// Column names in cursor order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Values in cursor order.
    pub fn values(&self) -> &[SqlValue] {
        &self.values
    }

    /// Consume the row, returning its values.
    pub fn into_values(self) -> Vec<SqlValue> {
        self.values
    }

    /// Look up a value by column name.
    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|i| &self.values[i])
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the row has no columns.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// An ordered, bounded group of rows written in one destination operation.
#[derive(Debug, Clone)]
pub struct Batch {
    /// 1-based position of this batch within its table
    pub ordinal: usize,
    /// Rows in cursor order
    pub rows: Vec<Row>,
}

impl Batch {
    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Column names of the batch (taken from the first row).
    pub fn columns(&self) -> &[String] {
        self.rows.first().map(|r| r.columns()).unwrap_or(&[])
    }
}
