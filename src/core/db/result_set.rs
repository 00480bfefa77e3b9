/// Result Set Module
///
/// Forward-only cursor over the rows of a query. Columns are addressed by
/// 1-based index or by case-insensitive name. String and blob columns are
/// materialized into a per-column [`GrowableBuffer`], so the returned slices
/// stay valid until the next call on the result set.
use crate::core::backend::BackendCursor;
use crate::core::datetime;
use crate::core::db::buffer::GrowableBuffer;
use crate::core::db::connection::Connection;
use crate::core::types::{DateTime, Value};
use crate::core::{DbError, Result};
use std::fmt;

static NULL: Value = Value::Null;

/// Column metadata for query results
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    /// 1-based position
    pub index: usize,
}

pub struct ResultSet<'c> {
    connection: &'c Connection,
    cursor: Box<dyn BackendCursor>,
    columns: Vec<ColumnInfo>,
    buffers: Vec<GrowableBuffer>,
    current: Option<Vec<Value>>,
    max_rows: usize,
    fetch_size: usize,
    row_count: usize,
    exhausted: bool,
}

impl<'c> ResultSet<'c> {
    pub(crate) fn new(connection: &'c Connection, mut cursor: Box<dyn BackendCursor>) -> Self {
        let columns: Vec<ColumnInfo> = cursor
            .columns()
            .iter()
            .enumerate()
            .map(|(i, name)| ColumnInfo {
                name: name.clone(),
                index: i + 1,
            })
            .collect();
        let fetch_size = connection.default_row_prefetch();
        if fetch_size > 0 {
            cursor.set_fetch_size(fetch_size);
        }
        ResultSet {
            connection,
            cursor,
            buffers: columns.iter().map(|_| GrowableBuffer::new()).collect(),
            columns,
            current: None,
            max_rows: connection.max_rows(),
            fetch_size,
            row_count: 0,
            exhausted: false,
        }
    }

    /// Advances to the next row.
    ///
    /// Returns `false` at end of data or once the connection's row limit has
    /// been reached.
    pub fn next(&mut self) -> Result<bool> {
        if self.exhausted {
            return Ok(false);
        }
        if self.max_rows > 0 && self.row_count >= self.max_rows {
            self.finish();
            return Ok(false);
        }
        let cursor = &mut self.cursor;
        match self.connection.with_backend(|_| cursor.fetch_row())? {
            Some(row) => {
                self.row_count += 1;
                self.current = Some(row);
                Ok(true)
            }
            None => {
                self.finish();
                Ok(false)
            }
        }
    }

    fn finish(&mut self) {
        self.exhausted = true;
        self.current = None;
        self.cursor.finish();
    }

    /// Rows read so far.
    pub fn row_count(&self) -> usize {
        self.row_count
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn columns(&self) -> &[ColumnInfo] {
        &self.columns
    }

    /// Name of the 1-based column `index`.
    pub fn column_name(&self, index: usize) -> Result<&str> {
        let pos = self.position(index)?;
        Ok(&self.columns[pos].name)
    }

    /// Resolves a column name (case-insensitive) to its 1-based index.
    pub fn column_index(&self, name: &str) -> Result<usize> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
            .map(|c| c.index)
            .ok_or_else(|| DbError::ColumnName(name.to_string()))
    }

    /// Hint for how many rows the backend fetches per round trip.
    pub fn set_fetch_size(&mut self, rows: usize) {
        self.fetch_size = rows;
        self.cursor.set_fetch_size(rows);
    }

    pub fn fetch_size(&self) -> usize {
        self.fetch_size
    }

    fn position(&self, index: usize) -> Result<usize> {
        if index == 0 || index > self.columns.len() {
            return Err(DbError::ColumnIndex {
                index,
                count: self.columns.len(),
            });
        }
        Ok(index - 1)
    }

    fn value(&self, index: usize) -> Result<&Value> {
        let pos = self.position(index)?;
        current_value(&self.current, pos)
    }

    pub fn is_null(&self, index: usize) -> Result<bool> {
        Ok(self.value(index)?.is_null())
    }

    /// Column value as text. SQL NULL is `None`.
    pub fn get_string(&mut self, index: usize) -> Result<Option<&str>> {
        let pos = self.position(index)?;
        let value = current_value(&self.current, pos)?;
        let buffer = &mut self.buffers[pos];
        let bytes = match value {
            Value::Null => {
                buffer.clear();
                return Ok(None);
            }
            Value::Text(s) => buffer.store(s.as_bytes()),
            Value::Blob(b) => buffer.store(b),
            Value::Int(v) | Value::Timestamp(v) => buffer.store(v.to_string().as_bytes()),
            Value::Double(v) => buffer.store(v.to_string().as_bytes()),
        };
        std::str::from_utf8(bytes)
            .map(Some)
            .map_err(|e| DbError::Conversion(format!("column {} is not valid UTF-8: {}", index, e)))
    }

    /// Column value as bytes. SQL NULL is `None`.
    pub fn get_blob(&mut self, index: usize) -> Result<Option<&[u8]>> {
        let pos = self.position(index)?;
        let value = current_value(&self.current, pos)?;
        let buffer = &mut self.buffers[pos];
        let bytes = match value {
            Value::Null => {
                buffer.clear();
                return Ok(None);
            }
            Value::Text(s) => buffer.store(s.as_bytes()),
            Value::Blob(b) => buffer.store(b),
            Value::Int(v) | Value::Timestamp(v) => buffer.store(v.to_string().as_bytes()),
            Value::Double(v) => buffer.store(v.to_string().as_bytes()),
        };
        Ok(Some(bytes))
    }

    /// Column value as a 32-bit integer. SQL NULL reads as 0.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Conversion` if the value is not numeric or does not
    /// fit in an `i32`.
    pub fn get_int(&self, index: usize) -> Result<i32> {
        let value = self.get_long(index)?;
        i32::try_from(value)
            .map_err(|_| DbError::Conversion(format!("{} does not fit in a 32-bit integer", value)))
    }

    /// Column value as a 64-bit integer. SQL NULL reads as 0.
    pub fn get_long(&self, index: usize) -> Result<i64> {
        match self.value(index)? {
            Value::Null => Ok(0),
            Value::Int(v) | Value::Timestamp(v) => Ok(*v),
            Value::Double(v) => Ok(*v as i64),
            Value::Text(s) => parse_long(s),
            Value::Blob(b) => parse_long(utf8(b)?),
        }
    }

    /// Column value as a double. SQL NULL reads as 0.0.
    pub fn get_double(&self, index: usize) -> Result<f64> {
        match self.value(index)? {
            Value::Null => Ok(0.0),
            Value::Int(v) | Value::Timestamp(v) => Ok(*v as f64),
            Value::Double(v) => Ok(*v),
            Value::Text(s) => parse_double(s),
            Value::Blob(b) => parse_double(utf8(b)?),
        }
    }

    /// Column value as epoch seconds. SQL NULL reads as 0.
    pub fn get_timestamp(&self, index: usize) -> Result<i64> {
        match self.value(index)? {
            Value::Null => Ok(0),
            Value::Int(v) | Value::Timestamp(v) => Ok(*v),
            Value::Double(v) => Ok(*v as i64),
            Value::Text(s) => datetime::parse_timestamp(s),
            Value::Blob(b) => datetime::parse_timestamp(utf8(b)?),
        }
    }

    /// Column value as a UTC calendar breakdown. SQL NULL reads as all zeroes.
    pub fn get_datetime(&self, index: usize) -> Result<DateTime> {
        match self.value(index)? {
            Value::Null => Ok(DateTime::default()),
            Value::Int(v) | Value::Timestamp(v) => datetime::from_epoch(*v),
            Value::Double(v) => datetime::from_epoch(*v as i64),
            Value::Text(s) => datetime::parse(s),
            Value::Blob(b) => datetime::parse(utf8(b)?),
        }
    }

    pub fn is_null_by_name(&self, name: &str) -> Result<bool> {
        self.is_null(self.column_index(name)?)
    }

    pub fn get_string_by_name(&mut self, name: &str) -> Result<Option<&str>> {
        let index = self.column_index(name)?;
        self.get_string(index)
    }

    pub fn get_blob_by_name(&mut self, name: &str) -> Result<Option<&[u8]>> {
        let index = self.column_index(name)?;
        self.get_blob(index)
    }

    pub fn get_int_by_name(&self, name: &str) -> Result<i32> {
        self.get_int(self.column_index(name)?)
    }

    pub fn get_long_by_name(&self, name: &str) -> Result<i64> {
        self.get_long(self.column_index(name)?)
    }

    pub fn get_double_by_name(&self, name: &str) -> Result<f64> {
        self.get_double(self.column_index(name)?)
    }

    pub fn get_timestamp_by_name(&self, name: &str) -> Result<i64> {
        self.get_timestamp(self.column_index(name)?)
    }

    pub fn get_datetime_by_name(&self, name: &str) -> Result<DateTime> {
        self.get_datetime(self.column_index(name)?)
    }
}

fn current_value(current: &Option<Vec<Value>>, pos: usize) -> Result<&Value> {
    let row = current
        .as_ref()
        .ok_or_else(|| DbError::SqlExecution("no current row, call next() first".to_string()))?;
    Ok(row.get(pos).unwrap_or(&NULL))
}

fn utf8(bytes: &[u8]) -> Result<&str> {
    std::str::from_utf8(bytes).map_err(|e| DbError::Conversion(format!("value is not valid UTF-8: {}", e)))
}

fn parse_long(text: &str) -> Result<i64> {
    let text = text.trim();
    if let Ok(v) = text.parse::<i64>() {
        return Ok(v);
    }
    match text.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v as i64),
        _ => Err(DbError::Conversion(format!("'{}' is not an integer", text))),
    }
}

fn parse_double(text: &str) -> Result<f64> {
    text.trim()
        .parse::<f64>()
        .map_err(|_| DbError::Conversion(format!("'{}' is not a number", text)))
}

impl fmt::Debug for ResultSet<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultSet")
            .field("columns", &self.columns)
            .field("row_count", &self.row_count)
            .field("max_rows", &self.max_rows)
            .field("exhausted", &self.exhausted)
            .finish()
    }
}
