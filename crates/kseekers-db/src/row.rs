//! Owned result rows returned by read queries.

use std::sync::Arc;

use rusqlite::types::{FromSql, Value, ValueRef};
use rusqlite::{Connection, Params};
use serde_json::{Map, Number};

use crate::error::DbError;

/// One row of a query result, detached from the statement that produced it.
///
/// Column names are shared between all rows of the same result set.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    /// Column names in select-list order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Raw values in select-list order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Raw value of the named column, if present.
    pub fn value(&self, column: &str) -> Option<&Value> {
        self.position(column).map(|idx| &self.values[idx])
    }

    /// Decodes the named column into `T`.
    ///
    /// # Errors
    ///
    /// Returns `DbError::NoSuchColumn` if the column is absent and
    /// `DbError::Column` if the value does not convert to `T`.
    pub fn get<T: FromSql>(&self, column: &str) -> Result<T, DbError> {
        let idx = self
            .position(column)
            .ok_or_else(|| DbError::NoSuchColumn(column.to_string()))?;
        self.decode(idx)
    }

    /// Decodes the column at `idx` into `T`.
    ///
    /// # Errors
    ///
    /// Returns `DbError::NoSuchColumn` if `idx` is out of range and
    /// `DbError::Column` if the value does not convert to `T`.
    pub fn get_index<T: FromSql>(&self, idx: usize) -> Result<T, DbError> {
        if idx >= self.values.len() {
            return Err(DbError::NoSuchColumn(format!("#{idx}")));
        }
        self.decode(idx)
    }

    /// Renders the row as a JSON object keyed by column name.
    ///
    /// Blobs become lowercase hex strings; non-finite reals become `null`.
    pub fn to_json(&self) -> Map<String, serde_json::Value> {
        self.columns
            .iter()
            .zip(&self.values)
            .map(|(name, value)| (name.clone(), value_to_json(value)))
            .collect()
    }

    fn position(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }

    fn decode<T: FromSql>(&self, idx: usize) -> Result<T, DbError> {
        T::column_result(ValueRef::from(&self.values[idx])).map_err(|source| DbError::Column {
            column: self.columns[idx].clone(),
            source,
        })
    }
}

fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Integer(i) => serde_json::Value::Number(Number::from(*i)),
        Value::Real(f) => Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Text(s) => serde_json::Value::String(s.clone()),
        Value::Blob(b) => serde_json::Value::String(hex::encode(b)),
    }
}

/// Runs `sql` on `conn` and collects every row into owned [`Row`]s.
pub(crate) fn fetch_all<P: Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<Row>, DbError> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Arc<[String]> = stmt
        .column_names()
        .into_iter()
        .map(String::from)
        .collect();

    let mut rows = stmt.query(params)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let values = (0..columns.len())
            .map(|idx| row.get::<_, Value>(idx))
            .collect::<Result<Vec<_>, _>>()?;
        out.push(Row {
            columns: Arc::clone(&columns),
            values,
        });
    }

    Ok(out)
}

/// Runs `sql` on `conn`, mapping each row with `f`.
pub(crate) fn fetch_map<T, P, F>(
    conn: &Connection,
    sql: &str,
    params: P,
    f: F,
) -> Result<Vec<T>, DbError>
where
    P: Params,
    F: FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
{
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, f)?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}
