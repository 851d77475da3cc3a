//! Embedded DuckDB session
//!
//! Used for local development and tests. Results are drained eagerly into a
//! [`VecCursor`], so a statement's rows live in memory once executed.

use crate::cursor::{Cursor, CursorTracker, VecCursor};
use crate::error::{WarehouseError, CELL_FUNCTION_UNSUPPORTED};
use crate::{QueryContext, Session};
use chrono::{DateTime, NaiveDate};
use duckdb::arrow::datatypes::DataType;
use duckdb::types::ValueRef;
use duckdb::Connection;
use geoflake_ir::{quote_ident, ColumnDescriptor, Row, TypeCode, Value};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;

#[derive(Debug)]
pub struct DuckSession {
    conn: Mutex<Connection>,
    tracker: Arc<CursorTracker>,
}

impl DuckSession {
    pub fn open_in_memory() -> Result<Self, WarehouseError> {
        let conn = Connection::open_in_memory().map_err(map_error)?;
        Ok(Self::from_connection(conn))
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, WarehouseError> {
        let conn = Connection::open(path).map_err(map_error)?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
            tracker: Arc::new(CursorTracker::default()),
        }
    }

    /// Run setup statements (extension loads, fixtures).
    pub fn execute_batch(&self, sql: &str) -> Result<(), WarehouseError> {
        let conn = self.lock()?;
        conn.execute_batch(sql).map_err(map_error)
    }

    pub fn tracker(&self) -> Arc<CursorTracker> {
        self.tracker.clone()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, WarehouseError> {
        self.conn
            .lock()
            .map_err(|_| WarehouseError::unspecified("duckdb connection poisoned"))
    }
}

impl Session for DuckSession {
    fn execute_query(
        &self,
        connection: &str,
        sql: &str,
        context: &QueryContext,
    ) -> Result<Box<dyn Cursor>, WarehouseError> {
        let conn = self.lock()?;

        if let Some(schema) = &context.schema {
            let target = match &context.database {
                Some(db) => format!("{}.{}", quote_ident(db), quote_ident(schema)),
                None => quote_ident(schema),
            };
            conn.execute_batch(&format!("USE {target}")).map_err(map_error)?;
        }

        debug!(connection = %connection, sql = %sql, "Executing on DuckDB");

        let mut stmt = conn.prepare(sql).map_err(map_error)?;
        let mut rows = stmt.query([]).map_err(map_error)?;

        let description = match rows.as_ref() {
            Some(stmt) => stmt
                .column_names()
                .into_iter()
                .enumerate()
                .map(|(i, name)| {
                    ColumnDescriptor::new(name, type_code_for(&stmt.column_type(i)), i)
                })
                .collect(),
            None => Vec::new(),
        };

        let width = description.len();
        let mut out: Vec<Row> = Vec::new();
        while let Some(row) = rows.next().map_err(map_error)? {
            let mut values = Vec::with_capacity(width);
            for i in 0..width {
                let value_ref = row.get_ref(i).map_err(map_error)?;
                values.push(to_value(value_ref));
            }
            out.push(values);
        }

        Ok(Box::new(
            VecCursor::new(description, out).tracked(self.tracker.clone()),
        ))
    }
}

/// Warehouse type code for an Arrow result type.
fn type_code_for(data_type: &DataType) -> TypeCode {
    match data_type {
        DataType::Boolean => TypeCode::Boolean,
        DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32
        | DataType::UInt64
        | DataType::Decimal128(_, _)
        | DataType::Decimal256(_, _) => TypeCode::Fixed,
        DataType::Float16 | DataType::Float32 | DataType::Float64 => TypeCode::Real,
        DataType::Utf8 | DataType::LargeUtf8 => TypeCode::Text,
        DataType::Date32 | DataType::Date64 => TypeCode::Date,
        DataType::Timestamp(_, None) => TypeCode::TimestampNtz,
        DataType::Timestamp(_, Some(_)) => TypeCode::TimestampTz,
        DataType::Time32(_) | DataType::Time64(_) => TypeCode::Time,
        DataType::Binary | DataType::LargeBinary | DataType::FixedSizeBinary(_) => {
            TypeCode::Binary
        }
        DataType::List(_) | DataType::LargeList(_) | DataType::FixedSizeList(_, _) => {
            TypeCode::Array
        }
        DataType::Struct(_) | DataType::Map(_, _) => TypeCode::Object,
        _ => TypeCode::Variant,
    }
}

fn to_value(value_ref: ValueRef<'_>) -> Value {
    match value_ref {
        ValueRef::Null => Value::Null,
        ValueRef::Boolean(b) => Value::Bool(b),
        ValueRef::TinyInt(i) => Value::Int(i.into()),
        ValueRef::SmallInt(i) => Value::Int(i.into()),
        ValueRef::Int(i) => Value::Int(i.into()),
        ValueRef::BigInt(i) => Value::Int(i),
        ValueRef::UTinyInt(i) => Value::Int(i.into()),
        ValueRef::USmallInt(i) => Value::Int(i.into()),
        ValueRef::UInt(i) => Value::Int(i.into()),
        ValueRef::UBigInt(i) => match i64::try_from(i) {
            Ok(i) => Value::Int(i),
            Err(_) => Value::Text(i.to_string()),
        },
        ValueRef::HugeInt(i) => match i64::try_from(i) {
            Ok(i) => Value::Int(i),
            Err(_) => Value::Text(i.to_string()),
        },
        ValueRef::Float(f) => Value::Double(f.into()),
        ValueRef::Double(f) => Value::Double(f),
        ValueRef::Decimal(d) => d
            .to_string()
            .parse::<f64>()
            .map(Value::Double)
            .unwrap_or_else(|_| Value::Text(d.to_string())),
        ValueRef::Text(bytes) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::Binary(bytes.to_vec()),
        ValueRef::Date32(days) => NaiveDate::from_ymd_opt(1970, 1, 1)
            .and_then(|epoch| epoch.checked_add_signed(chrono::Duration::days(days.into())))
            .map(Value::Date)
            .unwrap_or(Value::Null),
        ValueRef::Timestamp(unit, raw) => DateTime::from_timestamp_micros(unit.to_micros(raw))
            .map(|dt| Value::DateTime(dt.naive_utc()))
            .unwrap_or(Value::Null),
        ValueRef::Time64(unit, raw) => {
            let micros = unit.to_micros(raw);
            let secs = (micros / 1_000_000) as u32;
            let nanos = ((micros % 1_000_000) * 1_000) as u32;
            chrono::NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos)
                .map(Value::Time)
                .unwrap_or(Value::Null)
        }
        other => Value::Text(format!("{:?}", other.to_owned())),
    }
}

/// Map a DuckDB error onto the warehouse error shape.
///
/// DuckDB has no cell functions unless an extension provides them; a missing
/// `h3_*` function is reported as the tolerated "unsupported" code so probes
/// degrade the same way they do on the warehouse.
fn map_error(err: duckdb::Error) -> WarehouseError {
    let message = err.to_string();
    let lower = message.to_ascii_lowercase();
    if lower.contains("function with name h3_") && lower.contains("does not exist") {
        return WarehouseError::new(CELL_FUNCTION_UNSUPPORTED, message);
    }
    WarehouseError::unspecified(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_description_and_values() {
        let session = DuckSession::open_in_memory().unwrap();
        let rows = session
            .query_all(
                "local",
                "SELECT 1::BIGINT AS a, 'x' AS b, 2.5::DOUBLE AS c, NULL AS d, DATE '2024-03-01' AS e",
                &QueryContext::new(),
            )
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0], Value::Int(1));
        assert_eq!(rows[0][1], Value::Text("x".into()));
        assert_eq!(rows[0][2], Value::Double(2.5));
        assert_eq!(rows[0][3], Value::Null);
        assert_eq!(
            rows[0][4],
            Value::Date(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap())
        );

        let cursor = session
            .execute_query(
                "local",
                "SELECT * FROM (SELECT 1::INTEGER AS n, 'a' AS s) LIMIT 0",
                &QueryContext::new(),
            )
            .unwrap();
        let codes: Vec<_> = cursor.description().iter().map(|c| c.type_code).collect();
        assert_eq!(codes, vec![TypeCode::Fixed, TypeCode::Text]);
    }

    #[test]
    fn test_missing_cell_function_maps_to_sentinel() {
        let session = DuckSession::open_in_memory().unwrap();
        let err = session
            .execute_query("local", "SELECT h3_is_valid_cell(1)", &QueryContext::new())
            .err()
            .unwrap();
        assert!(err.is_cell_function_unsupported());
    }

    #[test]
    fn test_use_schema_from_context() {
        let session = DuckSession::open_in_memory().unwrap();
        session
            .execute_batch("CREATE SCHEMA s1; CREATE TABLE s1.t (id INTEGER); INSERT INTO s1.t VALUES (7);")
            .unwrap();
        let rows = session
            .query_all("local", "SELECT id FROM t", &QueryContext::new().with_schema("s1"))
            .unwrap();
        assert_eq!(rows, vec![vec![Value::Int(7)]]);
    }
}
