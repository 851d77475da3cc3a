//! Warehouse session boundary
//!
//! The feature engine never talks to a warehouse driver directly. It receives
//! a [`Session`] and works with the [`Cursor`]s it returns, which keeps every
//! component testable against [`MockSession`].

use geoflake_ir::Row;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub mod cursor;
pub mod error;
pub mod mock;

#[cfg(feature = "duckdb")]
pub mod duck;

pub use cursor::{Cursor, CursorTracker, VecCursor};
pub use error::{WarehouseError, CELL_FUNCTION_UNSUPPORTED};
pub use mock::MockSession;

#[cfg(feature = "duckdb")]
pub use duck::DuckSession;

/// Namespace a statement runs in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
}

impl QueryContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }
}

/// Executes SQL on a named connection.
///
/// Sessions are shared between a data source and all of its iterators, so
/// they must be usable from whichever worker thread owns the iterator.
pub trait Session: Send + Sync {
    fn execute_query(
        &self,
        connection: &str,
        sql: &str,
        context: &QueryContext,
    ) -> Result<Box<dyn Cursor>, WarehouseError>;

    /// Execute and drain in one call, closing the cursor.
    fn query_all(
        &self,
        connection: &str,
        sql: &str,
        context: &QueryContext,
    ) -> Result<Vec<Row>, WarehouseError> {
        let mut cursor = self.execute_query(connection, sql, context)?;
        let rows = cursor.fetch_all();
        cursor.close();
        rows
    }
}

impl<S: Session + ?Sized> Session for Arc<S> {
    fn execute_query(
        &self,
        connection: &str,
        sql: &str,
        context: &QueryContext,
    ) -> Result<Box<dyn Cursor>, WarehouseError> {
        (**self).execute_query(connection, sql, context)
    }
}
