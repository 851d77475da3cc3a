//! Opening warehouse sessions from named connection parameters

use crate::config::ConnectionParams;
use anyhow::{bail, Context, Result};
use geoflake_session::{DuckSession, QueryContext};
use std::sync::Arc;
use tracing::info;

/// Open the session a connection describes.
///
/// Recognised keys: `kind` (only `duckdb`), `path` (in-memory when absent)
/// and `init_sql`, run once after connecting.
pub fn open_session(name: &str, params: &ConnectionParams) -> Result<Arc<DuckSession>> {
    let kind = params.get("kind").map(String::as_str).unwrap_or("duckdb");
    if kind != "duckdb" {
        bail!("connection '{name}': unsupported kind '{kind}'");
    }

    let session = match params.get("path") {
        Some(path) => DuckSession::open(path)
            .with_context(|| format!("connection '{name}': cannot open {path}"))?,
        None => DuckSession::open_in_memory()
            .with_context(|| format!("connection '{name}': cannot open in-memory database"))?,
    };
    if let Some(sql) = params.get("init_sql") {
        session
            .execute_batch(sql)
            .with_context(|| format!("connection '{name}': init_sql failed"))?;
    }

    info!(
        connection = name,
        path = params.get("path").map(String::as_str).unwrap_or(":memory:"),
        "session opened"
    );
    Ok(Arc::new(session))
}

/// Namespace statements run in, from the `database` and `schema` keys.
pub fn query_context(params: &ConnectionParams) -> QueryContext {
    let mut context = QueryContext::new();
    if let Some(database) = params.get("database") {
        context = context.with_database(database);
    }
    if let Some(schema) = params.get("schema") {
        context = context.with_schema(schema);
    }
    context
}
