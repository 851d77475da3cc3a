//! Engine behaviour against an embedded DuckDB database
//!
//! DuckDB ships without the warehouse's spatial and cell functions, so these
//! tests cover the paths that must degrade cleanly without them.

#![cfg(feature = "duckdb")]

use geoflake_engine::prelude::*;
use geoflake_engine::preview;
use geoflake_ir::Value;
use geoflake_session::DuckSession;
use std::sync::Arc;

fn session() -> Arc<DuckSession> {
    let session = DuckSession::open_in_memory().unwrap();
    session
        .execute_batch(
            "CREATE TABLE stations (id BIGINT, name VARCHAR, cell VARCHAR);
             INSERT INTO stations VALUES
                 (1, 'north', '8928308280fffff'),
                 (2, 'south', NULL),
                 (3, 'east', '8928308280bffff');",
        )
        .unwrap();
    Arc::new(session)
}

#[test]
fn test_preview_without_cell_functions() {
    let session = session();
    let page = preview(
        session.as_ref(),
        "local",
        &QueryContext::new(),
        "SELECT id, name FROM stations ORDER BY id",
        2,
    )
    .unwrap();

    let names: Vec<_> = page.columns.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, ["id", "name"]);
    assert_eq!(page.rows.len(), 2);
    assert_eq!(page.rows[0], vec![Value::Int(1), Value::Text("north".into())]);
    assert_eq!(page.cell_flags, vec![false, false]);
}

#[test]
fn test_query_source_without_geometry() {
    let session = session();
    let descriptor = SourceDescriptor::new(
        "local",
        Source::query("SELECT id, name FROM stations"),
    );
    let source = DataSource::open(session, descriptor, EngineConfig::default()).unwrap();

    assert!(source.geometry_spec().is_none());
    assert_eq!(source.fields().len(), 2);
    assert_eq!(source.feature_count().unwrap(), 3);
    assert_eq!(
        source.unique_values("name", Some(2)).unwrap(),
        vec![Value::Text("east".into()), Value::Text("north".into())]
    );
    assert!(!source.is_view().unwrap());
    assert!(matches!(
        source.get_features(&FeatureRequest::new()),
        Err(EngineError::MissingGeometrySpec)
    ));
}
