//! Ad-hoc query pipeline
//!
//! Exploratory queries are not layers: they get a display page with
//! spatial columns rendered as WKT, a per-column cell-identifier flag, and
//! an optional conversion into one feature group per geometry kind.

use crate::compose::GEOMETRY_ALIAS;
use crate::decode::wkb::read_wkb;
use crate::error::{EngineError, Result};
use crate::iter::CancelFlag;
use geo_types::Geometry;
use geoflake_ir::{
    quote_ident, ColumnDescriptor, Feature, Field, GeometryKind, Row, Source, TypeCode, Value,
};
use geoflake_session::{QueryContext, Session};
use serde::Serialize;
use tracing::{debug, info, warn};

/// One page of an ad-hoc query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Preview {
    pub columns: Vec<ColumnDescriptor>,
    pub rows: Vec<Row>,
    /// Per column: whether any value of the whole result is a valid cell id
    pub cell_flags: Vec<bool>,
}

impl Preview {
    /// Names of the columns flagged as cell identifiers.
    pub fn cell_columns(&self) -> Vec<&str> {
        self.columns
            .iter()
            .zip(&self.cell_flags)
            .filter(|(_, flag)| **flag)
            .map(|(c, _)| c.name.as_str())
            .collect()
    }
}

/// Run `query` for display.
///
/// The page holds at most `limit` rows. Cell flags are computed over the
/// unlimited query; when the warehouse rejects the validity function for
/// this data, every flag is false.
pub fn preview(
    session: &dyn Session,
    connection: &str,
    context: &QueryContext,
    query: &str,
    limit: usize,
) -> Result<Preview> {
    let from = Source::query(query).from_clause();
    let columns = describe(session, connection, context, &from)?;

    let projection = columns
        .iter()
        .map(|c| {
            let ident = quote_ident(&c.name);
            if c.type_code.encoding().is_some() {
                format!("ST_ASWKT({ident}) AS {ident}")
            } else {
                ident
            }
        })
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!("SELECT {projection} FROM {from} LIMIT {limit}");
    debug!(sql = %sql, "Preview page");
    let rows = session.query_all(connection, &sql, context)?;

    let cell_flags = cell_flags(session, connection, context, &from, &columns)?;
    info!(columns = columns.len(), rows = rows.len(), "Previewed query");
    Ok(Preview {
        columns,
        rows,
        cell_flags,
    })
}

fn describe(
    session: &dyn Session,
    connection: &str,
    context: &QueryContext,
    from: &str,
) -> Result<Vec<ColumnDescriptor>> {
    let sql = format!("SELECT * FROM {from} LIMIT 0");
    let mut cursor = session.execute_query(connection, &sql, context)?;
    let columns = cursor.description().to_vec();
    cursor.close();
    Ok(columns)
}

/// One aggregate probe for all columns at once.
fn cell_flags(
    session: &dyn Session,
    connection: &str,
    context: &QueryContext,
    from: &str,
    columns: &[ColumnDescriptor],
) -> Result<Vec<bool>> {
    if !columns.iter().any(|c| c.type_code.can_hold_cell_id()) {
        return Ok(vec![false; columns.len()]);
    }

    let probes = columns
        .iter()
        .map(|c| {
            let ident = quote_ident(&c.name);
            if c.type_code.can_hold_cell_id() {
                format!("COUNT_IF(H3_IS_VALID_CELL({ident})) > 0 AS {ident}")
            } else {
                format!("FALSE AS {ident}")
            }
        })
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!("SELECT {probes} FROM {from}");

    match session.query_all(connection, &sql, context) {
        Ok(rows) => {
            let first = rows.into_iter().next().unwrap_or_default();
            Ok((0..columns.len())
                .map(|i| first.get(i).and_then(Value::as_bool).unwrap_or(false))
                .collect())
        }
        Err(err) if err.is_cell_function_unsupported() => {
            warn!(error = %err, "Cell validity unsupported for this query, no cell columns");
            Ok(vec![false; columns.len()])
        }
        Err(err) => Err(err.into()),
    }
}

/// Features of one geometry kind from an ad-hoc query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayerGroup {
    pub kind: GeometryKind,
    pub fields: Vec<Field>,
    #[serde(skip)]
    pub features: Vec<Feature>,
}

/// Split an ad-hoc query into one feature group per geometry kind.
///
/// `geometry_column` is projected as WKB; rows where it is null or does not
/// decode to a known kind are skipped. Groups appear in first-seen order.
/// Returns [`EngineError::Cancelled`] if `cancel` is raised mid-way.
pub fn collect_layers(
    session: &dyn Session,
    connection: &str,
    context: &QueryContext,
    query: &str,
    geometry_column: &str,
    batch_size: usize,
    cancel: &CancelFlag,
) -> Result<Vec<LayerGroup>> {
    let from = Source::query(query).from_clause();
    let columns = describe(session, connection, context, &from)?;
    let geometry_index = columns
        .iter()
        .position(|c| c.name == geometry_column)
        .ok_or_else(|| EngineError::UnknownField(geometry_column.to_string()))?;

    let fields: Vec<Field> = columns
        .iter()
        .filter(|c| c.name != geometry_column)
        .map(Field::from_descriptor)
        .collect();
    let mut projection: Vec<String> = columns
        .iter()
        .filter(|c| c.name != geometry_column)
        .map(|c| quote_ident(&c.name))
        .collect();
    projection.push(format!(
        "ST_ASWKB({}) AS {}",
        quote_ident(&columns[geometry_index].name),
        quote_ident(GEOMETRY_ALIAS)
    ));
    let sql = format!("SELECT {} FROM {from}", projection.join(", "));

    let mut cursor = session.execute_query(connection, &sql, context)?;
    let mut groups: Vec<LayerGroup> = Vec::new();
    let mut skipped = 0u64;
    let mut next_id = 0i64;
    let batch_size = batch_size.max(1);

    loop {
        if cancel.is_cancelled() {
            cursor.close();
            info!("Layer collection cancelled");
            return Err(EngineError::Cancelled);
        }
        let batch = match cursor.fetch_many(batch_size) {
            Ok(batch) => batch,
            Err(err) => {
                cursor.close();
                return Err(err.into());
            }
        };
        let done = batch.len() < batch_size;

        for mut row in batch {
            if cancel.is_cancelled() {
                cursor.close();
                return Err(EngineError::Cancelled);
            }
            let payload = row.pop().unwrap_or(Value::Null);
            let geometry = match payload {
                Value::Binary(bytes) => read_wkb(&bytes).ok(),
                _ => None,
            };
            let Some((geometry, kind)) = geometry.and_then(|g| kind_of(&g).map(|k| (g, k))) else {
                skipped += 1;
                continue;
            };

            let feature = Feature {
                id: next_id,
                geometry: Some(geometry),
                attributes: row,
            };
            next_id += 1;
            match groups.iter_mut().find(|g| g.kind == kind) {
                Some(group) => group.features.push(feature),
                None => groups.push(LayerGroup {
                    kind,
                    fields: fields.clone(),
                    features: vec![feature],
                }),
            }
        }
        if done {
            break;
        }
    }
    cursor.close();

    info!(
        groups = groups.len(),
        features = next_id,
        skipped,
        "Collected ad-hoc layers"
    );
    Ok(groups)
}

pub fn kind_of(geometry: &Geometry<f64>) -> Option<GeometryKind> {
    match geometry {
        Geometry::Point(_) => Some(GeometryKind::Point),
        Geometry::LineString(_) => Some(GeometryKind::LineString),
        Geometry::Polygon(_) => Some(GeometryKind::Polygon),
        Geometry::MultiPoint(_) => Some(GeometryKind::MultiPoint),
        Geometry::MultiLineString(_) => Some(GeometryKind::MultiLineString),
        Geometry::MultiPolygon(_) => Some(GeometryKind::MultiPolygon),
        Geometry::GeometryCollection(_) => Some(GeometryKind::GeometryCollection),
        Geometry::Line(_) | Geometry::Rect(_) | Geometry::Triangle(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::wkb::write_wkb;
    use geo_types::{line_string, Point};
    use geoflake_session::{MockSession, CELL_FUNCTION_UNSUPPORTED};

    fn ad_hoc(session: &MockSession) {
        session.on(
            "LIMIT 0",
            &[
                ("NAME", TypeCode::Text),
                ("G", TypeCode::Geography),
                ("FLAG", TypeCode::Boolean),
            ],
            vec![],
        );
    }

    #[test]
    fn test_preview_renders_wkt_and_flags() {
        let session = MockSession::new();
        ad_hoc(&session);
        session
            .on(
                "ST_ASWKT(\"G\") AS \"G\"",
                &[("NAME", TypeCode::Text), ("G", TypeCode::Text), ("FLAG", TypeCode::Boolean)],
                vec![vec!["a".into(), "POINT(1 2)".into(), Value::Bool(true)]],
            )
            .on(
                "COUNT_IF(H3_IS_VALID_CELL(\"NAME\")) > 0 AS \"NAME\"",
                &[("NAME", TypeCode::Boolean), ("G", TypeCode::Boolean), ("FLAG", TypeCode::Boolean)],
                vec![vec![Value::Bool(true), Value::Bool(false), Value::Bool(false)]],
            );

        let preview = preview(&session, "c", &QueryContext::new(), "SELECT * FROM T;", 10).unwrap();
        assert_eq!(preview.rows.len(), 1);
        assert_eq!(preview.cell_flags, vec![true, false, false]);
        assert_eq!(preview.cell_columns(), vec!["NAME"]);

        let queries = session.queries();
        assert_eq!(
            queries[1],
            "SELECT \"NAME\", ST_ASWKT(\"G\") AS \"G\", \"FLAG\" FROM (SELECT * FROM T) LIMIT 10"
        );
        // The probe runs against the unlimited query
        assert_eq!(
            queries[2],
            "SELECT COUNT_IF(H3_IS_VALID_CELL(\"NAME\")) > 0 AS \"NAME\", FALSE AS \"G\", \
             FALSE AS \"FLAG\" FROM (SELECT * FROM T)"
        );
    }

    #[test]
    fn test_preview_tolerates_unsupported_probe() {
        let session = MockSession::new();
        ad_hoc(&session);
        session
            .on("ST_ASWKT", &[("NAME", TypeCode::Text)], vec![])
            .fail(
                "H3_IS_VALID_CELL",
                CELL_FUNCTION_UNSUPPORTED,
                "100419 (P0000): invalid cell",
            );
        let preview = preview(&session, "c", &QueryContext::new(), "SELECT * FROM T", 5).unwrap();
        assert_eq!(preview.cell_flags, vec![false, false, false]);
    }

    #[test]
    fn test_preview_propagates_other_probe_errors() {
        let session = MockSession::new();
        ad_hoc(&session);
        session
            .on("ST_ASWKT", &[("NAME", TypeCode::Text)], vec![])
            .fail("H3_IS_VALID_CELL", 390114, "authentication token expired");
        assert!(preview(&session, "c", &QueryContext::new(), "SELECT * FROM T", 5).is_err());
    }

    #[test]
    fn test_collect_layers_groups_by_kind() {
        let session = MockSession::new();
        ad_hoc(&session);
        let point = write_wkb(&Geometry::Point(Point::new(1.0, 2.0)));
        let line = write_wkb(&Geometry::LineString(line_string![(x: 0.0, y: 0.0), (x: 1.0, y: 1.0)]));
        session.on(
            "ST_ASWKB(\"G\")",
            &[("NAME", TypeCode::Text), ("FLAG", TypeCode::Boolean), ("geoflake_geometry", TypeCode::Binary)],
            vec![
                vec!["a".into(), Value::Bool(true), Value::Binary(point.clone())],
                vec!["b".into(), Value::Bool(true), Value::Null],
                vec!["c".into(), Value::Bool(false), Value::Binary(line)],
                vec!["d".into(), Value::Bool(false), Value::Binary(vec![0, 1])],
                vec!["e".into(), Value::Bool(false), Value::Binary(point)],
            ],
        );

        let groups = collect_layers(
            &session,
            "c",
            &QueryContext::new(),
            "SELECT * FROM T",
            "G",
            2,
            &CancelFlag::new(),
        )
        .unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].kind, GeometryKind::Point);
        assert_eq!(groups[0].features.len(), 2);
        assert_eq!(groups[0].features[1].attributes[0], Value::Text("e".into()));
        assert_eq!(groups[1].kind, GeometryKind::LineString);
        let names: Vec<_> = groups[0].fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["NAME", "FLAG"]);
        assert_eq!(session.open_cursors(), 0);
    }

    #[test]
    fn test_collect_layers_cancelled() {
        let session = MockSession::new();
        ad_hoc(&session);
        session.on("ST_ASWKB", &[("geoflake_geometry", TypeCode::Binary)], vec![]);
        let cancel = CancelFlag::new();
        cancel.cancel();
        let result = collect_layers(&session, "c", &QueryContext::new(), "SELECT 1", "G", 10, &cancel);
        assert!(matches!(result, Err(EngineError::Cancelled)));
        assert_eq!(session.open_cursors(), 0);

        let missing = collect_layers(&session, "c", &QueryContext::new(), "SELECT 1", "NOPE", 10, &CancelFlag::new());
        assert!(matches!(missing, Err(EngineError::UnknownField(_))));
    }
}
