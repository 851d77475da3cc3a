//! Clause composer
//!
//! Turns a feature request into the SQL the iterator runs. The statement
//! always has this shape:
//!
//! ```text
//! SELECT * FROM (
//!     SELECT <attributes>, <geometry payload>, <raw geometry>, <row id>
//!     FROM <source> WHERE <kind guard>
//! ) WHERE <id list> AND <expression> AND <subset filter> AND <bbox>
//! [ORDER BY RANDOM() LIMIT n]
//! ```
//!
//! Absent filters are left out. The guard keeps rows whose subtype differs
//! from the resolved one out of a layer typed to exactly one subtype.

use crate::error::{EngineError, Result};
use geoflake_ir::{
    quote_ident, BoundingBox, Encoding, FeatureRequest, Field, GeometryColumnSpec, Source,
};
use geoflake_session::{QueryContext, Session};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use tracing::debug;

/// Alias of the decoded-geometry payload column.
pub const GEOMETRY_ALIAS: &str = "geoflake_geometry";

/// Alias of the synthesized row number used as feature id without a key.
pub const ROW_NUMBER_ALIAS: &str = "geoflake_row_number";

/// Where things land in a result row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowLayout {
    /// For each output attribute: (field index, row column index)
    pub attributes: Vec<(usize, usize)>,
    /// Row column holding the geometry payload
    pub geometry: Option<usize>,
    /// Row column holding the feature id
    pub id: usize,
    /// Number of projected columns
    pub width: usize,
}

/// A statement ready to execute, kept in parts for inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComposedQuery {
    pub projection: Vec<String>,
    pub source: String,
    pub guard: String,
    pub filters: Vec<String>,
    pub order_limit: Option<String>,
    pub layout: RowLayout,
}

impl ComposedQuery {
    pub fn to_sql(&self) -> String {
        let mut sql = format!(
            "SELECT * FROM (SELECT {} FROM {} WHERE {})",
            self.projection.join(", "),
            self.source,
            self.guard
        );
        if !self.filters.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&self.filters.join(" AND "));
        }
        if let Some(order_limit) = &self.order_limit {
            sql.push_str(order_limit);
        }
        sql
    }

    /// Stable hash of the SQL, used to correlate log lines.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.to_sql().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

impl fmt::Display for ComposedQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_sql())
    }
}

/// Everything about a source the composer needs, fixed for its lifetime.
#[derive(Debug, Clone, Copy)]
pub struct QueryPlan<'a> {
    pub source: &'a Source,
    pub fields: &'a [Field],
    pub primary_key: Option<usize>,
    pub geometry: &'a GeometryColumnSpec,
    pub subset_filter: Option<&'a str>,
    pub sample_limit: Option<u64>,
}

/// Build the statement for `request`.
///
/// `expression` must already be validated (see [`validate_expression`]);
/// the request's own expression is not read. `bbox` is in the source CRS.
pub fn compose(
    plan: &QueryPlan<'_>,
    request: &FeatureRequest,
    expression: Option<&str>,
    bbox: Option<&BoundingBox>,
) -> Result<ComposedQuery> {
    let spec = plan.geometry;
    let geom = quote_ident(&spec.column);

    let output = output_attributes(plan.fields, plan.primary_key, request)?;
    // Outer filters may reference any column, so only narrow the inner
    // projection when nothing but the caller's subset is read
    let narrow = expression.is_none() && plan.subset_filter.is_none();
    let projected: Vec<usize> = if narrow && request.subset_of_attributes.is_some() {
        output.clone()
    } else {
        (0..plan.fields.len()).collect()
    };

    let mut projection: Vec<String> = projected
        .iter()
        .map(|&i| quote_ident(&plan.fields[i].name))
        .collect();
    let column_of = |field: usize| projected.iter().position(|&p| p == field);

    let attributes = output
        .iter()
        .map(|&field| {
            column_of(field)
                .map(|col| (field, col))
                .ok_or_else(|| EngineError::UnknownField(plan.fields[field].name.clone()))
        })
        .collect::<Result<Vec<_>>>()?;

    let geometry = if request.no_geometry {
        None
    } else {
        let payload = match spec.encoding {
            Encoding::Geometry | Encoding::Geography => format!("ST_ASWKB({geom})"),
            Encoding::CellId => geom.clone(),
        };
        projection.push(format!("{payload} AS {}", quote_ident(GEOMETRY_ALIAS)));
        Some(projection.len() - 1)
    };

    // Raw column for outer predicates, unless an attribute already carries it
    if !projected
        .iter()
        .any(|&i| plan.fields[i].name == spec.column)
    {
        projection.push(geom.clone());
    }

    let (id, id_ref) = match plan.primary_key {
        Some(pk) => {
            let name = quote_ident(&plan.fields[pk].name);
            match column_of(pk) {
                Some(col) => (col, name),
                None => {
                    projection.push(name.clone());
                    (projection.len() - 1, name)
                }
            }
        }
        None => {
            let alias = quote_ident(ROW_NUMBER_ALIAS);
            projection.push(format!("ROW_NUMBER() OVER (ORDER BY 1) AS {alias}"));
            (projection.len() - 1, alias)
        }
    };

    let mut filters = Vec::new();
    if let Some(ids) = &request.feature_ids {
        filters.push(id_list_predicate(&id_ref, ids));
    }
    if let Some(expression) = expression {
        filters.push(format!("({expression})"));
    }
    if let Some(subset) = plan.subset_filter {
        filters.push(format!("({subset})"));
    }
    if let Some(bbox) = bbox {
        filters.push(bbox_predicate(spec, bbox));
    }

    let width = projection.len();
    let query = ComposedQuery {
        projection,
        source: plan.source.from_clause(),
        guard: kind_guard(spec),
        filters,
        order_limit: plan.sample_limit.map(crate::sample::sampling_clause),
        layout: RowLayout {
            attributes,
            geometry,
            id,
            width,
        },
    };
    debug!(fingerprint = %query.fingerprint(), sql = %query, "Composed feature query");
    Ok(query)
}

/// Field indexes a feature carries, in output order.
///
/// A requested subset keeps its order and gets the primary key appended
/// when the caller left it out.
pub fn output_attributes(
    fields: &[Field],
    primary_key: Option<usize>,
    request: &FeatureRequest,
) -> Result<Vec<usize>> {
    let Some(names) = &request.subset_of_attributes else {
        return Ok((0..fields.len()).collect());
    };

    let mut indexes = Vec::with_capacity(names.len() + 1);
    for name in names {
        let index = fields
            .iter()
            .position(|f| &f.name == name)
            .ok_or_else(|| EngineError::UnknownField(name.clone()))?;
        if !indexes.contains(&index) {
            indexes.push(index);
        }
    }
    if let Some(pk) = primary_key {
        if !indexes.contains(&pk) {
            indexes.push(pk);
        }
    }
    Ok(indexes)
}

/// Predicate restricting rows to the resolved subtype.
///
/// A multi subtype also admits its singular form; cell columns admit any
/// valid cell; an unknown subtype only excludes nulls.
pub fn kind_guard(spec: &GeometryColumnSpec) -> String {
    let geom = quote_ident(&spec.column);
    if spec.encoding == Encoding::CellId {
        return format!("H3_IS_VALID_CELL({geom})");
    }
    match spec.kind {
        Some(kind) => {
            let mut names = vec![format!("'{}'", kind.geojson_name())];
            if let Some(single) = kind.singular() {
                names.push(format!("'{}'", single.geojson_name()));
            }
            format!(
                "ST_ASGEOJSON({geom}):type::string IN ({})",
                names.join(", ")
            )
        }
        None => format!("{geom} IS NOT NULL"),
    }
}

/// Spatial intersects test against a rectangle, in the column's encoding.
pub fn bbox_predicate(spec: &GeometryColumnSpec, bbox: &BoundingBox) -> String {
    let geom = quote_ident(&spec.column);
    let wkt = bbox.to_wkt_polygon();
    match spec.encoding {
        Encoding::Geometry => match spec.srid {
            Some(srid) => format!("ST_INTERSECTS({geom}, ST_GEOMETRYFROMWKT('{wkt}', {srid}))"),
            None => format!("ST_INTERSECTS({geom}, ST_GEOMETRYFROMWKT('{wkt}'))"),
        },
        Encoding::Geography => format!("ST_INTERSECTS({geom}, ST_GEOGRAPHYFROMWKT('{wkt}'))"),
        Encoding::CellId => format!(
            "ST_INTERSECTS(H3_CELL_TO_BOUNDARY({geom}), ST_GEOGRAPHYFROMWKT('{wkt}'))"
        ),
    }
}

fn id_list_predicate(id_ref: &str, ids: &[i64]) -> String {
    if ids.is_empty() {
        return "FALSE".to_string();
    }
    let list = ids
        .iter()
        .map(i64::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    format!("{id_ref} IN ({list})")
}

/// Whether `expression` is a valid filter over `from`.
///
/// Runs a zero-row probe. Any failure means "drop the expression": an
/// invalid user filter never surfaces as an error.
pub fn validate_expression(
    session: &dyn Session,
    connection: &str,
    context: &QueryContext,
    from: &str,
    expression: &str,
) -> bool {
    if expression.trim().is_empty() {
        return false;
    }
    let sql = format!("SELECT COUNT(*) FROM {from} WHERE {expression} LIMIT 0");
    match session.query_all(connection, &sql, context) {
        Ok(_) => true,
        Err(err) => {
            debug!(expression = %expression, error = %err, "Dropping invalid filter expression");
            false
        }
    }
}
