//! Schema & geometry resolver
//!
//! Works out which columns of a table or query carry spatial data:
//! - declared GEOMETRY / GEOGRAPHY columns are taken as-is
//! - numeric/text columns that look like cell identifiers are confirmed by a
//!   single-row validity probe
//! - subtype and SRID are sampled from the data itself

use crate::config::EngineConfig;
use crate::error::Result;
use geoflake_ir::{
    quote_ident, ColumnDescriptor, Encoding, GeometryColumnSpec, GeometryKind, Source,
};
use geoflake_session::{QueryContext, Session};
use tracing::{debug, warn};

/// SRID of geography and cell columns; they are always lon/lat.
pub const GEOGRAPHY_SRID: i32 = 4326;

/// One column as seen by the resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    /// Catalog DATA_TYPE
    pub data_type: String,
    pub comment: Option<String>,
    pub ordinal: usize,
}

/// Whether catalog metadata marks a column as a possible cell identifier.
///
/// Only NUMBER and TEXT columns qualify, and only when their comment
/// mentions `marker` (case-insensitive). Candidates still need a probe.
pub fn is_cell_candidate(data_type: &str, comment: Option<&str>, marker: &str) -> bool {
    let numeric_or_text = matches!(
        data_type.trim().to_ascii_uppercase().as_str(),
        "NUMBER" | "TEXT"
    );
    let marked = comment
        .map(|c| c.to_lowercase().contains(&marker.to_lowercase()))
        .unwrap_or(false);
    numeric_or_text && marked
}

/// Collapse observed subtypes so that a singular kind and its multi form
/// are reported once, as the multi form. First-seen order is kept.
pub fn dedup_kinds(observed: impl IntoIterator<Item = GeometryKind>) -> Vec<GeometryKind> {
    let mut kinds: Vec<GeometryKind> = Vec::new();
    for kind in observed {
        if kinds.contains(&kind) {
            continue;
        }
        if let Some(single) = kind.singular() {
            kinds.retain(|k| *k != single);
        } else if let Some(multi) = kind.plural() {
            if kinds.contains(&multi) {
                continue;
            }
        }
        kinds.push(kind);
    }
    kinds
}

pub struct Resolver<'a> {
    session: &'a dyn Session,
    connection: &'a str,
    context: &'a QueryContext,
    config: &'a EngineConfig,
}

impl<'a> Resolver<'a> {
    pub fn new(
        session: &'a dyn Session,
        connection: &'a str,
        context: &'a QueryContext,
        config: &'a EngineConfig,
    ) -> Self {
        Self {
            session,
            connection,
            context,
            config,
        }
    }

    /// Resolve the geometry column of a source.
    ///
    /// With `preferred` set, only that column is considered; otherwise the
    /// first resolvable column wins.
    pub fn resolve(
        &self,
        source: &Source,
        preferred: Option<&str>,
    ) -> Result<Option<GeometryColumnSpec>> {
        let specs = self.resolve_all(source)?;
        let found = match preferred {
            Some(column) => specs.into_iter().find(|s| s.column == column),
            None => specs.into_iter().next(),
        };
        Ok(found)
    }

    /// One spec per (column, distinct subtype).
    ///
    /// Declared geometry/geography columns come first, in column order,
    /// followed by confirmed cell-identifier columns.
    pub fn resolve_all(&self, source: &Source) -> Result<Vec<GeometryColumnSpec>> {
        let from = source.from_clause();
        let (declared, candidates) = match source {
            Source::Table { schema, name } => {
                let columns = self.table_columns(schema.as_deref(), name)?;
                self.split_table_columns(&columns)
            }
            Source::Query { .. } => {
                let columns = self.query_columns(source)?;
                split_query_columns(&columns)
            }
        };

        let mut specs = Vec::new();
        for (column, encoding) in declared {
            let srid = match encoding {
                Encoding::Geometry => self.srid(&from, &column)?,
                _ => Some(GEOGRAPHY_SRID),
            };
            let kinds = self.geometry_kinds(&from, &column)?;
            if kinds.is_empty() {
                // Entirely null column: still a layer, subtype unknown
                specs.push(spec(&column, encoding, None, srid));
            }
            for kind in kinds {
                specs.push(spec(&column, encoding, Some(kind), srid));
            }
        }

        for column in self.confirm_cell_columns(&from, &candidates)? {
            specs.push(spec(&column, Encoding::CellId, None, Some(GEOGRAPHY_SRID)));
        }

        debug!(source = %from, specs = specs.len(), "Resolved geometry columns");
        Ok(specs)
    }

    /// Catalog columns of a table, in ordinal order.
    pub fn table_columns(&self, schema: Option<&str>, table: &str) -> Result<Vec<ColumnInfo>> {
        let mut sql = format!(
            "SELECT COLUMN_NAME, DATA_TYPE, COMMENT FROM INFORMATION_SCHEMA.COLUMNS \
             WHERE TABLE_NAME ILIKE {}",
            literal(table)
        );
        if let Some(schema) = schema {
            sql.push_str(&format!(" AND TABLE_SCHEMA ILIKE {}", literal(schema)));
        }
        sql.push_str(" ORDER BY ORDINAL_POSITION");

        let rows = self.session.query_all(self.connection, &sql, self.context)?;
        Ok(rows
            .into_iter()
            .enumerate()
            .filter_map(|(ordinal, row)| {
                let name = row.first()?.as_str()?.to_string();
                let data_type = row.get(1).and_then(|v| v.as_str()).unwrap_or("TEXT");
                let comment = row.get(2).and_then(|v| v.as_str()).map(str::to_string);
                Some(ColumnInfo {
                    name,
                    data_type: data_type.to_string(),
                    comment,
                    ordinal,
                })
            })
            .collect())
    }

    /// Result description of a query, without fetching rows.
    pub fn query_columns(&self, source: &Source) -> Result<Vec<ColumnDescriptor>> {
        let sql = format!("SELECT * FROM {} LIMIT 0", source.from_clause());
        let mut cursor = self.session.execute_query(self.connection, &sql, self.context)?;
        let description = cursor.description().to_vec();
        cursor.close();
        Ok(description)
    }

    fn split_table_columns(
        &self,
        columns: &[ColumnInfo],
    ) -> (Vec<(String, Encoding)>, Vec<String>) {
        let mut declared = Vec::new();
        let mut candidates = Vec::new();
        for column in columns {
            if let Some(encoding) = Encoding::from_declared_type(&column.data_type) {
                declared.push((column.name.clone(), encoding));
            } else if is_cell_candidate(
                &column.data_type,
                column.comment.as_deref(),
                &self.config.cell_marker,
            ) {
                candidates.push(column.name.clone());
            }
        }
        (declared, candidates)
    }

    /// Keep the candidates whose first non-null value is a valid cell.
    pub fn confirm_cell_columns(&self, from: &str, candidates: &[String]) -> Result<Vec<String>> {
        let mut confirmed = Vec::new();
        for column in candidates {
            if self.probe_cell_column(from, column)? {
                confirmed.push(column.clone());
            }
        }
        Ok(confirmed)
    }

    fn probe_cell_column(&self, from: &str, column: &str) -> Result<bool> {
        let ident = quote_ident(column);
        let sql = format!(
            "SELECT H3_IS_VALID_CELL({ident}) FROM {from} WHERE {ident} IS NOT NULL LIMIT 1"
        );
        match self.session.query_all(self.connection, &sql, self.context) {
            Ok(rows) => Ok(rows
                .iter()
                .any(|row| row.first().and_then(|v| v.as_bool()).unwrap_or(false))),
            Err(err) if err.is_cell_function_unsupported() => {
                warn!(column = %column, error = %err, "Cell probe unsupported, column not confirmed");
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Distinct subtypes present in a column, deduplicated.
    pub fn geometry_kinds(&self, from: &str, column: &str) -> Result<Vec<GeometryKind>> {
        let ident = quote_ident(column);
        let sql = format!(
            "SELECT DISTINCT ST_ASGEOJSON({ident}):type::string FROM {from} WHERE {ident} IS NOT NULL"
        );
        let rows = self.session.query_all(self.connection, &sql, self.context)?;
        let observed = rows.iter().filter_map(|row| {
            let name = row.first()?.as_str()?;
            let kind = GeometryKind::from_geojson_name(name);
            if kind.is_none() {
                warn!(column = %column, kind = %name, "Ignoring unknown geometry type");
            }
            kind
        });
        Ok(dedup_kinds(observed))
    }

    /// SRID of any non-null value; `None` when the column is entirely null.
    pub fn srid(&self, from: &str, column: &str) -> Result<Option<i32>> {
        let ident = quote_ident(column);
        let sql = format!("SELECT ANY_VALUE(ST_SRID({ident})) FROM {from} WHERE {ident} IS NOT NULL");
        let rows = self.session.query_all(self.connection, &sql, self.context)?;
        Ok(rows
            .first()
            .and_then(|row| row.first())
            .and_then(|v| v.as_i64())
            .and_then(|srid| i32::try_from(srid).ok()))
    }
}

fn split_query_columns(columns: &[ColumnDescriptor]) -> (Vec<(String, Encoding)>, Vec<String>) {
    let mut declared = Vec::new();
    let mut candidates = Vec::new();
    for column in columns {
        if let Some(encoding) = column.type_code.encoding() {
            declared.push((column.name.clone(), encoding));
        } else if column.type_code.can_hold_cell_id() {
            // No comments on query output: every numeric/text column is probed
            candidates.push(column.name.clone());
        }
    }
    (declared, candidates)
}

fn spec(
    column: &str,
    encoding: Encoding,
    kind: Option<GeometryKind>,
    srid: Option<i32>,
) -> GeometryColumnSpec {
    GeometryColumnSpec {
        column: column.to_string(),
        encoding,
        kind,
        srid,
    }
}

/// Single-quoted SQL string literal.
pub(crate) fn literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}
