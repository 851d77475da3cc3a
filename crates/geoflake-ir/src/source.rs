//! Data source addressing
//!
//! A source is either a catalog table or an arbitrary SQL query. Hosts persist
//! a layer as a whitespace separated `key=value` URI, for example
//!
//! ```text
//! connection_name="prod" schema_name="PUBLIC" table_name="ROADS" geom_column="GEOM"
//! ```

use crate::types::{Encoding, GeometryKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UriError {
    #[error("invalid URI, missing `connection_name`: {0}")]
    MissingConnection(String),

    #[error("invalid URI, need either `table_name` or `sql_query`")]
    MissingSource,

    #[error("unterminated quote in value of `{0}`")]
    UnterminatedQuote(String),

    #[error("expected `key=value`, found `{0}`")]
    MalformedPair(String),

    #[error("invalid value for `{key}`: {value}")]
    InvalidValue { key: String, value: String },
}

/// Quote an identifier for the warehouse, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// What a data source reads from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Source {
    Table {
        #[serde(skip_serializing_if = "Option::is_none")]
        schema: Option<String>,
        name: String,
    },
    Query {
        sql: String,
    },
}

impl Source {
    pub fn table(schema: Option<&str>, name: impl Into<String>) -> Self {
        Source::Table {
            schema: schema.map(str::to_string),
            name: name.into(),
        }
    }

    pub fn query(sql: impl Into<String>) -> Self {
        Source::Query { sql: sql.into() }
    }

    pub fn is_query(&self) -> bool {
        matches!(self, Source::Query { .. })
    }

    /// FROM-clause text: a quoted, optionally schema-qualified table name or
    /// a parenthesized subquery.
    pub fn from_clause(&self) -> String {
        match self {
            Source::Table {
                schema: Some(schema),
                name,
            } => format!("{}.{}", quote_ident(schema), quote_ident(name)),
            Source::Table { schema: None, name } => quote_ident(name),
            Source::Query { sql } => format!("({})", sql.trim().trim_end_matches(';')),
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.from_clause())
    }
}

/// Everything needed to reopen a layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub connection: String,
    pub source: Source,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geometry_column: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geometry_kind: Option<GeometryKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding: Option<Encoding>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub srid: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<String>,
}

impl SourceDescriptor {
    pub fn new(connection: impl Into<String>, source: Source) -> Self {
        Self {
            connection: connection.into(),
            source,
            geometry_column: None,
            geometry_kind: None,
            encoding: None,
            srid: None,
            primary_key: None,
        }
    }

    pub fn with_geometry_column(mut self, column: impl Into<String>) -> Self {
        self.geometry_column = Some(column.into());
        self
    }

    pub fn with_primary_key(mut self, column: impl Into<String>) -> Self {
        self.primary_key = Some(column.into());
        self
    }

    /// Parse the persisted `key=value` form.
    ///
    /// Values may be bare words or single/double quoted; inside quotes a
    /// backslash escapes the next character. Unknown keys are ignored and
    /// empty values count as absent.
    pub fn parse_uri(uri: &str) -> Result<Self, UriError> {
        let parts = split_pairs(uri)?;
        let get = |key: &str| parts.get(key).filter(|v| !v.is_empty()).cloned();

        let connection = get("connection_name")
            .ok_or_else(|| UriError::MissingConnection(uri.to_string()))?;

        let source = match (get("sql_query").or_else(|| get("sql")), get("table_name")) {
            (Some(sql), _) => Source::Query { sql },
            (None, Some(name)) => Source::Table {
                schema: get("schema_name"),
                name,
            },
            (None, None) => return Err(UriError::MissingSource),
        };

        let srid = match get("srid") {
            Some(raw) => Some(raw.parse::<i32>().map_err(|_| UriError::InvalidValue {
                key: "srid".into(),
                value: raw.clone(),
            })?),
            None => None,
        };

        let geometry_kind = match get("geometry_type") {
            Some(raw) => Some(GeometryKind::from_geojson_name(&raw).ok_or_else(|| {
                UriError::InvalidValue {
                    key: "geometry_type".into(),
                    value: raw.clone(),
                }
            })?),
            None => None,
        };

        let encoding = match get("geo_column_type") {
            Some(raw) => Some(parse_encoding(&raw).ok_or(UriError::InvalidValue {
                key: "geo_column_type".into(),
                value: raw,
            })?),
            None => None,
        };

        Ok(Self {
            connection,
            source,
            geometry_column: get("geom_column").or_else(|| get("geo_column")),
            geometry_kind,
            encoding,
            srid,
            primary_key: get("primary_key"),
        })
    }

    /// Render the persisted `key=value` form. Every value is double quoted.
    pub fn to_uri(&self) -> String {
        let mut pairs: Vec<(&str, String)> = vec![("connection_name", self.connection.clone())];
        match &self.source {
            Source::Table { schema, name } => {
                if let Some(schema) = schema {
                    pairs.push(("schema_name", schema.clone()));
                }
                pairs.push(("table_name", name.clone()));
            }
            Source::Query { sql } => pairs.push(("sql_query", sql.clone())),
        }
        if let Some(srid) = self.srid {
            pairs.push(("srid", srid.to_string()));
        }
        if let Some(column) = &self.geometry_column {
            pairs.push(("geom_column", column.clone()));
        }
        if let Some(kind) = self.geometry_kind {
            pairs.push(("geometry_type", kind.geojson_name().to_string()));
        }
        if let Some(encoding) = self.encoding {
            pairs.push(("geo_column_type", encoding.to_string()));
        }
        if let Some(pk) = &self.primary_key {
            pairs.push(("primary_key", pk.clone()));
        }

        pairs
            .into_iter()
            .map(|(key, value)| {
                let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
                format!("{key}=\"{escaped}\"")
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn parse_encoding(raw: &str) -> Option<Encoding> {
    match raw.trim().to_ascii_uppercase().as_str() {
        "GEOMETRY" => Some(Encoding::Geometry),
        "GEOGRAPHY" => Some(Encoding::Geography),
        // Cell columns are persisted with their storage type
        "CELL_ID" | "NUMBER" | "TEXT" | "H3GEO" => Some(Encoding::CellId),
        _ => None,
    }
}

fn split_pairs(uri: &str) -> Result<BTreeMap<String, String>, UriError> {
    let mut pairs = BTreeMap::new();
    let mut chars = uri.chars().peekable();

    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' || c.is_whitespace() {
                break;
            }
            key.push(c);
            chars.next();
        }
        if chars.next() != Some('=') || key.is_empty() {
            return Err(UriError::MalformedPair(key));
        }

        let mut value = String::new();
        match chars.peek().copied() {
            Some(quote @ ('"' | '\'')) => {
                chars.next();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                value.push(escaped);
                            }
                        }
                        c if c == quote => {
                            closed = true;
                            break;
                        }
                        c => value.push(c),
                    }
                }
                if !closed {
                    return Err(UriError::UnterminatedQuote(key));
                }
            }
            _ => {
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() {
                        break;
                    }
                    value.push(c);
                    chars.next();
                }
            }
        }
        pairs.insert(key, value);
    }

    Ok(pairs)
}
