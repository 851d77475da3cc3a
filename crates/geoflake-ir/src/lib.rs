//! geoflake intermediate representation
//!
//! Data model shared between the session boundary, the feature engine and
//! the host binary. Everything here is plain data: no I/O.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use geo_types::{coord, Geometry, Rect};
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod source;
pub mod types;

pub use source::{quote_ident, Source, SourceDescriptor, UriError};
pub use types::{AttributeType, Encoding, GeometryKind, TypeCode};

/// One column of a cursor description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub type_code: TypeCode,
    pub ordinal: usize,
}

impl ColumnDescriptor {
    pub fn new(name: impl Into<String>, type_code: TypeCode, ordinal: usize) -> Self {
        Self {
            name: name.into(),
            type_code,
            ordinal,
        }
    }
}

/// Attribute field exposed by a data source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    /// Warehouse type name as reported by the catalog or description
    pub type_name: String,
    pub attribute_type: AttributeType,
}

impl Field {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        let type_name = type_name.into();
        Self {
            name: name.into(),
            attribute_type: AttributeType::from_type_name(&type_name),
            type_name,
        }
    }

    pub fn from_descriptor(column: &ColumnDescriptor) -> Self {
        Self {
            name: column.name.clone(),
            type_name: column.type_code.name().to_string(),
            attribute_type: column.type_code.attribute_type(),
        }
    }
}

/// Resolved spatial column of a data source.
///
/// Computed once when a source is opened and shared read-only by every
/// iterator over that source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeometryColumnSpec {
    pub column: String,
    pub encoding: Encoding,
    /// Observed subtype; `None` for cell identifiers or when the column holds no values
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<GeometryKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub srid: Option<i32>,
}

impl GeometryColumnSpec {
    pub fn new(column: impl Into<String>, encoding: Encoding) -> Self {
        Self {
            column: column.into(),
            encoding,
            kind: None,
            srid: None,
        }
    }

    pub fn with_kind(mut self, kind: GeometryKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_srid(mut self, srid: i32) -> Self {
        self.srid = Some(srid);
        self
    }

    /// Kind of the geometries the iterator yields for this column.
    ///
    /// Cell identifiers are expanded to their boundary, so they are polygons.
    pub fn feature_kind(&self) -> Option<GeometryKind> {
        match self.encoding {
            Encoding::CellId => Some(GeometryKind::Polygon),
            _ => self.kind,
        }
    }
}

/// Axis-aligned rectangle in some CRS.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub xmin: f64,
    pub ymin: f64,
    pub xmax: f64,
    pub ymax: f64,
}

impl BoundingBox {
    pub fn new(xmin: f64, ymin: f64, xmax: f64, ymax: f64) -> Self {
        Self {
            xmin: xmin.min(xmax),
            ymin: ymin.min(ymax),
            xmax: xmin.max(xmax),
            ymax: ymin.max(ymax),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.xmin == self.xmax && self.ymin == self.ymax
    }

    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox {
            xmin: self.xmin.min(other.xmin),
            ymin: self.ymin.min(other.ymin),
            xmax: self.xmax.max(other.xmax),
            ymax: self.ymax.max(other.ymax),
        }
    }

    pub fn to_rect(&self) -> Rect<f64> {
        Rect::new(
            coord! { x: self.xmin, y: self.ymin },
            coord! { x: self.xmax, y: self.ymax },
        )
    }

    /// Closed counter-clockwise ring as a WKT polygon literal.
    pub fn to_wkt_polygon(&self) -> String {
        format!(
            "POLYGON(({xmin} {ymin}, {xmax} {ymin}, {xmax} {ymax}, {xmin} {ymax}, {xmin} {ymin}))",
            xmin = self.xmin,
            ymin = self.ymin,
            xmax = self.xmax,
            ymax = self.ymax,
        )
    }
}

/// Declarative description of the features a caller wants.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureRequest {
    /// Rectangle expressed in `destination_srid` (or the source CRS when unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter_rect: Option<BoundingBox>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feature_ids: Option<Vec<i64>>,
    /// Attribute names to return, in output order; `None` means all
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subset_of_attributes: Option<Vec<String>>,
    #[serde(default)]
    pub no_geometry: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_srid: Option<i32>,
}

impl FeatureRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter_rect(mut self, rect: BoundingBox) -> Self {
        self.filter_rect = Some(rect);
        self
    }

    pub fn with_expression(mut self, expression: impl Into<String>) -> Self {
        self.expression = Some(expression.into());
        self
    }

    pub fn with_feature_ids(mut self, ids: Vec<i64>) -> Self {
        self.feature_ids = Some(ids);
        self
    }

    pub fn with_subset_of_attributes<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subset_of_attributes = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn without_geometry(mut self) -> Self {
        self.no_geometry = true;
        self
    }

    pub fn with_destination_srid(mut self, srid: i32) -> Self {
        self.destination_srid = Some(srid);
        self
    }
}

/// A single cell of a result row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    DateTime(NaiveDateTime),
    Date(NaiveDate),
    Time(NaiveTime),
    Text(String),
    Binary(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Double(d) if d.fract() == 0.0 && d.is_finite() => Some(*d as i64),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Double(d) => Some(*d),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(i) => Some(*i != 0),
            Value::Text(s) => match s.to_ascii_lowercase().as_str() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(d: f64) -> Self {
        Value::Double(d)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Double(d) => write!(f, "{d}"),
            Value::DateTime(dt) => write!(f, "{dt}"),
            Value::Date(d) => write!(f, "{d}"),
            Value::Time(t) => write!(f, "{t}"),
            Value::Text(s) => f.write_str(s),
            Value::Binary(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

/// A raw result row, positionally aligned with the cursor description.
pub type Row = Vec<Value>;

/// A decoded feature record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub id: i64,
    pub geometry: Option<Geometry<f64>>,
    /// Attribute values in request order
    pub attributes: Vec<Value>,
}

impl Feature {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            geometry: None,
            attributes: Vec::new(),
        }
    }
}
