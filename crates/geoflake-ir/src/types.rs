//! Type vocabulary shared by every geoflake crate
//!
//! Maps between:
//! - warehouse result-metadata type codes (what a cursor description reports)
//! - catalog type names (what `INFORMATION_SCHEMA.COLUMNS.DATA_TYPE` reports)
//! - generic attribute types (what a feature record carries)
//! - geometry kinds and spatial encodings

use serde::{Deserialize, Serialize};
use std::fmt;

/// Warehouse result-metadata type code, as reported in a cursor description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum TypeCode {
    Fixed = 0,
    Real = 1,
    Text = 2,
    Date = 3,
    Timestamp = 4,
    Variant = 5,
    TimestampLtz = 6,
    TimestampTz = 7,
    TimestampNtz = 8,
    Object = 9,
    Array = 10,
    Binary = 11,
    Time = 12,
    Boolean = 13,
    Geography = 14,
    Geometry = 15,
    Vector = 16,
}

impl TypeCode {
    /// Unknown codes are treated as text, matching how the warehouse
    /// driver falls back for types it does not describe.
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => TypeCode::Fixed,
            1 => TypeCode::Real,
            3 => TypeCode::Date,
            4 => TypeCode::Timestamp,
            5 => TypeCode::Variant,
            6 => TypeCode::TimestampLtz,
            7 => TypeCode::TimestampTz,
            8 => TypeCode::TimestampNtz,
            9 => TypeCode::Object,
            10 => TypeCode::Array,
            11 => TypeCode::Binary,
            12 => TypeCode::Time,
            13 => TypeCode::Boolean,
            14 => TypeCode::Geography,
            15 => TypeCode::Geometry,
            16 => TypeCode::Vector,
            _ => TypeCode::Text,
        }
    }

    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn name(self) -> &'static str {
        match self {
            TypeCode::Fixed => "FIXED",
            TypeCode::Real => "REAL",
            TypeCode::Text => "TEXT",
            TypeCode::Date => "DATE",
            TypeCode::Timestamp => "TIMESTAMP",
            TypeCode::Variant => "VARIANT",
            TypeCode::TimestampLtz => "TIMESTAMP_LTZ",
            TypeCode::TimestampTz => "TIMESTAMP_TZ",
            TypeCode::TimestampNtz => "TIMESTAMP_NTZ",
            TypeCode::Object => "OBJECT",
            TypeCode::Array => "ARRAY",
            TypeCode::Binary => "BINARY",
            TypeCode::Time => "TIME",
            TypeCode::Boolean => "BOOLEAN",
            TypeCode::Geography => "GEOGRAPHY",
            TypeCode::Geometry => "GEOMETRY",
            TypeCode::Vector => "VECTOR",
        }
    }

    /// Generic attribute type for a column described with this code.
    pub fn attribute_type(self) -> AttributeType {
        match self {
            TypeCode::Fixed | TypeCode::Real => AttributeType::Double,
            TypeCode::Date => AttributeType::Date,
            TypeCode::Timestamp
            | TypeCode::TimestampLtz
            | TypeCode::TimestampTz
            | TypeCode::TimestampNtz => AttributeType::DateTime,
            TypeCode::Time => AttributeType::Time,
            TypeCode::Boolean => AttributeType::Bool,
            TypeCode::Binary => AttributeType::Binary,
            TypeCode::Vector => AttributeType::Vector,
            TypeCode::Text
            | TypeCode::Variant
            | TypeCode::Object
            | TypeCode::Array
            | TypeCode::Geography
            | TypeCode::Geometry => AttributeType::Text,
        }
    }

    /// Spatial encoding carried natively by this code, if any.
    pub fn encoding(self) -> Option<Encoding> {
        match self {
            TypeCode::Geography => Some(Encoding::Geography),
            TypeCode::Geometry => Some(Encoding::Geometry),
            _ => None,
        }
    }

    /// Numeric and text columns are the only ones that can hold cell identifiers.
    pub fn can_hold_cell_id(self) -> bool {
        matches!(self, TypeCode::Fixed | TypeCode::Text)
    }
}

impl fmt::Display for TypeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Generic attribute type of a feature field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttributeType {
    Bool,
    Int,
    Double,
    Text,
    Date,
    Time,
    DateTime,
    Binary,
    List,
    Vector,
}

impl AttributeType {
    /// Map a catalog `DATA_TYPE` name. Unknown names become `Text`.
    pub fn from_type_name(name: &str) -> Self {
        match name.trim().to_ascii_uppercase().as_str() {
            "BIGINT" | "INTEGER" | "INT" | "SMALLINT" | "TINYINT" => AttributeType::Int,
            "BOOLEAN" | "BOOL" => AttributeType::Bool,
            "DATE" => AttributeType::Date,
            "TIME" => AttributeType::Time,
            // Catalog NUMBER does not distinguish integer and decimal columns
            "NUMBER" | "DOUBLE" | "FLOAT" | "REAL" | "DECIMAL" | "NUMERIC" => {
                AttributeType::Double
            }
            "TIMESTAMP" | "TIMESTAMP_LTZ" | "TIMESTAMP_NTZ" | "TIMESTAMP_TZ" | "DATETIME" => {
                AttributeType::DateTime
            }
            "ARRAY" => AttributeType::List,
            "BINARY" | "BLOB" => AttributeType::Binary,
            _ => AttributeType::Text,
        }
    }

    /// Types whose raw cursor values are converted before reaching a record.
    pub fn needs_conversion(self) -> bool {
        matches!(
            self,
            AttributeType::Date | AttributeType::Time | AttributeType::DateTime | AttributeType::Double
        )
    }
}

/// How a column stores spatial data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Encoding {
    /// Planar vector geometry
    Geometry,
    /// Ellipsoidal geography
    Geography,
    /// Hexagonal grid cell identifier (integer or hex string)
    CellId,
}

impl Encoding {
    /// Map a declared catalog type name to an encoding.
    ///
    /// Only GEOMETRY and GEOGRAPHY are declared encodings; cell identifiers
    /// are detected heuristically and confirmed by probing.
    pub fn from_declared_type(name: &str) -> Option<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "GEOMETRY" => Some(Encoding::Geometry),
            "GEOGRAPHY" => Some(Encoding::Geography),
            _ => None,
        }
    }

    pub fn is_vector(self) -> bool {
        !matches!(self, Encoding::CellId)
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Encoding::Geometry => "GEOMETRY",
            Encoding::Geography => "GEOGRAPHY",
            Encoding::CellId => "CELL_ID",
        };
        f.write_str(name)
    }
}

/// Geometry subtype, named as in GeoJSON `type` members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GeometryKind {
    Point,
    LineString,
    Polygon,
    MultiPoint,
    MultiLineString,
    MultiPolygon,
    GeometryCollection,
}

impl GeometryKind {
    pub fn from_geojson_name(name: &str) -> Option<Self> {
        match name {
            "Point" => Some(GeometryKind::Point),
            "LineString" => Some(GeometryKind::LineString),
            "Polygon" => Some(GeometryKind::Polygon),
            "MultiPoint" => Some(GeometryKind::MultiPoint),
            "MultiLineString" => Some(GeometryKind::MultiLineString),
            "MultiPolygon" => Some(GeometryKind::MultiPolygon),
            "GeometryCollection" => Some(GeometryKind::GeometryCollection),
            _ => None,
        }
    }

    pub fn geojson_name(self) -> &'static str {
        match self {
            GeometryKind::Point => "Point",
            GeometryKind::LineString => "LineString",
            GeometryKind::Polygon => "Polygon",
            GeometryKind::MultiPoint => "MultiPoint",
            GeometryKind::MultiLineString => "MultiLineString",
            GeometryKind::MultiPolygon => "MultiPolygon",
            GeometryKind::GeometryCollection => "GeometryCollection",
        }
    }

    pub fn is_multi(self) -> bool {
        matches!(
            self,
            GeometryKind::MultiPoint | GeometryKind::MultiLineString | GeometryKind::MultiPolygon
        )
    }

    /// Singular equivalent of a multi kind.
    pub fn singular(self) -> Option<Self> {
        match self {
            GeometryKind::MultiPoint => Some(GeometryKind::Point),
            GeometryKind::MultiLineString => Some(GeometryKind::LineString),
            GeometryKind::MultiPolygon => Some(GeometryKind::Polygon),
            _ => None,
        }
    }

    /// Multi equivalent of a singular kind.
    pub fn plural(self) -> Option<Self> {
        match self {
            GeometryKind::Point => Some(GeometryKind::MultiPoint),
            GeometryKind::LineString => Some(GeometryKind::MultiLineString),
            GeometryKind::Polygon => Some(GeometryKind::MultiPolygon),
            _ => None,
        }
    }
}

impl fmt::Display for GeometryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.geojson_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_code_round_trip_and_fallback() {
        for code in 0..=16 {
            assert_eq!(TypeCode::from_code(code).code(), code);
        }
        assert_eq!(TypeCode::from_code(42), TypeCode::Text);
        assert_eq!(TypeCode::from_code(-1), TypeCode::Text);
    }

    #[test]
    fn test_type_code_attribute_types() {
        assert_eq!(TypeCode::Fixed.attribute_type(), AttributeType::Double);
        assert_eq!(TypeCode::TimestampNtz.attribute_type(), AttributeType::DateTime);
        assert_eq!(TypeCode::Geography.attribute_type(), AttributeType::Text);
        assert_eq!(TypeCode::Geometry.encoding(), Some(Encoding::Geometry));
        assert!(TypeCode::Text.can_hold_cell_id());
        assert!(!TypeCode::Real.can_hold_cell_id());
    }

    #[test]
    fn test_attribute_type_from_catalog_name() {
        assert_eq!(AttributeType::from_type_name("NUMBER"), AttributeType::Double);
        assert_eq!(AttributeType::from_type_name("integer"), AttributeType::Int);
        assert_eq!(AttributeType::from_type_name("TIMESTAMP_LTZ"), AttributeType::DateTime);
        assert_eq!(AttributeType::from_type_name("VARIANT"), AttributeType::Text);
        assert_eq!(AttributeType::from_type_name("SOMETHING_NEW"), AttributeType::Text);
        assert!(AttributeType::Date.needs_conversion());
        assert!(!AttributeType::Text.needs_conversion());
    }

    #[test]
    fn test_geometry_kind_equivalence() {
        assert_eq!(GeometryKind::MultiPolygon.singular(), Some(GeometryKind::Polygon));
        assert_eq!(GeometryKind::Point.plural(), Some(GeometryKind::MultiPoint));
        assert_eq!(GeometryKind::GeometryCollection.plural(), None);
        assert_eq!(
            GeometryKind::from_geojson_name("MultiLineString"),
            Some(GeometryKind::MultiLineString)
        );
        assert_eq!(GeometryKind::from_geojson_name("Circle"), None);
    }
}
