use geoflake_ir::{AttributeType, UriError};
use geoflake_session::WarehouseError;
use thiserror::Error;

/// Failure decoding one row. Never escapes a scan: the row is logged and skipped.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("Invalid WKB: {0}")]
    Wkb(String),

    #[error("Malformed cell identifier: {0}")]
    MalformedCellId(String),

    #[error("Cannot convert `{value}` to {target:?}")]
    Conversion { value: String, target: AttributeType },

    #[error("Row has {actual} columns, expected {expected}")]
    RowWidth { expected: usize, actual: usize },
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Warehouse(#[from] WarehouseError),

    #[error("No geometry column is resolved for this source")]
    MissingGeometrySpec,

    #[error("No coordinate transform from EPSG:{from} to EPSG:{to}")]
    UnsupportedTransform { from: i32, to: i32 },

    #[error("Invalid source: {0}")]
    InvalidSource(String),

    #[error(transparent)]
    Uri(#[from] UriError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("Unknown field: {0}")]
    UnknownField(String),

    #[error("Cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, EngineError>;
