use std::fmt;
use thiserror::Error;

/// Warehouse error code raised when a cell-validity function cannot be
/// evaluated against the data it was given ("function unsupported for this
/// data"). Probes that hit it treat the column as "not a cell column".
///
/// The number comes from the warehouse's documented error catalog; check it
/// against the target warehouse before pointing the engine somewhere new.
pub const CELL_FUNCTION_UNSUPPORTED: i64 = 100419;

/// Code used when the backend reports an error without a numeric code.
pub const UNSPECIFIED: i64 = 0;

/// Structured error raised by a session or cursor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("warehouse error {code}: {message}")]
pub struct WarehouseError {
    pub code: i64,
    pub message: String,
}

impl WarehouseError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn unspecified(message: impl fmt::Display) -> Self {
        Self::new(UNSPECIFIED, message.to_string())
    }

    pub fn cursor_closed() -> Self {
        Self::unspecified("cursor is closed")
    }

    /// Whether this is the tolerated cell-validity failure.
    ///
    /// Some drivers only surface the code inside the message text
    /// (`100419 (P0000): ...`), so both are checked.
    pub fn is_cell_function_unsupported(&self) -> bool {
        self.code == CELL_FUNCTION_UNSUPPORTED
            || self
                .message
                .trim_start()
                .starts_with(&format!("{CELL_FUNCTION_UNSUPPORTED} "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_function_unsupported_detection() {
        assert!(WarehouseError::new(CELL_FUNCTION_UNSUPPORTED, "nope").is_cell_function_unsupported());
        assert!(WarehouseError::unspecified("100419 (P0000): Invalid H3 cell")
            .is_cell_function_unsupported());
        assert!(!WarehouseError::new(2003, "object does not exist").is_cell_function_unsupported());
        assert!(!WarehouseError::unspecified("1004190 rows").is_cell_function_unsupported());
    }

    #[test]
    fn test_display() {
        let err = WarehouseError::new(1003, "syntax error");
        assert_eq!(err.to_string(), "warehouse error 1003: syntax error");
    }
}
