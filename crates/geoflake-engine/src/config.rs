use geoflake_ir::Encoding;
use serde::{Deserialize, Serialize};

/// Engine tuning knobs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Rows pulled from a live cursor per refill
    pub batch_size: usize,

    /// Sampling cap for geometry and geography columns
    pub geometry_row_cap: u64,

    /// Sampling cap for cell-identifier columns
    pub cell_row_cap: u64,

    /// Rows shown by an ad-hoc preview
    pub preview_limit: usize,

    /// Case-insensitive marker a column comment must contain for the column
    /// to be considered a cell-identifier candidate
    pub cell_marker: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 5000,
            geometry_row_cap: 50_000,
            cell_row_cap: 500_000,
            preview_limit: 50_000,
            cell_marker: "h3".to_string(),
        }
    }
}

impl EngineConfig {
    /// Row cap that applies to a column of the given encoding.
    pub fn row_cap(&self, encoding: Encoding) -> u64 {
        match encoding {
            Encoding::CellId => self.cell_row_cap,
            Encoding::Geometry | Encoding::Geography => self.geometry_row_cap,
        }
    }

    pub fn effective_batch_size(&self) -> usize {
        self.batch_size.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.batch_size, 5000);
        assert_eq!(config.row_cap(Encoding::CellId), 500_000);
        assert_eq!(config.row_cap(Encoding::Geography), 50_000);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"batch_size": 100}"#).unwrap();
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.cell_marker, "h3");

        let zero = EngineConfig {
            batch_size: 0,
            ..EngineConfig::default()
        };
        assert_eq!(zero.effective_batch_size(), 1);
    }
}
