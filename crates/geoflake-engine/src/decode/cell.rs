//! Hexagonal grid cell identifiers

use crate::error::DecodeError;
use geo_types::{Coord, LineString, Polygon};
use geoflake_ir::Value;
use h3o::CellIndex;

/// Largest integer a double holds exactly (2^53).
const MAX_EXACT_DOUBLE: f64 = 9_007_199_254_740_992.0;

/// Parse a cell identifier from a raw column value.
///
/// Text is tried as hex first (the usual string form), then as a decimal
/// integer; anything that does not name a valid cell is malformed.
pub fn parse_cell_id(value: &Value) -> Result<CellIndex, DecodeError> {
    let malformed = || DecodeError::MalformedCellId(value.to_string());
    match value {
        Value::Int(raw) => u64::try_from(*raw)
            .ok()
            .and_then(|raw| CellIndex::try_from(raw).ok())
            .ok_or_else(malformed),
        Value::Double(raw) if raw.fract() == 0.0 && (0.0..=MAX_EXACT_DOUBLE).contains(raw) => {
            CellIndex::try_from(*raw as u64).map_err(|_| malformed())
        }
        Value::Text(text) => {
            let text = text.trim();
            let hex = text.trim_start_matches("0x");
            u64::from_str_radix(hex, 16)
                .ok()
                .and_then(|raw| CellIndex::try_from(raw).ok())
                .or_else(|| {
                    text.parse::<u64>()
                        .ok()
                        .and_then(|raw| CellIndex::try_from(raw).ok())
                })
                .ok_or_else(malformed)
        }
        _ => Err(malformed()),
    }
}

/// Boundary of a cell as a closed lon/lat polygon.
pub fn cell_boundary(cell: CellIndex) -> Polygon<f64> {
    let ring: Vec<Coord<f64>> = cell
        .boundary()
        .iter()
        .map(|vertex| Coord {
            x: vertex.lng(),
            y: vertex.lat(),
        })
        .collect();
    Polygon::new(LineString(ring), vec![])
}

/// Parse and expand in one step.
pub fn cell_polygon(value: &Value) -> Result<Polygon<f64>, DecodeError> {
    parse_cell_id(value).map(cell_boundary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{Contains, Point};

    // Resolution 9 cell over San Francisco
    const CELL_HEX: &str = "8928308280fffff";
    const CELL_INT: i64 = 0x8928308280fffff;

    #[test]
    fn test_hex_int_and_decimal_forms_agree() {
        let from_hex = parse_cell_id(&Value::Text(CELL_HEX.into())).unwrap();
        let from_int = parse_cell_id(&Value::Int(CELL_INT)).unwrap();
        let from_dec = parse_cell_id(&Value::Text(CELL_INT.to_string())).unwrap();
        assert_eq!(from_hex, from_int);
        assert_eq!(from_hex, from_dec);
        assert_eq!(u64::from(from_hex), CELL_INT as u64);
    }

    #[test]
    fn test_boundary_is_closed_ring_around_center() {
        let polygon = cell_polygon(&Value::Text(CELL_HEX.into())).unwrap();
        let ring = polygon.exterior();
        assert!(ring.is_closed());
        // hexagon: six vertices plus the closing one
        assert_eq!(ring.0.len(), 7);
        // San Francisco, lon/lat order
        let c = ring.0[0];
        assert!((-123.0..-122.0).contains(&c.x), "lon was {}", c.x);
        assert!((37.0..38.0).contains(&c.y), "lat was {}", c.y);

        let cell = parse_cell_id(&Value::Int(CELL_INT)).unwrap();
        let center = h3o::LatLng::from(cell);
        assert!(polygon.contains(&Point::new(center.lng(), center.lat())));
    }

    #[test]
    fn test_malformed_ids() {
        for bad in [
            Value::Text("not-a-cell".into()),
            Value::Int(-1),
            Value::Int(0),
            // rounded to the nearest double, no longer the same cell
            Value::Double(CELL_INT as f64),
            Value::Double(1.5),
            Value::Null,
            Value::Bool(true),
        ] {
            assert!(
                matches!(parse_cell_id(&bad), Err(DecodeError::MalformedCellId(_))),
                "{bad:?} should be rejected"
            );
        }
    }
}
