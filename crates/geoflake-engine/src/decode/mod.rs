//! Row decoding: raw cursor rows to feature records

pub mod cell;
pub mod convert;
pub mod wkb;

use crate::compose::RowLayout;
use crate::error::DecodeError;
use crate::transform::{transform_geometry, CrsTransform};
use convert::Converter;
use geo_types::Geometry;
use geoflake_ir::{Encoding, Feature, Field, Row, Value};
use std::sync::Arc;

/// Decodes rows of one composed query.
///
/// Converters are chosen once per output attribute when the decoder is
/// built, so per-row work is a table lookup.
#[derive(Debug, Clone)]
pub struct RowDecoder {
    layout: RowLayout,
    converters: Vec<Converter>,
    encoding: Encoding,
    transform: Option<Arc<dyn CrsTransform>>,
}

impl RowDecoder {
    pub fn new(
        layout: RowLayout,
        fields: &[Field],
        encoding: Encoding,
        transform: Option<Arc<dyn CrsTransform>>,
    ) -> Self {
        let converters = layout
            .attributes
            .iter()
            .map(|&(field, _)| {
                fields
                    .get(field)
                    .map(|f| Converter::for_type(f.attribute_type))
                    .unwrap_or(Converter::PassThrough)
            })
            .collect();
        Self {
            layout,
            converters,
            encoding,
            transform,
        }
    }

    pub fn layout(&self) -> &RowLayout {
        &self.layout
    }

    /// Decode one row. `position` is the row's ordinal in the scan and is
    /// the id fallback when the id column is not an integer.
    pub fn decode(&self, mut row: Row, position: u64) -> Result<Feature, DecodeError> {
        if row.len() < self.layout.width {
            return Err(DecodeError::RowWidth {
                expected: self.layout.width,
                actual: row.len(),
            });
        }

        let id = row[self.layout.id]
            .as_i64()
            .unwrap_or(position as i64);

        let geometry = match self.layout.geometry {
            Some(col) => self.decode_geometry(std::mem::replace(&mut row[col], Value::Null))?,
            None => None,
        };

        let mut attributes = Vec::with_capacity(self.layout.attributes.len());
        for (&(_, col), converter) in self.layout.attributes.iter().zip(&self.converters) {
            attributes.push(converter.convert(row[col].clone())?);
        }

        Ok(Feature {
            id,
            geometry,
            attributes,
        })
    }

    fn decode_geometry(&self, payload: Value) -> Result<Option<Geometry<f64>>, DecodeError> {
        if payload.is_null() {
            return Ok(None);
        }
        let geometry = match self.encoding {
            Encoding::CellId => Geometry::Polygon(cell::cell_polygon(&payload)?),
            Encoding::Geometry | Encoding::Geography => match payload {
                Value::Binary(bytes) => wkb::read_wkb(&bytes)?,
                // Some drivers hand binary columns back hex-encoded
                Value::Text(hex) => wkb::read_wkb(&decode_hex(&hex)?)?,
                other => {
                    return Err(DecodeError::Wkb(format!(
                        "expected binary payload, got {other}"
                    )))
                }
            },
        };
        Ok(Some(match &self.transform {
            Some(transform) => transform_geometry(&geometry, transform.as_ref()),
            None => geometry,
        }))
    }
}

fn decode_hex(text: &str) -> Result<Vec<u8>, DecodeError> {
    let text = text.trim();
    if text.len() % 2 != 0 {
        return Err(DecodeError::Wkb("odd-length hex payload".into()));
    }
    (0..text.len())
        .step_by(2)
        .map(|i| {
            text.get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| DecodeError::Wkb("invalid hex payload".into()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::WebMercator;
    use chrono::NaiveDate;
    use geo_types::{point, Point};

    fn layout() -> RowLayout {
        // NAME, DAY, payload, id
        RowLayout {
            attributes: vec![(0, 0), (1, 1)],
            geometry: Some(2),
            id: 3,
            width: 4,
        }
    }

    fn fields() -> Vec<Field> {
        vec![Field::new("NAME", "TEXT"), Field::new("DAY", "DATE")]
    }

    fn point_wkb(x: f64, y: f64) -> Value {
        Value::Binary(wkb::write_wkb(&Geometry::Point(Point::new(x, y))))
    }

    #[test]
    fn test_decode_row() {
        let decoder = RowDecoder::new(layout(), &fields(), Encoding::Geometry, None);
        let row = vec![
            "a".into(),
            "2024-01-02".into(),
            point_wkb(1.0, 2.0),
            Value::Int(42),
        ];
        let feature = decoder.decode(row, 0).unwrap();
        assert_eq!(feature.id, 42);
        assert_eq!(feature.geometry, Some(Geometry::Point(point!(x: 1.0, y: 2.0))));
        assert_eq!(
            feature.attributes,
            vec![
                Value::Text("a".into()),
                Value::Date(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap())
            ]
        );
    }

    #[test]
    fn test_position_fallback_and_null_geometry() {
        let decoder = RowDecoder::new(layout(), &fields(), Encoding::Geography, None);
        let row = vec![Value::Null, Value::Null, Value::Null, Value::Null];
        let feature = decoder.decode(row, 7).unwrap();
        assert_eq!(feature.id, 7);
        assert_eq!(feature.geometry, None);
    }

    #[test]
    fn test_hex_payload_and_transform() {
        let decoder = RowDecoder::new(
            layout(),
            &fields(),
            Encoding::Geometry,
            Some(Arc::new(WebMercator)),
        );
        let Value::Binary(bytes) = point_wkb(180.0, 0.0) else {
            unreachable!()
        };
        let hex: String = bytes.iter().map(|b| format!("{b:02X}")).collect();
        let feature = decoder
            .decode(vec![Value::Null, Value::Null, hex.into(), Value::Int(1)], 0)
            .unwrap();
        let Some(Geometry::Point(p)) = feature.geometry else {
            panic!("expected a point");
        };
        assert!((p.x() - 20_037_508.342_789_244).abs() < 1e-6);
    }

    #[test]
    fn test_cell_payload() {
        let layout = RowLayout {
            attributes: vec![],
            geometry: Some(0),
            id: 1,
            width: 2,
        };
        let decoder = RowDecoder::new(layout, &[], Encoding::CellId, None);
        let feature = decoder
            .decode(vec!["8928308280fffff".into(), Value::Int(0)], 0)
            .unwrap();
        assert!(matches!(feature.geometry, Some(Geometry::Polygon(_))));
    }

    #[test]
    fn test_row_errors() {
        let decoder = RowDecoder::new(layout(), &fields(), Encoding::Geometry, None);
        assert!(matches!(
            decoder.decode(vec![Value::Null], 0),
            Err(DecodeError::RowWidth { expected: 4, actual: 1 })
        ));
        let bad_wkb = vec![Value::Null, Value::Null, Value::Binary(vec![9, 9]), Value::Int(1)];
        assert!(decoder.decode(bad_wkb, 0).is_err());
        let bad_date = vec![Value::Null, "yesterday".into(), Value::Null, Value::Int(1)];
        assert!(matches!(
            decoder.decode(bad_date, 0),
            Err(DecodeError::Conversion { .. })
        ));
    }
}
