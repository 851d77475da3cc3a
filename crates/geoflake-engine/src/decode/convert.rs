//! Attribute value converters
//!
//! One converter is chosen per output attribute when an iterator opens, so a
//! row is converted without re-inspecting field types.

use crate::error::DecodeError;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use geoflake_ir::{AttributeType, Value};

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Converter {
    PassThrough,
    Date,
    Time,
    DateTime,
    Double,
}

impl Converter {
    pub fn for_type(attribute_type: AttributeType) -> Self {
        match attribute_type {
            AttributeType::Date => Converter::Date,
            AttributeType::Time => Converter::Time,
            AttributeType::DateTime => Converter::DateTime,
            AttributeType::Double => Converter::Double,
            _ => Converter::PassThrough,
        }
    }

    pub fn convert(self, value: Value) -> Result<Value, DecodeError> {
        if value.is_null() {
            return Ok(value);
        }
        match self {
            Converter::PassThrough => Ok(value),
            Converter::Double => to_double(value),
            Converter::Date => to_date(value),
            Converter::Time => to_time(value),
            Converter::DateTime => to_datetime(value),
        }
    }

    fn target(self) -> AttributeType {
        match self {
            Converter::PassThrough => AttributeType::Text,
            Converter::Double => AttributeType::Double,
            Converter::Date => AttributeType::Date,
            Converter::Time => AttributeType::Time,
            Converter::DateTime => AttributeType::DateTime,
        }
    }

    fn fail(self, value: &Value) -> DecodeError {
        DecodeError::Conversion {
            value: value.to_string(),
            target: self.target(),
        }
    }
}

fn to_double(value: Value) -> Result<Value, DecodeError> {
    match value {
        Value::Double(_) => Ok(value),
        Value::Int(i) => Ok(Value::Double(i as f64)),
        Value::Text(ref s) => s
            .trim()
            .parse::<f64>()
            .map(Value::Double)
            .map_err(|_| Converter::Double.fail(&value)),
        other => Err(Converter::Double.fail(&other)),
    }
}

fn to_date(value: Value) -> Result<Value, DecodeError> {
    match value {
        Value::Date(_) => Ok(value),
        Value::DateTime(dt) => Ok(Value::Date(dt.date())),
        Value::Text(ref s) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
            .map(Value::Date)
            .map_err(|_| Converter::Date.fail(&value)),
        other => Err(Converter::Date.fail(&other)),
    }
}

fn to_time(value: Value) -> Result<Value, DecodeError> {
    match value {
        Value::Time(_) => Ok(value),
        Value::DateTime(dt) => Ok(Value::Time(dt.time())),
        Value::Text(ref s) => NaiveTime::parse_from_str(s.trim(), "%H:%M:%S%.f")
            .map(Value::Time)
            .map_err(|_| Converter::Time.fail(&value)),
        other => Err(Converter::Time.fail(&other)),
    }
}

fn to_datetime(value: Value) -> Result<Value, DecodeError> {
    match value {
        Value::DateTime(_) => Ok(value),
        Value::Date(d) => Ok(Value::DateTime(d.and_time(NaiveTime::MIN))),
        Value::Text(ref s) => parse_datetime(s.trim())
            .map(Value::DateTime)
            .ok_or_else(|| Converter::DateTime.fail(&value)),
        other => Err(Converter::DateTime.fail(&other)),
    }
}

/// Offset-carrying timestamps are normalised to UTC.
fn parse_datetime(text: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.naive_utc());
    }
    if let Ok(dt) = DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f %z") {
        return Some(dt.naive_utc());
    }
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_converter_selection() {
        assert_eq!(Converter::for_type(AttributeType::Double), Converter::Double);
        assert_eq!(Converter::for_type(AttributeType::Text), Converter::PassThrough);
        assert_eq!(Converter::for_type(AttributeType::Bool), Converter::PassThrough);
    }

    #[test]
    fn test_numeric_text_becomes_double() {
        assert_eq!(
            Converter::Double.convert(Value::Text("12.50".into())).unwrap(),
            Value::Double(12.5)
        );
        assert_eq!(Converter::Double.convert(Value::Int(3)).unwrap(), Value::Double(3.0));
        assert!(Converter::Double.convert(Value::Text("abc".into())).is_err());
    }

    #[test]
    fn test_temporal_conversions() {
        let date = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        assert_eq!(
            Converter::Date.convert(Value::Text("2024-02-29".into())).unwrap(),
            Value::Date(date)
        );
        assert_eq!(
            Converter::DateTime
                .convert(Value::Text("2024-02-29T10:00:00+02:00".into()))
                .unwrap(),
            Value::DateTime(date.and_hms_opt(8, 0, 0).unwrap())
        );
        assert_eq!(
            Converter::DateTime
                .convert(Value::Text("2024-02-29 10:00:00.250".into()))
                .unwrap(),
            Value::DateTime(date.and_hms_milli_opt(10, 0, 0, 250).unwrap())
        );
        assert_eq!(
            Converter::Time.convert(Value::Text("23:59:01".into())).unwrap(),
            Value::Time(NaiveTime::from_hms_opt(23, 59, 1).unwrap())
        );
    }

    #[test]
    fn test_null_passes_every_converter() {
        for converter in [Converter::Date, Converter::Time, Converter::DateTime, Converter::Double] {
            assert_eq!(converter.convert(Value::Null).unwrap(), Value::Null);
        }
    }
}
