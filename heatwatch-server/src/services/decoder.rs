use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Value};
use time::OffsetDateTime;

use crate::errors::DecodeError;
use crate::models::MeasurementKind;

/// A decoded value of one measurement kind, stamped with its arrival time.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Reading {
    pub kind: MeasurementKind,
    pub value: Option<f64>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StructuredPayload {
    /// Recognized measurement keys; `None` when the value could not be read as a number
    pub measurements: BTreeMap<MeasurementKind, Option<f64>>,
    /// Everything else in the object, passed through untouched
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum DecodedPayload {
    /// A single number, read in the device's primary measurement kind
    Bare(f64),
    Structured(StructuredPayload),
}

impl DecodedPayload {
    /// Expands the payload into readings, using `primary` for a bare number.
    pub fn readings(&self, primary: MeasurementKind, timestamp: OffsetDateTime) -> Vec<Reading> {
        match self {
            DecodedPayload::Bare(value) => vec![Reading {
                kind: primary,
                value: Some(*value),
                timestamp,
            }],
            DecodedPayload::Structured(payload) => payload
                .measurements
                .iter()
                .map(|(kind, value)| Reading {
                    kind: *kind,
                    value: *value,
                    timestamp,
                })
                .collect(),
        }
    }
}

pub fn decode(raw: &[u8]) -> Result<DecodedPayload, DecodeError> {
    let text = std::str::from_utf8(raw).map_err(|_| DecodeError::InvalidUtf8)?;
    let text = text.trim();

    if text.is_empty() {
        return Err(DecodeError::Empty);
    }

    if text.starts_with('{') && text.ends_with('}') {
        return decode_object(text).map(DecodedPayload::Structured);
    }

    let value: f64 = text
        .parse()
        .map_err(|_| DecodeError::NotNumeric(text.to_string()))?;

    if !value.is_finite() {
        return Err(DecodeError::NonFinite(text.to_string()));
    }

    Ok(DecodedPayload::Bare(value))
}

fn decode_object(text: &str) -> Result<StructuredPayload, DecodeError> {
    let mut extra: Map<String, Value> =
        serde_json::from_str(text).map_err(|e| DecodeError::MalformedJson(e.to_string()))?;

    let mut measurements = BTreeMap::new();
    for kind in MeasurementKind::ALL {
        if let Some(value) = extra.remove(kind.as_str()) {
            measurements.insert(kind, coerce(kind, &value));
        }
    }

    Ok(StructuredPayload {
        measurements,
        extra,
    })
}

fn coerce(kind: MeasurementKind, value: &Value) -> Option<f64> {
    let number = match value {
        Value::Null => return None,
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    };

    match number {
        Some(number) if number.is_finite() => Some(number),
        _ => {
            tracing::warn!("invalid numeric value for {}: {}", kind, value);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    #[test]
    fn test_bare_numbers_parse_like_f64() {
        for text in ["160.0", "  42 ", "-3.5", "1e2", "0", "+7.25"] {
            let expected: f64 = text.trim().parse().unwrap();
            assert_eq!(decode(text.as_bytes()), Ok(DecodedPayload::Bare(expected)));
        }
    }

    #[test]
    fn test_rejects_non_numeric_text() {
        for text in ["hot", "12,5", "[1]", "{", "1.0}", "0x10"] {
            assert!(decode(text.as_bytes()).is_err(), "{text} should not decode");
        }
        assert_eq!(decode(b"   "), Err(DecodeError::Empty));
    }

    #[test]
    fn test_rejects_non_finite_numbers() {
        assert!(matches!(decode(b"NaN"), Err(DecodeError::NonFinite(_))));
        assert!(matches!(decode(b"inf"), Err(DecodeError::NonFinite(_))));
    }

    #[test]
    fn test_rejects_invalid_utf8() {
        assert_eq!(decode(&[0xff, 0xfe, 0x31]), Err(DecodeError::InvalidUtf8));
    }

    #[test]
    fn test_rejects_malformed_object() {
        assert!(matches!(
            decode(b"{temperature: 12}"),
            Err(DecodeError::MalformedJson(_))
        ));
    }

    #[test]
    fn test_structured_payload_coerces_recognized_keys() {
        let payload = br#"{"temperature": "130.5", "humidity": 55, "pressure": "high", "water_level": true, "rssi": -61}"#;

        let DecodedPayload::Structured(decoded) = decode(payload).unwrap() else {
            panic!("expected a structured payload");
        };

        assert_eq!(decoded.measurements[&MeasurementKind::Temperature], Some(130.5));
        assert_eq!(decoded.measurements[&MeasurementKind::Humidity], Some(55.0));
        assert_eq!(decoded.measurements[&MeasurementKind::Pressure], None);
        assert_eq!(decoded.measurements[&MeasurementKind::WaterLevel], None);
        assert_eq!(decoded.extra["rssi"], Value::from(-61));
        assert!(!decoded.extra.contains_key("temperature"));
    }

    #[test]
    fn test_readings_use_primary_kind_for_bare_values() {
        let at = datetime!(2024-03-01 08:00:00 UTC);

        let readings = DecodedPayload::Bare(61.0).readings(MeasurementKind::Humidity, at);
        assert_eq!(
            readings,
            vec![Reading {
                kind: MeasurementKind::Humidity,
                value: Some(61.0),
                timestamp: at,
            }]
        );

        let structured = decode(br#"{"humidity": null}"#).unwrap();
        let readings = structured.readings(MeasurementKind::Temperature, at);
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].kind, MeasurementKind::Humidity);
        assert_eq!(readings[0].value, None);
    }
}
