use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

pub const ENVIRONMENT_MEASUREMENT: &str = "environment";
pub const WEATHER_MEASUREMENT: &str = "weather";

#[derive(Debug, Error)]
pub enum MeasurementError {
    #[error("measurement name is empty")]
    EmptyName,
    #[error("measurement {0} has no fields")]
    NoFields(String),
    #[error("field {field} of {measurement} is not finite")]
    NonFiniteField { measurement: String, field: String },
}

/// One tagged record on the wire: `[{measurement, tags, time, fields}]`
/// serialized as a JSON array per batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub time: DateTime<Utc>,
    pub fields: BTreeMap<String, f64>,
}

impl Measurement {
    pub fn new(
        name: &str,
        tags: BTreeMap<String, String>,
        time: DateTime<Utc>,
        fields: BTreeMap<String, f64>,
    ) -> Result<Self, MeasurementError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(MeasurementError::EmptyName);
        }
        if fields.is_empty() {
            return Err(MeasurementError::NoFields(name.to_string()));
        }
        for (field, value) in &fields {
            if !value.is_finite() {
                return Err(MeasurementError::NonFiniteField {
                    measurement: name.to_string(),
                    field: field.clone(),
                });
            }
        }
        Ok(Self {
            measurement: name.to_string(),
            tags,
            time,
            fields,
        })
    }
}

/// One environment record plus optionally one weather record; the unit
/// of enqueue and publish.
pub type MeasurementBatch = Vec<Measurement>;

pub fn device_tags(device_type: &str, device_id: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("device_type".to_string(), device_type.to_string()),
        ("device_id".to_string(), device_id.to_string()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect()
    }

    #[test]
    fn rejects_empty_name() {
        let err = Measurement::new("  ", BTreeMap::new(), Utc::now(), fields(&[("a", 1.0)]))
            .unwrap_err();
        assert!(matches!(err, MeasurementError::EmptyName));
    }

    #[test]
    fn rejects_empty_fields() {
        let err =
            Measurement::new("environment", BTreeMap::new(), Utc::now(), BTreeMap::new())
                .unwrap_err();
        assert!(matches!(err, MeasurementError::NoFields(_)));
    }

    #[test]
    fn rejects_non_finite_fields() {
        let err = Measurement::new(
            "environment",
            BTreeMap::new(),
            Utc::now(),
            fields(&[("pressure", f64::NAN)]),
        )
        .unwrap_err();
        assert!(matches!(err, MeasurementError::NonFiniteField { .. }));
    }

    #[test]
    fn wire_shape_round_trips() {
        let measurement = Measurement::new(
            ENVIRONMENT_MEASUREMENT,
            device_tags("sense_board", "dev-1"),
            Utc::now(),
            fields(&[("temperature", 22.0), ("humidity", 45.0)]),
        )
        .unwrap();
        let batch: MeasurementBatch = vec![measurement.clone()];

        let payload = serde_json::to_vec(&batch).unwrap();
        let decoded: MeasurementBatch = serde_json::from_slice(&payload).unwrap();
        assert_eq!(decoded, batch);
        assert_eq!(decoded[0].tags["device_id"], "dev-1");
    }
}
