use anyhow::Result;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;

/// One measurement record destined for the storage sink.
#[derive(Debug, Clone, PartialEq)]
pub struct PointRow {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub time: DateTime<Utc>,
    pub fields: BTreeMap<String, f64>,
}

#[derive(Debug, Deserialize)]
struct WireMeasurement {
    measurement: String,
    #[serde(default)]
    tags: BTreeMap<String, String>,
    #[serde(default)]
    time: Option<WireTimestamp>,
    #[serde(default)]
    fields: BTreeMap<String, f64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireTimestamp {
    Str(String),
    Int(i64),
    Float(f64),
}

impl WireTimestamp {
    fn to_datetime(&self) -> DateTime<Utc> {
        match self {
            // Some publishers emit naive ISO timestamps without an offset;
            // those are UTC on the wire.
            WireTimestamp::Str(raw) => DateTime::parse_from_rfc3339(raw)
                .map(|dt| dt.with_timezone(&Utc))
                .or_else(|_| {
                    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                        .map(|naive| naive.and_utc())
                })
                .unwrap_or_else(|_| Utc::now()),
            WireTimestamp::Int(ms) => millis_to_dt(*ms),
            WireTimestamp::Float(secs) => millis_to_dt((*secs * 1000.0) as i64),
        }
    }
}

fn millis_to_dt(ms: i64) -> DateTime<Utc> {
    let secs = ms / 1000;
    let nanos = ((ms % 1000) * 1_000_000) as u32;
    Utc.timestamp_opt(secs, nanos)
        .single()
        .unwrap_or_else(Utc::now)
}

/// Decodes an environment-feed payload into storage rows. Returns
/// `Ok(None)` for topics outside `{namespace}/home/+/environment`;
/// records without usable fields are dropped with a count in the log.
pub fn parse_environment_payload(
    namespace: &str,
    topic: &str,
    payload: &mut [u8],
) -> Result<Option<Vec<PointRow>>> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() != 4 || parts[0] != namespace || parts[1] != "home" || parts[3] != "environment"
    {
        return Ok(None);
    }

    let records: Vec<WireMeasurement> = simd_json::serde::from_slice(payload)?;
    let total = records.len();
    let mut rows = Vec::with_capacity(total);
    for record in records {
        if record.measurement.trim().is_empty() {
            continue;
        }
        let fields: BTreeMap<String, f64> = record
            .fields
            .into_iter()
            .filter(|(_, value)| value.is_finite())
            .collect();
        if fields.is_empty() {
            continue;
        }
        rows.push(PointRow {
            measurement: record.measurement,
            tags: record.tags,
            time: record
                .time
                .as_ref()
                .map(WireTimestamp::to_datetime)
                .unwrap_or_else(Utc::now),
            fields,
        });
    }

    if rows.len() < total {
        tracing::debug!(
            device = parts[2],
            dropped = total - rows.len(),
            "dropped records without usable fields"
        );
    }
    Ok(Some(rows))
}

#[cfg(test)]
mod tests {
    use super::*;

    const NS: &str = "iot";
    const TOPIC: &str = "iot/home/dev-1/environment";

    #[test]
    fn agent_payload_round_trips_field_for_field() {
        let mut payload = br#"[{
            "measurement": "environment",
            "tags": {"device_type": "sense_board", "device_id": "dev-1"},
            "time": "2026-08-30T12:00:00.123456Z",
            "fields": {"temperature": 22.0, "humidity": 45.0, "acceleration_z": 1.0}
        }]"#
        .to_vec();

        let rows = parse_environment_payload(NS, TOPIC, &mut payload)
            .expect("parsed")
            .expect("environment topic");
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.measurement, "environment");
        assert_eq!(row.tags["device_id"], "dev-1");
        assert!((row.fields["temperature"] - 22.0).abs() < 1e-9);
        assert!((row.fields["humidity"] - 45.0).abs() < 1e-9);
        assert!((row.fields["acceleration_z"] - 1.0).abs() < 1e-9);
        assert_eq!(
            row.time,
            "2026-08-30T12:00:00.123456Z".parse::<DateTime<Utc>>().unwrap()
        );
    }

    #[test]
    fn naive_timestamps_are_read_as_utc() {
        let mut payload = br#"[{
            "measurement": "environment",
            "time": "2026-08-30T12:00:00.500",
            "fields": {"pressure": 1013.2}
        }]"#
        .to_vec();
        let rows = parse_environment_payload(NS, TOPIC, &mut payload)
            .unwrap()
            .unwrap();
        assert_eq!(
            rows[0].time,
            "2026-08-30T12:00:00.500Z".parse::<DateTime<Utc>>().unwrap()
        );
    }

    #[test]
    fn foreign_topics_are_ignored() {
        let mut payload = b"[]".to_vec();
        assert!(parse_environment_payload(NS, "iot/home/dev-1/status", &mut payload)
            .unwrap()
            .is_none());
        assert!(parse_environment_payload(NS, "other/home/dev-1/environment", &mut payload)
            .unwrap()
            .is_none());
    }

    #[test]
    fn malformed_payload_is_an_error_not_a_panic() {
        let mut payload = b"{not json".to_vec();
        assert!(parse_environment_payload(NS, TOPIC, &mut payload).is_err());
    }

    #[test]
    fn records_without_fields_are_dropped() {
        let mut payload = br#"[
            {"measurement": "environment", "fields": {}},
            {"measurement": "", "fields": {"x": 1.0}},
            {"measurement": "weather", "fields": {"temperature": 9.5}}
        ]"#
        .to_vec();
        let rows = parse_environment_payload(NS, TOPIC, &mut payload)
            .unwrap()
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].measurement, "weather");
    }

    #[test]
    fn null_field_values_fail_to_decode() {
        let mut payload = br#"[{
            "measurement": "environment",
            "fields": {"temperature": 22.0, "broken": null}
        }]"#
        .to_vec();
        assert!(parse_environment_payload(NS, TOPIC, &mut payload).is_err());
    }
}
