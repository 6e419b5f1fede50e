use crate::config::Config;
use crate::telemetry::PointRow;
use chrono::{DateTime, Utc};
use reqwest::Client;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("write failed: {0}")]
    Write(String),
    #[error("query failed: {0}")]
    Query(String),
    #[error("sink unreachable: {0}")]
    Unreachable(String),
}

/// Thin client over the InfluxDB 1.x HTTP API: line-protocol batch
/// writes plus the one management query the sidecar needs.
#[derive(Clone)]
pub struct InfluxClient {
    http: Client,
    base_url: String,
    database: String,
    user: Option<String>,
    password: Option<String>,
}

impl InfluxClient {
    pub fn new(config: &Config) -> Self {
        Self {
            http: Client::new(),
            base_url: config.influx_base_url(),
            database: config.influx_database.clone(),
            user: config.influx_user.clone(),
            password: config.influx_password.clone(),
        }
    }

    pub async fn ping(&self) -> Result<(), StorageError> {
        let response = self
            .http
            .get(format!("{}/ping", self.base_url))
            .send()
            .await
            .map_err(|err| StorageError::Unreachable(err.to_string()))?;
        if !response.status().is_success() {
            return Err(StorageError::Unreachable(format!(
                "ping returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    pub async fn create_retention_policy(
        &self,
        name: &str,
        duration: &str,
        replication: u32,
    ) -> Result<(), StorageError> {
        let statement = retention_policy_statement(name, &self.database, duration, replication);
        let mut request = self
            .http
            .post(format!("{}/query", self.base_url))
            .query(&[("q", statement.as_str())]);
        if let Some(user) = &self.user {
            request = request.basic_auth(user, self.password.as_deref());
        }
        let response = request
            .send()
            .await
            .map_err(|err| StorageError::Query(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StorageError::Query(format!("{status}: {body}")));
        }
        Ok(())
    }

    /// One batch write per call; the caller drops the batch on failure.
    pub async fn write_points(&self, rows: &[PointRow]) -> Result<(), StorageError> {
        if rows.is_empty() {
            return Ok(());
        }
        let body = encode_lines(rows);
        let mut request = self
            .http
            .post(format!("{}/write", self.base_url))
            .query(&[("db", self.database.as_str()), ("precision", "ns")])
            .body(body);
        if let Some(user) = &self.user {
            request = request.basic_auth(user, self.password.as_deref());
        }
        let response = request
            .send()
            .await
            .map_err(|err| StorageError::Write(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StorageError::Write(format!("{status}: {body}")));
        }
        Ok(())
    }
}

pub fn retention_policy_statement(
    name: &str,
    database: &str,
    duration: &str,
    replication: u32,
) -> String {
    format!(
        "CREATE RETENTION POLICY \"{name}\" ON \"{database}\" DURATION {duration} REPLICATION {replication} DEFAULT"
    )
}

pub fn encode_lines(rows: &[PointRow]) -> String {
    let mut out = String::new();
    for row in rows {
        if !out.is_empty() {
            out.push('\n');
        }
        encode_line(&mut out, row);
    }
    out
}

fn encode_line(out: &mut String, row: &PointRow) {
    escape_measurement(out, &row.measurement);
    for (key, value) in &row.tags {
        out.push(',');
        escape_key(out, key);
        out.push('=');
        escape_key(out, value);
    }
    out.push(' ');
    let mut first = true;
    for (key, value) in &row.fields {
        if !first {
            out.push(',');
        }
        first = false;
        escape_key(out, key);
        out.push('=');
        out.push_str(&value.to_string());
    }
    out.push(' ');
    out.push_str(&timestamp_ns(row.time).to_string());
}

fn escape_measurement(out: &mut String, raw: &str) {
    for ch in raw.chars() {
        if ch == ',' || ch == ' ' {
            out.push('\\');
        }
        out.push(ch);
    }
}

fn escape_key(out: &mut String, raw: &str) {
    for ch in raw.chars() {
        if ch == ',' || ch == '=' || ch == ' ' {
            out.push('\\');
        }
        out.push(ch);
    }
}

fn timestamp_ns(time: DateTime<Utc>) -> i64 {
    time.timestamp_nanos_opt()
        .unwrap_or_else(|| time.timestamp_millis().saturating_mul(1_000_000))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn row() -> PointRow {
        PointRow {
            measurement: "environment".to_string(),
            tags: BTreeMap::from([
                ("device_id".to_string(), "dev-1".to_string()),
                ("device_type".to_string(), "sense_board".to_string()),
            ]),
            time: "2026-08-30T12:00:00Z".parse().unwrap(),
            fields: BTreeMap::from([
                ("humidity".to_string(), 45.0),
                ("temperature".to_string(), 22.0),
            ]),
        }
    }

    #[test]
    fn encodes_sorted_tags_and_fields() {
        let point = row();
        let ns = point.time.timestamp_nanos_opt().unwrap();
        let line = encode_lines(&[point]);
        assert_eq!(
            line,
            format!("environment,device_id=dev-1,device_type=sense_board humidity=45,temperature=22 {ns}")
        );
    }

    #[test]
    fn batches_join_with_newlines() {
        let lines = encode_lines(&[row(), row()]);
        assert_eq!(lines.lines().count(), 2);
    }

    #[test]
    fn escapes_spaces_commas_and_equals() {
        let mut point = row();
        point.measurement = "env data".to_string();
        point.tags.insert("site".to_string(), "attic, north".to_string());
        point
            .fields
            .insert("odd=key".to_string(), 1.0);
        let line = encode_lines(&[point]);
        assert!(line.starts_with("env\\ data,"));
        assert!(line.contains("site=attic\\,\\ north"));
        assert!(line.contains("odd\\=key=1"));
    }

    #[test]
    fn retention_statement_matches_management_api() {
        assert_eq!(
            retention_policy_statement("expiry_policy", "home", "4w", 1),
            "CREATE RETENTION POLICY \"expiry_policy\" ON \"home\" DURATION 4w REPLICATION 1 DEFAULT"
        );
    }
}
