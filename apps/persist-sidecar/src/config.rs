use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;
use std::env;
use uuid::Uuid;

pub const DEFAULT_RETENTION_POLICY: &str = "expiry_policy";

#[derive(Debug, Clone)]
pub struct Config {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_client_id: String,
    pub topic_namespace: String,

    pub influx_host: String,
    pub influx_port: u16,
    pub influx_user: Option<String>,
    pub influx_password: Option<String>,
    pub influx_database: String,

    pub retention_policy: String,
    pub retention_duration: String,
    pub retention_replication: u32,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let _ = dotenv();

        let mqtt_host = env_string("MQTT_BROKER_HOST", Some("127.0.0.1".to_string()))?;
        let mqtt_port = env_u64("MQTT_BROKER_PORT", Some(1883))? as u16;
        let mqtt_client_id = env_string(
            "MQTT_CLIENT_ID",
            Some(format!("persist-sidecar-{}", Uuid::new_v4())),
        )?;
        let topic_namespace = env_string("MQTT_TOPIC_NAMESPACE", Some("iot".to_string()))?;

        let influx_host = env_string("INFLUXDB_HOST", Some("127.0.0.1".to_string()))?;
        let influx_port = env_u64("INFLUXDB_PORT", Some(8086))? as u16;
        let influx_user = env_optional("INFLUXDB_USER");
        let influx_password = env_optional("INFLUXDB_USER_PASSWORD");
        let influx_database = env_string("INFLUXDB_DB", Some("home".to_string()))?;

        let retention_policy = env_string(
            "INFLUXDB_RETENTION_POLICY",
            Some(DEFAULT_RETENTION_POLICY.to_string()),
        )?;
        let retention_duration = env_string("INFLUXDB_RETENTION", Some("4w".to_string()))?;
        let retention_replication =
            env_u64("INFLUXDB_RETENTION_REPLICATION", Some(1))?.max(1) as u32;

        Ok(Self {
            mqtt_host,
            mqtt_port,
            mqtt_client_id,
            topic_namespace,
            influx_host,
            influx_port,
            influx_user,
            influx_password,
            influx_database,
            retention_policy,
            retention_duration,
            retention_replication,
        })
    }

    pub fn environment_filter(&self) -> String {
        format!("{}/home/+/environment", self.topic_namespace)
    }

    pub fn influx_base_url(&self) -> String {
        format!("http://{}:{}", self.influx_host, self.influx_port)
    }
}

fn env_string(key: &str, default: Option<String>) -> Result<String> {
    match env::var(key) {
        Ok(value) => Ok(value.trim().to_string()),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_u64(key: &str, default: Option<u64>) -> Result<u64> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid {key}")),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
