use crate::auth::AuthConfig;
use crate::weather::WeatherConfig;
use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;
use url::Url;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Config {
    pub device_id: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_client_id: String,
    pub topic_namespace: String,

    pub auth: Option<AuthConfig>,
    pub auth_refresh_fallback: Duration,

    pub sample_interval: Duration,
    pub sample_queue_capacity: usize,

    pub weather: Option<WeatherConfig>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let _ = dotenv();

        let device_id = env_string("DEVICE_ID", Some(Uuid::new_v4().to_string()))?;

        let (mqtt_host, mqtt_port) = match env_optional("MQTT_BROKER_URL") {
            Some(raw) => {
                let url = Url::parse(&raw).context("invalid MQTT_BROKER_URL")?;
                let host = url
                    .host_str()
                    .ok_or_else(|| anyhow!("MQTT_BROKER_URL missing host"))?
                    .to_string();
                (host, url.port().unwrap_or(1883))
            }
            None => {
                let host = env_string("MQTT_BROKER_HOST", Some("127.0.0.1".to_string()))?;
                let port = env_u64("MQTT_BROKER_PORT", Some(1883))? as u16;
                (host, port)
            }
        };

        let mqtt_client_id = env_string(
            "MQTT_CLIENT_ID",
            Some(format!("home-agent-{}", device_id)),
        )?;
        let topic_namespace = env_string("MQTT_TOPIC_NAMESPACE", Some("iot".to_string()))?;

        let auth = match (
            env_optional("AUTH0_URI"),
            env_optional("AUTH0_CLIENT_ID"),
            env_optional("AUTH0_CLIENT_SECRET"),
            env_optional("AUTH0_AUDIENCE"),
        ) {
            (Some(uri), Some(client_id), Some(client_secret), Some(audience)) => {
                Some(AuthConfig {
                    uri,
                    client_id,
                    client_secret,
                    audience,
                })
            }
            (None, None, None, None) => None,
            _ => {
                return Err(anyhow!(
                    "AUTH0_URI, AUTH0_CLIENT_ID, AUTH0_CLIENT_SECRET and AUTH0_AUDIENCE must be set together"
                ))
            }
        };
        let auth_refresh_fallback =
            Duration::from_secs(env_u64("AUTH_REFRESH_FALLBACK_SECONDS", Some(300))?);

        let sample_interval =
            Duration::from_millis(env_u64("SAMPLE_INTERVAL_MS", Some(1000))?.max(1));
        let sample_queue_capacity =
            env_u64("SAMPLE_QUEUE_CAPACITY", Some(64))?.max(1) as usize;

        let weather = match (env_optional("WEATHER_API_KEY"), env_optional("WEATHER_LOCATION")) {
            (Some(api_key), Some(location)) => Some(WeatherConfig {
                api_key,
                location,
                refresh: Duration::from_secs(
                    env_u64("WEATHER_REFRESH_SECONDS", Some(600))?.max(1),
                ),
            }),
            _ => None,
        };

        Ok(Self {
            device_id,
            mqtt_host,
            mqtt_port,
            mqtt_client_id,
            topic_namespace,
            auth,
            auth_refresh_fallback,
            sample_interval,
            sample_queue_capacity,
            weather,
        })
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
