use crate::measurement::{Measurement, MeasurementError, WEATHER_MEASUREMENT};
use crate::shutdown::{self, ShutdownRx};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

const WEATHER_ENDPOINT: &str = "https://api.openweathermap.org/data/2.5/weather";

#[derive(Debug, Clone)]
pub struct WeatherConfig {
    pub api_key: String,
    pub location: String,
    pub refresh: Duration,
}

/// Latest outdoor conditions; merged into sample batches as a second
/// record while fresh.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeatherSnapshot {
    pub temperature: f64,
    pub humidity: f64,
    pub pressure: f64,
    pub wind_speed: Option<f64>,
}

#[derive(Deserialize)]
struct WeatherResponse {
    main: WeatherMain,
    #[serde(default)]
    wind: Option<WeatherWind>,
}

#[derive(Deserialize)]
struct WeatherMain {
    temp: f64,
    humidity: f64,
    pressure: f64,
}

#[derive(Deserialize)]
struct WeatherWind {
    speed: f64,
}

pub fn weather_measurement(
    snapshot: &WeatherSnapshot,
    tags: BTreeMap<String, String>,
    time: DateTime<Utc>,
) -> Result<Measurement, MeasurementError> {
    let mut fields = BTreeMap::new();
    fields.insert("temperature".to_string(), snapshot.temperature);
    fields.insert("humidity".to_string(), snapshot.humidity);
    fields.insert("pressure".to_string(), snapshot.pressure);
    if let Some(speed) = snapshot.wind_speed {
        fields.insert("wind_speed".to_string(), speed);
    }
    Measurement::new(WEATHER_MEASUREMENT, tags, time, fields)
}

async fn fetch_snapshot(client: &Client, config: &WeatherConfig) -> anyhow::Result<WeatherSnapshot> {
    let response = client
        .get(WEATHER_ENDPOINT)
        .query(&[
            ("q", config.location.as_str()),
            ("appid", config.api_key.as_str()),
            ("units", "metric"),
        ])
        .send()
        .await?
        .error_for_status()?;
    let body: WeatherResponse = response.json().await?;
    Ok(WeatherSnapshot {
        temperature: body.main.temp,
        humidity: body.main.humidity,
        pressure: body.main.pressure,
        wind_speed: body.wind.map(|wind| wind.speed),
    })
}

/// Refreshes the shared snapshot on its own slow cadence. A failed fetch
/// clears the cell so the sampler omits the weather record instead of
/// republishing stale conditions.
pub async fn run_weather_task(
    client: Client,
    config: WeatherConfig,
    snapshots: watch::Sender<Option<WeatherSnapshot>>,
    mut stop: ShutdownRx,
) {
    let mut ticker = tokio::time::interval(config.refresh);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown::wait(&mut stop) => return,
        }

        match fetch_snapshot(&client, &config).await {
            Ok(snapshot) => {
                tracing::debug!(
                    location = %config.location,
                    temperature = snapshot.temperature,
                    "weather snapshot refreshed"
                );
                let _ = snapshots.send(Some(snapshot));
            }
            Err(err) => {
                tracing::debug!(error = %err, "weather fetch failed; omitting weather record");
                let _ = snapshots.send(None);
            }
        }
    }
}
