use crate::measurement::{
    device_tags, Measurement, MeasurementBatch, ENVIRONMENT_MEASUREMENT,
};
use crate::sensors::{environment_fields, ReadingSource};
use crate::shutdown::{self, ShutdownRx};
use crate::weather::{weather_measurement, WeatherSnapshot};
use chrono::Utc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

pub const DEVICE_TYPE: &str = "sense_board";

/// Producer loop: one batch per tick onto the bounded queue, latest
/// environment record into the display cell. A sensor failure skips the
/// tick; a full queue applies backpressure via the bounded send.
pub async fn run_sampler<S: ReadingSource>(
    mut source: S,
    device_id: String,
    interval: Duration,
    queue: mpsc::Sender<MeasurementBatch>,
    latest: watch::Sender<Option<Measurement>>,
    weather: watch::Receiver<Option<WeatherSnapshot>>,
    mut stop: ShutdownRx,
) {
    let tags = device_tags(DEVICE_TYPE, &device_id);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown::wait(&mut stop) => break,
        }

        let reading = match source.read() {
            Ok(reading) => reading,
            Err(err) => {
                tracing::warn!(error = %err, "sensor read failed; skipping tick");
                continue;
            }
        };

        let now = Utc::now();
        let environment = match Measurement::new(
            ENVIRONMENT_MEASUREMENT,
            tags.clone(),
            now,
            environment_fields(&reading),
        ) {
            Ok(measurement) => measurement,
            Err(err) => {
                tracing::warn!(error = %err, "sensor reading rejected; skipping tick");
                continue;
            }
        };

        let mut batch: MeasurementBatch = vec![environment.clone()];
        if let Some(snapshot) = *weather.borrow() {
            match weather_measurement(&snapshot, tags.clone(), now) {
                Ok(measurement) => batch.push(measurement),
                Err(err) => tracing::debug!(error = %err, "weather snapshot rejected"),
            }
        }

        let _ = latest.send(Some(environment));

        if queue.send(batch).await.is_err() {
            tracing::info!("sample queue closed; stopping sampler");
            break;
        }
    }
}
