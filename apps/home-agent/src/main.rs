mod auth;
mod config;
mod display;
mod measurement;
mod mqtt;
mod sampler;
mod sensors;
mod shutdown;
mod weather;

use crate::auth::Credential;
use crate::config::Config;
use crate::display::LogDisplay;
use crate::measurement::{Measurement, MeasurementBatch};
use crate::sensors::SimulatedBoard;
use crate::weather::WeatherSnapshot;
use anyhow::Result;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,home_agent=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing()?;
    tracing::info!(device_id = %config.device_id, "home-agent starting");

    let http = reqwest::Client::new();
    let (shutdown_tx, shutdown_rx) = shutdown::channel();
    let (queue_tx, queue_rx) =
        mpsc::channel::<MeasurementBatch>(config.sample_queue_capacity);
    let (credential_tx, credential_rx) = watch::channel(Credential::fallback());
    let (latest_tx, latest_rx) = watch::channel::<Option<Measurement>>(None);
    let (weather_tx, weather_rx) = watch::channel::<Option<WeatherSnapshot>>(None);

    let mut workers: Vec<(&str, JoinHandle<()>)> = Vec::new();

    if let Some(auth_config) = config.auth.clone() {
        let client = http.clone();
        let refresh_fallback = config.auth_refresh_fallback;
        let stop = shutdown_rx.clone();
        workers.push((
            "token-manager",
            tokio::spawn(async move {
                auth::run_token_manager(client, auth_config, refresh_fallback, credential_tx, stop)
                    .await;
            }),
        ));
    } else {
        tracing::warn!("auth endpoint not configured; publishing with fallback credentials");
        // No manager will ever send; dropping the sender lets the
        // publisher connect with the fallback straight away.
        drop(credential_tx);
    }

    if let Some(weather_config) = config.weather.clone() {
        let client = http.clone();
        let stop = shutdown_rx.clone();
        workers.push((
            "weather",
            tokio::spawn(async move {
                weather::run_weather_task(client, weather_config, weather_tx, stop).await;
            }),
        ));
    }

    {
        let device_id = config.device_id.clone();
        let interval = config.sample_interval;
        let stop = shutdown_rx.clone();
        workers.push((
            "sampler",
            tokio::spawn(async move {
                sampler::run_sampler(
                    SimulatedBoard::new(),
                    device_id,
                    interval,
                    queue_tx,
                    latest_tx,
                    weather_rx,
                    stop,
                )
                .await;
            }),
        ));
    }

    {
        let stop = shutdown_rx.clone();
        workers.push((
            "display",
            tokio::spawn(async move {
                display::run_display(LogDisplay, latest_rx, stop).await;
            }),
        ));
    }

    let mut publisher = tokio::spawn({
        let config = config.clone();
        let stop = shutdown_rx.clone();
        async move {
            if let Err(err) = mqtt::run_publisher(config, queue_rx, credential_rx, stop).await {
                tracing::error!(error = %err, "publisher exited");
            }
        }
    });

    let publisher_done = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
            false
        }
        _ = &mut publisher => {
            tracing::error!("publisher task ended unexpectedly");
            true
        }
    };

    let _ = shutdown_tx.send(true);
    if !publisher_done {
        join_worker("publisher", publisher).await;
    }
    for (name, handle) in workers {
        join_worker(name, handle).await;
    }

    Ok(())
}

async fn join_worker(name: &str, handle: JoinHandle<()>) {
    match timeout(SHUTDOWN_JOIN_TIMEOUT, handle).await {
        Ok(Ok(())) => tracing::debug!(worker = name, "worker stopped"),
        Ok(Err(err)) => tracing::warn!(worker = name, error = %err, "worker join failed"),
        Err(_) => tracing::warn!(worker = name, "worker did not stop in time; abandoning"),
    }
}
