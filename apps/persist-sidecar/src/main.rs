mod config;
mod influx;
mod mqtt;
mod shutdown;
mod telemetry;

use crate::config::Config;
use crate::influx::InfluxClient;
use anyhow::Result;
use tokio::time::{timeout, Duration};

const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,persist_sidecar=info".into());
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

    let influx = InfluxClient::new(&config);
    match influx.ping().await {
        Ok(()) => tracing::info!(database = %config.influx_database, "storage sink reachable"),
        Err(err) => tracing::warn!(
            error = %err,
            "storage sink not reachable yet; writes will be attempted per message"
        ),
    }

    // Applied once at startup; an existing policy (or an unreachable
    // sink) leaves whatever retention is already configured in place.
    match influx
        .create_retention_policy(
            &config.retention_policy,
            &config.retention_duration,
            config.retention_replication,
        )
        .await
    {
        Ok(()) => tracing::info!(
            policy = %config.retention_policy,
            duration = %config.retention_duration,
            "retention policy ensured"
        ),
        Err(err) => tracing::warn!(
            error = %err,
            "failed to create retention policy; continuing with existing retention"
        ),
    }

    let (shutdown_tx, shutdown_rx) = shutdown::channel();
    let mut listener = tokio::spawn({
        let config = config.clone();
        let influx = influx.clone();
        async move {
            if let Err(err) = mqtt::run_listener(config, influx, shutdown_rx).await {
                tracing::error!(error = %err, "listener exited");
            }
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("shutdown signal received"),
        _ = &mut listener => {
            tracing::error!("listener task ended unexpectedly");
            return Ok(());
        }
    }

    // The listener finishes any in-flight write before it observes the
    // flag and disconnects the transport.
    let _ = shutdown_tx.send(true);
    if timeout(SHUTDOWN_JOIN_TIMEOUT, listener).await.is_err() {
        tracing::warn!("listener did not stop in time; abandoning");
    }

    Ok(())
}
