use crate::config::Config;
use crate::influx::InfluxClient;
use crate::shutdown::{self, ShutdownRx};
use crate::telemetry::parse_environment_payload;
use anyhow::Result;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use tokio::time::{sleep, Duration};

/// Subscriber loop: wildcard environment feed in, one storage batch
/// write per message out. Decode and write failures drop the message;
/// only a connection error tears the session down, and the outer loop
/// rebuilds it.
pub async fn run_listener(
    config: Config,
    influx: InfluxClient,
    mut stop: ShutdownRx,
) -> Result<()> {
    let filter = config.environment_filter();

    loop {
        if shutdown::requested(&stop) {
            return Ok(());
        }

        let mut options = MqttOptions::new(
            config.mqtt_client_id.clone(),
            config.mqtt_host.clone(),
            config.mqtt_port,
        );
        options.set_keep_alive(Duration::from_secs(30));

        let (client, mut eventloop) = AsyncClient::new(options, 32);

        // Subscribing here means a transport-level reconnect renews the
        // subscription on the next pass through this loop.
        if let Err(err) = client.subscribe(filter.clone(), QoS::AtLeastOnce).await {
            tracing::warn!(error = %err, "failed to subscribe to environment feed; retrying");
            sleep(Duration::from_secs(2)).await;
            continue;
        }
        tracing::info!(topic = %filter, "subscribed to environment feed");

        loop {
            tokio::select! {
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        let mut payload = publish.payload.to_vec();
                        match parse_environment_payload(
                            &config.topic_namespace,
                            &publish.topic,
                            &mut payload,
                        ) {
                            Ok(Some(rows)) if !rows.is_empty() => {
                                match influx.write_points(&rows).await {
                                    Ok(()) => tracing::debug!(
                                        rows = rows.len(),
                                        topic = %publish.topic,
                                        "stored environment batch"
                                    ),
                                    Err(err) => tracing::warn!(
                                        error = %err,
                                        topic = %publish.topic,
                                        "failed to store batch; dropping"
                                    ),
                                }
                            }
                            Ok(_) => {}
                            Err(err) => tracing::warn!(
                                error = %err,
                                topic = %publish.topic,
                                "failed to decode environment payload"
                            ),
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(error = %err, "MQTT connection dropped; reconnecting");
                        break;
                    }
                },
                _ = shutdown::wait(&mut stop) => {
                    let _ = client.disconnect().await;
                    return Ok(());
                }
            }
        }

        sleep(Duration::from_secs(1)).await;
    }
}
