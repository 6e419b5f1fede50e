use crate::auth::{Credential, AUTH_USERNAME};
use crate::config::Config;
use crate::measurement::MeasurementBatch;
use crate::shutdown::{self, ShutdownRx};
use anyhow::Result;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

pub fn environment_topic(namespace: &str, device_id: &str) -> String {
    format!("{namespace}/home/{device_id}/environment")
}

pub fn control_topic(namespace: &str, device_id: &str) -> String {
    format!("{namespace}/home/{device_id}/control")
}

/// How one MQTT session ended: the transport dropped or a credential
/// rotated (rebuild the session), or the agent is done with it.
enum SessionEnd {
    Reconnect,
    Closed,
}

/// Consumer loop: drains the sample queue into the broker. Token first,
/// then session: the first connect waits for the credential manager's
/// first verdict. Each (re)connect presents the then-current credential
/// and re-subscribes to the control topic; a rotated credential tears
/// the session down so the next connect carries the fresh token.
pub async fn run_publisher(
    config: Config,
    mut queue: mpsc::Receiver<MeasurementBatch>,
    mut credentials: watch::Receiver<Credential>,
    mut stop: ShutdownRx,
) -> Result<()> {
    let topic = environment_topic(&config.topic_namespace, &config.device_id);
    let control = control_topic(&config.topic_namespace, &config.device_id);

    if !await_first_credential(&mut credentials, &mut stop).await {
        return Ok(());
    }

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
        let credential = credentials.borrow_and_update().clone();
        options.set_credentials(AUTH_USERNAME, credential.mqtt_password());

        let (client, eventloop) = AsyncClient::new(options, 32);

        if let Err(err) = client.subscribe(control.clone(), QoS::AtLeastOnce).await {
            tracing::warn!(error = %err, "failed to subscribe to control topic; retrying");
            sleep(Duration::from_secs(2)).await;
            continue;
        }
        tracing::info!(topic = %topic, "MQTT session up; publishing environment batches");

        let mut poller = spawn_poller(eventloop, control.clone());

        let end = drain_queue(
            &client,
            &topic,
            &mut queue,
            &mut credentials,
            &mut poller,
            &mut stop,
        )
        .await;

        match end {
            SessionEnd::Closed => {
                let _ = client.disconnect().await;
                poller.abort();
                return Ok(());
            }
            SessionEnd::Reconnect => {
                poller.abort();
                sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Holds the first connect until the credential manager has resolved
/// once (it notifies on its first success or failure). A dropped sender
/// means no manager is running and the cell's fallback credential is
/// final. Returns false if shutdown wins.
async fn await_first_credential(
    credentials: &mut watch::Receiver<Credential>,
    stop: &mut ShutdownRx,
) -> bool {
    tokio::select! {
        res = credentials.changed() => {
            let _ = res;
            true
        }
        _ = shutdown::wait(stop) => false,
    }
}

/// One session's drain loop: publishes batches as they arrive until the
/// transport drops, the credential rotates, the queue closes, or
/// shutdown is requested. A publish failure drops that batch and the
/// loop moves on to the next one.
async fn drain_queue(
    client: &AsyncClient,
    topic: &str,
    queue: &mut mpsc::Receiver<MeasurementBatch>,
    credentials: &mut watch::Receiver<Credential>,
    poller: &mut JoinHandle<Result<()>>,
    stop: &mut ShutdownRx,
) -> SessionEnd {
    // One-shot guard: with no credential manager the sender is gone and
    // `changed` resolves with Err on every poll.
    let mut watch_credentials = true;

    loop {
        tokio::select! {
            res = &mut *poller => {
                match res {
                    Ok(Err(err)) => tracing::warn!(error = %err, "MQTT connection dropped; reconnecting"),
                    Ok(Ok(())) => {}
                    Err(err) => tracing::warn!(error = %err, "MQTT poller task failed"),
                }
                return SessionEnd::Reconnect;
            }
            res = credentials.changed(), if watch_credentials => {
                match res {
                    Ok(()) => {
                        tracing::info!("credential rotated; reconnecting with the fresh token");
                        return SessionEnd::Reconnect;
                    }
                    Err(_) => watch_credentials = false,
                }
            }
            maybe = queue.recv() => {
                let Some(batch) = maybe else {
                    return SessionEnd::Closed;
                };
                publish_batch(client, topic, &batch).await;
            }
            _ = shutdown::wait(stop) => return SessionEnd::Closed,
        }
    }
}

async fn publish_batch(client: &AsyncClient, topic: &str, batch: &MeasurementBatch) {
    let payload = match serde_json::to_vec(batch) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::warn!(error = %err, "failed to encode batch; dropping");
            return;
        }
    };
    match client
        .publish(topic, QoS::AtLeastOnce, false, payload)
        .await
    {
        Ok(()) => tracing::debug!(records = batch.len(), "published environment batch"),
        Err(err) => tracing::warn!(error = %err, "failed to publish batch; dropping"),
    }
}

fn spawn_poller(mut eventloop: rumqttc::EventLoop, control_topic: String) -> JoinHandle<Result<()>> {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    if publish.topic == control_topic {
                        // Control payloads are accepted but not acted on.
                        tracing::info!(bytes = publish.payload.len(), "control message received");
                    }
                }
                Ok(_) => {}
                Err(err) => return Err(err.into()),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::{device_tags, Measurement, ENVIRONMENT_MEASUREMENT};
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn batch() -> MeasurementBatch {
        vec![Measurement::new(
            ENVIRONMENT_MEASUREMENT,
            device_tags("sense_board", "dev-1"),
            Utc::now(),
            BTreeMap::from([("temperature".to_string(), 22.0)]),
        )
        .unwrap()]
    }

    /// Client whose publishes fail immediately: the request channel to
    /// the event loop is closed.
    fn dead_client() -> AsyncClient {
        let (client, eventloop) = AsyncClient::new(MqttOptions::new("t", "localhost", 1883), 8);
        drop(eventloop);
        client
    }

    fn idle_poller() -> JoinHandle<Result<()>> {
        tokio::spawn(async {
            std::future::pending::<()>().await;
            Ok(())
        })
    }

    #[test]
    fn topics_are_scoped_to_the_device() {
        assert_eq!(
            environment_topic("iot", "dev-1"),
            "iot/home/dev-1/environment"
        );
        assert_eq!(control_topic("iot", "dev-1"), "iot/home/dev-1/control");
    }

    #[test]
    fn environment_topic_matches_the_sink_wildcard() {
        let topic = environment_topic("iot", "dev-1");
        let parts: Vec<&str> = topic.split('/').collect();
        // Sink subscribes to `<ns>/home/+/environment`.
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "iot");
        assert_eq!(parts[1], "home");
        assert_eq!(parts[3], "environment");
    }

    #[tokio::test(start_paused = true)]
    async fn first_connect_waits_for_the_credential_manager() {
        let (credential_tx, mut credentials) = watch::channel(Credential::fallback());
        let (_stop_tx, mut stop) = shutdown::channel();

        tokio::select! {
            _ = await_first_credential(&mut credentials, &mut stop) => {
                panic!("connected before the credential manager resolved");
            }
            _ = sleep(Duration::from_secs(10)) => {}
        }

        credential_tx.send(Credential::fallback()).unwrap();
        assert!(await_first_credential(&mut credentials, &mut stop).await);
    }

    #[tokio::test]
    async fn missing_credential_manager_does_not_block_the_connect() {
        let (credential_tx, mut credentials) = watch::channel(Credential::fallback());
        drop(credential_tx);
        let (_stop_tx, mut stop) = shutdown::channel();
        assert!(await_first_credential(&mut credentials, &mut stop).await);
    }

    #[tokio::test]
    async fn publish_failure_drops_the_batch_and_keeps_draining() {
        let client = dead_client();
        let (queue_tx, mut queue) = mpsc::channel::<MeasurementBatch>(4);
        let (_credential_tx, mut credentials) = watch::channel(Credential::fallback());
        let (_stop_tx, mut stop) = shutdown::channel();
        let mut poller = idle_poller();

        // Two batches, both of which fail to publish, then queue close.
        queue_tx.send(batch()).await.unwrap();
        queue_tx.send(batch()).await.unwrap();
        drop(queue_tx);

        let end = drain_queue(
            &client,
            "iot/home/dev-1/environment",
            &mut queue,
            &mut credentials,
            &mut poller,
            &mut stop,
        )
        .await;

        // Reaching Closed means the loop went back to recv after each
        // failed publish instead of bailing out.
        assert!(matches!(end, SessionEnd::Closed));
        poller.abort();
    }

    #[tokio::test]
    async fn credential_rotation_tears_the_session_down() {
        let client = dead_client();
        let (queue_tx, mut queue) = mpsc::channel::<MeasurementBatch>(4);
        let (credential_tx, mut credentials) = watch::channel(Credential::fallback());
        let (_stop_tx, mut stop) = shutdown::channel();
        let mut poller = idle_poller();

        credential_tx
            .send(Credential {
                token_type: "Bearer".to_string(),
                access_token: "rotated-token".to_string(),
                expires_in: Some(Duration::from_secs(60)),
            })
            .unwrap();

        let end = drain_queue(
            &client,
            "iot/home/dev-1/environment",
            &mut queue,
            &mut credentials,
            &mut poller,
            &mut stop,
        )
        .await;

        assert!(matches!(end, SessionEnd::Reconnect));
        assert_eq!(credentials.borrow_and_update().access_token, "rotated-token");
        poller.abort();
        drop(queue_tx);
    }
}
