use crate::measurement::Measurement;
use crate::shutdown::{self, ShutdownRx};
use tokio::sync::watch;

/// Local rendering seam. The hardware LED matrix lives behind this
/// trait; the shipped sink renders through the log.
pub trait DisplaySink: Send {
    fn show(&mut self, measurement: &Measurement);
}

pub struct LogDisplay;

impl DisplaySink for LogDisplay {
    fn show(&mut self, measurement: &Measurement) {
        let field = |name: &str| measurement.fields.get(name).copied();
        tracing::info!(
            temperature = field("temperature"),
            humidity = field("humidity"),
            pressure = field("pressure"),
            "latest sample"
        );
    }
}

pub async fn run_display<D: DisplaySink>(
    mut sink: D,
    mut latest: watch::Receiver<Option<Measurement>>,
    mut stop: ShutdownRx,
) {
    loop {
        tokio::select! {
            changed = latest.changed() => {
                if changed.is_err() {
                    break;
                }
                let measurement = latest.borrow_and_update().clone();
                if let Some(measurement) = measurement {
                    sink.show(&measurement);
                }
            }
            _ = shutdown::wait(&mut stop) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::{device_tags, Measurement};
    use chrono::Utc;
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    struct RecordingSink(Arc<Mutex<Vec<String>>>);

    impl DisplaySink for RecordingSink {
        fn show(&mut self, measurement: &Measurement) {
            self.0.lock().unwrap().push(measurement.measurement.clone());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn renders_each_published_sample() {
        let shown = Arc::new(Mutex::new(Vec::new()));
        let (latest_tx, latest_rx) = watch::channel(None);
        let (stop_tx, stop_rx) = shutdown::channel();
        let worker = tokio::spawn(run_display(
            RecordingSink(shown.clone()),
            latest_rx,
            stop_rx,
        ));

        let measurement = Measurement::new(
            "environment",
            device_tags("sense_board", "dev-1"),
            Utc::now(),
            BTreeMap::from([("temperature".to_string(), 22.0)]),
        )
        .unwrap();
        latest_tx.send(Some(measurement)).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert_eq!(shown.lock().unwrap().as_slice(), ["environment"]);
        let _ = stop_tx.send(true);
        worker.await.unwrap();
    }
}
