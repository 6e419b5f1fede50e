use tokio::sync::watch;

pub type ShutdownTx = watch::Sender<bool>;
pub type ShutdownRx = watch::Receiver<bool>;

pub fn channel() -> (ShutdownTx, ShutdownRx) {
    watch::channel(false)
}

pub fn requested(rx: &ShutdownRx) -> bool {
    *rx.borrow()
}

/// Resolves once shutdown has been requested. A dropped sender counts
/// as a shutdown request so orphaned workers still wind down.
pub async fn wait(rx: &mut ShutdownRx) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}
