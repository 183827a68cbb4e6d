//! Shutdown signalling between a stream and the tasks it owns.
//!
//! A [`ShutdownTx`] is held by the owner of a stream; every task spawned for the stream holds a
//! [`ShutdownRx`]. Dropping the last sender counts as a shutdown request, so tasks never outlive
//! a stream that was dropped without being closed.

use tokio::sync::watch;

/// Sending side of a shutdown signal.
#[derive(Debug, Clone)]
pub struct ShutdownTx(watch::Sender<bool>);

impl ShutdownTx {
    /// Requests shutdown of every subscribed task. Repeated calls have no further effect.
    pub fn shutdown(&self) {
        self.0.send_replace(true);
    }

    pub fn subscribe(&self) -> ShutdownRx {
        ShutdownRx(self.0.subscribe())
    }

    pub fn is_shutdown(&self) -> bool {
        *self.0.borrow()
    }
}

/// Receiving side of a shutdown signal.
#[derive(Debug, Clone)]
pub struct ShutdownRx(watch::Receiver<bool>);

impl ShutdownRx {
    /// Returns `true` once shutdown was requested or every sender was dropped.
    pub fn is_shutdown(&self) -> bool {
        *self.0.borrow() || self.0.has_changed().is_err()
    }

    /// Completes once shutdown is requested.
    ///
    /// Completes immediately if the request happened before the call. Cancel safe.
    pub async fn changed(&mut self) {
        // `wait_for` only fails when every sender is gone, which is treated as a request.
        let _ = self.0.wait_for(|requested| *requested).await;
    }
}

/// Creates a connected shutdown pair.
pub fn create_shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTx(tx), ShutdownRx(rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn subscribers_observe_earlier_shutdown() {
        let (tx, _rx) = create_shutdown_channel();
        tx.shutdown();

        let mut late = tx.subscribe();
        assert!(late.is_shutdown());
        tokio::time::timeout(Duration::from_secs(1), late.changed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn dropping_sender_shuts_down() {
        let (tx, mut rx) = create_shutdown_channel();
        assert!(!rx.is_shutdown());

        drop(tx);
        assert!(rx.is_shutdown());
        tokio::time::timeout(Duration::from_secs(1), rx.changed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn pending_until_requested() {
        let (tx, mut rx) = create_shutdown_channel();
        let waiting = tokio::time::timeout(Duration::from_millis(20), rx.changed()).await;
        assert!(waiting.is_err());

        tx.shutdown();
        assert!(tx.is_shutdown());
        rx.changed().await;
    }
}
