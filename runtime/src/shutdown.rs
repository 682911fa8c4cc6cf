//! Cooperative shutdown signal.
//!
//! Consumers observe the signal only while they wait for the next delivery
//! (and while they back off before a requeue), never while a handler runs, so
//! an in-flight message always reaches ack or reject before the loop exits.

use tokio::sync::watch;

/// Create a connected trigger/signal pair.
#[must_use]
pub fn channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, ShutdownSignal { rx })
}

/// Sending half; triggering is idempotent.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    /// Ask every connected signal to stop.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// A new signal connected to this trigger.
    #[must_use]
    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Receiving half, cloned into every consumer loop.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Whether shutdown has been requested.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown is requested or the trigger is dropped.
    ///
    /// Cancel-safe.
    pub async fn wait(&mut self) {
        // Err means the trigger is gone, which is also a request to stop.
        let _ = self.rx.wait_for(|stop| *stop).await;
    }
}
