//! Cooperative stop signalling for account loops
//!
//! A stop request is observed at the top of each loop iteration and during the
//! inter-cycle sleep. Nothing is cancelled mid-call: an order submission in
//! flight always completes so its outcome is known.

use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

/// Sender side of a stop request
#[derive(Debug)]
pub struct ShutdownSignal {
    name: String,
    tx: watch::Sender<bool>,
}

impl ShutdownSignal {
    pub fn new(name: impl Into<String>) -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            name: name.into(),
            tx,
        }
    }

    /// A receiver for the loop being stopped
    pub fn token(&self) -> StopToken {
        StopToken {
            rx: self.tx.subscribe(),
        }
    }

    /// Ask the loop to stop after its current cycle
    pub fn request(&self) {
        if !*self.tx.borrow() {
            info!("Stop requested: {}", self.name);
        }
        self.tx.send_replace(true);
    }

    pub fn is_requested(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Receiver side, held by a loop
#[derive(Debug, Clone)]
pub struct StopToken {
    rx: watch::Receiver<bool>,
}

impl StopToken {
    pub fn is_requested(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once a stop has been requested
    pub async fn wait(&mut self) {
        // An error means the sender is gone; treat that as a stop as well.
        let _ = self.rx.wait_for(|stop| *stop).await;
    }

    /// Sleep for `duration` unless stopped first. Returns `true` if stopped.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.wait() => return true,
        }
        self.is_requested()
    }
}
