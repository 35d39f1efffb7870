//! Single-writer / many-reader configuration snapshots.
//!
//! The reloader is the only writer. Readers capture one `Arc` snapshot at the
//! start of an operation and use it throughout, so an in-flight call never
//! observes a half-applied reload.

use std::sync::Arc;

use tokio::sync::watch;

use crate::model::NormalizedConfig;

#[derive(Clone)]
pub struct ConfigHandle {
    rx: watch::Receiver<Arc<NormalizedConfig>>,
}

impl ConfigHandle {
    /// The current snapshot. Callers hold onto the returned `Arc` for the
    /// duration of one logical operation.
    pub fn snapshot(&self) -> Arc<NormalizedConfig> {
        self.rx.borrow().clone()
    }

    /// Resolves when a new snapshot has been published.
    pub async fn changed(&mut self) -> Result<(), watch::error::RecvError> {
        self.rx.changed().await
    }
}

pub struct ConfigPublisher {
    tx: watch::Sender<Arc<NormalizedConfig>>,
}

impl ConfigPublisher {
    /// Publish a new snapshot; readers pick it up on their next operation.
    pub fn publish(&self, config: NormalizedConfig) {
        let _ = self.tx.send(Arc::new(config));
    }

    pub fn subscribe(&self) -> ConfigHandle {
        ConfigHandle {
            rx: self.tx.subscribe(),
        }
    }
}

/// Build the single-writer channel seeded with the startup configuration.
pub fn config_channel(initial: NormalizedConfig) -> (ConfigPublisher, ConfigHandle) {
    let (tx, rx) = watch::channel(Arc::new(initial));
    (ConfigPublisher { tx }, ConfigHandle { rx })
}
