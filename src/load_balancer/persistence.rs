use std::{collections::HashMap, sync::Mutex};

use serde::{Deserialize, Serialize};

use super::Bundler;

/// Stores the state of channel bundlers, keyed by the hashed identity of the channel.
/// Stores are fire-and-forget: failures are the implementation's to log.
pub trait LoadBalancerPersistence: Send + Sync {
    fn store_bundler(&self, channel_identity: &str, bundler: &dyn Bundler, algorithm: &str);
}

/// Discards every store.
#[derive(Debug, Default)]
pub struct NoopPersistence;

impl LoadBalancerPersistence for NoopPersistence {
    fn store_bundler(&self, _channel_identity: &str, _bundler: &dyn Bundler, _algorithm: &str) {}
}

/// What is kept for a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundlerSnapshot {
    pub algorithm: String,
    pub bundle_size: usize,
    pub timestamp: u64,
    /// How many times the channel stored its state.
    pub stores: usize,
}

/// Keeps the last snapshot of every channel in memory.
#[derive(Debug, Default)]
pub struct InMemoryPersistence {
    snapshots: Mutex<HashMap<String, BundlerSnapshot>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self, channel_identity: &str) -> Option<BundlerSnapshot> {
        self.snapshots
            .lock()
            .unwrap()
            .get(channel_identity)
            .cloned()
    }

    /// The identities with a stored snapshot.
    pub fn identities(&self) -> Vec<String> {
        self.snapshots.lock().unwrap().keys().cloned().collect()
    }
}

impl LoadBalancerPersistence for InMemoryPersistence {
    fn store_bundler(&self, channel_identity: &str, bundler: &dyn Bundler, algorithm: &str) {
        let mut snapshots = self.snapshots.lock().unwrap();
        let stores = snapshots
            .get(channel_identity)
            .map_or(0, |snapshot| snapshot.stores);
        snapshots.insert(
            channel_identity.to_string(),
            BundlerSnapshot {
                algorithm: algorithm.to_string(),
                bundle_size: bundler.bundle_size(),
                timestamp: bundler.timestamp(),
                stores: stores + 1,
            },
        );
    }
}
