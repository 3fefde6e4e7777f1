//! Boundary to the history collaborator.
//!
//! The coordinator never waits on history: records are pushed onto an
//! unbounded channel and a background task hands them to the store.

use chrono::{DateTime, Duration, Utc};
use log::{debug, error, warn};
use parking_lot::RwLock;
use scan_common::{ConfidenceAssessment, DiscoveredDevice, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub device: DiscoveredDevice,
    pub assessment: ConfidenceAssessment,
    pub timestamp: DateTime<Utc>,
}

pub trait HistoryStore: Send + Sync {
    fn put(&self, record: HistoryRecord) -> Result<()>;

    fn get(&self, key: &str) -> Option<HistoryRecord>;

    /// Drops records older than `older_than`, returning how many were removed.
    fn prune(&self, older_than: Duration) -> usize;
}

/// Latest record per device key, kept in memory.
#[derive(Default)]
pub struct InMemoryHistory {
    records: RwLock<HashMap<String, HistoryRecord>>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl HistoryStore for InMemoryHistory {
    fn put(&self, record: HistoryRecord) -> Result<()> {
        self.records.write().insert(record.device.key.clone(), record);
        Ok(())
    }

    fn get(&self, key: &str) -> Option<HistoryRecord> {
        self.records.read().get(key).cloned()
    }

    fn prune(&self, older_than: Duration) -> usize {
        let cutoff = Utc::now() - older_than;
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|_, record| record.timestamp >= cutoff);
        before - records.len()
    }
}

/// Non-blocking handle the coordinator writes history through.
#[derive(Clone)]
pub struct HistorySink {
    tx: mpsc::UnboundedSender<HistoryRecord>,
}

impl HistorySink {
    pub fn submit(&self, record: HistoryRecord) {
        if let Err(e) = self.tx.send(record) {
            warn!("History writer is gone, dropping record for {}", e.0.device.key);
        }
    }
}

/// Spawns the background writer. It exits once every sink clone is dropped.
pub fn spawn_history_writer(store: Arc<dyn HistoryStore>) -> (HistorySink, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<HistoryRecord>();
    let handle = tokio::spawn(async move {
        while let Some(record) = rx.recv().await {
            let key = record.device.key.clone();
            match store.put(record) {
                Ok(()) => debug!("Persisted history for {}", key),
                Err(e) => error!("Failed to persist history for {}: {}", key, e),
            }
        }
        debug!("History writer stopped");
    });
    (HistorySink { tx }, handle)
}
