use chrono::{DateTime, Utc};
use log::{debug, error, info};
use parking_lot::Mutex;
use scan_common::{ConfidenceAssessment, DeviceStatus, DiscoveredDevice, DiscoveryError, Result, ThreatLevel};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};

/// A device together with its cached assessment.
#[derive(Debug, Clone, Serialize)]
pub struct RegisteredDevice {
    pub device: DiscoveredDevice,
    pub assessment: ConfidenceAssessment,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum DeviceChange {
    Added(RegisteredDevice),
    Updated(RegisteredDevice),
    /// The registry was full: `evicted` made room for `added`.
    EvictedAndAdded {
        evicted: RegisteredDevice,
        added: RegisteredDevice,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryDelta {
    /// Increases by one for every delta a registry emits.
    pub revision: u64,
    pub change: DeviceChange,
}

impl RegistryDelta {
    /// The entry that was added or updated.
    pub fn current(&self) -> &RegisteredDevice {
        match &self.change {
            DeviceChange::Added(entry) | DeviceChange::Updated(entry) => entry,
            DeviceChange::EvictedAndAdded { added, .. } => added,
        }
    }

    pub fn evicted(&self) -> Option<&RegisteredDevice> {
        match &self.change {
            DeviceChange::EvictedAndAdded { evicted, .. } => Some(evicted),
            _ => None,
        }
    }
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, RegisteredDevice>,
    /// Eviction order: oldest first-seen first, ties by key.
    order: BTreeSet<(DateTime<Utc>, String)>,
    revision: u64,
}

impl Inner {
    fn next_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    fn take(&mut self, key: &str) -> Option<RegisteredDevice> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&(entry.device.first_seen, key.to_string()));
        Some(entry)
    }

    fn put(&mut self, entry: RegisteredDevice) {
        self.order.insert((entry.device.first_seen, entry.device.key.clone()));
        self.entries.insert(entry.device.key.clone(), entry);
    }
}

/// Bounded, de-duplicated store of the devices seen in one scan session.
///
/// Every admission decision (bound check, eviction, insert) runs under a
/// single lock, so concurrent upserts can never overshoot the capacity.
pub struct DeviceRegistry {
    capacity: usize,
    max_ports: usize,
    inner: Mutex<Inner>,
}

impl DeviceRegistry {
    pub fn new(capacity: usize, max_ports: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            max_ports: max_ports.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Inserts or merges `device`. The assessment must already reflect the
    /// merged device.
    pub fn upsert(&self, device: DiscoveredDevice, assessment: ConfidenceAssessment) -> Result<RegistryDelta> {
        let mut inner = self.inner.lock();

        if let Some(existing) = inner.take(&device.key) {
            let merged = self.merge(existing.device, device);
            let entry = RegisteredDevice { device: merged, assessment };
            inner.put(entry.clone());
            let revision = inner.next_revision();
            debug!("Updated device {} (score {})", entry.device.key, entry.assessment.score);
            self.check_invariants(&inner)?;
            return Ok(RegistryDelta { revision, change: DeviceChange::Updated(entry) });
        }

        let evicted = if inner.entries.len() >= self.capacity {
            let oldest = inner.order.iter().next().map(|(_, key)| key.clone()).ok_or_else(|| {
                DiscoveryError::RegistryInvariant("registry is full but has no eviction candidate".to_string())
            })?;
            let evicted = inner.take(&oldest).ok_or_else(|| {
                DiscoveryError::RegistryInvariant(format!("eviction candidate {} has no entry", oldest))
            })?;
            info!("Registry full ({}), evicting {}", self.capacity, evicted.device.key);
            Some(evicted)
        } else {
            None
        };

        let mut device = device;
        device.ports = bounded_ports(device.ports, self.max_ports);
        let added = RegisteredDevice { device, assessment };
        inner.put(added.clone());
        let revision = inner.next_revision();
        self.check_invariants(&inner)?;

        let change = match evicted {
            Some(evicted) => DeviceChange::EvictedAndAdded { evicted, added },
            None => DeviceChange::Added(added),
        };
        Ok(RegistryDelta { revision, change })
    }

    fn merge(&self, existing: DiscoveredDevice, update: DiscoveredDevice) -> DiscoveredDevice {
        let mut ports = existing.ports;
        ports.extend(update.ports);
        DiscoveredDevice {
            first_seen: existing.first_seen,
            last_seen: existing.last_seen.max(update.last_seen),
            ports: bounded_ports(ports, self.max_ports),
            status: DeviceStatus::Online,
            ..update
        }
    }

    fn check_invariants(&self, inner: &Inner) -> Result<()> {
        if inner.entries.len() > self.capacity || inner.entries.len() != inner.order.len() {
            error!(
                "Registry invariant violated: {} entries, {} ordered, capacity {}",
                inner.entries.len(),
                inner.order.len(),
                self.capacity
            );
            return Err(DiscoveryError::RegistryInvariant(format!(
                "{} entries with capacity {}",
                inner.entries.len(),
                self.capacity
            )));
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<RegisteredDevice> {
        self.inner.lock().entries.get(key).cloned()
    }

    /// Owned snapshot in eviction order; changing it does not touch the registry.
    pub fn all(&self) -> Vec<RegisteredDevice> {
        let inner = self.inner.lock();
        inner
            .order
            .iter()
            .filter_map(|(_, key)| inner.entries.get(key).cloned())
            .collect()
    }

    pub fn remove(&self, key: &str) -> Option<RegisteredDevice> {
        let mut inner = self.inner.lock();
        let removed = inner.take(key);
        if removed.is_some() {
            inner.next_revision();
        }
        removed
    }

    /// Removes every entry, returning how many there were.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let count = inner.entries.len();
        inner.entries.clear();
        inner.order.clear();
        inner.next_revision();
        count
    }

    pub fn mark_all_offline(&self) {
        let mut inner = self.inner.lock();
        for entry in inner.entries.values_mut() {
            entry.device.status = DeviceStatus::Offline;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries whose threat level is above `None`.
    pub fn threat_count(&self) -> usize {
        self.inner
            .lock()
            .entries
            .values()
            .filter(|e| e.assessment.threat != ThreatLevel::None)
            .count()
    }

    pub fn revision(&self) -> u64 {
        self.inner.lock().revision
    }
}

fn bounded_ports(mut ports: Vec<u16>, max_ports: usize) -> Vec<u16> {
    ports.sort_unstable();
    ports.dedup();
    ports.truncate(max_ports);
    ports
}
