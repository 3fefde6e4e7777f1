use chrono::{DateTime, Utc};
use log::{debug, info};
use parking_lot::Mutex;
use scan_common::{Anomaly, DiscoveredDevice};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::IpAddr;

const MAX_PORTS_PER_IDENTITY: usize = 64;

/// Last thing we saw for one identity.
struct Observation {
    name: String,
    ip_address: IpAddr,
    mac_address: Option<String>,
    ports: BTreeSet<u16>,
    observed_at: DateTime<Utc>,
}

/// Compares each admitted advertisement against the previous observation of
/// the same identity (the MAC when one resolved, the device key otherwise).
pub struct AnomalyDetector {
    expected_ports: HashSet<u16>,
    observations: Mutex<HashMap<String, Observation>>,
    max_tracked: usize,
}

impl AnomalyDetector {
    pub fn new(expected_ports: &[u16], max_tracked: usize) -> Self {
        Self {
            expected_ports: expected_ports.iter().copied().collect(),
            observations: Mutex::new(HashMap::new()),
            max_tracked: max_tracked.max(1),
        }
    }

    /// Returns the anomalies `candidate` shows relative to the last observation,
    /// then records `candidate` as the new last observation.
    pub fn inspect(&self, candidate: &DiscoveredDevice) -> Vec<Anomaly> {
        let identity = candidate.identity().to_string();
        let mut observations = self.observations.lock();

        let anomalies = match observations.get(&identity) {
            Some(prior) => self.compare(prior, candidate),
            None => Vec::new(),
        };

        if !observations.contains_key(&identity) && observations.len() >= self.max_tracked {
            Self::evict_stalest(&mut observations);
        }
        let entry = observations.entry(identity).or_insert_with(|| Observation {
            name: candidate.name.clone(),
            ip_address: candidate.ip_address,
            mac_address: candidate.mac_address.clone(),
            ports: BTreeSet::new(),
            observed_at: candidate.last_seen,
        });
        if !candidate.name.is_empty() {
            entry.name = candidate.name.clone();
        }
        entry.ip_address = candidate.ip_address;
        entry.mac_address = candidate.mac_address.clone();
        entry.observed_at = candidate.last_seen;
        for port in &candidate.ports {
            if entry.ports.len() >= MAX_PORTS_PER_IDENTITY {
                break;
            }
            entry.ports.insert(*port);
        }

        if !anomalies.is_empty() {
            info!("Anomalies for {}: {:?}", candidate.key, anomalies);
        }
        anomalies
    }

    fn compare(&self, prior: &Observation, candidate: &DiscoveredDevice) -> Vec<Anomaly> {
        let mut anomalies = Vec::new();

        if !prior.name.is_empty()
            && !candidate.name.is_empty()
            && !prior.name.eq_ignore_ascii_case(&candidate.name)
        {
            anomalies.push(Anomaly::NameChanged {
                previous: prior.name.clone(),
                current: candidate.name.clone(),
            });
        }

        let same_mac = matches!(
            (&prior.mac_address, &candidate.mac_address),
            (Some(a), Some(b)) if a == b
        );
        if same_mac && prior.ip_address != candidate.ip_address {
            anomalies.push(Anomaly::IpHopping {
                previous: prior.ip_address,
                current: candidate.ip_address,
            });
        }

        for port in &candidate.ports {
            if !prior.ports.contains(port) && !self.expected_ports.contains(port) {
                anomalies.push(Anomaly::UnexpectedPort { port: *port });
            }
        }
        anomalies
    }

    fn evict_stalest(observations: &mut HashMap<String, Observation>) {
        let stalest = observations
            .iter()
            .min_by(|(ka, a), (kb, b)| a.observed_at.cmp(&b.observed_at).then_with(|| ka.cmp(kb)))
            .map(|(k, _)| k.clone());
        if let Some(key) = stalest {
            debug!("Anomaly tracker full, forgetting {}", key);
            observations.remove(&key);
        }
    }

    pub fn tracked(&self) -> usize {
        self.observations.lock().len()
    }
}
