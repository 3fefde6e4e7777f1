use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::IpAddr;

/// Raw service advertisement as yielded by the platform discovery source.
///
/// Every field is attacker-controllable and must go through the validator
/// before anything else looks at it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdvertisementRecord {
    pub instance_name: String,
    pub host: String,
    pub port: u32,
    pub service_type: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "service", rename_all = "snake_case")]
pub enum ServiceType {
    HomeAutomation(String),
    GenericNetwork(String),
    Unknown(String),
}

impl ServiceType {
    pub fn raw(&self) -> &str {
        match self {
            ServiceType::HomeAutomation(s)
            | ServiceType::GenericNetwork(s)
            | ServiceType::Unknown(s) => s,
        }
    }

    pub fn is_home_automation(&self) -> bool {
        matches!(self, ServiceType::HomeAutomation(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Online,
    Offline,
}

/// A behavioural change relative to the previous observation of the same device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Anomaly {
    NameChanged { previous: String, current: String },
    IpHopping { previous: IpAddr, current: IpAddr },
    UnexpectedPort { port: u16 },
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Anomaly::NameChanged { previous, current } => {
                write!(f, "name changed from '{}' to '{}'", previous, current)
            }
            Anomaly::IpHopping { previous, current } => {
                write!(f, "IP address changed from {} to {} with the same MAC", previous, current)
            }
            Anomaly::UnexpectedPort { port } => {
                write!(f, "newly advertised port {} is not expected", port)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    pub key: String,
    pub name: String,
    pub ip_address: IpAddr,
    pub mac_address: Option<String>,
    pub service_type: ServiceType,
    pub metadata: BTreeMap<String, String>,
    /// Sorted, de-duplicated.
    pub ports: Vec<u16>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub status: DeviceStatus,
    #[serde(default)]
    pub anomalies: Vec<Anomaly>,
}

impl DiscoveredDevice {
    /// Registry key: the instance name plus the MAC when it resolved, the IP otherwise.
    pub fn derive_key(name: &str, mac_address: Option<&str>, ip_address: &IpAddr) -> String {
        match mac_address {
            Some(mac) => format!("{}@{}", name.to_lowercase(), mac),
            None => format!("{}@{}", name.to_lowercase(), ip_address),
        }
    }

    /// Identity used to correlate observations across address changes.
    pub fn identity(&self) -> &str {
        self.mac_address.as_deref().unwrap_or(&self.key)
    }

    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.get(&key.to_ascii_lowercase()).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatLevel {
    None,
    Low,
    High,
}

impl ThreatLevel {
    pub fn classify(score: u8, unpaired: bool) -> Self {
        match score {
            s if s >= 70 && unpaired => ThreatLevel::High,
            s if s >= 40 => ThreatLevel::Low,
            _ => ThreatLevel::None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatLevel::None => "none",
            ThreatLevel::Low => "low",
            ThreatLevel::High => "high",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfidenceAssessment {
    pub score: u8,
    pub reasons: Vec<String>,
    pub threat: ThreatLevel,
    /// Whether the device advertised an unpaired/setup-required flag.
    pub unpaired: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    Idle,
    Scanning,
    Paused,
    Completed,
    Cancelled,
}

impl ScanState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ScanState::Completed | ScanState::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ScanState::Idle => "idle",
            ScanState::Scanning => "scanning",
            ScanState::Paused => "paused",
            ScanState::Completed => "completed",
            ScanState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threat_classification() {
        assert_eq!(ThreatLevel::classify(100, true), ThreatLevel::High);
        assert_eq!(ThreatLevel::classify(70, true), ThreatLevel::High);
        assert_eq!(ThreatLevel::classify(95, false), ThreatLevel::Low);
        assert_eq!(ThreatLevel::classify(69, true), ThreatLevel::Low);
        assert_eq!(ThreatLevel::classify(40, false), ThreatLevel::Low);
        assert_eq!(ThreatLevel::classify(39, true), ThreatLevel::None);
    }

    #[test]
    fn test_device_key_prefers_mac() {
        let ip: IpAddr = "10.0.0.2".parse().unwrap();
        assert_eq!(
            DiscoveredDevice::derive_key("Hue Bridge", Some("00:17:88:01:02:03"), &ip),
            "hue bridge@00:17:88:01:02:03"
        );
        assert_eq!(DiscoveredDevice::derive_key("Hue Bridge", None, &ip), "hue bridge@10.0.0.2");
    }

    #[test]
    fn test_anomaly_serialization() {
        let anomaly = Anomaly::UnexpectedPort { port: 4444 };
        let json = serde_json::to_string(&anomaly).unwrap();
        assert_eq!(json, r#"{"kind":"unexpected_port","port":4444}"#);
    }
}
