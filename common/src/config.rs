use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use crate::error::{DiscoveryError, Result};

/// One week.
pub const MAX_RATE_WINDOW_SECS: u64 = 7 * 24 * 60 * 60;

/// Everything a scan session needs, injected at `start`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub network_range: Option<NetworkRange>,
    pub mode: ScanMode,
    /// Registry capacity.
    pub max_devices: usize,
    pub rate_limit: RateLimitConfig,
    pub limits: InputLimits,
    pub policy: ScoringPolicy,
    pub pause_policy: PausePolicy,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            network_range: None,
            mode: ScanMode::Quick,
            max_devices: 500,
            rate_limit: RateLimitConfig::default(),
            limits: InputLimits::default(),
            policy: ScoringPolicy::default(),
            pause_policy: PausePolicy::Drop,
        }
    }
}

impl ScanConfig {
    /// Loads a JSON config file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let data = std::fs::read_to_string(path)
                    .map_err(|e| DiscoveryError::ConfigError(format!("{}: {}", path.display(), e)))?;
                serde_json::from_str(&data)?
            }
            None => Self::default(),
        };
        let config = config.with_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Some(value) = env_var("SCAN_MAX_DEVICES")? {
            self.max_devices = value;
        }
        if let Some(value) = env_var("SCAN_RATE_THRESHOLD")? {
            self.rate_limit.threshold = value;
        }
        if let Some(value) = env_var("SCAN_RATE_WINDOW_SECS")? {
            self.rate_limit.window_secs = value;
        }
        if let Ok(range) = std::env::var("SCAN_NETWORK_RANGE") {
            self.network_range = Some(range.parse()?);
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_devices == 0 {
            return Err(DiscoveryError::ConfigError("max_devices must be at least 1".to_string()));
        }
        if self.rate_limit.threshold == 0 || self.rate_limit.window_secs == 0 {
            return Err(DiscoveryError::ConfigError(
                "rate limit threshold and window must be non-zero".to_string(),
            ));
        }
        if self.rate_limit.window_secs > MAX_RATE_WINDOW_SECS {
            return Err(DiscoveryError::ConfigError(format!(
                "rate limit window of {}s exceeds the {}s maximum",
                self.rate_limit.window_secs, MAX_RATE_WINDOW_SECS
            )));
        }
        if self.limits.max_metadata_pairs == 0 || self.limits.max_ports == 0 {
            return Err(DiscoveryError::ConfigError(
                "metadata and port limits must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_var<T: FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| DiscoveryError::ConfigError(format!("{} has an invalid value '{}'", name, raw))),
        Err(_) => Ok(None),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    Quick,
    Full,
    Custom { duration_secs: u64 },
}

impl ScanMode {
    pub fn duration(&self) -> Duration {
        match self {
            ScanMode::Quick => Duration::from_secs(30),
            ScanMode::Full => Duration::from_secs(300),
            ScanMode::Custom { duration_secs } => Duration::from_secs(*duration_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateKeyScope {
    Host,
    Device,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub window_secs: u64,
    pub threshold: usize,
    pub scope: RateKeyScope,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            threshold: 100,
            scope: RateKeyScope::Host,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InputLimits {
    pub max_name_len: usize,
    pub max_metadata_pairs: usize,
    pub max_metadata_key_len: usize,
    pub max_metadata_value_len: usize,
    pub max_ports: usize,
    /// Metadata keys that may carry the device MAC, in lookup order.
    pub mac_keys: Vec<String>,
}

impl Default for InputLimits {
    fn default() -> Self {
        Self {
            max_name_len: 255,
            max_metadata_pairs: 50,
            max_metadata_key_len: 64,
            max_metadata_value_len: 1024,
            max_ports: 32,
            mac_keys: strings(&["mac", "id", "deviceid"]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PausePolicy {
    /// Events seen while paused are discarded.
    Drop,
    /// Events seen while paused are held (up to `capacity`) and replayed on resume.
    Buffer { capacity: usize },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub smart_home_service: i32,
    pub unpaired: i32,
    pub vendor: i32,
    pub accessory_port: i32,
    pub per_anomaly: i32,
    pub anomaly_cap: i32,
    pub malformed_name: i32,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            smart_home_service: 40,
            unpaired: 30,
            vendor: 15,
            accessory_port: 10,
            per_anomaly: 5,
            anomaly_cap: 15,
            malformed_name: -10,
        }
    }
}

/// A metadata key whose value, when it is one of `values`, marks the device unpaired.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnpairedFlag {
    pub key: String,
    pub values: Vec<String>,
}

/// Policy data consumed by the validator, the anomaly detector and the scorer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringPolicy {
    pub weights: ScoringWeights,
    pub smart_home_services: Vec<String>,
    pub generic_services: Vec<String>,
    pub unpaired_flags: Vec<UnpairedFlag>,
    pub vendor_keys: Vec<String>,
    pub vendor_patterns: Vec<String>,
    /// `AA:BB:CC` organisational prefixes.
    pub vendor_ouis: Vec<String>,
    pub accessory_ports: Vec<u16>,
    /// Ports that never raise an unexpected-port anomaly.
    pub expected_ports: Vec<u16>,
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self {
            weights: ScoringWeights::default(),
            smart_home_services: strings(&[
                "_hap._tcp",
                "_hap._udp",
                "_matter._tcp",
                "_matterc._udp",
                "_homekit._tcp",
                "_hue._tcp",
                "_ewelink._tcp",
            ]),
            generic_services: strings(&[
                "_http._tcp",
                "_https._tcp",
                "_ssh._tcp",
                "_workstation._tcp",
                "_ipp._tcp",
                "_printer._tcp",
                "_airplay._tcp",
                "_raop._tcp",
                "_googlecast._tcp",
                "_smb._tcp",
            ]),
            unpaired_flags: vec![
                UnpairedFlag { key: "sf".to_string(), values: strings(&["1"]) },
                UnpairedFlag { key: "cm".to_string(), values: strings(&["1", "2"]) },
                UnpairedFlag { key: "setup".to_string(), values: strings(&["1", "true", "yes"]) },
                UnpairedFlag { key: "paired".to_string(), values: strings(&["0", "false", "no"]) },
            ],
            vendor_keys: strings(&["md", "manufacturer", "vendor", "mf", "vp"]),
            vendor_patterns: strings(&[
                "philips", "signify", "hue", "ecobee", "eve", "nanoleaf", "aqara", "lutron",
                "meross", "wemo", "tp-link", "kasa", "lifx", "sonoff", "tuya", "yeelight",
            ]),
            vendor_ouis: strings(&[
                "00:17:88", "EC:B5:FA", "D0:73:D5", "44:61:32", "54:EF:44", "B0:CE:18",
                "68:57:2D", "D8:F1:5B", "50:02:91", "7C:49:EB",
            ]),
            accessory_ports: vec![5540, 51826, 6668, 8883, 55443],
            expected_ports: vec![80, 443, 5353, 5540, 8080, 8443, 51826],
        }
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// CIDR block, e.g. `192.168.1.0/24` or `fd00::/8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NetworkRange(IpNet);

impl NetworkRange {
    pub fn contains(&self, addr: &IpAddr) -> bool {
        self.0.contains(addr)
    }
}

impl FromStr for NetworkRange {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .parse::<IpNet>()
            .map(NetworkRange)
            .map_err(|e| DiscoveryError::ConfigError(format!("invalid network range '{}': {}", s, e)))
    }
}

impl TryFrom<String> for NetworkRange {
    type Error = DiscoveryError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<NetworkRange> for String {
    fn from(range: NetworkRange) -> Self {
        range.to_string()
    }
}

impl fmt::Display for NetworkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_range_contains() {
        let range: NetworkRange = "192.168.1.0/24".parse().unwrap();
        assert!(range.contains(&"192.168.1.5".parse().unwrap()));
        assert!(!range.contains(&"192.168.2.5".parse().unwrap()));
        assert!(!range.contains(&"fe80::1".parse().unwrap()));

        let v6: NetworkRange = "fd00::/8".parse().unwrap();
        assert!(v6.contains(&"fd12:3456::1".parse().unwrap()));

        let everything: NetworkRange = "0.0.0.0/0".parse().unwrap();
        assert!(everything.contains(&"8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn test_network_range_rejects_bad_prefix() {
        assert!("10.0.0.0/33".parse::<NetworkRange>().is_err());
        assert!("10.0.0.0".parse::<NetworkRange>().is_err());
        assert!("nonsense/8".parse::<NetworkRange>().is_err());
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let json = r#"{"max_devices": 3, "mode": {"custom": {"duration_secs": 5}}, "network_range": "10.0.0.0/8"}"#;
        let config: ScanConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.max_devices, 3);
        assert_eq!(config.mode.duration(), Duration::from_secs(5));
        assert_eq!(config.rate_limit.threshold, 100);
        assert_eq!(config.network_range.unwrap().to_string(), "10.0.0.0/8");
    }

    #[test]
    fn test_validate_rejects_oversized_rate_window() {
        let mut config = ScanConfig::default();
        config.rate_limit.window_secs = 10_000_000_000_000_000;
        assert!(matches!(config.validate(), Err(DiscoveryError::ConfigError(_))));

        config.rate_limit.window_secs = MAX_RATE_WINDOW_SECS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let config = ScanConfig { max_devices: 0, ..Default::default() };
        assert!(config.validate().is_err());
    }
}
