//! Confidence scoring for discovered devices
//!
//! Estimates how likely a device is an unpaired smart-home accessory worth
//! flagging. The score is a weighted, additive sum over the advertised
//! metadata, clamped to 0..=100, and every contributing rule appends a reason
//! in evaluation order so identical inputs always explain themselves the same
//! way.

use scan_common::{Anomaly, ConfidenceAssessment, DiscoveredDevice, ScoringPolicy, ThreatLevel};

/// Longest DNS-SD instance label, in bytes.
const MAX_INSTANCE_LABEL: usize = 63;

/// Stateless apart from the injected policy; safe to share across threads.
#[derive(Debug, Clone)]
pub struct ConfidenceScorer {
    policy: ScoringPolicy,
}

impl ConfidenceScorer {
    /// Creates a scorer over the given weights and allow-lists
    pub fn new(policy: ScoringPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ScoringPolicy {
        &self.policy
    }

    /// Scores `device`, carrying forward anomaly signals already attached to
    /// `prior` (the registry's previous state for the same key).
    ///
    /// # Returns
    /// The clamped score, ordered reasons, and the derived threat level
    pub fn score(&self, device: &DiscoveredDevice, prior: Option<&DiscoveredDevice>) -> ConfidenceAssessment {
        let weights = &self.policy.weights;
        let mut total: i32 = 0;
        let mut reasons = Vec::new();

        if device.service_type.is_home_automation() {
            total = total.saturating_add(weights.smart_home_service);
            reasons.push(format!("advertises smart-home service {}", device.service_type.raw()));
        }

        let unpaired = self.unpaired_flag(device);
        if let Some((key, value)) = &unpaired {
            total = total.saturating_add(weights.unpaired);
            reasons.push(format!("advertises unpaired state ({}={})", key, value));
        }

        if let Some(reason) = self.vendor_match(device) {
            total = total.saturating_add(weights.vendor);
            reasons.push(reason);
        }

        if let Some(port) = device
            .ports
            .iter()
            .find(|p| self.policy.accessory_ports.contains(p))
        {
            total = total.saturating_add(weights.accessory_port);
            reasons.push(format!("exposes accessory service port {}", port));
        }

        let anomalies = effective_anomalies(device, prior);
        if !anomalies.is_empty() {
            let count = i32::try_from(anomalies.len()).unwrap_or(i32::MAX);
            let contribution = weights.per_anomaly.saturating_mul(count).min(weights.anomaly_cap);
            total = total.saturating_add(contribution);
            reasons.extend(anomalies.iter().map(|a| format!("anomaly: {}", a)));
        }

        if !is_well_formed_name(&device.name) {
            total = total.saturating_add(weights.malformed_name);
            reasons.push("missing or malformed advertised name".to_string());
        }

        let score = total.clamp(0, 100) as u8;
        let unpaired = unpaired.is_some();
        ConfidenceAssessment {
            score,
            reasons,
            threat: ThreatLevel::classify(score, unpaired),
            unpaired,
        }
    }

    fn unpaired_flag(&self, device: &DiscoveredDevice) -> Option<(String, String)> {
        self.policy.unpaired_flags.iter().find_map(|flag| {
            let value = device.metadata_value(&flag.key)?.trim();
            flag.values
                .iter()
                .any(|v| v.eq_ignore_ascii_case(value))
                .then(|| (flag.key.to_ascii_lowercase(), value.to_string()))
        })
    }

    fn vendor_match(&self, device: &DiscoveredDevice) -> Option<String> {
        for key in &self.policy.vendor_keys {
            let Some(value) = device.metadata_value(key) else {
                continue;
            };
            let lowered = value.to_lowercase();
            if let Some(pattern) = self
                .policy
                .vendor_patterns
                .iter()
                .find(|p| !p.is_empty() && lowered.contains(&p.to_lowercase()))
            {
                return Some(format!(
                    "manufacturer metadata matches known vendor '{}' ({}={})",
                    pattern,
                    key.to_ascii_lowercase(),
                    value
                ));
            }
        }

        let mac = device.mac_address.as_deref()?;
        self.policy
            .vendor_ouis
            .iter()
            .find(|oui| oui.len() == 8 && mac.get(..8).map_or(false, |prefix| prefix.eq_ignore_ascii_case(oui)))
            .map(|oui| format!("MAC prefix {} belongs to a known smart-home vendor", oui.to_ascii_uppercase()))
    }
}

/// Anomalies attached to `device` plus those already carried by `prior`,
/// de-duplicated with the prior ones first.
pub fn effective_anomalies(device: &DiscoveredDevice, prior: Option<&DiscoveredDevice>) -> Vec<Anomaly> {
    let mut merged: Vec<Anomaly> = Vec::new();
    let carried = prior.map(|p| p.anomalies.as_slice()).unwrap_or_default();
    for anomaly in carried.iter().chain(device.anomalies.iter()) {
        if !merged.contains(anomaly) {
            merged.push(anomaly.clone());
        }
    }
    merged
}

fn is_well_formed_name(name: &str) -> bool {
    !name.trim().is_empty()
        && name.len() <= MAX_INSTANCE_LABEL
        && name.chars().any(char::is_alphanumeric)
}
