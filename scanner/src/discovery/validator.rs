//! Validation and sanitization of raw advertisement fields.
//!
//! Everything in an [`AdvertisementRecord`] comes straight off the network, so
//! each field is normalised here before any other component sees it. Low-risk
//! fields (the display name) are cleaned in place; high-risk fields (metadata
//! values) are dropped whole when they carry markup or injection sequences.

use mac_address::MacAddress;
use scan_common::{
    AdvertisementRecord, InputLimits, NetworkRange, ScanConfig, ScoringPolicy, ServiceType,
    ValidationRejection,
};
use std::collections::BTreeMap;
use std::net::IpAddr;

const SCRIPT_SCHEMES: [&str; 3] = ["javascript:", "vbscript:", "data:"];
const COMMENT_SEQUENCES: [&str; 3] = ["--", "/*", "*/"];
const QUERY_KEYWORDS: [&str; 8] = [
    " or ", " and ", "union select", "drop table", "insert into", "delete from", "exec ", "xp_",
];
const MAX_SANITIZE_PASSES: usize = 8;

/// An advertisement whose fields all passed validation.
#[derive(Debug, Clone)]
pub struct ValidatedAdvertisement {
    pub name: String,
    pub ip_address: IpAddr,
    pub mac_address: Option<String>,
    pub port: u16,
    pub service_type: ServiceType,
    pub metadata: BTreeMap<String, String>,
    /// Individual fields that were refused without failing the advertisement.
    pub dropped_fields: Vec<ValidationRejection>,
}

pub struct AdvertisementValidator {
    limits: InputLimits,
    network_range: Option<NetworkRange>,
    policy: ScoringPolicy,
}

impl AdvertisementValidator {
    pub fn new(config: &ScanConfig) -> Self {
        Self {
            limits: config.limits.clone(),
            network_range: config.network_range,
            policy: config.policy.clone(),
        }
    }

    pub fn validate(&self, record: &AdvertisementRecord) -> Result<ValidatedAdvertisement, ValidationRejection> {
        let ip_address = validate_ip(&record.host)?;
        if let Some(range) = &self.network_range {
            if !range.contains(&ip_address) {
                return Err(ValidationRejection::OutOfRange(ip_address.to_string()));
            }
        }
        let port = validate_port(record.port)?;
        let service_type = self.classify_service(&record.service_type)?;
        let name = sanitize_name(&record.instance_name, self.limits.max_name_len);
        let (metadata, dropped_fields) = sanitize_metadata(&record.metadata, &self.limits);
        let mac_address = self
            .limits
            .mac_keys
            .iter()
            .filter_map(|key| metadata.get(&key.to_ascii_lowercase()))
            .find_map(|value| parse_mac(value));

        Ok(ValidatedAdvertisement {
            name,
            ip_address,
            mac_address,
            port,
            service_type,
            metadata,
            dropped_fields,
        })
    }

    fn classify_service(&self, raw: &str) -> Result<ServiceType, ValidationRejection> {
        let service = normalize_service_type(raw)
            .ok_or_else(|| ValidationRejection::InvalidServiceType(truncate_chars(raw, 64)))?;
        let listed = |list: &[String]| list.iter().any(|s| s.eq_ignore_ascii_case(&service));
        Ok(if listed(&self.policy.smart_home_services) {
            ServiceType::HomeAutomation(service)
        } else if listed(&self.policy.generic_services) {
            ServiceType::GenericNetwork(service)
        } else {
            ServiceType::Unknown(service)
        })
    }
}

pub fn validate_ip(host: &str) -> Result<IpAddr, ValidationRejection> {
    let trimmed = host.trim();
    // IPv6 link-local addresses may carry a zone suffix, e.g. `fe80::1%en0`.
    let without_zone = match trimmed.split_once('%') {
        Some((addr, _zone)) if addr.contains(':') => addr,
        _ => trimmed,
    };
    without_zone
        .parse::<IpAddr>()
        .map_err(|_| ValidationRejection::InvalidIp(truncate_chars(host, 64)))
}

pub fn validate_port(port: u32) -> Result<u16, ValidationRejection> {
    match u16::try_from(port) {
        Ok(p) if p >= 1 => Ok(p),
        _ => Err(ValidationRejection::InvalidPort(port)),
    }
}

/// Parses `AA:BB:CC:DD:EE:FF` or `AA-BB-CC-DD-EE-FF` into canonical upper-case
/// colon form. Anything else is treated as an absent MAC.
pub fn parse_mac(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let bytes = raw.as_bytes();
    if bytes.len() != 17 {
        return None;
    }
    let separator = bytes[2];
    if separator != b':' && separator != b'-' {
        return None;
    }
    let mut octets = [0u8; 6];
    for (i, chunk) in raw.split(separator as char).enumerate() {
        if i >= 6 || chunk.len() != 2 || !chunk.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        octets[i] = u8::from_str_radix(chunk, 16).ok()?;
    }
    Some(MacAddress::new(octets).to_string())
}

/// `_name._tcp` / `_name._udp`, with an optional `.local.` suffix.
pub fn normalize_service_type(raw: &str) -> Option<String> {
    let lowered = raw.trim().to_ascii_lowercase();
    let mut service = lowered.trim_end_matches('.');
    service = service.strip_suffix(".local").unwrap_or(service);

    let (name, proto) = service.split_once('.')?;
    if proto != "_tcp" && proto != "_udp" {
        return None;
    }
    let label = name.strip_prefix('_')?;
    let valid_label = !label.is_empty()
        && label.len() <= 15
        && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
        && !label.starts_with('-')
        && !label.ends_with('-');
    valid_label.then(|| service.to_string())
}

/// Cleans a display name: control characters, markup, script schemes and query
/// injection sequences are removed, whitespace collapsed, and the result
/// truncated to `max_len` characters. An empty result is allowed.
pub fn sanitize_name(raw: &str, max_len: usize) -> String {
    let mut current: String = raw.chars().filter(|c| !c.is_control()).collect();
    for _ in 0..MAX_SANITIZE_PASSES {
        let mut next = strip_markup(&current);
        next = strip_schemes(&next);
        if looks_like_query_injection(&next) {
            next = strip_query_sequences(&next);
        }
        if next == current {
            break;
        }
        current = next;
    }
    // Anything still unsafe after the passes is dropped entirely.
    if contains_unsafe_content(&current) {
        return String::new();
    }
    let collapsed = current.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate_chars(&collapsed, max_len)
}

/// Sanitizes metadata pairs, returning the kept map plus per-pair rejections.
///
/// Keys are lower-cased (TXT keys are case-insensitive), pairs are visited in
/// key order so the kept subset is deterministic. Keys that collide once
/// lower-cased are all rejected.
pub fn sanitize_metadata<'a, I>(
    raw: I,
    limits: &InputLimits,
) -> (BTreeMap<String, String>, Vec<ValidationRejection>)
where
    I: IntoIterator<Item = (&'a String, &'a String)>,
{
    let mut rejected = Vec::new();
    let mut candidates: BTreeMap<String, Vec<&String>> = BTreeMap::new();

    for (key, value) in raw {
        match sanitize_metadata_key(key, limits.max_metadata_key_len) {
            Some(key) => candidates.entry(key).or_default().push(value),
            None => rejected.push(ValidationRejection::InvalidMetadataKey(truncate_chars(key, 32))),
        }
    }

    let mut kept = BTreeMap::new();
    for (key, values) in candidates {
        // Keys differing only in case have no defined winner, so none is kept.
        let [value] = values.as_slice() else {
            rejected.push(ValidationRejection::AmbiguousMetadataKey(key));
            continue;
        };
        if kept.len() >= limits.max_metadata_pairs {
            rejected.push(ValidationRejection::TooManyMetadataPairs(key));
            continue;
        }
        let value: String = value.chars().filter(|c| !c.is_control()).collect();
        let value = truncate_bytes(&value, limits.max_metadata_value_len);
        if contains_unsafe_content(&value) {
            rejected.push(ValidationRejection::UnsafeMetadataValue(key));
            continue;
        }
        kept.insert(key, value);
    }
    (kept, rejected)
}

fn sanitize_metadata_key(key: &str, max_len: usize) -> Option<String> {
    let valid = !key.is_empty()
        && key.len() <= max_len
        && key.bytes().all(|b| b.is_ascii_graphic() && b != b'=');
    valid.then(|| key.to_ascii_lowercase())
}

/// True when the text carries markup, a script scheme, or a query-injection pattern.
pub fn contains_unsafe_content(text: &str) -> bool {
    has_tag_sequence(text)
        || text.contains('>')
        || SCRIPT_SCHEMES.iter().any(|scheme| find_ascii_ci(text, scheme).is_some())
        || looks_like_query_injection(text)
}

fn has_tag_sequence(text: &str) -> bool {
    let bytes = text.as_bytes();
    bytes.iter().enumerate().any(|(i, &b)| {
        b == b'<'
            && bytes
                .get(i + 1)
                .map_or(false, |&n| n.is_ascii_alphabetic() || matches!(n, b'/' | b'!' | b'?'))
    })
}

fn looks_like_query_injection(text: &str) -> bool {
    let lowered = text.to_ascii_lowercase();
    let has_quote = lowered.contains(['\'', '"', '`']);
    let has_terminator = lowered.contains(';') || COMMENT_SEQUENCES.iter().any(|s| lowered.contains(s));
    let has_keyword = QUERY_KEYWORDS.iter().any(|k| lowered.contains(k));
    (has_quote && (has_terminator || has_keyword)) || (has_terminator && has_keyword)
}

fn strip_markup(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_tag = false;
    for c in text.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

fn strip_schemes(text: &str) -> String {
    let mut out = text.to_string();
    for scheme in SCRIPT_SCHEMES {
        while let Some(pos) = find_ascii_ci(&out, scheme) {
            out.replace_range(pos..pos + scheme.len(), "");
        }
    }
    out
}

fn strip_query_sequences(text: &str) -> String {
    let mut out: String = text.chars().filter(|c| !matches!(c, '\'' | '"' | '`' | ';')).collect();
    for seq in COMMENT_SEQUENCES {
        out = out.replace(seq, " ");
    }
    out
}

/// ASCII case-insensitive search; returned offsets are valid byte indices into `haystack`.
fn find_ascii_ci(haystack: &str, needle: &str) -> Option<usize> {
    haystack.to_ascii_lowercase().find(needle)
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

fn truncate_bytes(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn record(name: &str, host: &str, port: u32, service: &str) -> AdvertisementRecord {
        AdvertisementRecord {
            instance_name: name.to_string(),
            host: host.to_string(),
            port,
            service_type: service.to_string(),
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn test_ip_validation() {
        assert!(validate_ip("999.1.1.1").is_err());
        assert_eq!(validate_ip("192.168.1.5").unwrap().to_string(), "192.168.1.5");
        assert!(validate_ip("fe80::1%en0").unwrap().is_ipv6());
        assert!(validate_ip("hue-bridge.local").is_err());
        assert!(validate_ip("").is_err());
    }

    #[test]
    fn test_port_validation() {
        assert!(validate_port(0).is_err());
        assert!(validate_port(65536).is_err());
        assert_eq!(validate_port(1).unwrap(), 1);
        assert_eq!(validate_port(65535).unwrap(), 65535);
    }

    #[test]
    fn test_mac_parsing() {
        assert_eq!(parse_mac("ec:b5:fa:01:02:03").as_deref(), Some("EC:B5:FA:01:02:03"));
        assert_eq!(parse_mac("EC-B5-FA-01-02-03").as_deref(), Some("EC:B5:FA:01:02:03"));
        assert_eq!(parse_mac("EC:B5-FA:01:02:03"), None);
        assert_eq!(parse_mac("EC:B5:FA:01:02"), None);
        assert_eq!(parse_mac("ZZ:B5:FA:01:02:03"), None);
        assert_eq!(parse_mac("ecb5fa010203"), None);
        assert_eq!(parse_mac("+1:+2:+3:+4:+5:+6"), None);
        assert_eq!(parse_mac("-1:-2:-3:-4:-5:-6"), None);
    }

    #[test]
    fn test_service_type_normalization() {
        assert_eq!(normalize_service_type("_hap._tcp.local.").as_deref(), Some("_hap._tcp"));
        assert_eq!(normalize_service_type("_Matterc._UDP").as_deref(), Some("_matterc._udp"));
        assert_eq!(normalize_service_type("_hap._sctp"), None);
        assert_eq!(normalize_service_type("hap._tcp"), None);
        assert_eq!(normalize_service_type("_<script>._tcp"), None);
    }

    #[test]
    fn test_name_sanitization_strips_markup_and_schemes() {
        assert_eq!(sanitize_name("Lamp<script>alert(1)</script>", 255), "Lampalert(1)");
        assert_eq!(sanitize_name("javascript:Kitchen Plug", 255), "Kitchen Plug");
        assert_eq!(sanitize_name("javajavascript:script:x", 255), "x");
        assert_eq!(sanitize_name("Hall\u{0007}way\nSensor", 255), "HallwaySensor");
        assert_eq!(sanitize_name("Bob's Lamp", 255), "Bob's Lamp");
        assert_eq!(sanitize_name("x'; DROP TABLE devices; --", 255), "x DROP TABLE devices");
    }

    #[test]
    fn test_name_is_truncated() {
        let long = "a".repeat(400);
        assert_eq!(sanitize_name(&long, 255).chars().count(), 255);
        let wide = "é".repeat(300);
        assert_eq!(sanitize_name(&wide, 255).chars().count(), 255);
    }

    #[test]
    fn test_metadata_rejects_script_values() {
        let limits = InputLimits::default();
        let mut raw = HashMap::new();
        raw.insert("md".to_string(), "<script>steal()</script>".to_string());
        raw.insert("SF".to_string(), "1".to_string());
        let (kept, rejected) = sanitize_metadata(&raw, &limits);
        assert_eq!(kept.get("sf").map(String::as_str), Some("1"));
        assert!(!kept.contains_key("md"));
        assert!(kept.values().all(|v| !v.contains('<')));
        assert_eq!(rejected, vec![ValidationRejection::UnsafeMetadataValue("md".to_string())]);
    }

    #[test]
    fn test_metadata_case_collisions_are_rejected() {
        let limits = InputLimits::default();
        for _ in 0..200 {
            let mut raw = HashMap::new();
            raw.insert("SF".to_string(), "1".to_string());
            raw.insert("sf".to_string(), "0".to_string());
            for i in 0..5 {
                raw.insert(format!("k{}", i), "v".to_string());
            }
            let (kept, rejected) = sanitize_metadata(&raw, &limits);
            assert!(!kept.contains_key("sf"));
            assert_eq!(kept.len(), 5);
            assert_eq!(rejected, vec![ValidationRejection::AmbiguousMetadataKey("sf".to_string())]);
        }
    }

    #[test]
    fn test_metadata_bounds() {
        let limits = InputLimits::default();
        let mut raw = HashMap::new();
        for i in 0..60 {
            raw.insert(format!("k{:02}", i), "v".to_string());
        }
        raw.insert("big".to_string(), "x".repeat(5000));
        raw.insert("bad=key".to_string(), "v".to_string());
        let (kept, rejected) = sanitize_metadata(&raw, &limits);
        assert_eq!(kept.len(), 50);
        assert_eq!(kept.get("big").map(String::len), Some(1024));
        assert!(rejected.contains(&ValidationRejection::InvalidMetadataKey("bad=key".to_string())));
        assert_eq!(
            rejected.iter().filter(|r| matches!(r, ValidationRejection::TooManyMetadataPairs(_))).count(),
            11
        );
    }

    #[test]
    fn test_validator_classifies_and_extracts_mac() {
        let validator = AdvertisementValidator::new(&ScanConfig::default());
        let mut rec = record("Eve Door", "192.168.1.20", 51826, "_hap._tcp.local.");
        rec.metadata.insert("id".to_string(), "44-61-32-aa-bb-cc".to_string());
        let validated = validator.validate(&rec).unwrap();
        assert_eq!(validated.service_type, ServiceType::HomeAutomation("_hap._tcp".to_string()));
        assert_eq!(validated.mac_address.as_deref(), Some("44:61:32:AA:BB:CC"));
        assert_eq!(validated.port, 51826);

        let generic = validator.validate(&record("NAS", "192.168.1.21", 22, "_ssh._tcp")).unwrap();
        assert_eq!(generic.service_type, ServiceType::GenericNetwork("_ssh._tcp".to_string()));
        assert!(generic.mac_address.is_none());
    }

    #[test]
    fn test_validator_enforces_network_range() {
        let config = ScanConfig {
            network_range: Some("192.168.1.0/24".parse().unwrap()),
            ..Default::default()
        };
        let validator = AdvertisementValidator::new(&config);
        assert!(validator.validate(&record("a", "192.168.1.9", 80, "_http._tcp")).is_ok());
        assert_eq!(
            validator.validate(&record("a", "10.0.0.9", 80, "_http._tcp")).unwrap_err(),
            ValidationRejection::OutOfRange("10.0.0.9".to_string())
        );
    }
}
