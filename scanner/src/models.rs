use crate::discovery::RegisteredDevice;
use chrono::{DateTime, Utc};
use scan_common::ScanState;
use serde::Serialize;
use uuid::Uuid;

/// Aggregate view of a scan published to observers after every state change.
#[derive(Debug, Clone, Serialize)]
pub struct ScanProgress {
    pub session_id: Uuid,
    pub state: ScanState,
    /// Elapsed time over the scan-mode duration, 0.0..=1.0.
    pub progress_fraction: f64,
    pub devices_found: usize,
    pub threats_found: usize,
    pub current_host: Option<String>,
    pub elapsed_secs: f64,
    pub rejected_events: u64,
    pub suppressed_events: u64,
    /// Registry revision this progress was computed against.
    pub revision: u64,
}

/// Event counters for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanCounts {
    pub received: u64,
    pub admitted: u64,
    pub rejected: u64,
    pub rejected_fields: u64,
    pub suppressed: u64,
    pub dropped_while_paused: u64,
    pub faults: u64,
}

/// Final (or current) state of a session: the data exporters and history consume.
#[derive(Debug, Clone, Serialize)]
pub struct ScanSummary {
    pub session_id: Uuid,
    pub state: ScanState,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub devices_found: usize,
    pub threats_found: usize,
    pub counts: ScanCounts,
    /// Set when the discovery source failed and the scan ended early.
    pub degraded: Option<String>,
    pub devices: Vec<RegisteredDevice>,
}
