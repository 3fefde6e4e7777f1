//! Discovery and trust-scoring engine for smart-home accessories.
//!
//! Raw service advertisements flow through validation, rate limiting and
//! anomaly detection, confidence scoring, and finally a bounded device
//! registry whose changes are published to observers and history.

pub mod discovery;
pub mod history;
pub mod models;
pub mod observer;
pub mod scoring;
pub mod security;

pub use discovery::{start_discovery, DeviceRegistry, DiscoveryCoordinator, EventOutcome};
pub use history::{spawn_history_writer, HistoryRecord, HistorySink, HistoryStore, InMemoryHistory};
pub use models::{ScanCounts, ScanProgress, ScanSummary};
pub use observer::{ChannelObserver, LogObserver, ScanObserver, ScanUpdate};
pub use scoring::ConfidenceScorer;
