//! Observer channel for scan progress and per-device changes.

use crate::discovery::RegistryDelta;
use crate::models::ScanProgress;
use log::{info, warn};
use tokio::sync::mpsc;

pub trait ScanObserver: Send + Sync {
    fn on_progress(&self, progress: &ScanProgress);

    fn on_device_change(&self, delta: &RegistryDelta);

    /// The discovery source failed; the scan is finishing early.
    fn on_degraded(&self, _reason: &str) {}
}

#[derive(Debug, Clone)]
pub enum ScanUpdate {
    Progress(ScanProgress),
    Device(RegistryDelta),
    Degraded(String),
}

/// Forwards every notification over an unbounded tokio channel, in order.
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<ScanUpdate>,
}

impl ChannelObserver {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ScanUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, update: ScanUpdate) {
        // A closed receiver just means nobody is watching any more.
        let _ = self.tx.send(update);
    }
}

impl ScanObserver for ChannelObserver {
    fn on_progress(&self, progress: &ScanProgress) {
        self.send(ScanUpdate::Progress(progress.clone()));
    }

    fn on_device_change(&self, delta: &RegistryDelta) {
        self.send(ScanUpdate::Device(delta.clone()));
    }

    fn on_degraded(&self, reason: &str) {
        self.send(ScanUpdate::Degraded(reason.to_string()));
    }
}

/// Writes notifications to the log. Used by the CLI.
pub struct LogObserver;

impl ScanObserver for LogObserver {
    fn on_progress(&self, progress: &ScanProgress) {
        if progress.state.is_terminal() {
            info!(
                "Scan {} {}: {} devices, {} threats, {} rejected, {} suppressed",
                progress.session_id,
                progress.state,
                progress.devices_found,
                progress.threats_found,
                progress.rejected_events,
                progress.suppressed_events
            );
        }
    }

    fn on_device_change(&self, delta: &RegistryDelta) {
        let entry = delta.current();
        info!(
            "[rev {}] {} ({}) score={} threat={}",
            delta.revision,
            entry.device.name,
            entry.device.ip_address,
            entry.assessment.score,
            entry.assessment.threat.as_str()
        );
        if let Some(evicted) = delta.evicted() {
            info!("[rev {}] evicted {}", delta.revision, evicted.device.key);
        }
    }

    fn on_degraded(&self, reason: &str) {
        warn!("Scan degraded: {}", reason);
    }
}
