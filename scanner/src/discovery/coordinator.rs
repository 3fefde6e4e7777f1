use crate::discovery::registry::{DeviceRegistry, RegisteredDevice, RegistryDelta};
use crate::discovery::validator::AdvertisementValidator;
use crate::history::{HistoryRecord, HistorySink};
use crate::models::{ScanCounts, ScanProgress, ScanSummary};
use crate::observer::ScanObserver;
use crate::scoring::{effective_anomalies, ConfidenceScorer};
use crate::security::{AnomalyDetector, RateLimiter};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use scan_common::{
    AdvertisementRecord, DeviceStatus, DiscoveredDevice, DiscoveryError, PausePolicy, RateKeyScope, Result,
    ScanConfig, ScanState, ValidationRejection,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

const MAX_ANOMALIES_PER_DEVICE: usize = 8;
const RATE_PURGE_INTERVAL: u64 = 256;

/// What happened to one advertisement.
#[derive(Debug, Clone)]
pub enum EventOutcome {
    Admitted(RegistryDelta),
    Rejected(ValidationRejection),
    Suppressed,
    /// Held while paused; replayed on resume.
    Buffered,
    /// Discarded because the scan was paused and not buffering, or the buffer was full.
    DroppedWhilePaused,
    /// The scan is not accepting events in this state.
    Ignored(ScanState),
    Fault(String),
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    admitted: AtomicU64,
    rejected: AtomicU64,
    rejected_fields: AtomicU64,
    dropped_while_paused: AtomicU64,
    faults: AtomicU64,
}

/// Everything owned by one scan: nothing here outlives or is shared across sessions.
struct ScanSession {
    id: Uuid,
    config: ScanConfig,
    started_at: DateTime<Utc>,
    validator: AdvertisementValidator,
    limiter: RateLimiter,
    anomalies: AnomalyDetector,
    scorer: ConfidenceScorer,
    registry: DeviceRegistry,
    counters: Counters,
    current_host: Mutex<Option<String>>,
    paused_events: Mutex<VecDeque<(AdvertisementRecord, DateTime<Utc>)>>,
    ended_at: Mutex<Option<DateTime<Utc>>>,
    degraded: Mutex<Option<String>>,
}

impl ScanSession {
    fn new(config: ScanConfig, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            validator: AdvertisementValidator::new(&config),
            limiter: RateLimiter::new(&config.rate_limit),
            anomalies: AnomalyDetector::new(&config.policy.expected_ports, config.max_devices.saturating_mul(4)),
            scorer: ConfidenceScorer::new(config.policy.clone()),
            registry: DeviceRegistry::new(config.max_devices, config.limits.max_ports),
            counters: Counters::default(),
            current_host: Mutex::new(None),
            paused_events: Mutex::new(VecDeque::new()),
            ended_at: Mutex::new(None),
            degraded: Mutex::new(None),
            started_at: now,
            config,
        }
    }

    fn counts(&self) -> ScanCounts {
        let c = &self.counters;
        ScanCounts {
            received: c.received.load(Ordering::Relaxed),
            admitted: c.admitted.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            rejected_fields: c.rejected_fields.load(Ordering::Relaxed),
            suppressed: self.limiter.suppressed_count(),
            dropped_while_paused: c.dropped_while_paused.load(Ordering::Relaxed),
            faults: c.faults.load(Ordering::Relaxed),
        }
    }

    fn progress(&self, state: ScanState, now: DateTime<Utc>) -> ScanProgress {
        let end = (*self.ended_at.lock()).unwrap_or(now);
        let elapsed = (end - self.started_at).to_std().unwrap_or_default();
        let budget = self.config.mode.duration().as_secs_f64();
        let progress_fraction = match state {
            ScanState::Completed => 1.0,
            _ if budget > 0.0 => (elapsed.as_secs_f64() / budget).clamp(0.0, 1.0),
            _ => 0.0,
        };
        let counts = self.counts();
        ScanProgress {
            session_id: self.id,
            state,
            progress_fraction,
            devices_found: self.registry.len(),
            threats_found: self.registry.threat_count(),
            current_host: self.current_host.lock().clone(),
            elapsed_secs: elapsed.as_secs_f64(),
            rejected_events: counts.rejected,
            suppressed_events: counts.suppressed,
            revision: self.registry.revision(),
        }
    }
}

struct Control {
    state: ScanState,
    session: Option<Arc<ScanSession>>,
}

/// Drives advertisements through validation, rate limiting, anomaly
/// detection, scoring and the registry, and owns the scan lifecycle.
///
/// Event processing holds a read lock on the lifecycle state for its whole
/// duration; transitions take the write lock. Once `cancel` returns, no
/// further event can reach the registry of that session.
pub struct DiscoveryCoordinator {
    control: RwLock<Control>,
    observer: Arc<dyn ScanObserver>,
    history: Option<HistorySink>,
}

impl DiscoveryCoordinator {
    pub fn new(observer: Arc<dyn ScanObserver>) -> Self {
        Self {
            control: RwLock::new(Control { state: ScanState::Idle, session: None }),
            observer,
            history: None,
        }
    }

    pub fn with_history(mut self, history: HistorySink) -> Self {
        self.history = Some(history);
        self
    }

    pub fn state(&self) -> ScanState {
        self.control.read().state
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.control.read().session.as_ref().map(|s| s.id)
    }

    /// Starts a new session. From a terminal state the previous session is
    /// torn down first.
    pub fn start(&self, config: ScanConfig) -> Result<Uuid> {
        config.validate()?;
        let mut control = self.control.write();
        match control.state {
            ScanState::Idle => {}
            state if state.is_terminal() => Self::teardown(&mut control),
            state => return Err(invalid_transition(state, "start")),
        }

        let now = Utc::now();
        let session = Arc::new(ScanSession::new(config, now));
        let id = session.id;
        info!(
            "Starting scan {} (mode {:?}, capacity {}, range {})",
            id,
            session.config.mode,
            session.config.max_devices,
            session
                .config
                .network_range
                .map(|r| r.to_string())
                .unwrap_or_else(|| "any".to_string())
        );
        control.session = Some(session.clone());
        control.state = ScanState::Scanning;
        self.observer.on_progress(&session.progress(ScanState::Scanning, now));
        Ok(id)
    }

    /// Drops a finished session and returns to `Idle`.
    pub fn reset(&self) -> Result<()> {
        let mut control = self.control.write();
        match control.state {
            ScanState::Idle => Ok(()),
            state if state.is_terminal() => {
                Self::teardown(&mut control);
                Ok(())
            }
            state => Err(invalid_transition(state, "reset")),
        }
    }

    fn teardown(control: &mut Control) {
        if let Some(session) = control.session.take() {
            let removed = session.registry.clear();
            debug!("Tore down scan {} ({} devices)", session.id, removed);
        }
        control.state = ScanState::Idle;
    }

    pub fn pause(&self) -> Result<()> {
        let mut control = self.control.write();
        if control.state != ScanState::Scanning {
            return Err(invalid_transition(control.state, "pause"));
        }
        control.state = ScanState::Paused;
        info!("Scan paused");
        self.publish_progress(&control);
        Ok(())
    }

    /// Continues consumption, replaying any events buffered while paused.
    pub fn resume(&self) -> Result<()> {
        let mut control = self.control.write();
        if control.state != ScanState::Paused {
            return Err(invalid_transition(control.state, "resume"));
        }
        control.state = ScanState::Scanning;
        info!("Scan resumed");
        self.publish_progress(&control);

        let control = RwLockWriteGuard::downgrade(control);
        if let Some(session) = control.session.clone() {
            let buffered: Vec<_> = session.paused_events.lock().drain(..).collect();
            if !buffered.is_empty() {
                debug!("Replaying {} events buffered while paused", buffered.len());
            }
            for (record, received_at) in buffered {
                self.process(&session, record, received_at);
            }
        }
        Ok(())
    }

    pub fn cancel(&self) -> Result<()> {
        self.finish(ScanState::Cancelled, "cancel")
    }

    pub fn complete(&self) -> Result<()> {
        self.finish(ScanState::Completed, "complete")
    }

    fn finish(&self, target: ScanState, action: &str) -> Result<()> {
        let mut control = self.control.write();
        if !matches!(control.state, ScanState::Scanning | ScanState::Paused) {
            return Err(invalid_transition(control.state, action));
        }
        control.state = target;
        if let Some(session) = &control.session {
            let discarded = {
                let mut paused = session.paused_events.lock();
                let n = paused.len();
                paused.clear();
                n
            };
            if discarded > 0 {
                debug!("Discarded {} buffered events", discarded);
            }
            if target == ScanState::Completed {
                session.registry.mark_all_offline();
            }
            *session.ended_at.lock() = Some(Utc::now());
            info!(
                "Scan {} {} with {} devices",
                session.id,
                target,
                session.registry.len()
            );
        }
        self.publish_progress(&control);
        Ok(())
    }

    fn publish_progress(&self, control: &Control) {
        if let Some(session) = &control.session {
            self.observer.on_progress(&session.progress(control.state, Utc::now()));
        }
    }

    pub fn handle_advertisement(&self, record: AdvertisementRecord) -> EventOutcome {
        self.handle_advertisement_at(record, Utc::now())
    }

    /// Processes one advertisement observed at `now`.
    pub fn handle_advertisement_at(&self, record: AdvertisementRecord, now: DateTime<Utc>) -> EventOutcome {
        let control = self.control.read();
        let Some(session) = control.session.clone() else {
            return EventOutcome::Ignored(control.state);
        };
        match control.state {
            ScanState::Scanning => self.process(&session, record, now),
            ScanState::Paused => Self::hold(&session, record, now),
            state => EventOutcome::Ignored(state),
        }
    }

    fn hold(session: &ScanSession, record: AdvertisementRecord, now: DateTime<Utc>) -> EventOutcome {
        if let PausePolicy::Buffer { capacity } = session.config.pause_policy {
            let mut paused = session.paused_events.lock();
            if paused.len() < capacity {
                paused.push_back((record, now));
                return EventOutcome::Buffered;
            }
        }
        session.counters.dropped_while_paused.fetch_add(1, Ordering::Relaxed);
        EventOutcome::DroppedWhilePaused
    }

    /// Caller must hold the control read lock with the state at `Scanning`.
    fn process(&self, session: &ScanSession, record: AdvertisementRecord, now: DateTime<Utc>) -> EventOutcome {
        let received = session.counters.received.fetch_add(1, Ordering::Relaxed) + 1;
        if received % RATE_PURGE_INTERVAL == 0 {
            session.limiter.purge_idle(now);
        }

        let validated = match session.validator.validate(&record) {
            Ok(validated) => validated,
            Err(rejection) => {
                session.counters.rejected.fetch_add(1, Ordering::Relaxed);
                debug!("Rejected advertisement from '{}': {}", record.host.escape_debug(), rejection);
                return EventOutcome::Rejected(rejection);
            }
        };
        if !validated.dropped_fields.is_empty() {
            session
                .counters
                .rejected_fields
                .fetch_add(validated.dropped_fields.len() as u64, Ordering::Relaxed);
            for rejection in &validated.dropped_fields {
                debug!("Dropped field from {}: {}", validated.ip_address, rejection);
            }
        }

        let key = DiscoveredDevice::derive_key(&validated.name, validated.mac_address.as_deref(), &validated.ip_address);
        let source_key = match session.config.rate_limit.scope {
            RateKeyScope::Host => validated.ip_address.to_string(),
            RateKeyScope::Device => key.clone(),
        };
        if !session.limiter.check_and_record(&source_key, now) {
            return EventOutcome::Suppressed;
        }

        let prior = session.registry.get(&key).map(|entry| entry.device);
        let mut candidate = DiscoveredDevice {
            key,
            name: validated.name,
            ip_address: validated.ip_address,
            mac_address: validated.mac_address,
            service_type: validated.service_type,
            metadata: validated.metadata,
            ports: vec![validated.port],
            first_seen: prior.as_ref().map_or(now, |p| p.first_seen),
            last_seen: now,
            status: DeviceStatus::Online,
            anomalies: Vec::new(),
        };

        candidate.anomalies = session.anomalies.inspect(&candidate);
        let mut anomalies = effective_anomalies(&candidate, prior.as_ref());
        if anomalies.len() > MAX_ANOMALIES_PER_DEVICE {
            anomalies.drain(..anomalies.len() - MAX_ANOMALIES_PER_DEVICE);
        }
        candidate.anomalies = anomalies;
        if let Some(prior) = &prior {
            candidate.ports.extend(prior.ports.iter().copied());
            candidate.ports.sort_unstable();
            candidate.ports.dedup();
        }

        let assessment = session.scorer.score(&candidate, prior.as_ref());
        let host = candidate.ip_address.to_string();

        let delta = match session.registry.upsert(candidate, assessment) {
            Ok(delta) => delta,
            Err(e) => {
                session.counters.faults.fetch_add(1, Ordering::Relaxed);
                error!("Registry fault while admitting event from {}: {}", host, e);
                return EventOutcome::Fault(e.to_string());
            }
        };
        session.counters.admitted.fetch_add(1, Ordering::Relaxed);
        *session.current_host.lock() = Some(host);

        if let Some(history) = &self.history {
            let entry = delta.current();
            history.submit(HistoryRecord {
                device: entry.device.clone(),
                assessment: entry.assessment.clone(),
                timestamp: now,
            });
        }
        self.observer.on_device_change(&delta);
        self.observer.on_progress(&session.progress(ScanState::Scanning, now));
        EventOutcome::Admitted(delta)
    }

    /// Consumes `source` until it ends, fails, the scan-mode deadline passes,
    /// or the scan reaches a terminal state. Returns the session summary.
    pub async fn run<S>(&self, source: S) -> Result<ScanSummary>
    where
        S: Stream<Item = Result<AdvertisementRecord>> + Unpin,
    {
        let (state, duration) = {
            let control = self.control.read();
            let duration = control.session.as_ref().map(|s| s.config.mode.duration());
            (control.state, duration)
        };
        let duration = match (state, duration) {
            (ScanState::Scanning | ScanState::Paused, Some(duration)) => duration,
            (state, _) => return Err(invalid_transition(state, "run")),
        };

        let mut source = source;
        let deadline = tokio::time::sleep(duration);
        tokio::pin!(deadline);

        while !self.state().is_terminal() {
            tokio::select! {
                _ = &mut deadline => {
                    info!("Scan deadline of {:?} reached", duration);
                    self.complete_if_active();
                }
                next = source.next() => match next {
                    Some(Ok(record)) => {
                        self.handle_advertisement(record);
                    }
                    Some(Err(e)) => {
                        warn!("Discovery source failed: {}", e);
                        self.degrade(&e);
                        self.complete_if_active();
                    }
                    None => {
                        debug!("Discovery source ended");
                        self.complete_if_active();
                    }
                },
            }
        }

        self.summary()
            .ok_or_else(|| DiscoveryError::SourceFailure("scan session disappeared".to_string()))
    }

    fn degrade(&self, error: &DiscoveryError) {
        let reason = error.to_string();
        if let Some(session) = &self.control.read().session {
            *session.degraded.lock() = Some(reason.clone());
        }
        self.observer.on_degraded(&reason);
    }

    fn complete_if_active(&self) {
        // Another caller may already have cancelled or completed the scan.
        if let Err(e) = self.complete() {
            debug!("Not completing: {}", e);
        }
    }

    pub fn progress(&self) -> Option<ScanProgress> {
        let control = self.control.read();
        control.session.as_ref().map(|s| s.progress(control.state, Utc::now()))
    }

    pub fn devices(&self) -> Vec<RegisteredDevice> {
        self.control
            .read()
            .session
            .as_ref()
            .map(|s| s.registry.all())
            .unwrap_or_default()
    }

    pub fn device(&self, key: &str) -> Option<RegisteredDevice> {
        self.control.read().session.as_ref().and_then(|s| s.registry.get(key))
    }

    pub fn counts(&self) -> Option<ScanCounts> {
        self.control.read().session.as_ref().map(|s| s.counts())
    }

    pub fn summary(&self) -> Option<ScanSummary> {
        let control = self.control.read();
        let session = control.session.as_ref()?;
        let summary = ScanSummary {
            session_id: session.id,
            state: control.state,
            started_at: session.started_at,
            ended_at: *session.ended_at.lock(),
            devices_found: session.registry.len(),
            threats_found: session.registry.threat_count(),
            counts: session.counts(),
            degraded: session.degraded.lock().clone(),
            devices: session.registry.all(),
        };
        Some(summary)
    }
}

fn invalid_transition(from: ScanState, action: &str) -> DiscoveryError {
    DiscoveryError::InvalidTransition {
        from: from.to_string(),
        action: action.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::{ChannelObserver, ScanUpdate};
    use std::collections::HashMap;

    fn advertisement(i: usize) -> AdvertisementRecord {
        AdvertisementRecord {
            instance_name: format!("Accessory {}", i),
            host: format!("10.0.{}.{}", i / 250, i % 250 + 1),
            port: 51826,
            service_type: "_hap._tcp".to_string(),
            metadata: HashMap::new(),
        }
    }

    fn coordinator() -> (DiscoveryCoordinator, tokio::sync::mpsc::UnboundedReceiver<ScanUpdate>) {
        let (observer, rx) = ChannelObserver::channel();
        (DiscoveryCoordinator::new(Arc::new(observer)), rx)
    }

    #[test]
    fn test_lifecycle_transitions() {
        let (coordinator, _rx) = coordinator();
        assert_eq!(coordinator.state(), ScanState::Idle);
        assert!(coordinator.pause().is_err());

        coordinator.start(ScanConfig::default()).unwrap();
        assert!(coordinator.start(ScanConfig::default()).is_err());
        coordinator.pause().unwrap();
        assert!(coordinator.pause().is_err());
        coordinator.resume().unwrap();
        coordinator.complete().unwrap();
        assert_eq!(coordinator.state(), ScanState::Completed);
        assert!(coordinator.cancel().is_err());
        assert!(coordinator.resume().is_err());

        let first = coordinator.session_id().unwrap();
        let second = coordinator.start(ScanConfig::default()).unwrap();
        assert_ne!(first, second);
        coordinator.cancel().unwrap();
        coordinator.reset().unwrap();
        assert_eq!(coordinator.state(), ScanState::Idle);
        assert!(coordinator.session_id().is_none());
    }

    #[test]
    fn test_start_rejects_oversized_rate_window() {
        let (coordinator, _rx) = coordinator();
        let mut config = ScanConfig::default();
        config.rate_limit.window_secs = 10_000_000_000_000_000;
        assert!(matches!(coordinator.start(config), Err(DiscoveryError::ConfigError(_))));
        assert_eq!(coordinator.state(), ScanState::Idle);
        assert!(coordinator.session_id().is_none());
    }

    #[test]
    fn test_events_ignored_outside_scanning() {
        let (coordinator, _rx) = coordinator();
        assert!(matches!(
            coordinator.handle_advertisement(advertisement(1)),
            EventOutcome::Ignored(ScanState::Idle)
        ));
        coordinator.start(ScanConfig::default()).unwrap();
        coordinator.cancel().unwrap();
        assert!(matches!(
            coordinator.handle_advertisement(advertisement(1)),
            EventOutcome::Ignored(ScanState::Cancelled)
        ));
        assert!(coordinator.devices().is_empty());
    }

    #[test]
    fn test_rejections_and_suppressions_are_counted() {
        let (coordinator, _rx) = coordinator();
        let mut config = ScanConfig::default();
        config.rate_limit.threshold = 2;
        coordinator.start(config).unwrap();

        let mut bad = advertisement(1);
        bad.host = "999.1.1.1".to_string();
        assert!(matches!(
            coordinator.handle_advertisement(bad),
            EventOutcome::Rejected(ValidationRejection::InvalidIp(_))
        ));

        let now = Utc::now();
        for _ in 0..2 {
            assert!(matches!(
                coordinator.handle_advertisement_at(advertisement(1), now),
                EventOutcome::Admitted(_)
            ));
        }
        assert!(matches!(
            coordinator.handle_advertisement_at(advertisement(1), now),
            EventOutcome::Suppressed
        ));

        let counts = coordinator.counts().unwrap();
        assert_eq!(counts.received, 4);
        assert_eq!(counts.rejected, 1);
        assert_eq!(counts.suppressed, 1);
        assert_eq!(counts.admitted, 2);
        assert_eq!(coordinator.devices().len(), 1);
    }

    #[test]
    fn test_buffered_events_replay_on_resume() {
        let (coordinator, _rx) = coordinator();
        let config = ScanConfig {
            pause_policy: PausePolicy::Buffer { capacity: 1 },
            ..Default::default()
        };
        coordinator.start(config).unwrap();
        coordinator.pause().unwrap();
        assert!(matches!(coordinator.handle_advertisement(advertisement(1)), EventOutcome::Buffered));
        assert!(matches!(
            coordinator.handle_advertisement(advertisement(2)),
            EventOutcome::DroppedWhilePaused
        ));
        assert!(coordinator.devices().is_empty());

        coordinator.resume().unwrap();
        let devices = coordinator.devices();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].device.name, "Accessory 1");
    }

    #[test]
    fn test_cancel_discards_buffer() {
        let (coordinator, _rx) = coordinator();
        let config = ScanConfig {
            pause_policy: PausePolicy::Buffer { capacity: 10 },
            ..Default::default()
        };
        coordinator.start(config).unwrap();
        coordinator.handle_advertisement(advertisement(1));
        coordinator.pause().unwrap();
        coordinator.handle_advertisement(advertisement(2));
        coordinator.cancel().unwrap();
        assert!(coordinator.resume().is_err());
        assert_eq!(coordinator.devices().len(), 1);
    }

    #[test]
    fn test_observer_receives_delta_then_progress() {
        let (coordinator, mut rx) = coordinator();
        coordinator.start(ScanConfig::default()).unwrap();
        coordinator.handle_advertisement(advertisement(7));

        assert!(matches!(rx.try_recv().unwrap(), ScanUpdate::Progress(p) if p.state == ScanState::Scanning));
        match rx.try_recv().unwrap() {
            ScanUpdate::Device(delta) => assert_eq!(delta.current().device.name, "Accessory 7"),
            other => panic!("expected device update, got {:?}", other),
        }
        match rx.try_recv().unwrap() {
            ScanUpdate::Progress(p) => {
                assert_eq!(p.devices_found, 1);
                assert_eq!(p.threats_found, 1);
                assert_eq!(p.current_host.as_deref(), Some("10.0.0.8"));
            }
            other => panic!("expected progress, got {:?}", other),
        }
    }
}
