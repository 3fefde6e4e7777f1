mod coordinator;
mod registry;
mod validator;

use std::sync::Arc;
use futures::Stream;
use scan_common::{AdvertisementRecord, Result, ScanConfig};

use crate::observer::ScanObserver;
use crate::models::ScanSummary;

pub use coordinator::{DiscoveryCoordinator, EventOutcome};
pub use registry::{DeviceChange, DeviceRegistry, RegisteredDevice, RegistryDelta};
pub use validator::{
    contains_unsafe_content, normalize_service_type, parse_mac, sanitize_metadata, sanitize_name, validate_ip,
    validate_port, AdvertisementValidator, ValidatedAdvertisement,
};

/// Runs a single scan over `source` to completion.
pub async fn start_discovery<S>(config: ScanConfig, observer: Arc<dyn ScanObserver>, source: S) -> Result<ScanSummary>
where
    S: Stream<Item = Result<AdvertisementRecord>> + Unpin,
{
    let coordinator = DiscoveryCoordinator::new(observer);
    coordinator.start(config)?;
    coordinator.run(source).await
}
