pub mod error;
pub mod types;
pub mod config;

pub use error::{DiscoveryError, Result, ValidationRejection};
pub use types::*;
pub use config::*;
