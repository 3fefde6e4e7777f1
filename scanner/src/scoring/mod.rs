pub mod scorer;

pub use scorer::{effective_anomalies, ConfidenceScorer};
