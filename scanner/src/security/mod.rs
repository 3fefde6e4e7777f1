mod rate_limiter;
mod anomaly;

pub use rate_limiter::RateLimiter;
pub use anomaly::AnomalyDetector;
