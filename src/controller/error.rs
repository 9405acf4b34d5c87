//! Error types for the LBCF controllers

use std::time::Duration;

use thiserror::Error;

/// Error variants are named with the `Error` suffix for clarity (e.g., `KubeError`, `ValidationError`).
#[allow(clippy::enum_variant_names)]
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Missing object key: {0}")]
    MissingObjectKey(&'static str),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    #[error("Conflicting write: {0}")]
    ConflictError(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Cache sync error: {0}")]
    CacheSyncError(String),
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::KubeError(e) => match e {
                kube::Error::Api(api_err) => {
                    // 4xx errors (except 409 Conflict, 429 TooManyRequests) are usually not retryable
                    let code = api_err.code;
                    if (400..500).contains(&code) {
                        return code == 409 || code == 429;
                    }
                    true
                }
                _ => true,
            },
            Error::ConflictError(_) => true,
            Error::NotFound(_) => true,
            Error::AlreadyExists(_) => true,
            Error::InvalidConfig(_) => false,
            Error::ValidationError(_) => false,
            Error::CacheSyncError(_) => false,
            Error::SerializationError(_) => false,
            Error::MissingObjectKey(_) => false,
        }
    }

    /// Optimistic-concurrency rejection of a write
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::ConflictError(_) => true,
            Error::KubeError(kube::Error::Api(api_err)) => api_err.code == 409,
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::KubeError(kube::Error::Api(api_err)) => api_err.code == 404,
            _ => false,
        }
    }

    pub fn is_already_exists(&self) -> bool {
        match self {
            Error::AlreadyExists(_) => true,
            Error::KubeError(kube::Error::Api(api_err)) => {
                api_err.code == 409 && api_err.reason == "AlreadyExists"
            }
            _ => false,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Exponential backoff configuration
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Initial delay for first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for each subsequent retry
    pub multiplier: f64,
    /// Random jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300), // 5 minutes
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl BackoffConfig {
    /// Backoff without jitter, for deterministic schedules
    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// Calculate the backoff delay for a given retry attempt (0-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let max_delay_secs = self.max_delay.as_secs_f64();
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let grown = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        // powi overflows to inf, and inf * 0.0 is NaN
        let base_delay_secs = if grown.is_finite() {
            grown.min(max_delay_secs)
        } else {
            max_delay_secs
        };

        let jitter_range = base_delay_secs * self.jitter;
        let jitter = rand::random::<f64>() * jitter_range * 2.0 - jitter_range;
        let delay_with_jitter = (base_delay_secs + jitter).max(0.0);

        let capped_delay = delay_with_jitter.min(max_delay_secs);

        Duration::from_secs_f64(capped_delay)
    }

    /// Backoff for an attempt, never shorter than `floor`
    pub fn delay_with_floor(&self, attempt: u32, floor: Option<Duration>) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        match floor {
            Some(floor) if floor > delay => floor,
            _ => delay,
        }
    }
}
