//! Telemetry seam used by the webhook client and the work queues
//!
//! The production implementation is [`crate::health::Metrics`]; tests use
//! [`NoopTelemetry`].

/// Sink for webhook and reconcile observations
pub trait Telemetry: Send + Sync {
    /// A webhook call was attempted
    fn webhook_called(&self, driver: &str, operation: &str);

    /// A webhook call failed at the transport level (timeout, non-2xx, bad body)
    fn webhook_error(&self, driver: &str, operation: &str);

    /// A driver answered Fail (or `succ: false` for validating calls)
    fn webhook_failed(&self, driver: &str, operation: &str);

    /// Latency of one webhook call, transport errors included
    fn webhook_latency(&self, driver: &str, operation: &str, seconds: f64);

    /// A reconcile finished with the given result kind
    fn reconciled(&self, _kind: &str, _result: &str, _seconds: f64) {}
}

/// Telemetry that records nothing
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopTelemetry;

impl Telemetry for NoopTelemetry {
    fn webhook_called(&self, _driver: &str, _operation: &str) {}
    fn webhook_error(&self, _driver: &str, _operation: &str) {}
    fn webhook_failed(&self, _driver: &str, _operation: &str) {}
    fn webhook_latency(&self, _driver: &str, _operation: &str, _seconds: f64) {}
}
