//! Webhook invocation client
//!
//! Sends one named operation to a driver and returns a typed result. A
//! transport failure (timeout, non-2xx, undecodable body) is always a
//! [`TransportError`] and is never mixed up with a driver-reported Fail.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use kube::ResourceExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, warn};

use super::protocol::{
    ActionResponse, BackendRequest, CreateLoadBalancerRequest, CreateLoadBalancerResponse,
    DEFAULT_TIMEOUT, GenerateBackendAddrRequest, GenerateBackendAddrResponse, LoadBalancerRequest,
    Operation, OperationOutcome, ValidateBackendRequest, ValidateLoadBalancerRequest,
    ValidateResponse,
};
use crate::crd::{LoadBalancerDriver, StringMap};
use crate::telemetry::Telemetry;

/// Failure to obtain a well-formed driver answer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("webhook timed out after {0:?}")]
    Timeout(Duration),

    #[error("webhook returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed webhook response: {0}")]
    Decode(String),

    #[error("webhook request failed: {0}")]
    Request(String),
}

/// HTTP seam of the webhook client
#[async_trait]
pub trait DriverTransport: Send + Sync {
    /// POST a JSON body and return the decoded JSON response
    async fn post(
        &self,
        url: &str,
        body: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, TransportError>;
}

/// Transport backed by `reqwest`
#[derive(Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DriverTransport for HttpTransport {
    async fn post(
        &self,
        url: &str,
        body: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, TransportError> {
        let resp = self
            .client
            .post(url)
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_reqwest_error(e, timeout))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }

        resp.json::<serde_json::Value>()
            .await
            .map_err(|e| classify_reqwest_error(e, timeout))
    }
}

fn classify_reqwest_error(e: reqwest::Error, timeout: Duration) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(timeout)
    } else if e.is_decode() {
        TransportError::Decode(e.to_string())
    } else {
        TransportError::Request(e.to_string())
    }
}

/// A driver resolved from its LoadBalancerDriver object
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DriverRef {
    pub name: String,
    pub url: String,
    timeouts: HashMap<Operation, Duration>,
}

impl DriverRef {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            timeouts: HashMap::new(),
        }
    }

    pub fn with_timeout(mut self, op: Operation, timeout: Duration) -> Self {
        self.timeouts.insert(op, timeout);
        self
    }

    /// Resolve a driver object; unknown operations and unparsable timeouts
    /// fall back to the default since admission already rejects them
    pub fn from_driver(driver: &LoadBalancerDriver) -> Self {
        let mut resolved = Self::new(driver.name_any(), driver.spec.url.clone());
        for hook in &driver.spec.webhooks {
            let Some(op) = Operation::from_name(&hook.name) else {
                warn!(driver = %resolved.name, webhook = %hook.name, "Ignoring unknown webhook");
                continue;
            };
            if let Some(timeout) = hook.timeout.as_deref().and_then(parse_duration) {
                resolved.timeouts.insert(op, timeout);
            }
        }
        resolved
    }

    pub fn timeout_for(&self, op: Operation) -> Duration {
        self.timeouts.get(&op).copied().unwrap_or(DEFAULT_TIMEOUT)
    }

    pub fn url_for(&self, op: Operation) -> String {
        format!("{}/{}", self.url.trim_end_matches('/'), op.name())
    }
}

/// Parse a duration string such as `500ms`, `10s`, `2m`, `1h` or `1m30s`
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit())?;
        if digits == 0 {
            return None;
        }
        let value: u64 = rest[..digits].parse().ok()?;
        rest = &rest[digits..];
        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];
        let part = match unit {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value.checked_mul(60)?),
            "h" => Duration::from_secs(value.checked_mul(3600)?),
            _ => return None,
        };
        total = total.checked_add(part)?;
    }
    Some(total)
}

/// Result of createLoadBalancer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateResult {
    pub outcome: OperationOutcome,
    pub lb_info: StringMap,
}

/// Result of generateBackendAddr
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GenerateResult {
    pub outcome: OperationOutcome,
    pub backend_addr: Option<String>,
}

/// Typed webhook client shared by all reconcilers
#[derive(Clone)]
pub struct DriverClient {
    transport: Arc<dyn DriverTransport>,
    telemetry: Arc<dyn Telemetry>,
}

impl DriverClient {
    pub fn new(transport: Arc<dyn DriverTransport>, telemetry: Arc<dyn Telemetry>) -> Self {
        Self {
            transport,
            telemetry,
        }
    }

    /// Send one operation and decode its response
    async fn invoke<Req, Resp>(
        &self,
        driver: &DriverRef,
        op: Operation,
        req: &Req,
    ) -> Result<Resp, TransportError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let op_name = op.name();
        let timeout = driver.timeout_for(op);
        let url = driver.url_for(op);
        let body = serde_json::to_value(req).map_err(|e| TransportError::Request(e.to_string()))?;

        self.telemetry.webhook_called(&driver.name, op_name);
        let started = Instant::now();

        // The transport enforces the timeout too; this bounds fakes and slow bodies.
        let result = match tokio::time::timeout(timeout, self.transport.post(&url, body, timeout))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(timeout)),
        }
        .and_then(|value| {
            serde_json::from_value::<Resp>(value).map_err(|e| TransportError::Decode(e.to_string()))
        });

        self.telemetry
            .webhook_latency(&driver.name, op_name, started.elapsed().as_secs_f64());

        match &result {
            Ok(_) => debug!(driver = %driver.name, operation = op_name, "Webhook call completed"),
            Err(e) => {
                self.telemetry.webhook_error(&driver.name, op_name);
                warn!(driver = %driver.name, operation = op_name, error = %e, "Webhook call failed");
            }
        }
        result
    }

    fn observe_outcome(&self, driver: &DriverRef, op: Operation, outcome: &OperationOutcome) {
        if matches!(outcome, OperationOutcome::Fail { .. }) {
            self.telemetry.webhook_failed(&driver.name, op.name());
        }
    }

    async fn invoke_action<Req: Serialize>(
        &self,
        driver: &DriverRef,
        op: Operation,
        req: &Req,
    ) -> Result<OperationOutcome, TransportError> {
        let resp: ActionResponse = self.invoke(driver, op, req).await?;
        let outcome = OperationOutcome::from(&resp);
        self.observe_outcome(driver, op, &outcome);
        Ok(outcome)
    }

    async fn invoke_validate<Req: Serialize>(
        &self,
        driver: &DriverRef,
        op: Operation,
        req: &Req,
    ) -> Result<ValidateResponse, TransportError> {
        let resp: ValidateResponse = self.invoke(driver, op, req).await?;
        if !resp.succ {
            self.telemetry.webhook_failed(&driver.name, op.name());
        }
        Ok(resp)
    }

    pub async fn validate_load_balancer(
        &self,
        driver: &DriverRef,
        req: &ValidateLoadBalancerRequest,
    ) -> Result<ValidateResponse, TransportError> {
        self.invoke_validate(driver, Operation::ValidateLoadBalancer, req)
            .await
    }

    pub async fn create_load_balancer(
        &self,
        driver: &DriverRef,
        req: &CreateLoadBalancerRequest,
    ) -> Result<CreateResult, TransportError> {
        let op = Operation::CreateLoadBalancer;
        let resp: CreateLoadBalancerResponse = self.invoke(driver, op, req).await?;
        let outcome = OperationOutcome::from(&resp.action);
        self.observe_outcome(driver, op, &outcome);
        Ok(CreateResult {
            outcome,
            lb_info: resp.lb_info,
        })
    }

    pub async fn ensure_load_balancer(
        &self,
        driver: &DriverRef,
        req: &LoadBalancerRequest,
    ) -> Result<OperationOutcome, TransportError> {
        self.invoke_action(driver, Operation::EnsureLoadBalancer, req)
            .await
    }

    pub async fn delete_load_balancer(
        &self,
        driver: &DriverRef,
        req: &LoadBalancerRequest,
    ) -> Result<OperationOutcome, TransportError> {
        self.invoke_action(driver, Operation::DeleteLoadBalancer, req)
            .await
    }

    pub async fn validate_backend(
        &self,
        driver: &DriverRef,
        req: &ValidateBackendRequest,
    ) -> Result<ValidateResponse, TransportError> {
        self.invoke_validate(driver, Operation::ValidateBackend, req)
            .await
    }

    pub async fn generate_backend_addr(
        &self,
        driver: &DriverRef,
        req: &GenerateBackendAddrRequest,
    ) -> Result<GenerateResult, TransportError> {
        let op = Operation::GenerateBackendAddr;
        let resp: GenerateBackendAddrResponse = self.invoke(driver, op, req).await?;
        let outcome = OperationOutcome::from(&resp.action);
        self.observe_outcome(driver, op, &outcome);
        let backend_addr = Some(resp.backend_addr).filter(|a| !a.is_empty());
        Ok(GenerateResult {
            outcome,
            backend_addr,
        })
    }

    pub async fn ensure_backend(
        &self,
        driver: &DriverRef,
        req: &BackendRequest,
    ) -> Result<OperationOutcome, TransportError> {
        self.invoke_action(driver, Operation::EnsureBackend, req)
            .await
    }

    pub async fn deregister_backend(
        &self,
        driver: &DriverRef,
        req: &BackendRequest,
    ) -> Result<OperationOutcome, TransportError> {
        self.invoke_action(driver, Operation::DeregisterBackend, req)
            .await
    }
}
