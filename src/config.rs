//! Operator configuration read from environment variables

use tracing::warn;

use crate::controller::error::{Error, Result};
use crate::store::DEFAULT_CONFLICT_RETRIES;

/// Namespace searched for drivers shared by every namespace
pub const DEFAULT_SYSTEM_NAMESPACE: &str = "kube-system";

/// Workers per resource type when not configured
pub const DEFAULT_WORKERS: usize = 4;

/// Runtime configuration of the operator
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Identity used for leader election and as event reporter instance
    pub pod_name: String,
    /// Namespace holding the leader election lease
    pub pod_namespace: String,
    /// Restrict watches to one namespace; `None` watches the whole cluster
    pub watch_namespace: Option<String>,
    /// Namespace of drivers shared by every namespace
    pub system_namespace: String,
    pub load_balancer_workers: usize,
    pub backend_group_workers: usize,
    pub backend_record_workers: usize,
    pub bind_workers: usize,
    /// Bound on re-read-and-reapply loops for conflicting status writes
    pub status_conflict_retries: u32,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            pod_name: "lbcf-operator".to_string(),
            pod_namespace: "default".to_string(),
            watch_namespace: None,
            system_namespace: DEFAULT_SYSTEM_NAMESPACE.to_string(),
            load_balancer_workers: DEFAULT_WORKERS,
            backend_group_workers: DEFAULT_WORKERS,
            backend_record_workers: DEFAULT_WORKERS * 2,
            bind_workers: DEFAULT_WORKERS,
            status_conflict_retries: DEFAULT_CONFLICT_RETRIES,
        }
    }
}

impl OperatorConfig {
    /// Read the configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let pod_name = non_empty("POD_NAME").unwrap_or_else(|| {
            warn!("POD_NAME not set, using hostname");
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or(defaults.pod_name.clone())
        });
        let pod_namespace = non_empty("POD_NAMESPACE").unwrap_or_else(|| {
            warn!("POD_NAMESPACE not set, using 'default'");
            defaults.pod_namespace.clone()
        });

        Ok(Self {
            pod_name,
            pod_namespace,
            watch_namespace: non_empty("LBCF_WATCH_NAMESPACE"),
            system_namespace: non_empty("LBCF_SYSTEM_NAMESPACE")
                .unwrap_or(defaults.system_namespace),
            load_balancer_workers: parse_workers(
                "LBCF_WORKERS_LOAD_BALANCER",
                non_empty("LBCF_WORKERS_LOAD_BALANCER"),
                defaults.load_balancer_workers,
            )?,
            backend_group_workers: parse_workers(
                "LBCF_WORKERS_BACKEND_GROUP",
                non_empty("LBCF_WORKERS_BACKEND_GROUP"),
                defaults.backend_group_workers,
            )?,
            backend_record_workers: parse_workers(
                "LBCF_WORKERS_BACKEND_RECORD",
                non_empty("LBCF_WORKERS_BACKEND_RECORD"),
                defaults.backend_record_workers,
            )?,
            bind_workers: parse_workers(
                "LBCF_WORKERS_BIND",
                non_empty("LBCF_WORKERS_BIND"),
                defaults.bind_workers,
            )?,
            status_conflict_retries: match non_empty("LBCF_STATUS_CONFLICT_RETRIES") {
                Some(v) => v.trim().parse::<u32>().map_err(|_| {
                    Error::InvalidConfig(format!(
                        "LBCF_STATUS_CONFLICT_RETRIES must be a non-negative integer, got '{}'",
                        v
                    ))
                })?,
                None => defaults.status_conflict_retries,
            },
        })
    }
}

fn parse_workers(key: &str, value: Option<String>, default: usize) -> Result<usize> {
    let Some(value) = value else {
        return Ok(default);
    };
    match value.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(Error::InvalidConfig(format!(
            "{} must be a positive integer, got '{}'",
            key, value
        ))),
    }
}
