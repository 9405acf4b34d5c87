//! Deterministic BackendRecord names

use sha2::{Digest, Sha256};

use crate::crd::BackendDescriptor;

/// Kind of the object that owns a set of BackendRecords
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OwnerKind {
    BackendGroup,
    Bind,
}

impl OwnerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OwnerKind::BackendGroup => "BackendGroup",
            OwnerKind::Bind => "Bind",
        }
    }
}

/// Name of the record attaching `backend` to `lb_name` on behalf of an owner
///
/// The name is a hex SHA-256 over the owner, the load balancer, the backend's
/// selector key and its port, so the same attachment always maps to the same
/// record and a recomputed expectation never creates duplicates.
pub fn backend_record_name(
    owner: OwnerKind,
    owner_name: &str,
    lb_name: &str,
    backend: &BackendDescriptor,
) -> String {
    let port = backend.port().map(|p| p.to_string()).unwrap_or_default();
    let mut hasher = Sha256::new();
    for part in [
        owner.as_str(),
        owner_name,
        lb_name,
        backend.selector_key().as_str(),
        port.as_str(),
    ] {
        hasher.update(part.as_bytes());
        // separator keeps ("ab", "c") and ("a", "bc") apart
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}
