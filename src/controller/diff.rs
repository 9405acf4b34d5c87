//! Backend diff engine
//!
//! Compares the records an owner should have with the records it has, keyed by
//! record name, and yields the minimal create/update/delete sets.

use std::collections::{HashMap, HashSet};

use kube::ResourceExt;

use crate::crd::BackendRecord;

#[derive(Clone, Debug, Default)]
pub struct BackendDiff {
    /// Expected but missing
    pub create: Vec<BackendRecord>,
    /// Existing copies with the expected mutable fields applied
    pub update: Vec<BackendRecord>,
    /// Existing but no longer expected
    pub delete: Vec<BackendRecord>,
}

impl BackendDiff {
    /// Diff `expected` against `existing`; names in `do_not_delete` are never deleted
    pub fn compute(
        expected: &[BackendRecord],
        existing: &[BackendRecord],
        do_not_delete: &HashSet<String>,
    ) -> Self {
        let existing_by_name: HashMap<String, &BackendRecord> =
            existing.iter().map(|r| (r.name_any(), r)).collect();
        let expected_names: HashSet<String> = expected.iter().map(|r| r.name_any()).collect();

        let mut diff = BackendDiff::default();
        for want in expected {
            match existing_by_name.get(&want.name_any()) {
                None => diff.create.push(want.clone()),
                Some(have) if needs_update(want, have) => {
                    diff.update.push(apply_mutable(want, have));
                }
                Some(_) => {}
            }
        }

        diff.delete = existing
            .iter()
            .filter(|r| {
                let name = r.name_any();
                !expected_names.contains(&name) && !do_not_delete.contains(&name)
            })
            .cloned()
            .collect();

        diff
    }

    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.update.is_empty() && self.delete.is_empty()
    }
}

/// Whether the mutable portion of a record differs
pub fn needs_update(expected: &BackendRecord, existing: &BackendRecord) -> bool {
    expected.spec.lb_attributes != existing.spec.lb_attributes
        || expected.spec.parameters != existing.spec.parameters
        || expected.spec.ensure_policy != existing.spec.ensure_policy
}

/// Copy of `existing` carrying the mutable fields of `expected`
fn apply_mutable(expected: &BackendRecord, existing: &BackendRecord) -> BackendRecord {
    let mut updated = existing.clone();
    updated.spec.lb_attributes = expected.spec.lb_attributes.clone();
    updated.spec.parameters = expected.spec.parameters.clone();
    updated.spec.ensure_policy = expected.spec.ensure_policy.clone();
    updated
}
