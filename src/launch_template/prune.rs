//! Launch template version retention.
//!
//! The kept set is a union: the newest N versions, the template's latest
//! and default versions, and every version a live consumer boots from.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::config::RetentionPolicy;
use crate::error::{ReconcileError, Result};
use crate::provider::{LaunchTemplate, TemplateRef, VersionRef};

/// Versions to keep and delete for one template.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PrunePlan {
    /// Versions that survive.
    pub keep: BTreeSet<u64>,
    /// Versions to delete, ascending.
    pub delete: Vec<u64>,
}

/// Result of a prune pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    /// Template that was pruned.
    pub template_id: String,
    /// Versions deleted.
    pub deleted: Vec<u64>,
    /// Versions kept.
    pub kept: Vec<u64>,
}

/// Resolves a consumer's template reference to a concrete version number.
#[must_use]
pub const fn resolve_version(reference: &TemplateRef, template: &LaunchTemplate) -> u64 {
    match reference.version {
        VersionRef::Latest => template.latest_version,
        VersionRef::Default => template.default_version,
        VersionRef::Number(n) => n,
    }
}

/// Computes which versions may be deleted.
///
/// `live` holds resolved version numbers referenced by running instances
/// or autoscaling groups.
#[must_use]
pub fn plan_prune(
    versions: &[u64],
    template: &LaunchTemplate,
    live: &BTreeSet<u64>,
    policy: RetentionPolicy,
) -> PrunePlan {
    let existing: BTreeSet<u64> = versions.iter().copied().collect();

    let mut keep: BTreeSet<u64> = existing
        .iter()
        .rev()
        .take(policy.keep_latest)
        .copied()
        .collect();
    keep.insert(template.latest_version);
    keep.insert(template.default_version);
    keep.extend(live.iter().copied());
    keep.retain(|v| existing.contains(v));

    let delete = existing.difference(&keep).copied().collect();

    PrunePlan { keep, delete }
}

/// Re-checks a plan against a freshly read live reference set.
///
/// # Errors
///
/// Returns `InvariantViolation` if any planned deletion is now in use.
pub fn verify_plan(template_id: &str, plan: &PrunePlan, live: &BTreeSet<u64>) -> Result<()> {
    let in_use: Vec<u64> = plan
        .delete
        .iter()
        .copied()
        .filter(|v| live.contains(v))
        .collect();

    if in_use.is_empty() {
        Ok(())
    } else {
        Err(ReconcileError::InvariantViolation {
            resource_id: template_id.to_string(),
            message: format!("versions {in_use:?} planned for deletion are referenced by live consumers"),
        }
        .into())
    }
}

impl PruneReport {
    /// Returns true if nothing was deleted.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.deleted.is_empty()
    }
}
