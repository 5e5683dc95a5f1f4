//! Tag reconciliation.
//!
//! This module computes minimal tag changes between desired and observed
//! tag maps and applies them to provider resources.

mod diff;
mod reconcile;

use std::collections::BTreeMap;

pub use diff::{TagDiff, TagDiffEngine, RESERVED_TAG_PREFIX};
pub use reconcile::{ResourceTagUpdate, TagReconcileReport, TagReconciler};

use crate::context::{ReconcileContext, OWNERSHIP_OWNED, ROLE_TAG};

/// A tag set keyed by name.
pub type Tags = BTreeMap<String, String>;

/// Tag key holding the display name of a resource.
pub const NAME_TAG: &str = "Name";

/// Builds the desired tag set for a resource managed by this engine.
///
/// Later sources win: cluster-level additional tags, then resource tags,
/// then the engine's own ownership, role and name tags.
#[must_use]
pub fn build_owned_tags(ctx: &ReconcileContext, role: &str, name: &str, extra: &Tags) -> Tags {
    let mut tags = ctx.additional_tags.clone();
    tags.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));

    tags.insert(ctx.ownership_key(), String::from(OWNERSHIP_OWNED));
    tags.insert(String::from(ROLE_TAG), role.to_string());
    tags.insert(String::from(NAME_TAG), name.to_string());

    tags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_tags_override_user_tags() {
        let mut ctx = ReconcileContext::new("prod");
        ctx.additional_tags
            .insert(String::from("env"), String::from("prod"));

        let extra = Tags::from([
            (String::from("env"), String::from("canary")),
            (String::from(NAME_TAG), String::from("spoofed")),
        ]);
        let tags = build_owned_tags(&ctx, "node", "pool-a", &extra);

        assert_eq!(tags.get("env").map(String::as_str), Some("canary"));
        assert_eq!(tags.get(NAME_TAG).map(String::as_str), Some("pool-a"));
        assert_eq!(tags.get(ROLE_TAG).map(String::as_str), Some("node"));
    }
}
