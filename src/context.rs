//! Per-call reconcile context.
//!
//! Cluster identity and tagging policy travel as an explicit parameter on
//! every operation instead of living in a long-lived scope object.

use std::collections::BTreeSet;

use crate::config::ClusterConfig;
use crate::tags::{build_owned_tags, TagDiffEngine, Tags};

/// Prefix of the cluster ownership tag key.
pub const OWNERSHIP_TAG_PREFIX: &str = "infra-converge.io/cluster/";

/// Value of the ownership tag on resources the engine created.
pub const OWNERSHIP_OWNED: &str = "owned";

/// Tag key carrying the resource role.
pub const ROLE_TAG: &str = "infra-converge.io/role";

/// Context passed to every reconcile and delete call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileContext {
    /// Cluster name.
    pub cluster: String,
    /// Provider region.
    pub region: Option<String>,
    /// Tags added to every managed resource.
    pub additional_tags: Tags,
    /// Tag keys owned by other systems.
    pub externally_managed_tags: BTreeSet<String>,
}

impl ReconcileContext {
    /// Creates a context for the given cluster with no extra tags.
    #[must_use]
    pub fn new(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            region: None,
            additional_tags: Tags::new(),
            externally_managed_tags: BTreeSet::new(),
        }
    }

    /// Builds a context from the cluster section of the configuration.
    #[must_use]
    pub fn from_config(cluster: &ClusterConfig) -> Self {
        Self {
            cluster: cluster.name.clone(),
            region: cluster.region.clone(),
            additional_tags: cluster.additional_tags.clone(),
            externally_managed_tags: cluster.externally_managed_tags.iter().cloned().collect(),
        }
    }

    /// Adds externally managed tag keys.
    #[must_use]
    pub fn with_externally_managed<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.externally_managed_tags
            .extend(keys.into_iter().map(Into::into));
        self
    }

    /// Returns the ownership tag key for this cluster.
    #[must_use]
    pub fn ownership_key(&self) -> String {
        format!("{OWNERSHIP_TAG_PREFIX}{}", self.cluster)
    }

    /// Returns true if the tags mark the resource as owned by this cluster.
    #[must_use]
    pub fn is_owned(&self, tags: &Tags) -> bool {
        tags.get(&self.ownership_key())
            .is_some_and(|v| v == OWNERSHIP_OWNED)
    }

    /// Builds the full desired tag set for a managed resource.
    #[must_use]
    pub fn owned_tags(&self, role: &str, name: &str, extra: &Tags) -> Tags {
        build_owned_tags(self, role, name, extra)
    }

    /// Returns a tag diff engine honouring this context's allow-list.
    #[must_use]
    pub fn tag_engine(&self) -> TagDiffEngine {
        TagDiffEngine::new(self.externally_managed_tags.iter().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ownership() {
        let ctx = ReconcileContext::new("prod");
        let tags = ctx.owned_tags("node", "pool-a", &Tags::new());

        assert!(ctx.is_owned(&tags));
        assert!(!ReconcileContext::new("staging").is_owned(&tags));
    }

    #[test]
    fn test_from_config() {
        let cluster = ClusterConfig {
            name: String::from("prod"),
            region: Some(String::from("eu-west-1")),
            additional_tags: Tags::from([(String::from("team"), String::from("infra"))]),
            externally_managed_tags: vec![String::from("legacy")],
        };
        let ctx = ReconcileContext::from_config(&cluster);

        assert_eq!(ctx.cluster, "prod");
        assert!(ctx.externally_managed_tags.contains("legacy"));
    }
}
