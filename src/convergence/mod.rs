//! Shared reconcile/delete pattern for provider resources.
//!
//! Every managed resource kind comes as a pair of operations that are both
//! safe to repeat: `reconcile` converges the resource to its desired spec,
//! `delete` removes it if present.

mod bucket;
mod instance_security_groups;
mod network;
mod secret;
mod security_group;

use async_trait::async_trait;
use serde::Serialize;

use crate::context::ReconcileContext;
use crate::error::Result;

pub use bucket::BucketPair;
pub use instance_security_groups::{attachment_drift, AttachmentDrift, InstanceSecurityGroupsPair};
pub use network::NetworkPair;
pub use secret::{
    chunk_name, secret_prefix, split_chunks, user_data, SecretUserDataStore, StoredUserData,
    MAX_SECRET_CHUNK_BYTES, SECRET_PREFIX, SECRET_ROLE,
};
pub use security_group::{IngressDiff, SecurityGroupPair};

/// Kind of a managed resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// VPC.
    Network,
    /// Security group.
    SecurityGroup,
    /// Load balancer or target group.
    LoadBalancer,
    /// Object store bucket.
    Bucket,
    /// Launch template.
    LaunchTemplate,
    /// Autoscaling group.
    AutoScalingGroup,
    /// Security groups attached to live instances.
    InstanceSecurityGroups,
}

/// Result of one reconcile or delete call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergenceOutcome {
    /// The resource was created.
    Created,
    /// The resource existed and was changed.
    Updated,
    /// The resource already matched.
    Unchanged,
    /// The resource was removed.
    Deleted,
    /// The resource was already gone.
    AlreadyAbsent,
}

impl ConvergenceOutcome {
    /// Returns true if the call changed provider state.
    #[must_use]
    pub const fn changed(self) -> bool {
        matches!(self, Self::Created | Self::Updated | Self::Deleted)
    }

    /// Folds the outcome of a sub-step into this one.
    #[must_use]
    pub const fn merge(self, other: Self) -> Self {
        match (self, other) {
            (Self::Created, _) | (_, Self::Created) => Self::Created,
            (Self::Deleted, _) | (_, Self::Deleted) => Self::Deleted,
            (Self::Updated, _) | (_, Self::Updated) => Self::Updated,
            (Self::Unchanged, _) | (_, Self::Unchanged) => Self::Unchanged,
            _ => Self::AlreadyAbsent,
        }
    }
}

/// A reconcile/delete pair for one managed resource.
#[async_trait]
pub trait ResourceConvergencePair: Send + Sync {
    /// Returns the resource kind.
    fn kind(&self) -> ResourceKind;

    /// Returns the resource's desired name.
    fn name(&self) -> &str;

    /// Converges the resource to its desired spec.
    async fn reconcile(&self, ctx: &ReconcileContext) -> Result<ConvergenceOutcome>;

    /// Removes the resource if present. Does not wait for completion.
    async fn delete(&self, ctx: &ReconcileContext) -> Result<ConvergenceOutcome>;
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Network => "network",
            Self::SecurityGroup => "security-group",
            Self::LoadBalancer => "load-balancer",
            Self::Bucket => "bucket",
            Self::LaunchTemplate => "launch-template",
            Self::AutoScalingGroup => "autoscaling-group",
            Self::InstanceSecurityGroups => "instance-security-groups",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for ConvergenceOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Unchanged => "unchanged",
            Self::Deleted => "deleted",
            Self::AlreadyAbsent => "already absent",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_prefers_strongest_change() {
        use ConvergenceOutcome::{AlreadyAbsent, Created, Unchanged, Updated};

        assert_eq!(Unchanged.merge(Updated), Updated);
        assert_eq!(Updated.merge(Created), Created);
        assert_eq!(Unchanged.merge(Unchanged), Unchanged);
        assert_eq!(AlreadyAbsent.merge(AlreadyAbsent), AlreadyAbsent);
        assert!(!Unchanged.changed());
    }
}
