//! Observed resource types.
//!
//! These structs are snapshots of provider-side truth. They are fetched fresh
//! on every reconcile call and never mutated in place by the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::config::{IngressRule, MetadataOptions, RootVolume, TargetKind};
use crate::config::UserDataHash;
use crate::tags::Tags;

/// A launch template as reported by the provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LaunchTemplate {
    /// Provider-assigned id.
    pub id: String,
    /// Template name.
    pub name: String,
    /// Version used when a consumer asks for `$Default`.
    pub default_version: u64,
    /// Highest version number ever allocated.
    pub latest_version: u64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Boot configuration carried by one launch template version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct LaunchTemplateData {
    /// Instance type.
    pub instance_type: String,
    /// Boot image id.
    #[serde(default)]
    pub image_id: Option<String>,
    /// Security group ids.
    #[serde(default)]
    pub security_group_ids: Vec<String>,
    /// Digest of the user data payload.
    #[serde(default)]
    pub user_data_hash: Option<UserDataHash>,
    /// IAM instance profile name.
    #[serde(default)]
    pub iam_instance_profile: Option<String>,
    /// SSH key pair name.
    #[serde(default)]
    pub ssh_key_name: Option<String>,
    /// Root volume settings.
    #[serde(default)]
    pub root_volume: Option<RootVolume>,
    /// Metadata service options.
    #[serde(default)]
    pub metadata_options: Option<MetadataOptions>,
    /// Spot maximum price.
    #[serde(default)]
    pub spot_max_price: Option<String>,
}

/// One immutable numbered revision of a launch template.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LaunchTemplateVersion {
    /// Template the version belongs to.
    pub template_id: String,
    /// Version number, never reused.
    pub number: u64,
    /// Boot configuration.
    pub data: LaunchTemplateData,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// How a consumer refers to a launch template version.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum VersionRef {
    /// Whatever the latest version is at launch time.
    #[serde(rename = "$Latest")]
    Latest,
    /// The template's default version.
    #[serde(rename = "$Default")]
    Default,
    /// A pinned version number.
    #[serde(rename = "number")]
    Number(u64),
}

/// Reference from a consumer to a launch template.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TemplateRef {
    /// Launch template id.
    pub template_id: String,
    /// Version selector.
    pub version: VersionRef,
}

/// A machine image.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Image {
    /// Image id.
    pub id: String,
    /// Image name.
    pub name: String,
    /// Owner account.
    pub owner: String,
    /// CPU architecture.
    pub architecture: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Filter for image lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageFilter {
    /// Owner account.
    pub owner: String,
    /// Name pattern, `*` and `?` wildcards.
    pub name_pattern: String,
    /// CPU architecture.
    pub architecture: String,
}

/// Instance lifecycle states.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    /// Booting.
    Pending,
    /// Running.
    Running,
    /// Stopping.
    Stopping,
    /// Stopped.
    Stopped,
    /// Terminating.
    ShuttingDown,
    /// Terminated; kept visible for a while by the provider.
    Terminated,
}

/// A compute instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Instance {
    /// Instance id.
    pub id: String,
    /// Lifecycle state.
    pub state: InstanceState,
    /// Launch template the instance booted from.
    #[serde(default)]
    pub launch_template: Option<TemplateRef>,
    /// Tags.
    #[serde(default)]
    pub tags: Tags,
}

/// A network interface attached to an instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkInterface {
    /// Interface id.
    pub id: String,
    /// Owning instance.
    pub instance_id: String,
    /// Attached security groups.
    #[serde(default)]
    pub security_group_ids: BTreeSet<String>,
}

/// Filter for instance lookups.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceFilter {
    /// Only instances carrying this tag key/value.
    pub tag: Option<(String, String)>,
    /// Only instances launched from this template.
    pub launch_template_id: Option<String>,
    /// Include terminated instances.
    pub include_terminated: bool,
}

/// An autoscaling group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AutoScalingGroup {
    /// Group name.
    pub name: String,
    /// Launch template reference.
    pub launch_template: TemplateRef,
    /// Minimum size.
    pub min_size: u32,
    /// Maximum size.
    pub max_size: u32,
    /// Desired capacity.
    #[serde(default)]
    pub desired_capacity: Option<u32>,
    /// Subnets.
    #[serde(default)]
    pub subnet_ids: Vec<String>,
    /// Suspended scaling processes.
    #[serde(default)]
    pub suspended_processes: BTreeSet<String>,
    /// Member instances.
    #[serde(default)]
    pub instance_ids: Vec<String>,
    /// Creation time.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

/// Settings used to create or update a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSettings {
    /// Launch template reference.
    pub launch_template: TemplateRef,
    /// Minimum size.
    pub min_size: u32,
    /// Maximum size.
    pub max_size: u32,
    /// Desired capacity.
    pub desired_capacity: Option<u32>,
    /// Subnets.
    pub subnet_ids: Vec<String>,
}

/// Instance refresh statuses as reported by the provider.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ProviderRefreshStatus {
    /// Accepted, not started.
    Pending,
    /// Replacing instances.
    InProgress,
    /// Waiting out the bake time after replacement.
    Baking,
    /// Completed.
    Successful,
    /// Failed.
    Failed,
    /// Being cancelled.
    Cancelling,
    /// Cancelled.
    Cancelled,
    /// Rolling back.
    RollbackInProgress,
    /// Rollback failed.
    RollbackFailed,
    /// Rollback completed.
    RollbackSuccessful,
}

/// An instance refresh.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceRefresh {
    /// Refresh id.
    pub id: String,
    /// Group name.
    pub group: String,
    /// Provider status.
    pub status: ProviderRefreshStatus,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// Progress percentage.
    #[serde(default)]
    pub percentage_complete: u32,
    /// Provider explanation of the status.
    #[serde(default)]
    pub status_reason: Option<String>,
}

/// Preferences for starting an instance refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshPreferences {
    /// Minimum healthy percentage.
    pub min_healthy_percentage: u32,
    /// Instance warmup in seconds.
    pub instance_warmup_secs: Option<u32>,
}

/// Target a load-balanced instance is registered with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum LoadBalancerTarget {
    /// Classic load balancer, addressed by name.
    Classic {
        /// Load balancer name.
        name: String,
    },
    /// Target group, addressed by ARN.
    TargetGroup {
        /// Target group ARN.
        arn: String,
    },
}

/// A load balancer or target group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoadBalancer {
    /// Name.
    pub name: String,
    /// Kind.
    pub kind: TargetKind,
    /// ARN (target groups only).
    #[serde(default)]
    pub arn: Option<String>,
    /// Listener / target port.
    pub port: u16,
}

/// Health of a registered target.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TargetHealthState {
    /// Registration in progress.
    Initial,
    /// Passing health checks.
    Healthy,
    /// Failing health checks.
    Unhealthy,
    /// Deregistration in progress.
    Draining,
}

/// A registered target and its health.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TargetHealth {
    /// Instance id.
    pub instance_id: String,
    /// Health state.
    pub state: TargetHealthState,
}

/// A virtual network.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Vpc {
    /// VPC id.
    pub id: String,
    /// CIDR block.
    pub cidr: String,
    /// Tags.
    #[serde(default)]
    pub tags: Tags,
}

/// A security group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecurityGroup {
    /// Group id.
    pub id: String,
    /// Group name.
    pub name: String,
    /// Owning VPC.
    pub vpc_id: String,
    /// Description.
    #[serde(default)]
    pub description: String,
    /// Ingress rules.
    #[serde(default)]
    pub ingress: BTreeSet<IngressRule>,
    /// Tags.
    #[serde(default)]
    pub tags: Tags,
}

impl LoadBalancer {
    /// Returns the identifier used to tag this load balancer.
    #[must_use]
    pub fn resource_id(&self) -> &str {
        self.arn.as_deref().unwrap_or(&self.name)
    }

    /// Returns the registration target for this load balancer.
    #[must_use]
    pub fn target(&self) -> LoadBalancerTarget {
        match (self.kind, &self.arn) {
            (TargetKind::TargetGroup, Some(arn)) => LoadBalancerTarget::TargetGroup { arn: arn.clone() },
            _ => LoadBalancerTarget::Classic {
                name: self.name.clone(),
            },
        }
    }
}

impl InstanceState {
    /// Returns true if the instance can serve or is about to.
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    /// Returns true if the instance is gone or on its way out.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Terminated)
    }
}

impl ProviderRefreshStatus {
    /// Returns true while the provider still considers the refresh running.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(
            self,
            Self::Pending
                | Self::InProgress
                | Self::Baking
                | Self::Cancelling
                | Self::RollbackInProgress
        )
    }
}

impl TargetHealthState {
    /// Returns true if the target serves traffic.
    #[must_use]
    pub const fn is_serving(self) -> bool {
        matches!(self, Self::Healthy | Self::Initial)
    }
}

impl std::fmt::Display for LoadBalancerTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Classic { name } => write!(f, "classic/{name}"),
            Self::TargetGroup { arn } => write!(f, "{arn}"),
        }
    }
}

impl std::fmt::Display for VersionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Latest => write!(f, "$Latest"),
            Self::Default => write!(f, "$Default"),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::ShuttingDown => "shutting-down",
            Self::Terminated => "terminated",
        };
        write!(f, "{s}")
    }
}
