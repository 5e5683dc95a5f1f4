//! Configuration specification types for the convergence engine.
//!
//! This module defines the structs that map to `infra-converge.yaml`. They
//! describe the desired state only; everything observed comes from the
//! provider on each pass.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::tags::Tags;

/// The root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConvergeConfig {
    /// Cluster identity and tagging policy.
    pub cluster: ClusterConfig,
    /// Provider backend configuration.
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Cluster network.
    #[serde(default)]
    pub network: Option<NetworkConfig>,
    /// API-server load balancer.
    #[serde(default)]
    pub load_balancer: Option<LoadBalancerConfig>,
    /// Bucket used for bootstrap payloads.
    #[serde(default)]
    pub object_store: Option<ObjectStoreConfig>,
    /// Launch templates to keep converged.
    #[serde(default)]
    pub launch_templates: Vec<LaunchTemplateSpec>,
    /// Machine pools (autoscaling groups).
    #[serde(default)]
    pub machine_pools: Vec<MachinePoolConfig>,
    /// Control-plane instance discovery.
    #[serde(default)]
    pub control_plane: ControlPlaneConfig,
    /// Launch template version retention.
    #[serde(default)]
    pub retention: RetentionPolicy,
    /// Retry policy for provider calls.
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Cluster-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterConfig {
    /// Cluster name, used in ownership tags.
    pub name: String,
    /// Provider region.
    #[serde(default)]
    pub region: Option<String>,
    /// Tags added to every resource the engine manages.
    #[serde(default)]
    pub additional_tags: Tags,
    /// Tag keys owned by other systems; never removed during tag sync.
    #[serde(default)]
    pub externally_managed_tags: Vec<String>,
}

/// Provider backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Snapshot file backing the simulated compute provider.
    #[serde(default = "default_snapshot_path")]
    pub snapshot: PathBuf,

    /// Custom service endpoints passed to bootstrap scripts.
    #[serde(default)]
    pub endpoints: Vec<ServiceEndpoint>,
}

/// A custom endpoint for one provider service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceEndpoint {
    /// Service identifier, e.g. `secretsmanager`.
    pub service_id: String,
    /// Endpoint URL.
    pub url: String,
    /// Region used to sign requests.
    pub signing_region: String,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkConfig {
    /// VPC CIDR block.
    pub cidr: String,
    /// Security groups to keep converged inside the VPC.
    #[serde(default)]
    pub security_groups: Vec<SecurityGroupSpec>,
}

/// Desired security group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecurityGroupSpec {
    /// Group name, unique within the VPC.
    pub name: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Ingress rules.
    #[serde(default)]
    pub ingress: Vec<IngressRule>,
}

/// A single ingress permission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IngressRule {
    /// Protocol (`tcp`, `udp`, `icmp` or `-1` for all).
    pub protocol: String,
    /// First port of the range.
    pub from_port: i32,
    /// Last port of the range.
    pub to_port: i32,
    /// Source CIDR block.
    pub cidr: String,
}

/// API-server load balancer configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoadBalancerConfig {
    /// Load balancer (classic) or target group name.
    pub name: String,
    /// Which registration API the target uses.
    #[serde(default)]
    pub kind: TargetKind,
    /// Listener / target port.
    #[serde(default = "default_api_server_port")]
    pub port: u16,
}

/// Load balancer target kinds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TargetKind {
    /// Classic load balancer, instances registered directly.
    Classic,
    /// Target-group based load balancer.
    #[default]
    TargetGroup,
}

/// Object store configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObjectStoreConfig {
    /// Backend serving the bucket.
    #[serde(default)]
    pub backend: ObjectStoreBackend,
    /// Bucket name.
    pub bucket: String,
    /// Key prefix for bootstrap payloads.
    #[serde(default)]
    pub prefix: Option<String>,
    /// Bucket region (defaults to the cluster region).
    #[serde(default)]
    pub region: Option<String>,
}

/// Object store backends.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ObjectStoreBackend {
    /// Buckets kept in the simulated provider snapshot.
    #[default]
    Simulated,
    /// AWS S3.
    S3,
}

/// Desired launch template.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LaunchTemplateSpec {
    /// Launch template name.
    pub name: String,
    /// Instance type, e.g. `m5.large`.
    pub instance_type: String,
    /// Boot image selection.
    #[serde(default)]
    pub image: ImageSpec,
    /// Security group ids attached to instances.
    #[serde(default)]
    pub security_group_ids: Vec<String>,
    /// Inline user data.
    #[serde(default)]
    pub user_data: Option<String>,
    /// File holding the user data (relative to the config file).
    #[serde(default)]
    pub user_data_file: Option<PathBuf>,
    /// IAM instance profile name.
    #[serde(default)]
    pub iam_instance_profile: Option<String>,
    /// SSH key pair name.
    #[serde(default)]
    pub ssh_key_name: Option<String>,
    /// Root volume settings.
    #[serde(default)]
    pub root_volume: Option<RootVolume>,
    /// Instance metadata service settings.
    #[serde(default)]
    pub metadata_options: Option<MetadataOptions>,
    /// Spot maximum price; unset means on-demand.
    #[serde(default)]
    pub spot_max_price: Option<String>,
    /// Role tag value for the template.
    #[serde(default = "default_template_role")]
    pub role: String,
    /// Template-specific tags.
    #[serde(default)]
    pub tags: Tags,
}

/// Image selection: an explicit id or a lookup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ImageSpec {
    /// Explicit image id.
    #[serde(default)]
    pub id: Option<String>,
    /// Lookup parameters used when no id is given.
    #[serde(default)]
    pub lookup: Option<ImageLookup>,
}

/// Parameters for default image discovery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageLookup {
    /// Image owner account.
    #[serde(default = "default_image_owner")]
    pub owner: String,
    /// Image name prefix.
    #[serde(default = "default_image_prefix")]
    pub name_prefix: String,
    /// Base operating system, e.g. `ubuntu-22.04`.
    pub base_os: String,
    /// Kubernetes version baked into the image.
    pub k8s_version: String,
    /// CPU architecture.
    #[serde(default = "default_architecture")]
    pub architecture: String,
}

/// Root volume settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RootVolume {
    /// Size in GiB; `0` means the image default.
    #[serde(default)]
    pub size_gib: u32,
    /// Volume type; unset means the provider default.
    #[serde(default)]
    pub volume_type: Option<String>,
    /// Encryption flag; unset means the account default.
    #[serde(default)]
    pub encrypted: Option<bool>,
}

/// Instance metadata service options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MetadataOptions {
    /// Session token requirement.
    #[serde(default)]
    pub http_tokens: HttpTokens,
    /// PUT response hop limit.
    #[serde(default = "default_hop_limit")]
    pub hop_limit: u32,
    /// Whether the metadata endpoint is enabled.
    #[serde(default = "default_true")]
    pub http_endpoint: bool,
}

/// Metadata session token requirement.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum HttpTokens {
    /// Tokens optional (provider default).
    #[default]
    Optional,
    /// Tokens required (IMDSv2 only).
    Required,
}

/// Machine pool (autoscaling group) configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MachinePoolConfig {
    /// Group name.
    pub name: String,
    /// Name of the launch template the group boots from.
    pub launch_template: String,
    /// Minimum group size.
    pub min_size: u32,
    /// Maximum group size.
    pub max_size: u32,
    /// Desired capacity; unset leaves scaling to the provider.
    #[serde(default)]
    pub desired_capacity: Option<u32>,
    /// Subnets the group spans.
    #[serde(default)]
    pub subnet_ids: Vec<String>,
    /// Instance refresh preferences.
    #[serde(default)]
    pub refresh: RefreshConfig,
    /// Scaling processes that must stay suspended.
    #[serde(default)]
    pub suspended_processes: Vec<String>,
    /// Group-specific tags.
    #[serde(default)]
    pub tags: Tags,
}

/// Instance refresh preferences.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RefreshConfig {
    /// Roll instances after a launch template change.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Minimum healthy percentage during the refresh.
    #[serde(default = "default_min_healthy")]
    pub min_healthy_percentage: u32,
    /// Seconds a new instance needs before it counts as healthy.
    #[serde(default)]
    pub instance_warmup_secs: Option<u32>,
}

/// Control-plane instance discovery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ControlPlaneConfig {
    /// Value of the role tag carried by control-plane instances.
    #[serde(default = "default_control_plane_role")]
    pub role: String,
}

/// Launch template version retention.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Number of newest versions always kept.
    #[serde(default = "default_keep_latest")]
    pub keep_latest: usize,
}

/// Retry policy for transient provider failures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Maximum attempts per call, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First backoff delay in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Backoff ceiling in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Backoff multiplier.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_snapshot_path() -> PathBuf {
    PathBuf::from(".infra-converge/provider.json")
}

const fn default_api_server_port() -> u16 {
    6443
}

fn default_template_role() -> String {
    String::from("node")
}

fn default_control_plane_role() -> String {
    String::from("control-plane")
}

fn default_image_owner() -> String {
    String::from("258751437250")
}

fn default_image_prefix() -> String {
    String::from("capa-ami")
}

fn default_architecture() -> String {
    String::from("x86_64")
}

const fn default_hop_limit() -> u32 {
    1
}

const fn default_true() -> bool {
    true
}

const fn default_min_healthy() -> u32 {
    90
}

const fn default_keep_latest() -> usize {
    2
}

const fn default_max_attempts() -> u32 {
    5
}

const fn default_initial_delay_ms() -> u64 {
    200
}

const fn default_max_delay_ms() -> u64 {
    20_000
}

const fn default_multiplier() -> f64 {
    2.0
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            snapshot: default_snapshot_path(),
            endpoints: Vec::new(),
        }
    }
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_healthy_percentage: default_min_healthy(),
            instance_warmup_secs: None,
        }
    }
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            role: default_control_plane_role(),
        }
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            keep_latest: default_keep_latest(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl Default for MetadataOptions {
    fn default() -> Self {
        Self {
            http_tokens: HttpTokens::Optional,
            hop_limit: default_hop_limit(),
            http_endpoint: true,
        }
    }
}

impl ConvergeConfig {
    /// Finds a launch template spec by name.
    #[must_use]
    pub fn launch_template(&self, name: &str) -> Option<&LaunchTemplateSpec> {
        self.launch_templates.iter().find(|t| t.name == name)
    }

    /// Finds a machine pool by name.
    #[must_use]
    pub fn machine_pool(&self, name: &str) -> Option<&MachinePoolConfig> {
        self.machine_pools.iter().find(|p| p.name == name)
    }
}

impl std::fmt::Display for TargetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Classic => write!(f, "classic"),
            Self::TargetGroup => write!(f, "target-group"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retention_default() {
        assert_eq!(RetentionPolicy::default().keep_latest, 2);
    }

    #[test]
    fn test_target_kind_serde() {
        let kind: TargetKind = serde_yaml::from_str("classic").expect("parse");
        assert_eq!(kind, TargetKind::Classic);
        assert_eq!(TargetKind::TargetGroup.to_string(), "target-group");
    }

    #[test]
    fn test_metadata_defaults() {
        let opts: MetadataOptions = serde_yaml::from_str("http_tokens: required").expect("parse");
        assert_eq!(opts.http_tokens, HttpTokens::Required);
        assert_eq!(opts.hop_limit, 1);
        assert!(opts.http_endpoint);
    }
}
