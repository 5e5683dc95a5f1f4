//! Capability traits, one per resource family.
//!
//! The wire-level client behind these traits is an external collaborator.
//! Implementations must report absence as `ProviderError::NotFound` (or
//! `Ok(None)` for `describe_*` lookups) and classify throttling as
//! `ProviderError::Throttled` so the retry layer can absorb it.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use std::collections::BTreeSet;

use crate::config::{IngressRule, TargetKind};
use crate::error::Result;
use crate::tags::Tags;

use super::types::{
    AutoScalingGroup, GroupSettings, Image, ImageFilter, Instance, InstanceFilter,
    InstanceRefresh, LaunchTemplate, LaunchTemplateData, LaunchTemplateVersion, LoadBalancer,
    LoadBalancerTarget, NetworkInterface, RefreshPreferences, SecurityGroup, TargetHealth, Vpc,
};

/// Launch templates and images.
#[async_trait]
pub trait LaunchTemplateApi: Send + Sync {
    /// Looks up a template by name.
    async fn describe_launch_template_by_name(&self, name: &str) -> Result<Option<LaunchTemplate>>;

    /// Looks up a template by id.
    async fn describe_launch_template(&self, template_id: &str) -> Result<Option<LaunchTemplate>>;

    /// Lists all versions of a template, oldest first.
    async fn describe_launch_template_versions(
        &self,
        template_id: &str,
    ) -> Result<Vec<LaunchTemplateVersion>>;

    /// Creates a template with its first version.
    async fn create_launch_template(
        &self,
        name: &str,
        data: &LaunchTemplateData,
        user_data: &[u8],
        tags: &Tags,
        client_token: &str,
    ) -> Result<LaunchTemplate>;

    /// Creates a new version; the provider allocates the number.
    async fn create_launch_template_version(
        &self,
        template_id: &str,
        data: &LaunchTemplateData,
        user_data: &[u8],
        client_token: &str,
    ) -> Result<LaunchTemplateVersion>;

    /// Makes `version` the template's default version.
    async fn modify_default_version(&self, template_id: &str, version: u64) -> Result<()>;

    /// Deletes the given versions.
    async fn delete_launch_template_versions(&self, template_id: &str, versions: &[u64])
        -> Result<()>;

    /// Deletes a template and all its versions.
    async fn delete_launch_template(&self, template_id: &str) -> Result<()>;

    /// Lists images matching a filter.
    async fn describe_images(&self, filter: &ImageFilter) -> Result<Vec<Image>>;
}

/// Compute instances.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InstanceApi: Send + Sync {
    /// Looks up an instance; `None` when the provider no longer knows it.
    async fn describe_instance(&self, instance_id: &str) -> Result<Option<Instance>>;

    /// Lists instances matching a filter.
    async fn describe_instances(&self, filter: &InstanceFilter) -> Result<Vec<Instance>>;

    /// Lists the network interfaces of an instance.
    ///
    /// Fails with `NotFound` if the instance does not exist or terminated.
    async fn describe_network_interfaces(&self, instance_id: &str)
        -> Result<Vec<NetworkInterface>>;

    /// Replaces the security groups attached to one network interface.
    async fn modify_network_interface_security_groups(
        &self,
        interface_id: &str,
        group_ids: &[String],
    ) -> Result<()>;
}

/// Autoscaling groups and instance refreshes.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AutoScalingApi: Send + Sync {
    /// Looks up a group by name.
    async fn describe_group(&self, name: &str) -> Result<Option<AutoScalingGroup>>;

    /// Lists groups booting from the given template.
    async fn describe_groups_using_template(&self, template_id: &str)
        -> Result<Vec<AutoScalingGroup>>;

    /// Creates a group.
    async fn create_group(
        &self,
        name: &str,
        settings: &GroupSettings,
        tags: &Tags,
    ) -> Result<AutoScalingGroup>;

    /// Updates sizing and template reference.
    async fn update_group(&self, name: &str, settings: &GroupSettings) -> Result<()>;

    /// Deletes a group and its instances without waiting.
    async fn delete_group(&self, name: &str) -> Result<()>;

    /// Suspends scaling processes.
    async fn suspend_processes(&self, name: &str, processes: &[String]) -> Result<()>;

    /// Resumes scaling processes.
    async fn resume_processes(&self, name: &str, processes: &[String]) -> Result<()>;

    /// Lists refreshes for a group, any status.
    async fn describe_instance_refreshes(&self, name: &str) -> Result<Vec<InstanceRefresh>>;

    /// Starts a refresh. Fails with `RefreshInProgress` if one is running.
    async fn start_instance_refresh(
        &self,
        name: &str,
        preferences: &RefreshPreferences,
    ) -> Result<String>;
}

/// Load balancers and target registration.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LoadBalancerApi: Send + Sync {
    /// Looks up a load balancer or target group by name.
    async fn describe_load_balancer(&self, name: &str, kind: TargetKind)
        -> Result<Option<LoadBalancer>>;

    /// Creates a load balancer or target group.
    async fn create_load_balancer(
        &self,
        name: &str,
        kind: TargetKind,
        port: u16,
        tags: &Tags,
    ) -> Result<LoadBalancer>;

    /// Deletes a load balancer or target group.
    async fn delete_load_balancer(&self, name: &str, kind: TargetKind) -> Result<()>;

    /// Lists registered targets with their health.
    async fn describe_target_health(&self, target: &LoadBalancerTarget)
        -> Result<Vec<TargetHealth>>;

    /// Registers instances.
    async fn register_instances(&self, target: &LoadBalancerTarget, instance_ids: &[String])
        -> Result<()>;

    /// Deregisters instances.
    async fn deregister_instances(
        &self,
        target: &LoadBalancerTarget,
        instance_ids: &[String],
    ) -> Result<()>;
}

/// VPCs and security groups.
#[async_trait]
pub trait NetworkApi: Send + Sync {
    /// Finds the VPC carrying the given tag.
    async fn describe_vpc_by_tag(&self, key: &str, value: &str) -> Result<Option<Vpc>>;

    /// Creates a VPC.
    async fn create_vpc(&self, cidr: &str, tags: &Tags) -> Result<Vpc>;

    /// Deletes a VPC. Fails with a conflict while dependents remain.
    async fn delete_vpc(&self, vpc_id: &str) -> Result<()>;

    /// Lists security groups of a VPC.
    async fn describe_security_groups(&self, vpc_id: &str) -> Result<Vec<SecurityGroup>>;

    /// Creates a security group.
    async fn create_security_group(
        &self,
        vpc_id: &str,
        name: &str,
        description: &str,
        tags: &Tags,
    ) -> Result<SecurityGroup>;

    /// Adds ingress rules.
    async fn authorize_ingress(&self, group_id: &str, rules: &[IngressRule]) -> Result<()>;

    /// Removes ingress rules.
    async fn revoke_ingress(&self, group_id: &str, rules: &[IngressRule]) -> Result<()>;

    /// Deletes a security group.
    async fn delete_security_group(&self, group_id: &str) -> Result<()>;
}

/// Resource tags.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TaggingApi: Send + Sync {
    /// Returns the tags of a resource.
    async fn describe_tags(&self, resource_id: &str) -> Result<Tags>;

    /// Creates or overwrites tags.
    async fn create_tags(&self, resource_id: &str, tags: &Tags) -> Result<()>;

    /// Removes tag keys.
    async fn delete_tags(&self, resource_id: &str, keys: &BTreeSet<String>) -> Result<()>;
}

/// Object storage buckets.
#[async_trait]
pub trait ObjectStoreApi: Send + Sync {
    /// Returns true if the bucket exists and is accessible.
    async fn bucket_exists(&self, bucket: &str) -> Result<bool>;

    /// Creates a bucket.
    async fn create_bucket(&self, bucket: &str) -> Result<()>;

    /// Deletes an empty bucket.
    async fn delete_bucket(&self, bucket: &str) -> Result<()>;

    /// Lists object keys under a prefix.
    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>>;

    /// Writes an object.
    async fn put_object(&self, bucket: &str, key: &str, data: &[u8]) -> Result<()>;

    /// Deletes an object; absent objects are not an error.
    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()>;
}

/// Secret storage.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretsApi: Send + Sync {
    /// Creates a secret. Fails with `AlreadyExists` if the name is taken.
    async fn create_secret(&self, name: &str, value: &[u8], tags: &Tags) -> Result<()>;

    /// Overwrites the value of an existing secret.
    async fn put_secret_value(&self, name: &str, value: &[u8]) -> Result<()>;

    /// Lists secret names starting with `prefix`.
    async fn list_secrets(&self, prefix: &str) -> Result<Vec<String>>;

    /// Deletes a secret without a recovery window.
    async fn delete_secret(&self, name: &str) -> Result<()>;
}
