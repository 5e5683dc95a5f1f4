//! Provider capabilities.
//!
//! This module contains:
//! - One async trait per resource family
//! - Observed resource types
//! - Bounded retry for throttled and transient calls
//! - A file-backed simulated provider and an S3 object store

mod api;
pub mod retry;
mod s3;
mod simulated;
mod types;

use std::sync::Arc;

pub use api::{
    AutoScalingApi, InstanceApi, LaunchTemplateApi, LoadBalancerApi, NetworkApi, ObjectStoreApi,
    SecretsApi, TaggingApi,
};
#[cfg(test)]
pub use api::{
    MockAutoScalingApi, MockInstanceApi, MockLoadBalancerApi, MockSecretsApi, MockTaggingApi,
};
pub use retry::RetryPolicy;
pub use s3::S3ObjectStore;
pub use simulated::{SimulatedProvider, SimulatedState, StateHook};
pub use types::{
    AutoScalingGroup, GroupSettings, Image, ImageFilter, Instance, InstanceFilter,
    InstanceRefresh, InstanceState, LaunchTemplate, LaunchTemplateData, LaunchTemplateVersion,
    LoadBalancer, LoadBalancerTarget, NetworkInterface, ProviderRefreshStatus,
    RefreshPreferences, SecurityGroup, TargetHealth, TargetHealthState, TemplateRef, VersionRef,
    Vpc,
};

/// Handles to every provider capability used by the engine.
#[derive(Clone)]
pub struct ProviderClients {
    /// Launch templates and images.
    pub launch_templates: Arc<dyn LaunchTemplateApi>,
    /// Instances.
    pub instances: Arc<dyn InstanceApi>,
    /// Autoscaling groups and refreshes.
    pub autoscaling: Arc<dyn AutoScalingApi>,
    /// Load balancers.
    pub load_balancers: Arc<dyn LoadBalancerApi>,
    /// VPCs and security groups.
    pub network: Arc<dyn NetworkApi>,
    /// Resource tags.
    pub tagging: Arc<dyn TaggingApi>,
    /// Object storage.
    pub object_store: Arc<dyn ObjectStoreApi>,
    /// Secret storage.
    pub secrets: Arc<dyn SecretsApi>,
    /// Retry policy applied at each call.
    pub retry: RetryPolicy,
}

impl ProviderClients {
    /// Serves every capability from one simulated provider.
    #[must_use]
    pub fn simulated(provider: Arc<SimulatedProvider>) -> Self {
        Self {
            launch_templates: provider.clone(),
            instances: provider.clone(),
            autoscaling: provider.clone(),
            load_balancers: provider.clone(),
            network: provider.clone(),
            tagging: provider.clone(),
            secrets: provider.clone(),
            object_store: provider,
            retry: RetryPolicy::default(),
        }
    }

    /// Replaces the object store backend.
    #[must_use]
    pub fn with_object_store(mut self, store: Arc<dyn ObjectStoreApi>) -> Self {
        self.object_store = store;
        self
    }

    /// Replaces the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

impl std::fmt::Debug for ProviderClients {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderClients")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}
