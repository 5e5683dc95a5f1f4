//! Reconciler for maintaining desired state.
//!
//! This module sequences the convergence components for one cluster. Every
//! pass reads provider state fresh, converges resources in dependency order
//! and records a per-resource outcome. A failing resource does not stop the
//! pass; its error is collected together with its class.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info};

use crate::autoscaling::{
    AutoScalingGroupPair, InstanceRefreshCoordinator, InstanceRefreshHooks, ProcessChanges,
};
use crate::config::{ConfigParser, ConvergeConfig, LaunchTemplateSpec, MachinePoolConfig};
use crate::context::{ReconcileContext, ROLE_TAG};
use crate::convergence::{
    BucketPair, ConvergenceOutcome, IngressDiff, NetworkPair, ResourceConvergencePair,
    ResourceKind, SecurityGroupPair,
};
use crate::error::{ConfigError, ConvergeError, ErrorClass, ProviderError, Result};
use crate::launch_template::{
    drift_fields, LaunchTemplateHooks, LaunchTemplateManager, LaunchTemplateOutcome, NoHooks,
};
use crate::loadbalancer::{LoadBalancerPair, RegistrationOutcome, RegistrationStateMachine};
use crate::provider::{InstanceFilter, InstanceState, LoadBalancerTarget, ProviderClients};
use crate::tags::{ResourceTagUpdate, TagReconciler};

/// Reconciler for one cluster configuration.
pub struct Reconciler<'a> {
    /// Desired state.
    config: &'a ConvergeConfig,
    /// Provider capabilities.
    clients: &'a ProviderClients,
    /// Reads user data files relative to the configuration.
    parser: ConfigParser,
    /// Launch template lifecycle.
    templates: LaunchTemplateManager,
    /// Instance refresh coordination.
    refreshes: InstanceRefreshCoordinator,
    /// Load balancer registration.
    registration: RegistrationStateMachine,
    /// Tag convergence.
    tags: TagReconciler,
}

/// Outcome of one resource in a pass.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceResult {
    /// Resource kind.
    pub kind: ResourceKind,
    /// Resource name.
    pub name: String,
    /// What the pass did.
    pub outcome: ConvergenceOutcome,
    /// Extra detail, e.g. the launch template version.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Outcome of one registration change.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrationResult {
    /// Instance id.
    pub instance_id: String,
    /// What the state machine did.
    pub outcome: RegistrationOutcome,
}

/// A resource that failed to converge.
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileFailure {
    /// Resource kind.
    pub kind: ResourceKind,
    /// Resource name or id.
    pub name: String,
    /// Error class.
    pub class: ErrorClass,
    /// Error message.
    pub message: String,
}

/// Result of a reconciliation run.
#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationResult {
    /// Whether every resource converged.
    pub success: bool,
    /// Number of resources created.
    pub created: usize,
    /// Number of resources updated.
    pub updated: usize,
    /// Number of resources deleted.
    pub deleted: usize,
    /// Number of resources unchanged or already absent.
    pub unchanged: usize,
    /// Per-resource outcomes.
    pub resources: Vec<ResourceResult>,
    /// Load balancer registration changes.
    pub registrations: Vec<RegistrationResult>,
    /// Errors encountered.
    pub errors: Vec<ReconcileFailure>,
}

impl Default for ReconciliationResult {
    fn default() -> Self {
        Self {
            success: true,
            created: 0,
            updated: 0,
            deleted: 0,
            unchanged: 0,
            resources: Vec::new(),
            registrations: Vec::new(),
            errors: Vec::new(),
        }
    }
}

impl ReconciliationResult {
    fn record(
        &mut self,
        kind: ResourceKind,
        name: &str,
        outcome: ConvergenceOutcome,
        detail: Option<String>,
    ) {
        match outcome {
            ConvergenceOutcome::Created => self.created += 1,
            ConvergenceOutcome::Updated => self.updated += 1,
            ConvergenceOutcome::Deleted => self.deleted += 1,
            ConvergenceOutcome::Unchanged | ConvergenceOutcome::AlreadyAbsent => {
                self.unchanged += 1;
            }
        }
        self.resources.push(ResourceResult {
            kind,
            name: name.to_string(),
            outcome,
            detail,
        });
    }

    fn fail(&mut self, kind: ResourceKind, name: &str, err: &ConvergeError) {
        error!(kind = %kind, name = %name, class = ?err.class(), error = %err, "Resource failed to converge");
        self.success = false;
        self.errors.push(ReconcileFailure {
            kind,
            name: name.to_string(),
            class: err.class(),
            message: err.to_string(),
        });
    }

    /// Folds another pass into this one.
    pub fn absorb(&mut self, other: Self) {
        self.success &= other.success;
        self.created += other.created;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.unchanged += other.unchanged;
        self.resources.extend(other.resources);
        self.registrations.extend(other.registrations);
        self.errors.extend(other.errors);
    }

    /// Returns true if the pass changed provider state.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.created + self.updated + self.deleted > 0
            || self.registrations.iter().any(|r| r.outcome.changed())
    }
}

/// One drifted resource.
#[derive(Debug, Clone, Serialize)]
pub struct DriftEntry {
    /// Resource kind.
    pub kind: ResourceKind,
    /// Resource name.
    pub name: String,
    /// What differs.
    pub reason: String,
}

/// Report of drift detection.
#[derive(Debug, Clone, Serialize)]
pub struct DriftReport {
    /// Whether drift was detected.
    pub has_drift: bool,
    /// Resources that have drifted.
    pub drifted_resources: Vec<DriftEntry>,
    /// Total number of resources in config.
    pub total_resources: usize,
    /// Number of those resources that exist at the provider.
    pub observed_count: usize,
}

impl DriftReport {
    /// Returns true if the state is converged (no drift).
    #[must_use]
    pub const fn is_converged(&self) -> bool {
        !self.has_drift
    }
}

fn missing(kind: ResourceKind, name: &str) -> DriftEntry {
    DriftEntry {
        kind,
        name: name.to_string(),
        reason: String::from("missing"),
    }
}

impl<'a> Reconciler<'a> {
    /// Creates a new reconciler.
    #[must_use]
    pub fn new(config: &'a ConvergeConfig, clients: &'a ProviderClients) -> Self {
        Self {
            config,
            clients,
            parser: ConfigParser::new(),
            templates: LaunchTemplateManager::new(clients, config.retention),
            refreshes: InstanceRefreshCoordinator::from_clients(clients),
            registration: RegistrationStateMachine::from_clients(clients),
            tags: TagReconciler::new(Arc::clone(&clients.tagging), clients.retry.clone()),
        }
    }

    /// Uses the given parser to read user data files.
    #[must_use]
    pub fn with_parser(mut self, parser: ConfigParser) -> Self {
        self.parser = parser;
        self
    }

    /// Builds the reconcile context from the cluster section.
    #[must_use]
    pub fn context(&self) -> ReconcileContext {
        ReconcileContext::from_config(&self.config.cluster)
    }

    /// Returns the launch template manager.
    #[must_use]
    pub const fn templates(&self) -> &LaunchTemplateManager {
        &self.templates
    }

    /// Returns the instance refresh coordinator.
    #[must_use]
    pub const fn refreshes(&self) -> &InstanceRefreshCoordinator {
        &self.refreshes
    }

    /// Returns the registration state machine.
    #[must_use]
    pub const fn registration(&self) -> &RegistrationStateMachine {
        &self.registration
    }

    /// Returns the tag reconciler.
    #[must_use]
    pub const fn tags(&self) -> &TagReconciler {
        &self.tags
    }

    fn network_pair(&self, ctx: &ReconcileContext) -> Option<NetworkPair> {
        self.config
            .network
            .as_ref()
            .map(|n| NetworkPair::new(self.clients, n.clone(), format!("{}-vpc", ctx.cluster)))
    }

    fn security_group_pairs(&self) -> Vec<SecurityGroupPair> {
        self.config
            .network
            .iter()
            .flat_map(|n| n.security_groups.iter())
            .map(|spec| SecurityGroupPair::new(self.clients, spec.clone()))
            .collect()
    }

    fn load_balancer_pair(&self) -> Option<LoadBalancerPair> {
        self.config
            .load_balancer
            .as_ref()
            .map(|lb| LoadBalancerPair::new(self.clients, lb.clone()))
    }

    fn bucket_pair(&self) -> Option<BucketPair> {
        self.config.object_store.as_ref().map(|store| {
            BucketPair::new(
                Arc::clone(&self.clients.object_store),
                self.clients.retry.clone(),
                store.clone(),
            )
        })
    }

    /// Cluster-scoped pairs in creation order.
    fn cluster_pairs(&self, ctx: &ReconcileContext) -> Vec<Box<dyn ResourceConvergencePair>> {
        let mut pairs: Vec<Box<dyn ResourceConvergencePair>> = Vec::new();
        if let Some(network) = self.network_pair(ctx) {
            pairs.push(Box::new(network));
        }
        for group in self.security_group_pairs() {
            pairs.push(Box::new(group));
        }
        if let Some(lb) = self.load_balancer_pair() {
            pairs.push(Box::new(lb));
        }
        if let Some(bucket) = self.bucket_pair() {
            pairs.push(Box::new(bucket));
        }
        pairs
    }

    async fn converge(
        pair: &dyn ResourceConvergencePair,
        ctx: &ReconcileContext,
        result: &mut ReconciliationResult,
    ) -> bool {
        match pair.reconcile(ctx).await {
            Ok(outcome) => {
                result.record(pair.kind(), pair.name(), outcome, None);
                true
            }
            Err(err) => {
                result.fail(pair.kind(), pair.name(), &err);
                false
            }
        }
    }

    async fn remove(
        pair: &dyn ResourceConvergencePair,
        ctx: &ReconcileContext,
        result: &mut ReconciliationResult,
    ) {
        match pair.delete(ctx).await {
            Ok(outcome) => result.record(pair.kind(), pair.name(), outcome, None),
            Err(err) => result.fail(pair.kind(), pair.name(), &err),
        }
    }

    /// Performs a full reconciliation: cluster resources, then launch
    /// templates without a pool, then every machine pool.
    pub async fn reconcile(&self, ctx: &ReconcileContext) -> ReconciliationResult {
        info!(cluster = %ctx.cluster, "Starting reconciliation");

        let mut result = self.reconcile_cluster(ctx).await;
        result.absorb(self.reconcile_standalone_templates(ctx).await);
        for pool in &self.config.machine_pools {
            result.absorb(self.reconcile_machine_pool(ctx, pool).await);
        }

        info!(
            cluster = %ctx.cluster,
            created = result.created,
            updated = result.updated,
            unchanged = result.unchanged,
            errors = result.errors.len(),
            "Reconciliation finished"
        );
        result
    }

    /// Converges network, security groups, the API-server load balancer and
    /// the bucket, then control-plane registration.
    pub async fn reconcile_cluster(&self, ctx: &ReconcileContext) -> ReconciliationResult {
        let mut result = ReconciliationResult::default();

        for pair in self.cluster_pairs(ctx) {
            Self::converge(pair.as_ref(), ctx, &mut result).await;
        }

        result.absorb(self.reconcile_control_plane_registration(ctx).await);
        result
    }

    /// Converges launch templates that no machine pool boots from.
    pub async fn reconcile_standalone_templates(&self, ctx: &ReconcileContext) -> ReconciliationResult {
        let mut result = ReconciliationResult::default();
        let pooled: BTreeSet<&str> = self
            .config
            .machine_pools
            .iter()
            .map(|p| p.launch_template.as_str())
            .collect();

        for spec in self
            .config
            .launch_templates
            .iter()
            .filter(|t| !pooled.contains(t.name.as_str()))
        {
            self.converge_template(ctx, spec, &NoHooks, &mut result).await;
        }
        result
    }

    /// Converges one machine pool: launch template (rolling the group onto
    /// new versions), template tags, the group, then suspended processes.
    pub async fn reconcile_machine_pool(
        &self,
        ctx: &ReconcileContext,
        pool: &MachinePoolConfig,
    ) -> ReconciliationResult {
        let mut result = ReconciliationResult::default();
        info!(pool = %pool.name, template = %pool.launch_template, "Reconciling machine pool");

        let Some(spec) = self.config.launch_template(&pool.launch_template) else {
            let err = ConvergeError::from(ConfigError::UnknownReference {
                resource_type: String::from("launch template"),
                name: pool.launch_template.clone(),
            });
            result.fail(ResourceKind::LaunchTemplate, &pool.launch_template, &err);
            return result;
        };

        let hooks = InstanceRefreshHooks::new(
            self.refreshes.clone(),
            pool.name.clone(),
            pool.refresh.clone(),
        );
        let Some(template_id) = self.converge_template(ctx, spec, &hooks, &mut result).await else {
            return result;
        };

        let group = AutoScalingGroupPair::new(self.clients, pool.clone(), template_id);
        if !Self::converge(&group, ctx, &mut result).await {
            return result;
        }

        let desired: BTreeSet<String> = pool.suspended_processes.iter().cloned().collect();
        match group.reconcile_suspended_processes(&desired).await {
            Ok(changes) if changes.is_empty() => {}
            Ok(ProcessChanges { suspended, resumed }) => result.record(
                ResourceKind::AutoScalingGroup,
                &pool.name,
                ConvergenceOutcome::Updated,
                Some(format!("suspended {suspended:?}, resumed {resumed:?}")),
            ),
            Err(err) => result.fail(ResourceKind::AutoScalingGroup, &pool.name, &err),
        }

        result
    }

    async fn converge_template(
        &self,
        ctx: &ReconcileContext,
        spec: &LaunchTemplateSpec,
        hooks: &dyn LaunchTemplateHooks,
        result: &mut ReconciliationResult,
    ) -> Option<String> {
        let user_data = match self.parser.read_user_data(spec) {
            Ok(data) => data,
            Err(err) => {
                result.fail(ResourceKind::LaunchTemplate, &spec.name, &err);
                return None;
            }
        };

        let outcome = match self
            .templates
            .reconcile_launch_template(ctx, spec, &user_data, hooks)
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                result.fail(ResourceKind::LaunchTemplate, &spec.name, &err);
                return None;
            }
        };
        let template_id = outcome.template_id().to_string();

        let mut converged = match outcome {
            LaunchTemplateOutcome::Created { .. } => ConvergenceOutcome::Created,
            LaunchTemplateOutcome::Updated { .. } | LaunchTemplateOutcome::Resumed { .. } => {
                ConvergenceOutcome::Updated
            }
            LaunchTemplateOutcome::Unchanged { .. } | LaunchTemplateOutcome::Deferred { .. } => {
                ConvergenceOutcome::Unchanged
            }
        };

        // Created templates carry their tags from the create call.
        if converged != ConvergenceOutcome::Created {
            match self.sync_template_tags(ctx, spec, &template_id).await {
                Ok(true) => converged = converged.merge(ConvergenceOutcome::Updated),
                Ok(false) => {}
                Err(err) => result.fail(ResourceKind::LaunchTemplate, &spec.name, &err),
            }
        }

        result.record(
            ResourceKind::LaunchTemplate,
            &spec.name,
            converged,
            Some(outcome.to_string()),
        );
        Some(template_id)
    }

    async fn sync_template_tags(
        &self,
        ctx: &ReconcileContext,
        spec: &LaunchTemplateSpec,
        template_id: &str,
    ) -> Result<bool> {
        let report = self
            .tags
            .reconcile_tags(
                ctx,
                &[ResourceTagUpdate {
                    resource_id: template_id.to_string(),
                    desired: ctx.owned_tags(&spec.role, &spec.name, &spec.tags),
                }],
            )
            .await?;
        Ok(!report.updated.is_empty())
    }

    /// Returns the API-server registration target.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no load balancer is configured or it does not
    /// exist yet, or any provider error.
    pub async fn api_server_target(&self) -> Result<LoadBalancerTarget> {
        let pair = self.load_balancer_pair().ok_or_else(|| {
            ConvergeError::from(ConfigError::ValidationError {
                message: String::from("No load balancer configured"),
                field: Some(String::from("load_balancer")),
            })
        })?;
        pair.find()
            .await?
            .map(|lb| lb.target())
            .ok_or_else(|| ProviderError::not_found("load balancer", pair.name()).into())
    }

    /// Registers running control-plane instances with the API-server load
    /// balancer and deregisters stopping or terminated ones, one instance
    /// at a time.
    pub async fn reconcile_control_plane_registration(
        &self,
        ctx: &ReconcileContext,
    ) -> ReconciliationResult {
        let mut result = ReconciliationResult::default();
        let Some(lb_name) = self.config.load_balancer.as_ref().map(|lb| lb.name.clone()) else {
            debug!("No load balancer configured, skipping registration");
            return result;
        };

        let target = match self.api_server_target().await {
            Ok(target) => target,
            Err(err) => {
                result.fail(ResourceKind::LoadBalancer, &lb_name, &err);
                return result;
            }
        };

        let filter = InstanceFilter {
            tag: Some((ROLE_TAG.to_string(), self.config.control_plane.role.clone())),
            include_terminated: true,
            ..InstanceFilter::default()
        };
        let instances = match self
            .clients
            .retry
            .run("DescribeInstances", || {
                self.clients.instances.describe_instances(&filter)
            })
            .await
        {
            Ok(instances) => instances,
            Err(err) => {
                result.fail(ResourceKind::LoadBalancer, &lb_name, &err);
                return result;
            }
        };

        for instance in instances.iter().filter(|i| ctx.is_owned(&i.tags)) {
            let outcome = match instance.state {
                InstanceState::Running => self.registration.register(&instance.id, &target).await,
                InstanceState::Pending => {
                    debug!(instance_id = %instance.id, "Control-plane instance still pending");
                    continue;
                }
                InstanceState::Stopping
                | InstanceState::Stopped
                | InstanceState::ShuttingDown
                | InstanceState::Terminated => {
                    self.registration.deregister(&instance.id, &target).await
                }
            };
            match outcome {
                Ok(outcome) => result.registrations.push(RegistrationResult {
                    instance_id: instance.id.clone(),
                    outcome,
                }),
                Err(err) => result.fail(ResourceKind::LoadBalancer, &instance.id, &err),
            }
        }

        result
    }

    /// Checks for drift without applying changes.
    ///
    /// # Errors
    ///
    /// Returns an error if a provider read, image discovery or a user data
    /// file fails.
    pub async fn check_drift(&self, ctx: &ReconcileContext) -> Result<DriftReport> {
        info!(cluster = %ctx.cluster, "Checking for drift");

        let mut drifted = Vec::new();
        let mut total = 0;
        let mut observed = 0;

        if let (Some(config), Some(pair)) = (&self.config.network, self.network_pair(ctx)) {
            total += 1;
            match pair.find(ctx).await? {
                None => drifted.push(missing(ResourceKind::Network, pair.name())),
                Some(vpc) => {
                    observed += 1;
                    if vpc.cidr != config.cidr {
                        drifted.push(DriftEntry {
                            kind: ResourceKind::Network,
                            name: pair.name().to_string(),
                            reason: format!("cidr is {} but {} is desired", vpc.cidr, config.cidr),
                        });
                    }
                }
            }

            for spec in &config.security_groups {
                total += 1;
                let pair = SecurityGroupPair::new(self.clients, spec.clone());
                match pair.find(ctx).await? {
                    None => drifted.push(missing(ResourceKind::SecurityGroup, &spec.name)),
                    Some(group) => {
                        observed += 1;
                        let diff = IngressDiff::between(&spec.ingress, &group.ingress);
                        if !diff.is_empty() {
                            drifted.push(DriftEntry {
                                kind: ResourceKind::SecurityGroup,
                                name: spec.name.clone(),
                                reason: format!(
                                    "{} ingress rules to authorize, {} to revoke",
                                    diff.authorize.len(),
                                    diff.revoke.len()
                                ),
                            });
                        }
                    }
                }
            }
        }

        if let Some(pair) = self.load_balancer_pair() {
            total += 1;
            match pair.find().await? {
                None => drifted.push(missing(ResourceKind::LoadBalancer, pair.name())),
                Some(lb) => {
                    observed += 1;
                    if let Some(config) = &self.config.load_balancer
                        && lb.port != config.port
                    {
                        drifted.push(DriftEntry {
                            kind: ResourceKind::LoadBalancer,
                            name: lb.name,
                            reason: format!("port is {} but {} is desired", lb.port, config.port),
                        });
                    }
                }
            }
        }

        if let Some(bucket) = self.bucket_pair() {
            total += 1;
            if bucket.exists().await? {
                observed += 1;
            } else {
                drifted.push(missing(ResourceKind::Bucket, bucket.bucket()));
            }
        }

        for spec in &self.config.launch_templates {
            total += 1;
            let Some(template) = self.templates.get_launch_template(&spec.name).await? else {
                drifted.push(missing(ResourceKind::LaunchTemplate, &spec.name));
                continue;
            };
            observed += 1;

            let image_id = self.templates.discover_ami(spec).await?;
            let user_data = self.parser.read_user_data(spec)?;
            let desired = LaunchTemplateManager::desired_data(spec, &image_id, &user_data);
            let fields = drift_fields(&template.latest.data, &desired)?;
            if !fields.is_empty() {
                let names: Vec<String> = fields.iter().map(ToString::to_string).collect();
                drifted.push(DriftEntry {
                    kind: ResourceKind::LaunchTemplate,
                    name: spec.name.clone(),
                    reason: format!("version {} differs in {}", template.latest.number, names.join(", ")),
                });
            }
        }

        for pool in &self.config.machine_pools {
            total += 1;
            let template_id = self
                .templates
                .get_launch_template_id(&pool.launch_template)
                .await?
                .unwrap_or_default();
            let pair = AutoScalingGroupPair::new(self.clients, pool.clone(), template_id);
            let Some(group) = pair.find().await? else {
                drifted.push(missing(ResourceKind::AutoScalingGroup, &pool.name));
                continue;
            };
            observed += 1;

            let desired: BTreeSet<String> = pool.suspended_processes.iter().cloned().collect();
            let processes = ProcessChanges::between(&desired, &group.suspended_processes);
            if pair.has_drift(&group) {
                drifted.push(DriftEntry {
                    kind: ResourceKind::AutoScalingGroup,
                    name: pool.name.clone(),
                    reason: String::from("size, subnets or launch template reference differ"),
                });
            } else if !processes.is_empty() {
                drifted.push(DriftEntry {
                    kind: ResourceKind::AutoScalingGroup,
                    name: pool.name.clone(),
                    reason: String::from("suspended processes differ"),
                });
            }
        }

        Ok(DriftReport {
            has_drift: !drifted.is_empty(),
            drifted_resources: drifted,
            total_resources: total,
            observed_count: observed,
        })
    }

    /// Deletes every managed resource: groups, launch templates, the load
    /// balancer, security groups, the network, then the bucket.
    pub async fn delete_cluster(&self, ctx: &ReconcileContext) -> ReconciliationResult {
        info!(cluster = %ctx.cluster, "Deleting cluster resources");
        let mut result = ReconciliationResult::default();

        for pool in &self.config.machine_pools {
            let group = AutoScalingGroupPair::new(self.clients, pool.clone(), String::new());
            Self::remove(&group, ctx, &mut result).await;
        }

        for spec in &self.config.launch_templates {
            match self.templates.delete_launch_template(&spec.name).await {
                Ok(outcome) => result.record(ResourceKind::LaunchTemplate, &spec.name, outcome, None),
                Err(err) => result.fail(ResourceKind::LaunchTemplate, &spec.name, &err),
            }
        }

        if let Some(lb) = self.load_balancer_pair() {
            Self::remove(&lb, ctx, &mut result).await;
        }
        for group in self.security_group_pairs().iter().rev() {
            Self::remove(group, ctx, &mut result).await;
        }
        if let Some(network) = self.network_pair(ctx) {
            Self::remove(&network, ctx, &mut result).await;
        }
        if let Some(bucket) = self.bucket_pair() {
            Self::remove(&bucket, ctx, &mut result).await;
        }

        result
    }
}

impl std::fmt::Debug for Reconciler<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("cluster", &self.config.cluster.name)
            .field("templates", &self.templates)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Display for DriftReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.has_drift {
            writeln!(f, "Drift detected:")?;
            for entry in &self.drifted_resources {
                writeln!(f, "  - {} {}: {}", entry.kind, entry.name, entry.reason)?;
            }
        } else {
            write!(f, "No drift detected - state is converged")?;
        }
        Ok(())
    }
}

impl std::fmt::Display for ReconciliationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = if self.success { "successful" } else { "failed" };
        writeln!(f, "Reconciliation {status}:")?;
        writeln!(f, "  Created: {}", self.created)?;
        writeln!(f, "  Updated: {}", self.updated)?;
        writeln!(f, "  Deleted: {}", self.deleted)?;
        writeln!(f, "  Unchanged: {}", self.unchanged)?;

        let changed: Vec<&RegistrationResult> = self
            .registrations
            .iter()
            .filter(|r| r.outcome.changed())
            .collect();
        if !changed.is_empty() {
            writeln!(f, "  Registrations:")?;
            for registration in changed {
                writeln!(f, "    - {}: {}", registration.instance_id, registration.outcome)?;
            }
        }

        if !self.errors.is_empty() {
            writeln!(f, "  Errors:")?;
            for failure in &self.errors {
                writeln!(
                    f,
                    "    - {} {} ({}): {}",
                    failure.kind, failure.name, failure.class, failure.message
                )?;
            }
        }

        Ok(())
    }
}
