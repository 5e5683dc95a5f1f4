//! Autoscaling group convergence.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::MachinePoolConfig;
use crate::context::ReconcileContext;
use crate::convergence::{ConvergenceOutcome, ResourceConvergencePair, ResourceKind};
use crate::error::{ErrorClass, ProviderError, Result};
use crate::provider::{
    AutoScalingApi, AutoScalingGroup, GroupSettings, ProviderClients, RetryPolicy, TemplateRef,
    VersionRef,
};

/// Role tag value for machine pool groups.
pub const MACHINE_POOL_ROLE: &str = "machine-pool";

/// Scaling processes to suspend and resume.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessChanges {
    /// Processes suspended by this call.
    pub suspended: Vec<String>,
    /// Processes resumed by this call.
    pub resumed: Vec<String>,
}

impl ProcessChanges {
    /// Computes the set difference between desired and observed processes.
    #[must_use]
    pub fn between(desired: &BTreeSet<String>, observed: &BTreeSet<String>) -> Self {
        Self {
            suspended: desired.difference(observed).cloned().collect(),
            resumed: observed.difference(desired).cloned().collect(),
        }
    }

    /// Returns true if nothing changes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.suspended.is_empty() && self.resumed.is_empty()
    }
}

/// Reconcile/delete pair for one machine pool's autoscaling group.
#[derive(Clone)]
pub struct AutoScalingGroupPair {
    autoscaling: Arc<dyn AutoScalingApi>,
    retry: RetryPolicy,
    pool: MachinePoolConfig,
    template_id: String,
}

impl AutoScalingGroupPair {
    /// Creates the pair for a pool booting from `template_id`.
    #[must_use]
    pub fn new(
        clients: &ProviderClients,
        pool: MachinePoolConfig,
        template_id: impl Into<String>,
    ) -> Self {
        Self {
            autoscaling: Arc::clone(&clients.autoscaling),
            retry: clients.retry.clone(),
            pool,
            template_id: template_id.into(),
        }
    }

    /// Settings the group should carry.
    ///
    /// Groups follow `$Latest` so new versions roll out through a refresh
    /// rather than a group update.
    #[must_use]
    pub fn desired_settings(&self) -> GroupSettings {
        GroupSettings {
            launch_template: TemplateRef {
                template_id: self.template_id.clone(),
                version: VersionRef::Latest,
            },
            min_size: self.pool.min_size,
            max_size: self.pool.max_size,
            desired_capacity: self.pool.desired_capacity,
            subnet_ids: self.pool.subnet_ids.clone(),
        }
    }

    /// Returns the group, if it exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider call fails.
    pub async fn find(&self) -> Result<Option<AutoScalingGroup>> {
        self.retry
            .run("DescribeAutoScalingGroups", || {
                self.autoscaling.describe_group(&self.pool.name)
            })
            .await
    }

    /// Returns true if the observed group differs from the desired settings.
    #[must_use]
    pub fn has_drift(&self, group: &AutoScalingGroup) -> bool {
        let desired = self.desired_settings();
        let subnets = |ids: &[String]| ids.iter().cloned().collect::<BTreeSet<_>>();

        group.launch_template != desired.launch_template
            || group.min_size != desired.min_size
            || group.max_size != desired.max_size
            || desired
                .desired_capacity
                .is_some_and(|want| group.desired_capacity != Some(want))
            || subnets(&group.subnet_ids) != subnets(&desired.subnet_ids)
    }

    /// Suspends and resumes processes so exactly `desired` are suspended.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the group does not exist, or any provider
    /// error.
    pub async fn reconcile_suspended_processes(
        &self,
        desired: &BTreeSet<String>,
    ) -> Result<ProcessChanges> {
        let group = self
            .find()
            .await?
            .ok_or_else(|| ProviderError::not_found("autoscaling group", &self.pool.name))?;
        let changes = ProcessChanges::between(desired, &group.suspended_processes);

        if !changes.suspended.is_empty() {
            self.retry
                .run("SuspendProcesses", || {
                    self.autoscaling
                        .suspend_processes(&self.pool.name, &changes.suspended)
                })
                .await
                .map_err(|e| e.in_operation("SuspendProcesses", &self.pool.name))?;
            info!(group = %self.pool.name, processes = ?changes.suspended, "Suspended processes");
        }
        if !changes.resumed.is_empty() {
            self.retry
                .run("ResumeProcesses", || {
                    self.autoscaling
                        .resume_processes(&self.pool.name, &changes.resumed)
                })
                .await
                .map_err(|e| e.in_operation("ResumeProcesses", &self.pool.name))?;
            info!(group = %self.pool.name, processes = ?changes.resumed, "Resumed processes");
        }

        Ok(changes)
    }
}

#[async_trait]
impl ResourceConvergencePair for AutoScalingGroupPair {
    fn kind(&self) -> ResourceKind {
        ResourceKind::AutoScalingGroup
    }

    fn name(&self) -> &str {
        &self.pool.name
    }

    async fn reconcile(&self, ctx: &ReconcileContext) -> Result<ConvergenceOutcome> {
        let settings = self.desired_settings();

        let group = match self.find().await? {
            Some(group) => group,
            None => {
                let tags = ctx.owned_tags(MACHINE_POOL_ROLE, &self.pool.name, &self.pool.tags);
                match self
                    .retry
                    .run("CreateAutoScalingGroup", || {
                        self.autoscaling
                            .create_group(&self.pool.name, &settings, &tags)
                    })
                    .await
                {
                    Ok(_) => {
                        info!(group = %self.pool.name, template_id = %self.template_id, "Created autoscaling group");
                        return Ok(ConvergenceOutcome::Created);
                    }
                    Err(err) if err.class() == ErrorClass::AlreadyExists => {
                        debug!(group = %self.pool.name, "Group created concurrently, checking its settings");
                        let Some(group) = self.find().await? else {
                            return Err(err.in_operation("CreateAutoScalingGroup", &self.pool.name));
                        };
                        group
                    }
                    Err(err) => {
                        return Err(err.in_operation("CreateAutoScalingGroup", &self.pool.name));
                    }
                }
            }
        };

        if !self.has_drift(&group) {
            debug!(group = %self.pool.name, "Autoscaling group converged");
            return Ok(ConvergenceOutcome::Unchanged);
        }

        self.retry
            .run("UpdateAutoScalingGroup", || {
                self.autoscaling.update_group(&self.pool.name, &settings)
            })
            .await
            .map_err(|e| e.in_operation("UpdateAutoScalingGroup", &self.pool.name))?;
        info!(
            group = %self.pool.name,
            min = settings.min_size,
            max = settings.max_size,
            "Updated autoscaling group"
        );
        Ok(ConvergenceOutcome::Updated)
    }

    async fn delete(&self, _ctx: &ReconcileContext) -> Result<ConvergenceOutcome> {
        if self.find().await?.is_none() {
            return Ok(ConvergenceOutcome::AlreadyAbsent);
        }

        match self
            .retry
            .run("DeleteAutoScalingGroup", || {
                self.autoscaling.delete_group(&self.pool.name)
            })
            .await
        {
            Ok(()) => {
                info!(group = %self.pool.name, "Deleting autoscaling group");
                Ok(ConvergenceOutcome::Deleted)
            }
            Err(err) if err.is_not_found() => Ok(ConvergenceOutcome::AlreadyAbsent),
            Err(err) => Err(err.in_operation("DeleteAutoScalingGroup", &self.pool.name)),
        }
    }
}

impl std::fmt::Debug for AutoScalingGroupPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoScalingGroupPair")
            .field("pool", &self.pool.name)
            .field("template_id", &self.template_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RefreshConfig;
    use crate::provider::{InstanceApi, InstanceState, SimulatedProvider};
    use crate::tags::Tags;

    fn pool(max_size: u32) -> MachinePoolConfig {
        MachinePoolConfig {
            name: String::from("pool-a"),
            launch_template: String::from("workers"),
            min_size: 1,
            max_size,
            desired_capacity: None,
            subnet_ids: vec![String::from("subnet-1"), String::from("subnet-2")],
            refresh: RefreshConfig::default(),
            suspended_processes: Vec::new(),
            tags: Tags::new(),
        }
    }

    fn pair(provider: &Arc<SimulatedProvider>, max_size: u32) -> AutoScalingGroupPair {
        let clients = ProviderClients::simulated(Arc::clone(provider)).with_retry(RetryPolicy::none());
        AutoScalingGroupPair::new(&clients, pool(max_size), "lt-1")
    }

    #[tokio::test]
    async fn test_create_update_unchanged() {
        let provider = Arc::new(SimulatedProvider::in_memory());
        let ctx = ReconcileContext::new("prod");

        assert_eq!(pair(&provider, 3).reconcile(&ctx).await.expect("create"), ConvergenceOutcome::Created);
        assert_eq!(pair(&provider, 3).reconcile(&ctx).await.expect("again"), ConvergenceOutcome::Unchanged);
        assert_eq!(pair(&provider, 5).reconcile(&ctx).await.expect("resize"), ConvergenceOutcome::Updated);

        let group = pair(&provider, 5).find().await.expect("find").expect("present");
        assert_eq!(group.max_size, 5);
        assert_eq!(group.launch_template.version, VersionRef::Latest);
    }

    #[tokio::test]
    async fn test_concurrent_create_with_other_settings_is_updated() {
        let provider = Arc::new(SimulatedProvider::in_memory());
        let ctx = ReconcileContext::new("prod");
        let groups = pair(&provider, 3);

        // Another reconciler creates the group with a different size first.
        let mut foreign = groups.desired_settings();
        foreign.max_size = 9;
        provider.on_call(
            "CreateAutoScalingGroup",
            1,
            Box::new(move |s| {
                s.add_group("pool-a", &foreign, Tags::new());
            }),
        );

        assert_eq!(groups.reconcile(&ctx).await.expect("reconcile"), ConvergenceOutcome::Updated);
        assert_eq!(provider.call_count("UpdateAutoScalingGroup"), 1);

        let group = groups.find().await.expect("find").expect("present");
        assert_eq!(group.max_size, 3);
        assert_eq!(groups.reconcile(&ctx).await.expect("again"), ConvergenceOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_pinned_template_reference_is_drift() {
        let provider = Arc::new(SimulatedProvider::in_memory());
        let ctx = ReconcileContext::new("prod");
        let groups = pair(&provider, 3);
        groups.reconcile(&ctx).await.expect("create");

        provider
            .seed(|s| {
                s.set_group_template(
                    "pool-a",
                    TemplateRef {
                        template_id: String::from("lt-1"),
                        version: VersionRef::Number(4),
                    },
                );
            })
            .expect("seed");

        assert_eq!(groups.reconcile(&ctx).await.expect("update"), ConvergenceOutcome::Updated);
    }

    #[tokio::test]
    async fn test_suspended_processes_converge() {
        let provider = Arc::new(SimulatedProvider::in_memory());
        let groups = pair(&provider, 3);
        groups.reconcile(&ReconcileContext::new("prod")).await.expect("create");

        let first = BTreeSet::from([String::from("AZRebalance"), String::from("Launch")]);
        let changes = groups.reconcile_suspended_processes(&first).await.expect("suspend");
        assert_eq!(changes.suspended.len(), 2);

        let second = BTreeSet::from([String::from("AZRebalance")]);
        let changes = groups.reconcile_suspended_processes(&second).await.expect("resume");
        assert_eq!(changes.resumed, vec![String::from("Launch")]);
        assert!(changes.suspended.is_empty());

        let changes = groups.reconcile_suspended_processes(&second).await.expect("noop");
        assert!(changes.is_empty());
    }

    #[tokio::test]
    async fn test_delete_terminates_without_waiting() {
        let provider = Arc::new(SimulatedProvider::in_memory());
        let ctx = ReconcileContext::new("prod");
        let groups = pair(&provider, 3);
        groups.reconcile(&ctx).await.expect("create");
        let instance = provider
            .seed(|s| {
                let id = s.run_instance(None, Tags::new());
                s.attach_instance("pool-a", &id);
                id
            })
            .expect("seed");

        assert_eq!(groups.delete(&ctx).await.expect("delete"), ConvergenceOutcome::Deleted);
        assert_eq!(groups.delete(&ctx).await.expect("again"), ConvergenceOutcome::AlreadyAbsent);

        let described = provider
            .describe_instance(&instance)
            .await
            .expect("describe")
            .expect("still visible");
        assert_eq!(described.state, InstanceState::ShuttingDown);
    }
}
