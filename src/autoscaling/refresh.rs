//! Instance refresh coordination.
//!
//! Mutual exclusion is derived from provider state on every call. Nothing is
//! cached between calls, so a refresh started by another actor blocks a new
//! one just like a refresh started here.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::RefreshConfig;
use crate::error::{ConvergeError, ProviderError, Result};
use crate::launch_template::LaunchTemplateHooks;
use crate::provider::{
    AutoScalingApi, AutoScalingGroup, InstanceRefresh, LaunchTemplateVersion, ProviderClients,
    ProviderRefreshStatus, RefreshPreferences, RetryPolicy,
};

/// Coarse state of a group's instance refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshState {
    /// No refresh has ever run.
    Idle,
    /// A refresh is running.
    InProgress,
    /// The newest refresh completed.
    Successful,
    /// The newest refresh failed or was rolled back.
    Failed,
    /// The newest refresh was cancelled.
    Cancelled,
}

impl From<ProviderRefreshStatus> for RefreshState {
    fn from(status: ProviderRefreshStatus) -> Self {
        match status {
            ProviderRefreshStatus::Pending
            | ProviderRefreshStatus::InProgress
            | ProviderRefreshStatus::Baking
            | ProviderRefreshStatus::Cancelling
            | ProviderRefreshStatus::RollbackInProgress => Self::InProgress,
            ProviderRefreshStatus::Successful => Self::Successful,
            ProviderRefreshStatus::Failed
            | ProviderRefreshStatus::RollbackFailed
            | ProviderRefreshStatus::RollbackSuccessful => Self::Failed,
            ProviderRefreshStatus::Cancelled => Self::Cancelled,
        }
    }
}

/// Why a refresh may not start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshBlock {
    /// The group does not exist.
    GroupNotFound,
    /// Another refresh is running.
    InProgress,
}

/// Whether a refresh may start now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RefreshDecision {
    /// True if a refresh may start.
    pub allowed: bool,
    /// Reason when not allowed.
    pub reason: Option<RefreshBlock>,
}

impl RefreshDecision {
    const fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    const fn block(reason: RefreshBlock) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
        }
    }
}

/// Result of a start request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "refresh_id")]
pub enum RefreshStartOutcome {
    /// A new refresh was started.
    Started(String),
    /// A refresh was already running; nothing was started.
    AlreadyInProgress,
}

/// Picks the newest refresh by start time.
#[must_use]
pub fn newest_refresh(refreshes: &[InstanceRefresh]) -> Option<&InstanceRefresh> {
    refreshes.iter().max_by_key(|r| r.started_at)
}

/// Coordinates instance refreshes for autoscaling groups.
#[derive(Clone)]
pub struct InstanceRefreshCoordinator {
    autoscaling: Arc<dyn AutoScalingApi>,
    retry: RetryPolicy,
}

impl InstanceRefreshCoordinator {
    /// Creates a coordinator over an autoscaling capability.
    #[must_use]
    pub fn new(autoscaling: Arc<dyn AutoScalingApi>, retry: RetryPolicy) -> Self {
        Self { autoscaling, retry }
    }

    /// Creates a coordinator from provider clients.
    #[must_use]
    pub fn from_clients(clients: &ProviderClients) -> Self {
        Self::new(Arc::clone(&clients.autoscaling), clients.retry.clone())
    }

    /// Returns the newest refresh of a group, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider call fails.
    pub async fn latest_refresh(&self, group: &str) -> Result<Option<InstanceRefresh>> {
        let refreshes = self
            .retry
            .run("DescribeInstanceRefreshes", || {
                self.autoscaling.describe_instance_refreshes(group)
            })
            .await?;
        Ok(newest_refresh(&refreshes).cloned())
    }

    /// Looks up a group.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider call fails.
    pub async fn describe_group(&self, group: &str) -> Result<Option<AutoScalingGroup>> {
        self.retry
            .run("DescribeAutoScalingGroups", || self.autoscaling.describe_group(group))
            .await
    }

    /// Returns the group's refresh state. Polls once and never waits.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider call fails.
    pub async fn refresh_state(&self, group: &str) -> Result<RefreshState> {
        Ok(self
            .latest_refresh(group)
            .await?
            .map_or(RefreshState::Idle, |r| RefreshState::from(r.status)))
    }

    /// Decides whether a refresh may start now.
    ///
    /// # Errors
    ///
    /// Returns an error if a provider call fails.
    pub async fn can_start(&self, group: &str) -> Result<RefreshDecision> {
        let exists = self
            .retry
            .run("DescribeAutoScalingGroups", || self.autoscaling.describe_group(group))
            .await?
            .is_some();
        if !exists {
            debug!(group = %group, "Refresh blocked: group not found");
            return Ok(RefreshDecision::block(RefreshBlock::GroupNotFound));
        }

        let refreshes = self
            .retry
            .run("DescribeInstanceRefreshes", || {
                self.autoscaling.describe_instance_refreshes(group)
            })
            .await?;

        // Any running refresh blocks, not only the newest one.
        if let Some(active) = refreshes.iter().find(|r| r.status.is_active()) {
            debug!(group = %group, refresh_id = %active.id, "Refresh blocked: one is running");
            return Ok(RefreshDecision::block(RefreshBlock::InProgress));
        }
        Ok(RefreshDecision::allow())
    }

    /// Starts a refresh. A concurrent refresh is not an error.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the group does not exist, or any other
    /// provider error.
    pub async fn start(
        &self,
        group: &str,
        preferences: &RefreshPreferences,
    ) -> Result<RefreshStartOutcome> {
        let started = self
            .retry
            .run("StartInstanceRefresh", || {
                self.autoscaling.start_instance_refresh(group, preferences)
            })
            .await;

        match started {
            Ok(id) => {
                info!(group = %group, refresh_id = %id, "Started instance refresh");
                Ok(RefreshStartOutcome::Started(id))
            }
            Err(err) if is_refresh_in_progress(&err) => {
                info!(group = %group, "Instance refresh already in progress");
                Ok(RefreshStartOutcome::AlreadyInProgress)
            }
            Err(err) => Err(err.in_operation("StartInstanceRefresh", group)),
        }
    }
}

fn is_refresh_in_progress(err: &ConvergeError) -> bool {
    matches!(
        err.provider_error(),
        Some(ProviderError::RefreshInProgress { .. })
    )
}

impl std::fmt::Debug for InstanceRefreshCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceRefreshCoordinator")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

/// Launch template hooks that roll a machine pool onto new versions.
#[derive(Debug, Clone)]
pub struct InstanceRefreshHooks {
    coordinator: InstanceRefreshCoordinator,
    group: String,
    config: RefreshConfig,
}

impl InstanceRefreshHooks {
    /// Creates hooks for one group.
    #[must_use]
    pub fn new(
        coordinator: InstanceRefreshCoordinator,
        group: impl Into<String>,
        config: RefreshConfig,
    ) -> Self {
        Self {
            coordinator,
            group: group.into(),
            config,
        }
    }

    fn preferences(&self) -> RefreshPreferences {
        RefreshPreferences {
            min_healthy_percentage: self.config.min_healthy_percentage,
            instance_warmup_secs: self.config.instance_warmup_secs,
        }
    }
}

#[async_trait]
impl LaunchTemplateHooks for InstanceRefreshHooks {
    async fn can_update(&self) -> Result<bool> {
        if !self.config.enabled {
            return Ok(true);
        }
        let decision = self.coordinator.can_start(&self.group).await?;
        // A group that does not exist yet has nothing to roll.
        Ok(decision.allowed || decision.reason == Some(RefreshBlock::GroupNotFound))
    }

    async fn after_update(&self, template_id: &str, version: u64) -> Result<()> {
        if !self.config.enabled {
            debug!(group = %self.group, "Instance refresh disabled");
            return Ok(());
        }
        if self.coordinator.can_start(&self.group).await?.reason == Some(RefreshBlock::GroupNotFound)
        {
            return Ok(());
        }
        debug!(
            group = %self.group,
            template_id = %template_id,
            version,
            "Rolling group onto new launch template version"
        );
        self.coordinator
            .start(&self.group, &self.preferences())
            .await
            .map(|_| ())
    }

    async fn rollout_pending(
        &self,
        template_id: &str,
        version: &LaunchTemplateVersion,
    ) -> Result<bool> {
        if !self.config.enabled {
            return Ok(false);
        }
        let Some(group) = self.coordinator.describe_group(&self.group).await? else {
            return Ok(false);
        };
        // A group created after the version already booted from it.
        if group.launch_template.template_id != template_id || group.created_at >= version.created_at
        {
            return Ok(false);
        }
        let latest = self.coordinator.latest_refresh(&self.group).await?;
        let pending = latest.is_none_or(|r| r.started_at < version.created_at);
        if pending {
            debug!(group = %self.group, version = version.number, "No refresh since version was created");
        }
        Ok(pending)
    }
}

impl std::fmt::Display for RefreshState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::InProgress => "in-progress",
            Self::Successful => "successful",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for RefreshBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GroupNotFound => write!(f, "group not found"),
            Self::InProgress => write!(f, "refresh in progress"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ImageSpec, LaunchTemplateSpec, RetentionPolicy};
    use crate::context::ReconcileContext;
    use crate::error::ErrorClass;
    use crate::launch_template::{LaunchTemplateManager, LaunchTemplateOutcome, NoHooks};
    use crate::provider::{
        GroupSettings, MockAutoScalingApi, SimulatedProvider, TemplateRef, VersionRef,
    };
    use crate::tags::Tags;
    use chrono::{Duration, Utc};
    use std::collections::BTreeSet;

    fn prefs() -> RefreshPreferences {
        RefreshPreferences {
            min_healthy_percentage: 90,
            instance_warmup_secs: None,
        }
    }

    async fn provider_with_group() -> Arc<SimulatedProvider> {
        let provider = Arc::new(SimulatedProvider::in_memory());
        let settings = GroupSettings {
            launch_template: TemplateRef {
                template_id: String::from("lt-1"),
                version: VersionRef::Latest,
            },
            min_size: 1,
            max_size: 3,
            desired_capacity: Some(2),
            subnet_ids: Vec::new(),
        };
        provider
            .create_group("pool-a", &settings, &Tags::new())
            .await
            .expect("group");
        provider
    }

    fn coordinator(provider: &Arc<SimulatedProvider>) -> InstanceRefreshCoordinator {
        InstanceRefreshCoordinator::new(provider.clone(), RetryPolicy::none())
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(RefreshState::from(ProviderRefreshStatus::Baking), RefreshState::InProgress);
        assert_eq!(
            RefreshState::from(ProviderRefreshStatus::RollbackSuccessful),
            RefreshState::Failed
        );
        assert_eq!(
            RefreshState::from(ProviderRefreshStatus::Cancelled),
            RefreshState::Cancelled
        );
    }

    #[tokio::test]
    async fn test_idle_then_in_progress() {
        let provider = provider_with_group().await;
        let coordinator = coordinator(&provider);

        assert_eq!(coordinator.refresh_state("pool-a").await.expect("state"), RefreshState::Idle);

        let RefreshStartOutcome::Started(id) =
            coordinator.start("pool-a", &prefs()).await.expect("start")
        else {
            panic!("refresh not started");
        };
        assert_eq!(
            coordinator.refresh_state("pool-a").await.expect("state"),
            RefreshState::InProgress
        );

        provider
            .seed(|s| s.set_refresh_status(&id, ProviderRefreshStatus::Successful))
            .expect("seed");
        assert_eq!(
            coordinator.refresh_state("pool-a").await.expect("state"),
            RefreshState::Successful
        );
        assert!(coordinator.can_start("pool-a").await.expect("decision").allowed);
    }

    #[tokio::test]
    async fn test_foreign_refresh_blocks_start() {
        let provider = provider_with_group().await;
        provider
            .seed(|s| s.add_refresh("pool-a", ProviderRefreshStatus::InProgress, Utc::now()))
            .expect("seed");
        let coordinator = coordinator(&provider);

        let decision = coordinator.can_start("pool-a").await.expect("decision");
        assert!(!decision.allowed);
        assert_eq!(decision.reason, Some(RefreshBlock::InProgress));

        assert_eq!(
            coordinator.start("pool-a", &prefs()).await.expect("start"),
            RefreshStartOutcome::AlreadyInProgress
        );
    }

    #[tokio::test]
    async fn test_newest_refresh_decides_state() {
        let provider = provider_with_group().await;
        let now = Utc::now();
        provider
            .seed(|s| {
                s.add_refresh("pool-a", ProviderRefreshStatus::Failed, now - Duration::hours(2));
                s.add_refresh("pool-a", ProviderRefreshStatus::Successful, now);
            })
            .expect("seed");
        let coordinator = coordinator(&provider);

        assert_eq!(
            coordinator.refresh_state("pool-a").await.expect("state"),
            RefreshState::Successful
        );
        assert!(coordinator.can_start("pool-a").await.expect("decision").allowed);
    }

    #[tokio::test]
    async fn test_missing_group() {
        let provider = Arc::new(SimulatedProvider::in_memory());
        let coordinator = coordinator(&provider);

        let decision = coordinator.can_start("ghost").await.expect("decision");
        assert_eq!(decision.reason, Some(RefreshBlock::GroupNotFound));

        let err = coordinator.start("ghost", &prefs()).await.expect_err("missing");
        assert_eq!(err.class(), ErrorClass::NotFound);
    }

    #[tokio::test]
    async fn test_rejection_race_is_noop() {
        let mut mock = MockAutoScalingApi::new();
        mock.expect_start_instance_refresh().times(1).returning(|name, _| {
            Err(ProviderError::RefreshInProgress {
                group: name.to_string(),
            }
            .into())
        });
        let coordinator = InstanceRefreshCoordinator::new(Arc::new(mock), RetryPolicy::none());

        assert_eq!(
            coordinator.start("pool-a", &prefs()).await.expect("start"),
            RefreshStartOutcome::AlreadyInProgress
        );
    }

    #[tokio::test]
    async fn test_hooks_defer_while_refresh_runs() {
        let mut mock = MockAutoScalingApi::new();
        mock.expect_describe_group().returning(|name| {
            Ok(Some(AutoScalingGroup {
                name: name.to_string(),
                launch_template: TemplateRef {
                    template_id: String::from("lt-1"),
                    version: VersionRef::Latest,
                },
                min_size: 1,
                max_size: 1,
                desired_capacity: None,
                subnet_ids: Vec::new(),
                suspended_processes: BTreeSet::new(),
                instance_ids: Vec::new(),
                created_at: Utc::now(),
            }))
        });
        mock.expect_describe_instance_refreshes().returning(|name| {
            Ok(vec![InstanceRefresh {
                id: String::from("r-1"),
                group: name.to_string(),
                status: ProviderRefreshStatus::Pending,
                started_at: Utc::now(),
                percentage_complete: 0,
                status_reason: None,
            }])
        });
        mock.expect_start_instance_refresh().never();

        let hooks = InstanceRefreshHooks::new(
            InstanceRefreshCoordinator::new(Arc::new(mock), RetryPolicy::none()),
            "pool-a",
            RefreshConfig::default(),
        );

        assert!(!hooks.can_update().await.expect("can update"));
    }

    #[tokio::test]
    async fn test_disabled_refresh_skips_provider() {
        let mut mock = MockAutoScalingApi::new();
        mock.expect_describe_group().never();
        mock.expect_start_instance_refresh().never();

        let hooks = InstanceRefreshHooks::new(
            InstanceRefreshCoordinator::new(Arc::new(mock), RetryPolicy::none()),
            "pool-a",
            RefreshConfig {
                enabled: false,
                ..RefreshConfig::default()
            },
        );

        assert!(hooks.can_update().await.expect("can update"));
        hooks.after_update("lt-1", 2).await.expect("after update");
    }

    #[tokio::test]
    async fn test_after_update_starts_refresh() {
        let provider = provider_with_group().await;
        let hooks = InstanceRefreshHooks::new(coordinator(&provider), "pool-a", RefreshConfig::default());

        hooks.after_update("lt-1", 2).await.expect("after update");

        assert_eq!(provider.call_count("StartInstanceRefresh"), 1);
        let state = coordinator(&provider)
            .refresh_state("pool-a")
            .await
            .expect("state");
        assert_eq!(state, RefreshState::InProgress);
    }

    fn template_spec(instance_type: &str) -> LaunchTemplateSpec {
        LaunchTemplateSpec {
            name: String::from("workers"),
            instance_type: instance_type.to_string(),
            image: ImageSpec {
                id: Some(String::from("ami-1")),
                lookup: None,
            },
            security_group_ids: Vec::new(),
            user_data: None,
            user_data_file: None,
            iam_instance_profile: None,
            ssh_key_name: None,
            root_volume: None,
            metadata_options: None,
            spot_max_price: None,
            role: String::from("node"),
            tags: Tags::new(),
        }
    }

    #[tokio::test]
    async fn test_failed_refresh_start_is_retried_next_pass() {
        let provider = Arc::new(SimulatedProvider::in_memory());
        let clients = ProviderClients::simulated(Arc::clone(&provider)).with_retry(RetryPolicy::none());
        let manager = LaunchTemplateManager::new(&clients, RetentionPolicy { keep_latest: 2 });
        let ctx = ReconcileContext::new("prod");

        let created = manager
            .reconcile_launch_template(&ctx, &template_spec("m5.large"), b"", &NoHooks)
            .await
            .expect("create");
        let settings = GroupSettings {
            launch_template: TemplateRef {
                template_id: created.template_id().to_string(),
                version: VersionRef::Latest,
            },
            min_size: 1,
            max_size: 3,
            desired_capacity: Some(1),
            subnet_ids: Vec::new(),
        };
        provider
            .create_group("pool-a", &settings, &Tags::new())
            .await
            .expect("group");

        let hooks = InstanceRefreshHooks::new(coordinator(&provider), "pool-a", RefreshConfig::default());
        provider.inject_fault("StartInstanceRefresh", ProviderError::transient("connection reset"));

        manager
            .reconcile_launch_template(&ctx, &template_spec("m5.xlarge"), b"", &hooks)
            .await
            .expect_err("refresh start failed");
        assert_eq!(
            coordinator(&provider).refresh_state("pool-a").await.expect("state"),
            RefreshState::Idle
        );

        let resumed = manager
            .reconcile_launch_template(&ctx, &template_spec("m5.xlarge"), b"", &hooks)
            .await
            .expect("second pass");
        assert!(matches!(
            resumed,
            LaunchTemplateOutcome::Resumed {
                version: 2,
                rolled_out: true,
                ..
            }
        ));
        assert_eq!(provider.call_count("StartInstanceRefresh"), 2);
        assert_eq!(
            coordinator(&provider).refresh_state("pool-a").await.expect("state"),
            RefreshState::InProgress
        );

        let settled = manager
            .reconcile_launch_template(&ctx, &template_spec("m5.xlarge"), b"", &hooks)
            .await
            .expect("third pass");
        assert!(matches!(settled, LaunchTemplateOutcome::Unchanged { version: 2, .. }));
        assert_eq!(provider.call_count("StartInstanceRefresh"), 2);
    }

    #[tokio::test]
    async fn test_group_created_after_version_needs_no_rollout() {
        let provider = Arc::new(SimulatedProvider::in_memory());
        let clients = ProviderClients::simulated(Arc::clone(&provider)).with_retry(RetryPolicy::none());
        let manager = LaunchTemplateManager::new(&clients, RetentionPolicy { keep_latest: 2 });
        let ctx = ReconcileContext::new("prod");
        let hooks = InstanceRefreshHooks::new(coordinator(&provider), "pool-a", RefreshConfig::default());

        let created = manager
            .reconcile_launch_template(&ctx, &template_spec("m5.large"), b"", &hooks)
            .await
            .expect("create");
        let settings = GroupSettings {
            launch_template: TemplateRef {
                template_id: created.template_id().to_string(),
                version: VersionRef::Latest,
            },
            min_size: 1,
            max_size: 3,
            desired_capacity: None,
            subnet_ids: Vec::new(),
        };
        provider
            .create_group("pool-a", &settings, &Tags::new())
            .await
            .expect("group");

        let outcome = manager
            .reconcile_launch_template(&ctx, &template_spec("m5.large"), b"", &hooks)
            .await
            .expect("second pass");

        assert!(matches!(outcome, LaunchTemplateOutcome::Unchanged { version: 1, .. }));
        assert_eq!(provider.call_count("StartInstanceRefresh"), 0);
    }
}
