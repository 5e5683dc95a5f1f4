//! Launch template version lifecycle.
//!
//! Versions are immutable and numbered by the provider. The manager never
//! edits a version in place: drift produces a new version, which becomes the
//! default, and old versions are pruned only when no live consumer boots
//! from them.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{ConfigHasher, LaunchTemplateSpec, RetentionPolicy, UserDataHash};
use crate::context::ReconcileContext;
use crate::convergence::ConvergenceOutcome;
use crate::error::{ErrorClass, ProviderError, ReconcileError, Result};
use crate::provider::{
    AutoScalingApi, InstanceApi, InstanceFilter, LaunchTemplate, LaunchTemplateApi,
    LaunchTemplateData, LaunchTemplateVersion, ProviderClients, RetryPolicy,
};

use super::ami;
use super::drift::{drift_fields, needs_update, DriftField};
use super::prune::{plan_prune, resolve_version, verify_plan, PruneReport};

/// A launch template together with its latest version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObservedLaunchTemplate {
    /// Template metadata.
    pub template: LaunchTemplate,
    /// Latest version.
    pub latest: LaunchTemplateVersion,
}

impl ObservedLaunchTemplate {
    /// Returns the user data digest of the latest version.
    #[must_use]
    pub fn user_data_hash(&self) -> Option<&UserDataHash> {
        self.latest.data.user_data_hash.as_ref()
    }
}

/// Result of a version creation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "version")]
pub enum VersionOutcome {
    /// A new version was created.
    Created(u64),
    /// The latest version already carries the desired data.
    AlreadyPresent(u64),
}

impl VersionOutcome {
    /// Returns the version number.
    #[must_use]
    pub const fn version(self) -> u64 {
        match self {
            Self::Created(n) | Self::AlreadyPresent(n) => n,
        }
    }
}

/// Result of reconciling one launch template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum LaunchTemplateOutcome {
    /// The template did not exist and was created.
    Created {
        /// Template id.
        template_id: String,
    },
    /// A new version was created.
    Updated {
        /// Template id.
        template_id: String,
        /// New version number.
        version: u64,
        /// Fields that drifted.
        drift: Vec<DriftField>,
        /// Versions removed afterwards.
        pruned: PruneReport,
    },
    /// The latest version already matched, but follow-up work left over
    /// from an earlier pass was finished now.
    Resumed {
        /// Template id.
        template_id: String,
        /// Latest version number.
        version: u64,
        /// True if the consumer was rolled onto `version`.
        rolled_out: bool,
        /// Versions removed.
        pruned: PruneReport,
    },
    /// Already converged.
    Unchanged {
        /// Template id.
        template_id: String,
        /// Latest version number.
        version: u64,
    },
    /// Drift was found but the consumer refused an update for now.
    Deferred {
        /// Template id.
        template_id: String,
        /// Fields that drifted.
        drift: Vec<DriftField>,
    },
}

impl LaunchTemplateOutcome {
    /// Returns the template id.
    #[must_use]
    pub fn template_id(&self) -> &str {
        match self {
            Self::Created { template_id }
            | Self::Updated { template_id, .. }
            | Self::Resumed { template_id, .. }
            | Self::Unchanged { template_id, .. }
            | Self::Deferred { template_id, .. } => template_id,
        }
    }

    /// Returns true if a template or version was written.
    #[must_use]
    pub const fn changed(&self) -> bool {
        matches!(
            self,
            Self::Created { .. } | Self::Updated { .. } | Self::Resumed { .. }
        )
    }
}

/// Consumer callbacks around a launch template update.
#[async_trait]
pub trait LaunchTemplateHooks: Send + Sync {
    /// Returns true if the consumer can take a new version now.
    async fn can_update(&self) -> Result<bool>;

    /// Called once a new version exists.
    async fn after_update(&self, template_id: &str, version: u64) -> Result<()>;

    /// Returns true if the consumer never rolled onto `version`, for
    /// example because `after_update` failed in an earlier pass.
    async fn rollout_pending(
        &self,
        _template_id: &str,
        _version: &LaunchTemplateVersion,
    ) -> Result<bool> {
        Ok(false)
    }
}

/// Hooks for templates without a rolling consumer.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

#[async_trait]
impl LaunchTemplateHooks for NoHooks {
    async fn can_update(&self) -> Result<bool> {
        Ok(true)
    }

    async fn after_update(&self, _template_id: &str, _version: u64) -> Result<()> {
        Ok(())
    }
}

/// Manages launch templates and their versions.
#[derive(Clone)]
pub struct LaunchTemplateManager {
    templates: Arc<dyn LaunchTemplateApi>,
    instances: Arc<dyn InstanceApi>,
    autoscaling: Arc<dyn AutoScalingApi>,
    retry: RetryPolicy,
    retention: RetentionPolicy,
    hasher: ConfigHasher,
}

impl LaunchTemplateManager {
    /// Creates a manager over the given provider clients.
    #[must_use]
    pub fn new(clients: &ProviderClients, retention: RetentionPolicy) -> Self {
        Self {
            templates: Arc::clone(&clients.launch_templates),
            instances: Arc::clone(&clients.instances),
            autoscaling: Arc::clone(&clients.autoscaling),
            retry: clients.retry.clone(),
            retention,
            hasher: ConfigHasher::new(),
        }
    }

    /// Builds the version data a spec asks for.
    #[must_use]
    pub fn desired_data(
        spec: &LaunchTemplateSpec,
        image_id: &str,
        user_data: &[u8],
    ) -> LaunchTemplateData {
        LaunchTemplateData {
            instance_type: spec.instance_type.clone(),
            image_id: Some(image_id.to_string()),
            security_group_ids: spec.security_group_ids.clone(),
            user_data_hash: (!user_data.is_empty()).then(|| UserDataHash::of(user_data)),
            iam_instance_profile: spec.iam_instance_profile.clone(),
            ssh_key_name: spec.ssh_key_name.clone(),
            root_volume: spec.root_volume.clone(),
            metadata_options: spec.metadata_options.clone(),
            spot_max_price: spec.spot_max_price.clone(),
        }
    }

    /// Looks up a template by name with its latest version.
    ///
    /// # Errors
    ///
    /// Returns an error if a provider call fails.
    pub async fn get_launch_template(&self, name: &str) -> Result<Option<ObservedLaunchTemplate>> {
        let Some(template) = self
            .retry
            .run("DescribeLaunchTemplates", || {
                self.templates.describe_launch_template_by_name(name)
            })
            .await?
        else {
            return Ok(None);
        };

        let latest = self.latest_version_of(&template).await?;
        Ok(Some(ObservedLaunchTemplate { template, latest }))
    }

    /// Returns the id of the named template, if it exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider call fails.
    pub async fn get_launch_template_id(&self, name: &str) -> Result<Option<String>> {
        Ok(self
            .retry
            .run("DescribeLaunchTemplates", || {
                self.templates.describe_launch_template_by_name(name)
            })
            .await?
            .map(|t| t.id))
    }

    /// Returns the latest version number of a template.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the template does not exist.
    pub async fn get_latest_version(&self, template_id: &str) -> Result<u64> {
        Ok(self.describe(template_id).await?.latest_version)
    }

    /// Creates the template if no template with that name exists.
    ///
    /// Returns the id of the created or adopted template.
    ///
    /// # Errors
    ///
    /// Returns `Drift` if a concurrently created template with the same
    /// name carries different data, or any provider error.
    pub async fn create_launch_template(
        &self,
        ctx: &ReconcileContext,
        spec: &LaunchTemplateSpec,
        image_id: &str,
        user_data: &[u8],
    ) -> Result<String> {
        if let Some(id) = self.get_launch_template_id(&spec.name).await? {
            debug!(name = %spec.name, template_id = %id, "Launch template already exists");
            return Ok(id);
        }

        let data = Self::desired_data(spec, image_id, user_data);
        let tags = ctx.owned_tags(&spec.role, &spec.name, &spec.tags);
        let token = self.hasher.client_token(&spec.name, &data);

        let created = self
            .retry
            .run("CreateLaunchTemplate", || {
                self.templates
                    .create_launch_template(&spec.name, &data, user_data, &tags, &token)
            })
            .await;

        match created {
            Ok(template) => {
                info!(name = %spec.name, template_id = %template.id, "Created launch template");
                Ok(template.id)
            }
            Err(err) if err.class() == ErrorClass::AlreadyExists => {
                let Some(existing) = self.get_launch_template(&spec.name).await? else {
                    return Err(err.in_operation("CreateLaunchTemplate", &spec.name));
                };
                if needs_update(&existing.latest.data, &data)? {
                    return Err(ReconcileError::Drift {
                        resource: spec.name.clone(),
                        description: String::from(
                            "launch template was created concurrently with different data",
                        ),
                    }
                    .into());
                }
                info!(
                    name = %spec.name,
                    template_id = %existing.template.id,
                    "Adopted concurrently created launch template"
                );
                Ok(existing.template.id)
            }
            Err(err) => Err(err.in_operation("CreateLaunchTemplate", &spec.name)),
        }
    }

    /// Creates a new version unless the latest one already matches.
    ///
    /// The new version becomes the template's default.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the template does not exist, or any provider
    /// error.
    pub async fn create_version(
        &self,
        template_id: &str,
        spec: &LaunchTemplateSpec,
        image_id: &str,
        user_data: &[u8],
    ) -> Result<VersionOutcome> {
        let data = Self::desired_data(spec, image_id, user_data);

        let template = self.describe(template_id).await?;
        let latest = self.latest_version_of(&template).await?;
        if !needs_update(&latest.data, &data)? {
            debug!(template_id = %template_id, version = latest.number, "Latest version already matches");
            return Ok(VersionOutcome::AlreadyPresent(latest.number));
        }

        let token = self.hasher.client_token(template_id, &data);
        let created = self
            .retry
            .run("CreateLaunchTemplateVersion", || {
                self.templates
                    .create_launch_template_version(template_id, &data, user_data, &token)
            })
            .await;

        let version = match created {
            Ok(version) => version.number,
            Err(err) if err.class() == ErrorClass::AlreadyExists => {
                let template = self.describe(template_id).await?;
                let latest = self.latest_version_of(&template).await?;
                if needs_update(&latest.data, &data)? {
                    return Err(err.in_operation("CreateLaunchTemplateVersion", template_id));
                }
                return Ok(VersionOutcome::AlreadyPresent(latest.number));
            }
            Err(err) => return Err(err.in_operation("CreateLaunchTemplateVersion", template_id)),
        };

        self.retry
            .run("ModifyLaunchTemplate", || {
                self.templates.modify_default_version(template_id, version)
            })
            .await
            .map_err(|e| e.in_operation("ModifyLaunchTemplate", template_id))?;

        info!(template_id = %template_id, version, "Created launch template version");
        Ok(VersionOutcome::Created(version))
    }

    /// Returns the versions booted by live groups and instances.
    ///
    /// `$Latest` and `$Default` references are resolved against `template`.
    ///
    /// # Errors
    ///
    /// Returns an error if a provider call fails.
    pub async fn live_references(&self, template: &LaunchTemplate) -> Result<BTreeSet<u64>> {
        let groups = self
            .retry
            .run("DescribeAutoScalingGroups", || {
                self.autoscaling.describe_groups_using_template(&template.id)
            })
            .await?;

        let filter = InstanceFilter {
            launch_template_id: Some(template.id.clone()),
            ..InstanceFilter::default()
        };
        let instances = self
            .retry
            .run("DescribeInstances", || self.instances.describe_instances(&filter))
            .await?;

        let from_groups = groups
            .iter()
            .map(|g| resolve_version(&g.launch_template, template));
        let from_instances = instances
            .iter()
            .filter(|i| !i.state.is_terminal())
            .filter_map(|i| i.launch_template.as_ref())
            .filter(|r| r.template_id == template.id)
            .map(|r| resolve_version(r, template));

        Ok(from_groups.chain(from_instances).collect())
    }

    /// Deletes versions outside the retention set.
    ///
    /// Live references are read twice: once to plan, and again right
    /// before the delete call.
    ///
    /// # Errors
    ///
    /// Returns `InvariantViolation` if a version planned for deletion
    /// became referenced in between, or any provider error.
    pub async fn prune_versions(&self, template_id: &str) -> Result<PruneReport> {
        let template = self.describe(template_id).await?;
        let versions: Vec<u64> = self
            .retry
            .run("DescribeLaunchTemplateVersions", || {
                self.templates.describe_launch_template_versions(template_id)
            })
            .await?
            .iter()
            .map(|v| v.number)
            .collect();

        let live = self.live_references(&template).await?;
        let plan = plan_prune(&versions, &template, &live, self.retention);

        let mut report = PruneReport {
            template_id: template_id.to_string(),
            deleted: Vec::new(),
            kept: plan.keep.iter().copied().collect(),
        };
        if plan.delete.is_empty() {
            debug!(template_id = %template_id, kept = ?report.kept, "No versions to prune");
            return Ok(report);
        }

        let fresh = self.describe(template_id).await?;
        let mut protected = self.live_references(&fresh).await?;
        protected.insert(fresh.latest_version);
        protected.insert(fresh.default_version);
        verify_plan(template_id, &plan, &protected)?;

        match self
            .retry
            .run("DeleteLaunchTemplateVersions", || {
                self.templates
                    .delete_launch_template_versions(template_id, &plan.delete)
            })
            .await
        {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {
                debug!(template_id = %template_id, "Some versions were already deleted");
            }
            Err(err) => return Err(err.in_operation("DeleteLaunchTemplateVersions", template_id)),
        }

        info!(
            template_id = %template_id,
            deleted = ?plan.delete,
            kept = ?report.kept,
            "Pruned launch template versions"
        );
        report.deleted = plan.delete;
        Ok(report)
    }

    /// Deletes the named template.
    ///
    /// # Errors
    ///
    /// Returns `InvariantViolation` while any group or running instance
    /// still boots from the template, or any provider error.
    pub async fn delete_launch_template(&self, name: &str) -> Result<ConvergenceOutcome> {
        let Some(template) = self
            .retry
            .run("DescribeLaunchTemplates", || {
                self.templates.describe_launch_template_by_name(name)
            })
            .await?
        else {
            debug!(name = %name, "Launch template already absent");
            return Ok(ConvergenceOutcome::AlreadyAbsent);
        };

        let live = self.live_references(&template).await?;
        if !live.is_empty() {
            return Err(ReconcileError::InvariantViolation {
                resource_id: template.id,
                message: format!("versions {live:?} are still referenced by live consumers"),
            }
            .into());
        }

        match self
            .retry
            .run("DeleteLaunchTemplate", || {
                self.templates.delete_launch_template(&template.id)
            })
            .await
        {
            Ok(()) => {
                info!(name = %name, template_id = %template.id, "Deleted launch template");
                Ok(ConvergenceOutcome::Deleted)
            }
            Err(err) if err.is_not_found() => Ok(ConvergenceOutcome::AlreadyAbsent),
            Err(err) => Err(err.in_operation("DeleteLaunchTemplate", &template.id)),
        }
    }

    /// Resolves the image id for a spec.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` with kind `image` if no image matches.
    pub async fn discover_ami(&self, spec: &LaunchTemplateSpec) -> Result<String> {
        ami::discover_ami(self.templates.as_ref(), &self.retry, &spec.image).await
    }

    /// Converges one launch template to its spec.
    ///
    /// # Errors
    ///
    /// Returns an error if image discovery, a provider call, the drift
    /// comparison or a hook fails.
    pub async fn reconcile_launch_template(
        &self,
        ctx: &ReconcileContext,
        spec: &LaunchTemplateSpec,
        user_data: &[u8],
        hooks: &dyn LaunchTemplateHooks,
    ) -> Result<LaunchTemplateOutcome> {
        let image_id = self.discover_ami(spec).await?;
        let desired = Self::desired_data(spec, &image_id, user_data);

        let Some(observed) = self.get_launch_template(&spec.name).await? else {
            let template_id = self
                .create_launch_template(ctx, spec, &image_id, user_data)
                .await?;
            return Ok(LaunchTemplateOutcome::Created { template_id });
        };
        let template_id = observed.template.id.clone();

        let drift = drift_fields(&observed.latest.data, &desired)?;
        if drift.is_empty() {
            debug!(name = %spec.name, version = observed.latest.number, "Launch template converged");
            return self.finish_follow_up(&template_id, &observed.latest, hooks).await;
        }

        if !hooks.can_update().await? {
            info!(
                name = %spec.name,
                drift = ?drift,
                "Launch template update deferred until the consumer is ready"
            );
            return Ok(LaunchTemplateOutcome::Deferred { template_id, drift });
        }

        let version = match self
            .create_version(&template_id, spec, &image_id, user_data)
            .await?
        {
            VersionOutcome::Created(n) => n,
            VersionOutcome::AlreadyPresent(_) => {
                // Another reconciler created it and may not have rolled it out.
                let template = self.describe(&template_id).await?;
                let latest = self.latest_version_of(&template).await?;
                return self.finish_follow_up(&template_id, &latest, hooks).await;
            }
        };

        let pruned = self.prune_versions(&template_id).await;
        if let Err(err) = &pruned {
            warn!(template_id = %template_id, error = %err, "Version pruning failed");
        }
        hooks.after_update(&template_id, version).await?;

        Ok(LaunchTemplateOutcome::Updated {
            template_id,
            version,
            drift,
            pruned: pruned?,
        })
    }

    /// Prunes and rolls out a version whose data already matches.
    ///
    /// A pass that created a version can fail after the write. The next pass
    /// sees no drift, so pruning and the rollout are re-driven here.
    async fn finish_follow_up(
        &self,
        template_id: &str,
        latest: &LaunchTemplateVersion,
        hooks: &dyn LaunchTemplateHooks,
    ) -> Result<LaunchTemplateOutcome> {
        let pruned = self.prune_versions(template_id).await?;

        let rolled_out = hooks.rollout_pending(template_id, latest).await?;
        if rolled_out {
            info!(
                template_id = %template_id,
                version = latest.number,
                "Resuming rollout onto launch template version"
            );
            hooks.after_update(template_id, latest.number).await?;
        }

        if !rolled_out && pruned.deleted.is_empty() {
            return Ok(LaunchTemplateOutcome::Unchanged {
                template_id: template_id.to_string(),
                version: latest.number,
            });
        }
        Ok(LaunchTemplateOutcome::Resumed {
            template_id: template_id.to_string(),
            version: latest.number,
            rolled_out,
            pruned,
        })
    }

    async fn describe(&self, template_id: &str) -> Result<LaunchTemplate> {
        self.retry
            .run("DescribeLaunchTemplates", || {
                self.templates.describe_launch_template(template_id)
            })
            .await?
            .ok_or_else(|| ProviderError::not_found("launch template", template_id).into())
    }

    async fn latest_version_of(&self, template: &LaunchTemplate) -> Result<LaunchTemplateVersion> {
        let versions = self
            .retry
            .run("DescribeLaunchTemplateVersions", || {
                self.templates.describe_launch_template_versions(&template.id)
            })
            .await?;

        versions
            .into_iter()
            .find(|v| v.number == template.latest_version)
            .ok_or_else(|| {
                ProviderError::InvalidResponse {
                    message: format!(
                        "latest version {} of {} is not listed",
                        template.latest_version, template.id
                    ),
                }
                .into()
            })
    }
}

impl std::fmt::Debug for LaunchTemplateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchTemplateManager")
            .field("retry", &self.retry)
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Display for LaunchTemplateOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created { template_id } => write!(f, "created {template_id}"),
            Self::Updated {
                template_id,
                version,
                pruned,
                ..
            } => write!(
                f,
                "{template_id} updated to version {version} ({} pruned)",
                pruned.deleted.len()
            ),
            Self::Resumed {
                template_id,
                version,
                rolled_out,
                pruned,
            } => write!(
                f,
                "{template_id} resumed at version {version} (rolled out: {rolled_out}, {} pruned)",
                pruned.deleted.len()
            ),
            Self::Unchanged {
                template_id,
                version,
            } => write!(f, "{template_id} unchanged at version {version}"),
            Self::Deferred { template_id, drift } => {
                let fields: Vec<String> = drift.iter().map(ToString::to_string).collect();
                write!(f, "{template_id} update deferred ({})", fields.join(", "))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ImageSpec;
    use crate::provider::{
        GroupSettings, InstanceState, SimulatedProvider, TemplateRef, VersionRef,
    };
    use crate::tags::Tags;
    use std::sync::Mutex;

    fn spec(instance_type: &str) -> LaunchTemplateSpec {
        LaunchTemplateSpec {
            name: String::from("workers"),
            instance_type: instance_type.to_string(),
            image: ImageSpec {
                id: Some(String::from("ami-1")),
                lookup: None,
            },
            security_group_ids: vec![String::from("sg-a")],
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

    fn setup(retry: RetryPolicy) -> (Arc<SimulatedProvider>, LaunchTemplateManager) {
        let provider = Arc::new(SimulatedProvider::in_memory());
        let clients = ProviderClients::simulated(Arc::clone(&provider)).with_retry(retry);
        let manager = LaunchTemplateManager::new(&clients, RetentionPolicy { keep_latest: 2 });
        (provider, manager)
    }

    fn ctx() -> ReconcileContext {
        ReconcileContext::new("prod")
    }

    #[derive(Default)]
    struct RecordingHooks {
        refuse: bool,
        fail_next: Mutex<bool>,
        updates: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl LaunchTemplateHooks for RecordingHooks {
        async fn can_update(&self) -> Result<bool> {
            Ok(!self.refuse)
        }

        async fn after_update(&self, _template_id: &str, version: u64) -> Result<()> {
            if std::mem::take(&mut *self.fail_next.lock().expect("lock")) {
                return Err(ProviderError::transient("consumer unavailable").into());
            }
            self.updates.lock().expect("lock").push(version);
            Ok(())
        }

        async fn rollout_pending(
            &self,
            _template_id: &str,
            version: &LaunchTemplateVersion,
        ) -> Result<bool> {
            Ok(version.number > 1 && !self.updates.lock().expect("lock").contains(&version.number))
        }
    }

    #[tokio::test]
    async fn test_second_pass_is_noop() {
        let (provider, manager) = setup(RetryPolicy::none());
        let user_data = b"#cloud-config";

        let first = manager
            .reconcile_launch_template(&ctx(), &spec("m5.large"), user_data, &NoHooks)
            .await
            .expect("first pass");
        assert!(matches!(first, LaunchTemplateOutcome::Created { .. }));

        let second = manager
            .reconcile_launch_template(&ctx(), &spec("m5.large"), user_data, &NoHooks)
            .await
            .expect("second pass");

        assert!(matches!(second, LaunchTemplateOutcome::Unchanged { version: 1, .. }));
        assert_eq!(provider.call_count("CreateLaunchTemplate"), 1);
        assert_eq!(provider.call_count("CreateLaunchTemplateVersion"), 0);
    }

    #[tokio::test]
    async fn test_drift_creates_default_version_and_notifies() {
        let (provider, manager) = setup(RetryPolicy::none());
        let hooks = RecordingHooks::default();

        manager
            .reconcile_launch_template(&ctx(), &spec("m5.large"), b"", &hooks)
            .await
            .expect("create");
        let outcome = manager
            .reconcile_launch_template(&ctx(), &spec("m5.xlarge"), b"", &hooks)
            .await
            .expect("update");

        let LaunchTemplateOutcome::Updated {
            template_id,
            version,
            drift,
            ..
        } = outcome
        else {
            panic!("expected update, got {outcome:?}");
        };
        assert_eq!(version, 2);
        assert_eq!(drift, vec![DriftField::InstanceType]);
        assert_eq!(*hooks.updates.lock().expect("lock"), vec![2]);

        assert_eq!(manager.get_latest_version(&template_id).await.expect("latest"), 2);
        assert_eq!(provider.call_count("ModifyLaunchTemplate"), 1);
        let observed = manager
            .get_launch_template("workers")
            .await
            .expect("describe")
            .expect("present");
        assert_eq!(observed.template.default_version, 2);
    }

    #[tokio::test]
    async fn test_failed_after_update_resumes_next_pass() {
        let (provider, manager) = setup(RetryPolicy::none());
        let hooks = RecordingHooks::default();

        manager
            .reconcile_launch_template(&ctx(), &spec("m5.large"), b"", &hooks)
            .await
            .expect("create");
        *hooks.fail_next.lock().expect("lock") = true;
        manager
            .reconcile_launch_template(&ctx(), &spec("m5.xlarge"), b"", &hooks)
            .await
            .expect_err("consumer failed");
        assert!(hooks.updates.lock().expect("lock").is_empty());

        let resumed = manager
            .reconcile_launch_template(&ctx(), &spec("m5.xlarge"), b"", &hooks)
            .await
            .expect("resume");

        assert!(matches!(
            resumed,
            LaunchTemplateOutcome::Resumed {
                version: 2,
                rolled_out: true,
                ..
            }
        ));
        assert!(resumed.changed());
        assert_eq!(*hooks.updates.lock().expect("lock"), vec![2]);
        assert_eq!(provider.call_count("CreateLaunchTemplateVersion"), 1);

        let settled = manager
            .reconcile_launch_template(&ctx(), &spec("m5.xlarge"), b"", &hooks)
            .await
            .expect("settled");
        assert!(matches!(settled, LaunchTemplateOutcome::Unchanged { version: 2, .. }));
    }

    #[tokio::test]
    async fn test_failed_prune_resumes_next_pass() {
        let (provider, manager) = setup(RetryPolicy::none());
        let template_id = manager
            .create_launch_template(&ctx(), &spec("t3.small"), "ami-1", b"")
            .await
            .expect("create");
        for instance_type in ["t3.medium", "t3.large"] {
            manager
                .create_version(&template_id, &spec(instance_type), "ami-1", b"")
                .await
                .expect("version");
        }
        provider.inject_fault(
            "DeleteLaunchTemplateVersions",
            ProviderError::transient("connection reset"),
        );

        manager
            .reconcile_launch_template(&ctx(), &spec("t3.xlarge"), b"", &NoHooks)
            .await
            .expect_err("prune failed");
        assert_eq!(
            provider
                .inspect(|s| s.version_count(&template_id))
                .expect("inspect"),
            4
        );

        let resumed = manager
            .reconcile_launch_template(&ctx(), &spec("t3.xlarge"), b"", &NoHooks)
            .await
            .expect("resume");

        let LaunchTemplateOutcome::Resumed {
            version,
            rolled_out,
            pruned,
            ..
        } = resumed
        else {
            panic!("expected resumed prune, got {resumed:?}");
        };
        assert_eq!(version, 4);
        assert!(!rolled_out);
        assert_eq!(pruned.deleted, vec![1, 2]);
        assert_eq!(
            provider
                .inspect(|s| s.version_count(&template_id))
                .expect("inspect"),
            2
        );
    }

    #[tokio::test]
    async fn test_refused_update_is_deferred() {
        let (provider, manager) = setup(RetryPolicy::none());
        let hooks = RecordingHooks {
            refuse: true,
            ..RecordingHooks::default()
        };

        let created = manager
            .reconcile_launch_template(&ctx(), &spec("m5.large"), b"", &hooks)
            .await
            .expect("create");
        let outcome = manager
            .reconcile_launch_template(&ctx(), &spec("m5.xlarge"), b"", &hooks)
            .await
            .expect("deferred");

        assert!(matches!(outcome, LaunchTemplateOutcome::Deferred { .. }));
        assert_eq!(
            provider
                .inspect(|s| s.version_count(created.template_id()))
                .expect("inspect"),
            1
        );
        assert!(hooks.updates.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn test_lost_response_creates_one_version() {
        let (provider, manager) = setup(RetryPolicy::immediate(3));
        let template_id = manager
            .create_launch_template(&ctx(), &spec("m5.large"), "ami-1", b"")
            .await
            .expect("create");

        // The first attempt lands on the provider but its response is lost.
        let wanted = spec("m5.xlarge");
        let data = LaunchTemplateManager::desired_data(&wanted, "ami-1", b"");
        let token = ConfigHasher::new().client_token(&template_id, &data);
        let hook_id = template_id.clone();
        provider.on_call(
            "CreateLaunchTemplateVersion",
            1,
            Box::new(move |s| {
                s.insert_version(&hook_id, &data, b"", &token)
                    .expect("insert");
            }),
        );
        provider.inject_fault(
            "CreateLaunchTemplateVersion",
            ProviderError::transient("connection reset"),
        );

        let outcome = manager
            .create_version(&template_id, &wanted, "ami-1", b"")
            .await
            .expect("create version");

        assert_eq!(outcome, VersionOutcome::Created(2));
        assert_eq!(provider.call_count("CreateLaunchTemplateVersion"), 2);
        assert_eq!(
            provider
                .inspect(|s| s.version_count(&template_id))
                .expect("inspect"),
            2
        );
    }

    #[tokio::test]
    async fn test_throttled_create_yields_one_version() {
        let (provider, manager) = setup(RetryPolicy::immediate(3));
        let template_id = manager
            .create_launch_template(&ctx(), &spec("m5.large"), "ami-1", b"")
            .await
            .expect("create");
        provider.inject_fault(
            "CreateLaunchTemplateVersion",
            ProviderError::Throttled {
                retry_after_secs: 0,
            },
        );

        let outcome = manager
            .create_version(&template_id, &spec("c5.large"), "ami-1", b"")
            .await
            .expect("create version");

        assert_eq!(outcome, VersionOutcome::Created(2));
        assert_eq!(
            provider
                .inspect(|s| s.version_count(&template_id))
                .expect("inspect"),
            2
        );
    }

    #[tokio::test]
    async fn test_matching_latest_is_already_present() {
        let (provider, manager) = setup(RetryPolicy::none());
        let template_id = manager
            .create_launch_template(&ctx(), &spec("m5.large"), "ami-1", b"")
            .await
            .expect("create");

        let outcome = manager
            .create_version(&template_id, &spec("M5.Large"), "ami-1", b"")
            .await
            .expect("create version");

        assert_eq!(outcome, VersionOutcome::AlreadyPresent(1));
        assert_eq!(provider.call_count("CreateLaunchTemplateVersion"), 0);
    }

    async fn five_versions(manager: &LaunchTemplateManager) -> String {
        let template_id = manager
            .create_launch_template(&ctx(), &spec("t3.small"), "ami-1", b"")
            .await
            .expect("create");
        for instance_type in ["t3.medium", "t3.large", "t3.xlarge", "t3.2xlarge"] {
            manager
                .create_version(&template_id, &spec(instance_type), "ami-1", b"")
                .await
                .expect("version");
        }
        template_id
    }

    #[tokio::test]
    async fn test_prune_keeps_referenced_version() {
        let (provider, manager) = setup(RetryPolicy::none());
        let template_id = five_versions(&manager).await;
        let reference = TemplateRef {
            template_id: template_id.clone(),
            version: VersionRef::Number(3),
        };
        provider
            .seed(|s| s.run_instance(Some(reference), Tags::new()))
            .expect("seed");

        let report = manager.prune_versions(&template_id).await.expect("prune");

        assert_eq!(report.deleted, vec![1, 2]);
        assert_eq!(report.kept, vec![3, 4, 5]);
        assert_eq!(
            provider
                .inspect(|s| s.version_count(&template_id))
                .expect("inspect"),
            3
        );
    }

    #[tokio::test]
    async fn test_terminated_instances_do_not_pin_versions() {
        let (provider, manager) = setup(RetryPolicy::none());
        let template_id = five_versions(&manager).await;
        let reference = TemplateRef {
            template_id: template_id.clone(),
            version: VersionRef::Number(1),
        };
        provider
            .seed(|s| {
                let id = s.run_instance(Some(reference), Tags::new());
                s.set_instance_state(&id, InstanceState::Terminated);
            })
            .expect("seed");

        let report = manager.prune_versions(&template_id).await.expect("prune");

        assert_eq!(report.deleted, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_prune_aborts_when_reference_appears() {
        let (provider, manager) = setup(RetryPolicy::none());
        let template_id = five_versions(&manager).await;
        let settings = GroupSettings {
            launch_template: TemplateRef {
                template_id: template_id.clone(),
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

        // Another actor pins version 2 between planning and deleting.
        let pinned = TemplateRef {
            template_id: template_id.clone(),
            version: VersionRef::Number(2),
        };
        provider.on_call(
            "DescribeAutoScalingGroups",
            2,
            Box::new(move |s| s.set_group_template("pool-a", pinned)),
        );

        let err = manager
            .prune_versions(&template_id)
            .await
            .expect_err("race detected");

        assert_eq!(err.class(), ErrorClass::InvariantViolation);
        assert_eq!(provider.call_count("DeleteLaunchTemplateVersions"), 0);
        assert_eq!(
            provider
                .inspect(|s| s.version_count(&template_id))
                .expect("inspect"),
            5
        );
    }

    #[tokio::test]
    async fn test_delete_refused_while_instances_run() {
        let (provider, manager) = setup(RetryPolicy::none());
        let template_id = manager
            .create_launch_template(&ctx(), &spec("m5.large"), "ami-1", b"")
            .await
            .expect("create");
        let instance = provider
            .seed(|s| {
                s.run_instance(
                    Some(TemplateRef {
                        template_id: template_id.clone(),
                        version: VersionRef::Default,
                    }),
                    Tags::new(),
                )
            })
            .expect("seed");

        let err = manager
            .delete_launch_template("workers")
            .await
            .expect_err("in use");
        assert_eq!(err.class(), ErrorClass::InvariantViolation);

        provider
            .seed(|s| s.set_instance_state(&instance, InstanceState::Terminated))
            .expect("seed");
        assert_eq!(
            manager.delete_launch_template("workers").await.expect("delete"),
            ConvergenceOutcome::Deleted
        );
        assert_eq!(
            manager.delete_launch_template("workers").await.expect("delete again"),
            ConvergenceOutcome::AlreadyAbsent
        );
    }

    #[tokio::test]
    async fn test_create_adopts_existing_template() {
        let (provider, manager) = setup(RetryPolicy::none());
        let first = manager
            .create_launch_template(&ctx(), &spec("m5.large"), "ami-1", b"")
            .await
            .expect("create");
        let second = manager
            .create_launch_template(&ctx(), &spec("m5.large"), "ami-1", b"")
            .await
            .expect("adopt");

        assert_eq!(first, second);
        assert_eq!(provider.call_count("CreateLaunchTemplate"), 1);
    }
}
