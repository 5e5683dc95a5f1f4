//! Security groups inside the cluster VPC.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::{IngressRule, SecurityGroupSpec};
use crate::context::ReconcileContext;
use crate::error::{ErrorClass, ProviderError, ReconcileError, Result};
use crate::provider::{NetworkApi, ProviderClients, RetryPolicy, SecurityGroup};
use crate::tags::{ResourceTagUpdate, TagReconciler, Tags};

use super::network::find_cluster_vpc;
use super::{ConvergenceOutcome, ResourceConvergencePair, ResourceKind};

/// Role tag value for security groups.
pub const SECURITY_GROUP_ROLE: &str = "security-group";

/// Ingress changes that converge a group's rules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngressDiff {
    /// Rules to authorize.
    pub authorize: Vec<IngressRule>,
    /// Rules to revoke.
    pub revoke: Vec<IngressRule>,
}

impl IngressDiff {
    /// Compares rules as sets.
    #[must_use]
    pub fn between(desired: &[IngressRule], observed: &BTreeSet<IngressRule>) -> Self {
        let desired: BTreeSet<&IngressRule> = desired.iter().collect();
        Self {
            authorize: desired
                .iter()
                .filter(|r| !observed.contains(**r))
                .map(|r| (*r).clone())
                .collect(),
            revoke: observed
                .iter()
                .filter(|r| !desired.contains(r))
                .cloned()
                .collect(),
        }
    }

    /// Returns true if nothing changes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.authorize.is_empty() && self.revoke.is_empty()
    }
}

/// Reconcile/delete pair for one security group.
#[derive(Clone)]
pub struct SecurityGroupPair {
    network: Arc<dyn NetworkApi>,
    tags: TagReconciler,
    retry: RetryPolicy,
    spec: SecurityGroupSpec,
}

impl SecurityGroupPair {
    /// Creates the pair.
    #[must_use]
    pub fn new(clients: &ProviderClients, spec: SecurityGroupSpec) -> Self {
        Self {
            network: Arc::clone(&clients.network),
            tags: TagReconciler::new(Arc::clone(&clients.tagging), clients.retry.clone()),
            retry: clients.retry.clone(),
            spec,
        }
    }

    /// Returns the group with this pair's name in the cluster VPC.
    ///
    /// # Errors
    ///
    /// Returns an error if a provider call fails.
    pub async fn find(&self, ctx: &ReconcileContext) -> Result<Option<SecurityGroup>> {
        let Some(vpc) = find_cluster_vpc(self.network.as_ref(), &self.retry, ctx).await? else {
            return Ok(None);
        };
        self.find_in(&vpc.id).await
    }

    async fn find_in(&self, vpc_id: &str) -> Result<Option<SecurityGroup>> {
        let groups = self
            .retry
            .run("DescribeSecurityGroups", || {
                self.network.describe_security_groups(vpc_id)
            })
            .await?;
        Ok(groups.into_iter().find(|g| g.name == self.spec.name))
    }

    /// Creates the group, adopting one with the same name if an earlier
    /// attempt created it before its response was lost.
    async fn create_in(&self, vpc_id: &str, tags: &Tags) -> Result<SecurityGroup> {
        let created = self
            .retry
            .run("CreateSecurityGroup", || {
                self.network.create_security_group(
                    vpc_id,
                    &self.spec.name,
                    &self.spec.description,
                    tags,
                )
            })
            .await;

        match created {
            Ok(group) => Ok(group),
            Err(err) if err.class() == ErrorClass::AlreadyExists => {
                let Some(group) = self.find_in(vpc_id).await? else {
                    return Err(err.in_operation("CreateSecurityGroup", &self.spec.name));
                };
                debug!(group_id = %group.id, "Adopting security group with the same name");
                Ok(group)
            }
            Err(err) => Err(err.in_operation("CreateSecurityGroup", &self.spec.name)),
        }
    }

    fn ensure_owned(&self, ctx: &ReconcileContext, group: &SecurityGroup) -> Result<()> {
        if ctx.is_owned(&group.tags) {
            return Ok(());
        }
        Err(ReconcileError::Drift {
            resource: group.id.clone(),
            description: format!(
                "security group {} exists but is not owned by cluster {}",
                self.spec.name, ctx.cluster
            ),
        }
        .into())
    }

    async fn apply_ingress(&self, group_id: &str, diff: &IngressDiff) -> Result<()> {
        if !diff.authorize.is_empty() {
            self.retry
                .run("AuthorizeSecurityGroupIngress", || {
                    self.network.authorize_ingress(group_id, &diff.authorize)
                })
                .await
                .map_err(|e| e.in_operation("AuthorizeSecurityGroupIngress", group_id))?;
        }
        if !diff.revoke.is_empty() {
            self.retry
                .run("RevokeSecurityGroupIngress", || {
                    self.network.revoke_ingress(group_id, &diff.revoke)
                })
                .await
                .map_err(|e| e.in_operation("RevokeSecurityGroupIngress", group_id))?;
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceConvergencePair for SecurityGroupPair {
    fn kind(&self) -> ResourceKind {
        ResourceKind::SecurityGroup
    }

    fn name(&self) -> &str {
        &self.spec.name
    }

    async fn reconcile(&self, ctx: &ReconcileContext) -> Result<ConvergenceOutcome> {
        let vpc = find_cluster_vpc(self.network.as_ref(), &self.retry, ctx)
            .await?
            .ok_or_else(|| ProviderError::not_found("vpc", ctx.ownership_key()))?;
        let desired_tags = ctx.owned_tags(SECURITY_GROUP_ROLE, &self.spec.name, &Tags::new());

        let Some(group) = self.find_in(&vpc.id).await? else {
            let group = self.create_in(&vpc.id, &desired_tags).await?;
            self.ensure_owned(ctx, &group)?;
            let diff = IngressDiff::between(&self.spec.ingress, &group.ingress);
            self.apply_ingress(&group.id, &diff).await?;
            info!(group_id = %group.id, name = %group.name, "Created security group");
            return Ok(ConvergenceOutcome::Created);
        };

        self.ensure_owned(ctx, &group)?;

        let diff = IngressDiff::between(&self.spec.ingress, &group.ingress);
        self.apply_ingress(&group.id, &diff).await?;

        let report = self
            .tags
            .reconcile_tags(
                ctx,
                &[ResourceTagUpdate {
                    resource_id: group.id.clone(),
                    desired: desired_tags,
                }],
            )
            .await?;

        if diff.is_empty() && report.updated.is_empty() {
            debug!(group_id = %group.id, "Security group converged");
            Ok(ConvergenceOutcome::Unchanged)
        } else {
            info!(
                group_id = %group.id,
                authorized = diff.authorize.len(),
                revoked = diff.revoke.len(),
                "Updated security group"
            );
            Ok(ConvergenceOutcome::Updated)
        }
    }

    async fn delete(&self, ctx: &ReconcileContext) -> Result<ConvergenceOutcome> {
        let Some(group) = self.find(ctx).await? else {
            return Ok(ConvergenceOutcome::AlreadyAbsent);
        };

        if !ctx.is_owned(&group.tags) {
            warn!(group_id = %group.id, "Security group not owned by this cluster, leaving it");
            return Ok(ConvergenceOutcome::Unchanged);
        }

        match self
            .retry
            .run("DeleteSecurityGroup", || {
                self.network.delete_security_group(&group.id)
            })
            .await
        {
            Ok(()) => {
                info!(group_id = %group.id, "Deleted security group");
                Ok(ConvergenceOutcome::Deleted)
            }
            Err(err) if err.is_not_found() => Ok(ConvergenceOutcome::AlreadyAbsent),
            Err(err) => Err(err.in_operation("DeleteSecurityGroup", &group.id)),
        }
    }
}

impl std::fmt::Debug for SecurityGroupPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityGroupPair")
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}
