//! Cluster VPC.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::NetworkConfig;
use crate::context::{ReconcileContext, OWNERSHIP_OWNED};
use crate::error::{ReconcileError, Result};
use crate::provider::{NetworkApi, ProviderClients, RetryPolicy, Vpc};
use crate::tags::{ResourceTagUpdate, TagReconciler, Tags};

use super::{ConvergenceOutcome, ResourceConvergencePair, ResourceKind};

/// Role tag value for the cluster VPC.
pub const NETWORK_ROLE: &str = "network";

/// Finds the VPC carrying the cluster ownership tag.
pub(crate) async fn find_cluster_vpc(
    network: &dyn NetworkApi,
    retry: &RetryPolicy,
    ctx: &ReconcileContext,
) -> Result<Option<Vpc>> {
    let key = ctx.ownership_key();
    retry
        .run("DescribeVpcs", || network.describe_vpc_by_tag(&key, OWNERSHIP_OWNED))
        .await
}

/// Reconcile/delete pair for the cluster VPC.
#[derive(Clone)]
pub struct NetworkPair {
    network: Arc<dyn NetworkApi>,
    tags: TagReconciler,
    retry: RetryPolicy,
    config: NetworkConfig,
    name: String,
}

impl NetworkPair {
    /// Creates the pair.
    #[must_use]
    pub fn new(clients: &ProviderClients, config: NetworkConfig, name: impl Into<String>) -> Self {
        Self {
            network: Arc::clone(&clients.network),
            tags: TagReconciler::new(Arc::clone(&clients.tagging), clients.retry.clone()),
            retry: clients.retry.clone(),
            config,
            name: name.into(),
        }
    }

    /// Returns the cluster VPC, if it exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider call fails.
    pub async fn find(&self, ctx: &ReconcileContext) -> Result<Option<Vpc>> {
        find_cluster_vpc(self.network.as_ref(), &self.retry, ctx).await
    }

    fn desired_tags(&self, ctx: &ReconcileContext) -> Tags {
        ctx.owned_tags(NETWORK_ROLE, &self.name, &Tags::new())
    }

    /// Creates the VPC. `CreateVpc` takes no idempotency token, so every
    /// retry first looks for a VPC an earlier attempt may have created.
    async fn create(&self, ctx: &ReconcileContext, tags: &Tags) -> Result<Vpc> {
        let key = ctx.ownership_key();
        let mut attempt = 0u32;

        self.retry
            .run("CreateVpc", || {
                attempt += 1;
                let retrying = attempt > 1;
                let key = key.as_str();
                async move {
                    if retrying
                        && let Some(vpc) = self.network.describe_vpc_by_tag(key, OWNERSHIP_OWNED).await?
                    {
                        debug!(vpc_id = %vpc.id, "VPC from an earlier attempt found, adopting it");
                        return Ok(vpc);
                    }
                    self.network.create_vpc(&self.config.cidr, tags).await
                }
            })
            .await
            .map_err(|e| e.in_operation("CreateVpc", &self.name))
    }
}

#[async_trait]
impl ResourceConvergencePair for NetworkPair {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Network
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn reconcile(&self, ctx: &ReconcileContext) -> Result<ConvergenceOutcome> {
        let desired_tags = self.desired_tags(ctx);

        let Some(vpc) = self.find(ctx).await? else {
            let vpc = self.create(ctx, &desired_tags).await?;
            info!(vpc_id = %vpc.id, cidr = %vpc.cidr, "Created VPC");
            return Ok(ConvergenceOutcome::Created);
        };

        // The CIDR of an existing VPC cannot be changed in place.
        if vpc.cidr != self.config.cidr {
            return Err(ReconcileError::Drift {
                resource: vpc.id,
                description: format!(
                    "CIDR is {} but {} is desired",
                    vpc.cidr, self.config.cidr
                ),
            }
            .into());
        }

        let report = self
            .tags
            .reconcile_tags(
                ctx,
                &[ResourceTagUpdate {
                    resource_id: vpc.id.clone(),
                    desired: desired_tags,
                }],
            )
            .await?;

        if report.updated.is_empty() {
            debug!(vpc_id = %vpc.id, "VPC converged");
            Ok(ConvergenceOutcome::Unchanged)
        } else {
            Ok(ConvergenceOutcome::Updated)
        }
    }

    async fn delete(&self, ctx: &ReconcileContext) -> Result<ConvergenceOutcome> {
        let Some(vpc) = self.find(ctx).await? else {
            return Ok(ConvergenceOutcome::AlreadyAbsent);
        };

        match self
            .retry
            .run("DeleteVpc", || self.network.delete_vpc(&vpc.id))
            .await
        {
            Ok(()) => {
                info!(vpc_id = %vpc.id, "Deleted VPC");
                Ok(ConvergenceOutcome::Deleted)
            }
            Err(err) if err.is_not_found() => Ok(ConvergenceOutcome::AlreadyAbsent),
            Err(err) => Err(err.in_operation("DeleteVpc", &vpc.id)),
        }
    }
}

impl std::fmt::Debug for NetworkPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkPair")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
