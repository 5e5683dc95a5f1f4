//! API-server load balancer convergence.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::LoadBalancerConfig;
use crate::context::ReconcileContext;
use crate::convergence::{ConvergenceOutcome, ResourceConvergencePair, ResourceKind};
use crate::error::{ErrorClass, ReconcileError, Result};
use crate::provider::{LoadBalancer, LoadBalancerApi, ProviderClients, RetryPolicy};
use crate::tags::{ResourceTagUpdate, TagReconciler, Tags};

/// Role tag value for the API-server load balancer.
pub const LOAD_BALANCER_ROLE: &str = "apiserver";

/// Reconcile/delete pair for the API-server load balancer or target group.
#[derive(Clone)]
pub struct LoadBalancerPair {
    load_balancers: Arc<dyn LoadBalancerApi>,
    tags: TagReconciler,
    retry: RetryPolicy,
    config: LoadBalancerConfig,
}

impl LoadBalancerPair {
    /// Creates the pair.
    #[must_use]
    pub fn new(clients: &ProviderClients, config: LoadBalancerConfig) -> Self {
        Self {
            load_balancers: Arc::clone(&clients.load_balancers),
            tags: TagReconciler::new(Arc::clone(&clients.tagging), clients.retry.clone()),
            retry: clients.retry.clone(),
            config,
        }
    }

    /// Returns the load balancer, if it exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider call fails.
    pub async fn find(&self) -> Result<Option<LoadBalancer>> {
        self.retry
            .run("DescribeLoadBalancers", || {
                self.load_balancers
                    .describe_load_balancer(&self.config.name, self.config.kind)
            })
            .await
    }
}

#[async_trait]
impl ResourceConvergencePair for LoadBalancerPair {
    fn kind(&self) -> ResourceKind {
        ResourceKind::LoadBalancer
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    async fn reconcile(&self, ctx: &ReconcileContext) -> Result<ConvergenceOutcome> {
        let desired_tags = ctx.owned_tags(LOAD_BALANCER_ROLE, &self.config.name, &Tags::new());

        let Some(lb) = self.find().await? else {
            return match self
                .retry
                .run("CreateLoadBalancer", || {
                    self.load_balancers.create_load_balancer(
                        &self.config.name,
                        self.config.kind,
                        self.config.port,
                        &desired_tags,
                    )
                })
                .await
            {
                Ok(lb) => {
                    info!(name = %lb.name, kind = %lb.kind, target = %lb.target(), "Created load balancer");
                    Ok(ConvergenceOutcome::Created)
                }
                Err(err) if err.class() == ErrorClass::AlreadyExists => Ok(ConvergenceOutcome::Unchanged),
                Err(err) => Err(err.in_operation("CreateLoadBalancer", &self.config.name)),
            };
        };

        if lb.port != self.config.port {
            return Err(ReconcileError::Drift {
                resource: lb.name,
                description: format!("port is {} but {} is desired", lb.port, self.config.port),
            }
            .into());
        }

        let report = self
            .tags
            .reconcile_tags(
                ctx,
                &[ResourceTagUpdate {
                    resource_id: lb.resource_id().to_string(),
                    desired: desired_tags,
                }],
            )
            .await?;

        if report.updated.is_empty() {
            debug!(name = %lb.name, "Load balancer converged");
            Ok(ConvergenceOutcome::Unchanged)
        } else {
            Ok(ConvergenceOutcome::Updated)
        }
    }

    async fn delete(&self, _ctx: &ReconcileContext) -> Result<ConvergenceOutcome> {
        if self.find().await?.is_none() {
            return Ok(ConvergenceOutcome::AlreadyAbsent);
        }

        match self
            .retry
            .run("DeleteLoadBalancer", || {
                self.load_balancers
                    .delete_load_balancer(&self.config.name, self.config.kind)
            })
            .await
        {
            Ok(()) => {
                info!(name = %self.config.name, kind = %self.config.kind, "Deleted load balancer");
                Ok(ConvergenceOutcome::Deleted)
            }
            Err(err) if err.is_not_found() => Ok(ConvergenceOutcome::AlreadyAbsent),
            Err(err) => Err(err.in_operation("DeleteLoadBalancer", &self.config.name)),
        }
    }
}

impl std::fmt::Debug for LoadBalancerPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBalancerPair")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
