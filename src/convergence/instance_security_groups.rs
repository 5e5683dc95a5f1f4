//! Security groups attached to live instances.
//!
//! Groups are compared per network interface as sets. Interfaces whose set
//! differs are rewritten with the desired groups; matching interfaces are
//! left alone.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info};

use crate::context::{ReconcileContext, OWNERSHIP_OWNED, ROLE_TAG};
use crate::error::Result;
use crate::provider::{InstanceApi, InstanceFilter, NetworkInterface, ProviderClients, RetryPolicy};

use super::{ConvergenceOutcome, ResourceConvergencePair, ResourceKind};

/// Difference between one interface's groups and the desired groups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttachmentDrift {
    /// Interface id.
    pub interface_id: String,
    /// Groups to attach.
    pub attach: Vec<String>,
    /// Groups to detach.
    pub detach: Vec<String>,
}

/// Returns the interfaces whose groups differ from `desired`.
#[must_use]
pub fn attachment_drift(
    desired: &BTreeSet<String>,
    interfaces: &[NetworkInterface],
) -> Vec<AttachmentDrift> {
    interfaces
        .iter()
        .filter(|i| i.security_group_ids != *desired)
        .map(|i| AttachmentDrift {
            interface_id: i.id.clone(),
            attach: desired
                .difference(&i.security_group_ids)
                .cloned()
                .collect(),
            detach: i
                .security_group_ids
                .difference(desired)
                .cloned()
                .collect(),
        })
        .collect()
}

/// Keeps the security groups of every live instance with one role in sync.
#[derive(Clone)]
pub struct InstanceSecurityGroupsPair {
    instances: Arc<dyn InstanceApi>,
    retry: RetryPolicy,
    role: String,
    desired: BTreeSet<String>,
}

impl InstanceSecurityGroupsPair {
    /// Creates the pair for instances tagged with `role`.
    #[must_use]
    pub fn new<I, S>(clients: &ProviderClients, role: impl Into<String>, group_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            instances: Arc::clone(&clients.instances),
            retry: clients.retry.clone(),
            role: role.into(),
            desired: group_ids.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns the drifted interfaces of one instance.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the instance is gone, or any provider error.
    pub async fn drift(&self, instance_id: &str) -> Result<Vec<AttachmentDrift>> {
        let interfaces = self
            .retry
            .run("DescribeNetworkInterfaces", || {
                self.instances.describe_network_interfaces(instance_id)
            })
            .await?;
        Ok(attachment_drift(&self.desired, &interfaces))
    }

    /// Converges the groups of one instance.
    ///
    /// An instance that terminated in the meantime is reported as absent.
    ///
    /// # Errors
    ///
    /// Returns an error if a provider call fails for another reason.
    pub async fn reconcile_instance(&self, instance_id: &str) -> Result<ConvergenceOutcome> {
        let drift = match self.drift(instance_id).await {
            Ok(drift) => drift,
            Err(err) if err.is_not_found() => return Ok(ConvergenceOutcome::AlreadyAbsent),
            Err(err) => return Err(err.in_operation("DescribeNetworkInterfaces", instance_id)),
        };
        if drift.is_empty() {
            return Ok(ConvergenceOutcome::Unchanged);
        }

        let group_ids: Vec<String> = self.desired.iter().cloned().collect();
        for change in &drift {
            match self
                .retry
                .run("ModifyNetworkInterfaceAttribute", || {
                    self.instances
                        .modify_network_interface_security_groups(&change.interface_id, &group_ids)
                })
                .await
            {
                Ok(()) => info!(
                    instance_id = %instance_id,
                    interface_id = %change.interface_id,
                    attached = ?change.attach,
                    detached = ?change.detach,
                    "Updated instance security groups"
                ),
                // Interfaces go away with their instance.
                Err(err) if err.is_not_found() => {
                    debug!(interface_id = %change.interface_id, "Network interface gone");
                }
                Err(err) => {
                    return Err(
                        err.in_operation("ModifyNetworkInterfaceAttribute", &change.interface_id)
                    );
                }
            }
        }
        Ok(ConvergenceOutcome::Updated)
    }
}

#[async_trait]
impl ResourceConvergencePair for InstanceSecurityGroupsPair {
    fn kind(&self) -> ResourceKind {
        ResourceKind::InstanceSecurityGroups
    }

    fn name(&self) -> &str {
        &self.role
    }

    async fn reconcile(&self, ctx: &ReconcileContext) -> Result<ConvergenceOutcome> {
        let filter = InstanceFilter {
            tag: Some((ctx.ownership_key(), OWNERSHIP_OWNED.to_string())),
            ..InstanceFilter::default()
        };
        let instances = self
            .retry
            .run("DescribeInstances", || self.instances.describe_instances(&filter))
            .await?;

        let mut outcome = ConvergenceOutcome::Unchanged;
        for instance in instances
            .iter()
            .filter(|i| i.state.is_live())
            .filter(|i| i.tags.get(ROLE_TAG) == Some(&self.role))
        {
            if self.reconcile_instance(&instance.id).await? == ConvergenceOutcome::Updated {
                outcome = ConvergenceOutcome::Updated;
            }
        }
        Ok(outcome)
    }

    async fn delete(&self, _ctx: &ReconcileContext) -> Result<ConvergenceOutcome> {
        debug!(role = %self.role, "Security group attachments are removed with their instances");
        Ok(ConvergenceOutcome::Unchanged)
    }
}

impl std::fmt::Debug for InstanceSecurityGroupsPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceSecurityGroupsPair")
            .field("role", &self.role)
            .field("desired", &self.desired)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{InstanceState, MockInstanceApi, SimulatedProvider, SimulatedState};
    use crate::tags::Tags;

    fn interface(id: &str, groups: &[&str]) -> NetworkInterface {
        NetworkInterface {
            id: id.to_string(),
            instance_id: String::from("i-1"),
            security_group_ids: groups.iter().map(|g| (*g).to_string()).collect(),
        }
    }

    fn desired(groups: &[&str]) -> BTreeSet<String> {
        groups.iter().map(|g| (*g).to_string()).collect()
    }

    fn pair(provider: &Arc<SimulatedProvider>) -> InstanceSecurityGroupsPair {
        let clients = ProviderClients::simulated(Arc::clone(provider)).with_retry(RetryPolicy::none());
        InstanceSecurityGroupsPair::new(&clients, "node", ["sg-core", "sg-extra"])
    }

    fn node_tags(ctx: &ReconcileContext) -> Tags {
        ctx.owned_tags("node", "worker", &Tags::new())
    }

    #[test]
    fn test_drift_is_set_based_per_interface() {
        let interfaces = [
            interface("eni-1", &["sg-extra", "sg-core"]),
            interface("eni-2", &["sg-core", "sg-manual"]),
        ];

        let drift = attachment_drift(&desired(&["sg-core", "sg-extra"]), &interfaces);

        assert_eq!(
            drift,
            vec![AttachmentDrift {
                interface_id: String::from("eni-2"),
                attach: vec![String::from("sg-extra")],
                detach: vec![String::from("sg-manual")],
            }]
        );
    }

    #[tokio::test]
    async fn test_live_instances_converge() {
        let provider = Arc::new(SimulatedProvider::in_memory());
        let ctx = ReconcileContext::new("prod");
        let (node, other, stopped) = provider
            .seed(|s| {
                let node = s.run_instance(None, node_tags(&ctx));
                s.attach_interface(&node, &["sg-core"]);
                let other = s.run_instance(None, ctx.owned_tags("bastion", "b", &Tags::new()));
                let stopped = s.run_instance(None, node_tags(&ctx));
                s.set_instance_state(&stopped, InstanceState::Stopped);
                (node, other, stopped)
            })
            .expect("seed");
        let groups = pair(&provider);

        assert_eq!(groups.reconcile(&ctx).await.expect("reconcile"), ConvergenceOutcome::Updated);
        assert_eq!(provider.call_count("ModifyNetworkInterfaceAttribute"), 2);

        let interfaces = provider
            .inspect(|s| s.interfaces_of(&node))
            .expect("inspect");
        assert!(
            interfaces
                .iter()
                .all(|i| i.security_group_ids == desired(&["sg-core", "sg-extra"]))
        );
        for untouched in [&other, &stopped] {
            let interfaces = provider
                .inspect(|s: &SimulatedState| s.interfaces_of(untouched))
                .expect("inspect");
            assert!(interfaces.iter().all(|i| i.security_group_ids.is_empty()));
        }

        assert_eq!(groups.reconcile(&ctx).await.expect("again"), ConvergenceOutcome::Unchanged);
        assert_eq!(provider.call_count("ModifyNetworkInterfaceAttribute"), 2);
    }

    #[tokio::test]
    async fn test_terminated_instance_is_absent() {
        let provider = Arc::new(SimulatedProvider::in_memory());
        let ctx = ReconcileContext::new("prod");
        let instance = provider
            .seed(|s| {
                let id = s.run_instance(None, node_tags(&ctx));
                s.set_instance_state(&id, InstanceState::Terminated);
                id
            })
            .expect("seed");

        assert_eq!(
            pair(&provider).reconcile_instance(&instance).await.expect("reconcile"),
            ConvergenceOutcome::AlreadyAbsent
        );
        assert_eq!(provider.call_count("ModifyNetworkInterfaceAttribute"), 0);
    }

    #[tokio::test]
    async fn test_interface_detached_during_update() {
        let mut instances = MockInstanceApi::new();
        instances
            .expect_describe_network_interfaces()
            .returning(|_| Ok(vec![interface("eni-1", &[])]));
        instances
            .expect_modify_network_interface_security_groups()
            .times(1)
            .returning(|id, _| {
                Err(crate::error::ProviderError::not_found("network interface", id).into())
            });

        let mut clients = ProviderClients::simulated(Arc::new(SimulatedProvider::in_memory()))
            .with_retry(RetryPolicy::none());
        clients.instances = Arc::new(instances);
        let groups = InstanceSecurityGroupsPair::new(&clients, "node", ["sg-core"]);

        assert_eq!(
            groups.reconcile_instance("i-1").await.expect("reconcile"),
            ConvergenceOutcome::Updated
        );
    }
}
