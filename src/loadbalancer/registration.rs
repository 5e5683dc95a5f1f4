//! Load balancer target registration.
//!
//! Membership is re-derived from the provider on every call and changed one
//! instance at a time. Registering an instance that is gone is reported as
//! an outcome, not an error, since instances routinely terminate between a
//! caller's decision and the call itself.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{ErrorClass, Result};
use crate::provider::{
    InstanceApi, LoadBalancerApi, LoadBalancerTarget, ProviderClients, RetryPolicy,
    TargetHealth, TargetHealthState,
};

/// Result of a registration change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationOutcome {
    /// The instance was registered.
    Registered,
    /// The instance was already a member.
    AlreadyRegistered,
    /// The instance was deregistered.
    Deregistered,
    /// The instance was not a member.
    AlreadyDeregistered,
    /// The instance no longer exists or is terminating.
    InstanceGone,
}

impl RegistrationOutcome {
    /// Returns true if membership changed.
    #[must_use]
    pub const fn changed(self) -> bool {
        matches!(self, Self::Registered | Self::Deregistered)
    }
}

/// Registers and deregisters instances with load balancer targets.
#[derive(Clone)]
pub struct RegistrationStateMachine {
    instances: Arc<dyn InstanceApi>,
    load_balancers: Arc<dyn LoadBalancerApi>,
    retry: RetryPolicy,
}

fn is_member(health: &[TargetHealth], instance_id: &str) -> bool {
    health
        .iter()
        .any(|t| t.instance_id == instance_id && t.state != TargetHealthState::Draining)
}

impl RegistrationStateMachine {
    /// Creates a state machine over the given capabilities.
    #[must_use]
    pub fn new(
        instances: Arc<dyn InstanceApi>,
        load_balancers: Arc<dyn LoadBalancerApi>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            instances,
            load_balancers,
            retry,
        }
    }

    /// Creates a state machine from provider clients.
    #[must_use]
    pub fn from_clients(clients: &ProviderClients) -> Self {
        Self::new(
            Arc::clone(&clients.instances),
            Arc::clone(&clients.load_balancers),
            clients.retry.clone(),
        )
    }

    async fn target_health(&self, target: &LoadBalancerTarget) -> Result<Vec<TargetHealth>> {
        self.retry
            .run("DescribeTargetHealth", || {
                self.load_balancers.describe_target_health(target)
            })
            .await
    }

    async fn instance_is_live(&self, instance_id: &str) -> Result<bool> {
        Ok(self
            .retry
            .run("DescribeInstances", || self.instances.describe_instance(instance_id))
            .await?
            .is_some_and(|i| i.state.is_live()))
    }

    /// Returns true if the instance is a member of the target.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider call fails.
    pub async fn is_registered(&self, instance_id: &str, target: &LoadBalancerTarget) -> Result<bool> {
        Ok(is_member(&self.target_health(target).await?, instance_id))
    }

    /// Registers one instance.
    ///
    /// # Errors
    ///
    /// Returns an error if a provider call fails for a reason other than
    /// the instance disappearing.
    pub async fn register(
        &self,
        instance_id: &str,
        target: &LoadBalancerTarget,
    ) -> Result<RegistrationOutcome> {
        if !self.instance_is_live(instance_id).await? {
            info!(instance_id = %instance_id, target = %target, "Instance gone, not registering");
            return Ok(RegistrationOutcome::InstanceGone);
        }

        if self.is_registered(instance_id, target).await? {
            debug!(instance_id = %instance_id, target = %target, "Already registered");
            return Ok(RegistrationOutcome::AlreadyRegistered);
        }

        let ids = [instance_id.to_string()];
        match self
            .retry
            .run("RegisterTargets", || {
                self.load_balancers.register_instances(target, &ids)
            })
            .await
        {
            Ok(()) => {
                info!(instance_id = %instance_id, target = %target, "Registered instance");
                Ok(RegistrationOutcome::Registered)
            }
            // The instance may have terminated since the check above.
            Err(err) if matches!(err.class(), ErrorClass::Validation | ErrorClass::NotFound) => {
                if self.instance_is_live(instance_id).await? {
                    return Err(err.in_operation("RegisterTargets", instance_id));
                }
                info!(instance_id = %instance_id, target = %target, "Instance terminated during registration");
                Ok(RegistrationOutcome::InstanceGone)
            }
            Err(err) => Err(err.in_operation("RegisterTargets", instance_id)),
        }
    }

    /// Deregisters one instance.
    ///
    /// # Errors
    ///
    /// Returns an error if a provider call fails for a reason other than
    /// the member being absent.
    pub async fn deregister(
        &self,
        instance_id: &str,
        target: &LoadBalancerTarget,
    ) -> Result<RegistrationOutcome> {
        let health = self.target_health(target).await?;
        if !is_member(&health, instance_id) {
            debug!(instance_id = %instance_id, target = %target, "Not registered");
            return Ok(RegistrationOutcome::AlreadyDeregistered);
        }

        let healthy: Vec<&TargetHealth> = health
            .iter()
            .filter(|t| t.state == TargetHealthState::Healthy)
            .collect();
        if healthy.len() == 1 && healthy[0].instance_id == instance_id {
            warn!(
                instance_id = %instance_id,
                target = %target,
                "Deregistering the last healthy target"
            );
        }

        let ids = [instance_id.to_string()];
        match self
            .retry
            .run("DeregisterTargets", || {
                self.load_balancers.deregister_instances(target, &ids)
            })
            .await
        {
            Ok(()) => {
                info!(instance_id = %instance_id, target = %target, "Deregistered instance");
                Ok(RegistrationOutcome::Deregistered)
            }
            Err(err) if err.is_not_found() => Ok(RegistrationOutcome::AlreadyDeregistered),
            Err(err) => Err(err.in_operation("DeregisterTargets", instance_id)),
        }
    }
}

impl std::fmt::Debug for RegistrationStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationStateMachine")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Display for RegistrationOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Registered => "registered",
            Self::AlreadyRegistered => "already registered",
            Self::Deregistered => "deregistered",
            Self::AlreadyDeregistered => "already deregistered",
            Self::InstanceGone => "instance gone",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TargetKind;
    use crate::error::ProviderError;
    use crate::provider::{
        Instance, InstanceState, LoadBalancer, MockInstanceApi, MockLoadBalancerApi,
        SimulatedProvider,
    };
    use crate::tags::Tags;

    async fn setup(kind: TargetKind) -> (Arc<SimulatedProvider>, LoadBalancerTarget, String) {
        let provider = Arc::new(SimulatedProvider::in_memory());
        let lb: LoadBalancer = provider
            .create_load_balancer("apiserver", kind, 6443, &Tags::new())
            .await
            .expect("lb");
        let instance = provider
            .seed(|s| s.run_instance(None, Tags::new()))
            .expect("seed");
        (provider, lb.target(), instance)
    }

    fn machine(provider: &Arc<SimulatedProvider>) -> RegistrationStateMachine {
        RegistrationStateMachine::new(provider.clone(), provider.clone(), RetryPolicy::none())
    }

    #[tokio::test]
    async fn test_register_is_idempotent_for_both_kinds() {
        for kind in [TargetKind::Classic, TargetKind::TargetGroup] {
            let (provider, target, instance) = setup(kind).await;
            let sm = machine(&provider);

            assert_eq!(
                sm.register(&instance, &target).await.expect("register"),
                RegistrationOutcome::Registered
            );
            assert_eq!(
                sm.register(&instance, &target).await.expect("again"),
                RegistrationOutcome::AlreadyRegistered
            );
            assert!(sm.is_registered(&instance, &target).await.expect("check"));
            assert_eq!(provider.call_count("RegisterTargets"), 1);
        }
    }

    #[tokio::test]
    async fn test_terminated_instance_is_gone() {
        let (provider, target, instance) = setup(TargetKind::TargetGroup).await;
        provider
            .seed(|s| s.set_instance_state(&instance, InstanceState::Terminated))
            .expect("seed");

        assert_eq!(
            machine(&provider).register(&instance, &target).await.expect("register"),
            RegistrationOutcome::InstanceGone
        );
        assert_eq!(provider.call_count("RegisterTargets"), 0);
    }

    #[tokio::test]
    async fn test_purged_instance_is_gone() {
        let (provider, target, instance) = setup(TargetKind::Classic).await;
        provider.seed(|s| s.purge_instance(&instance)).expect("seed");

        assert_eq!(
            machine(&provider).register(&instance, &target).await.expect("register"),
            RegistrationOutcome::InstanceGone
        );
    }

    #[tokio::test]
    async fn test_deregister_absent_member() {
        let (provider, target, instance) = setup(TargetKind::TargetGroup).await;
        let sm = machine(&provider);

        assert_eq!(
            sm.deregister(&instance, &target).await.expect("deregister"),
            RegistrationOutcome::AlreadyDeregistered
        );

        sm.register(&instance, &target).await.expect("register");
        assert_eq!(
            sm.deregister(&instance, &target).await.expect("deregister"),
            RegistrationOutcome::Deregistered
        );
        assert!(!sm.is_registered(&instance, &target).await.expect("check"));
    }

    #[tokio::test]
    async fn test_deregister_twice_for_both_kinds() {
        for kind in [TargetKind::Classic, TargetKind::TargetGroup] {
            let (provider, target, instance) = setup(kind).await;
            let sm = machine(&provider);
            sm.register(&instance, &target).await.expect("register");

            assert_eq!(
                sm.deregister(&instance, &target).await.expect("deregister"),
                RegistrationOutcome::Deregistered
            );
            assert_eq!(
                sm.deregister(&instance, &target).await.expect("again"),
                RegistrationOutcome::AlreadyDeregistered
            );
            assert_eq!(provider.call_count("DeregisterTargets"), 1);
        }
    }

    #[tokio::test]
    async fn test_draining_target_is_not_a_member() {
        let (provider, target, instance) = setup(TargetKind::TargetGroup).await;
        let sm = machine(&provider);
        sm.register(&instance, &target).await.expect("register");

        provider
            .seed(|s| s.set_target_health(&target, &instance, TargetHealthState::Draining))
            .expect("seed");
        assert!(!sm.is_registered(&instance, &target).await.expect("check"));

        assert_eq!(
            sm.register(&instance, &target).await.expect("register"),
            RegistrationOutcome::Registered
        );
        assert!(sm.is_registered(&instance, &target).await.expect("check"));
    }

    #[tokio::test]
    async fn test_termination_between_check_and_register() {
        let mut instances = MockInstanceApi::new();
        let mut states = vec![InstanceState::Terminated, InstanceState::Running];
        instances.expect_describe_instance().times(2).returning(move |id| {
            Ok(Some(Instance {
                id: id.to_string(),
                state: states.pop().unwrap_or(InstanceState::Terminated),
                launch_template: None,
                tags: Tags::new(),
            }))
        });

        let mut lbs = MockLoadBalancerApi::new();
        lbs.expect_describe_target_health().returning(|_| Ok(Vec::new()));
        lbs.expect_register_instances().times(1).returning(|_, ids| {
            Err(ProviderError::Validation {
                message: format!("invalid instance {}", ids[0]),
            }
            .into())
        });

        let sm = RegistrationStateMachine::new(Arc::new(instances), Arc::new(lbs), RetryPolicy::none());
        let target = LoadBalancerTarget::Classic {
            name: String::from("apiserver"),
        };

        assert_eq!(
            sm.register("i-1", &target).await.expect("register"),
            RegistrationOutcome::InstanceGone
        );
    }

    #[tokio::test]
    async fn test_provider_not_found_on_deregister() {
        let instances = MockInstanceApi::new();
        let mut lbs = MockLoadBalancerApi::new();
        lbs.expect_describe_target_health().returning(|_| {
            Ok(vec![TargetHealth {
                instance_id: String::from("i-1"),
                state: TargetHealthState::Unhealthy,
            }])
        });
        lbs.expect_deregister_instances()
            .times(1)
            .returning(|_, _| Err(ProviderError::not_found("target", "i-1").into()));

        let sm = RegistrationStateMachine::new(Arc::new(instances), Arc::new(lbs), RetryPolicy::none());
        let target = LoadBalancerTarget::TargetGroup {
            arn: String::from("arn:aws:elasticloadbalancing:us-east-1:000000000000:targetgroup/api/1"),
        };

        assert_eq!(
            sm.deregister("i-1", &target).await.expect("deregister"),
            RegistrationOutcome::AlreadyDeregistered
        );
    }
}
