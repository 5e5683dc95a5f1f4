//! Autoscaling groups.
//!
//! This module contains:
//! - Instance refresh coordination and launch template hooks
//! - Group convergence and scaling process suspension

mod group;
mod refresh;

pub use group::{AutoScalingGroupPair, ProcessChanges, MACHINE_POOL_ROLE};
pub use refresh::{
    newest_refresh, InstanceRefreshCoordinator, InstanceRefreshHooks, RefreshBlock,
    RefreshDecision, RefreshStartOutcome, RefreshState,
};
