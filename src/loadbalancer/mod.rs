//! Load balancers.
//!
//! This module contains:
//! - The registration state machine for classic and target-group targets
//! - The API-server load balancer convergence pair

mod pair;
mod registration;

pub use pair::{LoadBalancerPair, LOAD_BALANCER_ROLE};
pub use registration::{RegistrationOutcome, RegistrationStateMachine};
