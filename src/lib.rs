// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(dead_code)]                   // Unused code is forbidden
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_imports)]              // Unused imports are forbidden
#![deny(unused_variables)]            // Unused variables are forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # infra-converge
//!
//! An idempotent convergence engine for the cloud resources behind a
//! self-managed cluster.
//!
//! ## Overview
//!
//! Each pass compares a declarative desired state against what the provider
//! reports and issues the minimal create, update or delete calls to close
//! the gap. Running a pass twice with no external change makes no calls
//! that mutate provider state.
//!
//! ## Architecture
//!
//! 1. **Desired State**: Defined in `infra-converge.yaml`
//! 2. **Observed State**: Queried from the provider on every pass
//! 3. **Reconciler**: Drives every resource pair toward the desired state
//!
//! Nothing is cached between passes; ownership is decided by tags.
//!
//! ## Modules
//!
//! - [`config`]: Configuration parsing and validation
//! - [`provider`]: Provider capabilities, retries and backends
//! - [`tags`]: Tag diffing and reconciliation
//! - [`launch_template`]: Launch template versions, drift and pruning
//! - [`autoscaling`]: Autoscaling groups and instance refreshes
//! - [`loadbalancer`]: API-server load balancer and registration
//! - [`convergence`]: Network, security group and bucket pairs
//! - [`reconciler`]: Full-cluster reconciliation passes
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! cluster:
//!   name: prod
//!   region: us-east-1
//!
//! launch_templates:
//!   - name: workers
//!     instance_type: m5.large
//!     image:
//!       lookup:
//!         base_os: ubuntu-22.04
//!         k8s_version: v1.29.0
//!
//! machine_pools:
//!   - name: pool-a
//!     launch_template: workers
//!     min_size: 1
//!     max_size: 3
//!     subnet_ids: [subnet-1]
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod autoscaling;
pub mod cli;
pub mod config;
pub mod context;
pub mod convergence;
pub mod error;
pub mod launch_template;
pub mod loadbalancer;
pub mod provider;
pub mod reconciler;
pub mod tags;

// ============================================================================
// Re-exports
// ============================================================================

pub use autoscaling::{AutoScalingGroupPair, InstanceRefreshCoordinator};
pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigParser, ConfigValidator, ConvergeConfig};
pub use context::ReconcileContext;
pub use convergence::{ConvergenceOutcome, ResourceConvergencePair};
pub use error::{ConvergeError, Result};
pub use launch_template::LaunchTemplateManager;
pub use loadbalancer::RegistrationStateMachine;
pub use provider::{ProviderClients, SimulatedProvider};
pub use reconciler::{DriftReport, ReconciliationResult, Reconciler};
pub use tags::{TagReconciler, Tags};
