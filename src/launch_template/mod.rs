//! Launch template lifecycle.
//!
//! This module contains:
//! - Semantic drift detection between versions
//! - Version creation, retention and deletion
//! - Default image discovery

mod ami;
mod drift;
mod manager;
mod prune;

pub use ami::{discover_ami, image_name_pattern, newest_image};
pub use drift::{drift_fields, needs_update, DriftField, DEFAULT_VOLUME_TYPE};
pub use manager::{
    LaunchTemplateHooks, LaunchTemplateManager, LaunchTemplateOutcome, NoHooks,
    ObservedLaunchTemplate, VersionOutcome,
};
pub use prune::{plan_prune, resolve_version, verify_plan, PrunePlan, PruneReport};
