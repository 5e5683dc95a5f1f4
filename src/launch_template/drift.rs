//! Semantic drift detection between launch template versions.
//!
//! Comparison runs on normalized values. Anything the provider fills in or
//! rewrites on its own must compare equal to the unset desired value, or
//! every pass would mint a new version.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::config::{MetadataOptions, RootVolume};
use crate::error::{ConfigError, Result};
use crate::provider::LaunchTemplateData;

/// Volume type the provider assigns when none is requested.
pub const DEFAULT_VOLUME_TYPE: &str = "gp2";

/// A field that differs between the existing and the desired version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftField {
    /// Instance type.
    InstanceType,
    /// Boot image.
    ImageId,
    /// Security group set.
    SecurityGroups,
    /// User data digest.
    UserData,
    /// IAM instance profile.
    IamInstanceProfile,
    /// SSH key name.
    SshKeyName,
    /// Root volume.
    RootVolume,
    /// Metadata service options.
    MetadataOptions,
    /// Spot price.
    SpotMaxPrice,
}

fn normalize_instance_type(value: &str) -> String {
    value.trim().to_ascii_lowercase()
}

fn group_set(groups: &[String]) -> BTreeSet<&str> {
    groups.iter().map(|g| g.trim()).filter(|g| !g.is_empty()).collect()
}

/// An unset desired value is left to the provider and never drifts.
fn optional_differs(existing: Option<&String>, incoming: Option<&String>) -> bool {
    incoming.is_some_and(|want| existing.map(|have| have.trim()) != Some(want.trim()))
}

fn root_volume_differs(existing: Option<&RootVolume>, incoming: &RootVolume) -> bool {
    let existing_size = existing.map_or(0, |v| v.size_gib);
    if incoming.size_gib != 0 && incoming.size_gib != existing_size {
        return true;
    }

    let existing_type = existing
        .and_then(|v| v.volume_type.as_deref())
        .unwrap_or(DEFAULT_VOLUME_TYPE);
    let incoming_type = incoming.volume_type.as_deref().unwrap_or(DEFAULT_VOLUME_TYPE);
    if !existing_type.eq_ignore_ascii_case(incoming_type) {
        return true;
    }

    incoming
        .encrypted
        .is_some_and(|want| existing.and_then(|v| v.encrypted).unwrap_or(false) != want)
}

fn metadata_differs(existing: Option<&MetadataOptions>, incoming: Option<&MetadataOptions>) -> bool {
    let defaults = MetadataOptions::default();
    existing.unwrap_or(&defaults) != incoming.unwrap_or(&defaults)
}

/// Lists the fields in which `incoming` differs from `existing`.
///
/// # Errors
///
/// Returns a validation error if the incoming instance type is empty.
pub fn drift_fields(
    existing: &LaunchTemplateData,
    incoming: &LaunchTemplateData,
) -> Result<Vec<DriftField>> {
    if incoming.instance_type.trim().is_empty() {
        return Err(ConfigError::validation(
            "desired launch template has an empty instance type",
            "instance_type",
        )
        .into());
    }

    let mut fields = Vec::new();

    if normalize_instance_type(&existing.instance_type)
        != normalize_instance_type(&incoming.instance_type)
    {
        fields.push(DriftField::InstanceType);
    }
    if optional_differs(existing.image_id.as_ref(), incoming.image_id.as_ref()) {
        fields.push(DriftField::ImageId);
    }
    if group_set(&existing.security_group_ids) != group_set(&incoming.security_group_ids) {
        fields.push(DriftField::SecurityGroups);
    }
    if existing.user_data_hash != incoming.user_data_hash {
        fields.push(DriftField::UserData);
    }
    if optional_differs(
        existing.iam_instance_profile.as_ref(),
        incoming.iam_instance_profile.as_ref(),
    ) {
        fields.push(DriftField::IamInstanceProfile);
    }
    if optional_differs(existing.ssh_key_name.as_ref(), incoming.ssh_key_name.as_ref()) {
        fields.push(DriftField::SshKeyName);
    }
    if incoming
        .root_volume
        .as_ref()
        .is_some_and(|want| root_volume_differs(existing.root_volume.as_ref(), want))
    {
        fields.push(DriftField::RootVolume);
    }
    if metadata_differs(
        existing.metadata_options.as_ref(),
        incoming.metadata_options.as_ref(),
    ) {
        fields.push(DriftField::MetadataOptions);
    }
    if optional_differs(existing.spot_max_price.as_ref(), incoming.spot_max_price.as_ref()) {
        fields.push(DriftField::SpotMaxPrice);
    }

    Ok(fields)
}

/// Returns true if a new version is needed to converge `existing` to
/// `incoming`.
///
/// # Errors
///
/// Returns a validation error if the incoming instance type is empty.
pub fn needs_update(existing: &LaunchTemplateData, incoming: &LaunchTemplateData) -> Result<bool> {
    Ok(!drift_fields(existing, incoming)?.is_empty())
}

impl std::fmt::Display for DriftField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::InstanceType => "instance_type",
            Self::ImageId => "image_id",
            Self::SecurityGroups => "security_groups",
            Self::UserData => "user_data",
            Self::IamInstanceProfile => "iam_instance_profile",
            Self::SshKeyName => "ssh_key_name",
            Self::RootVolume => "root_volume",
            Self::MetadataOptions => "metadata_options",
            Self::SpotMaxPrice => "spot_max_price",
        };
        write!(f, "{s}")
    }
}
