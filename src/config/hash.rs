//! Hashing for change detection.
//!
//! User data is compared by digest so the raw payload, which usually carries
//! bootstrap secrets, is never retained for diffing. Launch template data is
//! fingerprinted to derive deterministic client tokens for idempotent creates.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::provider::LaunchTemplateData;

/// Content digest of a user data payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserDataHash(String);

impl UserDataHash {
    /// Computes the digest of a payload.
    #[must_use]
    pub fn of(payload: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(payload)))
    }

    /// Returns the hex digest.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the first eight characters, for display.
    #[must_use]
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl std::fmt::Display for UserDataHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hasher for launch template fingerprints.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes a deterministic fingerprint of launch template data.
    ///
    /// Security groups are sorted and deduplicated so that reordering the
    /// desired list does not change the fingerprint.
    #[must_use]
    pub fn hash_template_data(&self, data: &LaunchTemplateData) -> String {
        let mut hasher = Sha256::new();

        hasher.update(data.instance_type.trim().to_ascii_lowercase().as_bytes());
        hasher.update([0u8]);
        if let Some(image) = &data.image_id {
            hasher.update(image.as_bytes());
        }
        hasher.update([0u8]);

        let mut groups: Vec<&str> = data.security_group_ids.iter().map(String::as_str).collect();
        groups.sort_unstable();
        groups.dedup();
        for group in groups {
            hasher.update(group.as_bytes());
            hasher.update([b',']);
        }
        hasher.update([0u8]);

        if let Some(hash) = &data.user_data_hash {
            hasher.update(hash.as_str().as_bytes());
        }
        hasher.update([0u8]);

        for field in [
            &data.iam_instance_profile,
            &data.ssh_key_name,
            &data.spot_max_price,
        ] {
            if let Some(value) = field {
                hasher.update(value.as_bytes());
            }
            hasher.update([0u8]);
        }

        if let Some(volume) = &data.root_volume {
            hasher.update(volume.size_gib.to_be_bytes());
            if let Some(kind) = &volume.volume_type {
                hasher.update(kind.as_bytes());
            }
            hasher.update([u8::from(volume.encrypted.unwrap_or_default())]);
        }
        hasher.update([0u8]);

        if let Some(opts) = &data.metadata_options {
            hasher.update(format!("{:?}", opts.http_tokens).as_bytes());
            hasher.update(opts.hop_limit.to_be_bytes());
            hasher.update([u8::from(opts.http_endpoint)]);
        }

        hex::encode(hasher.finalize())
    }

    /// Derives the client token for creating a version of `template`.
    ///
    /// Retrying the same create yields the same token, so the provider can
    /// recognise the duplicate.
    #[must_use]
    pub fn client_token(&self, template: &str, data: &LaunchTemplateData) -> String {
        let fingerprint = self.hash_template_data(data);
        let mut hasher = Sha256::new();
        hasher.update(template.as_bytes());
        hasher.update([0u8]);
        hasher.update(fingerprint.as_bytes());
        // Provider tokens are capped at 64 characters.
        hex::encode(hasher.finalize())[..32].to_string()
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }
}
