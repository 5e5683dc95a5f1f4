//! Default machine image discovery.

use tracing::{debug, info};

use crate::config::{ImageLookup, ImageSpec};
use crate::error::{ConfigError, ProviderError, Result};
use crate::provider::{Image, ImageFilter, LaunchTemplateApi, RetryPolicy};

/// Builds the image name pattern for a lookup.
///
/// Published names carry a one-character version marker (`v1.29.3`), which
/// the `?` wildcard absorbs whether or not the configured version has it.
#[must_use]
pub fn image_name_pattern(lookup: &ImageLookup) -> String {
    let version = lookup.k8s_version.trim().trim_start_matches('v');
    format!("{}-{}-?{}-*", lookup.name_prefix, lookup.base_os, version)
}

/// Picks the newest image by creation date.
#[must_use]
pub fn newest_image(images: &[Image]) -> Option<&Image> {
    images.iter().max_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.name.cmp(&b.name))
    })
}

/// Resolves the image id for a launch template.
///
/// An explicit id wins. Otherwise images are filtered by owner, name
/// pattern and architecture and the newest match is used.
///
/// # Errors
///
/// Returns `NotFound` with kind `image` if nothing matches, or a
/// validation error if the spec names neither an id nor a lookup.
pub async fn discover_ami(
    templates: &dyn LaunchTemplateApi,
    retry: &RetryPolicy,
    image: &ImageSpec,
) -> Result<String> {
    if let Some(id) = image.id.as_deref().filter(|id| !id.trim().is_empty()) {
        debug!(image_id = %id, "Using explicit image id");
        return Ok(id.to_string());
    }

    let lookup = image
        .lookup
        .as_ref()
        .ok_or_else(|| ConfigError::validation("image needs an id or a lookup", "image"))?;

    let filter = ImageFilter {
        owner: lookup.owner.clone(),
        name_pattern: image_name_pattern(lookup),
        architecture: lookup.architecture.clone(),
    };

    let images = retry
        .run("DescribeImages", || templates.describe_images(&filter))
        .await?;

    let newest = newest_image(&images)
        .ok_or_else(|| ProviderError::not_found("image", &filter.name_pattern))?;

    info!(
        image_id = %newest.id,
        name = %newest.name,
        candidates = images.len(),
        "Discovered image"
    );
    Ok(newest.id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;
    use crate::provider::SimulatedProvider;
    use chrono::{TimeZone, Utc};

    fn lookup() -> ImageLookup {
        ImageLookup {
            owner: String::from("258751437250"),
            name_prefix: String::from("capa-ami"),
            base_os: String::from("ubuntu-22.04"),
            k8s_version: String::from("v1.29.3"),
            architecture: String::from("x86_64"),
        }
    }

    fn image(id: &str, name: &str, day: u32) -> Image {
        Image {
            id: id.to_string(),
            name: name.to_string(),
            owner: String::from("258751437250"),
            architecture: String::from("x86_64"),
            created_at: Utc.with_ymd_and_hms(2024, 3, day, 0, 0, 0).single().expect("date"),
        }
    }

    #[test]
    fn test_pattern_strips_version_prefix() {
        assert_eq!(
            image_name_pattern(&lookup()),
            "capa-ami-ubuntu-22.04-?1.29.3-*"
        );
    }

    #[tokio::test]
    async fn test_newest_match_wins() {
        let provider = SimulatedProvider::in_memory();
        provider
            .seed(|s| {
                s.add_image(image("ami-old", "capa-ami-ubuntu-22.04-v1.29.3-00", 1));
                s.add_image(image("ami-new", "capa-ami-ubuntu-22.04-v1.29.3-01", 9));
                s.add_image(image("ami-other", "capa-ami-ubuntu-22.04-v1.28.0-01", 20));
            })
            .expect("seed");

        let spec = ImageSpec {
            id: None,
            lookup: Some(lookup()),
        };
        let id = discover_ami(&provider, &RetryPolicy::none(), &spec)
            .await
            .expect("discover");

        assert_eq!(id, "ami-new");
    }

    #[tokio::test]
    async fn test_explicit_id_skips_lookup() {
        let provider = SimulatedProvider::in_memory();
        let spec = ImageSpec {
            id: Some(String::from("ami-pinned")),
            lookup: Some(lookup()),
        };

        let id = discover_ami(&provider, &RetryPolicy::none(), &spec)
            .await
            .expect("discover");

        assert_eq!(id, "ami-pinned");
        assert_eq!(provider.call_count("DescribeImages"), 0);
    }

    #[tokio::test]
    async fn test_no_match_is_not_found() {
        let provider = SimulatedProvider::in_memory();
        let spec = ImageSpec {
            id: None,
            lookup: Some(lookup()),
        };

        let err = discover_ami(&provider, &RetryPolicy::none(), &spec)
            .await
            .expect_err("no images");

        assert_eq!(err.class(), ErrorClass::NotFound);
    }
}
