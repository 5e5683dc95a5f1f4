//! Applying tag diffs to provider resources.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::context::ReconcileContext;
use crate::error::{ConvergeError, ErrorClass, Result};
use crate::provider::{RetryPolicy, TaggingApi};

use super::{TagDiff, TagDiffEngine, Tags};

/// Desired tags for one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceTagUpdate {
    /// Provider resource id.
    pub resource_id: String,
    /// Complete desired tag set.
    pub desired: Tags,
}

/// Outcome of a tag reconciliation batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TagReconcileReport {
    /// Resources whose tags were changed, with the applied diff.
    pub updated: Vec<(String, TagDiff)>,
    /// Resources already converged.
    pub unchanged: Vec<String>,
    /// Resources that no longer exist.
    pub missing: Vec<String>,
    /// Resources that failed, with the error class.
    pub failed: Vec<(String, ErrorClass)>,
}

/// Converges tags on provider resources.
#[derive(Clone)]
pub struct TagReconciler {
    tagging: Arc<dyn TaggingApi>,
    retry: RetryPolicy,
}

impl TagReconciler {
    /// Creates a reconciler over the given tagging capability.
    #[must_use]
    pub fn new(tagging: Arc<dyn TaggingApi>, retry: RetryPolicy) -> Self {
        Self { tagging, retry }
    }

    /// Converges each resource's tags to its desired set.
    ///
    /// Tags are read fresh per resource. A failure on one resource does not
    /// stop the others; resources that no longer exist are skipped.
    ///
    /// # Errors
    ///
    /// Returns the first per-resource error, wrapped with the resource id,
    /// after every resource has been attempted.
    pub async fn reconcile_tags(
        &self,
        ctx: &ReconcileContext,
        updates: &[ResourceTagUpdate],
    ) -> Result<TagReconcileReport> {
        let engine = ctx.tag_engine();
        let mut report = TagReconcileReport::default();
        let mut first_error: Option<ConvergeError> = None;

        for update in updates {
            match self.reconcile_one(&engine, update).await {
                Ok(Some(diff)) if diff.is_empty() => report.unchanged.push(update.resource_id.clone()),
                Ok(Some(diff)) => report.updated.push((update.resource_id.clone(), diff)),
                Ok(None) => report.missing.push(update.resource_id.clone()),
                Err(err) => {
                    warn!(
                        resource_id = %update.resource_id,
                        error = %err,
                        "Tag reconciliation failed"
                    );
                    report.failed.push((update.resource_id.clone(), err.class()));
                    if first_error.is_none() {
                        first_error = Some(err.in_operation("ReconcileTags", &update.resource_id));
                    }
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    /// Applies an already computed diff to one resource.
    ///
    /// # Errors
    ///
    /// Returns an error if a provider call fails.
    pub async fn update_resource_tags(
        &self,
        resource_id: &str,
        create: &Tags,
        remove: &BTreeSet<String>,
    ) -> Result<()> {
        if !create.is_empty() {
            self.retry
                .run("CreateTags", || self.tagging.create_tags(resource_id, create))
                .await?;
        }
        if !remove.is_empty() {
            self.retry
                .run("DeleteTags", || self.tagging.delete_tags(resource_id, remove))
                .await?;
        }
        Ok(())
    }

    async fn reconcile_one(
        &self,
        engine: &TagDiffEngine,
        update: &ResourceTagUpdate,
    ) -> Result<Option<TagDiff>> {
        let id = update.resource_id.as_str();
        let observed = match self
            .retry
            .run("DescribeTags", || self.tagging.describe_tags(id))
            .await
        {
            Ok(tags) => tags,
            Err(err) if err.is_not_found() => {
                debug!(resource_id = %id, "Resource gone, skipping tag sync");
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        let diff = engine.diff(&update.desired, &observed);
        if diff.is_empty() {
            debug!(resource_id = %id, "Tags converged");
            return Ok(Some(diff));
        }

        info!(resource_id = %id, "Updating tags: {diff}");
        self.update_resource_tags(id, &diff.create, &diff.remove)
            .await?;
        Ok(Some(diff))
    }
}

impl std::fmt::Debug for TagReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TagReconciler")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::provider::MockTaggingApi;

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn update(id: &str, desired: Tags) -> ResourceTagUpdate {
        ResourceTagUpdate {
            resource_id: id.to_string(),
            desired,
        }
    }

    #[tokio::test]
    async fn test_create_only_never_deletes_allow_listed() {
        let mut mock = MockTaggingApi::new();
        mock.expect_describe_tags()
            .returning(|_| Ok(tags(&[("env", "staging"), ("legacy", "x")])));
        mock.expect_create_tags()
            .withf(|id, created| id == "r-1" && *created == tags(&[("env", "prod"), ("team", "infra")]))
            .times(1)
            .returning(|_, _| Ok(()));
        mock.expect_delete_tags().never();

        let reconciler = TagReconciler::new(Arc::new(mock), RetryPolicy::none());
        let ctx = ReconcileContext::new("prod").with_externally_managed(["legacy"]);
        let report = reconciler
            .reconcile_tags(&ctx, &[update("r-1", tags(&[("env", "prod"), ("team", "infra")]))])
            .await
            .expect("reconcile");

        assert_eq!(report.updated.len(), 1);
    }

    #[tokio::test]
    async fn test_converged_makes_no_mutating_calls() {
        let mut mock = MockTaggingApi::new();
        mock.expect_describe_tags()
            .returning(|_| Ok(tags(&[("env", "prod")])));
        mock.expect_create_tags().never();
        mock.expect_delete_tags().never();

        let reconciler = TagReconciler::new(Arc::new(mock), RetryPolicy::none());
        let report = reconciler
            .reconcile_tags(
                &ReconcileContext::new("prod"),
                &[update("r-1", tags(&[("env", "prod")]))],
            )
            .await
            .expect("reconcile");

        assert_eq!(report.unchanged, vec![String::from("r-1")]);
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_batch() {
        let mut mock = MockTaggingApi::new();
        mock.expect_describe_tags().returning(|id| match id {
            "r-bad" => Err(ProviderError::Unauthorized {
                message: String::from("denied"),
            }
            .into()),
            "r-gone" => Err(ProviderError::not_found("resource", "r-gone").into()),
            _ => Ok(Tags::new()),
        });
        mock.expect_create_tags()
            .withf(|id, _| id == "r-ok")
            .times(1)
            .returning(|_, _| Ok(()));

        let reconciler = TagReconciler::new(Arc::new(mock), RetryPolicy::none());
        let desired = tags(&[("env", "prod")]);
        let err = reconciler
            .reconcile_tags(
                &ReconcileContext::new("prod"),
                &[
                    update("r-bad", desired.clone()),
                    update("r-gone", desired.clone()),
                    update("r-ok", desired),
                ],
            )
            .await
            .expect_err("first error surfaces");

        assert_eq!(err.class(), ErrorClass::Fatal);
        assert!(err.to_string().contains("r-bad"));
    }

    #[tokio::test]
    async fn test_update_resource_tags_noop() {
        let mut mock = MockTaggingApi::new();
        mock.expect_create_tags().never();
        mock.expect_delete_tags().never();

        let reconciler = TagReconciler::new(Arc::new(mock), RetryPolicy::none());
        reconciler
            .update_resource_tags("r-1", &Tags::new(), &BTreeSet::new())
            .await
            .expect("noop");
    }

    #[tokio::test]
    async fn test_throttled_describe_is_retried() {
        let mut mock = MockTaggingApi::new();
        let mut seq = mockall::Sequence::new();
        mock.expect_describe_tags()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(ProviderError::Throttled { retry_after_secs: 0 }.into()));
        mock.expect_describe_tags()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(tags(&[("env", "prod")])));

        let reconciler = TagReconciler::new(Arc::new(mock), RetryPolicy::immediate(3));
        let report = reconciler
            .reconcile_tags(
                &ReconcileContext::new("prod"),
                &[update("r-1", tags(&[("env", "prod")]))],
            )
            .await
            .expect("reconcile");

        assert_eq!(report.unchanged.len(), 1);
    }
}
