//! Bootstrap user data kept in chunked secrets.
//!
//! User data larger than a launch template allows is written to a series of
//! secrets named `<prefix>-<index>`. Instances boot from a small script that
//! fetches the chunks, concatenates them and deletes them.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::config::ServiceEndpoint;
use crate::context::ReconcileContext;
use crate::error::{ConfigError, ErrorClass, Result};
use crate::provider::{ProviderClients, RetryPolicy, SecretsApi};
use crate::tags::Tags;

/// Leading component of every secret name.
pub const SECRET_PREFIX: &str = "infra-converge.io";

/// Largest chunk written to one secret.
pub const MAX_SECRET_CHUNK_BYTES: usize = 10_000;

/// Role tag value for user data secrets.
pub const SECRET_ROLE: &str = "bootstrap-secret";

/// Service id matched against custom endpoints.
const SECRETS_SERVICE_ID: &str = "secretsmanager";

/// Where a machine's user data was stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredUserData {
    /// Secret name prefix.
    pub prefix: String,
    /// Number of chunks.
    pub chunks: u32,
}

/// Returns the secret name prefix for a machine.
#[must_use]
pub fn secret_prefix(ctx: &ReconcileContext, machine: &str) -> String {
    format!("{SECRET_PREFIX}/{}/{machine}", ctx.cluster)
}

/// Returns the secret name of one chunk.
#[must_use]
pub fn chunk_name(prefix: &str, index: u32) -> String {
    format!("{prefix}-{index}")
}

fn chunk_index(prefix: &str, name: &str) -> Option<u32> {
    name.strip_prefix(prefix)?.strip_prefix('-')?.parse().ok()
}

/// Splits user data into chunks. Empty data still yields one chunk.
#[must_use]
pub fn split_chunks(data: &[u8]) -> Vec<&[u8]> {
    if data.is_empty() {
        return vec![data];
    }
    data.chunks(MAX_SECRET_CHUNK_BYTES).collect()
}

/// Renders the boot script that reassembles user data from its chunks.
///
/// # Errors
///
/// Returns a validation error if the prefix or region is empty or no chunk
/// was stored.
pub fn user_data(
    stored: &StoredUserData,
    region: &str,
    endpoints: &[ServiceEndpoint],
) -> Result<Vec<u8>> {
    if stored.prefix.is_empty() {
        return Err(ConfigError::validation("secret prefix is empty", "prefix").into());
    }
    if stored.chunks == 0 {
        return Err(ConfigError::validation("user data has no chunks", "chunks").into());
    }
    if region.is_empty() {
        return Err(
            ConfigError::validation("region is required to fetch user data", "region").into(),
        );
    }

    let endpoint = endpoints
        .iter()
        .find(|e| e.service_id == SECRETS_SERVICE_ID)
        .map(|e| format!(" --endpoint-url {}", e.url))
        .unwrap_or_default();

    let script = format!(
        r#"#!/bin/bash
set -o errexit
set -o nounset
set -o pipefail
umask 006
REGION="{region}"
SECRET_PREFIX="{prefix}"
CHUNKS="{chunks}"
FILE="/etc/secret-userdata.txt"
FINAL_INDEX=$((CHUNKS - 1))

rm -f "${{FILE}}"
for i in $(seq 0 "${{FINAL_INDEX}}"); do
  aws secretsmanager{endpoint} --region "${{REGION}}" get-secret-value \
    --output text --query 'SecretBinary' \
    --secret-id "${{SECRET_PREFIX}}-${{i}}" | base64 -d >> "${{FILE}}"
done

for i in $(seq 0 "${{FINAL_INDEX}}"); do
  aws secretsmanager{endpoint} --region "${{REGION}}" delete-secret \
    --force-delete-without-recovery \
    --secret-id "${{SECRET_PREFIX}}-${{i}}" || true
done

cloud-init single --name write_files --frequency once --file "${{FILE}}"
"#,
        prefix = stored.prefix,
        chunks = stored.chunks,
    );
    Ok(script.into_bytes())
}

/// Stores and removes machine user data in chunked secrets.
#[derive(Clone)]
pub struct SecretUserDataStore {
    secrets: Arc<dyn SecretsApi>,
    retry: RetryPolicy,
}

impl SecretUserDataStore {
    /// Creates the store.
    #[must_use]
    pub fn new(clients: &ProviderClients) -> Self {
        Self {
            secrets: Arc::clone(&clients.secrets),
            retry: clients.retry.clone(),
        }
    }

    /// Writes `data` for `machine`, replacing any earlier payload.
    ///
    /// Existing chunks are overwritten and chunks beyond the new count are
    /// removed, so calling this twice leaves one copy.
    ///
    /// # Errors
    ///
    /// Returns an error if a provider call fails.
    pub async fn create(
        &self,
        ctx: &ReconcileContext,
        machine: &str,
        data: &[u8],
    ) -> Result<StoredUserData> {
        let prefix = secret_prefix(ctx, machine);
        let tags = ctx.owned_tags(SECRET_ROLE, machine, &Tags::new());
        let chunks = split_chunks(data);
        let count = u32::try_from(chunks.len())
            .map_err(|_| ConfigError::validation("user data is too large", "user_data"))?;

        for (index, chunk) in (0u32..).zip(&chunks) {
            let name = chunk_name(&prefix, index);
            self.write_chunk(&name, chunk, &tags).await?;
        }

        let stale: Vec<String> = self
            .list(&prefix)
            .await?
            .into_iter()
            .filter(|name| chunk_index(&prefix, name).is_some_and(|i| i >= count))
            .collect();
        for name in &stale {
            self.delete_secret(name).await?;
        }

        info!(
            machine = %machine,
            prefix = %prefix,
            chunks = count,
            stale = stale.len(),
            "Stored user data in secrets"
        );
        Ok(StoredUserData {
            prefix,
            chunks: count,
        })
    }

    /// Deletes every chunk stored for `machine`. Returns how many were
    /// removed.
    ///
    /// # Errors
    ///
    /// Returns an error if a provider call fails.
    pub async fn delete(&self, ctx: &ReconcileContext, machine: &str) -> Result<usize> {
        let prefix = secret_prefix(ctx, machine);
        let names: Vec<String> = self
            .list(&prefix)
            .await?
            .into_iter()
            .filter(|name| chunk_index(&prefix, name).is_some())
            .collect();

        for name in &names {
            self.delete_secret(name).await?;
        }
        if names.is_empty() {
            debug!(machine = %machine, "No user data secrets to delete");
        } else {
            info!(machine = %machine, deleted = names.len(), "Deleted user data secrets");
        }
        Ok(names.len())
    }

    async fn write_chunk(&self, name: &str, chunk: &[u8], tags: &Tags) -> Result<()> {
        let created = self
            .retry
            .run("CreateSecret", || self.secrets.create_secret(name, chunk, tags))
            .await;

        match created {
            Ok(()) => Ok(()),
            // Left by an earlier call, or by a create whose response was lost.
            Err(err) if err.class() == ErrorClass::AlreadyExists => self
                .retry
                .run("PutSecretValue", || self.secrets.put_secret_value(name, chunk))
                .await
                .map_err(|e| e.in_operation("PutSecretValue", name)),
            Err(err) => Err(err.in_operation("CreateSecret", name)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.retry
            .run("ListSecrets", || self.secrets.list_secrets(prefix))
            .await
    }

    async fn delete_secret(&self, name: &str) -> Result<()> {
        match self
            .retry
            .run("DeleteSecret", || self.secrets.delete_secret(name))
            .await
        {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err.in_operation("DeleteSecret", name)),
        }
    }
}

impl std::fmt::Debug for SecretUserDataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretUserDataStore")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::provider::{SimulatedProvider, SimulatedState};

    fn store(provider: &Arc<SimulatedProvider>, retry: RetryPolicy) -> SecretUserDataStore {
        SecretUserDataStore::new(&ProviderClients::simulated(Arc::clone(provider)).with_retry(retry))
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| u8::try_from(i % 251).expect("byte"))
            .collect()
    }

    #[test]
    fn test_chunking() {
        assert_eq!(split_chunks(b"").len(), 1);
        assert_eq!(split_chunks(&payload(MAX_SECRET_CHUNK_BYTES)).len(), 1);
        assert_eq!(split_chunks(&payload(MAX_SECRET_CHUNK_BYTES * 2 + 1)).len(), 3);
        assert_eq!(chunk_index("p", "p-12"), Some(12));
        assert_eq!(chunk_index("p", "p-x"), None);
        assert_eq!(chunk_index("p", "p2-1"), None);
    }

    #[tokio::test]
    async fn test_create_chunks_and_reassembles() {
        let provider = Arc::new(SimulatedProvider::in_memory());
        let ctx = ReconcileContext::new("prod");
        let data = payload(MAX_SECRET_CHUNK_BYTES * 2 + 10);

        let stored = store(&provider, RetryPolicy::none())
            .create(&ctx, "node-1", &data)
            .await
            .expect("create");

        assert_eq!(stored.chunks, 3);
        assert_eq!(stored.prefix, "infra-converge.io/prod/node-1");
        let joined = provider
            .inspect(|s| {
                (0..stored.chunks)
                    .filter_map(|i| s.secret_value(&chunk_name(&stored.prefix, i)))
                    .flatten()
                    .copied()
                    .collect::<Vec<u8>>()
            })
            .expect("inspect");
        assert_eq!(joined, data);
    }

    #[tokio::test]
    async fn test_shrinking_payload_removes_stale_chunks() {
        let provider = Arc::new(SimulatedProvider::in_memory());
        let ctx = ReconcileContext::new("prod");
        let secrets = store(&provider, RetryPolicy::none());

        secrets
            .create(&ctx, "node-1", &payload(MAX_SECRET_CHUNK_BYTES * 3))
            .await
            .expect("create");
        let stored = secrets.create(&ctx, "node-1", b"small").await.expect("rewrite");

        assert_eq!(stored.chunks, 1);
        assert_eq!(
            provider.inspect(SimulatedState::secret_names).expect("inspect"),
            vec![chunk_name(&stored.prefix, 0)]
        );
        assert_eq!(
            provider
                .inspect(|s| s.secret_value(&chunk_name(&stored.prefix, 0)).map(<[u8]>::to_vec))
                .expect("inspect"),
            Some(b"small".to_vec())
        );
    }

    #[tokio::test]
    async fn test_lost_create_response_is_overwritten() {
        let provider = Arc::new(SimulatedProvider::in_memory());
        let ctx = ReconcileContext::new("prod");
        let name = chunk_name(&secret_prefix(&ctx, "node-1"), 0);

        // The first attempt lands on the provider but its response is lost.
        let hook_name = name.clone();
        provider.on_call(
            "CreateSecret",
            1,
            Box::new(move |s| {
                s.insert_secret(&hook_name, b"payload", Tags::new());
            }),
        );
        provider.inject_fault("CreateSecret", ProviderError::transient("connection reset"));

        let stored = store(&provider, RetryPolicy::immediate(3))
            .create(&ctx, "node-1", b"payload")
            .await
            .expect("create");

        assert_eq!(stored.chunks, 1);
        assert_eq!(provider.call_count("CreateSecret"), 2);
        assert_eq!(provider.call_count("PutSecretValue"), 1);
        assert_eq!(provider.inspect(SimulatedState::secret_names).expect("inspect"), vec![name]);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent_and_scoped() {
        let provider = Arc::new(SimulatedProvider::in_memory());
        let ctx = ReconcileContext::new("prod");
        let secrets = store(&provider, RetryPolicy::none());
        secrets
            .create(&ctx, "node-1", &payload(MAX_SECRET_CHUNK_BYTES + 1))
            .await
            .expect("create");
        secrets.create(&ctx, "node-10", b"other").await.expect("create");

        assert_eq!(secrets.delete(&ctx, "node-1").await.expect("delete"), 2);
        assert_eq!(secrets.delete(&ctx, "node-1").await.expect("again"), 0);
        assert_eq!(
            provider.inspect(SimulatedState::secret_names).expect("inspect"),
            vec![chunk_name(&secret_prefix(&ctx, "node-10"), 0)]
        );
    }

    #[test]
    fn test_boot_script() {
        let stored = StoredUserData {
            prefix: String::from("infra-converge.io/prod/node-1"),
            chunks: 3,
        };
        let endpoints = [ServiceEndpoint {
            service_id: String::from("secretsmanager"),
            url: String::from("https://secrets.internal"),
            signing_region: String::from("eu-west-1"),
        }];

        let script = String::from_utf8(user_data(&stored, "eu-west-1", &endpoints).expect("script"))
            .expect("utf8");

        assert!(script.starts_with("#!/bin/bash\n"));
        assert!(script.contains("SECRET_PREFIX=\"infra-converge.io/prod/node-1\""));
        assert!(script.contains("CHUNKS=\"3\""));
        assert!(script.contains("--endpoint-url https://secrets.internal"));
        assert!(script.contains("\"${SECRET_PREFIX}-${i}\""));

        let plain = String::from_utf8(user_data(&stored, "eu-west-1", &[]).expect("script"))
            .expect("utf8");
        assert!(!plain.contains("--endpoint-url"));
    }

    #[test]
    fn test_boot_script_rejects_empty_store() {
        let stored = StoredUserData {
            prefix: String::from("p"),
            chunks: 0,
        };
        assert!(user_data(&stored, "eu-west-1", &[]).is_err());
        assert!(
            user_data(
                &StoredUserData {
                    prefix: String::from("p"),
                    chunks: 1,
                },
                "",
                &[]
            )
            .is_err()
        );
    }
}
