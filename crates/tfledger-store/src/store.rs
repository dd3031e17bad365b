// ABOUTME: The RunStore contract implemented by the local, remote, and hybrid stores.
// ABOUTME: Also provides open_store, which picks Local or Hybrid from configuration.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tfledger_core::{ListQuery, ListedRun, Run};

use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::hybrid::HybridStore;
use crate::local::LocalStore;
use crate::remote::RemoteStore;

/// Which concrete backend sits behind a `dyn RunStore`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Local,
    Remote,
    Hybrid,
}

/// Outcome of a reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    pub uploaded: usize,
    pub errors: usize,
}

/// Result of a listing. `offline` is set when the remote mirror could not be
/// reached and the runs come from the local store alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunListing {
    pub runs: Vec<ListedRun>,
    pub offline: bool,
}

impl RunListing {
    /// Wrap runs with the same sync tag on each.
    pub fn tagged(runs: Vec<Run>, tag: Option<tfledger_core::SyncStatus>) -> Self {
        Self {
            runs: runs.into_iter().map(|r| ListedRun::new(r, tag)).collect(),
            offline: false,
        }
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.runs.iter().map(|r| r.run.id.as_str()).collect()
    }
}

/// Persistence contract for run records and their raw output blobs.
///
/// Every operation taking an id validates it first and returns
/// `StoreError::InvalidRunId` without touching storage when it is malformed.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Capability probe; callers use this instead of downcasting.
    fn kind(&self) -> StoreKind;

    /// The hybrid coordinator behind this store, for mirror-specific operations.
    fn as_hybrid(&self) -> Option<&HybridStore> {
        None
    }

    /// Create or overwrite a run record by id.
    async fn save_run(&self, run: &Run) -> Result<()>;

    async fn get_run(&self, id: &str) -> Result<Run>;

    /// Filtered listing, newest first, truncated to `query.limit` when non-zero.
    async fn list_runs(&self, query: &ListQuery) -> Result<RunListing>;

    async fn save_output(&self, id: &str, output: &[u8]) -> Result<()>;

    async fn get_output(&self, id: &str) -> Result<Vec<u8>>;

    /// Human-facing locator for a run's output blob. May be a URI.
    fn output_path(&self, id: &str) -> String;

    /// Remove the record and its output. Missing artifacts are not an error.
    async fn delete_run(&self, id: &str) -> Result<()>;

    /// Existence check that never reads the record body.
    async fn has_run(&self, id: &str) -> Result<bool>;

    /// Push records missing from the mirror. Only the hybrid store supports this.
    async fn sync(&self) -> Result<SyncResult> {
        Err(StoreError::Unsupported("sync"))
    }

    /// Release resources, draining background work where the store has any.
    async fn close(&self) -> Result<()>;
}

/// Open the store described by `config`: Local when no bucket is configured,
/// Hybrid otherwise. If the remote client cannot be built, falls back to the
/// local store with a warning. Must be called from within a tokio runtime.
pub fn open_store(config: &StoreConfig) -> Result<Arc<dyn RunStore>> {
    let local = LocalStore::open(&config.local_path)?;

    let Some(remote_config) = &config.remote else {
        tracing::debug!("no bucket configured, using local store at {}", config.local_path.display());
        return Ok(Arc::new(local));
    };

    match RemoteStore::connect(remote_config.clone()) {
        Ok(remote) => {
            tracing::info!(
                bucket = %remote_config.bucket,
                prefix = %remote_config.prefix,
                "mirroring runs to object storage"
            );
            Ok(Arc::new(HybridStore::new(local, remote, config.mirror_concurrency)))
        }
        Err(e) => {
            tracing::warn!("failed to initialize remote store, continuing local-only: {}", e);
            Ok(Arc::new(local))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RemoteConfig;
    use tempfile::TempDir;

    #[tokio::test]
    async fn open_store_without_bucket_is_local() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::local(dir.path().join("journal"));

        let store = open_store(&config).unwrap();

        assert_eq!(store.kind(), StoreKind::Local);
        assert!(store.as_hybrid().is_none());
        assert!(dir.path().join("journal").join("runs").is_dir());
        assert!(matches!(store.sync().await, Err(StoreError::Unsupported(_))));
    }

    #[tokio::test]
    async fn open_store_with_bucket_is_hybrid() {
        let dir = TempDir::new().unwrap();
        let mut config = StoreConfig::local(dir.path().to_path_buf());
        let mut remote = RemoteConfig::new("tfledger-test-bucket");
        remote.region = Some("us-east-1".to_string());
        remote.endpoint = Some("http://127.0.0.1:9".to_string());
        remote.allow_http = true;
        config.remote = Some(remote);

        let store = open_store(&config).unwrap();

        assert_eq!(store.kind(), StoreKind::Hybrid);
        assert_eq!(store.as_hybrid().map(|h| h.remote().bucket()), Some("tfledger-test-bucket"));
        assert!(store.output_path("run_abc12345").ends_with("run_abc12345.txt"));
        store.close().await.unwrap();
    }
}
