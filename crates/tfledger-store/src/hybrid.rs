// ABOUTME: Local-first run store that mirrors writes to object storage in the background.
// ABOUTME: Reads fall back to the remote and backfill; listings merge both sides with sync tags.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tfledger_core::{ListQuery, ListedRun, Run, RunId, SyncStatus, sort_newest_first};

use crate::error::Result;
use crate::local::LocalStore;
use crate::mirror::{Mirror, MirrorJob};
use crate::remote::RemoteStore;
use crate::store::{RunListing, RunStore, StoreKind, SyncResult};

/// The local store is authoritative for writes; the remote store is a
/// best-effort mirror. A write succeeds once it is on local disk.
#[derive(Debug)]
pub struct HybridStore {
    local: LocalStore,
    remote: RemoteStore,
    mirror: Mirror,
    concurrency: usize,
    drain_timeout: Duration,
}

impl HybridStore {
    /// Must be called from within a tokio runtime; starts the mirror queue.
    pub fn new(local: LocalStore, remote: RemoteStore, mirror_concurrency: usize) -> Self {
        let concurrency = mirror_concurrency.max(1);
        let drain_timeout = remote.op_timeout();
        let mirror = Mirror::spawn(local.clone(), remote.clone(), concurrency);
        Self {
            local,
            remote,
            mirror,
            concurrency,
            drain_timeout,
        }
    }

    pub fn local(&self) -> &LocalStore {
        &self.local
    }

    pub fn remote(&self) -> &RemoteStore {
        &self.remote
    }

    /// Background mirror jobs that have failed since the store was opened.
    pub fn mirror_failures(&self) -> u64 {
        self.mirror.failures()
    }

    /// Local listing only, every run tagged `Local`.
    pub async fn list_runs_local(&self, query: &ListQuery) -> Result<RunListing> {
        let runs = self.list_local(query).await?;
        Ok(RunListing::tagged(runs, Some(SyncStatus::Local)))
    }

    /// Remote listing only, every run tagged `Remote`.
    pub async fn list_remote_runs(&self, query: &ListQuery) -> Result<RunListing> {
        let runs = self.remote.list_runs(query).await?;
        Ok(RunListing::tagged(runs, Some(SyncStatus::Remote)))
    }

    pub async fn remote_run_ids(&self) -> Result<HashSet<String>> {
        self.remote.list_run_ids().await
    }

    pub fn is_local(&self, id: &str) -> Result<bool> {
        self.local.has_run(id)
    }

    /// Where a single run lives, or None when neither side has it.
    pub async fn provenance(&self, id: &str) -> Result<Option<SyncStatus>> {
        let local = self.local.has_run(id)?;
        let remote = self.remote.has_run(id).await?;
        Ok(match (local, remote) {
            (true, true) => Some(SyncStatus::Synced),
            (true, false) => Some(SyncStatus::Local),
            (false, true) => Some(SyncStatus::Remote),
            (false, false) => None,
        })
    }

    /// Copy a local run, and its output when present, to the remote store.
    /// The output copy is best-effort.
    pub async fn upload_run(&self, id: &str) -> Result<()> {
        let run = self.local.get_run(id)?;
        self.remote.save_run(&run).await?;

        match self.local.get_output(id) {
            Ok(output) if !output.is_empty() => {
                if let Err(e) = self.remote.save_output(id, &output).await {
                    tracing::warn!("uploaded run {} but not its output: {}", id, e);
                }
            }
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => tracing::warn!("could not read output for {}: {}", id, e),
        }
        Ok(())
    }

    /// Copy a remote run, and its output when present, to the local store.
    /// The output copy is best-effort.
    pub async fn download_run(&self, id: &str) -> Result<()> {
        let run = self.remote.get_run(id).await?;
        self.local.save_run(&run)?;

        match self.remote.get_output(id).await {
            Ok(output) if !output.is_empty() => {
                if let Err(e) = self.local.save_output(id, &output) {
                    tracing::warn!("downloaded run {} but not its output: {}", id, e);
                }
            }
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => tracing::warn!("could not fetch output for {}: {}", id, e),
        }
        Ok(())
    }

    async fn list_local(&self, query: &ListQuery) -> Result<Vec<Run>> {
        let local = self.local.clone();
        let query = query.clone();
        tokio::task::spawn_blocking(move || local.list_runs(&query)).await?
    }

    async fn list_local_ids(&self) -> Result<Vec<String>> {
        let local = self.local.clone();
        tokio::task::spawn_blocking(move || local.list_run_ids()).await?
    }
}

/// Merge both listings. Runs on both sides are `Synced` and the local copy
/// wins; the rest are `Local` or `Remote`.
fn merge(local: Vec<Run>, remote: Vec<Run>, limit: usize) -> Vec<ListedRun> {
    let local_ids: HashSet<String> = local.iter().map(|r| r.id.clone()).collect();
    let remote_ids: HashSet<String> = remote.iter().map(|r| r.id.clone()).collect();

    let mut merged: Vec<ListedRun> = local
        .into_iter()
        .map(|run| {
            let status = if remote_ids.contains(&run.id) {
                SyncStatus::Synced
            } else {
                SyncStatus::Local
            };
            ListedRun::new(run, Some(status))
        })
        .collect();

    let mut seen_remote = HashSet::new();
    merged.extend(
        remote
            .into_iter()
            .filter(|run| !local_ids.contains(&run.id) && seen_remote.insert(run.id.clone()))
            .map(|run| ListedRun::new(run, Some(SyncStatus::Remote))),
    );

    sort_newest_first(&mut merged, |listed| &listed.run);
    if limit > 0 {
        merged.truncate(limit);
    }
    merged
}

#[async_trait]
impl RunStore for HybridStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Hybrid
    }

    fn as_hybrid(&self) -> Option<&HybridStore> {
        Some(self)
    }

    async fn save_run(&self, run: &Run) -> Result<()> {
        self.local.save_run(run)?;
        self.mirror.enqueue(MirrorJob::PushRun(run.clone()));
        Ok(())
    }

    async fn get_run(&self, id: &str) -> Result<Run> {
        match self.local.get_run(id) {
            Err(e) if e.is_not_found() => {}
            other => return other,
        }

        let run = self.remote.get_run(id).await?;
        self.mirror.enqueue(MirrorJob::BackfillRun(run.clone()));
        Ok(run)
    }

    async fn list_runs(&self, query: &ListQuery) -> Result<RunListing> {
        let (local, remote) = tokio::join!(self.list_local(query), self.remote.list_runs(query));
        let local = local?;

        match remote {
            Ok(remote) => Ok(RunListing {
                runs: merge(local, remote, query.limit),
                offline: false,
            }),
            Err(e) => {
                tracing::warn!("remote listing failed, showing local runs only: {}", e);
                let mut listing = RunListing::tagged(local, Some(SyncStatus::Local));
                listing.offline = true;
                Ok(listing)
            }
        }
    }

    async fn save_output(&self, id: &str, output: &[u8]) -> Result<()> {
        self.local.save_output(id, output)?;
        self.mirror.enqueue(MirrorJob::PushOutput {
            id: id.to_string(),
            output: output.to_vec(),
        });
        Ok(())
    }

    async fn get_output(&self, id: &str) -> Result<Vec<u8>> {
        match self.local.get_output(id) {
            Err(e) if e.is_not_found() => {}
            other => return other,
        }

        let output = self.remote.get_output(id).await?;
        self.mirror.enqueue(MirrorJob::BackfillOutput {
            id: id.to_string(),
            output: output.clone(),
        });
        Ok(output)
    }

    fn output_path(&self, id: &str) -> String {
        self.local.output_path(id).display().to_string()
    }

    /// Deletes from both sides. A local failure is reported in preference
    /// to a remote one.
    async fn delete_run(&self, id: &str) -> Result<()> {
        RunId::parse(id)?;
        let local = self.local.delete_run(id);
        let remote = self.remote.delete_run(id).await;
        local.and(remote)
    }

    /// True when either side has the record. A remote failure is logged and
    /// the local answer is returned.
    async fn has_run(&self, id: &str) -> Result<bool> {
        if self.local.has_run(id)? {
            return Ok(true);
        }
        match self.remote.has_run(id).await {
            Ok(found) => Ok(found),
            Err(e) => {
                tracing::warn!("could not check remote for {}: {}", id, e);
                Ok(false)
            }
        }
    }

    /// Upload every local run whose id is missing remotely.
    async fn sync(&self) -> Result<SyncResult> {
        let (local_ids, remote_ids) = tokio::join!(self.list_local_ids(), self.remote.list_run_ids());
        let local_ids = local_ids?;
        let remote_ids = remote_ids?;

        let missing: Vec<String> = local_ids
            .into_iter()
            .filter(|id| !remote_ids.contains(id))
            .collect();
        tracing::info!("{} local runs missing from the remote store", missing.len());

        let outcomes: Vec<(String, Result<()>)> = futures::stream::iter(missing)
            .map(|id| async move {
                let result = self.upload_run(&id).await;
                (id, result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut result = SyncResult::default();
        for (id, outcome) in outcomes {
            match outcome {
                Ok(()) => result.uploaded += 1,
                Err(e) => {
                    tracing::warn!("failed to upload {}: {}", id, e);
                    result.errors += 1;
                }
            }
        }
        Ok(result)
    }

    async fn close(&self) -> Result<()> {
        self.mirror.drain(self.drain_timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RemoteConfig;
    use crate::error::StoreError;
    use chrono::{DateTime, Duration as ChronoDuration, Utc};
    use object_store::ObjectStore;
    use object_store::memory::InMemory;
    use object_store::throttle::{ThrottleConfig, ThrottledStore};
    use std::sync::Arc;
    use tempfile::TempDir;
    use tfledger_core::Status;

    fn make_run(at: DateTime<Utc>, status: Status) -> Run {
        let mut run = Run::start("prod/web", vec!["terraform".to_string(), "apply".to_string()]);
        run.id = RunId::generate_at(at).to_string();
        run.timestamp = at;
        run.status = status;
        run
    }

    fn hybrid_with(inner: Arc<dyn ObjectStore>, op_timeout: Duration) -> (TempDir, HybridStore) {
        let dir = TempDir::new().unwrap();
        let local = LocalStore::open(dir.path()).unwrap();
        let mut config = RemoteConfig::new("journal-bucket");
        config.op_timeout = op_timeout;
        let remote = RemoteStore::new(inner, config);
        (dir, HybridStore::new(local, remote, 4))
    }

    fn hybrid() -> (TempDir, HybridStore) {
        hybrid_with(Arc::new(InMemory::new()), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn writes_land_locally_then_reach_the_mirror() {
        let (_dir, store) = hybrid();
        let run = make_run(Utc::now(), Status::Success);

        RunStore::save_run(&store, &run).await.unwrap();
        RunStore::save_output(&store, &run.id, b"Apply complete!").await.unwrap();
        assert!(store.local().has_run(&run.id).unwrap());

        store.close().await.unwrap();
        assert_eq!(store.remote().get_run(&run.id).await.unwrap(), run);
        assert_eq!(store.remote().get_output(&run.id).await.unwrap(), b"Apply complete!");
        assert_eq!(store.mirror_failures(), 0);
        assert_eq!(store.provenance(&run.id).await.unwrap(), Some(SyncStatus::Synced));
    }

    #[tokio::test]
    async fn listing_tags_each_run_by_where_it_lives() {
        let (_dir, store) = hybrid();
        let now = Utc::now();
        let only_local = make_run(now - ChronoDuration::hours(3), Status::Success);
        let only_remote = make_run(now - ChronoDuration::hours(2), Status::Failed);
        let both = make_run(now - ChronoDuration::hours(1), Status::Success);

        store.local().save_run(&only_local).unwrap();
        store.remote().save_run(&only_remote).await.unwrap();
        store.local().save_run(&both).unwrap();
        store.remote().save_run(&both).await.unwrap();

        let listing = RunStore::list_runs(&store, &ListQuery::all()).await.unwrap();
        assert!(!listing.offline);
        let tagged: Vec<_> = listing
            .runs
            .iter()
            .map(|r| (r.run.id.as_str(), r.sync_status))
            .collect();
        assert_eq!(
            tagged,
            vec![
                (both.id.as_str(), Some(SyncStatus::Synced)),
                (only_remote.id.as_str(), Some(SyncStatus::Remote)),
                (only_local.id.as_str(), Some(SyncStatus::Local)),
            ]
        );

        let limited = RunStore::list_runs(&store, &ListQuery::all().with_limit(2))
            .await
            .unwrap();
        assert_eq!(limited.ids(), vec![both.id.as_str(), only_remote.id.as_str()]);

        let local_only = store.list_runs_local(&ListQuery::all()).await.unwrap();
        assert_eq!(local_only.len(), 2);
        assert!(local_only
            .runs
            .iter()
            .all(|r| r.sync_status == Some(SyncStatus::Local)));

        assert_eq!(store.list_remote_runs(&ListQuery::all()).await.unwrap().len(), 2);
        assert_eq!(store.remote_run_ids().await.unwrap().len(), 2);
        assert!(store.is_local(&only_local.id).unwrap());
        assert!(!store.is_local(&only_remote.id).unwrap());
        assert_eq!(
            store.provenance(&only_remote.id).await.unwrap(),
            Some(SyncStatus::Remote)
        );
        assert_eq!(
            store.provenance(&RunId::generate().to_string()).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn unreachable_remote_degrades_to_local_listing() {
        let slow = ThrottledStore::new(
            InMemory::new(),
            ThrottleConfig {
                wait_list_per_call: Duration::from_secs(10),
                ..ThrottleConfig::default()
            },
        );
        let (_dir, store) = hybrid_with(Arc::new(slow), Duration::from_millis(50));
        let run = make_run(Utc::now(), Status::Success);
        store.local().save_run(&run).unwrap();

        let listing = RunStore::list_runs(&store, &ListQuery::all()).await.unwrap();

        assert!(listing.offline);
        assert_eq!(listing.ids(), vec![run.id.as_str()]);
        assert_eq!(listing.runs[0].sync_status, Some(SyncStatus::Local));
    }

    #[tokio::test]
    async fn reads_fall_back_to_remote_and_backfill() {
        let (_dir, store) = hybrid();
        let run = make_run(Utc::now(), Status::Success);
        store.remote().save_run(&run).await.unwrap();
        store.remote().save_output(&run.id, b"remote output").await.unwrap();

        assert_eq!(RunStore::get_run(&store, &run.id).await.unwrap(), run);
        assert_eq!(
            RunStore::get_output(&store, &run.id).await.unwrap(),
            b"remote output"
        );

        store.close().await.unwrap();
        assert_eq!(store.local().get_run(&run.id).unwrap(), run);
        assert_eq!(store.local().get_output(&run.id).unwrap(), b"remote output");
    }

    #[tokio::test]
    async fn missing_everywhere_is_not_found() {
        let (_dir, store) = hybrid();
        let id = RunId::generate().to_string();

        assert!(matches!(
            RunStore::get_run(&store, &id).await,
            Err(StoreError::RunNotFound(_))
        ));
        assert!(matches!(
            RunStore::get_output(&store, &id).await,
            Err(StoreError::OutputNotFound(_))
        ));
        assert!(!RunStore::has_run(&store, &id).await.unwrap());
        assert!(matches!(
            RunStore::get_run(&store, "../etc").await,
            Err(StoreError::InvalidRunId(_))
        ));
    }

    #[tokio::test]
    async fn sync_uploads_only_missing_runs() {
        let (_dir, store) = hybrid();
        let now = Utc::now();
        let mut missing = Vec::new();
        for hours in 1..=3 {
            let run = make_run(now - ChronoDuration::hours(hours), Status::Success);
            store.local().save_run(&run).unwrap();
            missing.push(run);
        }
        let already = make_run(now, Status::Success);
        store.local().save_run(&already).unwrap();
        store.local().save_output(&missing[0].id, b"first").unwrap();
        store.remote().save_run(&already).await.unwrap();

        let result = store.sync().await.unwrap();

        assert_eq!(result, SyncResult { uploaded: 3, errors: 0 });
        for run in &missing {
            assert!(store.remote().has_run(&run.id).await.unwrap());
        }
        assert_eq!(store.remote().get_output(&missing[0].id).await.unwrap(), b"first");

        let again = store.sync().await.unwrap();
        assert_eq!(again, SyncResult::default());
    }

    #[tokio::test]
    async fn sync_ignores_stray_json_files() {
        let (dir, store) = hybrid();
        let run = make_run(Utc::now(), Status::Success);
        store.local().save_run(&run).unwrap();
        std::fs::write(dir.path().join("runs").join("notes.json"), "{}").unwrap();

        let first = store.sync().await.unwrap();
        assert_eq!(first, SyncResult { uploaded: 1, errors: 0 });

        let second = store.sync().await.unwrap();
        assert_eq!(second, SyncResult { uploaded: 0, errors: 0 });
        assert!(!store.remote_run_ids().await.unwrap().contains("notes"));
    }

    #[tokio::test]
    async fn upload_and_download_copy_single_runs() {
        let (_dir, store) = hybrid();
        let up = make_run(Utc::now(), Status::Success);
        store.local().save_run(&up).unwrap();
        store.upload_run(&up.id).await.unwrap();
        assert!(store.remote().has_run(&up.id).await.unwrap());

        let down = make_run(Utc::now(), Status::Failed);
        store.remote().save_run(&down).await.unwrap();
        store.remote().save_output(&down.id, b"error output").await.unwrap();
        store.download_run(&down.id).await.unwrap();
        assert_eq!(store.local().get_run(&down.id).unwrap(), down);
        assert_eq!(store.local().get_output(&down.id).unwrap(), b"error output");

        let absent = RunId::generate().to_string();
        assert!(store.upload_run(&absent).await.unwrap_err().is_not_found());
        assert!(store.download_run(&absent).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn delete_removes_both_sides() {
        let (_dir, store) = hybrid();
        let run = make_run(Utc::now(), Status::Success);
        store.local().save_run(&run).unwrap();
        store.remote().save_run(&run).await.unwrap();

        RunStore::delete_run(&store, &run.id).await.unwrap();

        assert!(!store.local().has_run(&run.id).unwrap());
        assert!(!store.remote().has_run(&run.id).await.unwrap());
        assert!(matches!(
            RunStore::delete_run(&store, "bogus").await,
            Err(StoreError::InvalidRunId(_))
        ));
    }

    #[tokio::test]
    async fn close_is_bounded_when_the_remote_hangs() {
        let slow = ThrottledStore::new(
            InMemory::new(),
            ThrottleConfig {
                wait_put_per_call: Duration::from_secs(10),
                ..ThrottleConfig::default()
            },
        );
        let (_dir, store) = hybrid_with(Arc::new(slow), Duration::from_millis(200));
        let run = make_run(Utc::now(), Status::Success);
        RunStore::save_run(&store, &run).await.unwrap();

        let started = std::time::Instant::now();
        store.close().await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(store.local().has_run(&run.id).unwrap());
    }

    #[test]
    fn merge_prefers_local_copies_and_dedupes() {
        let now = Utc::now();
        let a = make_run(now - ChronoDuration::minutes(2), Status::Success);
        let mut a_remote = a.clone();
        a_remote.status = Status::Failed;
        let b = make_run(now - ChronoDuration::minutes(1), Status::Success);

        let merged = merge(vec![a.clone()], vec![a_remote, b.clone(), b.clone()], 0);

        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].run.id, b.id);
        assert_eq!(merged[0].sync_status, Some(SyncStatus::Remote));
        assert_eq!(merged[1].run, a);
        assert_eq!(merged[1].sync_status, Some(SyncStatus::Synced));
    }
}
