// ABOUTME: Object-storage run store using the same date-partitioned key layout as the local store.
// ABOUTME: Listing scans day prefixes in parallel with bounded partition and fetch concurrency.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Days, NaiveDate, Utc};
use futures::{StreamExt, TryStreamExt};
use object_store::aws::AmazonS3Builder;
use object_store::path::Path;
use object_store::{ClientOptions, ObjectStore};
use tfledger_core::{ListQuery, Run, RunId};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;

use crate::config::RemoteConfig;
use crate::error::{Result, StoreError};
use crate::layout::{self, Artifact, OUTPUTS_DIR, RUNS_DIR};
use crate::store::{RunListing, RunStore, StoreKind};

/// Counters for object fetches made while listing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchStats {
    /// Highest number of fetches observed in flight at once.
    pub peak_in_flight: usize,
    pub total: usize,
}

#[derive(Debug, Default)]
struct FetchGauge {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    total: AtomicUsize,
}

impl FetchGauge {
    fn enter(&self) -> FetchGuard<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);
        FetchGuard(self)
    }
}

struct FetchGuard<'a>(&'a FetchGauge);

impl Drop for FetchGuard<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A run store backed by any `ObjectStore`, normally S3.
///
/// Keys are `<prefix>/runs/YYYY/MM/DD/<id>.json` and
/// `<prefix>/outputs/YYYY/MM/DD/<id>.txt`. Every single-object operation is
/// bounded by `op_timeout`; a listing by five times that.
#[derive(Clone)]
pub struct RemoteStore {
    store: Arc<dyn ObjectStore>,
    config: Arc<RemoteConfig>,
    prefix: String,
    gauge: Arc<FetchGauge>,
}

impl fmt::Debug for RemoteStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteStore")
            .field("bucket", &self.config.bucket)
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl RemoteStore {
    /// Wrap an existing object store. Used directly by tests with `InMemory`.
    pub fn new(store: Arc<dyn ObjectStore>, config: RemoteConfig) -> Self {
        let prefix = config
            .prefix
            .split('/')
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("/");
        Self {
            store,
            config: Arc::new(config),
            prefix,
            gauge: Arc::new(FetchGauge::default()),
        }
    }

    /// Build an S3 client from the configuration and the standard AWS
    /// environment. A named profile is read from the shared credentials file.
    /// Does not contact the bucket.
    pub fn connect(config: RemoteConfig) -> Result<Self> {
        let client_options = ClientOptions::new()
            .with_pool_max_idle_per_host(config.pool_size)
            .with_timeout(config.op_timeout);

        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(&config.bucket)
            .with_allow_http(config.allow_http)
            .with_client_options(client_options);

        if let Some(region) = &config.region {
            builder = builder.with_region(region);
        }
        if let Some(endpoint) = &config.endpoint {
            builder = builder.with_endpoint(endpoint);
        }
        if let Some(profile) = &config.profile {
            match load_profile(profile) {
                Ok(Some(creds)) => {
                    builder = builder
                        .with_access_key_id(creds.access_key_id)
                        .with_secret_access_key(creds.secret_access_key);
                    if let Some(token) = creds.session_token {
                        builder = builder.with_token(token);
                    }
                }
                Ok(None) => {
                    tracing::warn!("aws profile {:?} not found, using default credential chain", profile)
                }
                Err(e) => {
                    tracing::warn!("could not read aws credentials file: {}", e)
                }
            }
        }

        let store = builder.build()?;
        Ok(Self::new(Arc::new(store), config))
    }

    pub fn bucket(&self) -> &str {
        &self.config.bucket
    }

    pub fn op_timeout(&self) -> Duration {
        self.config.op_timeout
    }

    pub fn fetch_stats(&self) -> FetchStats {
        FetchStats {
            peak_in_flight: self.gauge.peak.load(Ordering::SeqCst),
            total: self.gauge.total.load(Ordering::SeqCst),
        }
    }

    pub async fn save_run(&self, run: &Run) -> Result<()> {
        let id = RunId::parse(&run.id)?;
        let bytes = layout::encode_run(run)?;
        let path = self.path(&layout::key(Artifact::Record, &id));
        self.put(&path, bytes, "put run").await
    }

    pub async fn get_run(&self, id: &str) -> Result<Run> {
        let id = RunId::parse(id)?;
        match self.read_artifact(Artifact::Record, &id, "get run").await? {
            Some(bytes) => layout::decode_run(&bytes),
            None => Err(StoreError::RunNotFound(id.to_string())),
        }
    }

    pub async fn save_output(&self, id: &str, output: &[u8]) -> Result<()> {
        let id = RunId::parse(id)?;
        let path = self.path(&layout::key(Artifact::Output, &id));
        self.put(&path, output.to_vec(), "put output").await
    }

    pub async fn get_output(&self, id: &str) -> Result<Vec<u8>> {
        let id = RunId::parse(id)?;
        match self.read_artifact(Artifact::Output, &id, "get output").await? {
            Some(bytes) => Ok(bytes.to_vec()),
            None => Err(StoreError::OutputNotFound(id.to_string())),
        }
    }

    /// `s3://<bucket>/<key>` for the run's output object.
    pub fn output_path(&self, id: &str) -> String {
        let key = match RunId::parse(id) {
            Ok(id) => layout::key(Artifact::Output, &id),
            Err(_) => format!("{OUTPUTS_DIR}/{id}.txt"),
        };
        format!("s3://{}/{}", self.config.bucket, self.full_key(&key))
    }

    pub async fn delete_run(&self, id: &str) -> Result<()> {
        let id = RunId::parse(id)?;
        for artifact in [Artifact::Record, Artifact::Output] {
            for path in self.candidate_paths(artifact, &id) {
                timed("delete", self.config.op_timeout, async {
                    match self.store.delete(&path).await {
                        Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
                        Err(e) => Err(StoreError::from(e)),
                    }
                })
                .await?;
            }
        }
        Ok(())
    }

    /// HEAD on the record key; never downloads the body.
    pub async fn has_run(&self, id: &str) -> Result<bool> {
        let id = RunId::parse(id)?;
        for path in self.candidate_paths(Artifact::Record, &id) {
            let found = timed("head run", self.config.op_timeout, async {
                match self.store.head(&path).await {
                    Ok(_) => Ok(true),
                    Err(object_store::Error::NotFound { .. }) => Ok(false),
                    Err(e) => Err(StoreError::from(e)),
                }
            })
            .await?;
            if found {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Every record id under the runs prefix, from key names alone.
    pub async fn list_run_ids(&self) -> Result<HashSet<String>> {
        let prefix = self.path(RUNS_DIR);
        let metas = timed(
            "list run ids",
            self.config.op_timeout * 3,
            self.store.list(Some(&prefix)).try_collect::<Vec<_>>(),
        )
        .await?;

        Ok(metas
            .iter()
            .filter_map(|meta| meta.location.filename().and_then(layout::record_id_from_key))
            .filter(|id| RunId::parse(id).is_ok())
            .map(str::to_string)
            .collect())
    }

    /// Scan the day partitions covered by the query, newest day first.
    ///
    /// Without `since`, only the last `lookback_days` days are scanned.
    /// Records that fail to download or decode are skipped with a warning;
    /// a partition that cannot be listed fails the whole call.
    pub async fn list_runs(&self, query: &ListQuery) -> Result<Vec<Run>> {
        timed(
            "list runs",
            self.config.op_timeout * 5,
            self.scan_partitions(query),
        )
        .await
    }

    async fn scan_partitions(&self, query: &ListQuery) -> Result<Vec<Run>> {
        let today = Utc::now().date_naive();
        let days = partition_days(query.since, today, self.config.lookback_days);
        let target = match (query.limit, self.config.early_stop_factor) {
            (0, _) | (_, 0) => usize::MAX,
            (limit, factor) => limit.saturating_mul(factor),
        };

        let found = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));
        let partitions = Arc::new(Semaphore::new(self.config.partition_concurrency.max(1)));
        let fetches = Arc::new(Semaphore::new(self.config.fetch_concurrency.max(1)));
        let query = Arc::new(query.clone());
        let mut tasks = JoinSet::new();
        let mut scanned = 0usize;

        for day in days {
            if stop.load(Ordering::SeqCst) {
                break;
            }
            let Ok(permit) = partitions.clone().acquire_owned().await else {
                break;
            };
            // The partition that freed this slot may have reached the target.
            if stop.load(Ordering::SeqCst) {
                break;
            }
            scanned += 1;

            let store = self.clone();
            let query = Arc::clone(&query);
            let fetches = Arc::clone(&fetches);
            let found = Arc::clone(&found);
            let stop = Arc::clone(&stop);
            tasks.spawn(async move {
                let result = store
                    .scan_day(day, &query, &fetches, &found, &stop, target)
                    .await;
                if result.is_err() {
                    stop.store(true, Ordering::SeqCst);
                }
                drop(permit);
                result
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined? {
                tasks.abort_all();
                return Err(e);
            }
        }

        let mut runs = std::mem::take(&mut *found.lock().await);
        query.finish(&mut runs);
        tracing::debug!(
            "listed {} runs from {} partitions in {}",
            runs.len(),
            scanned,
            self.config.bucket
        );
        Ok(runs)
    }

    async fn scan_day(
        &self,
        day: NaiveDate,
        query: &ListQuery,
        fetches: &Semaphore,
        found: &Mutex<Vec<Run>>,
        stop: &AtomicBool,
        target: usize,
    ) -> Result<()> {
        let prefix = self.path(&layout::day_prefix(day));
        let metas = timed(
            "list partition",
            self.config.op_timeout,
            self.store.list(Some(&prefix)).try_collect::<Vec<_>>(),
        )
        .await?;

        let records: Vec<Path> = metas
            .into_iter()
            .map(|meta| meta.location)
            .filter(|location| {
                location
                    .filename()
                    .and_then(layout::record_id_from_key)
                    .is_some_and(|id| RunId::parse(id).is_ok())
            })
            .collect();

        futures::stream::iter(records)
            .map(|location| async move {
                let Ok(_permit) = fetches.acquire().await else {
                    return;
                };
                let _in_flight = self.gauge.enter();
                let bytes = match self.get_bytes(&location, "get run").await {
                    Ok(Some(bytes)) => bytes,
                    Ok(None) => return,
                    Err(e) => {
                        tracing::warn!("skipping unreadable run object {}: {}", location, e);
                        return;
                    }
                };
                match layout::decode_run(&bytes) {
                    Ok(run) if query.matches(&run) => {
                        let mut found = found.lock().await;
                        found.push(run);
                        if found.len() >= target {
                            stop.store(true, Ordering::SeqCst);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!("skipping corrupt run object {}: {}", location, e),
                }
            })
            .buffer_unordered(self.config.fetch_concurrency.max(1))
            .collect::<Vec<()>>()
            .await;

        Ok(())
    }

    fn full_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.prefix, key)
        }
    }

    fn path(&self, key: &str) -> Path {
        Path::from(self.full_key(key))
    }

    fn candidate_paths(&self, artifact: Artifact, id: &RunId) -> Vec<Path> {
        let mut paths = vec![self.path(&layout::key(artifact, id))];
        if !id.is_legacy() {
            paths.push(self.path(&layout::legacy_key(artifact, id)));
        }
        paths
    }

    async fn read_artifact(
        &self,
        artifact: Artifact,
        id: &RunId,
        operation: &'static str,
    ) -> Result<Option<Bytes>> {
        for path in self.candidate_paths(artifact, id) {
            if let Some(bytes) = self.get_bytes(&path, operation).await? {
                return Ok(Some(bytes));
            }
        }
        Ok(None)
    }

    async fn get_bytes(&self, path: &Path, operation: &'static str) -> Result<Option<Bytes>> {
        timed(operation, self.config.op_timeout, async {
            match self.store.get(path).await {
                Ok(found) => found.bytes().await.map(Some).map_err(StoreError::from),
                Err(object_store::Error::NotFound { .. }) => Ok(None),
                Err(e) => Err(StoreError::from(e)),
            }
        })
        .await
    }

    async fn put(&self, path: &Path, bytes: Vec<u8>, operation: &'static str) -> Result<()> {
        timed(
            operation,
            self.config.op_timeout,
            self.store.put(path, Bytes::from(bytes)),
        )
        .await?;
        tracing::debug!("wrote s3://{}/{}", self.config.bucket, path);
        Ok(())
    }
}

/// Run `fut` with a deadline, mapping expiry to `StoreError::Timeout`.
async fn timed<T, E>(
    operation: &'static str,
    after: Duration,
    fut: impl Future<Output = std::result::Result<T, E>>,
) -> Result<T>
where
    StoreError: From<E>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result.map_err(StoreError::from),
        Err(_) => Err(StoreError::Timeout { operation, after }),
    }
}

/// UTC days to scan, newest first: from today back to the `since` date, or
/// back `lookback_days` days when there is no `since`. Empty for a future `since`.
fn partition_days(
    since: Option<DateTime<Utc>>,
    today: NaiveDate,
    lookback_days: u32,
) -> Vec<NaiveDate> {
    let start = match since {
        Some(since) => since.date_naive(),
        None => today
            .checked_sub_days(Days::new(u64::from(lookback_days)))
            .unwrap_or(NaiveDate::MIN),
    };

    let mut days = Vec::new();
    let mut day = today;
    while day >= start {
        days.push(day);
        match day.pred_opt() {
            Some(prev) => day = prev,
            None => break,
        }
    }
    days
}

#[derive(Debug, PartialEq, Eq)]
struct ProfileCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

fn load_profile(profile: &str) -> std::io::Result<Option<ProfileCredentials>> {
    let path = match std::env::var_os("AWS_SHARED_CREDENTIALS_FILE") {
        Some(path) => PathBuf::from(path),
        None => match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(".aws").join("credentials"),
            None => return Ok(None),
        },
    };
    let text = std::fs::read_to_string(path)?;
    Ok(parse_profile(&text, profile))
}

/// Pull one profile's keys out of an INI-style credentials file.
fn parse_profile(text: &str, profile: &str) -> Option<ProfileCredentials> {
    let mut in_profile = false;
    let mut access_key_id = None;
    let mut secret_access_key = None;
    let mut session_token = None;

    for line in text.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(section) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            if in_profile {
                break;
            }
            in_profile = section.trim() == profile;
            continue;
        }
        if !in_profile {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let value = value.trim().to_string();
            match key.trim() {
                "aws_access_key_id" => access_key_id = Some(value),
                "aws_secret_access_key" => secret_access_key = Some(value),
                "aws_session_token" => session_token = Some(value),
                _ => {}
            }
        }
    }

    Some(ProfileCredentials {
        access_key_id: access_key_id?,
        secret_access_key: secret_access_key?,
        session_token,
    })
}

#[async_trait]
impl RunStore for RemoteStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Remote
    }

    async fn save_run(&self, run: &Run) -> Result<()> {
        RemoteStore::save_run(self, run).await
    }

    async fn get_run(&self, id: &str) -> Result<Run> {
        RemoteStore::get_run(self, id).await
    }

    async fn list_runs(&self, query: &ListQuery) -> Result<RunListing> {
        let runs = RemoteStore::list_runs(self, query).await?;
        Ok(RunListing::tagged(runs, None))
    }

    async fn save_output(&self, id: &str, output: &[u8]) -> Result<()> {
        RemoteStore::save_output(self, id, output).await
    }

    async fn get_output(&self, id: &str) -> Result<Vec<u8>> {
        RemoteStore::get_output(self, id).await
    }

    fn output_path(&self, id: &str) -> String {
        RemoteStore::output_path(self, id)
    }

    async fn delete_run(&self, id: &str) -> Result<()> {
        RemoteStore::delete_run(self, id).await
    }

    async fn has_run(&self, id: &str) -> Result<bool> {
        RemoteStore::has_run(self, id).await
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use object_store::memory::InMemory;
    use object_store::throttle::{ThrottleConfig, ThrottledStore};
    use tfledger_core::Status;

    fn make_run(at: DateTime<Utc>, workspace: &str, status: Status) -> Run {
        let mut run = Run::start(workspace, vec!["terraform".to_string(), "plan".to_string()]);
        run.id = RunId::generate_at(at).to_string();
        run.timestamp = at;
        run.status = status;
        run.user = "alice".to_string();
        run
    }

    fn memory_store(prefix: &str) -> (Arc<InMemory>, RemoteStore) {
        let inner = Arc::new(InMemory::new());
        let mut config = RemoteConfig::new("journal-bucket");
        config.prefix = prefix.to_string();
        let store = RemoteStore::new(inner.clone(), config);
        (inner, store)
    }

    #[tokio::test]
    async fn save_and_get_use_partitioned_prefixed_keys() {
        let (inner, store) = memory_store("/team-a/");
        let at = Utc::now();
        let run = make_run(at, "prod", Status::Success);

        store.save_run(&run).await.unwrap();
        store.save_output(&run.id, b"Apply complete!").await.unwrap();

        let key = format!("team-a/runs/{}/{}.json", at.format("%Y/%m/%d"), run.id);
        inner.head(&Path::from(key)).await.unwrap();

        assert_eq!(store.get_run(&run.id).await.unwrap(), run);
        assert_eq!(store.get_output(&run.id).await.unwrap(), b"Apply complete!");
        assert_eq!(
            store.output_path(&run.id),
            format!(
                "s3://journal-bucket/team-a/outputs/{}/{}.txt",
                at.format("%Y/%m/%d"),
                run.id
            )
        );
        assert!(store.has_run(&run.id).await.unwrap());
    }

    #[tokio::test]
    async fn missing_and_malformed_ids() {
        let (_inner, store) = memory_store("");
        let id = RunId::generate().to_string();

        assert!(matches!(store.get_run(&id).await, Err(StoreError::RunNotFound(_))));
        assert!(matches!(store.get_output(&id).await, Err(StoreError::OutputNotFound(_))));
        assert!(!store.has_run(&id).await.unwrap());

        for bad in ["nonexistent", "../../etc/passwd", "run_", ""] {
            assert!(matches!(store.get_run(bad).await, Err(StoreError::InvalidRunId(_))));
            assert!(matches!(store.delete_run(bad).await, Err(StoreError::InvalidRunId(_))));
            assert!(matches!(store.has_run(bad).await, Err(StoreError::InvalidRunId(_))));
        }
    }

    #[tokio::test]
    async fn delete_removes_both_objects_and_tolerates_absence() {
        let (_inner, store) = memory_store("");
        let run = make_run(Utc::now(), "prod", Status::Success);
        store.save_run(&run).await.unwrap();
        store.save_output(&run.id, b"out").await.unwrap();

        store.delete_run(&run.id).await.unwrap();
        assert!(!store.has_run(&run.id).await.unwrap());
        assert!(store.get_output(&run.id).await.unwrap_err().is_not_found());

        store.delete_run(&run.id).await.unwrap();
    }

    #[tokio::test]
    async fn list_scans_recent_partitions_and_applies_filters() {
        let (_inner, store) = memory_store("ci");
        let now = Utc::now();
        let today = make_run(now, "prod/web", Status::Success);
        let yesterday = make_run(now - ChronoDuration::days(1), "prod/api", Status::Failed);
        let last_week = make_run(now - ChronoDuration::days(7), "dev/web", Status::Success);
        let ancient = make_run(now - ChronoDuration::days(45), "prod/web", Status::Success);
        for run in [&today, &yesterday, &last_week, &ancient] {
            store.save_run(run).await.unwrap();
        }

        let all = store.list_runs(&ListQuery::all()).await.unwrap();
        let ids: Vec<_> = all.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec![today.id.as_str(), yesterday.id.as_str(), last_week.id.as_str()]);

        let with_since = store
            .list_runs(&ListQuery::all().with_since(now - ChronoDuration::days(50)))
            .await
            .unwrap();
        assert_eq!(with_since.len(), 4);

        let failed = store
            .list_runs(&ListQuery::all().with_status(Status::Failed))
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, yesterday.id);

        let prod = store
            .list_runs(&ListQuery::all().with_workspace("prod%"))
            .await
            .unwrap();
        assert_eq!(prod.len(), 2);

        let limited = store.list_runs(&ListQuery::all().with_limit(1)).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, today.id);
    }

    #[tokio::test]
    async fn list_skips_corrupt_objects() {
        let (inner, store) = memory_store("");
        let run = make_run(Utc::now(), "prod", Status::Success);
        store.save_run(&run).await.unwrap();

        let broken = RunId::generate();
        let key = layout::key(Artifact::Record, &broken);
        inner
            .put(&Path::from(key), Bytes::from_static(b"{not json"))
            .await
            .unwrap();

        let runs = store.list_runs(&ListQuery::all()).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(store.list_run_ids().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn list_run_ids_includes_legacy_keys() {
        let (_inner, store) = memory_store("");
        let mut legacy = make_run(Utc::now(), "prod", Status::Success);
        legacy.id = "run_abc12345".to_string();
        let dated = make_run(Utc::now(), "prod", Status::Success);
        store.save_run(&legacy).await.unwrap();
        store.save_run(&dated).await.unwrap();

        let ids = store.list_run_ids().await.unwrap();
        assert!(ids.contains("run_abc12345"));
        assert!(ids.contains(&dated.id));
        assert_eq!(store.get_run("run_abc12345").await.unwrap(), legacy);
    }

    #[tokio::test]
    async fn fetches_stay_within_the_shared_bound() {
        let throttled = ThrottledStore::new(
            InMemory::new(),
            ThrottleConfig {
                wait_get_per_call: std::time::Duration::from_millis(25),
                ..ThrottleConfig::default()
            },
        );
        let mut config = RemoteConfig::new("journal-bucket");
        config.fetch_concurrency = 2;
        config.partition_concurrency = 4;
        let store = RemoteStore::new(Arc::new(throttled), config);

        let now = Utc::now();
        for day in 0..4 {
            for minute in 0..3 {
                let at = now - ChronoDuration::days(day) - ChronoDuration::minutes(minute);
                store.save_run(&make_run(at, "prod", Status::Success)).await.unwrap();
            }
        }

        let runs = store.list_runs(&ListQuery::all()).await.unwrap();
        assert_eq!(runs.len(), 12);

        let stats = store.fetch_stats();
        assert_eq!(stats.total, 12);
        assert!(stats.peak_in_flight >= 1);
        assert!(stats.peak_in_flight <= 2, "peak was {}", stats.peak_in_flight);
    }

    #[tokio::test]
    async fn early_stop_skips_older_partitions() {
        let mut config = RemoteConfig::new("journal-bucket");
        config.partition_concurrency = 1;
        config.early_stop_factor = 1;
        let store = RemoteStore::new(Arc::new(InMemory::new()), config);

        let now = Utc::now();
        let newest = make_run(now, "prod", Status::Success);
        store.save_run(&newest).await.unwrap();
        for day in 1..4 {
            let run = make_run(now - ChronoDuration::days(day), "prod", Status::Success);
            store.save_run(&run).await.unwrap();
        }

        let runs = store.list_runs(&ListQuery::all().with_limit(1)).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].id, newest.id);
        assert_eq!(store.fetch_stats().total, 1);
    }

    #[tokio::test]
    async fn slow_listing_times_out() {
        let throttled = ThrottledStore::new(
            InMemory::new(),
            ThrottleConfig {
                wait_list_per_call: std::time::Duration::from_secs(5),
                ..ThrottleConfig::default()
            },
        );
        let mut config = RemoteConfig::new("journal-bucket");
        config.op_timeout = std::time::Duration::from_millis(50);
        let store = RemoteStore::new(Arc::new(throttled), config);

        let err = store.list_runs(&ListQuery::all()).await.unwrap_err();
        assert!(matches!(err, StoreError::Timeout { .. }), "got {err}");
        assert!(err.is_transient());

        let err = store.list_run_ids().await.unwrap_err();
        assert!(matches!(err, StoreError::Timeout { operation: "list run ids", .. }));
    }

    #[test]
    fn partition_days_cover_the_window_newest_first() {
        let today = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();

        let days = partition_days(None, today, 30);
        assert_eq!(days.len(), 31);
        assert_eq!(days[0], today);
        assert_eq!(days[30], NaiveDate::from_ymd_opt(2026, 1, 31).unwrap());

        let since = NaiveDate::from_ymd_opt(2026, 2, 27)
            .unwrap()
            .and_hms_opt(13, 0, 0)
            .unwrap()
            .and_utc();
        let days = partition_days(Some(since), today, 30);
        assert_eq!(days.len(), 4);
        assert_eq!(days[3], NaiveDate::from_ymd_opt(2026, 2, 27).unwrap());

        let future = today.and_hms_opt(0, 0, 0).unwrap().and_utc() + ChronoDuration::days(2);
        assert!(partition_days(Some(future), today, 30).is_empty());
    }

    #[test]
    fn parse_profile_reads_the_named_section() {
        let text = "\
[default]
aws_access_key_id = AKIADEFAULT
aws_secret_access_key = defaultsecret

# staging account
[staging]
aws_access_key_id=AKIASTAGING
aws_secret_access_key=stagingsecret
aws_session_token = tok

[partial]
aws_access_key_id = AKIAPARTIAL
";
        assert_eq!(
            parse_profile(text, "staging"),
            Some(ProfileCredentials {
                access_key_id: "AKIASTAGING".to_string(),
                secret_access_key: "stagingsecret".to_string(),
                session_token: Some("tok".to_string()),
            })
        );
        assert_eq!(
            parse_profile(text, "default").map(|c| c.access_key_id),
            Some("AKIADEFAULT".to_string())
        );
        assert!(parse_profile(text, "partial").is_none());
        assert!(parse_profile(text, "missing").is_none());
    }

    #[tokio::test]
    async fn trait_impl_reports_remote_kind() {
        let (_inner, store) = memory_store("");
        let run = make_run(Utc::now(), "prod", Status::Success);
        let dyn_store: &dyn RunStore = &store;

        dyn_store.save_run(&run).await.unwrap();
        assert_eq!(dyn_store.kind(), StoreKind::Remote);
        let listing = dyn_store.list_runs(&ListQuery::all()).await.unwrap();
        assert_eq!(listing.ids(), vec![run.id.as_str()]);
        assert!(matches!(dyn_store.sync().await, Err(StoreError::Unsupported(_))));
    }
}
