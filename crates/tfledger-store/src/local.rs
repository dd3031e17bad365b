// ABOUTME: Filesystem-backed run store: the durable baseline every other store builds on.
// ABOUTME: Writes date-partitioned JSON records and text outputs atomically; lists by full scan.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tfledger_core::{ListQuery, Run, RunId};

use crate::error::{Result, StoreError};
use crate::layout::{self, Artifact, OUTPUTS_DIR, RUNS_DIR};
use crate::store::{RunListing, RunStore, StoreKind};

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A run store rooted at a local directory:
///
/// ```text
/// <root>/runs/YYYY/MM/DD/<id>.json
/// <root>/outputs/YYYY/MM/DD/<id>.txt
/// ```
///
/// All inherent methods are synchronous; the `RunStore` impl wraps them.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Open a store at `root`, creating the runs and outputs directories.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(RUNS_DIR))?;
        fs::create_dir_all(root.join(OUTPUTS_DIR))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write a record to its partitioned path, replacing any previous version.
    pub fn save_run(&self, run: &Run) -> Result<()> {
        let id = RunId::parse(&run.id)?;
        let bytes = layout::encode_run(run)?;
        let path = self.path_for(Artifact::Record, &id);
        write_atomic(&path, &bytes)?;
        tracing::debug!("saved run {} to {}", id, path.display());
        Ok(())
    }

    pub fn get_run(&self, id: &str) -> Result<Run> {
        let id = RunId::parse(id)?;
        match self.read_artifact(Artifact::Record, &id)? {
            Some(bytes) => layout::decode_run(&bytes),
            None => Err(StoreError::RunNotFound(id.to_string())),
        }
    }

    /// Scan every partition, keep runs matching `query`, newest first.
    /// Files that cannot be read or parsed are skipped with a warning.
    pub fn list_runs(&self, query: &ListQuery) -> Result<Vec<Run>> {
        let mut runs = Vec::new();
        for path in self.record_files()? {
            let bytes = match fs::read(&path) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!("skipping unreadable run file {}: {}", path.display(), e);
                    continue;
                }
            };
            match layout::decode_run(&bytes) {
                Ok(run) if query.matches(&run) => runs.push(run),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("skipping corrupt run file {}: {}", path.display(), e);
                }
            }
        }

        query.finish(&mut runs);
        Ok(runs)
    }

    /// Every record id present on disk, without reading record bodies.
    /// Files whose names are not valid run ids are ignored.
    pub fn list_run_ids(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self
            .record_files()?
            .iter()
            .filter_map(|path| path.file_name()?.to_str().and_then(layout::record_id_from_key))
            .filter(|id| RunId::parse(id).is_ok())
            .map(str::to_string)
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    pub fn save_output(&self, id: &str, output: &[u8]) -> Result<()> {
        let id = RunId::parse(id)?;
        write_atomic(&self.path_for(Artifact::Output, &id), output)?;
        Ok(())
    }

    pub fn get_output(&self, id: &str) -> Result<Vec<u8>> {
        let id = RunId::parse(id)?;
        self.read_artifact(Artifact::Output, &id)?
            .ok_or_else(|| StoreError::OutputNotFound(id.to_string()))
    }

    /// Where the output for `id` lives (or would live) on disk.
    pub fn output_path(&self, id: &str) -> PathBuf {
        match RunId::parse(id) {
            Ok(id) => self.path_for(Artifact::Output, &id),
            Err(_) => self.root.join(OUTPUTS_DIR).join(format!("{id}.txt")),
        }
    }

    /// Remove the record and its output from every location they may occupy.
    pub fn delete_run(&self, id: &str) -> Result<()> {
        let id = RunId::parse(id)?;
        for artifact in [Artifact::Record, Artifact::Output] {
            for path in self.candidate_paths(artifact, &id) {
                match fs::remove_file(&path) {
                    Ok(()) => tracing::debug!("removed {}", path.display()),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }

    /// Existence check on the record file. Does not read the body.
    pub fn has_run(&self, id: &str) -> Result<bool> {
        let id = RunId::parse(id)?;
        Ok(self
            .candidate_paths(Artifact::Record, &id)
            .iter()
            .any(|p| p.is_file()))
    }

    fn path_for(&self, artifact: Artifact, id: &RunId) -> PathBuf {
        self.root.join(layout::key(artifact, id))
    }

    /// Partitioned path first, then the legacy root path for dated ids
    /// written before partitioning existed.
    fn candidate_paths(&self, artifact: Artifact, id: &RunId) -> Vec<PathBuf> {
        let mut paths = vec![self.path_for(artifact, id)];
        if !id.is_legacy() {
            paths.push(self.root.join(layout::legacy_key(artifact, id)));
        }
        paths
    }

    fn read_artifact(&self, artifact: Artifact, id: &RunId) -> Result<Option<Vec<u8>>> {
        for path in self.candidate_paths(artifact, id) {
            match fs::read(&path) {
                Ok(bytes) => return Ok(Some(bytes)),
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    fn record_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        collect_records(&self.root.join(RUNS_DIR), &mut files)?;
        Ok(files)
    }
}

/// Recursively collect `*.json` files. A missing root yields nothing;
/// unreadable subdirectories are skipped with a warning.
fn collect_records(dir: &Path, out: &mut Vec<PathBuf>) -> io::Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            if let Err(e) = collect_records(&path, out) {
                tracing::warn!("skipping unreadable partition {}: {}", path.display(), e);
            }
        } else if path.extension().is_some_and(|ext| ext == "json") {
            out.push(path);
        }
    }
    Ok(())
}

/// Write to a unique temp sibling, fsync, then rename over the target.
/// Creates parent directories as needed; existing directories are fine.
fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = path.with_file_name(format!(
        ".{}.{}.{}.tmp",
        file_name,
        std::process::id(),
        TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));

    let mut file = File::create(&tmp_path)?;
    if let Err(e) = file.write_all(bytes).and_then(|()| file.sync_all()) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e);
    }
    drop(file);

    fs::rename(&tmp_path, path)
}

#[async_trait]
impl RunStore for LocalStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Local
    }

    async fn save_run(&self, run: &Run) -> Result<()> {
        LocalStore::save_run(self, run)
    }

    async fn get_run(&self, id: &str) -> Result<Run> {
        LocalStore::get_run(self, id)
    }

    async fn list_runs(&self, query: &ListQuery) -> Result<RunListing> {
        let store = self.clone();
        let query = query.clone();
        let runs = tokio::task::spawn_blocking(move || store.list_runs(&query)).await??;
        Ok(RunListing::tagged(runs, None))
    }

    async fn save_output(&self, id: &str, output: &[u8]) -> Result<()> {
        LocalStore::save_output(self, id, output)
    }

    async fn get_output(&self, id: &str) -> Result<Vec<u8>> {
        LocalStore::get_output(self, id)
    }

    fn output_path(&self, id: &str) -> String {
        LocalStore::output_path(self, id).display().to_string()
    }

    async fn delete_run(&self, id: &str) -> Result<()> {
        LocalStore::delete_run(self, id)
    }

    async fn has_run(&self, id: &str) -> Result<bool> {
        LocalStore::has_run(self, id)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
