// ABOUTME: Record codec and date-partitioned key layout shared by the local and remote stores.
// ABOUTME: Maps a run id to runs/YYYY/MM/DD/<id>.json and outputs/YYYY/MM/DD/<id>.txt.

use chrono::NaiveDate;
use tfledger_core::{Run, RunId};

use crate::error::Result;

pub const RUNS_DIR: &str = "runs";
pub const OUTPUTS_DIR: &str = "outputs";

/// The two artifacts stored per run. They share an id and partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Artifact {
    Record,
    Output,
}

impl Artifact {
    pub fn dir(self) -> &'static str {
        match self {
            Artifact::Record => RUNS_DIR,
            Artifact::Output => OUTPUTS_DIR,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Artifact::Record => "json",
            Artifact::Output => "txt",
        }
    }

    fn file_name(self, id: &RunId) -> String {
        format!("{}.{}", id, self.extension())
    }
}

/// Relative key for an artifact: partitioned by the id's date when it has
/// one, otherwise directly under the artifact's root directory.
pub fn key(artifact: Artifact, id: &RunId) -> String {
    match id.partition() {
        Some(partition) => format!("{}/{}/{}", artifact.dir(), partition, artifact.file_name(id)),
        None => legacy_key(artifact, id),
    }
}

/// Relative key in the unpartitioned layout used before ids carried dates.
pub fn legacy_key(artifact: Artifact, id: &RunId) -> String {
    format!("{}/{}", artifact.dir(), artifact.file_name(id))
}

/// Relative prefix holding every record for one UTC day, with trailing slash.
pub fn day_prefix(day: NaiveDate) -> String {
    format!("{}/{}/", RUNS_DIR, day.format("%Y/%m/%d"))
}

/// Extract a run id from a record file name or key (`.../<id>.json`).
/// Does not validate the id.
pub fn record_id_from_key(key: &str) -> Option<&str> {
    let name = key.rsplit('/').next().unwrap_or(key);
    name.strip_suffix(".json").filter(|id| !id.is_empty())
}

/// Serialize a run as pretty-printed JSON, the on-disk and in-bucket format.
pub fn encode_run(run: &Run) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec_pretty(run)?)
}

pub fn decode_run(bytes: &[u8]) -> Result<Run> {
    Ok(serde_json::from_slice(bytes)?)
}
