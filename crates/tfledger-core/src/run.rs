// ABOUTME: Defines the Run record persisted for every recorded tool invocation.
// ABOUTME: Includes git/CI context, change summary, resource events, and the derived sync tag.

use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::run_id::{InvalidRunId, RunId};

/// Terminal (or in-flight) status of a recorded run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Running,
    Success,
    Failed,
    Canceled,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Running => "running",
            Status::Success => "success",
            Status::Failed => "failed",
            Status::Canceled => "canceled",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Status::Running),
            "success" => Ok(Status::Success),
            "failed" => Ok(Status::Failed),
            "canceled" | "cancelled" => Ok(Status::Canceled),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// Which backend(s) hold a run. Computed at read time, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Local,
    Remote,
    Synced,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncStatus::Local => "local",
            SyncStatus::Remote => "remote",
            SyncStatus::Synced => "synced",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitInfo {
    pub commit: String,
    pub branch: String,
    pub dirty: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CiInfo {
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Plan/apply change counts scraped from tool output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Changes {
    pub add: u32,
    pub change: u32,
    pub destroy: u32,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub output_only: bool,
}

impl Changes {
    /// True if at least one resource is added, changed, or destroyed.
    pub fn is_nonzero(&self) -> bool {
        self.add > 0 || self.change > 0 || self.destroy > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceAction {
    Create,
    Update,
    Destroy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    InProgress,
    Success,
    Failed,
}

/// One infrastructure object touched during a run, with its timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceEvent {
    pub address: String,
    pub action: ResourceAction,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: u64,
    pub status: ResourceStatus,
}

/// Persisted metadata for one tool invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub workspace: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub duration_ms: u64,
    pub status: Status,
    #[serde(default)]
    pub exit_code: i32,
    pub program: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ci: Option<CiInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changes: Option<Changes>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_file: Option<String>,
}

impl Run {
    /// Create a `running` record for a command that is about to be launched.
    /// The identifier and timestamp are taken from the same instant.
    pub fn start(workspace: impl Into<String>, command: Vec<String>) -> Self {
        let id = RunId::generate();
        let timestamp = id.timestamp().unwrap_or_else(Utc::now);
        let program = command
            .first()
            .map(|c| program_name(c))
            .unwrap_or_default();

        Self {
            id: id.to_string(),
            workspace: workspace.into(),
            timestamp,
            duration_ms: 0,
            status: Status::Running,
            exit_code: 0,
            program,
            command,
            user: String::new(),
            user_email: None,
            git: None,
            ci: None,
            changes: None,
            resources: Vec::new(),
            output_file: None,
        }
    }

    /// Record the outcome of the wrapped invocation. Exit code zero is success.
    pub fn complete(&mut self, exit_code: i32, finished_at: DateTime<Utc>) {
        self.exit_code = exit_code;
        self.status = if exit_code == 0 {
            Status::Success
        } else {
            Status::Failed
        };
        self.duration_ms = (finished_at - self.timestamp).num_milliseconds().max(0) as u64;
    }

    /// Parse this record's identifier.
    pub fn run_id(&self) -> Result<RunId, InvalidRunId> {
        RunId::parse(&self.id)
    }

    pub fn duration(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.duration_ms)
    }

    /// True if the run has a change summary with at least one non-zero count.
    pub fn has_changes(&self) -> bool {
        self.changes.is_some_and(|c| c.is_nonzero())
    }

    /// Short human summary such as `+2 ~1 -0`.
    pub fn change_summary(&self) -> String {
        match self.changes {
            None => "no changes".to_string(),
            Some(c) if c.output_only => "outputs only".to_string(),
            Some(c) if !c.is_nonzero() => "no changes".to_string(),
            Some(c) => format!("+{} ~{} -{}", c.add, c.change, c.destroy),
        }
    }
}

/// A run paired with the backend provenance computed while listing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListedRun {
    #[serde(flatten)]
    pub run: Run,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_status: Option<SyncStatus>,
}

impl ListedRun {
    pub fn new(run: Run, sync_status: Option<SyncStatus>) -> Self {
        Self { run, sync_status }
    }
}

fn program_name(command: &str) -> String {
    Path::new(command)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| command.to_string())
}
