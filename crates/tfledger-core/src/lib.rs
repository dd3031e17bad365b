// ABOUTME: Core library for tfledger, containing the run record model and query types.
// ABOUTME: Shared by the storage backends and the CLI; has no I/O of its own.

pub mod query;
pub mod run;
pub mod run_id;
pub mod since;

pub use query::{ListQuery, sort_newest_first};
pub use run::{
    Changes, CiInfo, GitInfo, ListedRun, ResourceAction, ResourceEvent, ResourceStatus, Run,
    Status, SyncStatus,
};
pub use run_id::{InvalidRunId, RunId};
pub use since::{DurationParseError, parse_window};
