// ABOUTME: Persistence layer for tfledger, storing run records and their raw output.
// ABOUTME: Provides the local journal, the object-storage mirror, and the hybrid coordinator.

pub mod config;
pub mod error;
pub mod hybrid;
pub mod layout;
pub mod local;
pub mod mirror;
pub mod remote;
pub mod store;

pub use config::{ConfigError, RemoteConfig, StoreConfig};
pub use error::{Result, StoreError};
pub use hybrid::HybridStore;
pub use local::LocalStore;
pub use mirror::{Mirror, MirrorJob};
pub use remote::{FetchStats, RemoteStore};
pub use store::{RunListing, RunStore, StoreKind, SyncResult, open_store};
