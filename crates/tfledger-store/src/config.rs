// ABOUTME: Configuration for the run stores, loaded from environment variables with defaults.
// ABOUTME: Tunables are plain fields handed to the store constructors.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_MIRROR_CONCURRENCY: usize = 10;
pub const DEFAULT_FETCH_CONCURRENCY: usize = 20;
pub const DEFAULT_PARTITION_CONCURRENCY: usize = 7;
pub const DEFAULT_LOOKBACK_DAYS: u32 = 30;
pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_POOL_SIZE: usize = 25;
pub const DEFAULT_EARLY_STOP_FACTOR: usize = 2;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} must be a positive integer, got {value:?}")]
    InvalidNumber { var: &'static str, value: String },

    #[error("cannot determine a storage directory: set TFLEDGER_STORAGE_PATH, XDG_DATA_HOME, or HOME")]
    MissingHome,
}

/// Settings for the object-storage mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    pub bucket: String,
    pub region: Option<String>,
    /// Key prefix placed before `runs/` and `outputs/`. Slashes are normalized.
    pub prefix: String,
    /// Named profile in the shared AWS credentials file.
    pub profile: Option<String>,
    /// Custom endpoint for S3-compatible services.
    pub endpoint: Option<String>,
    pub allow_http: bool,
    /// Object fetches in flight during one listing, across all partitions.
    pub fetch_concurrency: usize,
    /// Date partitions scanned concurrently during one listing.
    pub partition_concurrency: usize,
    /// How many days back a listing scans when the query has no `since`.
    pub lookback_days: u32,
    /// Deadline for a single object operation. Listings get multiples of it.
    pub op_timeout: Duration,
    pub pool_size: usize,
    /// A limited listing stops scanning new partitions once it holds
    /// `limit * early_stop_factor` matches. Zero disables early stop.
    pub early_stop_factor: usize,
}

impl RemoteConfig {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            region: None,
            prefix: String::new(),
            profile: None,
            endpoint: None,
            allow_http: false,
            fetch_concurrency: DEFAULT_FETCH_CONCURRENCY,
            partition_concurrency: DEFAULT_PARTITION_CONCURRENCY,
            lookback_days: DEFAULT_LOOKBACK_DAYS,
            op_timeout: DEFAULT_OP_TIMEOUT,
            pool_size: DEFAULT_POOL_SIZE,
            early_stop_factor: DEFAULT_EARLY_STOP_FACTOR,
        }
    }
}

/// Top-level store configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub local_path: PathBuf,
    /// None means local-only.
    pub remote: Option<RemoteConfig>,
    /// Background mirror writes in flight at once.
    pub mirror_concurrency: usize,
}

impl StoreConfig {
    /// Local-only configuration rooted at `local_path`.
    pub fn local(local_path: impl Into<PathBuf>) -> Self {
        Self {
            local_path: local_path.into(),
            remote: None,
            mirror_concurrency: DEFAULT_MIRROR_CONCURRENCY,
        }
    }

    /// Load configuration from environment variables with sensible defaults.
    ///
    /// Environment variables:
    /// - TFLEDGER_STORAGE_PATH: local root (default: $XDG_DATA_HOME/tfledger or ~/.local/share/tfledger)
    /// - TFLEDGER_S3_BUCKET: enables the object-storage mirror when set
    /// - TFLEDGER_S3_REGION, TFLEDGER_S3_PREFIX, TFLEDGER_S3_ENDPOINT, AWS_PROFILE
    /// - TFLEDGER_S3_ALLOW_HTTP: allow plain-HTTP endpoints (default: false)
    /// - TFLEDGER_MIRROR_CONCURRENCY (10), TFLEDGER_S3_CONCURRENCY (20),
    ///   TFLEDGER_S3_PARALLEL_DAYS (7), TFLEDGER_S3_LOOKBACK_DAYS (30),
    ///   TFLEDGER_S3_TIMEOUT_SECS (30), TFLEDGER_S3_POOL_SIZE (25),
    ///   TFLEDGER_S3_EARLY_STOP_FACTOR (2, may be 0)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let local_path = match var("TFLEDGER_STORAGE_PATH") {
            Some(path) => PathBuf::from(path),
            None => default_local_path(&var)?,
        };

        let mirror_concurrency = positive(
            "TFLEDGER_MIRROR_CONCURRENCY",
            var("TFLEDGER_MIRROR_CONCURRENCY"),
            DEFAULT_MIRROR_CONCURRENCY,
        )?;

        let remote = match var("TFLEDGER_S3_BUCKET") {
            None => None,
            Some(bucket) => {
                let mut remote = RemoteConfig::new(bucket);
                remote.region = var("TFLEDGER_S3_REGION");
                remote.prefix = var("TFLEDGER_S3_PREFIX").unwrap_or_default();
                remote.profile = var("AWS_PROFILE");
                remote.endpoint = var("TFLEDGER_S3_ENDPOINT");
                remote.allow_http = var("TFLEDGER_S3_ALLOW_HTTP")
                    .map(|v| v == "true" || v == "1" || v == "yes")
                    .unwrap_or(false);
                remote.fetch_concurrency = positive(
                    "TFLEDGER_S3_CONCURRENCY",
                    var("TFLEDGER_S3_CONCURRENCY"),
                    DEFAULT_FETCH_CONCURRENCY,
                )?;
                remote.partition_concurrency = positive(
                    "TFLEDGER_S3_PARALLEL_DAYS",
                    var("TFLEDGER_S3_PARALLEL_DAYS"),
                    DEFAULT_PARTITION_CONCURRENCY,
                )?;
                remote.lookback_days = positive(
                    "TFLEDGER_S3_LOOKBACK_DAYS",
                    var("TFLEDGER_S3_LOOKBACK_DAYS"),
                    DEFAULT_LOOKBACK_DAYS as usize,
                )? as u32;
                remote.op_timeout = Duration::from_secs(positive(
                    "TFLEDGER_S3_TIMEOUT_SECS",
                    var("TFLEDGER_S3_TIMEOUT_SECS"),
                    DEFAULT_OP_TIMEOUT.as_secs() as usize,
                )? as u64);
                remote.pool_size = positive(
                    "TFLEDGER_S3_POOL_SIZE",
                    var("TFLEDGER_S3_POOL_SIZE"),
                    DEFAULT_POOL_SIZE,
                )?;
                remote.early_stop_factor = match var("TFLEDGER_S3_EARLY_STOP_FACTOR") {
                    None => DEFAULT_EARLY_STOP_FACTOR,
                    Some(v) => v.parse().map_err(|_| ConfigError::InvalidNumber {
                        var: "TFLEDGER_S3_EARLY_STOP_FACTOR",
                        value: v,
                    })?,
                };
                Some(remote)
            }
        };

        Ok(Self {
            local_path,
            remote,
            mirror_concurrency,
        })
    }
}

fn default_local_path(var: &impl Fn(&str) -> Option<String>) -> Result<PathBuf, ConfigError> {
    if let Some(xdg) = var("XDG_DATA_HOME") {
        return Ok(PathBuf::from(xdg).join("tfledger"));
    }
    if cfg!(windows)
        && let Some(app_data) = var("LOCALAPPDATA")
    {
        return Ok(PathBuf::from(app_data).join("tfledger"));
    }
    var("HOME")
        .map(|home| PathBuf::from(home).join(".local").join("share").join("tfledger"))
        .ok_or(ConfigError::MissingHome)
}

fn positive(name: &'static str, value: Option<String>, default: usize) -> Result<usize, ConfigError> {
    match value {
        None => Ok(default),
        Some(v) => match v.parse::<usize>() {
            Ok(n) if n > 0 => Ok(n),
            _ => Err(ConfigError::InvalidNumber { var: name, value: v }),
        },
    }
}
