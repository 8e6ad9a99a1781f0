//! Configuration loading and constants.
//!
//! Loads configuration from TOML files and defines constants for the
//! batch orchestrator, group-store lifecycle, NNTP limits, caches, and
//! default paths. `AppConfig` is the root configuration struct; CLI
//! flags (`FetchArgs`) override file values where both are given.

use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

// =============================================================================
// Batch Orchestrator Constants
// =============================================================================

/// Default number of articles that triggers an immediate per-group flush.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;

/// Upper bound accepted for `--max-batch`.
pub const MAX_BATCH_CEILING: usize = 4000;

/// Timer-based flush interval for groups below the size threshold.
pub const BATCH_INTERVAL: Duration = Duration::from_secs(3);

/// Concurrent per-group commits (semaphore permits).
pub const MAX_BATCH_THREADS: usize = 16;

/// Soft cap on articles in flight between the divider and group buffers.
pub const MAX_QUEUED: usize = 16384;

/// The divider resumes admitting work once inflight drops below this
/// fraction of `MAX_QUEUED`.
pub const QUEUE_DRAIN_FRACTION: f64 = 0.2;

/// Per-group channel capacity multiplier: capacity = MaxBatchSize x this.
pub const LOOPS_PER_GROUP: usize = 10;

/// Orchestrator poll backoff floor.
pub const ORCH_POLL_FLOOR: Duration = Duration::from_millis(16);

/// Orchestrator poll backoff ceiling.
pub const ORCH_POLL_CEILING: Duration = Duration::from_secs(1);

/// Consecutive idle samples required before the orchestrator exits.
pub const INITIAL_SHUTDOWN_COUNTER: u32 = 10;

/// Backoff before retrying a failed article-insert phase.
pub const BATCH_RETRY_DELAY: Duration = Duration::from_secs(1);

// =============================================================================
// Group Store Lifecycle Constants
// =============================================================================

/// Hard cap on concurrently open group databases.
pub const MAX_OPEN_DATABASES: usize = 256;

/// Share of `MAX_OPEN_DATABASES` force-closed when the cap is reached.
pub const FORCED_CLOSE_FRACTION: f64 = 0.2;

/// Default idle age after which an unused group handle is closed.
pub const DB_IDLE_TIMEOUT: Duration = Duration::from_secs(3600);

/// Aggressive idle timeout used by the fetcher, which touches many groups.
pub const FETCHER_DB_IDLE_TIMEOUT: Duration = Duration::from_secs(15);

/// Interval of the idle-group cleanup cron.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(10);

/// Nap while waiting for a concurrent opener to finish initializing.
pub const OPEN_WAIT_NAP: Duration = Duration::from_millis(10);

// =============================================================================
// Retry Wrapper Constants
// =============================================================================

/// Maximum attempts for a lock-contended statement.
pub const RETRY_MAX_ATTEMPTS: u32 = 1000;

/// Linear backoff cap per attempt; jitter of up to 50% is added on top.
pub const RETRY_BACKOFF_CAP: Duration = Duration::from_millis(25);

// =============================================================================
// NNTP Constants
// =============================================================================

/// Cap on overview rows accepted from a single XOVER response.
pub const MAX_READ_LINES_XOVER: usize = 10_000;

/// Default per-operation read/write deadline on NNTP sockets.
pub const NNTP_DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Interval of the pool's idle-connection cleanup worker.
pub const POOL_CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// Idle age after which a pooled connection is dropped.
pub const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Host substrings whose providers get their connection count clamped.
pub const LIMITED_HOST_PATTERNS: &[&str] = &["astraweb", "blocknews"];

/// Connection cap applied to matching hosts.
pub const LIMITED_HOST_MAX_CONNS: usize = 3;

// =============================================================================
// Thread Memory Cache Constants
// =============================================================================

/// In-memory window holds this many pages worth of thread roots.
pub const THREAD_WINDOW_PAGES: usize = 6;

/// Window starts this many pages before the requested page.
pub const THREAD_WINDOW_LOOKBEHIND: usize = 3;

/// Group-level cache entry lifetime.
pub const THREAD_CACHE_TTL: Duration = Duration::from_secs(300);

/// Interval of the expired-group sweeper.
pub const THREAD_CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(15);

// =============================================================================
// Hash Registry Constants
// =============================================================================

/// Lifetime of a group/hash mapping before the sweeper may evict it.
pub const HASH_ENTRY_TTL: Duration = Duration::from_secs(3600);

/// Interval of the hash-registry sweeper.
pub const HASH_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

// =============================================================================
// Main Store Constants
// =============================================================================

/// Heartbeat interval for `system_status.last_heartbeat`.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Interval of the hierarchy aggregation recompute.
pub const HIERARCHY_REFRESH_INTERVAL: Duration = Duration::from_secs(300);

/// File name of the main store under `<dataDir>/cfg/`.
pub const MAIN_DB_FILE: &str = "pugleaf.sq3";

/// File name of the progress store under `<dataDir>`.
pub const PROGRESS_DB_FILE: &str = "progress.db";

/// File name of the history store under `<dataDir>`.
pub const HISTORY_DB_FILE: &str = "history.db";

// =============================================================================
// History Constants
// =============================================================================

/// Valid range for the short-hash length, fixed on first use.
pub const SHORT_HASH_LEN_MIN: usize = 2;
pub const SHORT_HASH_LEN_MAX: usize = 7;

/// Default short-hash length when none was ever configured.
pub const DEFAULT_SHORT_HASH_LEN: usize = 3;

// =============================================================================
// Default Paths and Strings
// =============================================================================

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Default data directory when neither flag nor file provides one.
pub const DEFAULT_DATA_DIR: &str = "data";

/// Default log filter when RUST_LOG is not set.
pub const DEFAULT_LOG_FILTER: &str = "pugleaf=debug";

/// Default log format (text or json).
pub const DEFAULT_LOG_FORMAT: &str = "text";

/// Fallback shard file stem for group names that sanitize to nothing.
pub const JUNK_GROUP_NAME: &str = "junk";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub nntp: NntpSettings,
    /// NNTP providers, tried in priority order.
    #[serde(default, rename = "provider")]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    /// Root of the persisted layout (`cfg/`, `db/`, progress, history).
    #[serde(default = "PathsConfig::default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: Self::default_data_dir(),
        }
    }
}

impl PathsConfig {
    fn default_data_dir() -> PathBuf {
        PathBuf::from(DEFAULT_DATA_DIR)
    }

    pub fn main_db_path(&self) -> PathBuf {
        self.data_dir.join("cfg").join(MAIN_DB_FILE)
    }

    pub fn progress_db_path(&self) -> PathBuf {
        self.data_dir.join(PROGRESS_DB_FILE)
    }

    pub fn history_db_path(&self) -> PathBuf {
        self.data_dir.join(HISTORY_DB_FILE)
    }

    pub fn shard_root(&self) -> PathBuf {
        self.data_dir.join("db")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
    /// Articles per group buffer that trigger an immediate flush.
    #[serde(default = "BatchConfig::default_max_batch_size")]
    pub max_batch_size: usize,
    /// Seconds between timer-based flushes of undersized buffers.
    #[serde(default = "BatchConfig::default_interval_secs")]
    pub interval_secs: u64,
    /// Concurrent per-group commits.
    #[serde(default = "BatchConfig::default_max_threads")]
    pub max_threads: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: Self::default_max_batch_size(),
            interval_secs: Self::default_interval_secs(),
            max_threads: Self::default_max_threads(),
        }
    }
}

impl BatchConfig {
    fn default_max_batch_size() -> usize {
        DEFAULT_MAX_BATCH_SIZE
    }
    fn default_interval_secs() -> u64 {
        BATCH_INTERVAL.as_secs()
    }
    fn default_max_threads() -> usize {
        MAX_BATCH_THREADS
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Global NNTP settings applied to all providers unless overridden.
#[derive(Debug, Clone, Deserialize)]
pub struct NntpSettings {
    /// Connection and per-operation timeout in seconds.
    #[serde(default = "NntpSettings::default_timeout")]
    pub timeout_seconds: u64,
}

impl Default for NntpSettings {
    fn default() -> Self {
        Self {
            timeout_seconds: Self::default_timeout(),
        }
    }
}

impl NntpSettings {
    fn default_timeout() -> u64 {
        NNTP_DEFAULT_TIMEOUT_SECS
    }
}

/// Configuration for a single NNTP provider.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// Provider name (used for logging and the progress store key).
    pub name: String,
    pub host: String,
    pub port: u16,
    /// Whether to require a TLS connection.
    #[serde(default)]
    pub ssl: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Maximum concurrent connections to this provider.
    #[serde(default = "ProviderConfig::default_max_conns")]
    pub max_conns: usize,
    #[serde(default = "ProviderConfig::default_enabled")]
    pub enabled: bool,
    /// Lower value wins when several providers carry a group.
    #[serde(default)]
    pub priority: i32,
    /// Reject articles larger than this many bytes (0 = unlimited).
    #[serde(default)]
    pub max_art_size: u64,
    /// Per-provider timeout override.
    pub timeout_seconds: Option<u64>,
}

impl ProviderConfig {
    fn default_max_conns() -> usize {
        4
    }
    fn default_enabled() -> bool {
        true
    }

    pub fn timeout(&self, global: &NntpSettings) -> Duration {
        Duration::from_secs(self.timeout_seconds.unwrap_or(global.timeout_seconds))
    }

    pub fn has_credentials(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }

    /// Effective connection cap; hosts matching the known-limited
    /// patterns are clamped regardless of the configured value.
    pub fn clamped_max_conns(&self) -> usize {
        let host = self.host.to_lowercase();
        if LIMITED_HOST_PATTERNS.iter().any(|p| host.contains(p)) {
            self.max_conns.min(LIMITED_HOST_MAX_CONNS)
        } else {
            self.max_conns
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "text" (human-readable, default) or "json" (structured).
    #[serde(default = "LoggingConfig::default_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: DEFAULT_LOG_FORMAT.to_string(),
        }
    }
}

impl LoggingConfig {
    fn default_format() -> String {
        DEFAULT_LOG_FORMAT.to_string()
    }
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig =
            toml::from_str(&contents).map_err(|e| crate::Error::Config(e.to_string()))?;
        Ok(config)
    }

    /// Load the file if it exists, otherwise start from defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}

/// Command-line flags of the fetcher binary.
#[derive(Debug, Parser)]
#[command(
    name = "pugleaf-fetch",
    about = "Fetch NNTP articles into the local sharded article store"
)]
pub struct FetchArgs {
    /// Configuration file path.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// NNTP provider host (overrides the configured providers).
    #[arg(long)]
    pub host: Option<String>,

    /// NNTP provider port.
    #[arg(long, default_value_t = 119)]
    pub port: u16,

    #[arg(long)]
    pub username: Option<String>,

    #[arg(long)]
    pub password: Option<String>,

    /// Require a TLS connection to the provider.
    #[arg(long)]
    pub ssl: bool,

    /// Connection and per-operation timeout in seconds.
    #[arg(long, default_value_t = NNTP_DEFAULT_TIMEOUT_SECS)]
    pub timeout: u64,

    /// Group name, prefix wildcard with a trailing '*', or '$all'.
    #[arg(long)]
    pub group: Option<String>,

    /// Fetch a single article by Message-ID and exit.
    #[arg(long)]
    pub message_id: Option<String>,

    /// Articles fetched per planning round (1..=4000).
    #[arg(long, default_value_t = DEFAULT_MAX_BATCH_SIZE)]
    pub max_batch: usize,

    /// Planning rounds per group before moving on (1..=2500).
    #[arg(long, default_value_t = 1)]
    pub max_loops: usize,

    /// Skip groups with fewer remote articles than this when no local
    /// progress exists yet.
    #[arg(long, default_value_t = 0)]
    pub ignore_initial_tiny_groups: u64,

    /// Mirror remote overview rows via XOVER before fetching bodies.
    #[arg(long)]
    pub xover_copy: bool,

    /// Local hostname recorded in Path headers. Required.
    #[arg(long)]
    pub nntphostname: String,

    /// Connect, read the greeting, and exit.
    #[arg(long)]
    pub test_conn: bool,

    /// History short-hash length (2..=7); fixed on first use.
    #[arg(long)]
    pub useshorthashlen: Option<usize>,

    /// Only fetch groups marked active in the main store.
    #[arg(long)]
    pub fetch_active_only: bool,

    /// Force date-based planning from this day (YYYY-MM-DD).
    #[arg(long)]
    pub download_start_date: Option<String>,
}

impl FetchArgs {
    /// Validate flag ranges; violations are fatal to the invocation.
    pub fn validate(&self) -> crate::Result<()> {
        if self.max_batch < 1 || self.max_batch > MAX_BATCH_CEILING {
            return Err(crate::Error::Validation(format!(
                "--max-batch must be in 1..={MAX_BATCH_CEILING}, got {}",
                self.max_batch
            )));
        }
        if self.max_loops < 1 || self.max_loops > 2500 {
            return Err(crate::Error::Validation(format!(
                "--max-loops must be in 1..=2500, got {}",
                self.max_loops
            )));
        }
        if let Some(len) = self.useshorthashlen {
            if !(SHORT_HASH_LEN_MIN..=SHORT_HASH_LEN_MAX).contains(&len) {
                return Err(crate::Error::Validation(format!(
                    "--useshorthashlen must be in {SHORT_HASH_LEN_MIN}..={SHORT_HASH_LEN_MAX}, got {len}"
                )));
            }
        }
        if self.nntphostname.trim().is_empty() {
            return Err(crate::Error::Validation(
                "--nntphostname must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Build the provider list: an explicit `--host` replaces the
    /// configured providers entirely.
    pub fn providers(&self, config: &AppConfig) -> Vec<ProviderConfig> {
        if let Some(host) = &self.host {
            vec![ProviderConfig {
                name: host.clone(),
                host: host.clone(),
                port: self.port,
                ssl: self.ssl,
                username: self.username.clone(),
                password: self.password.clone(),
                max_conns: ProviderConfig::default_max_conns(),
                enabled: true,
                priority: 0,
                max_art_size: 0,
                timeout_seconds: Some(self.timeout),
            }]
        } else {
            config.providers.iter().filter(|p| p.enabled).cloned().collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> FetchArgs {
        FetchArgs::parse_from(["pugleaf-fetch", "--nntphostname", "news.local"])
    }

    #[test]
    fn test_max_batch_bounds_accepted() {
        let mut args = base_args();
        args.max_batch = 1;
        assert!(args.validate().is_ok());
        args.max_batch = MAX_BATCH_CEILING;
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_max_batch_out_of_range_rejected() {
        let mut args = base_args();
        args.max_batch = 0;
        assert!(args.validate().is_err());
        args.max_batch = MAX_BATCH_CEILING + 1;
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_short_hash_len_range() {
        let mut args = base_args();
        for len in SHORT_HASH_LEN_MIN..=SHORT_HASH_LEN_MAX {
            args.useshorthashlen = Some(len);
            assert!(args.validate().is_ok());
        }
        args.useshorthashlen = Some(1);
        assert!(args.validate().is_err());
        args.useshorthashlen = Some(8);
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_limited_host_clamp() {
        let provider = ProviderConfig {
            name: "limited".into(),
            host: "eu.astraweb.example".into(),
            port: 563,
            ssl: true,
            username: None,
            password: None,
            max_conns: 20,
            enabled: true,
            priority: 0,
            max_art_size: 0,
            timeout_seconds: None,
        };
        assert_eq!(provider.clamped_max_conns(), LIMITED_HOST_MAX_CONNS);
    }

    #[test]
    fn test_explicit_host_replaces_providers() {
        let mut args = base_args();
        args.host = Some("news.example.org".into());
        let mut config = AppConfig::default();
        config.providers.push(ProviderConfig {
            name: "configured".into(),
            host: "other.example".into(),
            port: 119,
            ssl: false,
            username: None,
            password: None,
            max_conns: 4,
            enabled: true,
            priority: 0,
            max_art_size: 0,
            timeout_seconds: None,
        });
        let providers = args.providers(&config);
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].host, "news.example.org");
    }
}
