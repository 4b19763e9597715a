//! Configuration management.
//!
//! Every recognized option has a default; a TOML file and `REPOSTSCAN_*`
//! environment variables override them, and [`RepostConfig::validate`] runs
//! before anything is constructed from the result.
//!
//! # Environment Variables
//!
//! | Variable | Type | Default |
//! |----------|------|---------|
//! | `REPOSTSCAN_DATA_DIR` | path | platform data dir |
//! | `REPOSTSCAN_HASH_SIZE` | u32 | `16` |
//! | `REPOSTSCAN_HAMMING_CUTOFF` | u32 | `10` |
//! | `REPOSTSCAN_ANNOY_DISTANCE_CEILING` | f32 | `4.0` |
//! | `REPOSTSCAN_INDEX_TREE_COUNT` | usize | `20` |
//! | `REPOSTSCAN_INDEX_KEEP_ALIVE_SECONDS` | u64 | `3600` |
//! | `REPOSTSCAN_REBUILD_LOCK_TTL_SECONDS` | u64 | `1800` |
//! | `REPOSTSCAN_REBUILD_PAGE_SIZE` | usize | `250000` |
//! | `REPOSTSCAN_QUERY_NEIGHBORS` | usize | `50` |
//! | `REPOSTSCAN_SEARCH_BUDGET` | usize | `0` |
//! | `REPOSTSCAN_INDEX_PATH` | path | `<data_dir>/image_index.rpx` |
//! | `REPOSTSCAN_DATABASE_PATH` | path | `<data_dir>/repostscan.db` |
//! | `REPOSTSCAN_REDIS_URL` | string | unset |
//! | `REPOSTSCAN_LOCK_RETRY_ATTEMPTS` | u32 | `5` |
//! | `REPOSTSCAN_LOCK_RETRY_BACKOFF_MS` | u64 | `2000` |
//! | `REPOSTSCAN_REBUILD_JITTER_MS` | u64 | `3000` |
//! | `REPOSTSCAN_INDEX_REFRESH_COOLDOWN_SECONDS` | u64 | `60` |
//! | `REPOSTSCAN_MACHINE_ID` | string | hostname |

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "REPOSTSCAN_";

/// Upper bound for the lock retry backoff.
pub const MAX_LOCK_BACKOFF: Duration = Duration::from_secs(30);

/// How filtered matches are ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchOrdering {
    /// Oldest first; the first match is the original.
    #[default]
    Oldest,
    /// Highest match percent first, then oldest.
    MatchPercent,
}

/// Match policy toggles (the `[filter]` section).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterSettings {
    /// Drop candidates by the same author as the checked post.
    pub exclude_same_author: bool,
    /// Keep candidates that are themselves crossposts.
    pub include_crossposts: bool,
    /// Drop candidates newer than the checked post.
    pub only_older: bool,
    /// Subreddits whose posts never count as matches.
    pub banned_subreddits: Vec<String>,
    /// Keep only candidates from the checked post's subreddit.
    pub same_subreddit_only: bool,
    /// Drop candidates older than this many days before the checked post.
    pub max_age_days: Option<u32>,
    /// Result ordering.
    pub ordering: MatchOrdering,
    /// Apply meme-template suppression.
    pub meme_filter: bool,
    /// Hamming cutoff used when the checked image is a known meme template.
    pub meme_hamming_cutoff: u32,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            exclude_same_author: true,
            include_crossposts: false,
            only_older: true,
            banned_subreddits: Vec::new(),
            same_subreddit_only: false,
            max_age_days: None,
            ordering: MatchOrdering::Oldest,
            meme_filter: true,
            meme_hamming_cutoff: 4,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable output.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

/// Logging and metrics settings (the `[observability]` section).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilitySettings {
    /// Log format.
    pub log_format: LogFormat,
    /// Default log level when `RUST_LOG` is unset.
    pub log_level: Option<String>,
    /// Append logs to this file instead of stderr.
    pub log_file: Option<PathBuf>,
    /// Install the Prometheus exporter.
    pub metrics_enabled: bool,
    /// Port for the Prometheus exporter.
    pub metrics_port: u16,
}

impl Default for ObservabilitySettings {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Pretty,
            log_level: None,
            log_file: None,
            metrics_enabled: false,
            metrics_port: 9464,
        }
    }
}

/// Main configuration for repostscan.
#[derive(Debug, Clone)]
pub struct RepostConfig {
    /// Directory for the index file and the default database.
    pub data_dir: PathBuf,
    /// Perceptual hash grid size `N` (hashes have `N * N` bits).
    pub hash_size: u32,
    /// Maximum Hamming distance for a match (inclusive).
    pub hamming_cutoff: u32,
    /// Maximum approximate distance before a candidate is looked up.
    pub annoy_distance_ceiling: f32,
    /// Trees per index build.
    pub index_tree_count: usize,
    /// Age after which the index file is stale.
    pub index_keep_alive: Duration,
    /// Rebuild lock TTL.
    pub rebuild_lock_ttl: Duration,
    /// Rows per hash store page during a rebuild.
    pub rebuild_page_size: usize,
    /// Neighbours requested per query.
    pub query_neighbors: usize,
    /// Candidate items examined per query (0 = trees x neighbours).
    pub search_budget: usize,
    /// Explicit index file path.
    pub index_path: Option<PathBuf>,
    /// Explicit `SQLite` database path.
    pub database_path: Option<PathBuf>,
    /// Redis URL for the rebuild lock.
    pub redis_url: Option<String>,
    /// Lock attempts before giving up.
    pub lock_retry_attempts: u32,
    /// Initial backoff between lock attempts.
    pub lock_retry_backoff: Duration,
    /// Upper bound of the random delay before a lock attempt.
    pub rebuild_jitter: Duration,
    /// Wait between refresh attempts while a stale index keeps serving.
    pub index_refresh_cooldown: Duration,
    /// Identity used as the lock holder and in build records.
    pub machine_id: String,
    /// Match policy.
    pub filter: FilterSettings,
    /// Logging and metrics.
    pub observability: ObservabilitySettings,
}

/// Configuration file structure (for TOML parsing).
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    /// Data directory.
    pub data_dir: Option<String>,
    /// Hash grid size.
    pub hash_size: Option<u32>,
    /// Hamming cutoff.
    pub hamming_cutoff: Option<u32>,
    /// Approximate distance ceiling.
    pub annoy_distance_ceiling: Option<f32>,
    /// Trees per build.
    pub index_tree_count: Option<usize>,
    /// Keep-alive in seconds.
    pub index_keep_alive_seconds: Option<u64>,
    /// Lock TTL in seconds.
    pub rebuild_lock_ttl_seconds: Option<u64>,
    /// Rebuild page size.
    pub rebuild_page_size: Option<usize>,
    /// Neighbours per query.
    pub query_neighbors: Option<usize>,
    /// Search budget.
    pub search_budget: Option<usize>,
    /// Index file path.
    pub index_path: Option<String>,
    /// Database path.
    pub database_path: Option<String>,
    /// Redis URL.
    pub redis_url: Option<String>,
    /// Lock attempts.
    pub lock_retry_attempts: Option<u32>,
    /// Lock backoff in milliseconds.
    pub lock_retry_backoff_ms: Option<u64>,
    /// Jitter in milliseconds.
    pub rebuild_jitter_ms: Option<u64>,
    /// Refresh cooldown in seconds.
    pub index_refresh_cooldown_seconds: Option<u64>,
    /// Machine identity.
    pub machine_id: Option<String>,
    /// Filter section.
    pub filter: Option<FilterSettings>,
    /// Observability section.
    pub observability: Option<ObservabilitySettings>,
}

impl Default for RepostConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            hash_size: crate::hashing::DEFAULT_HASH_SIZE,
            hamming_cutoff: 10,
            annoy_distance_ceiling: 4.0,
            index_tree_count: 20,
            index_keep_alive: Duration::from_secs(3600),
            rebuild_lock_ttl: Duration::from_secs(1800),
            rebuild_page_size: 250_000,
            query_neighbors: 50,
            search_budget: 0,
            index_path: None,
            database_path: None,
            redis_url: None,
            lock_retry_attempts: 5,
            lock_retry_backoff: Duration::from_millis(2000),
            rebuild_jitter: Duration::from_millis(3000),
            index_refresh_cooldown: Duration::from_secs(60),
            machine_id: default_machine_id(),
            filter: FilterSettings::default(),
            observability: ObservabilitySettings::default(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from(".repostscan"),
        |dirs| dirs.data_dir().join("repostscan"),
    )
}

/// Hostname from `HOSTNAME` or `/etc/hostname`, else a random identity.
fn default_machine_id() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| format!("repostscan-{}", uuid::Uuid::new_v4().simple()))
}

fn parse_override<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(&format!("{ENV_PREFIX}{key}")).and_then(|v| v.trim().parse().ok())
}

impl RepostConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration the way the binary does: the given file (or the
    /// default location), then environment overrides, then validation.
    ///
    /// # Errors
    ///
    /// Returns an error if an explicit file cannot be read or parsed, or if
    /// the resulting configuration is invalid.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => Self::load_default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| Error::operation("read_config_file", e))?;
        Self::from_toml(&contents)
    }

    /// Parses configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid configuration TOML.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let file: ConfigFile =
            toml::from_str(contents).map_err(|e| Error::operation("parse_config_file", e))?;
        Ok(Self::from_config_file(file))
    }

    /// Loads configuration from the default location.
    ///
    /// Checks the following paths in order:
    /// 1. Platform-specific config dir
    /// 2. `~/.config/repostscan/config.toml`
    ///
    /// Returns default configuration if no config file is found.
    #[must_use]
    pub fn load_default() -> Self {
        let Some(base_dirs) = directories::BaseDirs::new() else {
            return Self::default();
        };

        let candidates = [
            base_dirs.config_dir().join("repostscan").join("config.toml"),
            base_dirs
                .home_dir()
                .join(".config")
                .join("repostscan")
                .join("config.toml"),
        ];
        candidates
            .iter()
            .filter(|path| path.exists())
            .find_map(|path| Self::load_from_file(path).ok())
            .unwrap_or_default()
    }

    /// Converts a `ConfigFile` to `RepostConfig`.
    fn from_config_file(file: ConfigFile) -> Self {
        let mut config = Self::default();

        if let Some(data_dir) = file.data_dir {
            config.data_dir = PathBuf::from(data_dir);
        }
        if let Some(v) = file.hash_size {
            config.hash_size = v;
        }
        if let Some(v) = file.hamming_cutoff {
            config.hamming_cutoff = v;
        }
        if let Some(v) = file.annoy_distance_ceiling {
            config.annoy_distance_ceiling = v;
        }
        if let Some(v) = file.index_tree_count {
            config.index_tree_count = v;
        }
        if let Some(v) = file.index_keep_alive_seconds {
            config.index_keep_alive = Duration::from_secs(v);
        }
        if let Some(v) = file.rebuild_lock_ttl_seconds {
            config.rebuild_lock_ttl = Duration::from_secs(v);
        }
        if let Some(v) = file.rebuild_page_size {
            config.rebuild_page_size = v;
        }
        if let Some(v) = file.query_neighbors {
            config.query_neighbors = v;
        }
        if let Some(v) = file.search_budget {
            config.search_budget = v;
        }
        config.index_path = file.index_path.map(PathBuf::from);
        config.database_path = file.database_path.map(PathBuf::from);
        config.redis_url = file.redis_url;
        if let Some(v) = file.lock_retry_attempts {
            config.lock_retry_attempts = v;
        }
        if let Some(v) = file.lock_retry_backoff_ms {
            config.lock_retry_backoff = Duration::from_millis(v);
        }
        if let Some(v) = file.rebuild_jitter_ms {
            config.rebuild_jitter = Duration::from_millis(v);
        }
        if let Some(v) = file.index_refresh_cooldown_seconds {
            config.index_refresh_cooldown = Duration::from_secs(v);
        }
        if let Some(v) = file.machine_id {
            config.machine_id = v;
        }
        if let Some(filter) = file.filter {
            config.filter = filter;
        }
        if let Some(observability) = file.observability {
            config.observability = observability;
        }

        config
    }

    /// Applies `REPOSTSCAN_*` environment variables.
    ///
    /// Unparseable values are ignored.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(&|key| std::env::var(key).ok());
    }

    /// Applies overrides from an arbitrary key lookup.
    pub fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup(&format!("{ENV_PREFIX}DATA_DIR")) {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = parse_override(lookup, "HASH_SIZE") {
            self.hash_size = v;
        }
        if let Some(v) = parse_override(lookup, "HAMMING_CUTOFF") {
            self.hamming_cutoff = v;
        }
        if let Some(v) = parse_override(lookup, "ANNOY_DISTANCE_CEILING") {
            self.annoy_distance_ceiling = v;
        }
        if let Some(v) = parse_override(lookup, "INDEX_TREE_COUNT") {
            self.index_tree_count = v;
        }
        if let Some(v) = parse_override(lookup, "INDEX_KEEP_ALIVE_SECONDS") {
            self.index_keep_alive = Duration::from_secs(v);
        }
        if let Some(v) = parse_override(lookup, "REBUILD_LOCK_TTL_SECONDS") {
            self.rebuild_lock_ttl = Duration::from_secs(v);
        }
        if let Some(v) = parse_override(lookup, "REBUILD_PAGE_SIZE") {
            self.rebuild_page_size = v;
        }
        if let Some(v) = parse_override(lookup, "QUERY_NEIGHBORS") {
            self.query_neighbors = v;
        }
        if let Some(v) = parse_override(lookup, "SEARCH_BUDGET") {
            self.search_budget = v;
        }
        if let Some(v) = lookup(&format!("{ENV_PREFIX}INDEX_PATH")) {
            self.index_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup(&format!("{ENV_PREFIX}DATABASE_PATH")) {
            self.database_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup(&format!("{ENV_PREFIX}REDIS_URL")) {
            self.redis_url = Some(v);
        }
        if let Some(v) = parse_override(lookup, "LOCK_RETRY_ATTEMPTS") {
            self.lock_retry_attempts = v;
        }
        if let Some(v) = parse_override(lookup, "LOCK_RETRY_BACKOFF_MS") {
            self.lock_retry_backoff = Duration::from_millis(v);
        }
        if let Some(v) = parse_override(lookup, "REBUILD_JITTER_MS") {
            self.rebuild_jitter = Duration::from_millis(v);
        }
        if let Some(v) = parse_override(lookup, "INDEX_REFRESH_COOLDOWN_SECONDS") {
            self.index_refresh_cooldown = Duration::from_secs(v);
        }
        if let Some(v) = lookup(&format!("{ENV_PREFIX}MACHINE_ID")).filter(|v| !v.is_empty()) {
            self.machine_id = v;
        }
        if let Some(v) = lookup(&format!("{ENV_PREFIX}LOG_FORMAT")) {
            self.observability.log_format = if v.eq_ignore_ascii_case("json") {
                LogFormat::Json
            } else {
                LogFormat::Pretty
            };
        }
    }

    /// Checks option ranges.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] naming the first offending option.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(Error::InvalidInput(msg.to_string()));

        if self.hash_size == 0 {
            return invalid("hash_size must be greater than 0");
        }
        if self.index_tree_count == 0 {
            return invalid("index_tree_count must be greater than 0");
        }
        if self.rebuild_page_size == 0 {
            return invalid("rebuild_page_size must be greater than 0");
        }
        if self.query_neighbors == 0 {
            return invalid("query_neighbors must be greater than 0");
        }
        if self.rebuild_lock_ttl.is_zero() {
            return invalid("rebuild_lock_ttl_seconds must be greater than 0");
        }
        if self.lock_retry_attempts == 0 {
            return invalid("lock_retry_attempts must be at least 1");
        }
        if !self.annoy_distance_ceiling.is_finite() || self.annoy_distance_ceiling < 0.0 {
            return invalid("annoy_distance_ceiling must be a non-negative number");
        }
        if self.annoy_distance_ceiling < crate::index::distance_for_hamming(self.hamming_cutoff) {
            return invalid("annoy_distance_ceiling must be at least sqrt(hamming_cutoff)");
        }
        if self.machine_id.trim().is_empty() {
            return invalid("machine_id must not be empty");
        }
        Ok(())
    }

    /// Bits per hash, which is also the index dimension.
    #[must_use]
    pub const fn dimension(&self) -> usize {
        (self.hash_size as usize) * (self.hash_size as usize)
    }

    /// Index file path.
    #[must_use]
    pub fn index_path(&self) -> PathBuf {
        self.index_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("image_index.rpx"))
    }

    /// `SQLite` database path.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("repostscan.db"))
    }

    /// Sets the data directory.
    #[must_use]
    pub fn with_data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_dir = path.into();
        self
    }

    /// Sets the machine identity.
    #[must_use]
    pub fn with_machine_id(mut self, machine_id: impl Into<String>) -> Self {
        self.machine_id = machine_id.into();
        self
    }
}
