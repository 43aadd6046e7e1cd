// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Environment-driven configuration for the snapshot harvest.
//!
//! Every component receives its settings through the structs defined here;
//! nothing reads the process environment after [`SnapshotConfig::from_os_env`]
//! returns. Tests build configurations from plain key/value iterators.

use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono_tz::Tz;
use thiserror::Error;
use tracing::warn;

const ENV_API_KEY: &str = "PEERINGDB_API_KEY";
const ENV_BASE_URL: &str = "PEERINGDB_API_BASE_URL";
const ENV_PAGE_LIMIT: &str = "PEERINGDB_PAGE_LIMIT";
const ENV_MAX_RETRIES: &str = "PEERINGDB_MAX_RETRIES";
const ENV_RETRY_BASE_DELAY_MS: &str = "PEERINGDB_RETRY_BASE_DELAY_MS";
const ENV_RETRY_MAX_DELAY_MS: &str = "PEERINGDB_RETRY_MAX_DELAY_MS";
const ENV_RETRY_JITTER_MS: &str = "PEERINGDB_RETRY_JITTER_MS";
const ENV_RETRY_BUDGET_MS: &str = "PEERINGDB_RETRY_BUDGET_MS";
const ENV_REQUEST_TIMEOUT_SECS: &str = "PEERINGDB_REQUEST_TIMEOUT_SECS";
const ENV_TIMEZONE: &str = "SNAPSHOT_TIMEZONE";
const ENV_BLOB_PREFIX: &str = "SNAPSHOT_BLOB_PREFIX";
const ENV_MAX_PAGES: &str = "SNAPSHOT_MAX_PAGES";
const ENV_PAGE_DELAY_MS: &str = "SNAPSHOT_PAGE_DELAY_MS";
const ENV_WORK_DIR: &str = "SNAPSHOT_WORK_DIR";
const ENV_RUN_TIMEOUT_SECS: &str = "SNAPSHOT_RUN_TIMEOUT_SECS";
const ENV_LEDGER_PATH: &str = "SNAPSHOT_LEDGER_PATH";
const ENV_BLOB_DIR: &str = "SNAPSHOT_BLOB_DIR";
const ENV_BLOB_BASE_URL: &str = "BLOB_BASE_URL";
const ENV_BLOB_TOKEN: &str = "BLOB_READ_WRITE_TOKEN";
const ENV_CRON_SECRET: &str = "CRON_SECRET";
const ENV_LISTEN_ADDR: &str = "SNAPSHOT_LISTEN_ADDR";

pub const DEFAULT_BASE_URL: &str = "https://www.peeringdb.com/api";
pub const DEFAULT_PAGE_LIMIT: usize = 250;
pub const DEFAULT_TIMEZONE: &str = "Asia/Singapore";
pub const DEFAULT_BLOB_PREFIX: &str = "snapshots";
const DEFAULT_MAX_PAGES: usize = 5000;
const DEFAULT_PAGE_DELAY_MS: u64 = 150;
const DEFAULT_LEDGER_PATH: &str = "pdb-snapshot-ledger";
const DEFAULT_BLOB_DIR: &str = "pdb-snapshot-blobs";
const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} environment variable is not set")]
    Missing(&'static str),
    #[error("unknown time zone {0:?}")]
    UnknownTimeZone(String),
    #[error("invalid listen address {0:?}")]
    InvalidListenAddr(String),
}

/// Retry and backoff policy for upstream requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Upper bound on any single delay, whatever its source.
    pub max_delay: Duration,
    /// Exclusive upper bound of the random jitter added to exponential backoff.
    /// `Duration::ZERO` disables jitter.
    pub jitter: Duration,
    /// Wall-clock budget for the whole retry sequence of one request.
    pub budget: Duration,
    pub request_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(15_000),
            jitter: Duration::from_millis(250),
            budget: Duration::from_secs(120),
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaginationConfig {
    pub limit: usize,
    pub max_pages: usize,
    pub page_delay: Duration,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_LIMIT,
            max_pages: DEFAULT_MAX_PAGES,
            page_delay: Duration::from_millis(DEFAULT_PAGE_DELAY_MS),
        }
    }
}

/// Where finished archives are published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobTarget {
    Directory(PathBuf),
    Http { base_url: String, token: String },
}

#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    pub api_key: String,
    pub base_url: String,
    pub timezone: Tz,
    pub blob_prefix: String,
    pub retry: RetryConfig,
    pub pagination: PaginationConfig,
    pub work_dir: PathBuf,
    /// Bounds the RUNNING phase of a harvest when set.
    pub run_timeout: Option<Duration>,
    pub ledger_path: PathBuf,
    pub blob_target: BlobTarget,
    pub cron_secret: Option<String>,
    pub listen_addr: SocketAddr,
}

impl SnapshotConfig {
    /// Builds a configuration with defaults for everything but the API key.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timezone: chrono_tz::Asia::Singapore,
            blob_prefix: DEFAULT_BLOB_PREFIX.to_string(),
            retry: RetryConfig::default(),
            pagination: PaginationConfig::default(),
            work_dir: env::temp_dir(),
            run_timeout: None,
            ledger_path: PathBuf::from(DEFAULT_LEDGER_PATH),
            blob_target: BlobTarget::Directory(PathBuf::from(DEFAULT_BLOB_DIR)),
            cron_secret: None,
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }

    pub fn from_os_env() -> Result<Self, ConfigError> {
        Self::from_env_iter(env::vars())
    }

    /// Builds settings from key/value pairs (typically for tests).
    pub fn from_env_iter<I, K, V>(iter: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map: HashMap<String, String> = iter
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let get = |key: &str| map.get(key).and_then(|value| sanitize_non_empty(value));

        let api_key = get(ENV_API_KEY).ok_or(ConfigError::Missing(ENV_API_KEY))?;
        let mut config = Self::new(api_key);

        if let Some(base_url) = get(ENV_BASE_URL) {
            config.base_url = base_url.trim_end_matches('/').to_string();
        }
        if let Some(zone) = get(ENV_TIMEZONE) {
            config.timezone = Tz::from_str(&zone).map_err(|_| ConfigError::UnknownTimeZone(zone))?;
        }
        if let Some(prefix) = get(ENV_BLOB_PREFIX) {
            config.blob_prefix = prefix.trim_matches('/').to_string();
        }

        let retry = &mut config.retry;
        retry.max_retries = parse_or(&map, ENV_MAX_RETRIES, retry.max_retries);
        retry.base_delay = millis_or(&map, ENV_RETRY_BASE_DELAY_MS, retry.base_delay);
        retry.max_delay = millis_or(&map, ENV_RETRY_MAX_DELAY_MS, retry.max_delay);
        retry.jitter = millis_or(&map, ENV_RETRY_JITTER_MS, retry.jitter);
        retry.budget = millis_or(&map, ENV_RETRY_BUDGET_MS, retry.budget);
        retry.request_timeout = Duration::from_secs(parse_or(
            &map,
            ENV_REQUEST_TIMEOUT_SECS,
            retry.request_timeout.as_secs(),
        ));

        let pagination = &mut config.pagination;
        pagination.limit = parse_or(&map, ENV_PAGE_LIMIT, pagination.limit).max(1);
        pagination.max_pages = parse_or(&map, ENV_MAX_PAGES, pagination.max_pages).max(1);
        pagination.page_delay = millis_or(&map, ENV_PAGE_DELAY_MS, pagination.page_delay);

        if let Some(dir) = get(ENV_WORK_DIR) {
            config.work_dir = PathBuf::from(dir);
        }
        config.run_timeout = get(ENV_RUN_TIMEOUT_SECS)
            .and_then(|_| parse_opt::<u64>(&map, ENV_RUN_TIMEOUT_SECS))
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);
        if let Some(path) = get(ENV_LEDGER_PATH) {
            config.ledger_path = PathBuf::from(path);
        }

        config.blob_target = match (get(ENV_BLOB_BASE_URL), get(ENV_BLOB_TOKEN)) {
            (Some(base_url), Some(token)) => BlobTarget::Http {
                base_url: base_url.trim_end_matches('/').to_string(),
                token,
            },
            (Some(_), None) => return Err(ConfigError::Missing(ENV_BLOB_TOKEN)),
            _ => BlobTarget::Directory(PathBuf::from(
                get(ENV_BLOB_DIR).unwrap_or_else(|| DEFAULT_BLOB_DIR.to_string()),
            )),
        };

        config.cron_secret = get(ENV_CRON_SECRET);
        let listen = get(ENV_LISTEN_ADDR).unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());
        config.listen_addr = listen
            .parse()
            .map_err(|_| ConfigError::InvalidListenAddr(listen))?;

        Ok(config)
    }
}

fn sanitize_non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parse_opt<T: FromStr>(map: &HashMap<String, String>, key: &str) -> Option<T> {
    let raw = map.get(key)?.trim();
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("{key}={raw:?} is not a valid number, using the default");
            None
        }
    }
}

fn parse_or<T: FromStr>(map: &HashMap<String, String>, key: &str, default: T) -> T {
    parse_opt(map, key).unwrap_or(default)
}

fn millis_or(map: &HashMap<String, String>, key: &str, default: Duration) -> Duration {
    parse_opt::<u64>(map, key)
        .map(Duration::from_millis)
        .unwrap_or(default)
}
