use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;
use url::Url;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level for the pinner.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "pinion".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Connection to the IPFS daemon.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct IpfsConfig {
    /// Base URL of the daemon's HTTP RPC API.
    pub daemon_url: Url,

    /// Timeout for a single, non-streaming request to the daemon.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// How often the peers of the pinning room are polled to detect joins and leaves.
    #[serde(with = "humantime_serde")]
    pub peer_poll_interval: Duration,
}

impl Default for IpfsConfig {
    fn default() -> Self {
        Self {
            daemon_url: default_daemon_url(),
            request_timeout: Duration::from_secs(30),
            peer_poll_interval: Duration::from_secs(1),
        }
    }
}

fn default_daemon_url() -> Url {
    Url::parse("http://127.0.0.1:5001/").unwrap_or_else(|_| unreachable!("valid literal"))
}

/// Limits and behavior of the open store cache.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct StoresConfig {
    /// Maximum number of stores that are kept open at the same time.
    ///
    /// When more stores are requested, the least recently used one is closed.
    pub max_open_stores: usize,

    /// Keep pinning new entries of a store after its initial replication finished.
    ///
    /// By default, only the catch-up replication after opening a store is pinned, and the
    /// replication listeners are detached once it completes.
    pub follow_updates: bool,
}

impl Default for StoresConfig {
    fn default() -> Self {
        Self {
            max_open_stores: 100,
            follow_updates: false,
        }
    }
}

/// See the README for more information on config values.
#[derive(Clone, Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// The pubsub room in which clients send their requests.
    pub room: String,

    /// Connection to the IPFS daemon.
    pub ipfs: IpfsConfig,

    /// Limits of the open store cache.
    pub stores: StoresConfig,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,
}

impl Config {
    /// Loads the configuration from the given YAML file, or the defaults if no file is given.
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        // check for empty files explicitly
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }

    /// Overrides values with the `PINION_*` environment variables, where set.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_vars(|name| env::var(name).ok())
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(room) = var("PINION_ROOM") {
            self.room = room;
        }
        if let Some(url) = var("PINION_IPFS_DAEMON_URL") {
            self.ipfs.daemon_url = url
                .parse()
                .with_context(|| format!("invalid PINION_IPFS_DAEMON_URL: {url}"))?;
        }
        if let Some(max) = var("PINION_MAX_OPEN_STORES") {
            self.stores.max_open_stores = max
                .parse()
                .with_context(|| format!("invalid PINION_MAX_OPEN_STORES: {max}"))?;
        }
        Ok(())
    }

    /// Checks the values that have no sensible default.
    pub fn validate(&self) -> Result<()> {
        if self.room.is_empty() {
            anyhow::bail!("pinning room is required for pinion to start");
        }
        if self.stores.max_open_stores == 0 {
            anyhow::bail!("max_open_stores must be at least 1");
        }
        Ok(())
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
