use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

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
    /// The log level.
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
            statsd: match env::var("STATSD_SERVER") {
                Ok(metrics_statsd) => Some(metrics_statsd),
                Err(_) => None,
            },
            prefix: "tiercache".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Configuration of the in-memory tier.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct InMemoryCacheConfig {
    /// Capacity (in bytes) of the in-memory tier.
    ///
    /// The in-memory size limit is a best-effort approximation, and not an exact limit. Entries
    /// are weighed by the cache's weigher, which by default only counts the shallow size of a
    /// value.
    ///
    /// Defaults to `100 MiB (= 104_857_600)`.
    pub capacity: u64,

    /// Evicts entries that have not been accessed for this long.
    ///
    /// Defaults to never.
    #[serde(with = "humantime_serde")]
    pub time_to_idle: Option<Duration>,
}

impl Default for InMemoryCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 100 * 1024 * 1024,
            time_to_idle: None,
        }
    }
}

/// Configuration of the disk tier.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct DiskCacheConfig {
    /// Capacity (in bytes) of the disk tier.
    ///
    /// Once exceeded, the least recently used entries are evicted until the tier is back at 80%
    /// of this capacity. `0` disables eviction.
    ///
    /// Defaults to `1 GiB`.
    pub max_capacity: u64,

    /// Maximum duration since last use of cache item (item last used).
    ///
    /// Only enforced by an explicit cleanup. `null` keeps items forever.
    #[serde(with = "humantime_serde")]
    pub max_unused_for: Option<Duration>,
}

impl Default for DiskCacheConfig {
    fn default() -> Self {
        Self {
            max_capacity: 1024 * 1024 * 1024,
            max_unused_for: Some(Duration::from_secs(3600 * 24 * 7)),
        }
    }
}

/// Controls where raw values end up when a derived value is requested.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Keep the raw, unprocessed value in the in-memory tier.
    ///
    /// Defaults to `false`, as usually only the derived values are accessed repeatedly.
    pub raw_to_memory: bool,

    /// Persist a freshly fetched raw value in the disk tier.
    ///
    /// This allows deriving new variants later on without fetching again.
    ///
    /// Defaults to `true`.
    pub raw_to_disk: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            raw_to_memory: false,
            raw_to_disk: true,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Default, Eq, PartialEq)]
#[serde(default)]
pub struct CacheConfigs {
    /// Configuration of the in-memory tier.
    pub in_memory: InMemoryCacheConfig,
    /// Configuration of the disk tier.
    pub disk: DiskCacheConfig,
    /// Configuration of the fetch and derive pipeline.
    pub pipeline: PipelineConfig,
}

#[derive(Clone, Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Which directory to use when caching on disk. Default is to only cache in memory.
    pub cache_dir: Option<PathBuf>,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// Fine-tune the cache tiers
    pub caches: CacheConfigs,
}

impl Config {
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
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_config() {
        // It should be possible to set individual tiers in reasonable units without
        // affecting the other defaults.
        let cfg = Config::get(None).unwrap();
        assert_eq!(cfg.cache_dir, None);
        assert_eq!(cfg.caches, CacheConfigs::default());

        let yaml = r#"
            cache_dir: /tmp/tiercache
            caches:
              disk:
                max_capacity: 2048
              in_memory:
                time_to_idle: 10m
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.cache_dir, Some(PathBuf::from("/tmp/tiercache")));
        assert_eq!(cfg.caches.disk.max_capacity, 2048);
        assert_eq!(
            cfg.caches.disk.max_unused_for,
            DiskCacheConfig::default().max_unused_for
        );
        assert_eq!(
            cfg.caches.in_memory.time_to_idle,
            Some(Duration::from_secs(600))
        );
        assert_eq!(
            cfg.caches.in_memory.capacity,
            InMemoryCacheConfig::default().capacity
        );
        assert_eq!(cfg.caches.pipeline, PipelineConfig::default());
    }

    #[test]
    fn test_disabling_expiry() {
        // It should be possible to set a cache value to `None` meaning "do not expire".
        let yaml = r#"
            caches:
              disk:
                max_unused_for: null
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.caches.disk.max_unused_for, None);
        assert_eq!(
            cfg.caches.disk.max_capacity,
            DiskCacheConfig::default().max_capacity
        );
    }

    #[test]
    fn test_logging_config() {
        let yaml = r#"
            logging:
              level: debug
              format: json
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.logging.level, LevelFilter::DEBUG);
        assert_eq!(cfg.logging.format, LogFormat::Json);
        assert!(cfg.logging.enable_backtraces);

        let yaml = r#"
            logging:
              level: loud
        "#;
        assert!(Config::from_reader(yaml.as_bytes()).is_err());
    }

    #[test]
    fn test_unknown_fields() {
        // Unknown fields should not cause failure
        let yaml = r#"
            caches:
              not_a_tier:
                max_capacity: 1
        "#;
        let cfg = Config::from_reader(yaml.as_bytes());
        assert!(cfg.is_ok());
    }

    #[test]
    fn test_empty_file() {
        // Empty files aren't supported
        let yaml = r#""#;
        let result = Config::from_reader(yaml.as_bytes());
        assert!(result.is_err());
    }
}
