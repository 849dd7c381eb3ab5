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
use verdict_cache::CacheConfig;

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

/// Certificate and key for the HTTPS server, both PEM encoded.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(default)]
pub struct HttpsConfig {
    pub certificate_path: PathBuf,
    pub key_path: PathBuf,
}

impl Default for HttpsConfig {
    fn default() -> Self {
        HttpsConfig {
            certificate_path: PathBuf::from(".certificates/fullchain.pem"),
            key_path: PathBuf::from(".certificates/privkey.pem"),
        }
    }
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
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
    /// A tag name to report the hostname to, for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "verdict".into(),
            hostname_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

/// How resources are fetched before they are classified.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DownloadConfig {
    /// Largest accepted resource, in megabytes (10^6 bytes).
    pub max_size_mb: u64,

    /// Upper limit for a whole download, including reading the body.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Extra request headers, keyed by a pattern.
    ///
    /// The headers of the first pattern (in sorted order) that occurs anywhere in a locator are
    /// sent along when downloading it.
    pub custom_headers: BTreeMap<String, BTreeMap<String, String>>,
}

impl DownloadConfig {
    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_mb.saturating_mul(1_000_000)
    }

    /// Returns the custom headers to send for `url`.
    pub fn headers_for(&self, url: &str) -> Option<&BTreeMap<String, String>> {
        self.custom_headers
            .iter()
            .find(|(pattern, _)| url.contains(pattern.as_str()))
            .map(|(_, headers)| headers)
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        DownloadConfig {
            max_size_mb: 10,
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            custom_headers: BTreeMap::new(),
        }
    }
}

/// Where the model server lives.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Endpoint that accepts the raw resource as request body and responds with scores.
    pub url: String,

    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        ClassifierConfig {
            url: "http://127.0.0.1:8501/classify".into(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Score thresholds for deriving the verdict, in percent.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct Thresholds {
    /// At or above this `neutral` score, a resource is never flagged.
    pub neutral: f64,
    /// At or above this combined `sexy`, `porn` and `hentai` score, a resource is flagged.
    pub explicit: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Thresholds {
            neutral: 25.0,
            explicit: 70.0,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Host and port to bind the HTTP webserver to.
    pub bind: String,

    /// Host and port to bind the HTTPS webserver to.
    pub bind_https: Option<String>,

    pub https: Option<HttpsConfig>,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// The cache in front of classification.
    pub cache: CacheConfig,

    pub download: DownloadConfig,

    pub classifier: ClassifierConfig,

    pub thresholds: Thresholds,
}

/// Checks if we are running in docker.
fn is_docker() -> bool {
    if fs::metadata("/.dockerenv").is_ok() {
        return true;
    }

    fs::read_to_string("/proc/self/cgroup")
        .map(|s| s.contains("/docker"))
        .unwrap_or(false)
}

/// Default value for the "bind" configuration.
fn default_bind() -> String {
    if is_docker() {
        // Docker images rely on this service being exposed
        "0.0.0.0:8000".to_owned()
    } else {
        "127.0.0.1:8000".to_owned()
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind: default_bind(),
            bind_https: None,
            https: None,
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            cache: CacheConfig {
                name: "classify".into(),
                ..Default::default()
            },
            download: DownloadConfig::default(),
            classifier: ClassifierConfig::default(),
            thresholds: Thresholds::default(),
        }
    }
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

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
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
