use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::de::{self, Deserializer, Visitor};
use serde::Deserialize;

use crate::transport::TransportConfig;

/// Top-level configuration for the statspipe daemon.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// How often aggregated metrics are flushed to backends. Default: 1s.
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Number of aggregation shards. Default: the number of CPU cores.
    #[serde(default = "default_shards")]
    pub shards: usize,

    /// Capacity of each shard's incoming queue. When full, dispatching
    /// blocks, applying backpressure upstream. Default: 128.
    #[serde(default = "default_shard_queue_size")]
    pub shard_queue_size: usize,

    /// Percentile thresholds computed for every timer. Default: [90].
    #[serde(default = "default_percentiles")]
    pub percentiles: Vec<f64>,

    /// Histogram bucket thresholds per timer name. A timer listed here emits
    /// cumulative `le:` buckets instead of the aggregate subtypes.
    #[serde(default)]
    pub timer_histograms: HashMap<String, Vec<f64>>,

    /// Timer subtypes to suppress at the backend (e.g. "lower", "sum_squares").
    #[serde(default)]
    pub disabled_sub_metrics: Vec<String>,

    /// Gauges idle longer than this are dropped. Default: 0 (never).
    #[serde(default, with = "humantime_serde")]
    pub expiry_interval: Duration,

    /// Backends to forward flushes to, by name. Default: empty.
    #[serde(default)]
    pub backends: Vec<String>,

    /// Cloud provider used for source enrichment. Default: "" (disabled).
    #[serde(default)]
    pub cloud_provider: String,

    /// Datadog backend settings.
    #[serde(default)]
    pub datadog: DatadogConfig,

    /// Named HTTP transports shared between backends.
    #[serde(default)]
    pub transports: HashMap<String, TransportConfig>,
}

/// Datadog backend settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DatadogConfig {
    /// Destination URL root. Default: the public API endpoint.
    #[serde(default = "default_api_endpoint")]
    pub api_endpoint: String,

    /// API credential. Required when the backend is enabled; redacted from
    /// all errors and logs.
    #[serde(default)]
    pub api_key: String,

    /// User-Agent header. Default: "statspipe".
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Named transport to post through. Default: "default".
    #[serde(default = "default_transport")]
    pub transport: String,

    /// Hard cap on series per request. Default: 1000.
    #[serde(default = "default_metrics_per_batch")]
    pub metrics_per_batch: usize,

    /// Concurrent request cap; also the serialization buffer pool size.
    /// Default: 2x CPU cores.
    #[serde(default = "default_max_requests")]
    pub max_requests: usize,

    /// Deflate metric payloads. Default: true.
    #[serde(default = "default_true")]
    pub compress_payload: bool,

    /// Retry budget per request: a duration, or -1 for unbounded.
    /// Default: 15s.
    #[serde(default)]
    pub max_request_elapsed_time: RetryBudget,
}

/// Per-request retry budget. `-1` in the config means retry forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryBudget {
    Bounded(Duration),
    Unbounded,
}

impl Default for RetryBudget {
    fn default() -> Self {
        RetryBudget::Bounded(Duration::from_secs(15))
    }
}

impl<'de> Deserialize<'de> for RetryBudget {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct BudgetVisitor;

        impl<'de> Visitor<'de> for BudgetVisitor {
            type Value = RetryBudget;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a duration string like \"15s\", or -1 for unbounded")
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                if v == -1 {
                    Ok(RetryBudget::Unbounded)
                } else {
                    Err(E::custom("only -1 is accepted as a number"))
                }
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                self.visit_i64(v as i64)
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                humantime::parse_duration(v)
                    .map(RetryBudget::Bounded)
                    .map_err(E::custom)
            }
        }

        deserializer.deserialize_any(BudgetVisitor)
    }
}

/// Which timer aggregate subtypes are suppressed at serialization.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimerSubtypes {
    pub lower: bool,
    pub upper: bool,
    pub count: bool,
    pub count_per_second: bool,
    pub mean: bool,
    pub median: bool,
    pub std_dev: bool,
    pub sum: bool,
    pub sum_squares: bool,
}

impl TimerSubtypes {
    /// Parses the `disabled_sub_metrics` name list. Unknown names error.
    pub fn from_names(names: &[String]) -> Result<TimerSubtypes> {
        let mut s = TimerSubtypes::default();
        for name in names {
            match name.as_str() {
                "lower" => s.lower = true,
                "upper" => s.upper = true,
                "count" => s.count = true,
                "count_ps" => s.count_per_second = true,
                "mean" => s.mean = true,
                "median" => s.median = true,
                "std" => s.std_dev = true,
                "sum" => s.sum = true,
                "sum_squares" => s.sum_squares = true,
                other => bail!("unknown timer subtype {other:?}"),
            }
        }
        Ok(s)
    }
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_shards() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_shard_queue_size() -> usize {
    128
}

fn default_percentiles() -> Vec<f64> {
    vec![90.0]
}

fn default_api_endpoint() -> String {
    "https://app.datadoghq.com".to_string()
}

fn default_user_agent() -> String {
    "statspipe".to_string()
}

fn default_transport() -> String {
    crate::transport::DEFAULT_TRANSPORT.to_string()
}

fn default_metrics_per_batch() -> usize {
    1000
}

fn default_max_requests() -> usize {
    2 * std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: default_log_level(),
            flush_interval: default_flush_interval(),
            shards: default_shards(),
            shard_queue_size: default_shard_queue_size(),
            percentiles: default_percentiles(),
            timer_histograms: HashMap::new(),
            disabled_sub_metrics: Vec::new(),
            expiry_interval: Duration::ZERO,
            backends: Vec::new(),
            cloud_provider: String::new(),
            datadog: DatadogConfig::default(),
            transports: HashMap::new(),
        }
    }
}

impl Default for DatadogConfig {
    fn default() -> Self {
        DatadogConfig {
            api_endpoint: default_api_endpoint(),
            api_key: String::new(),
            user_agent: default_user_agent(),
            transport: default_transport(),
            metrics_per_batch: default_metrics_per_batch(),
            max_requests: default_max_requests(),
            compress_payload: true,
            max_request_elapsed_time: RetryBudget::default(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Loads configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validates required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.flush_interval.is_zero() {
            bail!("flush_interval must be positive");
        }
        if self.shards == 0 {
            bail!("shards must be positive");
        }
        if self.shard_queue_size == 0 {
            bail!("shard_queue_size must be positive");
        }
        for &p in &self.percentiles {
            if !(0.0..=100.0).contains(&p) {
                bail!("percentile {p} out of range");
            }
        }
        for (name, thresholds) in &self.timer_histograms {
            if thresholds.is_empty() {
                bail!("timer_histograms.{name} must list at least one threshold");
            }
        }
        // Surface bad subtype names at startup rather than first flush.
        TimerSubtypes::from_names(&self.disabled_sub_metrics)?;
        Ok(())
    }

    /// Returns the parsed disabled-subtype flags. `validate` has already
    /// rejected unknown names, so this cannot fail after startup.
    pub fn timer_subtypes(&self) -> TimerSubtypes {
        TimerSubtypes::from_names(&self.disabled_sub_metrics).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.flush_interval, Duration::from_secs(1));
        assert!(cfg.shards > 0);
        assert_eq!(cfg.percentiles, vec![90.0]);
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.datadog.api_endpoint, "https://app.datadoghq.com");
        assert_eq!(cfg.datadog.metrics_per_batch, 1000);
        assert!(cfg.datadog.compress_payload);
    }

    #[test]
    fn retry_budget_accepts_duration_and_minus_one() {
        let cfg: DatadogConfig =
            serde_yaml::from_str("max_request_elapsed_time: 30s").expect("parse");
        assert_eq!(
            cfg.max_request_elapsed_time,
            RetryBudget::Bounded(Duration::from_secs(30))
        );

        let cfg: DatadogConfig =
            serde_yaml::from_str("max_request_elapsed_time: -1").expect("parse");
        assert_eq!(cfg.max_request_elapsed_time, RetryBudget::Unbounded);

        let err = serde_yaml::from_str::<DatadogConfig>("max_request_elapsed_time: 7");
        assert!(err.is_err());
    }

    #[test]
    fn full_yaml_round_trip() {
        let yaml = r#"
flush_interval: 10s
shards: 4
percentiles: [50, 90]
timer_histograms:
  request_latency: [0.1, 0.5, 1.0]
disabled_sub_metrics: [lower, sum_squares]
backends: [datadog]
datadog:
  api_key: abc123
  metrics_per_batch: 500
  compress_payload: false
transports:
  default:
    request_timeout: 5s
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("parse");
        cfg.validate().expect("valid");
        assert_eq!(cfg.flush_interval, Duration::from_secs(10));
        assert_eq!(cfg.shards, 4);
        assert_eq!(cfg.timer_histograms["request_latency"], vec![0.1, 0.5, 1.0]);
        assert!(cfg.timer_subtypes().lower);
        assert!(cfg.timer_subtypes().sum_squares);
        assert!(!cfg.timer_subtypes().upper);
        assert_eq!(cfg.datadog.metrics_per_batch, 500);
        assert!(!cfg.datadog.compress_payload);
    }

    #[test]
    fn unknown_subtype_is_rejected() {
        let cfg = Config {
            disabled_sub_metrics: vec!["bogus".to_string()],
            ..Config::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("unknown timer subtype"));
    }

    #[test]
    fn out_of_range_percentile_is_rejected() {
        let cfg = Config {
            percentiles: vec![150.0],
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }
}
