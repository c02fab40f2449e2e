pub mod event;
pub mod instance;
pub mod metric_map;

use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

pub use event::{AlertType, Event, Priority};
pub use instance::{CachedInstances, Instance, InstanceInfo};
pub use metric_map::{Counter, Gauge, HistogramBucket, MetricMap, Percentile, Set, Timer};

/// Nanoseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Nanotime(pub u64);

impl Nanotime {
    /// Returns the current wall clock time.
    pub fn now() -> Self {
        let ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        Nanotime(ns)
    }

    /// Returns the time as whole seconds since the epoch.
    pub fn unix_seconds(self) -> f64 {
        (self.0 / 1_000_000_000) as f64
    }
}

/// The originating host identity of a metric or event. May be an IP address
/// still awaiting enrichment, a resolved hostname, or unknown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum Source {
    /// No source information is available. Metrics with an unknown source
    /// bypass cloud enrichment.
    #[default]
    Unknown,
    /// A hostname or IP address.
    Name(Arc<str>),
}

impl Source {
    pub fn is_unknown(&self) -> bool {
        matches!(self, Source::Unknown)
    }

    /// Returns the host string, or "" for an unknown source.
    pub fn as_str(&self) -> &str {
        match self {
            Source::Unknown => "",
            Source::Name(s) => s,
        }
    }
}

impl From<&str> for Source {
    fn from(s: &str) -> Self {
        if s.is_empty() {
            Source::Unknown
        } else {
            Source::Name(Arc::from(s))
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A set of `key:value` tags attached to a metric or event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tags(Vec<String>);

impl Tags {
    pub fn new() -> Self {
        Tags(Vec::new())
    }

    pub fn with_capacity(cap: usize) -> Self {
        Tags(Vec::with_capacity(cap))
    }

    pub fn push(&mut self, tag: impl Into<String>) {
        self.0.push(tag.into());
    }

    /// Appends all tags from `other`.
    pub fn extend_from(&mut self, other: &Tags) {
        self.0.extend(other.0.iter().cloned());
    }

    /// Returns a new tag set with `extra` appended.
    pub fn concat(&self, extra: &Tags) -> Tags {
        let mut out = Vec::with_capacity(self.0.len() + extra.0.len());
        out.extend(self.0.iter().cloned());
        out.extend(extra.0.iter().cloned());
        Tags(out)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, String> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    /// Returns a canonical, order-independent fingerprint of the tag set.
    /// Two equivalent tag multisets always produce the same key.
    pub fn key(&self) -> String {
        let mut sorted: Vec<&str> = self.0.iter().map(String::as_str).collect();
        sorted.sort_unstable();
        sorted.join(",")
    }
}

impl From<Vec<String>> for Tags {
    fn from(v: Vec<String>) -> Self {
        Tags(v)
    }
}

impl From<&[&str]> for Tags {
    fn from(v: &[&str]) -> Self {
        Tags(v.iter().map(|s| s.to_string()).collect())
    }
}

impl<'a> IntoIterator for &'a Tags {
    type Item = &'a String;
    type IntoIter = std::slice::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// The value of a single statsd sample, carrying the metric type.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    /// Monotonic increment; aggregated by summing.
    Counter(f64),
    /// Point-in-time value; aggregated last-write-wins.
    Gauge(f64),
    /// Duration sample; raw samples are kept until flush.
    Timer(f64),
    /// Unique-member sample; aggregated as set cardinality.
    Set(String),
}

impl MetricValue {
    /// Returns the statsd type name.
    pub fn type_name(&self) -> &'static str {
        match self {
            MetricValue::Counter(_) => "counter",
            MetricValue::Gauge(_) => "gauge",
            MetricValue::Timer(_) => "timer",
            MetricValue::Set(_) => "set",
        }
    }
}

/// A single parsed statsd sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub name: String,
    pub value: MetricValue,
    pub tags: Tags,
    pub source: Source,
    pub timestamp: Nanotime,
}

impl Metric {
    pub fn new(
        name: impl Into<String>,
        value: MetricValue,
        tags: Tags,
        source: Source,
        timestamp: Nanotime,
    ) -> Self {
        Metric {
            name: name.into(),
            value,
            tags,
            source,
            timestamp,
        }
    }

    /// Appends tags and replaces the source. Used by the cloud handler once
    /// instance metadata resolves.
    pub fn add_tags_set_source(&mut self, additional: &Tags, new_source: &Source) {
        self.tags.extend_from(additional);
        self.source = new_source.clone();
    }
}
