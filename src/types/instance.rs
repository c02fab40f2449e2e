use std::sync::Arc;

use tokio::sync::mpsc;

use super::{Source, Tags};

/// A cloud-provider instance resolved from a source IP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    /// Canonical identity of the instance; replaces the metric source.
    pub id: Source,
    /// Provider tags merged into each enriched metric and event.
    pub tags: Tags,
}

/// The outcome of an instance lookup. `instance == None` means the lookup
/// completed without a result (negative cache).
#[derive(Debug, Clone)]
pub struct InstanceInfo {
    pub ip: Source,
    pub instance: Option<Arc<Instance>>,
}

/// Asynchronous IP-to-instance resolution with a positive and negative
/// cache. Concrete providers (Kubernetes, AWS, ...) live outside the core
/// pipeline; the cloud handler only sees this contract.
pub trait CachedInstances: Send + Sync {
    /// Non-blocking cache probe. Returns `(instance, cache_hit)`; a hit with
    /// `None` is a negative cache entry (lookup attempted, no result) and
    /// must not trigger another lookup.
    fn peek(&self, ip: &Source) -> (Option<Arc<Instance>>, bool);

    /// Channel on which the cloud handler requests lookups. Small-bounded;
    /// a slow provider back-pressures the handler.
    fn ip_sink(&self) -> mpsc::Sender<Source>;

    /// Channel delivering lookup results. Called at most once, by the cloud
    /// handler run loop at startup.
    fn info_source(&self) -> mpsc::Receiver<InstanceInfo>;

    /// Pre-allocation hint for the number of tags a lookup adds.
    fn estimated_tags(&self) -> usize;
}
