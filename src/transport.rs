use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use serde::Deserialize;

/// Settings for one named HTTP transport.
#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    /// Total request timeout. Default: 30s.
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Connection establishment timeout. Default: 10s.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Reuse idle connections. Default: true.
    #[serde(default = "default_true")]
    pub keep_alive: bool,
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_true() -> bool {
    true
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            request_timeout: default_request_timeout(),
            connect_timeout: default_connect_timeout(),
            keep_alive: true,
        }
    }
}

/// Shared pool of named HTTP clients.
///
/// Backends reference a transport by name (`transport: default`); clients
/// are built lazily from the matching config section and cached, so several
/// backends naming the same transport share one connection pool.
pub struct TransportPool {
    configs: HashMap<String, TransportConfig>,
    clients: Mutex<HashMap<String, reqwest::Client>>,
}

/// The transport every backend uses unless configured otherwise.
pub const DEFAULT_TRANSPORT: &str = "default";

impl TransportPool {
    pub fn new(configs: HashMap<String, TransportConfig>) -> Self {
        TransportPool {
            configs,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the client for `name`, building it on first use. The
    /// "default" transport always exists; any other name must be configured.
    pub fn get(&self, name: &str) -> Result<reqwest::Client> {
        if let Some(client) = self.clients.lock().get(name) {
            return Ok(client.clone());
        }

        let cfg = match self.configs.get(name) {
            Some(cfg) => cfg.clone(),
            None if name == DEFAULT_TRANSPORT => TransportConfig::default(),
            None => bail!("unknown transport {name:?}"),
        };

        let mut builder = reqwest::Client::builder()
            .timeout(cfg.request_timeout)
            .connect_timeout(cfg.connect_timeout);
        if !cfg.keep_alive {
            builder = builder.pool_max_idle_per_host(0);
        }
        let client = builder
            .build()
            .with_context(|| format!("building HTTP client for transport {name:?}"))?;

        self.clients.lock().insert(name.to_string(), client.clone());
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_transport_always_exists() {
        let pool = TransportPool::new(HashMap::new());
        pool.get(DEFAULT_TRANSPORT).expect("default transport");
    }

    #[test]
    fn unknown_transport_is_an_error() {
        let pool = TransportPool::new(HashMap::new());
        let err = pool.get("custom").unwrap_err();
        assert!(err.to_string().contains("unknown transport"));
    }

    #[test]
    fn configured_transport_is_cached() {
        let mut configs = HashMap::new();
        configs.insert("slow".to_string(), TransportConfig::default());
        let pool = TransportPool::new(configs);
        pool.get("slow").expect("configured transport");
        assert!(pool.clients.lock().contains_key("slow"));
    }
}
