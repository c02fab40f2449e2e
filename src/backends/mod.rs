pub mod datadog;
pub mod null;

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::stats::Statser;
use crate::transport::TransportPool;
use crate::types::{Event, MetricMap};

/// Receives the per-batch errors of one asynchronous metrics send. The
/// vector may be empty when every batch succeeded.
pub type SendCallback = Box<dyn FnOnce(Vec<anyhow::Error>) + Send + 'static>;

/// Failure modes of backend construction. An unknown name is a caller
/// mistake; a construction failure means the name was recognised but the
/// configuration was unusable.
#[derive(Debug, thiserror::Error)]
pub enum InitBackendError {
    #[error("unknown backend {0:?}")]
    UnknownBackend(String),
    #[error("could not init backend {name:?}: {source}")]
    Construction {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

/// A configured downstream sink.
///
/// Enum dispatch rather than trait objects: the set of backends is known at
/// compile time and the async methods stay zero-cost.
#[derive(Clone, Debug)]
pub enum Backend {
    Datadog(datadog::DatadogClient),
    Null(null::NullBackend),
}

impl Backend {
    /// Returns the backend name used in metrics and logs.
    pub fn name(&self) -> &'static str {
        match self {
            Backend::Datadog(b) => b.name(),
            Backend::Null(b) => b.name(),
        }
    }

    /// Serializes and posts a flush snapshot. Returns immediately; `cb`
    /// receives the per-batch errors once every batch has been resolved.
    pub fn send_metrics_async(
        &self,
        cancel: CancellationToken,
        metrics: Arc<MetricMap>,
        cb: SendCallback,
    ) {
        match self {
            Backend::Datadog(b) => b.send_metrics_async(cancel, metrics, cb),
            Backend::Null(b) => b.send_metrics_async(cancel, metrics, cb),
        }
    }

    /// Sends a single event.
    pub async fn send_event(&self, cancel: &CancellationToken, e: &Event) -> Result<()> {
        match self {
            Backend::Datadog(b) => b.send_event(cancel, e).await,
            Backend::Null(b) => b.send_event(cancel, e).await,
        }
    }

    /// Long-running loop emitting the backend's own counters on each flush.
    pub async fn run_metrics(&self, cancel: CancellationToken, statser: Statser) {
        match self {
            Backend::Datadog(b) => b.run_metrics(cancel, statser).await,
            Backend::Null(_) => cancel.cancelled().await,
        }
    }
}

/// Creates an instance of the named backend. An empty name is a no-op and
/// returns no backend without error.
pub fn init_backend(
    name: &str,
    cfg: &Config,
    pool: &TransportPool,
) -> Result<Option<Backend>, InitBackendError> {
    if name.is_empty() {
        info!("no backend specified");
        return Ok(None);
    }

    let backend = match name {
        datadog::BACKEND_NAME => {
            let client = datadog::DatadogClient::from_config(cfg, pool).map_err(|source| {
                InitBackendError::Construction {
                    name: name.to_string(),
                    source,
                }
            })?;
            Backend::Datadog(client)
        }
        null::BACKEND_NAME => Backend::Null(null::NullBackend::new()),
        _ => return Err(InitBackendError::UnknownBackend(name.to_string())),
    };

    info!(backend = name, "initialised backend");
    Ok(Some(backend))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn pool() -> TransportPool {
        TransportPool::new(HashMap::new())
    }

    #[test]
    fn empty_name_is_a_noop() {
        let cfg = Config::default();
        let backend = init_backend("", &cfg, &pool()).expect("no error");
        assert!(backend.is_none());
    }

    #[test]
    fn unknown_name_is_an_error() {
        let cfg = Config::default();
        let err = init_backend("nope", &cfg, &pool()).unwrap_err();
        assert!(matches!(err, InitBackendError::UnknownBackend(_)));
        assert_eq!(err.to_string(), "unknown backend \"nope\"");
    }

    #[tokio::test]
    async fn null_backend_works() {
        let cfg = Config::default();
        let backend = init_backend("null", &cfg, &pool())
            .expect("no error")
            .expect("backend constructed");
        assert_eq!(backend.name(), "null");

        let (tx, rx) = std::sync::mpsc::channel();
        backend.send_metrics_async(
            CancellationToken::new(),
            Arc::new(MetricMap::new()),
            Box::new(move |errs| {
                let _ = tx.send(errs);
            }),
        );
        let errs = rx.recv_timeout(std::time::Duration::from_secs(1)).expect("callback ran");
        assert!(errs.is_empty());

        backend
            .send_event(&CancellationToken::new(), &Event::new("t", "x"))
            .await
            .expect("event accepted");
    }

    #[test]
    fn datadog_without_api_key_fails_construction() {
        let cfg = Config::default();
        let err = init_backend("datadog", &cfg, &pool()).unwrap_err();
        assert!(matches!(err, InitBackendError::Construction { .. }));
        assert!(err.to_string().contains("datadog"));
    }
}
