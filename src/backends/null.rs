use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use super::SendCallback;
use crate::types::{Event, MetricMap};

/// Name of this backend.
pub const BACKEND_NAME: &str = "null";

/// A backend that discards everything. Useful for load testing the pipeline
/// without a downstream service.
#[derive(Clone, Copy, Default, Debug)]
pub struct NullBackend;

impl NullBackend {
    pub fn new() -> Self {
        NullBackend
    }

    pub fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    pub fn send_metrics_async(
        &self,
        _cancel: CancellationToken,
        _metrics: Arc<MetricMap>,
        cb: SendCallback,
    ) {
        cb(Vec::new());
    }

    pub async fn send_event(&self, _cancel: &CancellationToken, _e: &Event) -> Result<()> {
        Ok(())
    }
}
