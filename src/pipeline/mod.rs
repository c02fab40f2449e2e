pub mod aggregator;
pub mod backend_handler;
pub mod cloud_handler;
pub mod flusher;

pub use aggregator::MetricAggregator;
pub use backend_handler::BackendHandler;
pub use cloud_handler::{CloudHandler, CloudHandlerRunner};
pub use flusher::Flusher;

use crate::types::{Event, MetricMap};

/// Downstream contract between pipeline stages.
///
/// Receivers hand parsed metrics to the head of the chain; each stage either
/// transforms and forwards, or terminates the chain (the backend handler).
/// Static dispatch: stages are generic over their downstream rather than
/// boxing a trait object.
pub trait PipelineHandler: Clone + Send + Sync + 'static {
    /// Pre-allocation hint for how many tags this stage and everything
    /// downstream may add to a metric.
    fn estimated_tags(&self) -> usize;

    /// Accepts a batch of aggregated metrics. May suspend when downstream
    /// queues are full (backpressure).
    fn dispatch_metric_map(
        &self,
        mm: MetricMap,
    ) -> impl std::future::Future<Output = ()> + Send;

    /// Accepts a single event.
    fn dispatch_event(&self, e: Event) -> impl std::future::Future<Output = ()> + Send;

    /// Resolves once every event accepted so far has been fully dispatched.
    /// Shutdown cancels the pipeline first, then waits on this.
    fn wait_for_events(&self) -> impl std::future::Future<Output = ()> + Send;
}
