//! statsd-compatible metric aggregation and forwarding pipeline.
//!
//! Parsed metrics enter at a [`pipeline::PipelineHandler`], flow through
//! optional cloud enrichment into a pool of aggregation shards, and are
//! flushed on a fixed interval to the configured backends.

pub mod backends;
pub mod config;
pub mod pipeline;
pub mod stats;
pub mod transport;
pub mod types;
