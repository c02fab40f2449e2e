use std::collections::HashMap;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use crate::types::{HistogramBucket, MetricMap, Nanotime, Percentile};

/// Per-shard metric accumulator.
///
/// Owns a private live `MetricMap` mutated only by its worker task. Flushing
/// computes the derived fields in place; `reset` swaps the live map out and
/// returns it, so a flushed map can never be mutated concurrently with the
/// next interval's accumulation.
pub struct MetricAggregator {
    live: MetricMap,
    /// Percentile thresholds computed for every timer, e.g. `[50.0, 90.0]`.
    percentiles: Arc<Vec<f64>>,
    /// Histogram bucket thresholds per timer name. A timer with configured
    /// thresholds emits cumulative buckets instead of aggregate subtypes.
    histograms: Arc<HashMap<String, Vec<f64>>>,
    /// Gauges idle longer than this are dropped at reset. Zero disables.
    expiry_interval: Duration,
}

impl MetricAggregator {
    pub fn new(
        percentiles: Arc<Vec<f64>>,
        histograms: Arc<HashMap<String, Vec<f64>>>,
        expiry_interval: Duration,
    ) -> Self {
        MetricAggregator {
            live: MetricMap::new(),
            percentiles,
            histograms,
            expiry_interval,
        }
    }

    /// Merges an incoming map into the live map.
    pub fn receive_map(&mut self, mm: MetricMap) {
        self.live.merge(mm);
    }

    /// Runs `f` against the live map on the owning task.
    pub fn process(&mut self, f: impl FnOnce(&mut MetricMap)) {
        f(&mut self.live);
    }

    /// Computes derived fields on the live map for a flush covering
    /// `interval`. Derived values are deterministic functions of the sorted
    /// sample vector.
    pub fn flush(&mut self, interval: Duration) {
        let secs = interval.as_secs_f64();

        for by_key in self.live.counters.values_mut() {
            for c in by_key.values_mut() {
                c.per_second = if secs > 0.0 { c.value / secs } else { 0.0 };
            }
        }

        for (name, by_key) in &mut self.live.timers {
            let thresholds = self.histograms.get(name);
            for t in by_key.values_mut() {
                t.values.sort_unstable_by(f64::total_cmp);
                let n = t.values.len();
                t.count = n as u64;
                t.per_second = if secs > 0.0 { n as f64 / secs } else { 0.0 };
                if n == 0 {
                    continue;
                }

                if let Some(thresholds) = thresholds {
                    t.histogram = Some(histogram_buckets(&t.values, thresholds));
                    continue;
                }

                t.min = t.values[0];
                t.max = t.values[n - 1];
                t.sum = t.values.iter().sum();
                t.sum_squares = t.values.iter().map(|v| v * v).sum();
                t.mean = t.sum / n as f64;
                t.median = percentile(&t.values, 50.0);
                let variance =
                    t.values.iter().map(|v| (v - t.mean).powi(2)).sum::<f64>() / n as f64;
                t.std_dev = variance.sqrt();
                t.percentiles = self
                    .percentiles
                    .iter()
                    .map(|&p| Percentile {
                        label: percentile_label(p),
                        value: percentile(&t.values, p),
                    })
                    .collect();
            }
        }
    }

    /// Swaps the live map out and returns it. The fresh live map retains the
    /// current gauges (last-write-wins values persist across flushes);
    /// counters, timers and sets start empty.
    pub fn reset(&mut self) -> MetricMap {
        let mut fresh = MetricMap::new();
        fresh.gauges = self.live.gauges.clone();

        if !self.expiry_interval.is_zero() {
            let now = Nanotime::now();
            let horizon = now.0.saturating_sub(self.expiry_interval.as_nanos() as u64);
            for by_key in fresh.gauges.values_mut() {
                by_key.retain(|_, g| g.timestamp.0 >= horizon);
            }
            fresh.gauges.retain(|_, by_key| !by_key.is_empty());
        }

        mem::replace(&mut self.live, fresh)
    }
}

/// Computes the percentile of a sorted sample vector using midpoint
/// interpolation: the rank is `p/100 * n + 1/2`, clamped to `[1, n]`, and
/// the result is linearly interpolated between the surrounding order
/// statistics. For `[1..10]`, p50 = 5.5 and p90 = 9.5.
pub fn percentile(sorted: &[f64], pct: f64) -> f64 {
    let n = sorted.len();
    match n {
        0 => return 0.0,
        1 => return sorted[0],
        _ => {}
    }
    let h = (pct / 100.0 * n as f64 + 0.5).clamp(1.0, n as f64);
    let j = h.floor() as usize; // 1-based rank
    let gamma = h - j as f64;
    if j >= n {
        return sorted[n - 1];
    }
    sorted[j - 1] + gamma * (sorted[j] - sorted[j - 1])
}

/// Formats a percentile threshold as a metric suffix: 90 becomes "p90",
/// 99.9 becomes "p99_9".
pub fn percentile_label(pct: f64) -> String {
    format!("p{}", pct.to_string().replace('.', "_"))
}

/// Builds cumulative bucket counts over sorted samples, one bucket per
/// threshold plus the open `+Inf` bucket.
fn histogram_buckets(sorted: &[f64], thresholds: &[f64]) -> Vec<HistogramBucket> {
    let mut thresholds: Vec<f64> = thresholds.to_vec();
    thresholds.sort_unstable_by(f64::total_cmp);

    let mut buckets = Vec::with_capacity(thresholds.len() + 1);
    for le in thresholds {
        // Samples are sorted, so the cumulative count is the partition point.
        let count = sorted.partition_point(|&v| v <= le) as u64;
        buckets.push(HistogramBucket { le, count });
    }
    buckets.push(HistogramBucket {
        le: f64::INFINITY,
        count: sorted.len() as u64,
    });
    buckets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Metric, MetricValue, Source, Tags};

    fn aggregator() -> MetricAggregator {
        MetricAggregator::new(
            Arc::new(vec![50.0, 90.0]),
            Arc::new(HashMap::new()),
            Duration::ZERO,
        )
    }

    fn receive(aggr: &mut MetricAggregator, name: &str, value: MetricValue, ts: u64) {
        let mut mm = MetricMap::new();
        mm.receive(Metric::new(
            name,
            value,
            Tags::new(),
            Source::Unknown,
            Nanotime(ts),
        ));
        aggr.receive_map(mm);
    }

    #[test]
    fn counter_flush_computes_per_second() {
        let mut aggr = aggregator();
        receive(&mut aggr, "c", MetricValue::Counter(3.0), 1);
        receive(&mut aggr, "c", MetricValue::Counter(7.0), 2);
        aggr.flush(Duration::from_secs(10));

        let flushed = aggr.reset();
        let c = &flushed.counters["c"][""];
        assert_eq!(c.value, 10.0);
        assert_eq!(c.per_second, 1.0);
    }

    #[test]
    fn timer_flush_computes_aggregates_and_percentiles() {
        let mut aggr = aggregator();
        for v in 1..=10 {
            receive(&mut aggr, "t", MetricValue::Timer(v as f64), v);
        }
        aggr.flush(Duration::from_secs(10));

        let flushed = aggr.reset();
        let t = &flushed.timers["t"][""];
        assert_eq!(t.count, 10);
        assert_eq!(t.min, 1.0);
        assert_eq!(t.max, 10.0);
        assert_eq!(t.mean, 5.5);
        assert_eq!(t.median, 5.5);
        assert_eq!(t.sum, 55.0);
        assert_eq!(t.sum_squares, 385.0);
        assert_eq!(t.per_second, 1.0);
        assert!((t.std_dev - 2.8722813232690143).abs() < 1e-12);
        assert_eq!(t.percentiles.len(), 2);
        assert_eq!(t.percentiles[0].label, "p50");
        assert_eq!(t.percentiles[0].value, 5.5);
        assert_eq!(t.percentiles[1].label, "p90");
        assert_eq!(t.percentiles[1].value, 9.5);
        assert!(t.histogram.is_none());
    }

    #[test]
    fn timer_with_thresholds_gets_histogram_not_subtypes() {
        let mut histograms = HashMap::new();
        histograms.insert("lat".to_string(), vec![5.0, 2.0]); // unsorted on purpose
        let mut aggr = MetricAggregator::new(
            Arc::new(vec![90.0]),
            Arc::new(histograms),
            Duration::ZERO,
        );
        for v in 1..=10 {
            receive(&mut aggr, "lat", MetricValue::Timer(v as f64), v);
        }
        aggr.flush(Duration::from_secs(1));

        let flushed = aggr.reset();
        let t = &flushed.timers["lat"][""];
        let hist = t.histogram.as_ref().expect("histogram populated");
        assert_eq!(hist.len(), 3);
        assert_eq!((hist[0].le, hist[0].count), (2.0, 2));
        assert_eq!((hist[1].le, hist[1].count), (5.0, 5));
        assert!(hist[2].le.is_infinite());
        assert_eq!(hist[2].count, 10);
        // Aggregate subtypes are not computed for histogram timers.
        assert!(t.percentiles.is_empty());
        assert_eq!(t.count, 10);
    }

    #[test]
    fn reset_drops_counters_timers_sets_and_retains_gauges() {
        let mut aggr = aggregator();
        receive(&mut aggr, "c", MetricValue::Counter(1.0), 1);
        receive(&mut aggr, "g", MetricValue::Gauge(42.0), 1);
        receive(&mut aggr, "t", MetricValue::Timer(1.0), 1);
        receive(&mut aggr, "s", MetricValue::Set("a".to_string()), 1);

        aggr.flush(Duration::from_secs(1));
        let first = aggr.reset();
        assert_eq!(first.counters.len(), 1);
        assert_eq!(first.sets["s"][""].values.len(), 1);

        // Second flush without input: only the gauge remains.
        aggr.flush(Duration::from_secs(1));
        let second = aggr.reset();
        assert!(second.counters.is_empty());
        assert!(second.timers.is_empty());
        assert!(second.sets.is_empty());
        assert_eq!(second.gauges["g"][""].value, 42.0);
    }

    #[test]
    fn set_reset_between_flushes_drops_members() {
        let mut aggr = aggregator();
        for v in ["a", "b", "a"] {
            receive(&mut aggr, "s", MetricValue::Set(v.to_string()), 1);
        }
        aggr.flush(Duration::from_secs(1));
        let first = aggr.reset();
        assert_eq!(first.sets["s"][""].values.len(), 2);

        aggr.flush(Duration::from_secs(1));
        let second = aggr.reset();
        assert!(second.sets.is_empty());
    }

    #[test]
    fn expired_gauges_are_pruned_at_reset() {
        let mut aggr = MetricAggregator::new(
            Arc::new(Vec::new()),
            Arc::new(HashMap::new()),
            Duration::from_secs(60),
        );
        // A gauge stamped far in the past is dropped, a fresh one survives.
        receive(&mut aggr, "old", MetricValue::Gauge(1.0), 1);
        let mut mm = MetricMap::new();
        mm.receive(Metric::new(
            "fresh",
            MetricValue::Gauge(2.0),
            Tags::new(),
            Source::Unknown,
            Nanotime::now(),
        ));
        aggr.receive_map(mm);

        aggr.reset();
        let next = aggr.reset();
        assert!(!next.gauges.contains_key("old"));
        assert!(next.gauges.contains_key("fresh"));
    }

    #[test]
    fn percentile_edge_cases() {
        assert_eq!(percentile(&[], 50.0), 0.0);
        assert_eq!(percentile(&[7.0], 99.0), 7.0);
        let sorted: Vec<f64> = (1..=10).map(f64::from).collect();
        assert_eq!(percentile(&sorted, 0.0), 1.0);
        assert_eq!(percentile(&sorted, 100.0), 10.0);
    }

    #[test]
    fn percentile_labels() {
        assert_eq!(percentile_label(90.0), "p90");
        assert_eq!(percentile_label(99.9), "p99_9");
        assert_eq!(percentile_label(50.0), "p50");
    }
}
