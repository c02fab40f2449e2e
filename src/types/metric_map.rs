use std::collections::{HashMap, HashSet};

use super::{Metric, MetricValue, Nanotime, Source, Tags};

/// Accumulated state for one counter identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Counter {
    pub value: f64,
    /// Derived at flush: `value / interval`.
    pub per_second: f64,
    pub timestamp: Nanotime,
    pub source: Source,
    pub tags: Tags,
}

impl Counter {
    pub fn new(value: f64, timestamp: Nanotime, source: Source, tags: Tags) -> Self {
        Counter {
            value,
            per_second: 0.0,
            timestamp,
            source,
            tags,
        }
    }
}

/// Last-observed value for one gauge identity. Last write wins, preferring
/// the newer timestamp; equal timestamps resolve to the later arrival.
#[derive(Debug, Clone, PartialEq)]
pub struct Gauge {
    pub value: f64,
    pub timestamp: Nanotime,
    pub source: Source,
    pub tags: Tags,
}

/// One percentile computed at flush, e.g. `("p90", 9.5)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Percentile {
    pub label: String,
    pub value: f64,
}

/// One cumulative histogram bucket. `le` is the inclusive upper bound;
/// `f64::INFINITY` is the open bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistogramBucket {
    pub le: f64,
    pub count: u64,
}

/// Raw samples and flush-derived statistics for one timer identity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Timer {
    pub values: Vec<f64>,
    pub count: u64,
    pub per_second: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub median: f64,
    pub sum: f64,
    pub sum_squares: f64,
    pub std_dev: f64,
    pub percentiles: Vec<Percentile>,
    /// Cumulative bucket counts, present only when histogram thresholds are
    /// configured for this timer. Mutually exclusive with the aggregate
    /// subtypes at the backend.
    pub histogram: Option<Vec<HistogramBucket>>,
    pub timestamp: Nanotime,
    pub source: Source,
    pub tags: Tags,
}

impl Timer {
    pub fn new(timestamp: Nanotime, source: Source, tags: Tags) -> Self {
        Timer {
            timestamp,
            source,
            tags,
            ..Default::default()
        }
    }
}

/// Unique string members observed for one set identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Set {
    pub values: HashSet<String>,
    pub timestamp: Nanotime,
    pub source: Source,
    pub tags: Tags,
}

/// Aggregated metrics keyed by `name`, then by the canonical tags key.
///
/// Within an aggregator shard exactly one map is live at any instant; a
/// flushed map is moved out by `reset` and never mutated again.
#[derive(Debug, Clone, Default)]
pub struct MetricMap {
    pub counters: HashMap<String, HashMap<String, Counter>>,
    pub gauges: HashMap<String, HashMap<String, Gauge>>,
    pub timers: HashMap<String, HashMap<String, Timer>>,
    pub sets: HashMap<String, HashMap<String, Set>>,
}

impl MetricMap {
    pub fn new() -> Self {
        MetricMap::default()
    }

    /// Folds a single sample into the map.
    pub fn receive(&mut self, m: Metric) {
        let tags_key = m.tags.key();
        let Metric {
            name,
            value,
            tags,
            source,
            timestamp,
        } = m;
        match value {
            MetricValue::Counter(v) => {
                self.counters
                    .entry(name)
                    .or_default()
                    .entry(tags_key)
                    .and_modify(|c| {
                        c.value += v;
                        c.timestamp = c.timestamp.max(timestamp);
                    })
                    .or_insert_with(|| Counter::new(v, timestamp, source, tags));
            }
            MetricValue::Gauge(v) => {
                self.gauges
                    .entry(name)
                    .or_default()
                    .entry(tags_key)
                    .and_modify(|g| {
                        if timestamp >= g.timestamp {
                            g.value = v;
                            g.timestamp = timestamp;
                            g.source = source.clone();
                        }
                    })
                    .or_insert_with(|| Gauge {
                        value: v,
                        timestamp,
                        source,
                        tags,
                    });
            }
            MetricValue::Timer(v) => {
                let t = self
                    .timers
                    .entry(name)
                    .or_default()
                    .entry(tags_key)
                    .or_insert_with(|| Timer::new(timestamp, source, tags));
                t.values.push(v);
                t.count += 1;
                t.timestamp = t.timestamp.max(timestamp);
            }
            MetricValue::Set(s) => {
                let entry = self
                    .sets
                    .entry(name)
                    .or_default()
                    .entry(tags_key)
                    .or_insert_with(|| Set {
                        values: HashSet::new(),
                        timestamp,
                        source,
                        tags,
                    });
                entry.values.insert(s);
                entry.timestamp = entry.timestamp.max(timestamp);
            }
        }
    }

    /// Merges another map into this one with the same per-type semantics as
    /// `receive`: counters sum, gauges last-write-wins, timers concatenate,
    /// sets union.
    pub fn merge(&mut self, other: MetricMap) {
        for (name, by_key) in other.counters {
            let dest = self.counters.entry(name).or_default();
            for (key, c) in by_key {
                dest.entry(key)
                    .and_modify(|existing| {
                        existing.value += c.value;
                        existing.timestamp = existing.timestamp.max(c.timestamp);
                    })
                    .or_insert(c);
            }
        }
        for (name, by_key) in other.gauges {
            let dest = self.gauges.entry(name).or_default();
            for (key, g) in by_key {
                dest.entry(key)
                    .and_modify(|existing| {
                        if g.timestamp >= existing.timestamp {
                            *existing = g.clone();
                        }
                    })
                    .or_insert(g);
            }
        }
        for (name, by_key) in other.timers {
            let dest = self.timers.entry(name).or_default();
            for (key, t) in by_key {
                dest.entry(key)
                    .and_modify(|existing| {
                        existing.values.extend_from_slice(&t.values);
                        existing.count += t.count;
                        existing.timestamp = existing.timestamp.max(t.timestamp);
                    })
                    .or_insert(t);
            }
        }
        for (name, by_key) in other.sets {
            let dest = self.sets.entry(name).or_default();
            for (key, s) in by_key {
                dest.entry(key)
                    .and_modify(|existing| {
                        existing.values.extend(s.values.iter().cloned());
                        existing.timestamp = existing.timestamp.max(s.timestamp);
                    })
                    .or_insert(s);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
            && self.gauges.is_empty()
            && self.timers.is_empty()
            && self.sets.is_empty()
    }

    /// Flattens the map back into individual samples. Timers expand to one
    /// sample per raw value, sets to one sample per member.
    pub fn as_metrics(&self) -> Vec<Metric> {
        let mut out = Vec::new();
        for (name, by_key) in &self.counters {
            for c in by_key.values() {
                out.push(Metric::new(
                    name.clone(),
                    MetricValue::Counter(c.value),
                    c.tags.clone(),
                    c.source.clone(),
                    c.timestamp,
                ));
            }
        }
        for (name, by_key) in &self.gauges {
            for g in by_key.values() {
                out.push(Metric::new(
                    name.clone(),
                    MetricValue::Gauge(g.value),
                    g.tags.clone(),
                    g.source.clone(),
                    g.timestamp,
                ));
            }
        }
        for (name, by_key) in &self.timers {
            for t in by_key.values() {
                for v in &t.values {
                    out.push(Metric::new(
                        name.clone(),
                        MetricValue::Timer(*v),
                        t.tags.clone(),
                        t.source.clone(),
                        t.timestamp,
                    ));
                }
            }
        }
        for (name, by_key) in &self.sets {
            for s in by_key.values() {
                for v in &s.values {
                    out.push(Metric::new(
                        name.clone(),
                        MetricValue::Set(v.clone()),
                        s.tags.clone(),
                        s.source.clone(),
                        s.timestamp,
                    ));
                }
            }
        }
        out
    }

    /// Re-buckets every entry into `shards` smaller maps by the consistent
    /// hash of `(name, tags_key)`. Entries with the same identity always land
    /// on the same shard.
    pub fn split_by_shard(self, shards: usize) -> Vec<MetricMap> {
        let mut out: Vec<MetricMap> = (0..shards).map(|_| MetricMap::new()).collect();
        for (name, by_key) in self.counters {
            for (key, c) in by_key {
                let idx = shard_index(&name, &key, shards);
                out[idx]
                    .counters
                    .entry(name.clone())
                    .or_default()
                    .insert(key, c);
            }
        }
        for (name, by_key) in self.gauges {
            for (key, g) in by_key {
                let idx = shard_index(&name, &key, shards);
                out[idx]
                    .gauges
                    .entry(name.clone())
                    .or_default()
                    .insert(key, g);
            }
        }
        for (name, by_key) in self.timers {
            for (key, t) in by_key {
                let idx = shard_index(&name, &key, shards);
                out[idx]
                    .timers
                    .entry(name.clone())
                    .or_default()
                    .insert(key, t);
            }
        }
        for (name, by_key) in self.sets {
            for (key, s) in by_key {
                let idx = shard_index(&name, &key, shards);
                out[idx]
                    .sets
                    .entry(name.clone())
                    .or_default()
                    .insert(key, s);
            }
        }
        out
    }
}

/// Selects the aggregator shard for a metric identity. FNV-1a keeps the
/// placement stable across processes and runs, unlike the std hasher.
pub fn shard_index(name: &str, tags_key: &str, shards: usize) -> usize {
    debug_assert!(shards > 0);
    (fnv1a(name.as_bytes(), fnv1a(tags_key.as_bytes(), FNV_OFFSET)) % shards as u64) as usize
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(data: &[u8], seed: u64) -> u64 {
    let mut hash = seed;
    for &b in data {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter(name: &str, tags: &[&str], value: f64, ts: u64) -> Metric {
        Metric::new(
            name,
            MetricValue::Counter(value),
            Tags::from(tags),
            Source::Unknown,
            Nanotime(ts),
        )
    }

    fn gauge(name: &str, tags: &[&str], value: f64, ts: u64) -> Metric {
        Metric::new(
            name,
            MetricValue::Gauge(value),
            Tags::from(tags),
            Source::Unknown,
            Nanotime(ts),
        )
    }

    #[test]
    fn counters_sum_per_identity() {
        let mut mm = MetricMap::new();
        mm.receive(counter("c", &["a:1"], 3.0, 1));
        mm.receive(counter("c", &["a:1"], 7.0, 2));
        mm.receive(counter("c", &["a:2"], 5.0, 3));

        let by_key = &mm.counters["c"];
        assert_eq!(by_key["a:1"].value, 10.0);
        assert_eq!(by_key["a:1"].timestamp, Nanotime(2));
        assert_eq!(by_key["a:2"].value, 5.0);
    }

    #[test]
    fn gauges_last_write_wins_by_timestamp() {
        let mut mm = MetricMap::new();
        mm.receive(gauge("g", &["a:1"], 5.0, 10));
        mm.receive(gauge("g", &["a:1"], 9.0, 20));
        mm.receive(gauge("g", &["a:1"], 1.0, 15)); // older, ignored
        assert_eq!(mm.gauges["g"]["a:1"].value, 9.0);
    }

    #[test]
    fn gauge_equal_timestamp_last_arrival_wins() {
        let mut mm = MetricMap::new();
        mm.receive(gauge("g", &[], 5.0, 10));
        mm.receive(gauge("g", &[], 7.0, 10));
        assert_eq!(mm.gauges["g"][""].value, 7.0);
    }

    #[test]
    fn gauge_tag_order_collides() {
        let mut mm = MetricMap::new();
        mm.receive(gauge("g", &["b:2", "a:1"], 5.0, 1));
        mm.receive(gauge("g", &["a:1", "b:2"], 9.0, 2));
        assert_eq!(mm.gauges["g"].len(), 1);
        assert_eq!(mm.gauges["g"]["a:1,b:2"].value, 9.0);
    }

    #[test]
    fn sets_deduplicate() {
        let mut mm = MetricMap::new();
        for v in ["a", "b", "a"] {
            mm.receive(Metric::new(
                "s",
                MetricValue::Set(v.to_string()),
                Tags::new(),
                Source::Unknown,
                Nanotime(1),
            ));
        }
        assert_eq!(mm.sets["s"][""].values.len(), 2);
    }

    #[test]
    fn timers_concatenate_samples() {
        let mut mm = MetricMap::new();
        for v in [1.0, 2.0, 3.0] {
            mm.receive(Metric::new(
                "t",
                MetricValue::Timer(v),
                Tags::new(),
                Source::Unknown,
                Nanotime(1),
            ));
        }
        let t = &mm.timers["t"][""];
        assert_eq!(t.values, vec![1.0, 2.0, 3.0]);
        assert_eq!(t.count, 3);
    }

    #[test]
    fn merge_matches_receive_semantics() {
        let mut a = MetricMap::new();
        a.receive(counter("c", &[], 3.0, 1));
        a.receive(gauge("g", &[], 1.0, 5));

        let mut b = MetricMap::new();
        b.receive(counter("c", &[], 7.0, 2));
        b.receive(gauge("g", &[], 2.0, 9));

        a.merge(b);
        assert_eq!(a.counters["c"][""].value, 10.0);
        assert_eq!(a.gauges["g"][""].value, 2.0);
    }

    #[test]
    fn merge_gauge_keeps_newer_existing() {
        let mut a = MetricMap::new();
        a.receive(gauge("g", &[], 1.0, 9));
        let mut b = MetricMap::new();
        b.receive(gauge("g", &[], 2.0, 5));
        a.merge(b);
        assert_eq!(a.gauges["g"][""].value, 1.0);
    }

    #[test]
    fn as_metrics_round_trips_counts() {
        let mut mm = MetricMap::new();
        mm.receive(counter("c", &["a:1"], 3.0, 1));
        mm.receive(gauge("g", &[], 4.0, 1));
        for v in [1.0, 2.0] {
            mm.receive(Metric::new(
                "t",
                MetricValue::Timer(v),
                Tags::new(),
                Source::Unknown,
                Nanotime(1),
            ));
        }
        mm.receive(Metric::new(
            "s",
            MetricValue::Set("x".to_string()),
            Tags::new(),
            Source::Unknown,
            Nanotime(1),
        ));

        let metrics = mm.as_metrics();
        assert_eq!(metrics.len(), 5); // 1 counter + 1 gauge + 2 timer samples + 1 set member

        let mut rebuilt = MetricMap::new();
        for m in metrics {
            rebuilt.receive(m);
        }
        assert_eq!(rebuilt.counters["c"]["a:1"].value, 3.0);
        assert_eq!(rebuilt.timers["t"][""].values.len(), 2);
    }

    #[test]
    fn shard_index_is_deterministic_and_tag_order_insensitive() {
        let a = Tags::from(vec!["b:2".to_string(), "a:1".to_string()]);
        let b = Tags::from(vec!["a:1".to_string(), "b:2".to_string()]);
        for shards in [1, 2, 8, 16] {
            assert_eq!(
                shard_index("m", &a.key(), shards),
                shard_index("m", &b.key(), shards)
            );
        }
    }

    #[test]
    fn split_by_shard_covers_all_entries() {
        let mut mm = MetricMap::new();
        for i in 0..100 {
            mm.receive(counter(&format!("c{i}"), &[], 1.0, 1));
        }
        let shards = mm.split_by_shard(4);
        assert_eq!(shards.len(), 4);
        let total: usize = shards.iter().map(|s| s.counters.len()).sum();
        assert_eq!(total, 100);

        // Same identity must land on the same shard every time.
        let mut again = MetricMap::new();
        again.receive(counter("c42", &[], 1.0, 1));
        let placed: Vec<usize> = again
            .split_by_shard(4)
            .into_iter()
            .enumerate()
            .filter(|(_, s)| !s.is_empty())
            .map(|(i, _)| i)
            .collect();
        assert_eq!(placed.len(), 1);
        assert!(shards[placed[0]].counters.contains_key("c42"));
    }
}
