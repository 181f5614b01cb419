//! MetricsRegistry port
//!
//! Registries are constructed explicitly and passed to storage and runners;
//! there is no process-wide default registry.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

pub type Tags<'a> = &'a [(&'a str, &'a str)];

pub trait MetricsRegistry: Send + Sync {
    fn counter_add(&self, name: &str, tags: Tags<'_>, delta: u64);

    fn gauge_add(&self, name: &str, tags: Tags<'_>, delta: i64);

    fn record_duration(&self, name: &str, tags: Tags<'_>, value: Duration);
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsRegistry for NoopMetrics {
    fn counter_add(&self, _name: &str, _tags: Tags<'_>, _delta: u64) {}

    fn gauge_add(&self, _name: &str, _tags: Tags<'_>, _delta: i64) {}

    fn record_duration(&self, _name: &str, _tags: Tags<'_>, _value: Duration) {}
}

/// `name{k=v,...}` with tags sorted by key.
fn series_key(name: &str, tags: Tags<'_>) -> String {
    if tags.is_empty() {
        return name.to_string();
    }
    let mut sorted: Vec<_> = tags.to_vec();
    sorted.sort();
    let rendered: Vec<String> = sorted.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!("{name}{{{}}}", rendered.join(","))
}

#[derive(Debug, Default)]
struct Series {
    counters: BTreeMap<String, u64>,
    gauges: BTreeMap<String, i64>,
    durations: BTreeMap<String, Vec<Duration>>,
}

/// Keeps every series in memory so tests and the CLI can read them back.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    series: Mutex<Series>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_series<R>(&self, f: impl FnOnce(&mut Series) -> R) -> R {
        let mut series = self.series.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut series)
    }

    pub fn counter(&self, name: &str, tags: Tags<'_>) -> u64 {
        let key = series_key(name, tags);
        self.with_series(|s| s.counters.get(&key).copied().unwrap_or(0))
    }

    pub fn gauge(&self, name: &str, tags: Tags<'_>) -> i64 {
        let key = series_key(name, tags);
        self.with_series(|s| s.gauges.get(&key).copied().unwrap_or(0))
    }

    pub fn durations(&self, name: &str, tags: Tags<'_>) -> Vec<Duration> {
        let key = series_key(name, tags);
        self.with_series(|s| s.durations.get(&key).cloned().unwrap_or_default())
    }

    /// Flat dump of counters and gauges, keyed by rendered series name.
    pub fn snapshot(&self) -> BTreeMap<String, i64> {
        self.with_series(|s| {
            let mut out: BTreeMap<String, i64> = s
                .counters
                .iter()
                .map(|(k, v)| (k.clone(), i64::try_from(*v).unwrap_or(i64::MAX)))
                .collect();
            out.extend(s.gauges.iter().map(|(k, v)| (k.clone(), *v)));
            out
        })
    }
}

impl MetricsRegistry for InMemoryMetrics {
    fn counter_add(&self, name: &str, tags: Tags<'_>, delta: u64) {
        let key = series_key(name, tags);
        self.with_series(|s| *s.counters.entry(key).or_default() += delta);
    }

    fn gauge_add(&self, name: &str, tags: Tags<'_>, delta: i64) {
        let key = series_key(name, tags);
        self.with_series(|s| *s.gauges.entry(key).or_default() += delta);
    }

    fn record_duration(&self, name: &str, tags: Tags<'_>, value: Duration) {
        let key = series_key(name, tags);
        self.with_series(|s| s.durations.entry(key).or_default().push(value));
    }
}
