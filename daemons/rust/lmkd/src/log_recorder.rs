// Copyright (c) The lmk Authors.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use anyhow::Context;
use anyhow::Result;
use log::info;
use metrics::Counter;
use metrics::Gauge;
use metrics::Histogram;
use metrics::Key;
use metrics::KeyName;
use metrics::Metadata;
use metrics::Recorder;
use metrics::SharedString;
use metrics::Unit;
use metrics_util::registry::AtomicStorage;
use metrics_util::registry::Registry;

/// Builds a [`LogRecorder`] and installs it as the global recorder.
///
/// ```ignore
/// LogRecorderBuilder::new()
///     .with_reporting_interval(Duration::from_secs(10))
///     .install(shutdown.clone())?;
/// ```
pub struct LogRecorderBuilder {
    reporting_interval: Duration,
}

impl LogRecorderBuilder {
    pub fn new() -> LogRecorderBuilder {
        Self {
            reporting_interval: Duration::from_secs(3),
        }
    }

    pub fn with_reporting_interval(mut self, interval: Duration) -> Self {
        self.reporting_interval = interval;
        self
    }

    /// Install as the global recorder. The reporting thread exits once
    /// `shutdown` is set.
    pub fn install(self, shutdown: Arc<AtomicBool>) -> Result<()> {
        let recorder = LogRecorder {
            registry: Arc::new(Registry::<Key, AtomicStorage>::atomic()),
        };
        recorder.start(self.reporting_interval, shutdown)?;
        metrics::set_global_recorder(recorder)
            .context("Failed to install the log metrics recorder")?;
        Ok(())
    }
}

/// Keeps every metric in an in-memory registry and logs them all at a fixed
/// interval from a background thread.
struct LogRecorder {
    registry: Arc<Registry<Key, AtomicStorage>>,
}

impl Recorder for LogRecorder {
    fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
        self.registry
            .get_or_create_counter(key, |c| c.clone().into())
    }

    fn register_gauge(&self, key: &Key, _: &Metadata<'_>) -> Gauge {
        self.registry.get_or_create_gauge(key, |g| g.clone().into())
    }

    fn register_histogram(&self, key: &Key, _: &Metadata<'_>) -> Histogram {
        self.registry
            .get_or_create_histogram(key, |h: &Arc<metrics_util::AtomicBucket<f64>>| {
                h.clone().into()
            })
    }
}

impl LogRecorder {
    fn start(&self, reporting_interval: Duration, shutdown: Arc<AtomicBool>) -> Result<()> {
        let registry = self.registry.clone();

        thread::Builder::new()
            .name("lmk-metrics".into())
            .spawn(move || {
                let mut prev_counter_values: HashMap<Key, u64> = HashMap::new();
                let mut prev_instant = Instant::now();

                while !shutdown.load(Relaxed) {
                    thread::sleep(reporting_interval);

                    let period_secs = prev_instant.elapsed().as_secs_f64();
                    prev_instant = Instant::now();

                    let mut lines = counter_lines(&registry, &mut prev_counter_values, period_secs);
                    lines.extend(gauge_lines(&registry));
                    lines.extend(histogram_lines(&registry));
                    for line in lines {
                        info!("{}", line);
                    }
                }
            })
            .context("Failed to spawn metrics reporter")?;
        Ok(())
    }
}

fn key_label(key: &Key) -> String {
    let mut name = key.name().to_string();
    for label in key.labels() {
        name.push_str(&format!(" {}={}", label.key(), label.value()));
    }
    name
}

fn counter_lines(
    registry: &Registry<Key, AtomicStorage>,
    prev_counter_values: &mut HashMap<Key, u64>,
    period_secs: f64,
) -> Vec<String> {
    let handles = registry.get_counter_handles();

    // Labelled series of the same counter are reported under one total.
    let mut grouped: BTreeMap<String, Vec<(Key, u64)>> = BTreeMap::new();
    for (key, counter) in handles.iter() {
        grouped
            .entry(key.name().to_string())
            .or_default()
            .push((key.clone(), counter.load(Relaxed)));
    }

    let mut lines = Vec::new();
    if !grouped.is_empty() {
        lines.push("Counters:".to_string());
    }
    for (name, mut values) in grouped {
        let rate = |key: &Key, value: u64| {
            let prev = prev_counter_values.get(key).copied().unwrap_or(0);
            if period_secs > 0.0 {
                value.saturating_sub(prev) as f64 / period_secs
            } else {
                0.0
            }
        };

        let total: u64 = values.iter().map(|(_, v)| *v).sum();
        let total_rate: f64 = values.iter().map(|(k, v)| rate(k, *v)).sum();
        lines.push(format!("  {}: {} [{:.1}/s]", name, total, total_rate));

        if values.len() > 1 {
            values.sort_by(|a, b| b.1.cmp(&a.1));
            for (key, value) in &values {
                let percentage = if total == 0 {
                    0.0
                } else {
                    (*value as f64 / total as f64) * 100.0
                };
                lines.push(format!(
                    "    {}: {} ({:.1}%) [{:.1}/s]",
                    key_label(key),
                    value,
                    percentage,
                    rate(key, *value)
                ));
            }
        }
        for (key, value) in values {
            prev_counter_values.insert(key, value);
        }
    }
    lines
}

fn gauge_lines(registry: &Registry<Key, AtomicStorage>) -> Vec<String> {
    let handles = registry.get_gauge_handles();
    let mut keys: Vec<&Key> = handles.keys().collect();
    keys.sort();

    let mut lines = Vec::new();
    if !keys.is_empty() {
        lines.push("Gauges:".to_string());
    }
    for key in keys {
        if let Some(gauge) = handles.get(key) {
            // Stored as raw f64 bits.
            let value = f64::from_bits(gauge.load(Relaxed));
            lines.push(format!("  {}: {:.2}", key_label(key), value));
        }
    }
    lines
}

fn histogram_lines(registry: &Registry<Key, AtomicStorage>) -> Vec<String> {
    let handles = registry.get_histogram_handles();
    let mut keys: Vec<&Key> = handles.keys().collect();
    keys.sort();

    let mut lines = Vec::new();
    if !keys.is_empty() {
        lines.push("Histograms:".to_string());
    }
    for key in keys {
        let Some(histogram) = handles.get(key) else {
            continue;
        };
        let mut sum = 0.0;
        let mut count = 0u64;
        let mut min = f64::MAX;
        let mut max = f64::MIN;

        // Drained on every report so the buckets stay bounded.
        histogram.clear_with(|elements| {
            for element in elements {
                sum += element;
                count += 1;
                min = min.min(*element);
                max = max.max(*element);
            }
        });
        if count == 0 {
            continue;
        }
        lines.push(format!(
            "  {}: avg={:.2} min={:.2} max={:.2}",
            key_label(key),
            sum / count as f64,
            min,
            max
        ));
    }
    lines
}
