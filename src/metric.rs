//! Canonical measurement model.
//!
//! Every back-end collector normalizes its native output into these types:
//!
//! - [`MetricValue`]: one named, timestamped, string-encoded sample
//! - [`Measurement`]: a timestamped bag of metric values for one entity,
//!   with last-writer-wins conflict resolution by sample clock
//! - [`HostMeasurement`] / [`ApplicationMeasurement`]: a measurement bound
//!   to the entity it describes
//!
//! Values are kept in their source-native string representation and parsed
//! to `f64` on demand; percentages are stored in the 0–100 range and only
//! converted to 0–1 fractions at the public collector boundary.

use std::collections::HashMap;

use crate::types::{ApplicationOnHost, Host};

/// Canonical metric keys shared across collectors.
///
/// Key naming follows the `category.detail` convention; collectors that
/// ingest foreign keys verbatim (the relational store, the generic
/// scheduler tokens) pass those through unchanged.
pub mod keys {
    /// Spot power draw in watts.
    pub const POWER: &str = "power";
    /// Cumulative energy in joules, meter-reading style.
    pub const ENERGY: &str = "energy";
    /// Spot CPU usage as a 0–100 percentage.
    pub const CPU_SPOT_USAGE: &str = "cpu.spot-usage";
    /// Spot CPU idle as a 0–100 percentage.
    pub const CPU_IDLE: &str = "cpu.idle";
    /// Physical core count.
    pub const CPU_COUNT: &str = "cpu.count";
    /// Available memory in megabytes.
    pub const MEMORY_AVAILABLE: &str = "memory.available";
    /// Total memory in megabytes.
    pub const MEMORY_TOTAL: &str = "memory.total";
    /// Total disk in gigabytes.
    pub const DISK_TOTAL: &str = "disk.total";
    /// Whether any accelerator is attached ("true"/"false").
    pub const ACCELERATOR_PRESENT: &str = "accelerator.present";
    /// Whether a GPU is attached ("true"/"false").
    pub const GPU_PRESENT: &str = "gpu.present";
    /// GPU model name from the scheduler GRES string.
    pub const GPU_NAME: &str = "gpu.name";
    /// GPU count from the scheduler GRES string.
    pub const GPU_COUNT: &str = "gpu.count";
    /// GPUs currently allocated.
    pub const GPU_USED: &str = "gpu.used";
    /// Whether a MIC is attached ("true"/"false").
    pub const MIC_PRESENT: &str = "mic.present";
    /// MIC model name from the scheduler GRES string.
    pub const MIC_NAME: &str = "mic.name";
    /// MIC count from the scheduler GRES string.
    pub const MIC_COUNT: &str = "mic.count";
    /// MICs currently allocated.
    pub const MIC_USED: &str = "mic.used";
    /// Count of applications running on the entity.
    pub const APPS_RUNNING: &str = "apps.running";
    /// Completed executions of an application implementation.
    pub const APP_EXECUTIONS: &str = "app.executions";
    /// Minimum observed execution time of an application, in ms.
    pub const APP_TIME_MIN: &str = "app.time.min";
    /// Mean observed execution time of an application, in ms.
    pub const APP_TIME_AVG: &str = "app.time.avg";
    /// Maximum observed execution time of an application, in ms.
    pub const APP_TIME_MAX: &str = "app.time.max";
}

/// One named, timestamped sample in its source-native representation.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricValue {
    key: String,
    name: String,
    raw: String,
    clock: i64,
}

impl MetricValue {
    /// Create a new metric value. `clock` is unix seconds at sample time.
    pub fn new(
        key: impl Into<String>,
        name: impl Into<String>,
        raw: impl Into<String>,
        clock: i64,
    ) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            raw: raw.into(),
            clock,
        }
    }

    /// Shorthand for metrics whose key doubles as the display name.
    pub fn keyed(key: &str, raw: impl Into<String>, clock: i64) -> Self {
        Self::new(key, key, raw, clock)
    }

    /// Stable identifier used for lookup and merging.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Human-readable name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Source-native string representation.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Unix seconds at which the sample was taken.
    pub fn clock(&self) -> i64 {
        self.clock
    }

    /// Numeric value parsed on demand; NaN when the raw form is not a number.
    pub fn value(&self) -> f64 {
        self.raw.trim().parse::<f64>().unwrap_or(f64::NAN)
    }

    /// Whether the numeric form is neither NaN nor infinite.
    pub fn is_finite(&self) -> bool {
        self.value().is_finite()
    }
}

/// A timestamped bag of metric values for one entity.
///
/// Inserting under an existing key keeps whichever value has the greater
/// sample clock; ties keep the existing value. Values with an empty raw
/// representation are never retained.
#[derive(Debug, Clone, Default)]
pub struct Measurement {
    clock: i64,
    metrics: HashMap<String, MetricValue>,
}

impl Measurement {
    /// Create an empty measurement stamped at `clock` (unix seconds).
    pub fn new(clock: i64) -> Self {
        Self {
            clock,
            metrics: HashMap::new(),
        }
    }

    /// Overall record timestamp in unix seconds.
    pub fn clock(&self) -> i64 {
        self.clock
    }

    /// Set the overall record timestamp.
    pub fn set_clock(&mut self, clock: i64) {
        self.clock = clock;
    }

    /// Add a metric under last-writer-wins rules.
    ///
    /// Empty raw values are discarded. When the key already exists the new
    /// value replaces the old one only if its clock is strictly greater.
    pub fn add_metric(&mut self, value: MetricValue) {
        if value.raw().is_empty() {
            return;
        }
        match self.metrics.get(value.key()) {
            Some(existing) if value.clock() <= existing.clock() => {}
            _ => {
                self.metrics.insert(value.key().to_string(), value);
            }
        }
    }

    /// Add several metrics under the same rules.
    pub fn add_metrics<I: IntoIterator<Item = MetricValue>>(&mut self, values: I) {
        for value in values {
            self.add_metric(value);
        }
    }

    /// Remove a metric by key; a no-op when the key is absent.
    pub fn delete_metric(&mut self, key: &str) {
        self.metrics.remove(key);
    }

    /// Look up a metric by key.
    pub fn metric(&self, key: &str) -> Option<&MetricValue> {
        self.metrics.get(key)
    }

    /// Whether a metric exists under `key`.
    pub fn metric_exists(&self, key: &str) -> bool {
        self.metrics.contains_key(key)
    }

    /// Number of metrics stored.
    pub fn metric_count(&self) -> usize {
        self.metrics.len()
    }

    /// Keys of all stored metrics.
    pub fn metric_keys(&self) -> impl Iterator<Item = &str> {
        self.metrics.keys().map(String::as_str)
    }

    /// All stored metric values.
    pub fn metrics(&self) -> impl Iterator<Item = &MetricValue> {
        self.metrics.values()
    }

    /// Spread between the newest and oldest metric clock, in seconds.
    ///
    /// Indicates how contemporaneous the record is; 0 when fewer than two
    /// metrics are stored.
    pub fn max_clock_difference(&self) -> i64 {
        let mut clocks = self.metrics.values().map(MetricValue::clock);
        let Some(first) = clocks.next() else {
            return 0;
        };
        let (lo, hi) = clocks.fold((first, first), |(lo, hi), c| (lo.min(c), hi.max(c)));
        hi - lo
    }

    /// Absolute difference between the record clock and `time`, in seconds.
    pub fn clock_difference(&self, time: i64) -> i64 {
        (self.clock - time).abs()
    }

    /// Whether the record clock is within `tolerance` seconds of `time`.
    pub fn is_contemporary(&self, time: i64, tolerance: i64) -> bool {
        self.clock_difference(time) <= tolerance
    }

    /// Remove every metric whose clock differs from the record clock by
    /// more than `tolerance` seconds. Returns the count removed.
    pub fn clean_stale_metrics(&mut self, tolerance: i64) -> usize {
        let clock = self.clock;
        let before = self.metrics.len();
        self.metrics
            .retain(|_, v| (v.clock() - clock).abs() <= tolerance);
        before - self.metrics.len()
    }

    /// Merge another measurement into this one.
    ///
    /// Each metric is added under the standard last-writer-wins rule and the
    /// record clock is raised to the maximum of the two.
    pub fn merge(&mut self, other: &Measurement) {
        for value in other.metrics() {
            self.add_metric(value.clone());
        }
        if other.clock > self.clock {
            self.clock = other.clock;
        }
    }

    fn metric_value(&self, key: &str) -> f64 {
        self.metric(key).map(MetricValue::value).unwrap_or(0.0)
    }

    /// Spot power draw in watts; 0.0 when not reported.
    pub fn power(&self) -> f64 {
        self.metric_value(keys::POWER)
    }

    /// Cumulative energy in joules; 0.0 when not reported.
    pub fn energy(&self) -> f64 {
        self.metric_value(keys::ENERGY)
    }

    /// Spot CPU utilisation as a 0–1 fraction; 0.0 when not reported.
    pub fn cpu_utilisation(&self) -> f64 {
        if self.metric_exists(keys::CPU_SPOT_USAGE) {
            return self.metric_value(keys::CPU_SPOT_USAGE) / 100.0;
        }
        if self.metric_exists(keys::CPU_IDLE) {
            return 1.0 - self.metric_value(keys::CPU_IDLE) / 100.0;
        }
        0.0
    }

    /// Spot CPU idle as a 0–1 fraction; 0.0 when not reported.
    pub fn cpu_idle(&self) -> f64 {
        if self.metric_exists(keys::CPU_IDLE) {
            return self.metric_value(keys::CPU_IDLE) / 100.0;
        }
        if self.metric_exists(keys::CPU_SPOT_USAGE) {
            return 1.0 - self.metric_value(keys::CPU_SPOT_USAGE) / 100.0;
        }
        0.0
    }

    /// Available memory in megabytes; 0.0 when not reported.
    pub fn memory_available_mb(&self) -> f64 {
        self.metric_value(keys::MEMORY_AVAILABLE)
    }

    /// Total memory in megabytes; 0.0 when not reported.
    pub fn memory_total_mb(&self) -> f64 {
        self.metric_value(keys::MEMORY_TOTAL)
    }

    /// Used memory in megabytes, derived from total minus available.
    pub fn memory_used_mb(&self) -> f64 {
        self.memory_total_mb() - self.memory_available_mb()
    }
}

/// A measurement bound to the physical host it describes.
#[derive(Debug, Clone)]
pub struct HostMeasurement {
    /// The host the record is for.
    pub host: Host,
    /// The metric record itself.
    pub measurement: Measurement,
}

impl HostMeasurement {
    /// Create an empty host measurement stamped at `clock`.
    pub fn new(host: Host, clock: i64) -> Self {
        Self {
            host,
            measurement: Measurement::new(clock),
        }
    }

    /// Record timestamp in unix seconds.
    pub fn clock(&self) -> i64 {
        self.measurement.clock()
    }

    /// See [`Measurement::add_metric`].
    pub fn add_metric(&mut self, value: MetricValue) {
        self.measurement.add_metric(value);
    }

    /// See [`Measurement::metric`].
    pub fn metric(&self, key: &str) -> Option<&MetricValue> {
        self.measurement.metric(key)
    }

    /// See [`Measurement::metric_exists`].
    pub fn metric_exists(&self, key: &str) -> bool {
        self.measurement.metric_exists(key)
    }

    /// See [`Measurement::delete_metric`].
    pub fn delete_metric(&mut self, key: &str) {
        self.measurement.delete_metric(key);
    }

    /// See [`Measurement::merge`].
    pub fn merge(&mut self, other: &Measurement) {
        self.measurement.merge(other);
    }

    /// Spot power draw in watts; 0.0 when not reported.
    pub fn power(&self) -> f64 {
        self.measurement.power()
    }

    /// Cumulative energy in joules; 0.0 when not reported.
    pub fn energy(&self) -> f64 {
        self.measurement.energy()
    }
}

/// A measurement bound to the application it describes.
#[derive(Debug, Clone)]
pub struct ApplicationMeasurement {
    /// The application the record is for.
    pub application: ApplicationOnHost,
    /// The metric record itself.
    pub measurement: Measurement,
}

impl ApplicationMeasurement {
    /// Create an empty application measurement stamped at `clock`.
    pub fn new(application: ApplicationOnHost, clock: i64) -> Self {
        Self {
            application,
            measurement: Measurement::new(clock),
        }
    }

    /// See [`Measurement::add_metric`].
    pub fn add_metric(&mut self, value: MetricValue) {
        self.measurement.add_metric(value);
    }

    /// See [`Measurement::merge`].
    pub fn merge(&mut self, other: &Measurement) {
        self.measurement.merge(other);
    }
}
