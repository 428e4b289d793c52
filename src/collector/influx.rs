//! Time-series store collector.
//!
//! Speaks InfluxQL through the [`SeriesStore`] seam and normalizes the
//! store's series/column/row result shape into canonical measurements.
//! Host discovery comes from the `host` tag; one metric is produced per
//! series and `type_instance`, keyed `"{series}/{type_instance}"`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::config::InfluxConfig;
use crate::error::CollectorError;
use crate::metric::{HostMeasurement, Measurement, MetricValue};
use crate::types::Host;

use super::Collector;

/// Result of one query: zero or more named series.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryResult {
    /// Series returned by the store.
    #[serde(default)]
    pub series: Vec<Series>,
}

/// One series of a query result.
#[derive(Debug, Clone, Deserialize)]
pub struct Series {
    /// Series (measurement) name.
    pub name: String,
    /// Column names, positionally matching each row.
    pub columns: Vec<String>,
    /// Rows of raw JSON values.
    pub values: Vec<Vec<serde_json::Value>>,
}

impl Series {
    fn column(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }
}

/// Query executor over the time-series store.
#[async_trait::async_trait]
pub trait SeriesStore: Send + Sync {
    /// Run one query against the configured database.
    async fn query(&self, q: &str) -> Result<QueryResult, CollectorError>;
}

/// Collector over a collectd-fed time-series store.
pub struct InfluxCollector<S> {
    store: S,
    config: InfluxConfig,
    // Discovery cache; refreshed on every host_list call.
    known_hosts: Mutex<HashMap<String, Host>>,
}

impl<S: SeriesStore> InfluxCollector<S> {
    /// Create a collector over `store`.
    pub fn new(store: S, config: InfluxConfig) -> Self {
        Self {
            store,
            config,
            known_hosts: Mutex::new(HashMap::new()),
        }
    }

    async fn query_guarded(&self, q: &str) -> Option<QueryResult> {
        match tokio::time::timeout(self.config.timeout, self.store.query(q)).await {
            Ok(Ok(result)) => Some(result),
            Ok(Err(e)) => {
                warn!(query = q, error = %e, "store query failed");
                None
            }
            Err(_) => {
                warn!(query = q, "store query timed out");
                None
            }
        }
    }

    /// Single scalar from the first row of the first series; `None` when
    /// the result is empty or non-numeric.
    async fn query_scalar(&self, q: &str, column: &str) -> Option<f64> {
        let result = self.query_guarded(q).await?;
        let series = result.series.first()?;
        let idx = series.column(column)?;
        let row = series.values.first()?;
        value_as_f64(row.get(idx)?)
    }

    /// Names of all measurements in the database.
    async fn measurement_names(&self) -> Vec<String> {
        let Some(result) = self.query_guarded("SHOW MEASUREMENTS").await else {
            return Vec::new();
        };
        let mut names = Vec::new();
        for series in &result.series {
            let Some(idx) = series.column("name") else {
                continue;
            };
            for row in &series.values {
                if let Some(name) = row.get(idx).and_then(value_as_str) {
                    names.push(name.to_string());
                }
            }
        }
        names
    }
}

#[async_trait::async_trait]
impl<S: SeriesStore> Collector for InfluxCollector<S> {
    async fn host_list(&self) -> Vec<Host> {
        // Every series carries a `host` tag; its distinct values are the
        // hosts the store has seen.
        let Some(result) = self
            .query_guarded("SHOW TAG VALUES WITH KEY = \"host\"")
            .await
        else {
            return Vec::new();
        };
        let mut hosts: HashMap<String, Host> = HashMap::new();
        for series in &result.series {
            let Some(idx) = series.column("value") else {
                continue;
            };
            for row in &series.values {
                let Some(name) = row.get(idx).and_then(value_as_str) else {
                    continue;
                };
                hosts
                    .entry(name.to_string())
                    .or_insert_with(|| Host::new(digits_of(name), name));
            }
        }
        let mut cache = self.known_hosts.lock().unwrap_or_else(|e| e.into_inner());
        *cache = hosts.clone();
        hosts.into_values().collect()
    }

    async fn host_by_name(&self, name: &str) -> Option<Host> {
        {
            let cache = self.known_hosts.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(host) = cache.get(name) {
                return Some(host.clone());
            }
        }
        self.host_list().await;
        let cache = self.known_hosts.lock().unwrap_or_else(|e| e.into_inner());
        cache.get(name).cloned()
    }

    async fn host_measurement(&self, host: &Host) -> Option<HostMeasurement> {
        let names = self.measurement_names().await;
        if names.is_empty() {
            return None;
        }
        let q = format!(
            "SELECT last(value), type_instance FROM {} WHERE host = '{}'",
            names.join(", "),
            host.name
        );
        let result = self.query_guarded(&q).await?;

        let mut measurement = Measurement::new(0);
        let mut newest = 0i64;
        for series in &result.series {
            let (Some(time_idx), Some(last_idx)) =
                (series.column("time"), series.column("last"))
            else {
                continue;
            };
            let instance_idx = series.column("type_instance");
            for row in &series.values {
                let Some(clock) = row
                    .get(time_idx)
                    .and_then(value_as_str)
                    .and_then(parse_rfc3339_secs)
                else {
                    continue;
                };
                let Some(value) = row.get(last_idx).and_then(value_as_f64) else {
                    continue;
                };
                let instance = instance_idx
                    .and_then(|i| row.get(i))
                    .and_then(value_as_str)
                    .unwrap_or("");
                let key = if instance.is_empty() {
                    series.name.clone()
                } else {
                    format!("{}/{}", series.name, instance)
                };
                newest = newest.max(clock);
                measurement.add_metric(MetricValue::keyed(&key, value.to_string(), clock));
            }
        }
        if measurement.metric_count() == 0 {
            return None;
        }
        measurement.set_clock(newest);
        Some(HostMeasurement {
            host: host.clone(),
            measurement,
        })
    }

    async fn lowest_power(&self, host: &Host) -> f64 {
        let q = format!(
            "SELECT min(value) FROM power_value WHERE host = '{}'",
            host.name
        );
        self.query_scalar(&q, "min").await.unwrap_or(0.0)
    }

    async fn highest_power(&self, host: &Host) -> f64 {
        let q = format!(
            "SELECT max(value) FROM power_value WHERE host = '{}'",
            host.name
        );
        self.query_scalar(&q, "max").await.unwrap_or(0.0)
    }

    async fn cpu_utilisation(&self, host: &Host, window: Duration) -> f64 {
        if window.is_zero() {
            return 0.0;
        }
        let q = format!(
            "SELECT mean(value) FROM cpu_value WHERE host = '{}' AND type_instance = 'idle' AND time > now() - {}s",
            host.name,
            window.as_secs()
        );
        let Some(idle) = self.query_scalar(&q, "mean").await else {
            return 0.0;
        };
        if !idle.is_finite() {
            return 0.0;
        }
        (1.0 - idle / 100.0).clamp(0.0, 1.0)
    }
}

/// Numeric id embedded in a host name, e.g. `ns54.bullx` -> 54; 0 when the
/// name carries no digits.
fn digits_of(name: &str) -> i64 {
    let digits: String = name.chars().filter(char::is_ascii_digit).collect();
    digits.parse().unwrap_or(0)
}

fn value_as_f64(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn value_as_str(value: &serde_json::Value) -> Option<&str> {
    value.as_str()
}

fn parse_rfc3339_secs(s: &str) -> Option<i64> {
    chrono::DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.timestamp())
}
