//! Relational monitoring-store collector.
//!
//! Reads a Zabbix-style schema through the [`SqlStore`] seam: an entity
//! inventory, a latest-value item table per entity, and numeric history.
//! The store decides host versus virtual machine purely by name, using the
//! configured prefix filter.
//!
//! Metric keys arrive as the store's own item keys and are passed through
//! verbatim, except memory and disk totals which are normalized from bytes
//! to the canonical MB/GB units at ingestion.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::warn;

use crate::config::ZabbixConfig;
use crate::error::CollectorError;
use crate::metric::{HostMeasurement, Measurement, MetricValue, keys};
use crate::types::{DeployedVm, Entity, Host};

use super::Collector;

/// Window behind "now" searched for power extremes.
const POWER_HISTORY_WINDOW: Duration = Duration::from_secs(600);

const BYTES_PER_MB: f64 = 1_048_576.0;
const BYTES_PER_GB: f64 = 1_073_741_824.0;

/// One row of the store's entity inventory.
#[derive(Debug, Clone)]
pub struct EntityRow {
    /// Store-assigned entity id.
    pub id: i64,
    /// Entity name.
    pub name: String,
    /// Whether the store currently marks the entity reachable.
    pub available: bool,
}

/// One row of the store's latest-value item table.
#[derive(Debug, Clone)]
pub struct ItemRow {
    /// Store-assigned item id.
    pub item_id: i64,
    /// Unix seconds at which the value was recorded.
    pub clock: i64,
    /// Human-readable item name.
    pub name: String,
    /// Item key, used as the metric key.
    pub key: String,
    /// Recorded value in the store's native string form.
    pub value: String,
}

/// Query executor over the relational monitoring store.
#[async_trait::async_trait]
pub trait SqlStore: Send + Sync {
    /// Full entity inventory.
    async fn entity_rows(&self) -> Result<Vec<EntityRow>, CollectorError>;

    /// Latest recorded value for every item of one entity.
    async fn latest_item_rows(&self, entity_id: i64) -> Result<Vec<ItemRow>, CollectorError>;

    /// Numeric history of one item key between `start` and `end`
    /// (unix seconds, inclusive).
    async fn history_values(
        &self,
        entity_id: i64,
        key: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<f64>, CollectorError>;
}

/// Collector over a relational monitoring store.
pub struct ZabbixCollector<S> {
    store: S,
    config: ZabbixConfig,
}

impl<S: SqlStore> ZabbixCollector<S> {
    /// Create a collector over `store`.
    pub fn new(store: S, config: ZabbixConfig) -> Self {
        Self { store, config }
    }

    /// Whether a name belongs to a physical host under the prefix filter.
    fn is_host_name(&self, name: &str) -> bool {
        name.starts_with(&self.config.filter_begins) == self.config.filter_is_host
    }

    async fn entity_rows_guarded(&self) -> Vec<EntityRow> {
        match tokio::time::timeout(self.config.timeout, self.store.entity_rows()).await {
            Ok(Ok(rows)) => rows,
            Ok(Err(e)) => {
                warn!(error = %e, "entity inventory query failed");
                Vec::new()
            }
            Err(_) => {
                warn!("entity inventory query timed out");
                Vec::new()
            }
        }
    }

    async fn item_rows_guarded(&self, entity_id: i64) -> Vec<ItemRow> {
        match tokio::time::timeout(self.config.timeout, self.store.latest_item_rows(entity_id))
            .await
        {
            Ok(Ok(rows)) => rows,
            Ok(Err(e)) => {
                warn!(entity_id, error = %e, "latest item query failed");
                Vec::new()
            }
            Err(_) => {
                warn!(entity_id, "latest item query timed out");
                Vec::new()
            }
        }
    }

    async fn history_guarded(&self, entity_id: i64, key: &str, start: i64, end: i64) -> Vec<f64> {
        match tokio::time::timeout(
            self.config.timeout,
            self.store.history_values(entity_id, key, start, end),
        )
        .await
        {
            Ok(Ok(values)) => values,
            Ok(Err(e)) => {
                warn!(entity_id, key, error = %e, "history query failed");
                Vec::new()
            }
            Err(_) => {
                warn!(entity_id, key, "history query timed out");
                Vec::new()
            }
        }
    }

    /// Build a host from an inventory row and fill in capacity fields from
    /// its latest items.
    async fn describe_host(&self, row: &EntityRow) -> Host {
        let mut host = Host::new(row.id, row.name.clone());
        host.available = row.available;
        for item in self.item_rows_guarded(row.id).await {
            let Ok(value) = item.value.trim().parse::<f64>() else {
                continue;
            };
            match item.key.as_str() {
                keys::MEMORY_TOTAL => host.ram_mb = (value / BYTES_PER_MB) as u64,
                keys::DISK_TOTAL => host.disk_gb = value / BYTES_PER_GB,
                keys::CPU_COUNT => host.core_count = value as u32,
                _ => {}
            }
        }
        host
    }

    /// Normalize a latest-value row to a canonical metric.
    fn row_to_metric(item: &ItemRow) -> MetricValue {
        let raw = match item.key.as_str() {
            keys::MEMORY_TOTAL | keys::MEMORY_AVAILABLE => item
                .value
                .trim()
                .parse::<f64>()
                .map(|v| format!("{}", v / BYTES_PER_MB))
                .unwrap_or_else(|_| item.value.clone()),
            keys::DISK_TOTAL => item
                .value
                .trim()
                .parse::<f64>()
                .map(|v| format!("{}", v / BYTES_PER_GB))
                .unwrap_or_else(|_| item.value.clone()),
            _ => item.value.clone(),
        };
        MetricValue::new(item.key.clone(), item.name.clone(), raw, item.clock)
    }

    async fn mean_history(&self, host: &Host, key: &str, window: Duration) -> Option<f64> {
        let now = now_secs();
        let values = self
            .history_guarded(host.id, key, now - window.as_secs() as i64, now)
            .await;
        if values.is_empty() {
            return None;
        }
        // Non-finite samples count as zero rather than poisoning the mean.
        let sum: f64 = values.iter().map(|v| if v.is_finite() { *v } else { 0.0 }).sum();
        Some(sum / values.len() as f64)
    }
}

#[async_trait::async_trait]
impl<S: SqlStore> Collector for ZabbixCollector<S> {
    async fn host_list(&self) -> Vec<Host> {
        let rows = self.entity_rows_guarded().await;
        let mut hosts = Vec::new();
        for row in &rows {
            if !self.is_host_name(&row.name) {
                continue;
            }
            if self.config.only_available_hosts && !row.available {
                continue;
            }
            hosts.push(self.describe_host(row).await);
        }
        hosts
    }

    async fn host_by_name(&self, name: &str) -> Option<Host> {
        if !self.is_host_name(name) {
            return None;
        }
        let row = self
            .entity_rows_guarded()
            .await
            .into_iter()
            .find(|r| r.name == name)?;
        Some(self.describe_host(&row).await)
    }

    async fn entity_by_name(&self, name: &str) -> Option<Entity> {
        let row = self
            .entity_rows_guarded()
            .await
            .into_iter()
            .find(|r| r.name == name)?;
        if self.is_host_name(&row.name) {
            Some(Entity::Host(self.describe_host(&row).await))
        } else {
            Some(Entity::Virtual(DeployedVm::new(row.id, row.name)))
        }
    }

    async fn host_measurement(&self, host: &Host) -> Option<HostMeasurement> {
        let rows = self.item_rows_guarded(host.id).await;
        if rows.is_empty() {
            return None;
        }
        let clock = rows.iter().map(|r| r.clock).max().unwrap_or(0);
        let mut measurement = Measurement::new(clock);
        for row in &rows {
            measurement.add_metric(Self::row_to_metric(row));
        }
        Some(HostMeasurement {
            host: host.clone(),
            measurement,
        })
    }

    async fn lowest_power(&self, host: &Host) -> f64 {
        let now = now_secs();
        self.history_guarded(
            host.id,
            keys::POWER,
            now - POWER_HISTORY_WINDOW.as_secs() as i64,
            now,
        )
        .await
        .into_iter()
        .filter(|v| v.is_finite())
        .fold(None, |acc: Option<f64>, v| {
            Some(acc.map_or(v, |a| a.min(v)))
        })
        .unwrap_or(0.0)
    }

    async fn highest_power(&self, host: &Host) -> f64 {
        let now = now_secs();
        self.history_guarded(
            host.id,
            keys::POWER,
            now - POWER_HISTORY_WINDOW.as_secs() as i64,
            now,
        )
        .await
        .into_iter()
        .filter(|v| v.is_finite())
        .fold(None, |acc: Option<f64>, v| {
            Some(acc.map_or(v, |a| a.max(v)))
        })
        .unwrap_or(0.0)
    }

    async fn cpu_utilisation(&self, host: &Host, window: Duration) -> f64 {
        if window.is_zero() {
            return 0.0;
        }
        let utilisation = if let Some(spot) = self
            .mean_history(host, keys::CPU_SPOT_USAGE, window)
            .await
        {
            spot / 100.0
        } else if let Some(idle) = self.mean_history(host, keys::CPU_IDLE, window).await {
            1.0 - idle / 100.0
        } else {
            return 0.0;
        };
        if !utilisation.is_finite() {
            return 0.0;
        }
        utilisation.clamp(0.0, 1.0)
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FakeStore {
        entities: Vec<EntityRow>,
        items: HashMap<i64, Vec<ItemRow>>,
        history: HashMap<(i64, String), Vec<f64>>,
    }

    impl FakeStore {
        fn empty() -> Self {
            Self {
                entities: Vec::new(),
                items: HashMap::new(),
                history: HashMap::new(),
            }
        }
    }

    #[async_trait::async_trait]
    impl SqlStore for FakeStore {
        async fn entity_rows(&self) -> Result<Vec<EntityRow>, CollectorError> {
            Ok(self.entities.clone())
        }

        async fn latest_item_rows(&self, entity_id: i64) -> Result<Vec<ItemRow>, CollectorError> {
            Ok(self.items.get(&entity_id).cloned().unwrap_or_default())
        }

        async fn history_values(
            &self,
            entity_id: i64,
            key: &str,
            _start: i64,
            _end: i64,
        ) -> Result<Vec<f64>, CollectorError> {
            Ok(self
                .history
                .get(&(entity_id, key.to_string()))
                .cloned()
                .unwrap_or_default())
        }
    }

    fn item(id: i64, clock: i64, key: &str, value: &str) -> ItemRow {
        ItemRow {
            item_id: id,
            clock,
            name: key.to_string(),
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    fn collector(store: FakeStore) -> ZabbixCollector<FakeStore> {
        ZabbixCollector::new(store, ZabbixConfig::default())
    }

    #[tokio::test]
    async fn test_host_list_applies_prefix_filter() {
        let mut store = FakeStore::empty();
        store.entities = vec![
            EntityRow {
                id: 1,
                name: "testnode1".to_string(),
                available: true,
            },
            EntityRow {
                id: 2,
                name: "vm-alpha".to_string(),
                available: true,
            },
        ];
        let hosts = collector(store).host_list().await;
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].name, "testnode1");
    }

    #[tokio::test]
    async fn test_host_list_can_skip_unavailable() {
        let mut store = FakeStore::empty();
        store.entities = vec![
            EntityRow {
                id: 1,
                name: "testnode1".to_string(),
                available: true,
            },
            EntityRow {
                id: 2,
                name: "testnode2".to_string(),
                available: false,
            },
        ];
        let mut config = ZabbixConfig::default();
        config.only_available_hosts = true;
        let hosts = ZabbixCollector::new(store, config).host_list().await;
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].name, "testnode1");
    }

    #[tokio::test]
    async fn test_describe_host_converts_units() {
        let mut store = FakeStore::empty();
        store.entities = vec![EntityRow {
            id: 7,
            name: "testnode7".to_string(),
            available: true,
        }];
        store.items.insert(
            7,
            vec![
                item(1, 100, keys::MEMORY_TOTAL, "68719476736"), // 64 GiB in bytes
                item(2, 100, keys::DISK_TOTAL, "2147483648000"), // 2000 GiB in bytes
                item(3, 100, keys::CPU_COUNT, "16"),
            ],
        );
        let host = collector(store).host_by_name("testnode7").await.unwrap();
        assert_eq!(host.ram_mb, 65536);
        assert!((host.disk_gb - 2000.0).abs() < 1e-6);
        assert_eq!(host.core_count, 16);
    }

    #[tokio::test]
    async fn test_host_measurement_assembly() {
        let mut store = FakeStore::empty();
        store.items.insert(
            3,
            vec![
                item(1, 100, keys::POWER, "220.5"),
                item(2, 105, keys::MEMORY_TOTAL, "1073741824"), // 1 GiB in bytes
                item(3, 90, "system.uptime", "86400"),
            ],
        );
        let host = Host::new(3, "testnode3");
        let hm = collector(store).host_measurement(&host).await.unwrap();
        // Record clock is the newest row clock.
        assert_eq!(hm.clock(), 105);
        assert_eq!(hm.metric(keys::POWER).unwrap().value(), 220.5);
        // Memory normalized to MB at ingestion.
        assert_eq!(hm.metric(keys::MEMORY_TOTAL).unwrap().value(), 1024.0);
        // Foreign keys pass through verbatim.
        assert_eq!(hm.metric("system.uptime").unwrap().value(), 86400.0);
    }

    #[tokio::test]
    async fn test_host_measurement_none_without_rows() {
        let store = FakeStore::empty();
        let host = Host::new(3, "testnode3");
        assert!(collector(store).host_measurement(&host).await.is_none());
    }

    #[tokio::test]
    async fn test_power_extremes() {
        let mut store = FakeStore::empty();
        store.history.insert(
            (5, keys::POWER.to_string()),
            vec![210.0, 195.5, 250.0, 230.0],
        );
        let c = collector(store);
        let host = Host::new(5, "testnode5");
        assert_eq!(c.lowest_power(&host).await, 195.5);
        assert_eq!(c.highest_power(&host).await, 250.0);

        let missing = Host::new(6, "testnode6");
        assert_eq!(c.lowest_power(&missing).await, 0.0);
        assert_eq!(c.highest_power(&missing).await, 0.0);
    }

    #[tokio::test]
    async fn test_cpu_utilisation_prefers_spot_usage() {
        let mut store = FakeStore::empty();
        store.history.insert(
            (5, keys::CPU_SPOT_USAGE.to_string()),
            vec![20.0, 40.0, 60.0],
        );
        store
            .history
            .insert((5, keys::CPU_IDLE.to_string()), vec![0.0]);
        let c = collector(store);
        let host = Host::new(5, "testnode5");
        let u = c.cpu_utilisation(&host, Duration::from_secs(600)).await;
        assert!((u - 0.4).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_cpu_utilisation_idle_fallback_and_nan() {
        let mut store = FakeStore::empty();
        store.history.insert(
            (5, keys::CPU_IDLE.to_string()),
            vec![80.0, f64::NAN, 70.0],
        );
        let c = collector(store);
        let host = Host::new(5, "testnode5");
        // NaN sample contributes zero: mean idle = 50, utilisation = 0.5.
        let u = c.cpu_utilisation(&host, Duration::from_secs(600)).await;
        assert!((u - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_cpu_utilisation_zero_window_and_no_data() {
        let c = collector(FakeStore::empty());
        let host = Host::new(5, "testnode5");
        assert_eq!(c.cpu_utilisation(&host, Duration::ZERO).await, 0.0);
        assert_eq!(
            c.cpu_utilisation(&host, Duration::from_secs(600)).await,
            0.0
        );
    }

    #[tokio::test]
    async fn test_entity_by_name_synthesizes_vm() {
        let mut store = FakeStore::empty();
        store.entities = vec![EntityRow {
            id: 9,
            name: "vm-alpha".to_string(),
            available: true,
        }];
        match collector(store).entity_by_name("vm-alpha").await {
            Some(Entity::Virtual(vm)) => {
                assert_eq!(vm.id, 9);
                assert_eq!(vm.name, "vm-alpha");
            }
            other => panic!("expected virtual entity, got {other:?}"),
        }
    }
}
