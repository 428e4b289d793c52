//! Collector contract and back-end implementations.
//!
//! Every back-end exposes the same [`Collector`] surface: entity discovery,
//! a current measurement per host, power extremes, and a windowed CPU
//! utilisation figure. Back-ends that know about jobs additionally
//! implement [`ApplicationCollector`].
//!
//! # Error Handling Philosophy
//!
//! Contract methods never surface back-end failures to the caller: a host
//! that cannot be measured yields `None`, a failed discovery yields an
//! empty list, and unavailable readings degrade to documented sentinels
//! (0.0 for power and utilisation). Failures are logged at the point they
//! occur. Errors only travel across the collaborator seams (query
//! executors, command runners, document sources) where the drivers and
//! collectors can act on them.

pub mod compss;
pub mod fusion;
pub mod influx;
pub mod slurm;
pub mod zabbix;

use std::time::Duration;

use crate::metric::{ApplicationMeasurement, HostMeasurement};
use crate::types::{ApplicationOnHost, Entity, Host, JobStatus};

pub use compss::{CompssCollector, CompssImplementation, CompssResource, DocumentSource};
pub use fusion::FusionCollector;
pub use influx::{InfluxCollector, QueryResult, Series, SeriesStore};
pub use slurm::{CommandRunner, ShellCommandRunner, SlurmCollector};
pub use zabbix::{EntityRow, ItemRow, SqlStore, ZabbixCollector};

/// Uniform read surface over one monitoring back-end.
#[async_trait::async_trait]
pub trait Collector: Send + Sync {
    /// All physical hosts the back-end currently knows about.
    async fn host_list(&self) -> Vec<Host>;

    /// Look up one host by name.
    async fn host_by_name(&self, name: &str) -> Option<Host>;

    /// Look up any entity by name.
    ///
    /// The default resolves physical hosts only; back-ends that track
    /// virtual machines override this.
    async fn entity_by_name(&self, name: &str) -> Option<Entity> {
        self.host_by_name(name).await.map(Entity::Host)
    }

    /// Current measurement for one host; `None` when the back-end has no
    /// data for it.
    async fn host_measurement(&self, host: &Host) -> Option<HostMeasurement>;

    /// Current measurements for the given hosts, or for every known host
    /// when `hosts` is `None`. Hosts without data are omitted.
    async fn host_measurements(&self, hosts: Option<&[Host]>) -> Vec<HostMeasurement> {
        let owned;
        let hosts = match hosts {
            Some(hosts) => hosts,
            None => {
                owned = self.host_list().await;
                &owned
            }
        };
        let mut result = Vec::with_capacity(hosts.len());
        for host in hosts {
            if let Some(measurement) = self.host_measurement(host).await {
                result.push(measurement);
            }
        }
        result
    }

    /// Lowest power draw observed for the host, in watts; 0.0 when the
    /// back-end has no power history.
    async fn lowest_power(&self, _host: &Host) -> f64 {
        0.0
    }

    /// Highest power draw observed for the host, in watts; 0.0 when the
    /// back-end has no power history.
    async fn highest_power(&self, _host: &Host) -> f64 {
        0.0
    }

    /// Mean CPU utilisation over the trailing `window`, as a 0-1 fraction.
    ///
    /// Always a finite value in [0, 1]; 0.0 when the back-end has no
    /// samples in the window or the window is zero.
    async fn cpu_utilisation(&self, host: &Host, window: Duration) -> f64;
}

/// Extension for back-ends that also track running applications.
#[async_trait::async_trait]
pub trait ApplicationCollector: Collector {
    /// Applications known to the back-end, optionally filtered by status.
    async fn applications(&self, status: Option<JobStatus>) -> Vec<ApplicationOnHost>;

    /// Current measurement for one application; `None` when the back-end
    /// has no data for it.
    async fn application_measurement(
        &self,
        application: &ApplicationOnHost,
    ) -> Option<ApplicationMeasurement>;

    /// Current measurements for the given applications, or for every known
    /// application when `applications` is `None`.
    async fn application_measurements(
        &self,
        applications: Option<&[ApplicationOnHost]>,
    ) -> Vec<ApplicationMeasurement> {
        let owned;
        let applications = match applications {
            Some(applications) => applications,
            None => {
                owned = self.applications(None).await;
                &owned
            }
        };
        let mut result = Vec::with_capacity(applications.len());
        for application in applications {
            if let Some(measurement) = self.application_measurement(application).await {
                result.push(measurement);
            }
        }
        result
    }
}

// Shared collectors: a driver and a fusion layer can hold the same
// instance behind an Arc.
#[async_trait::async_trait]
impl<T: Collector + ?Sized> Collector for std::sync::Arc<T> {
    async fn host_list(&self) -> Vec<Host> {
        (**self).host_list().await
    }

    async fn host_by_name(&self, name: &str) -> Option<Host> {
        (**self).host_by_name(name).await
    }

    async fn entity_by_name(&self, name: &str) -> Option<Entity> {
        (**self).entity_by_name(name).await
    }

    async fn host_measurement(&self, host: &Host) -> Option<HostMeasurement> {
        (**self).host_measurement(host).await
    }

    async fn host_measurements(&self, hosts: Option<&[Host]>) -> Vec<HostMeasurement> {
        (**self).host_measurements(hosts).await
    }

    async fn lowest_power(&self, host: &Host) -> f64 {
        (**self).lowest_power(host).await
    }

    async fn highest_power(&self, host: &Host) -> f64 {
        (**self).highest_power(host).await
    }

    async fn cpu_utilisation(&self, host: &Host, window: Duration) -> f64 {
        (**self).cpu_utilisation(host, window).await
    }
}

#[async_trait::async_trait]
impl<T: ApplicationCollector + ?Sized> ApplicationCollector for std::sync::Arc<T> {
    async fn applications(&self, status: Option<JobStatus>) -> Vec<ApplicationOnHost> {
        (**self).applications(status).await
    }

    async fn application_measurement(
        &self,
        application: &ApplicationOnHost,
    ) -> Option<ApplicationMeasurement> {
        (**self).application_measurement(application).await
    }

    async fn application_measurements(
        &self,
        applications: Option<&[ApplicationOnHost]>,
    ) -> Vec<ApplicationMeasurement> {
        (**self).application_measurements(applications).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::{MetricValue, keys};

    /// Collector with a fixed host set, for exercising the default methods.
    struct FixedCollector {
        hosts: Vec<Host>,
        unmeasurable: String,
    }

    #[async_trait::async_trait]
    impl Collector for FixedCollector {
        async fn host_list(&self) -> Vec<Host> {
            self.hosts.clone()
        }

        async fn host_by_name(&self, name: &str) -> Option<Host> {
            self.hosts.iter().find(|h| h.name == name).cloned()
        }

        async fn host_measurement(&self, host: &Host) -> Option<HostMeasurement> {
            if host.name == self.unmeasurable {
                return None;
            }
            let mut m = HostMeasurement::new(host.clone(), 100);
            m.add_metric(MetricValue::keyed(keys::POWER, "80", 100));
            Some(m)
        }

        async fn cpu_utilisation(&self, _host: &Host, _window: Duration) -> f64 {
            0.5
        }
    }

    #[tokio::test]
    async fn test_host_measurements_omits_hosts_without_data() {
        let collector = FixedCollector {
            hosts: vec![Host::new(1, "ns52"), Host::new(2, "ns53")],
            unmeasurable: "ns53".to_string(),
        };
        let all = collector.host_measurements(None).await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].host.name, "ns52");
    }

    #[tokio::test]
    async fn test_host_measurements_respects_explicit_subset() {
        let collector = FixedCollector {
            hosts: vec![Host::new(1, "ns52"), Host::new(2, "ns53")],
            unmeasurable: String::new(),
        };
        let subset = [Host::new(1, "ns52")];
        let result = collector.host_measurements(Some(&subset)).await;
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].power(), 80.0);
    }

    #[tokio::test]
    async fn test_entity_by_name_default_wraps_host() {
        let collector = FixedCollector {
            hosts: vec![Host::new(1, "ns52")],
            unmeasurable: String::new(),
        };
        match collector.entity_by_name("ns52").await {
            Some(Entity::Host(h)) => assert_eq!(h.name, "ns52"),
            other => panic!("expected host entity, got {other:?}"),
        }
        assert!(collector.entity_by_name("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_power_extremes_default_to_zero() {
        let collector = FixedCollector {
            hosts: vec![],
            unmeasurable: String::new(),
        };
        let host = Host::new(1, "ns52");
        assert_eq!(collector.lowest_power(&host).await, 0.0);
        assert_eq!(collector.highest_power(&host).await, 0.0);
    }
}
