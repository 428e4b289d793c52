//! Fusion collector.
//!
//! Wraps two inner collectors: an authoritative source with better static
//! identity, topology and job data (the distributed runtime), and an
//! enrichment source with better live time-series data (the collectd-fed
//! time-series store). Discovery and job listings always answer from the
//! authoritative side; live utilisation and power answer from the
//! enrichment side.
//!
//! The two sides name the same machine differently. A lazily-populated
//! bidirectional name map reconciles them: the enrichment candidate name
//! is the authoritative name plus a configured suffix, and a miss caches a
//! synthesized placeholder so the lookup is never repeated.

use std::collections::HashMap;
use std::time::Duration;

use tracing::warn;

use crate::metric::{ApplicationMeasurement, HostMeasurement, keys};
use crate::types::{ApplicationOnHost, Entity, Host, JobStatus};

use super::{ApplicationCollector, Collector};

#[derive(Debug, Default)]
struct NameMap {
    auth_to_enrich: HashMap<String, String>,
    enrich_to_auth: HashMap<String, String>,
}

/// Collector fusing an authoritative source `A` with an enrichment
/// source `E`.
pub struct FusionCollector<A, E> {
    authoritative: A,
    enrichment: E,
    suffix: String,
    names: tokio::sync::Mutex<NameMap>,
}

impl<A: Collector, E: Collector> FusionCollector<A, E> {
    /// Create a fusion collector. `suffix` is appended to an authoritative
    /// host name to form the enrichment-side candidate name.
    pub fn new(authoritative: A, enrichment: E, suffix: impl Into<String>) -> Self {
        Self {
            authoritative,
            enrichment,
            suffix: suffix.into(),
            names: tokio::sync::Mutex::new(NameMap::default()),
        }
    }

    /// The enrichment-side twin of an authoritative host.
    ///
    /// Resolution is cached in both directions; when the enrichment source
    /// has no matching entity a placeholder under the candidate name is
    /// synthesized and cached so future lookups stay local.
    async fn resolve_enrichment(&self, host: &Host) -> Host {
        let mut names = self.names.lock().await;
        if let Some(enrich_name) = names.auth_to_enrich.get(&host.name) {
            return host.renamed(enrich_name);
        }
        let candidate = format!("{}{}", host.name, self.suffix);
        let resolved = match self.enrichment.host_by_name(&candidate).await {
            Some(found) => found,
            None => {
                warn!(
                    host = %host.name,
                    candidate = %candidate,
                    "no enrichment counterpart, caching synthesized placeholder"
                );
                host.renamed(&candidate)
            }
        };
        names
            .auth_to_enrich
            .insert(host.name.clone(), resolved.name.clone());
        names
            .enrich_to_auth
            .insert(resolved.name.clone(), host.name.clone());
        resolved
    }
}

#[async_trait::async_trait]
impl<A, E> Collector for FusionCollector<A, E>
where
    A: Collector,
    E: Collector,
{
    async fn host_list(&self) -> Vec<Host> {
        self.authoritative.host_list().await
    }

    async fn host_by_name(&self, name: &str) -> Option<Host> {
        self.authoritative.host_by_name(name).await
    }

    async fn entity_by_name(&self, name: &str) -> Option<Entity> {
        self.authoritative.entity_by_name(name).await
    }

    async fn host_measurement(&self, host: &Host) -> Option<HostMeasurement> {
        let enrich_host = self.resolve_enrichment(host).await;
        let authoritative = self.authoritative.host_measurement(host).await;
        let enrichment = self.enrichment.host_measurement(&enrich_host).await;
        match (authoritative, enrichment) {
            (None, None) => None,
            (Some(a), None) => Some(a),
            (None, Some(mut e)) => {
                // The enrichment identity must never leak to callers.
                e.host = host.clone();
                Some(e)
            }
            (Some(mut a), Some(e)) => {
                if let Some(idle) = e.metric(keys::CPU_IDLE) {
                    // Enrichment utilisation takes precedence regardless
                    // of sample clocks.
                    a.delete_metric(keys::CPU_IDLE);
                    a.delete_metric(keys::CPU_SPOT_USAGE);
                    a.add_metric(idle.clone());
                    if let Some(spot) = e.metric(keys::CPU_SPOT_USAGE) {
                        a.add_metric(spot.clone());
                    }
                }
                a.merge(&e.measurement);
                Some(a)
            }
        }
    }

    async fn lowest_power(&self, host: &Host) -> f64 {
        let enrich_host = self.resolve_enrichment(host).await;
        self.enrichment.lowest_power(&enrich_host).await
    }

    async fn highest_power(&self, host: &Host) -> f64 {
        let enrich_host = self.resolve_enrichment(host).await;
        self.enrichment.highest_power(&enrich_host).await
    }

    async fn cpu_utilisation(&self, host: &Host, window: Duration) -> f64 {
        let enrich_host = self.resolve_enrichment(host).await;
        self.enrichment.cpu_utilisation(&enrich_host, window).await
    }
}

#[async_trait::async_trait]
impl<A, E> ApplicationCollector for FusionCollector<A, E>
where
    A: ApplicationCollector,
    E: ApplicationCollector,
{
    async fn applications(&self, status: Option<JobStatus>) -> Vec<ApplicationOnHost> {
        self.authoritative.applications(status).await
    }

    async fn application_measurement(
        &self,
        application: &ApplicationOnHost,
    ) -> Option<ApplicationMeasurement> {
        let authoritative = self
            .authoritative
            .application_measurement(application)
            .await;
        let enrichment = self.enrichment.application_measurement(application).await;
        match (authoritative, enrichment) {
            (None, None) => None,
            (Some(a), None) => Some(a),
            (None, Some(e)) => Some(e),
            (Some(mut a), Some(e)) => {
                a.merge(&e.measurement);
                Some(a)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::metric::{Measurement, MetricValue};

    fn measurement(clock: i64, metrics: &[(&str, &str, i64)]) -> Measurement {
        let mut m = Measurement::new(clock);
        for (key, raw, metric_clock) in metrics {
            m.add_metric(MetricValue::keyed(key, *raw, *metric_clock));
        }
        m
    }

    /// Authoritative fake with fixed hosts, measurements and applications.
    #[derive(Default)]
    struct FakeAuthoritative {
        hosts: Vec<Host>,
        host_data: HashMap<String, Measurement>,
        applications: Vec<ApplicationOnHost>,
        app_data: HashMap<String, Measurement>,
    }

    #[async_trait::async_trait]
    impl Collector for FakeAuthoritative {
        async fn host_list(&self) -> Vec<Host> {
            self.hosts.clone()
        }

        async fn host_by_name(&self, name: &str) -> Option<Host> {
            self.hosts.iter().find(|h| h.name == name).cloned()
        }

        async fn host_measurement(&self, host: &Host) -> Option<HostMeasurement> {
            self.host_data.get(&host.name).map(|m| HostMeasurement {
                host: host.clone(),
                measurement: m.clone(),
            })
        }

        async fn cpu_utilisation(&self, _host: &Host, _window: Duration) -> f64 {
            0.0
        }
    }

    #[async_trait::async_trait]
    impl ApplicationCollector for FakeAuthoritative {
        async fn applications(&self, _status: Option<JobStatus>) -> Vec<ApplicationOnHost> {
            self.applications.clone()
        }

        async fn application_measurement(
            &self,
            application: &ApplicationOnHost,
        ) -> Option<ApplicationMeasurement> {
            self.app_data
                .get(&application.name)
                .map(|m| ApplicationMeasurement {
                    application: application.clone(),
                    measurement: m.clone(),
                })
        }
    }

    /// Enrichment fake instrumented with a host lookup counter.
    #[derive(Default)]
    struct FakeEnrichment {
        hosts: Vec<Host>,
        host_data: Mutex<HashMap<String, Measurement>>,
        app_data: HashMap<String, Measurement>,
        lookups: AtomicUsize,
        utilisation: f64,
    }

    #[async_trait::async_trait]
    impl Collector for FakeEnrichment {
        async fn host_list(&self) -> Vec<Host> {
            self.hosts.clone()
        }

        async fn host_by_name(&self, name: &str) -> Option<Host> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.hosts.iter().find(|h| h.name == name).cloned()
        }

        async fn host_measurement(&self, host: &Host) -> Option<HostMeasurement> {
            self.host_data
                .lock()
                .unwrap()
                .get(&host.name)
                .map(|m| HostMeasurement {
                    host: host.clone(),
                    measurement: m.clone(),
                })
        }

        async fn lowest_power(&self, host: &Host) -> f64 {
            self.host_data
                .lock()
                .unwrap()
                .get(&host.name)
                .map(Measurement::power)
                .unwrap_or(0.0)
        }

        async fn cpu_utilisation(&self, _host: &Host, _window: Duration) -> f64 {
            self.utilisation
        }
    }

    #[async_trait::async_trait]
    impl ApplicationCollector for FakeEnrichment {
        async fn applications(&self, _status: Option<JobStatus>) -> Vec<ApplicationOnHost> {
            Vec::new()
        }

        async fn application_measurement(
            &self,
            application: &ApplicationOnHost,
        ) -> Option<ApplicationMeasurement> {
            self.app_data
                .get(&application.name)
                .map(|m| ApplicationMeasurement {
                    application: application.clone(),
                    measurement: m.clone(),
                })
        }
    }

    fn enrichment_with(name: &str, m: Measurement) -> FakeEnrichment {
        let mut e = FakeEnrichment::default();
        e.hosts = vec![Host::new(52, name)];
        e.host_data.lock().unwrap().insert(name.to_string(), m);
        e
    }

    #[tokio::test]
    async fn test_name_mapping_cached_after_first_call() {
        let mut a = FakeAuthoritative::default();
        a.hosts = vec![Host::new(52, "ns52")];
        a.host_data
            .insert("ns52".to_string(), measurement(100, &[("power", "80", 100)]));
        let e = enrichment_with("ns52.bullx", measurement(90, &[("power", "82", 90)]));

        let fusion = FusionCollector::new(a, e, ".bullx");
        let host = Host::new(52, "ns52");

        assert!(fusion.host_measurement(&host).await.is_some());
        assert_eq!(fusion.enrichment.lookups.load(Ordering::SeqCst), 1);

        // Second call answers the mapping from cache.
        assert!(fusion.host_measurement(&host).await.is_some());
        assert_eq!(fusion.enrichment.lookups.load(Ordering::SeqCst), 1);

        let names = fusion.names.lock().await;
        assert_eq!(names.auth_to_enrich["ns52"], "ns52.bullx");
        assert_eq!(names.enrich_to_auth["ns52.bullx"], "ns52");
    }

    #[tokio::test]
    async fn test_miss_caches_synthesized_placeholder() {
        let mut a = FakeAuthoritative::default();
        a.hosts = vec![Host::new(52, "ns52")];
        a.host_data
            .insert("ns52".to_string(), measurement(100, &[("power", "80", 100)]));
        let e = FakeEnrichment::default();

        let fusion = FusionCollector::new(a, e, ".bullx");
        let host = Host::new(52, "ns52");

        let hm = fusion.host_measurement(&host).await.unwrap();
        assert_eq!(hm.power(), 80.0);
        assert_eq!(fusion.enrichment.lookups.load(Ordering::SeqCst), 1);

        // The placeholder mapping makes the miss idempotent.
        fusion.host_measurement(&host).await.unwrap();
        assert_eq!(fusion.enrichment.lookups.load(Ordering::SeqCst), 1);
        let names = fusion.names.lock().await;
        assert_eq!(names.auth_to_enrich["ns52"], "ns52.bullx");
    }

    #[tokio::test]
    async fn test_enrichment_identity_never_leaks() {
        let a = FakeAuthoritative {
            hosts: vec![Host::new(52, "ns52")],
            ..Default::default()
        };
        let e = enrichment_with("ns52.bullx", measurement(90, &[("power", "82", 90)]));

        let fusion = FusionCollector::new(a, e, ".bullx");
        let host = Host::new(52, "ns52");
        let hm = fusion.host_measurement(&host).await.unwrap();
        assert_eq!(hm.host.name, "ns52");
        assert_eq!(hm.power(), 82.0);
    }

    #[tokio::test]
    async fn test_enrichment_utilisation_takes_precedence() {
        let mut a = FakeAuthoritative::default();
        a.hosts = vec![Host::new(52, "ns52")];
        // Authoritative utilisation is newer but still loses.
        a.host_data.insert(
            "ns52".to_string(),
            measurement(
                100,
                &[
                    (keys::CPU_IDLE, "10", 100),
                    (keys::CPU_SPOT_USAGE, "90", 100),
                    ("apps.running", "1", 100),
                ],
            ),
        );
        let e = enrichment_with(
            "ns52.bullx",
            measurement(
                90,
                &[(keys::CPU_IDLE, "80", 90), (keys::CPU_SPOT_USAGE, "20", 90)],
            ),
        );

        let fusion = FusionCollector::new(a, e, ".bullx");
        let host = Host::new(52, "ns52");
        let hm = fusion.host_measurement(&host).await.unwrap();
        assert_eq!(hm.metric(keys::CPU_IDLE).unwrap().value(), 80.0);
        assert_eq!(hm.metric(keys::CPU_SPOT_USAGE).unwrap().value(), 20.0);
        // Non-utilisation metrics survive the merge.
        assert!(hm.metric_exists("apps.running"));
    }

    #[tokio::test]
    async fn test_application_merge_matrix() {
        let app = ApplicationOnHost::new(1, "frame", "ns52", JobStatus::Running);
        let mut a = FakeAuthoritative::default();
        a.applications = vec![app.clone()];
        a.app_data.insert(
            "frame".to_string(),
            measurement(100, &[("app.executions", "2", 100)]),
        );
        let mut e = FakeEnrichment::default();
        e.app_data.insert(
            "frame".to_string(),
            measurement(110, &[("power", "30", 110)]),
        );

        let fusion = FusionCollector::new(a, e, ".bullx");

        // Both sides: enrichment metrics merged into the authoritative record.
        let am = fusion.application_measurement(&app).await.unwrap();
        assert!(am.measurement.metric_exists("app.executions"));
        assert!(am.measurement.metric_exists("power"));

        // Neither side: not found.
        let missing = ApplicationOnHost::new(2, "other", "ns52", JobStatus::Running);
        assert!(fusion.application_measurement(&missing).await.is_none());

        // Listings delegate to the authoritative side.
        assert_eq!(fusion.applications(None).await.len(), 1);
    }

    #[tokio::test]
    async fn test_application_only_enrichment_side() {
        let app = ApplicationOnHost::new(1, "frame", "ns52", JobStatus::Running);
        let a = FakeAuthoritative::default();
        let mut e = FakeEnrichment::default();
        e.app_data.insert(
            "frame".to_string(),
            measurement(110, &[("power", "30", 110)]),
        );
        let fusion = FusionCollector::new(a, e, ".bullx");
        let am = fusion.application_measurement(&app).await.unwrap();
        assert_eq!(am.measurement.power(), 30.0);
    }

    #[tokio::test]
    async fn test_scalars_delegate_through_name_mapping() {
        let a = FakeAuthoritative {
            hosts: vec![Host::new(52, "ns52")],
            ..Default::default()
        };
        let mut e = enrichment_with("ns52.bullx", measurement(90, &[("power", "82", 90)]));
        e.utilisation = 0.4;

        let fusion = FusionCollector::new(a, e, ".bullx");
        let host = Host::new(52, "ns52");
        assert_eq!(fusion.lowest_power(&host).await, 82.0);
        assert_eq!(
            fusion
                .cpu_utilisation(&host, Duration::from_secs(600))
                .await,
            0.4
        );
        // Host list comes from the authoritative side.
        let hosts = fusion.host_list().await;
        assert_eq!(hosts[0].name, "ns52");
    }
}
