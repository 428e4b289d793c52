//! Distributed-runtime collector.
//!
//! Consumes the runtime monitor's JSON document through the
//! [`DocumentSource`] seam. The document arrives in one of two shapes:
//! the monitor's native form with `resources`/`implementations` maps keyed
//! by name, or an XML-originated form with `Resource` and `Core`/`Impl`
//! arrays carrying `id`/`Signature` fields and alternate key spellings.
//! Both normalize to the same [`CompssResource`] and
//! [`CompssImplementation`] views.
//!
//! A driver fetches the document periodically and feeds it to
//! [`CompssCollector::refresh`]; contract reads answer from the last
//! refreshed snapshot.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::Value;

use crate::config::CompssConfig;
use crate::error::CollectorError;
use crate::metric::{
    ApplicationMeasurement, HostMeasurement, Measurement, MetricValue, keys,
};
use crate::types::{
    Accelerator, AcceleratorKind, ApplicationOnHost, Host, JobStatus,
};

use super::{ApplicationCollector, Collector};

/// Fetches the runtime monitor's current JSON document.
#[async_trait::async_trait]
pub trait DocumentSource: Send + Sync {
    /// Fetch the monitor document.
    async fn fetch(&self) -> Result<Value, CollectorError>;
}

/// One compute resource as seen by the runtime.
#[derive(Debug, Clone)]
pub struct CompssResource {
    /// Resource host name.
    pub hostname: String,
    /// Runtime state string, e.g. `Running`.
    pub state: String,
    /// CPU computing units.
    pub core_count: u32,
    /// GPU computing units.
    pub gpu_count: u32,
    /// FPGA computing units.
    pub fpga_count: u32,
    /// Memory in gigabytes.
    pub memory_gb: f64,
    /// Disk in gigabytes.
    pub disk_gb: f64,
    /// Actions currently executing on the resource.
    pub actions: Vec<String>,
}

impl CompssResource {
    /// Parse every resource in a monitor document, accepting both shapes.
    pub fn parse_all(doc: &Value) -> Vec<CompssResource> {
        let mut answer = Vec::new();
        if let Some(Value::Object(resources)) = doc.get("resources") {
            for (name, resource) in resources {
                if resource.is_object() {
                    answer.push(Self::from_value(name.clone(), resource));
                }
            }
            return answer;
        }
        match doc.get("Resource") {
            Some(Value::Array(resources)) => {
                for resource in resources {
                    if let Some(id) = resource.get("id").and_then(Value::as_str) {
                        answer.push(Self::from_value(id.to_string(), resource));
                    }
                }
            }
            Some(resource @ Value::Object(_)) => {
                if let Some(id) = resource.get("id").and_then(Value::as_str) {
                    answer.push(Self::from_value(id.to_string(), resource));
                }
            }
            _ => {}
        }
        answer
    }

    fn from_value(hostname: String, obj: &Value) -> Self {
        Self {
            hostname,
            state: obj
                .get("Status")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
            core_count: num(obj, &["TotalCPUComputingUnits"]) as u32,
            gpu_count: num(obj, &["TotalGPUComputingUnits"]) as u32,
            fpga_count: num(obj, &["TotalFPGAComputingUnits"]) as u32,
            memory_gb: num(obj, &["Memory"]),
            disk_gb: num(obj, &["Disk"]),
            actions: parse_actions(obj),
        }
    }

    /// Whether the resource currently runs no actions.
    pub fn is_idle(&self) -> bool {
        self.actions.is_empty()
    }
}

/// One application implementation with its execution statistics.
#[derive(Debug, Clone)]
pub struct CompssImplementation {
    /// Implementation name or signature.
    pub name: String,
    /// Longest observed execution time, in ms.
    pub max_time: i64,
    /// Shortest observed execution time, in ms.
    pub min_time: i64,
    /// Mean observed execution time, in ms.
    pub avg_time: i64,
    /// Completed execution count.
    pub executions: i64,
}

impl CompssImplementation {
    /// Parse every implementation in a monitor document, accepting both
    /// shapes.
    pub fn parse_all(doc: &Value) -> Vec<CompssImplementation> {
        let mut answer = Vec::new();
        if let Some(Value::Object(implementations)) = doc.get("implementations") {
            for (name, implementation) in implementations {
                if implementation.is_object() {
                    answer.push(Self::from_value(name.clone(), implementation));
                }
            }
            return answer;
        }
        match doc.get("Core") {
            Some(Value::Array(cores)) => {
                for core in cores {
                    Self::parse_core(core, &mut answer);
                }
            }
            Some(core @ Value::Object(_)) => Self::parse_core(core, &mut answer),
            _ => {}
        }
        answer
    }

    fn parse_core(core: &Value, answer: &mut Vec<CompssImplementation>) {
        match core.get("Impl") {
            Some(Value::Array(implementations)) => {
                for implementation in implementations {
                    if let Some(signature) =
                        implementation.get("Signature").and_then(Value::as_str)
                    {
                        answer.push(Self::from_value(signature.to_string(), implementation));
                    }
                }
            }
            Some(implementation @ Value::Object(_)) => {
                if let Some(signature) =
                    implementation.get("Signature").and_then(Value::as_str)
                {
                    answer.push(Self::from_value(signature.to_string(), implementation));
                }
            }
            _ => {}
        }
    }

    fn from_value(name: String, obj: &Value) -> Self {
        Self {
            name,
            max_time: num(obj, &["maxTime", "MaxExecutionTime"]) as i64,
            min_time: num(obj, &["minTime", "MinExecutionTime"]) as i64,
            avg_time: num(obj, &["avgTime", "MeanExecutionTime"]) as i64,
            executions: num(obj, &["executions", "ExecutedCount"]) as i64,
        }
    }
}

/// First numeric value found under any of `keys`; 0.0 otherwise.
fn num(obj: &Value, keys: &[&str]) -> f64 {
    keys.iter()
        .find_map(|k| obj.get(*k))
        .and_then(|v| match v {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
        .unwrap_or(0.0)
}

/// `Actions` holds an `Action` member that is either one string or an
/// array of strings; an idle resource carries `Actions: ""`.
fn parse_actions(obj: &Value) -> Vec<String> {
    let Some(Value::Object(actions)) = obj.get("Actions") else {
        return Vec::new();
    };
    match actions.get("Action") {
        Some(Value::String(action)) => vec![action.clone()],
        Some(Value::Array(list)) => list
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

/// Runtime states under which a resource is not usable.
fn state_available(state: &str) -> bool {
    !matches!(
        state.to_ascii_lowercase().as_str(),
        "removed" | "terminated" | "stopped"
    )
}

#[derive(Debug, Default)]
struct CompssState {
    resources: Vec<CompssResource>,
    implementations: Vec<CompssImplementation>,
    hosts: HashMap<String, Host>,
    clock: i64,
}

/// Collector over the distributed runtime's monitor document.
pub struct CompssCollector {
    config: CompssConfig,
    state: Mutex<CompssState>,
}

impl CompssCollector {
    /// Create an empty collector; a driver populates it via [`refresh`].
    ///
    /// [`refresh`]: CompssCollector::refresh
    pub fn new(config: CompssConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CompssState::default()),
        }
    }

    /// The collector's configuration; drivers read the poll timings.
    pub fn config(&self) -> &CompssConfig {
        &self.config
    }

    /// Replace the snapshot with the views parsed from `doc`, stamped at
    /// the current wall clock.
    pub fn refresh(&self, doc: &Value) {
        self.refresh_at(doc, now_secs());
    }

    /// Replace the snapshot with the views parsed from `doc`, stamped at
    /// `clock`. Used for deterministic tests.
    pub fn refresh_at(&self, doc: &Value, clock: i64) {
        let resources = CompssResource::parse_all(doc);
        let implementations = CompssImplementation::parse_all(doc);
        let mut hosts = HashMap::new();
        for resource in &resources {
            let mut host = Host::new(digits_of(&resource.hostname), &resource.hostname);
            host.state = resource.state.clone();
            host.available = state_available(&resource.state);
            host.core_count = resource.core_count;
            if resource.gpu_count > 0 {
                host.add_accelerator(Accelerator::new(
                    "gpu",
                    resource.gpu_count,
                    AcceleratorKind::Gpu,
                ));
            }
            if resource.fpga_count > 0 {
                host.add_accelerator(Accelerator::new(
                    "fpga",
                    resource.fpga_count,
                    AcceleratorKind::Fpga,
                ));
            }
            hosts.insert(resource.hostname.clone(), host);
        }
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = CompssState {
            resources,
            implementations,
            hosts,
            clock,
        };
    }
}

#[async_trait::async_trait]
impl Collector for CompssCollector {
    async fn host_list(&self) -> Vec<Host> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.hosts.values().cloned().collect()
    }

    async fn host_by_name(&self, name: &str) -> Option<Host> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.hosts.get(name).cloned()
    }

    async fn host_measurement(&self, host: &Host) -> Option<HostMeasurement> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let resource = state
            .resources
            .iter()
            .find(|r| r.hostname == host.name)?;
        let clock = state.clock;
        let mut measurement = Measurement::new(clock);
        measurement.add_metric(MetricValue::keyed(
            keys::CPU_COUNT,
            resource.core_count.to_string(),
            clock,
        ));
        if resource.gpu_count > 0 {
            measurement.add_metric(MetricValue::keyed(
                keys::GPU_COUNT,
                resource.gpu_count.to_string(),
                clock,
            ));
        }
        // The runtime reports memory in GB; canonical memory unit is MB.
        measurement.add_metric(MetricValue::keyed(
            keys::MEMORY_TOTAL,
            (resource.memory_gb * 1024.0).to_string(),
            clock,
        ));
        measurement.add_metric(MetricValue::keyed(
            keys::DISK_TOTAL,
            resource.disk_gb.to_string(),
            clock,
        ));
        measurement.add_metric(MetricValue::keyed(
            keys::APPS_RUNNING,
            resource.actions.len().to_string(),
            clock,
        ));
        Some(HostMeasurement {
            host: host.clone(),
            measurement,
        })
    }

    // The runtime has no power or utilisation telemetry; the defaults
    // answer 0.0.
    async fn cpu_utilisation(&self, _host: &Host, _window: Duration) -> f64 {
        0.0
    }
}

#[async_trait::async_trait]
impl ApplicationCollector for CompssCollector {
    async fn applications(&self, status: Option<JobStatus>) -> Vec<ApplicationOnHost> {
        // The runtime only knows about currently-running actions.
        if status.is_some_and(|s| s != JobStatus::Running) {
            return Vec::new();
        }
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut answer = Vec::new();
        for resource in &state.resources {
            for (i, action) in resource.actions.iter().enumerate() {
                answer.push(ApplicationOnHost::new(
                    i as i64,
                    action.clone(),
                    resource.hostname.clone(),
                    JobStatus::Running,
                ));
            }
        }
        answer
    }

    async fn application_measurement(
        &self,
        application: &ApplicationOnHost,
    ) -> Option<ApplicationMeasurement> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let implementation = state
            .implementations
            .iter()
            .find(|i| i.name == application.name)?;
        let clock = state.clock;
        let mut am = ApplicationMeasurement::new(application.clone(), clock);
        am.add_metric(MetricValue::keyed(
            keys::APP_EXECUTIONS,
            implementation.executions.to_string(),
            clock,
        ));
        am.add_metric(MetricValue::keyed(
            keys::APP_TIME_MIN,
            implementation.min_time.to_string(),
            clock,
        ));
        am.add_metric(MetricValue::keyed(
            keys::APP_TIME_AVG,
            implementation.avg_time.to_string(),
            clock,
        ));
        am.add_metric(MetricValue::keyed(
            keys::APP_TIME_MAX,
            implementation.max_time.to_string(),
            clock,
        ));
        Some(am)
    }
}

/// Numeric id embedded in a resource name; 0 when the name has no digits.
fn digits_of(name: &str) -> i64 {
    let digits: String = name.chars().filter(char::is_ascii_digit).collect();
    digits.parse().unwrap_or(0)
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
