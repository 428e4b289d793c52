//! Batch-scheduler collector.
//!
//! Parses semicolon-delimited `key=value` records as produced by
//! `scontrol show node -o -d` with spaces rewritten to `;`. Records arrive
//! either from a poll driver running the scrape command or a tail driver
//! following a scrape file; both funnel into [`SlurmCollector::parse_line`].
//!
//! The collector keeps the host registry, the current measurement per
//! host, the lowest/highest power trackers, and a bounded CPU history per
//! host behind one mutex. A line is parsed into a complete measurement
//! before it is published, so readers never observe a half-built record.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::warn;

use crate::config::SlurmConfig;
use crate::error::CollectorError;
use crate::metric::{HostMeasurement, MetricValue, keys};
use crate::types::{Accelerator, AcceleratorKind, Host};

use super::Collector;

/// GRES value the scheduler emits for a node with no generic resources.
const GRES_NULL: &str = "(null)";

/// Executes a shell command and captures its stdout as lines.
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `command` and return stdout split into lines.
    async fn run(&self, command: &str) -> Result<Vec<String>, CollectorError>;
}

/// Command runner backed by `/bin/sh -c`.
pub struct ShellCommandRunner;

#[async_trait::async_trait]
impl CommandRunner for ShellCommandRunner {
    async fn run(&self, command: &str) -> Result<Vec<String>, CollectorError> {
        let output = tokio::process::Command::new("/bin/sh")
            .arg("-c")
            .arg(command)
            .output()
            .await?;
        if !output.status.success() {
            return Err(CollectorError::Backend(format!(
                "command exited with {}",
                output.status
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_string)
            .collect())
    }
}

/// One CPU busy-percentage sample.
#[derive(Debug, Clone, Copy)]
struct CpuSample {
    clock: i64,
    busy_pct: f64,
}

#[derive(Debug, Default)]
struct SlurmState {
    hosts: HashMap<String, Host>,
    current: HashMap<String, HostMeasurement>,
    lowest: HashMap<String, HostMeasurement>,
    highest: HashMap<String, HostMeasurement>,
    cpu_history: HashMap<String, VecDeque<CpuSample>>,
}

/// Collector over the batch scheduler's node records.
pub struct SlurmCollector {
    config: SlurmConfig,
    history_capacity: usize,
    state: Mutex<SlurmState>,
}

impl SlurmCollector {
    /// Create a collector; CPU history capacity covers the configured
    /// trailing window at the configured poll rate.
    pub fn new(config: SlurmConfig) -> Self {
        let interval = config.interval.as_secs().max(1);
        let history_capacity = (config.history_window.as_secs() / interval).max(1) as usize;
        Self {
            config,
            history_capacity,
            state: Mutex::new(SlurmState::default()),
        }
    }

    /// The collector's configuration; drivers read the poll timings and
    /// the scrape-file path.
    pub fn config(&self) -> &SlurmConfig {
        &self.config
    }

    /// The scrape command a poll driver should run.
    pub fn scrape_command(&self) -> String {
        format!(
            "scontrol show node={} -o -d | sed \"s/ /;/g\"",
            self.config.hosts
        )
    }

    /// Parse one scheduler record stamped at the current wall clock.
    pub fn parse_line(&self, line: &str) {
        self.parse_line_at(line, now_secs());
    }

    /// Parse one scheduler record stamped at `clock` (unix seconds).
    /// Used for replaying tailed files and for deterministic tests.
    pub fn parse_line_at(&self, line: &str, clock: i64) {
        let mut node_name = None;
        let mut state_field = None;
        let mut cpu_tot = None;
        let mut cpu_load = None;
        let mut watts = None;
        let mut joules = None;
        let mut free_mem = None;
        let mut real_mem = None;
        let mut gres = None;
        let mut gres_used = None;
        let mut generic = Vec::new();

        for token in line.split(';') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            let (key, value) = match token.split_once('=') {
                Some((k, v)) => (k, v),
                None => {
                    generic.push(token);
                    continue;
                }
            };
            match key {
                k if k.eq_ignore_ascii_case("NodeName") => node_name = Some(value),
                k if k.eq_ignore_ascii_case("State") => state_field = Some(value),
                k if k.eq_ignore_ascii_case("CPUTot") => cpu_tot = Some(value),
                k if k.eq_ignore_ascii_case("CPULoad") => cpu_load = Some(value),
                k if k.eq_ignore_ascii_case("CurrentWatts") => watts = Some(value),
                k if k.eq_ignore_ascii_case("ConsumedJoules") => joules = Some(value),
                k if k.eq_ignore_ascii_case("FreeMem") => free_mem = Some(value),
                k if k.eq_ignore_ascii_case("RealMemory") => real_mem = Some(value),
                k if k.eq_ignore_ascii_case("Gres") => gres = Some(value),
                k if k.eq_ignore_ascii_case("GresUsed") => gres_used = Some(value),
                _ => generic.push(token),
            }
        }

        // Partial or malformed record.
        let Some(name) = node_name.filter(|n| !n.is_empty()) else {
            return;
        };

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let host = state
            .hosts
            .entry(name.to_string())
            .or_insert_with(|| Host::new(0, name));
        if let Some(cores) = cpu_tot.and_then(|t| t.parse::<u32>().ok()) {
            host.core_count = cores;
        }

        let scheduler_state = state_field.unwrap_or("");
        host.state = scheduler_state.to_string();
        host.available = !scheduler_state.is_empty()
            && !scheduler_state.to_ascii_uppercase().starts_with("DOWN");
        // No metric extraction for an offline node; its last readings are
        // garbage and must not overwrite the current record.
        if !host.available {
            return;
        }

        let core_count = host.core_count;
        if let Some(load) = cpu_load.and_then(|l| l.parse::<f64>().ok()) {
            if core_count > 0 {
                let history = state
                    .cpu_history
                    .entry(name.to_string())
                    .or_insert_with(|| VecDeque::with_capacity(self.history_capacity));
                if history.len() == self.history_capacity {
                    history.pop_front();
                }
                history.push_back(CpuSample {
                    clock,
                    busy_pct: 100.0 * load / core_count as f64,
                });
            }
        }

        let mut hm = HostMeasurement::new(state.hosts[name].clone(), clock);

        if let Some(watts) = watts {
            hm.add_metric(MetricValue::keyed(keys::POWER, watts, clock));
        }
        if let Some(joules) = joules {
            hm.add_metric(MetricValue::keyed(keys::ENERGY, joules, clock));
        }

        if let Some(gres) = gres.filter(|g| !g.is_empty() && *g != GRES_NULL) {
            self.read_gres(&mut state, name, gres, &mut hm, clock);
            // Refresh the host snapshot so the measurement carries the
            // accelerators just registered.
            hm.host = state.hosts[name].clone();
        }
        if let Some(used) = gres_used.filter(|g| !g.is_empty() && *g != GRES_NULL) {
            read_gres_used(used, &mut hm, clock);
        }

        for token in &generic {
            read_generic(token, &mut hm, clock);
        }

        // Derived metrics are validated; a non-finite result is rejected and
        // stops the remaining derived/memory metrics. The partial record is
        // still published.
        let derived_ok = self.add_derived(&mut hm, cpu_load, core_count, free_mem, real_mem, clock);
        if !derived_ok {
            warn!(host = name, "derived metrics rejected, publishing partial record");
        }

        let power_known = hm.metric_exists(keys::POWER);
        state.current.insert(name.to_string(), hm.clone());
        if power_known {
            let replace_low = state
                .lowest
                .get(name)
                .is_none_or(|existing| hm.power() < existing.power());
            if replace_low {
                state.lowest.insert(name.to_string(), hm.clone());
            }
            let replace_high = state
                .highest
                .get(name)
                .is_none_or(|existing| hm.power() > existing.power());
            if replace_high {
                state.highest.insert(name.to_string(), hm);
            }
        }
    }

    /// Register accelerators from the GRES string and emit presence, name
    /// and count metrics. Entries look like `gpu:teslak20:2` or `mic:1`.
    fn read_gres(
        &self,
        state: &mut SlurmState,
        host_name: &str,
        gres: &str,
        hm: &mut HostMeasurement,
        clock: i64,
    ) {
        hm.add_metric(MetricValue::keyed(keys::ACCELERATOR_PRESENT, "true", clock));
        for entry in gres.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let kind = if entry.contains("gpu") {
                AcceleratorKind::Gpu
            } else if entry.contains("mic") {
                AcceleratorKind::Mic
            } else {
                continue;
            };
            let parts: Vec<&str> = entry.split(':').collect();
            let accel_name = if parts.len() >= 3 { parts[1] } else { parts[0] };
            let count = match parts.last().and_then(|p| p.parse::<u32>().ok()) {
                Some(count) => count,
                None => {
                    warn!(host = host_name, entry, "malformed GRES count, assuming 1");
                    1
                }
            };
            if let Some(host) = state.hosts.get_mut(host_name) {
                host.add_accelerator(Accelerator::new(accel_name, count, kind));
            }
            match kind {
                AcceleratorKind::Gpu => {
                    hm.add_metric(MetricValue::keyed(keys::GPU_PRESENT, "true", clock));
                    hm.add_metric(MetricValue::keyed(keys::GPU_NAME, accel_name, clock));
                    hm.add_metric(MetricValue::keyed(keys::GPU_COUNT, count.to_string(), clock));
                }
                AcceleratorKind::Mic => {
                    hm.add_metric(MetricValue::keyed(keys::MIC_PRESENT, "true", clock));
                    hm.add_metric(MetricValue::keyed(keys::MIC_NAME, accel_name, clock));
                    hm.add_metric(MetricValue::keyed(keys::MIC_COUNT, count.to_string(), clock));
                }
                AcceleratorKind::Fpga => {}
            }
        }
    }

    /// Derived CPU and memory metrics. Returns false when a derived value
    /// is non-finite, in which case nothing further is added.
    fn add_derived(
        &self,
        hm: &mut HostMeasurement,
        cpu_load: Option<&str>,
        core_count: u32,
        free_mem: Option<&str>,
        real_mem: Option<&str>,
        clock: i64,
    ) -> bool {
        if let Some(load) = cpu_load {
            // The N/A sentinel fails the parse and is rejected as NaN.
            let load = load.parse::<f64>().unwrap_or(f64::NAN);
            let spot = 100.0 * load / core_count as f64;
            if !validated_add(hm, keys::CPU_SPOT_USAGE, spot, clock) {
                return false;
            }
            if !validated_add(hm, keys::CPU_IDLE, 100.0 - spot, clock) {
                return false;
            }
        }
        if let Some(free) = free_mem {
            let mb = free.parse::<f64>().unwrap_or(f64::NAN) / 1_048_576.0;
            if !validated_add(hm, keys::MEMORY_AVAILABLE, mb, clock) {
                return false;
            }
        }
        if let Some(real) = real_mem {
            let mb = real.parse::<f64>().unwrap_or(f64::NAN) / 1_048_576.0;
            if !validated_add(hm, keys::MEMORY_TOTAL, mb, clock) {
                return false;
            }
        }
        true
    }
}

/// `GresUsed` entries follow the GRES split but only the first numeric
/// token per entry matters, e.g. `gpu:teslak20:1` or `mic:0`.
fn read_gres_used(gres_used: &str, hm: &mut HostMeasurement, clock: i64) {
    for entry in gres_used.split(',') {
        let entry = entry.trim();
        let Some(used) = entry.split(':').find_map(|t| t.parse::<u32>().ok()) else {
            continue;
        };
        if entry.contains("gpu") {
            hm.add_metric(MetricValue::keyed(keys::GPU_USED, used.to_string(), clock));
        } else if entry.contains("mic") {
            hm.add_metric(MetricValue::keyed(keys::MIC_USED, used.to_string(), clock));
        }
    }
}

/// Remaining tokens become metrics generically. One `=` is a plain pair;
/// none keeps the key with an empty value (which the model discards);
/// several, like `CfgTRES=cpu=32,mem=64408M`, split into `key:subkey`
/// pairs. A malformed token is skipped, never fatal.
fn read_generic(token: &str, hm: &mut HostMeasurement, clock: i64) {
    let eq_count = token.matches('=').count();
    match eq_count {
        0 => hm.add_metric(MetricValue::keyed(token, "", clock)),
        1 => {
            let (key, value) = token.split_once('=').unwrap_or((token, ""));
            hm.add_metric(MetricValue::keyed(key, value, clock));
        }
        _ => {
            let parts: Vec<&str> = token.split(['=', ',']).collect();
            if parts.len() < 3 || parts.len() % 2 == 0 {
                warn!(token, "malformed multi-value token, skipping");
                return;
            }
            let base = parts[0];
            for pair in parts[1..].chunks(2) {
                hm.add_metric(MetricValue::keyed(
                    &format!("{}:{}", base, pair[0]),
                    pair[1],
                    clock,
                ));
            }
        }
    }
}

/// Add a derived metric, rejecting NaN and infinite values.
fn validated_add(hm: &mut HostMeasurement, key: &str, value: f64, clock: i64) -> bool {
    if !value.is_finite() {
        warn!(key, "derived metric is not finite, rejecting");
        return false;
    }
    hm.add_metric(MetricValue::keyed(key, value.to_string(), clock));
    true
}

#[async_trait::async_trait]
impl Collector for SlurmCollector {
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
        state.current.get(&host.name).cloned()
    }

    async fn lowest_power(&self, host: &Host) -> f64 {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .lowest
            .get(&host.name)
            .map(HostMeasurement::power)
            .unwrap_or(0.0)
    }

    async fn highest_power(&self, host: &Host) -> f64 {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .highest
            .get(&host.name)
            .map(HostMeasurement::power)
            .unwrap_or(0.0)
    }

    async fn cpu_utilisation(&self, host: &Host, window: Duration) -> f64 {
        if window.is_zero() {
            return 0.0;
        }
        let cutoff = now_secs() - window.as_secs() as i64;
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let Some(history) = state.cpu_history.get(&host.name) else {
            return 0.0;
        };
        let recent: Vec<f64> = history
            .iter()
            .filter(|s| s.clock >= cutoff)
            .map(|s| s.busy_pct)
            .collect();
        if recent.is_empty() {
            return 0.0;
        }
        let mean = recent.iter().sum::<f64>() / recent.len() as f64;
        (mean / 100.0).clamp(0.0, 1.0)
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
