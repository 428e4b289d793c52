//! Entities described by measurements.
//!
//! Hosts and accelerators are identified by name: two `Host` values with
//! the same name are the same host regardless of id or capacity fields,
//! which lets collectors enrich a host in place as discovery learns more.

use std::collections::HashSet;
use std::hash::{Hash, Hasher};

use strum_macros::{AsRefStr, Display, EnumString};

/// Kind of attached accelerator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum AcceleratorKind {
    /// General purpose GPU.
    Gpu,
    /// Many-integrated-core coprocessor.
    Mic,
    /// FPGA board.
    Fpga,
}

/// An accelerator attached to a host. Identity is by name only.
#[derive(Debug, Clone)]
pub struct Accelerator {
    /// Model name, e.g. `teslak20`.
    pub name: String,
    /// Number of units attached.
    pub count: u32,
    /// What family of accelerator this is.
    pub kind: AcceleratorKind,
}

impl Accelerator {
    /// Create a new accelerator descriptor.
    pub fn new(name: impl Into<String>, count: u32, kind: AcceleratorKind) -> Self {
        Self {
            name: name.into(),
            count,
            kind,
        }
    }
}

impl PartialEq for Accelerator {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Accelerator {}

impl Hash for Accelerator {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

/// A physical host in the cluster. Identity is by name only.
#[derive(Debug, Clone)]
pub struct Host {
    /// Back-end specific numeric id; 0 when the source has none.
    pub id: i64,
    /// Host name, the sole identity field.
    pub name: String,
    /// Whether the host is currently usable.
    pub available: bool,
    /// Source-native state string, e.g. `IDLE` or `DOWN+DRAIN`.
    pub state: String,
    /// Physical core count; 0 until discovery learns it.
    pub core_count: u32,
    /// Total memory in megabytes; 0 until discovery learns it.
    pub ram_mb: u64,
    /// Total disk in gigabytes; 0 until discovery learns it.
    pub disk_gb: f64,
    /// Accelerators attached to this host.
    pub accelerators: HashSet<Accelerator>,
}

impl Host {
    /// Create a host known only by id and name, assumed available.
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            available: true,
            state: String::new(),
            core_count: 0,
            ram_mb: 0,
            disk_gb: 0.0,
            accelerators: HashSet::new(),
        }
    }

    /// Copy of this host under a different name, all other fields kept.
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        let mut host = self.clone();
        host.name = name.into();
        host
    }

    /// Attach an accelerator; idempotent per accelerator name.
    pub fn add_accelerator(&mut self, accelerator: Accelerator) {
        self.accelerators.insert(accelerator);
    }

    /// Whether any accelerator is attached.
    pub fn has_accelerator(&self) -> bool {
        !self.accelerators.is_empty()
    }

    /// Whether a GPU is attached.
    pub fn has_gpu(&self) -> bool {
        self.accelerators
            .iter()
            .any(|a| a.kind == AcceleratorKind::Gpu)
    }

    /// Whether a MIC is attached.
    pub fn has_mic(&self) -> bool {
        self.accelerators
            .iter()
            .any(|a| a.kind == AcceleratorKind::Mic)
    }

    /// Total GPU units attached.
    pub fn gpu_count(&self) -> u32 {
        self.accelerators
            .iter()
            .filter(|a| a.kind == AcceleratorKind::Gpu)
            .map(|a| a.count)
            .sum()
    }

    /// Total MIC units attached.
    pub fn mic_count(&self) -> u32 {
        self.accelerators
            .iter()
            .filter(|a| a.kind == AcceleratorKind::Mic)
            .map(|a| a.count)
            .sum()
    }
}

impl PartialEq for Host {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Host {}

impl Hash for Host {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

/// A virtual machine deployed somewhere in the cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct DeployedVm {
    /// Back-end specific numeric id; 0 when the source has none.
    pub id: i64,
    /// VM name.
    pub name: String,
    /// Name of the physical host the VM runs on, when known.
    pub allocated_to: Option<String>,
}

impl DeployedVm {
    /// Create a VM record not yet allocated to a host.
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            allocated_to: None,
        }
    }
}

/// Either a physical host or a virtual machine.
#[derive(Debug, Clone)]
pub enum Entity {
    /// A physical host.
    Host(Host),
    /// A deployed virtual machine.
    Virtual(DeployedVm),
}

impl Entity {
    /// Name of the underlying entity.
    pub fn name(&self) -> &str {
        match self {
            Entity::Host(h) => &h.name,
            Entity::Virtual(v) => &v.name,
        }
    }
}

/// Lifecycle state of a job or application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "UPPERCASE")]
pub enum JobStatus {
    /// Queued, not yet started.
    Pending,
    /// Currently executing.
    Running,
    /// Started but paused.
    Suspended,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully.
    Failed,
}

/// An application instance running on a named host.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplicationOnHost {
    /// Back-end specific id; 0 when the source has none.
    pub id: i64,
    /// Application name or signature.
    pub name: String,
    /// Name of the host the application runs on.
    pub host_name: String,
    /// Current lifecycle state.
    pub status: JobStatus,
}

impl ApplicationOnHost {
    /// Create an application record.
    pub fn new(
        id: i64,
        name: impl Into<String>,
        host_name: impl Into<String>,
        status: JobStatus,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            host_name: host_name.into(),
            status,
        }
    }
}
