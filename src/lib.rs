//! Gridmon - Cluster Metric Normalization and Fusion
//!
//! This crate collects point-in-time resource metrics (power, CPU, memory,
//! accelerators, job state) from heterogeneous cluster monitoring back-ends
//! and normalizes them into one canonical measurement model.
//!
//! # Architecture
//!
//! - **Canonical model**: [`metric::Measurement`] with last-writer-wins
//!   conflict resolution, staleness handling, and merging
//! - **Collectors**: one per back-end (relational store, time-series store,
//!   batch scheduler, distributed runtime) behind the uniform
//!   [`collector::Collector`] contract
//! - **Fusion**: a collector composed of two inner collectors that
//!   reconciles host identity and metric precedence
//! - **Drivers**: background tasks that poll commands/documents or tail a
//!   scrape file and feed the collectors
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use gridmon::collector::{Collector, ShellCommandRunner, SlurmCollector};
//! use gridmon::config::AppConfig;
//! use gridmon::driver::spawn_slurm_poller;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = AppConfig::load("gridmon.yaml").expect("config");
//!     let slurm = Arc::new(SlurmCollector::new(config.slurm));
//!     let driver = spawn_slurm_poller(slurm.clone(), Arc::new(ShellCommandRunner));
//!
//!     for host in slurm.host_list().await {
//!         if let Some(m) = slurm.host_measurement(&host).await {
//!             println!("{}: {} W", host.name, m.power());
//!         }
//!     }
//!
//!     driver.shutdown().await;
//! }
//! ```

pub mod collector;
pub mod config;
pub mod driver;
pub mod error;
pub mod metric;
pub mod types;

pub use collector::{ApplicationCollector, Collector};
pub use config::{AppConfig, ConfigError};
pub use error::CollectorError;
pub use metric::{ApplicationMeasurement, HostMeasurement, Measurement, MetricValue};
pub use types::{Accelerator, ApplicationOnHost, DeployedVm, Entity, Host, JobStatus};
