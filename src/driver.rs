//! Ingestion drivers.
//!
//! Each continuously-ingesting collector gets its own background task:
//! a poll driver running the scrape command or document fetch on an
//! interval, or a tail driver following a growing scrape file. Drivers
//! feed collectors and never publish records themselves; publication
//! happens inside the collectors under their own locks.
//!
//! Shutdown is graceful: the watch signal stops new ticks while the
//! in-flight one finishes, so a partially-parsed record is never left
//! behind.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::collector::{CommandRunner, CompssCollector, DocumentSource, SlurmCollector};
use crate::config::ScrapeMode;

/// Handle to a running driver task.
pub struct DriverHandle {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl DriverHandle {
    /// Signal the driver to stop and wait for the in-flight tick to
    /// finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

/// Spawn the driver the scheduler configuration asks for: a poller in
/// poll mode, or a tailer over the configured scrape file in tail mode
/// (the runner is unused there).
pub fn spawn_slurm_driver(
    collector: Arc<SlurmCollector>,
    runner: Arc<dyn CommandRunner>,
) -> DriverHandle {
    match collector.config().mode {
        ScrapeMode::Poll => spawn_slurm_poller(collector, runner),
        ScrapeMode::Tail => {
            let path = PathBuf::from(&collector.config().scrape_file);
            let poll = collector.config().interval;
            spawn_slurm_tailer(collector, path, poll)
        }
    }
}

/// Spawn a poll driver that runs the scheduler scrape command on the
/// collector's configured interval and feeds the output lines to it.
pub fn spawn_slurm_poller(
    collector: Arc<SlurmCollector>,
    runner: Arc<dyn CommandRunner>,
) -> DriverHandle {
    let (tx, mut rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        let command = collector.scrape_command();
        let timeout = collector.config().timeout;
        let mut ticker = tokio::time::interval(collector.config().interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match tokio::time::timeout(timeout, runner.run(&command)).await {
                        Ok(Ok(lines)) => {
                            for line in &lines {
                                collector.parse_line(line);
                            }
                        }
                        Ok(Err(e)) => warn!(error = %e, "scrape command failed"),
                        Err(_) => warn!("scrape command timed out"),
                    }
                }
                _ = rx.changed() => break,
            }
        }
    });
    DriverHandle {
        shutdown: tx,
        handle,
    }
}

/// Spawn a poll driver that fetches the runtime monitor document on the
/// collector's configured interval and refreshes the collector snapshot.
pub fn spawn_compss_poller(
    collector: Arc<CompssCollector>,
    source: Arc<dyn DocumentSource>,
) -> DriverHandle {
    let (tx, mut rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        let timeout = collector.config().timeout;
        let mut ticker = tokio::time::interval(collector.config().interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match tokio::time::timeout(timeout, source.fetch()).await {
                        Ok(Ok(doc)) => collector.refresh(&doc),
                        Ok(Err(e)) => warn!(error = %e, "monitor document fetch failed"),
                        Err(_) => warn!("monitor document fetch timed out"),
                    }
                }
                _ = rx.changed() => break,
            }
        }
    });
    DriverHandle {
        shutdown: tx,
        handle,
    }
}

/// Spawn a tail driver that follows `path` by byte offset on `poll`
/// intervals and feeds complete new lines to the scheduler parser.
/// Truncation of the file resets the offset.
pub fn spawn_slurm_tailer(
    collector: Arc<SlurmCollector>,
    path: PathBuf,
    poll: Duration,
) -> DriverHandle {
    let (tx, mut rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        let mut offset: u64 = 0;
        let mut carry = String::new();
        let mut ticker = tokio::time::interval(poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match read_new_lines(&path, &mut offset, &mut carry).await {
                        Ok(lines) => {
                            for line in &lines {
                                collector.parse_line(line);
                            }
                        }
                        // The file may not exist yet; keep polling.
                        Err(e) => debug!(path = %path.display(), error = %e, "scrape file unreadable"),
                    }
                }
                _ = rx.changed() => break,
            }
        }
    });
    DriverHandle {
        shutdown: tx,
        handle,
    }
}

/// Read everything appended past `offset`, returning the complete lines.
/// A trailing partial line is carried over to the next call.
async fn read_new_lines(
    path: &Path,
    offset: &mut u64,
    carry: &mut String,
) -> std::io::Result<Vec<String>> {
    let mut file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    if len < *offset {
        // Truncated or rotated in place; start over.
        *offset = 0;
        carry.clear();
    }
    if len == *offset {
        return Ok(Vec::new());
    }
    file.seek(SeekFrom::Start(*offset)).await?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).await?;
    *offset += buf.len() as u64;
    carry.push_str(&String::from_utf8_lossy(&buf));

    let mut lines = Vec::new();
    while let Some(pos) = carry.find('\n') {
        let line: String = carry.drain(..=pos).collect();
        let line = line.trim_end_matches(['\n', '\r']);
        if !line.is_empty() {
            lines.push(line.to_string());
        }
    }
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use crate::collector::Collector;
    use crate::config::{CompssConfig, SlurmConfig};
    use crate::error::CollectorError;

    struct CountingRunner {
        lines: Vec<String>,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl CommandRunner for CountingRunner {
        async fn run(&self, _command: &str) -> Result<Vec<String>, CollectorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.lines.clone())
        }
    }

    fn fast_slurm_collector() -> Arc<SlurmCollector> {
        let mut config = SlurmConfig::default();
        config.interval = Duration::from_millis(10);
        Arc::new(SlurmCollector::new(config))
    }

    #[tokio::test]
    async fn test_poller_feeds_lines_and_stops_on_shutdown() {
        let collector = fast_slurm_collector();
        let runner = Arc::new(CountingRunner {
            lines: vec!["NodeName=ns52;State=IDLE;CPUTot=12;CPULoad=1.0;CurrentWatts=80".to_string()],
            calls: AtomicUsize::new(0),
        });
        let driver = spawn_slurm_poller(collector.clone(), runner.clone());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(collector.host_by_name("ns52").await.is_some());
        assert!(runner.calls.load(Ordering::SeqCst) >= 1);

        driver.shutdown().await;
        let after = runner.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(runner.calls.load(Ordering::SeqCst), after);
    }

    #[tokio::test]
    async fn test_tailer_picks_up_appended_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slurm-host-data.log");
        std::fs::write(&path, "NodeName=ns52;State=IDLE;CPUTot=12;CPULoad=1.0;CurrentWatts=70\n")
            .unwrap();

        let collector = fast_slurm_collector();
        let driver = spawn_slurm_tailer(
            collector.clone(),
            path.clone(),
            Duration::from_millis(10),
        );

        tokio::time::sleep(Duration::from_millis(80)).await;
        let host = collector.host_by_name("ns52").await.unwrap();
        assert_eq!(collector.host_measurement(&host).await.unwrap().power(), 70.0);

        // Appended records are picked up on later polls.
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(
            file,
            "NodeName=ns52;State=IDLE;CPUTot=12;CPULoad=1.0;CurrentWatts=95"
        )
        .unwrap();
        drop(file);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(collector.host_measurement(&host).await.unwrap().power(), 95.0);
        assert_eq!(collector.highest_power(&host).await, 95.0);
        assert_eq!(collector.lowest_power(&host).await, 70.0);

        driver.shutdown().await;
    }

    #[tokio::test]
    async fn test_tailer_carries_partial_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slurm-host-data.log");
        // No trailing newline: the record is incomplete.
        std::fs::write(&path, "NodeName=ns52;State=IDLE;CPUTot=12").unwrap();

        let collector = fast_slurm_collector();
        let driver = spawn_slurm_tailer(
            collector.clone(),
            path.clone(),
            Duration::from_millis(10),
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(collector.host_by_name("ns52").await.is_none());

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, ";CPULoad=1.0;CurrentWatts=80").unwrap();
        drop(file);

        tokio::time::sleep(Duration::from_millis(80)).await;
        let host = collector.host_by_name("ns52").await.unwrap();
        // The joined line parsed as one record.
        assert_eq!(host.core_count, 12);

        driver.shutdown().await;
    }

    #[tokio::test]
    async fn test_driver_dispatches_on_tail_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slurm-host-data.log");
        std::fs::write(&path, "NodeName=ns52;State=IDLE;CPUTot=12;CPULoad=1.0;CurrentWatts=60\n")
            .unwrap();

        let mut config = SlurmConfig::default();
        config.mode = ScrapeMode::Tail;
        config.scrape_file = path.to_string_lossy().into_owned();
        config.interval = Duration::from_millis(10);
        let collector = Arc::new(SlurmCollector::new(config));

        // The runner must stay untouched in tail mode.
        let runner = Arc::new(CountingRunner {
            lines: Vec::new(),
            calls: AtomicUsize::new(0),
        });
        let driver = spawn_slurm_driver(collector.clone(), runner.clone());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(collector.host_by_name("ns52").await.is_some());
        assert_eq!(runner.calls.load(Ordering::SeqCst), 0);

        driver.shutdown().await;
    }

    struct FixedDocument;

    #[async_trait::async_trait]
    impl DocumentSource for FixedDocument {
        async fn fetch(&self) -> Result<serde_json::Value, CollectorError> {
            Ok(json!({
                "resources": {
                    "ns51": { "Status": "Running", "TotalCPUComputingUnits": 16, "Actions": "" }
                }
            }))
        }
    }

    #[tokio::test]
    async fn test_compss_poller_refreshes_snapshot() {
        let mut config = CompssConfig::default();
        config.interval = Duration::from_millis(10);
        let collector = Arc::new(CompssCollector::new(config));
        let driver = spawn_compss_poller(collector.clone(), Arc::new(FixedDocument));

        tokio::time::sleep(Duration::from_millis(80)).await;
        let host = collector.host_by_name("ns51").await.unwrap();
        assert_eq!(host.core_count, 16);

        driver.shutdown().await;
    }
}
