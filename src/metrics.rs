use crate::report::{DiskUsage, NodeStatsReport};
use chrono::{Local, TimeZone};
use prometheus::core::Collector;
use prometheus::{opts, Counter, Encoder, Gauge, GaugeVec, Registry, TextEncoder};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub nodestat_requests_total: Counter,
    pub nodestat_collect_failures_total: Counter,
    pub nodestat_scrape_count_total: Counter,
    pub nodestat_collect_duration_seconds: Gauge,
    pub nodestat_last_collect_timestamp_seconds: Gauge,
    pub nodestat_memory_used_bytes: Gauge,
    pub nodestat_memory_total_bytes: Gauge,
    pub nodestat_disk_used_bytes: GaugeVec,
    pub nodestat_disk_total_bytes: GaugeVec,
    pub nodestat_repo_daemon_up: GaugeVec,
    pub nodestat_repo_size_bytes: GaugeVec,
    pub nodestat_repo_pins: GaugeVec,
    pub nodestat_repo_peers: GaugeVec,
    pub nodestat_gc_last_run_timestamp_seconds: Gauge,
    pub nodestat_gc_blocks_removed: Gauge,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let nodestat_requests_total = Counter::with_opts(opts!(
            "nodestat_requests_total",
            "Node stats requests served"
        ))?;
        let nodestat_collect_failures_total = Counter::with_opts(opts!(
            "nodestat_collect_failures_total",
            "Node stats requests that failed with an internal error"
        ))?;
        let nodestat_scrape_count_total = Counter::with_opts(opts!(
            "nodestat_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;
        let nodestat_collect_duration_seconds = Gauge::with_opts(opts!(
            "nodestat_collect_duration_seconds",
            "Wall time of the last collection"
        ))?;
        let nodestat_last_collect_timestamp_seconds = Gauge::with_opts(opts!(
            "nodestat_last_collect_timestamp_seconds",
            "Unix time of the last successful collection"
        ))?;
        let nodestat_memory_used_bytes =
            Gauge::with_opts(opts!("nodestat_memory_used_bytes", "Used memory in bytes"))?;
        let nodestat_memory_total_bytes =
            Gauge::with_opts(opts!("nodestat_memory_total_bytes", "Total memory in bytes"))?;
        let nodestat_disk_used_bytes = GaugeVec::new(
            opts!("nodestat_disk_used_bytes", "Disk used bytes by mount"),
            &["mount"],
        )?;
        let nodestat_disk_total_bytes = GaugeVec::new(
            opts!("nodestat_disk_total_bytes", "Disk total bytes by mount"),
            &["mount"],
        )?;
        let nodestat_repo_daemon_up = GaugeVec::new(
            opts!("nodestat_repo_daemon_up", "1 if the repository daemon answered"),
            &["role"],
        )?;
        let nodestat_repo_size_bytes = GaugeVec::new(
            opts!("nodestat_repo_size_bytes", "Repository size in bytes"),
            &["role"],
        )?;
        let nodestat_repo_pins = GaugeVec::new(
            opts!("nodestat_repo_pins", "Recursive pins per repository"),
            &["role"],
        )?;
        let nodestat_repo_peers = GaugeVec::new(
            opts!("nodestat_repo_peers", "Connected swarm peers per repository"),
            &["role"],
        )?;
        let nodestat_gc_last_run_timestamp_seconds = Gauge::with_opts(opts!(
            "nodestat_gc_last_run_timestamp_seconds",
            "Unix time of the last observed GC run, 0 if unknown"
        ))?;
        let nodestat_gc_blocks_removed = Gauge::with_opts(opts!(
            "nodestat_gc_blocks_removed",
            "Blocks removed by the last observed GC run"
        ))?;

        register(&registry, &nodestat_requests_total)?;
        register(&registry, &nodestat_collect_failures_total)?;
        register(&registry, &nodestat_scrape_count_total)?;
        register(&registry, &nodestat_collect_duration_seconds)?;
        register(&registry, &nodestat_last_collect_timestamp_seconds)?;
        register(&registry, &nodestat_memory_used_bytes)?;
        register(&registry, &nodestat_memory_total_bytes)?;
        register(&registry, &nodestat_disk_used_bytes)?;
        register(&registry, &nodestat_disk_total_bytes)?;
        register(&registry, &nodestat_repo_daemon_up)?;
        register(&registry, &nodestat_repo_size_bytes)?;
        register(&registry, &nodestat_repo_pins)?;
        register(&registry, &nodestat_repo_peers)?;
        register(&registry, &nodestat_gc_last_run_timestamp_seconds)?;
        register(&registry, &nodestat_gc_blocks_removed)?;

        Ok(Arc::new(Self {
            registry,
            nodestat_requests_total,
            nodestat_collect_failures_total,
            nodestat_scrape_count_total,
            nodestat_collect_duration_seconds,
            nodestat_last_collect_timestamp_seconds,
            nodestat_memory_used_bytes,
            nodestat_memory_total_bytes,
            nodestat_disk_used_bytes,
            nodestat_disk_total_bytes,
            nodestat_repo_daemon_up,
            nodestat_repo_size_bytes,
            nodestat_repo_pins,
            nodestat_repo_peers,
            nodestat_gc_last_run_timestamp_seconds,
            nodestat_gc_blocks_removed,
        }))
    }

    pub fn update_from_report(&self, report: &NodeStatsReport, took: Duration) {
        self.nodestat_collect_duration_seconds.set(took.as_secs_f64());
        self.nodestat_last_collect_timestamp_seconds
            .set(report.timestamp.timestamp() as f64);

        let system = &report.system;
        self.nodestat_memory_used_bytes
            .set(system.memory_used_bytes as f64);
        self.nodestat_memory_total_bytes
            .set(system.memory_total_bytes as f64);
        match &system.disk {
            DiskUsage::Measured {
                path,
                total_bytes,
                used_bytes,
                ..
            } => {
                let labels = [path.as_str()];
                set_or_clear(&self.nodestat_disk_used_bytes, &labels, Some(*used_bytes));
                set_or_clear(&self.nodestat_disk_total_bytes, &labels, Some(*total_bytes));
            }
            DiskUsage::Failed { path, .. } => {
                let labels = [path.as_str()];
                set_or_clear(&self.nodestat_disk_used_bytes, &labels, None);
                set_or_clear(&self.nodestat_disk_total_bytes, &labels, None);
            }
        }

        for (role, repo) in &report.repositories {
            let labels = [role.as_str()];
            self.nodestat_repo_daemon_up
                .with_label_values(&labels)
                .set(if repo.daemon_running { 1.0 } else { 0.0 });
            set_or_clear(&self.nodestat_repo_size_bytes, &labels, repo.size_bytes);
            set_or_clear(&self.nodestat_repo_pins, &labels, repo.pin_count);
            set_or_clear(&self.nodestat_repo_peers, &labels, repo.peer_count);
        }

        let last_run = report
            .gc
            .last_run
            .and_then(|naive| Local.from_local_datetime(&naive).earliest())
            .map(|dt| dt.timestamp())
            .unwrap_or(0);
        self.nodestat_gc_last_run_timestamp_seconds
            .set(last_run as f64);
        self.nodestat_gc_blocks_removed
            .set(report.gc.blocks_removed.unwrap_or(0) as f64);
    }

    pub fn inc_request(&self) {
        self.nodestat_requests_total.inc();
    }

    pub fn inc_collect_failure(&self) {
        self.nodestat_collect_failures_total.inc();
    }

    pub fn inc_scrape_count(&self) {
        self.nodestat_scrape_count_total.inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

/// Absent values drop the series instead of exporting a stale number.
fn set_or_clear(gauge: &GaugeVec, labels: &[&str], value: Option<u64>) {
    match value {
        Some(v) => gauge.with_label_values(labels).set(v as f64),
        None => {
            let _ = gauge.remove_label_values(labels);
        }
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}
