use crate::report::{DiskUsage, SystemSnapshot};
use crate::runner::{CommandRunner, ProbeCommand};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{System, SystemExt};
use thiserror::Error;
use tracing::warn;

pub struct SystemCollector {
    mount_point: String,
    disk_timeout: Duration,
    runner: Arc<dyn CommandRunner>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DiskParseError {
    #[error("unexpected df output format: {count} parts, output: \"{output}\"")]
    TooFewFields { count: usize, output: String },
    #[error("unable to parse disk stats - invalid numbers: total={total}, used={used}, avail={available}")]
    InvalidNumbers {
        total: String,
        used: String,
        available: String,
    },
    #[error("unable to parse disk stats - total size is zero")]
    ZeroTotal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskTotals {
    pub total: u64,
    pub used: u64,
    pub available: u64,
}

impl SystemCollector {
    pub fn new(mount_point: impl Into<String>, disk_timeout: Duration, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            mount_point: mount_point.into(),
            disk_timeout,
            runner,
        }
    }

    pub async fn collect(&self) -> SystemSnapshot {
        let host = HostStats::read();
        SystemSnapshot {
            hostname: host.hostname,
            uptime_seconds: host.uptime_seconds,
            memory_total_bytes: host.memory_total_bytes,
            memory_used_bytes: host.memory_total_bytes - host.memory_free_bytes,
            memory_free_bytes: host.memory_free_bytes,
            load_average: host.load_average,
            disk: self.disk_usage().await,
        }
    }

    async fn disk_usage(&self) -> DiskUsage {
        let cmd = ProbeCommand::new("df").args(["-P", "-B1"]).arg(self.mount_point.as_str());
        let result = match self.runner.run(&cmd, self.disk_timeout).await {
            Ok(out) => parse_df(&out).map_err(|err| err.to_string()),
            Err(err) => Err(err.to_string()),
        };

        match result {
            Ok(totals) => DiskUsage::Measured {
                path: self.mount_point.clone(),
                total_bytes: totals.total,
                used_bytes: totals.used,
                available_bytes: totals.available,
            },
            Err(error) => {
                warn!(mount = %self.mount_point, error = %error, "disk stats unavailable");
                DiskUsage::Failed {
                    path: self.mount_point.clone(),
                    error,
                }
            }
        }
    }
}

struct HostStats {
    hostname: String,
    uptime_seconds: u64,
    memory_total_bytes: u64,
    memory_free_bytes: u64,
    load_average: [f64; 3],
}

impl HostStats {
    fn read() -> Self {
        let mut system = System::new();
        system.refresh_memory();

        let memory_total_bytes = system.total_memory();
        let load = system.load_average();
        Self {
            hostname: system.host_name().unwrap_or_else(|| "unknown".to_string()),
            uptime_seconds: system.uptime(),
            memory_total_bytes,
            memory_free_bytes: system.available_memory().min(memory_total_bytes),
            load_average: [load.one, load.five, load.fifteen],
        }
    }
}

/// Last line of `df -B1`: filesystem, total, used, available, ...
pub fn parse_df(out: &str) -> Result<DiskTotals, DiskParseError> {
    let line = out.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 4 {
        return Err(DiskParseError::TooFewFields {
            count: parts.len(),
            output: line.trim().to_string(),
        });
    }

    let (total, used, available) = match (
        parts[1].parse::<u64>(),
        parts[2].parse::<u64>(),
        parts[3].parse::<u64>(),
    ) {
        (Ok(t), Ok(u), Ok(a)) => (t, u, a),
        _ => {
            return Err(DiskParseError::InvalidNumbers {
                total: parts[1].to_string(),
                used: parts[2].to_string(),
                available: parts[3].to_string(),
            })
        }
    };
    if total == 0 {
        return Err(DiskParseError::ZeroTotal);
    }

    Ok(DiskTotals {
        total,
        used,
        available,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::scripted::ScriptedRunner;
    use crate::runner::ProbeFailure;

    const DF_OUTPUT: &str = "Filesystem 1-blocks Used Available Capacity Mounted on\n\
pool0 62340163567616 50069504 62340113498112 1% /pool0\n";

    #[test]
    fn parse_df_reads_last_line() {
        let totals = parse_df(DF_OUTPUT).unwrap();
        assert_eq!(
            totals,
            DiskTotals {
                total: 62_340_163_567_616,
                used: 50_069_504,
                available: 62_340_113_498_112,
            }
        );
    }

    #[test]
    fn parse_df_rejects_short_and_garbage_lines() {
        assert!(matches!(
            parse_df("pool0 123 456"),
            Err(DiskParseError::TooFewFields { count: 3, .. })
        ));
        assert!(matches!(
            parse_df("pool0 lots 1 2 1% /pool0"),
            Err(DiskParseError::InvalidNumbers { .. })
        ));
        assert_eq!(parse_df("pool0 0 0 0 0% /pool0"), Err(DiskParseError::ZeroTotal));
        assert!(parse_df("").is_err());
    }

    #[tokio::test]
    async fn bad_df_output_degrades_disk_only() {
        let runner = Arc::new(ScriptedRunner::new().ok("df ", "pool0 123\n"));
        let snap = SystemCollector::new("/pool0", Duration::from_secs(1), runner)
            .collect()
            .await;

        match &snap.disk {
            DiskUsage::Failed { path, error } => {
                assert_eq!(path, "/pool0");
                assert!(error.contains("2 parts"));
            }
            other => panic!("expected failed disk stats, got {other:?}"),
        }
        assert!(snap.memory_used_bytes <= snap.memory_total_bytes);
        assert_eq!(
            snap.memory_used_bytes + snap.memory_free_bytes,
            snap.memory_total_bytes
        );
        assert!(!snap.hostname.is_empty());
    }

    #[tokio::test]
    async fn df_failure_is_reported_on_disk() {
        let runner = Arc::new(
            ScriptedRunner::new().fail("df ", ProbeFailure::Exec("df: /pool0: No such file".into())),
        );
        let snap = SystemCollector::new("/pool0", Duration::from_secs(1), runner.clone())
            .collect()
            .await;
        assert!(matches!(snap.disk, DiskUsage::Failed { .. }));
        assert_eq!(runner.calls(), vec!["df -P -B1 /pool0".to_string()]);
    }

    #[tokio::test]
    async fn df_output_is_measured() {
        let runner = Arc::new(ScriptedRunner::new().ok("df ", DF_OUTPUT));
        let snap = SystemCollector::new("/pool0", Duration::from_secs(1), runner)
            .collect()
            .await;
        assert!(matches!(
            snap.disk,
            DiskUsage::Measured { used_bytes: 50_069_504, .. }
        ));
    }
}
