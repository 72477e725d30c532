use chrono::{DateTime, NaiveDateTime, Utc};
use std::collections::BTreeMap;
use std::path::PathBuf;

pub const GIB: u64 = 1024 * 1024 * 1024;
pub const TIB: u64 = GIB * 1024;

#[derive(Debug, Clone)]
pub struct NodeStatsReport {
    pub timestamp: DateTime<Utc>,
    pub system: SystemSnapshot,
    /// Keyed by repository role.
    pub repositories: BTreeMap<String, RepositorySnapshot>,
    pub gc: GcRunRecord,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RepositorySnapshot {
    pub path: PathBuf,
    pub daemon_running: bool,
    pub size_bytes: Option<u64>,
    pub block_count: Option<u64>,
    pub pin_count: Option<u64>,
    pub daemon_version: Option<String>,
    pub peer_count: Option<u64>,
    pub error_message: Option<String>,
}

impl RepositorySnapshot {
    pub fn failed(path: PathBuf, error: impl Into<String>) -> Self {
        Self {
            path,
            error_message: Some(error.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct SystemSnapshot {
    pub hostname: String,
    pub uptime_seconds: u64,
    pub memory_total_bytes: u64,
    pub memory_used_bytes: u64,
    pub memory_free_bytes: u64,
    pub load_average: [f64; 3],
    pub disk: DiskUsage,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DiskUsage {
    Measured {
        path: String,
        total_bytes: u64,
        used_bytes: u64,
        available_bytes: u64,
    },
    Failed {
        path: String,
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct GcRunRecord {
    pub last_run: Option<NaiveDateTime>,
    pub blocks_removed: Option<u64>,
    pub duration_seconds: Option<u64>,
    /// Set when `duration_seconds` is the block-count heuristic rather than
    /// a difference of logged timestamps.
    pub duration_estimated: bool,
    pub next_scheduled: Option<NaiveDateTime>,
    pub status: GcStatus,
    pub log_path: PathBuf,
    pub error: Option<String>,
}

impl GcRunRecord {
    pub fn unknown(log_path: PathBuf, status: GcStatus) -> Self {
        Self {
            last_run: None,
            blocks_removed: None,
            duration_seconds: None,
            duration_estimated: false,
            next_scheduled: None,
            status,
            log_path,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcStatus {
    Success,
    LogMissing,
    NoLogs,
    NoActivity,
    UnparseableTimestamps,
    Unreadable,
}

impl GcStatus {
    pub fn phrase(self) -> &'static str {
        match self {
            GcStatus::Success => "success",
            GcStatus::LogMissing => "GC log not found",
            GcStatus::NoLogs => "No GC logs found",
            GcStatus::NoActivity => "No GC activity found in logs",
            GcStatus::UnparseableTimestamps => "Unparseable GC timestamps",
            GcStatus::Unreadable => "Error reading log",
        }
    }
}

/// Byte count in the single unit the API reports it in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SizeUnit {
    Gigabytes(f64),
    Terabytes(f64),
}

impl SizeUnit {
    pub fn from_bytes(bytes: u64) -> Self {
        if bytes >= TIB {
            SizeUnit::Terabytes(bytes as f64 / TIB as f64)
        } else {
            SizeUnit::Gigabytes(bytes as f64 / GIB as f64)
        }
    }
}

pub fn one_decimal(value: f64) -> String {
    format!("{value:.1}")
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn percent(part: u64, whole: u64) -> u64 {
    if whole == 0 {
        return 0;
    }
    ((part as f64 / whole as f64) * 100.0).round() as u64
}

/// Coarse label using only the largest unit that applies: "3 days",
/// "1 hour", "12 minutes".
pub fn coarse_duration(seconds: u64) -> String {
    let days = seconds / 86_400;
    let hours = (seconds % 86_400) / 3_600;
    let minutes = (seconds % 3_600) / 60;
    if days > 0 {
        plural(days, "day")
    } else if hours > 0 {
        plural(hours, "hour")
    } else {
        plural(minutes, "minute")
    }
}

fn plural(n: u64, unit: &str) -> String {
    if n == 1 {
        format!("{n} {unit}")
    } else {
        format!("{n} {unit}s")
    }
}
