use crate::report::{GcRunRecord, GcStatus};
use chrono::{DateTime, Local, NaiveDateTime};
use regex::Regex;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::debug;

/// Only the tail of the log is searched for start/complete markers.
const TAIL_LINES: usize = 20;
const MIN_ESTIMATED_SECS: u64 = 60;
const MAX_ESTIMATED_SECS: u64 = 600;

pub struct GcHistory {
    log_path: PathBuf,
    schedule_hour: u32,
}

struct LogView<'a> {
    lines: Vec<&'a str>,
    modified: Option<NaiveDateTime>,
    schedule_hour: u32,
}

#[derive(Debug, Clone, PartialEq)]
struct InferredRun {
    started_at: NaiveDateTime,
    blocks_removed: u64,
    duration_seconds: u64,
    duration_estimated: bool,
}

#[derive(Debug, Clone, PartialEq)]
enum Outcome {
    Run(InferredRun),
    Terminal(GcStatus),
}

/// A log format recognizer. `None` means "not this format, try the next".
type Matcher = fn(&LogView<'_>) -> Option<Outcome>;

const MATCHERS: &[Matcher] = &[timestamped_run, bare_removals];

impl GcHistory {
    pub fn new(log_path: impl Into<PathBuf>, schedule_hour: u32) -> Self {
        Self {
            log_path: log_path.into(),
            schedule_hour,
        }
    }

    pub async fn collect(&self) -> GcRunRecord {
        let bytes = match tokio::fs::read(&self.log_path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.log_path.display(), "gc log does not exist");
                return GcRunRecord::unknown(self.log_path.clone(), GcStatus::LogMissing);
            }
            Err(err) => return self.unreadable(err),
        };

        let modified = match tokio::fs::metadata(&self.log_path).await.and_then(|m| m.modified()) {
            Ok(time) => Some(DateTime::<Local>::from(time).naive_local()),
            Err(err) => {
                debug!(path = %self.log_path.display(), error = %err, "gc log mtime unavailable");
                None
            }
        };

        // invalid UTF-8 is replaced, not rejected
        let content = String::from_utf8_lossy(&bytes);
        infer(&content, modified, &self.log_path, self.schedule_hour)
    }

    fn unreadable(&self, err: io::Error) -> GcRunRecord {
        debug!(path = %self.log_path.display(), error = %err, "gc log unreadable");
        let mut record = GcRunRecord::unknown(self.log_path.clone(), GcStatus::Unreadable);
        record.error = Some(err.to_string());
        record
    }
}

/// Runs the format chain over the log content. First match wins.
fn infer(content: &str, modified: Option<NaiveDateTime>, log_path: &Path, schedule_hour: u32) -> GcRunRecord {
    let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.is_empty() {
        return GcRunRecord::unknown(log_path.to_path_buf(), GcStatus::NoLogs);
    }

    let view = LogView {
        lines,
        modified,
        schedule_hour,
    };
    let outcome = MATCHERS
        .iter()
        .find_map(|matcher| matcher(&view))
        .unwrap_or(Outcome::Terminal(GcStatus::NoActivity));

    match outcome {
        Outcome::Run(run) => GcRunRecord {
            last_run: Some(run.started_at),
            blocks_removed: Some(run.blocks_removed),
            duration_seconds: Some(run.duration_seconds),
            duration_estimated: run.duration_estimated,
            next_scheduled: next_run_after(run.started_at, schedule_hour),
            status: GcStatus::Success,
            log_path: log_path.to_path_buf(),
            error: None,
        },
        Outcome::Terminal(status) => GcRunRecord::unknown(log_path.to_path_buf(), status),
    }
}

/// `2026-02-04 03:00:00 Starting GC...` ... `2026-02-04 03:02:14 GC complete`
fn timestamped_run(view: &LogView<'_>) -> Option<Outcome> {
    let (start, complete) = (start_marker()?, complete_marker()?);
    let window = &view.lines[view.lines.len().saturating_sub(TAIL_LINES)..];
    let complete_at = window.iter().rposition(|l| complete.is_match(l))?;
    let start_at = window[..complete_at]
        .iter()
        .rposition(|l| start.is_match(l))?;
    // An earlier complete in between means the latest start scrolled out.
    if window[start_at + 1..complete_at].iter().any(|l| complete.is_match(l)) {
        return None;
    }
    let run_lines = &window[start_at..=complete_at];

    let (Some(started), Some(finished)) = (
        leading_timestamp(window[start_at]),
        leading_timestamp(window[complete_at]),
    ) else {
        return Some(Outcome::Terminal(GcStatus::UnparseableTimestamps));
    };

    let blocks_removed = removed_count()
        .and_then(|re| run_lines.iter().rev().find_map(|l| re.captures(l)))
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0);

    Some(Outcome::Run(InferredRun {
        started_at: started,
        blocks_removed,
        duration_seconds: (finished - started).num_seconds().max(0) as u64,
        duration_estimated: false,
    }))
}

/// Raw `ipfs repo gc` output: one `removed <cid>` line per block and no
/// timestamps. The run time comes from the file mtime and the daily
/// schedule; the duration is a rough guess from the block count.
fn bare_removals(view: &LogView<'_>) -> Option<Outcome> {
    let blocks_removed = view
        .lines
        .iter()
        .filter(|l| l.trim_start().starts_with("removed "))
        .count() as u64;
    if blocks_removed == 0 {
        return None;
    }

    let Some(started_at) = view
        .modified
        .and_then(|m| scheduled_run_at_or_before(m, view.schedule_hour))
    else {
        return Some(Outcome::Terminal(GcStatus::UnparseableTimestamps));
    };

    Some(Outcome::Run(InferredRun {
        started_at,
        blocks_removed,
        duration_seconds: estimate_duration_secs(blocks_removed),
        duration_estimated: true,
    }))
}

fn estimate_duration_secs(blocks_removed: u64) -> u64 {
    (blocks_removed / 10).clamp(MIN_ESTIMATED_SECS, MAX_ESTIMATED_SECS)
}

/// Most recent scheduled start not later than `at`.
fn scheduled_run_at_or_before(at: NaiveDateTime, hour: u32) -> Option<NaiveDateTime> {
    let same_day = at.date().and_hms_opt(hour, 0, 0)?;
    if at >= same_day {
        Some(same_day)
    } else {
        at.date().pred_opt()?.and_hms_opt(hour, 0, 0)
    }
}

fn next_run_after(last_run: NaiveDateTime, hour: u32) -> Option<NaiveDateTime> {
    last_run.date().succ_opt()?.and_hms_opt(hour, 0, 0)
}

fn leading_timestamp(line: &str) -> Option<NaiveDateTime> {
    let head = line.trim_start().get(..19)?;
    NaiveDateTime::parse_from_str(head, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(head, "%Y-%m-%dT%H:%M:%S"))
        .ok()
}

fn start_marker() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)starting gc").ok()).as_ref()
}

fn complete_marker() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)gc complete").ok()).as_ref()
}

fn removed_count() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)removed\s+(\d+)\s+blocks").ok()).as_ref()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};
    use std::io::Write;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, s)
            .unwrap()
    }

    fn run(content: &str, modified: Option<NaiveDateTime>) -> GcRunRecord {
        infer(content, modified, Path::new("/var/log/ipfs-gc-new.log"), 3)
    }

    fn bare_log(n: usize) -> String {
        (0..n)
            .map(|i| format!("removed bafkreigh2akiscaildc{i:04}\n"))
            .collect()
    }

    #[test]
    fn timestamped_log_yields_exact_run() {
        let log = "2026-02-04 03:00:00 Starting GC...\nremoved 945 blocks\n2026-02-04 03:02:14 GC complete\n";
        let record = run(log, Some(at(2026, 2, 4, 3, 2, 14)));

        assert_eq!(record.status, GcStatus::Success);
        assert_eq!(record.last_run, Some(at(2026, 2, 4, 3, 0, 0)));
        assert_eq!(record.blocks_removed, Some(945));
        assert_eq!(record.duration_seconds, Some(134));
        assert!(!record.duration_estimated);
        assert_eq!(record.next_scheduled, Some(at(2026, 2, 5, 3, 0, 0)));
    }

    #[test]
    fn timestamped_log_without_count_reports_zero() {
        let log = "2026-02-04 03:00:00 Starting GC\n2026-02-04 03:00:05 GC complete\n";
        let record = run(log, None);
        assert_eq!(record.blocks_removed, Some(0));
        assert_eq!(record.duration_seconds, Some(5));
    }

    #[test]
    fn clock_skew_never_gives_negative_duration() {
        let log = "2026-02-04 03:10:00 Starting GC\n2026-02-04 03:00:00 GC complete\n";
        assert_eq!(run(log, None).duration_seconds, Some(0));
    }

    #[test]
    fn latest_run_in_tail_wins() {
        let log = "2026-02-03 03:00:00 Starting GC\nremoved 10 blocks\n2026-02-03 03:01:00 GC complete\n\
2026-02-04 03:00:00 Starting GC\nremoved 20 blocks\n2026-02-04 03:00:30 GC complete\n";
        let record = run(log, None);
        assert_eq!(record.last_run, Some(at(2026, 2, 4, 3, 0, 0)));
        assert_eq!(record.blocks_removed, Some(20));
        assert_eq!(record.duration_seconds, Some(30));
    }

    #[test]
    fn count_from_previous_run_is_not_reused() {
        let log = "2026-02-03 03:00:00 Starting GC\nremoved 10 blocks\n2026-02-03 03:01:00 GC complete\n\
2026-02-04 03:00:00 Starting GC\n2026-02-04 03:00:30 GC complete\n";
        let record = run(log, None);
        assert_eq!(record.last_run, Some(at(2026, 2, 4, 3, 0, 0)));
        assert_eq!(record.blocks_removed, Some(0));
    }

    #[test]
    fn start_of_latest_run_scrolled_out_is_not_paired_with_older_start() {
        let mut log = String::from(
            "2026-02-03 03:00:00 Starting GC\n2026-02-03 03:01:00 GC complete\n",
        );
        for i in 0..15 {
            log.push_str(&format!("2026-02-04 03:00:{i:02} sweeping shard {i}\n"));
        }
        log.push_str("2026-02-04 03:02:00 GC complete\n");
        let record = run(&log, Some(at(2026, 2, 4, 3, 2, 0)));
        assert_eq!(record.status, GcStatus::NoActivity);
        assert_eq!(record.last_run, None);
        assert_eq!(record.duration_seconds, None);
    }

    #[test]
    fn markers_with_bad_timestamps_are_unparseable() {
        let log = "yesterday Starting GC\nremoved 3 blocks\nlater GC complete\n";
        let record = run(log, Some(at(2026, 2, 4, 4, 0, 0)));
        assert_eq!(record.status, GcStatus::UnparseableTimestamps);
        assert_eq!(record.last_run, None);
    }

    #[test]
    fn empty_log_has_no_runs() {
        for content in ["", "\n\n   \n"] {
            let record = run(content, Some(at(2026, 2, 4, 4, 0, 0)));
            assert_eq!(record.last_run, None);
            assert_eq!(record.status, GcStatus::NoLogs);
            assert_eq!(record.status.phrase(), "No GC logs found");
        }
    }

    #[test]
    fn log_without_removals_has_no_activity() {
        let record = run("gc cron started\nnothing to do\n", Some(at(2026, 2, 4, 4, 0, 0)));
        assert_eq!(record.status, GcStatus::NoActivity);
        assert_eq!(record.next_scheduled, None);
    }

    #[test]
    fn bare_log_before_schedule_hour_maps_to_previous_day() {
        let record = run(&bare_log(50), Some(at(2026, 2, 4, 2, 0, 0)));
        assert_eq!(record.status, GcStatus::Success);
        assert_eq!(record.last_run, Some(at(2026, 2, 3, 3, 0, 0)));
        assert_eq!(record.next_scheduled, Some(at(2026, 2, 4, 3, 0, 0)));
        assert_eq!(record.blocks_removed, Some(50));
        assert!(record.duration_estimated);
        let secs = record.duration_seconds.unwrap();
        assert!((60..=600).contains(&secs));
    }

    #[test]
    fn bare_log_after_schedule_hour_maps_to_same_day() {
        let record = run(&bare_log(3), Some(at(2026, 2, 4, 3, 0, 0)));
        assert_eq!(record.last_run, Some(at(2026, 2, 4, 3, 0, 0)));
        let record = run(&bare_log(3), Some(at(2026, 2, 4, 23, 59, 59)));
        assert_eq!(record.last_run, Some(at(2026, 2, 4, 3, 0, 0)));
    }

    #[test]
    fn bare_log_without_mtime_is_unparseable() {
        let record = run(&bare_log(5), None);
        assert_eq!(record.status, GcStatus::UnparseableTimestamps);
    }

    #[test]
    fn start_marker_outside_tail_falls_back_to_bare() {
        let mut log = String::from("2026-02-04 03:00:00 Starting GC\n");
        log.push_str(&bare_log(30));
        log.push_str("2026-02-04 03:05:00 GC complete\n");
        let record = run(&log, Some(at(2026, 2, 4, 3, 5, 0)));
        assert!(record.duration_estimated);
        assert_eq!(record.blocks_removed, Some(30));
    }

    #[test]
    fn duration_estimate_is_clamped() {
        assert_eq!(estimate_duration_secs(0), 60);
        assert_eq!(estimate_duration_secs(2_500), 250);
        assert_eq!(estimate_duration_secs(1_000_000), 600);
    }

    #[test]
    fn next_run_crosses_month_boundary() {
        assert_eq!(
            next_run_after(at(2026, 2, 28, 3, 0, 0), 3),
            Some(at(2026, 3, 1, 3, 0, 0))
        );
    }

    #[tokio::test]
    async fn missing_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let record = GcHistory::new(dir.path().join("nope.log"), 3).collect().await;
        assert_eq!(record.status, GcStatus::LogMissing);
        assert_eq!(record.last_run, None);
    }

    #[tokio::test]
    async fn directory_path_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let record = GcHistory::new(dir.path(), 3).collect().await;
        assert_eq!(record.status, GcStatus::Unreadable);
        assert!(record.error.is_some());
    }

    #[tokio::test]
    async fn invalid_utf8_does_not_hide_markers() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"2026-02-04 03:00:00 Starting GC\n\xff\xfe garbage\n").unwrap();
        file.write_all(b"removed 7 blocks\n2026-02-04 03:00:40 GC complete\n").unwrap();
        file.flush().unwrap();

        let record = GcHistory::new(file.path(), 3).collect().await;
        assert_eq!(record.status, GcStatus::Success);
        assert_eq!(record.blocks_removed, Some(7));
        assert_eq!(record.duration_seconds, Some(40));
    }

    #[tokio::test]
    async fn bare_log_uses_file_mtime() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(bare_log(50).as_bytes()).unwrap();
        file.flush().unwrap();

        let local = Local
            .from_local_datetime(&at(2026, 2, 4, 2, 0, 0))
            .earliest()
            .unwrap();
        filetime::set_file_mtime(
            file.path(),
            filetime::FileTime::from_unix_time(local.timestamp(), 0),
        )
        .unwrap();

        let record = GcHistory::new(file.path(), 3).collect().await;
        assert_eq!(record.last_run, Some(at(2026, 2, 3, 3, 0, 0)));
        assert_eq!(record.log_path, file.path());
    }
}
