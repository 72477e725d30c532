use crate::config::{ProbeTimeouts, RepositoryProfile, SizeSource};
use crate::report::{RepositorySnapshot, GIB, TIB};
use crate::runner::{CommandRunner, ProbeCommand};
use regex::Regex;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, warn};

/// Probes one repository according to its profile. Every probe failure
/// leaves only its own field empty.
pub struct RepositoryCollector {
    profile: RepositoryProfile,
    ipfs_bin: String,
    timeouts: ProbeTimeouts,
    runner: Arc<dyn CommandRunner>,
}

impl RepositoryCollector {
    pub fn new(
        profile: RepositoryProfile,
        ipfs_bin: impl Into<String>,
        timeouts: ProbeTimeouts,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            profile,
            ipfs_bin: ipfs_bin.into(),
            timeouts,
            runner,
        }
    }

    pub fn profile(&self) -> &RepositoryProfile {
        &self.profile
    }

    pub async fn collect(&self) -> RepositorySnapshot {
        let daemon_running = self.daemon_alive().await;
        let size_bytes = self.size(daemon_running).await;
        let block_count = self.block_count().await;

        let (pin_count, daemon_version, peer_count) = if daemon_running {
            (self.pin_count().await, self.version().await, self.peer_count().await)
        } else {
            (None, None, None)
        };

        RepositorySnapshot {
            path: self.profile.path.clone(),
            daemon_running,
            size_bytes,
            block_count,
            pin_count,
            daemon_version,
            peer_count,
            error_message: None,
        }
    }

    async fn daemon_alive(&self) -> bool {
        let cmd = self.ipfs(["id"]).with_error_marker();
        match self.runner.run(&cmd, self.timeouts.liveness()).await {
            Ok(out) if !out.trim().is_empty() => true,
            Ok(_) => {
                warn!(repo = %self.profile.role, "daemon returned empty identity");
                false
            }
            Err(err) => {
                warn!(
                    repo = %self.profile.role,
                    reason = err.reason(),
                    error = %err,
                    "daemon is not reachable"
                );
                false
            }
        }
    }

    async fn size(&self, daemon_running: bool) -> Option<u64> {
        match self.profile.size_source() {
            SizeSource::Disabled => None,
            SizeSource::FilesystemScan => {
                let cmd = ProbeCommand::new("du")
                    .arg("-sb")
                    .arg(self.profile.blocks_dir().to_string_lossy());
                let out = self.probe("size", &cmd, self.timeouts.scan()).await?;
                parse_du_bytes(&out)
            }
            SizeSource::DaemonStats => {
                if !daemon_running {
                    return None;
                }
                let cmd = self.ipfs(["stats", "repo", "--human"]).with_error_marker();
                let out = self.probe("repo-stats", &cmd, self.timeouts.repo_stats()).await?;
                parse_repo_size(&out)
            }
        }
    }

    async fn block_count(&self) -> Option<u64> {
        if !self.profile.block_count_allowed() {
            return None;
        }
        let cmd = ProbeCommand::new("find")
            .arg(self.profile.blocks_dir().to_string_lossy())
            .args(["-type", "f"]);
        let out = self.probe("block-count", &cmd, self.timeouts.scan()).await?;
        Some(count_lines(&out))
    }

    async fn pin_count(&self) -> Option<u64> {
        if !self.profile.pins_allowed() {
            return None;
        }
        let cmd = self.ipfs(["pin", "ls", "--type=recursive"]);
        let out = self.probe("pins", &cmd, self.timeouts.pins()).await?;
        Some(count_lines(&out))
    }

    async fn version(&self) -> Option<String> {
        let cmd = self.ipfs(["version", "--number"]);
        let out = self.probe("version", &cmd, self.timeouts.version()).await?;
        let version = out.trim();
        (!version.is_empty()).then(|| version.to_string())
    }

    async fn peer_count(&self) -> Option<u64> {
        let cmd = self.ipfs(["swarm", "peers"]);
        let out = self.probe("peers", &cmd, self.timeouts.peers()).await?;
        Some(count_lines(&out))
    }

    async fn probe(&self, probe: &'static str, cmd: &ProbeCommand, timeout: Duration) -> Option<String> {
        match self.runner.run(cmd, timeout).await {
            Ok(out) => Some(out),
            Err(err) => {
                debug!(
                    repo = %self.profile.role,
                    probe,
                    reason = err.reason(),
                    error = %err,
                    "repository probe failed"
                );
                None
            }
        }
    }

    fn ipfs<const N: usize>(&self, args: [&str; N]) -> ProbeCommand {
        ProbeCommand::new(self.ipfs_bin.as_str())
            .env("IPFS_PATH", self.profile.path.to_string_lossy())
            .args(args)
    }
}

/// First field of `du -sb` output.
fn parse_du_bytes(out: &str) -> Option<u64> {
    out.split_whitespace().next()?.parse().ok()
}

/// `RepoSize: 81.6 TB` from `ipfs stats repo --human`. Units are binary
/// regardless of the `i`.
fn parse_repo_size(out: &str) -> Option<u64> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = RE
        .get_or_init(|| Regex::new(r"(?i)RepoSize:\s*(\d+(?:\.\d+)?)\s*([GT])i?B\b").ok())
        .as_ref()?;
    let caps = re.captures(out)?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    let multiplier = match caps.get(2)?.as_str() {
        "T" | "t" => TIB,
        _ => GIB,
    };
    Some((value * multiplier as f64).round() as u64)
}

fn count_lines(out: &str) -> u64 {
    out.lines().filter(|line| !line.trim().is_empty()).count() as u64
}
