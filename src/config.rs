use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default = "default_ipfs_bin")]
    pub ipfs_bin: String,
    pub repositories: Vec<RepositoryProfile>,
    #[serde(default)]
    pub gc: GcConfig,
    #[serde(default)]
    pub disk: DiskConfig,
    #[serde(default)]
    pub timeouts: ProbeTimeouts,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    #[serde(default = "default_secret_key_env")]
    pub secret_key_env: String,
    #[serde(default)]
    pub secret_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskTier {
    Low,
    High,
}

impl RiskTier {
    /// Whether `du`/`find` walks over the block store are acceptable. Never
    /// true for repositories in the tens of terabytes.
    pub fn allows_filesystem_scan(self) -> bool {
        matches!(self, RiskTier::Low)
    }
}

/// Where a repository's size may come from, resolved from its profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeSource {
    Disabled,
    FilesystemScan,
    DaemonStats,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RepositoryProfile {
    pub role: String,
    pub path: PathBuf,
    pub risk_tier: RiskTier,
    #[serde(default)]
    pub monitor_size: bool,
    #[serde(default)]
    pub monitor_blocks: bool,
    #[serde(default)]
    pub monitor_pins: bool,
}

impl RepositoryProfile {
    pub fn size_source(&self) -> SizeSource {
        match (self.monitor_size, self.risk_tier.allows_filesystem_scan()) {
            (false, _) => SizeSource::Disabled,
            (true, true) => SizeSource::FilesystemScan,
            (true, false) => SizeSource::DaemonStats,
        }
    }

    /// Block counts have no daemon-side source, so they exist only where a
    /// filesystem walk is permitted.
    pub fn block_count_allowed(&self) -> bool {
        self.monitor_blocks && self.risk_tier.allows_filesystem_scan()
    }

    pub fn pins_allowed(&self) -> bool {
        self.monitor_pins
    }

    pub fn blocks_dir(&self) -> PathBuf {
        self.path.join("blocks")
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GcConfig {
    #[serde(default = "default_gc_log_path")]
    pub log_path: PathBuf,
    #[serde(default = "default_gc_schedule_hour")]
    pub schedule_hour: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DiskConfig {
    #[serde(default = "default_mount_point")]
    pub mount_point: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProbeTimeouts {
    #[serde(default = "default_liveness_secs")]
    pub liveness_secs: u64,
    #[serde(default = "default_scan_secs")]
    pub scan_secs: u64,
    #[serde(default = "default_repo_stats_secs")]
    pub repo_stats_secs: u64,
    #[serde(default = "default_pins_secs")]
    pub pins_secs: u64,
    #[serde(default = "default_version_secs")]
    pub version_secs: u64,
    #[serde(default = "default_peers_secs")]
    pub peers_secs: u64,
    #[serde(default = "default_disk_secs")]
    pub disk_secs: u64,
}

impl ProbeTimeouts {
    pub fn liveness(&self) -> Duration {
        Duration::from_secs(self.liveness_secs)
    }

    pub fn scan(&self) -> Duration {
        Duration::from_secs(self.scan_secs)
    }

    pub fn repo_stats(&self) -> Duration {
        Duration::from_secs(self.repo_stats_secs)
    }

    pub fn pins(&self) -> Duration {
        Duration::from_secs(self.pins_secs)
    }

    pub fn version(&self) -> Duration {
        Duration::from_secs(self.version_secs)
    }

    pub fn peers(&self) -> Duration {
        Duration::from_secs(self.peers_secs)
    }

    pub fn disk(&self) -> Duration {
        Duration::from_secs(self.disk_secs)
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret_key_env: default_secret_key_env(),
            secret_key: None,
        }
    }
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            log_path: default_gc_log_path(),
            schedule_hour: default_gc_schedule_hour(),
        }
    }
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            mount_point: default_mount_point(),
        }
    }
}

impl Default for ProbeTimeouts {
    fn default() -> Self {
        Self {
            liveness_secs: default_liveness_secs(),
            scan_secs: default_scan_secs(),
            repo_stats_secs: default_repo_stats_secs(),
            pins_secs: default_pins_secs(),
            version_secs: default_version_secs(),
            peers_secs: default_peers_secs(),
            disk_secs: default_disk_secs(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("не удалось прочитать файл конфигурации {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("не удалось разобрать YAML в {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("ошибка валидации конфигурации: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if SocketAddr::from_str(&self.listen).is_err() {
            return Err(ConfigError::Validation(
                "поле listen должно быть корректным адресом host:port".to_string(),
            ));
        }
        if self.ipfs_bin.trim().is_empty() {
            return Err(ConfigError::Validation(
                "ipfs_bin не должен быть пустым".to_string(),
            ));
        }
        if self.disk.mount_point.trim().is_empty() {
            return Err(ConfigError::Validation(
                "disk.mount_point не должен быть пустым".to_string(),
            ));
        }
        if self.gc.schedule_hour > 23 {
            return Err(ConfigError::Validation(
                "gc.schedule_hour должно быть в диапазоне 0..23".to_string(),
            ));
        }

        validate_repositories(&self.repositories)?;
        validate_timeouts(&self.timeouts)?;

        Ok(())
    }

    /// Settings that are legal but will be ignored by the probe policy.
    pub fn warnings(&self) -> Vec<String> {
        self.repositories
            .iter()
            .filter(|repo| repo.monitor_blocks && !repo.risk_tier.allows_filesystem_scan())
            .map(|repo| {
                format!(
                    "repository '{}' is high-risk: monitor_blocks is ignored, block-store scans are never run",
                    repo.role
                )
            })
            .collect()
    }

    /// Bearer token from the configured environment variable, falling back
    /// to the inline value.
    pub fn resolve_secret_key(&self) -> Option<String> {
        if let Ok(v) = std::env::var(&self.auth.secret_key_env) {
            if !v.trim().is_empty() {
                return Some(v.trim().to_string());
            }
        }
        self.auth
            .secret_key
            .as_ref()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

fn validate_repositories(repos: &[RepositoryProfile]) -> Result<(), ConfigError> {
    if repos.is_empty() {
        return Err(ConfigError::Validation(
            "нужен хотя бы один репозиторий в repositories".to_string(),
        ));
    }
    let mut roles = HashSet::new();
    for repo in repos {
        if repo.role.trim().is_empty() {
            return Err(ConfigError::Validation(
                "repositories[*].role не должен быть пустым".to_string(),
            ));
        }
        if !roles.insert(repo.role.clone()) {
            return Err(ConfigError::Validation(format!(
                "роль репозитория '{}' должна быть уникальной",
                repo.role
            )));
        }
        if repo.path.as_os_str().is_empty() {
            return Err(ConfigError::Validation(format!(
                "repositories '{}' path не должен быть пустым",
                repo.role
            )));
        }
    }
    Ok(())
}

fn validate_timeouts(t: &ProbeTimeouts) -> Result<(), ConfigError> {
    let all = [
        ("liveness_secs", t.liveness_secs),
        ("scan_secs", t.scan_secs),
        ("repo_stats_secs", t.repo_stats_secs),
        ("pins_secs", t.pins_secs),
        ("version_secs", t.version_secs),
        ("peers_secs", t.peers_secs),
        ("disk_secs", t.disk_secs),
    ];
    for (name, value) in all {
        if value == 0 {
            return Err(ConfigError::Validation(format!(
                "timeouts.{name} должно быть > 0"
            )));
        }
    }
    Ok(())
}

fn default_listen() -> String {
    "127.0.0.1:3001".to_string()
}

fn default_secret_key_env() -> String {
    "SECRET_KEY".to_string()
}

fn default_ipfs_bin() -> String {
    "ipfs".to_string()
}

fn default_gc_log_path() -> PathBuf {
    PathBuf::from("/var/log/ipfs-gc-new.log")
}

const fn default_gc_schedule_hour() -> u32 {
    3
}

fn default_mount_point() -> String {
    "/pool0".to_string()
}

const fn default_liveness_secs() -> u64 {
    5
}

const fn default_scan_secs() -> u64 {
    30
}

const fn default_repo_stats_secs() -> u64 {
    10
}

const fn default_pins_secs() -> u64 {
    60
}

const fn default_version_secs() -> u64 {
    5
}

const fn default_peers_secs() -> u64 {
    10
}

const fn default_disk_secs() -> u64 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo(role: &str, tier: RiskTier) -> RepositoryProfile {
        RepositoryProfile {
            role: role.to_string(),
            path: PathBuf::from(format!("/pool0/ipfs/{role}")),
            risk_tier: tier,
            monitor_size: true,
            monitor_blocks: true,
            monitor_pins: true,
        }
    }

    fn valid_config() -> Config {
        Config {
            listen: default_listen(),
            auth: AuthConfig::default(),
            ipfs_bin: default_ipfs_bin(),
            repositories: vec![repo("new", RiskTier::Low), repo("old", RiskTier::High)],
            gc: GcConfig::default(),
            disk: DiskConfig::default(),
            timeouts: ProbeTimeouts::default(),
        }
    }

    #[test]
    fn example_config_parses_and_validates() {
        let cfg: Config = serde_yaml::from_str(Config::example_yaml()).expect("пример должен разбираться");
        cfg.validate().expect("пример должен проходить валидацию");
        assert_eq!(cfg.repositories.len(), 2);
        assert_eq!(cfg.gc.schedule_hour, 3);
    }

    #[test]
    fn minimal_yaml_fills_defaults() {
        let yaml = r#"
repositories:
  - role: new
    path: /pool0/ipfs/.ipfs-new
    risk_tier: low
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.listen, "127.0.0.1:3001");
        assert_eq!(cfg.timeouts.pins(), Duration::from_secs(60));
        assert!(!cfg.repositories[0].monitor_size);
        assert_eq!(cfg.repositories[0].size_source(), SizeSource::Disabled);
    }

    #[test]
    fn duplicate_roles_are_rejected() {
        let mut cfg = valid_config();
        cfg.repositories.push(repo("new", RiskTier::Low));
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let mut cfg = valid_config();
        cfg.timeouts.scan_secs = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn policy_is_derived_from_tier() {
        let low = repo("new", RiskTier::Low);
        let high = repo("old", RiskTier::High);
        assert_eq!(low.size_source(), SizeSource::FilesystemScan);
        assert_eq!(high.size_source(), SizeSource::DaemonStats);
        assert!(low.block_count_allowed());
        assert!(!high.block_count_allowed());
        assert!(high.pins_allowed());
    }

    #[test]
    fn high_risk_block_monitoring_produces_warning() {
        let cfg = valid_config();
        let warnings = cfg.warnings();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("'old'"));
    }

    #[test]
    fn inline_secret_key_used_when_env_missing() {
        let mut cfg = valid_config();
        cfg.auth.secret_key_env = "NODESTATD_MISSING_ENV_12345".to_string();
        std::env::remove_var("NODESTATD_MISSING_ENV_12345");
        assert_eq!(cfg.resolve_secret_key(), None);

        cfg.auth.secret_key = Some("  s3cret ".to_string());
        assert_eq!(cfg.resolve_secret_key().as_deref(), Some("s3cret"));
    }
}
