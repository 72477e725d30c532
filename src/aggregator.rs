use crate::collectors::{GcHistory, RepositoryCollector, SystemCollector};
use crate::config::Config;
use crate::report::{NodeStatsReport, RepositorySnapshot};
use crate::runner::CommandRunner;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinError;
use tracing::error;

#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("{collector} collector failed: {source}")]
    Collector {
        collector: &'static str,
        #[source]
        source: JoinError,
    },
}

/// Fans one request out to every collector. Each collector runs as its own
/// task so a hung probe in one cannot delay the start of another.
pub struct Aggregator {
    system: Arc<SystemCollector>,
    repositories: Vec<Arc<RepositoryCollector>>,
    gc: Arc<GcHistory>,
}

impl Aggregator {
    pub fn new(
        system: SystemCollector,
        repositories: Vec<RepositoryCollector>,
        gc: GcHistory,
    ) -> Self {
        Self {
            system: Arc::new(system),
            repositories: repositories.into_iter().map(Arc::new).collect(),
            gc: Arc::new(gc),
        }
    }

    pub fn from_config(cfg: &Config, runner: Arc<dyn CommandRunner>) -> Self {
        let system = SystemCollector::new(
            cfg.disk.mount_point.clone(),
            cfg.timeouts.disk(),
            runner.clone(),
        );
        let repositories = cfg
            .repositories
            .iter()
            .map(|profile| {
                RepositoryCollector::new(
                    profile.clone(),
                    cfg.ipfs_bin.clone(),
                    cfg.timeouts.clone(),
                    runner.clone(),
                )
            })
            .collect();
        let gc = GcHistory::new(cfg.gc.log_path.clone(), cfg.gc.schedule_hour);
        Self::new(system, repositories, gc)
    }

    pub async fn collect(&self) -> Result<NodeStatsReport, AggregateError> {
        let system_task = {
            let collector = self.system.clone();
            tokio::spawn(async move { collector.collect().await })
        };
        let gc_task = {
            let collector = self.gc.clone();
            tokio::spawn(async move { collector.collect().await })
        };
        let repo_tasks: Vec<_> = self
            .repositories
            .iter()
            .map(|collector| {
                let task = {
                    let collector = collector.clone();
                    tokio::spawn(async move { collector.collect().await })
                };
                (collector.clone(), task)
            })
            .collect();

        let mut repositories = BTreeMap::new();
        for (collector, task) in repo_tasks {
            let profile = collector.profile();
            let snapshot = match task.await {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    error!(repo = %profile.role, error = %err, "repository collector aborted");
                    RepositorySnapshot::failed(
                        profile.path.clone(),
                        format!("repository collector aborted: {err}"),
                    )
                }
            };
            repositories.insert(profile.role.clone(), snapshot);
        }

        let system = system_task.await.map_err(|source| AggregateError::Collector {
            collector: "system",
            source,
        })?;
        let gc = gc_task.await.map_err(|source| AggregateError::Collector {
            collector: "gc",
            source,
        })?;

        Ok(NodeStatsReport {
            timestamp: Utc::now(),
            system,
            repositories,
            gc,
        })
    }
}
