//! Cleanup of agents whose disruption is gone.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::error::ControllerResult;
use crate::metrics::Metrics;
use crate::model::agent::ownership_labels;
use crate::model::disruption::{AGENT_FINALIZER, DISRUPTION_NAME_LABEL};
use crate::model::{Agent, ObjectKey};
use crate::platform::Platform;
use crate::watch::CacheContextRegistry;

/// Counters of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub orphans: usize,
    pub removed: usize,
    pub cache_contexts_dropped: usize,
}

pub struct OrphanSweeper {
    platform: Arc<dyn Platform>,
    registry: Arc<CacheContextRegistry>,
    metrics: Metrics,
    interval: Duration,
}

impl OrphanSweeper {
    pub fn new(
        platform: Arc<dyn Platform>,
        registry: Arc<CacheContextRegistry>,
        metrics: Metrics,
        interval: Duration,
    ) -> Self {
        Self {
            platform,
            registry,
            metrics,
            interval,
        }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting orphan sweeper"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.sweep_all().await {
                        Ok(stats) if stats.orphans > 0 || stats.cache_contexts_dropped > 0 => {
                            info!(
                                orphans = stats.orphans,
                                removed = stats.removed,
                                cache_contexts_dropped = stats.cache_contexts_dropped,
                                "Orphan sweep complete"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Orphan sweep failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Orphan sweeper shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Sweep every disruption, and drop cache contexts of missing ones.
    pub async fn sweep_all(&self) -> ControllerResult<SweepStats> {
        let existing: BTreeSet<ObjectKey> = self
            .platform
            .list_disruptions()
            .await?
            .iter()
            .map(|d| d.key())
            .collect();

        let labelled: Vec<Agent> = self
            .platform
            .list_agents(None, &BTreeMap::new())
            .await?
            .into_iter()
            .filter(|a| a.metadata.labels.contains_key(DISRUPTION_NAME_LABEL))
            .collect();

        let orphans: Vec<Agent> = labelled
            .into_iter()
            .filter(|a| a.owner().is_some_and(|owner| !existing.contains(&owner)))
            .collect();

        let mut stats = self.clean(&orphans).await?;
        stats.cache_contexts_dropped = self.registry.remove_orphans(&existing).await;
        Ok(stats)
    }

    /// Sweep the agents of one disruption known to be gone.
    pub async fn sweep(&self, disruption: &ObjectKey) -> ControllerResult<SweepStats> {
        let orphans = self
            .platform
            .list_agents(None, &ownership_labels(disruption))
            .await?;
        self.clean(&orphans).await
    }

    async fn clean(&self, orphans: &[Agent]) -> ControllerResult<SweepStats> {
        let mut stats = SweepStats {
            orphans: orphans.len(),
            ..Default::default()
        };

        for agent in orphans {
            let owner = agent.owner().map(|o| o.to_string()).unwrap_or_default();
            self.metrics.orphan_found(&owner, agent.name());

            if self.target_exists(agent).await? {
                warn!(
                    agent = agent.name(),
                    disruption = %owner,
                    "Orphaned agent still has a live target, leaving it"
                );
                continue;
            }

            let mut released = agent.clone();
            if released.metadata.remove_finalizer(AGENT_FINALIZER) {
                match self.platform.update_agent(&released).await {
                    Ok(_) => {}
                    Err(e) if e.is_not_found() => continue,
                    Err(e) if e.is_conflict() => {
                        info!(agent = agent.name(), "Agent changed during sweep, retrying later");
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            match self.platform.delete_agent(&agent.key()).await {
                Ok(()) => {
                    debug!(agent = agent.name(), disruption = %owner, "Removed orphaned agent");
                    stats.removed += 1;
                }
                Err(e) if e.is_not_found() => stats.removed += 1,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(stats)
    }

    /// Whether the agent's target still exists.
    async fn target_exists(&self, agent: &Agent) -> ControllerResult<bool> {
        let (Some(target), Some(owner)) = (agent.target(), agent.owner()) else {
            return Ok(false);
        };

        let lookup = if agent.spec.node_name.as_deref() == Some(target) {
            self.platform.get_node(target).await.map(|_| ())
        } else {
            self.platform
                .get_pod(&ObjectKey::new(owner.namespace, target))
                .await
                .map(|_| ())
        };

        match lookup {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
