//! Agent lifecycle: creation, deletion and finalizer removal.

mod builder;
mod finalizer;
mod orphan;

pub use builder::{AgentBuilder, READINESS_SENTINEL};
pub use finalizer::{cleanup_verdict, CleanupVerdict, DEADLINE_EXCEEDED, START_ERROR};
pub use orphan::{OrphanSweeper, SweepStats};

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use faultline_events::EventReason;
use faultline_reconcile::{Backoff, ExponentialBackoff, DEFAULT_BACKOFF_MAX_INTERVAL};
use tracing::{debug, info, instrument, warn};

use crate::error::ControllerResult;
use crate::metrics::Metrics;
use crate::model::agent::ownership_labels;
use crate::model::disruption::AGENT_FINALIZER;
use crate::model::{Agent, Disruption, ObjectKey, Target};
use crate::platform::Platform;
use crate::recorder::Recorder;
use crate::targeting::{TargetHealthError, TargetSelector};

/// Outcome of cleaning up terminating agents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FinalizeOutcome {
    /// Agents whose finalizer was removed.
    pub released: Vec<String>,

    /// Agents still rolling back.
    pub waiting: Vec<String>,

    /// Agents that failed without confirming their rollback.
    pub stuck: Vec<String>,
}

impl FinalizeOutcome {
    pub fn is_stuck(&self) -> bool {
        !self.stuck.is_empty()
    }
}

pub struct AgentManager {
    platform: Arc<dyn Platform>,
    builder: AgentBuilder,
    selector: Arc<dyn TargetSelector>,
    recorder: Recorder,
    metrics: Metrics,
    creation_timeout: Duration,
}

impl AgentManager {
    pub fn new(
        platform: Arc<dyn Platform>,
        builder: AgentBuilder,
        selector: Arc<dyn TargetSelector>,
        metrics: Metrics,
        creation_timeout: Duration,
    ) -> Self {
        Self {
            recorder: Recorder::new(platform.clone()),
            platform,
            builder,
            selector,
            metrics,
            creation_timeout,
        }
    }

    /// Every agent owned by a disruption.
    pub async fn agents_of(&self, disruption: &ObjectKey) -> ControllerResult<Vec<Agent>> {
        Ok(self
            .platform
            .list_agents(None, &ownership_labels(disruption))
            .await?)
    }

    /// Create the agents `target` is missing, one per fault kind.
    ///
    /// Returns false when a creation failed; the target is retried on the
    /// next pass. Configuration errors abort the pass.
    #[instrument(skip_all, fields(disruption = %disruption.key(), target_name = target.name()))]
    pub async fn create_missing(
        &self,
        disruption: &Disruption,
        target: &Target,
        existing: &[Agent],
        now: DateTime<Utc>,
        remaining: Duration,
    ) -> ControllerResult<bool> {
        let mut all_created = true;

        for fault in &disruption.spec.faults {
            let kind = fault.kind();
            let present = existing
                .iter()
                .any(|a| a.target() == Some(target.name()) && a.fault_kind() == Some(kind));
            if present {
                continue;
            }

            let agent = self.builder.build(disruption, target, fault, now, remaining)?;
            match self.platform.create_agent(agent).await {
                Ok(created) => {
                    self.metrics
                        .agent_created(disruption.name(), target.name(), kind.as_str(), true);
                    info!(agent = created.name(), kind = %kind, "Created agent");
                    self.recorder
                        .disruption(
                            disruption,
                            EventReason::Created,
                            &[("agent", created.name()), ("target", target.name())],
                        )
                        .await;
                    self.recorder
                        .target(
                            target.object_ref(),
                            disruption,
                            EventReason::Disrupted,
                            &[("agent", created.name()), ("target", target.name())],
                        )
                        .await;
                    self.wait_for_creation(&created.key()).await;
                }
                Err(e) => {
                    all_created = false;
                    self.metrics
                        .agent_created(disruption.name(), target.name(), kind.as_str(), false);
                    warn!(kind = %kind, error = %e, "Failed to create agent");
                    let error = e.to_string();
                    self.recorder
                        .disruption(
                            disruption,
                            EventReason::CreateFailed,
                            &[("target", target.name()), ("error", error.as_str())],
                        )
                        .await;
                }
            }
        }

        Ok(all_created)
    }

    /// Wait for the platform to serve a created agent back.
    async fn wait_for_creation(&self, key: &ObjectKey) {
        let mut backoff = ExponentialBackoff::new(
            Duration::from_millis(50),
            DEFAULT_BACKOFF_MAX_INTERVAL,
            self.creation_timeout,
        );

        loop {
            match self.platform.get_agent(key).await {
                Ok(_) => return,
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(agent = %key, error = %e, "Failed to look up created agent");
                }
            }
            match backoff.next_delay() {
                Some(delay) => tokio::time::sleep(delay).await,
                None => {
                    warn!(
                        agent = %key,
                        elapsed_ms = backoff.elapsed().as_millis() as u64,
                        "Timed out waiting for agent creation"
                    );
                    return;
                }
            }
        }
    }

    /// Request deletion of agents. Gone agents are skipped.
    pub async fn delete(&self, agents: &[Agent]) -> ControllerResult<()> {
        for agent in agents.iter().filter(|a| !a.metadata.is_being_deleted()) {
            match self.platform.delete_agent(&agent.key()).await {
                Ok(()) => debug!(agent = agent.name(), "Requested agent deletion"),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Remove the finalizer of terminating agents whose cleanup is done.
    #[instrument(skip_all, fields(disruption = %disruption.key()))]
    pub async fn finalize_terminating(
        &self,
        disruption: &Disruption,
        agents: &[Agent],
    ) -> ControllerResult<FinalizeOutcome> {
        let mut outcome = FinalizeOutcome::default();

        let terminating = agents.iter().filter(|a| {
            a.metadata.is_being_deleted() && a.metadata.has_finalizer(AGENT_FINALIZER)
        });
        for agent in terminating {
            let healthy = match agent.target() {
                Some(target) => match self.selector.target_is_healthy(target, disruption).await {
                    Ok(()) => true,
                    Err(TargetHealthError::Platform(e)) => return Err(e.into()),
                    Err(e) => {
                        debug!(agent = agent.name(), reason = %e, "Target unhealthy, cleanup is best effort");
                        false
                    }
                },
                None => false,
            };

            let verdict = cleanup_verdict(agent, healthy);
            match verdict {
                CleanupVerdict::Remove | CleanupVerdict::BestEffort => {
                    let mut updated = agent.clone();
                    updated.metadata.remove_finalizer(AGENT_FINALIZER);
                    match self.platform.update_agent(&updated).await {
                        Ok(_) => {}
                        Err(e) if e.is_not_found() => {}
                        Err(e) => return Err(e.into()),
                    }
                    info!(agent = agent.name(), verdict = ?verdict, "Released agent finalizer");
                    outcome.released.push(agent.name().to_string());
                }
                CleanupVerdict::Wait => outcome.waiting.push(agent.name().to_string()),
                CleanupVerdict::Stuck => {
                    warn!(agent = agent.name(), "Agent cannot be cleaned up safely");
                    outcome.stuck.push(agent.name().to_string());
                }
            }
        }

        Ok(outcome)
    }
}
