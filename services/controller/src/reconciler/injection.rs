//! The injection pass of a live disruption, and status persistence.

use chrono::{DateTime, Utc};
use faultline_events::EventReason;
use tracing::{debug, info};

use super::status::{fold_status, refresh_targets};
use super::{classify_termination, Action, DisruptionReconciler};
use crate::error::ControllerResult;
use crate::model::{Agent, Disruption, DisruptionStatus, InjectionStatus, TerminationStatus};
use crate::targeting::get_target;

impl DisruptionReconciler {
    /// Converge targets and agents, then fold and persist the status.
    pub(super) async fn inject(
        &self,
        mut disruption: Disruption,
        now: DateTime<Utc>,
    ) -> ControllerResult<Action> {
        let key = disruption.key();
        let original = disruption.status.clone();
        let default_duration = self.settings.default_duration;

        self.registry.converge(&mut disruption, now).await?;
        if disruption.status.target_injections.is_empty() {
            self.recorder
                .disruption(&disruption, EventReason::NoTarget, &[])
                .await;
        }

        let agents = self.agents.agents_of(&key).await?;
        let unregistered: Vec<Agent> = agents
            .iter()
            .filter(|a| a.target().is_none_or(|t| !disruption.status.has_target(t)))
            .cloned()
            .collect();
        if !unregistered.is_empty() {
            debug!(agents = unregistered.len(), "Deleting agents of dropped targets");
            self.agents.delete(&unregistered).await?;
        }

        let remaining = disruption.remaining(now, default_duration);
        let mut incomplete = Vec::new();
        for name in disruption.status.target_names() {
            let target = match get_target(self.platform.as_ref(), &name, &disruption).await {
                Ok(target) => target,
                Err(e) if e.is_not_found() => {
                    debug!(target_name = %name, "Target vanished, dropping it next pass");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let existing: Vec<Agent> = agents
                .iter()
                .filter(|a| a.target() == Some(name.as_str()) && !a.metadata.is_being_deleted())
                .cloned()
                .collect();
            if !self
                .agents
                .create_missing(&disruption, &target, &existing, now, remaining)
                .await?
            {
                incomplete.push(name);
            }
        }

        let agents = self.agents.agents_of(&key).await?;
        let outcome = self.agents.finalize_terminating(&disruption, &agents).await?;
        if outcome.is_stuck() && !disruption.status.is_stuck_on_removal {
            disruption.status.is_stuck_on_removal = true;
            self.report_stuck(&disruption, &outcome.stuck).await;
        }
        let agents = if outcome.released.is_empty() {
            agents
        } else {
            self.agents.agents_of(&key).await?
        };

        let termination = classify_termination(&disruption, &agents, now, default_duration);
        let disruption = self
            .persist_status(disruption, &original, &agents, termination, now)
            .await?;

        if !incomplete.is_empty() {
            debug!(targets = ?incomplete, "Targets left without all their agents, retrying");
            return Ok(Action::requeue(self.settings.requeue.next_delay()));
        }
        if disruption.status.injection_status == InjectionStatus::Injected {
            return Ok(Action::requeue(
                disruption.remaining(Utc::now(), default_duration),
            ));
        }
        Ok(Action::requeue(self.settings.requeue.next_delay()))
    }

    /// Fold agent health into the status and write it when it changed.
    ///
    /// Returns the disruption as stored.
    pub(super) async fn persist_status(
        &self,
        mut disruption: Disruption,
        original: &DisruptionStatus,
        agents: &[Agent],
        termination: TerminationStatus,
        now: DateTime<Utc>,
    ) -> ControllerResult<Disruption> {
        refresh_targets(&mut disruption, agents, now);
        let folded = fold_status(&disruption, agents, termination);

        let status = &mut disruption.status;
        if folded.status != status.injection_status {
            info!(
                from = status.injection_status.as_str(),
                to = folded.status.as_str(),
                termination = ?termination,
                "Injection status changed"
            );
            self.metrics
                .injected(&disruption.metadata.name, folded.status.as_str());
        }
        status.injection_status = folded.status;
        status.injected_targets_count = folded.injected_targets;

        if disruption.status == *original {
            return Ok(disruption);
        }
        Ok(self.platform.update_disruption_status(&disruption).await?)
    }
}
