//! Folding agent health into the disruption's injection status.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::model::workload::ContainerState;
use crate::model::{
    Agent, AgentPhase, Disruption, InjectionStatus, TargetInjectionStatus, TerminationStatus,
};

/// Agents not pending deletion.
pub fn live_agents(agents: &[Agent]) -> Vec<&Agent> {
    agents
        .iter()
        .filter(|a| !a.metadata.is_being_deleted())
        .collect()
}

/// Whether an agent finished cleanly: every container exited 0.
fn exited_cleanly(agent: &Agent) -> bool {
    let containers = &agent.status.container_statuses;
    agent.status.phase == AgentPhase::Succeeded
        || (!containers.is_empty()
            && containers
                .iter()
                .all(|c| matches!(c.state, ContainerState::Terminated { exit_code: 0, .. })))
}

/// Whether, and how, a disruption's agents stopped.
pub fn classify_termination(
    disruption: &Disruption,
    agents: &[Agent],
    now: DateTime<Utc>,
    default_duration: Duration,
) -> TerminationStatus {
    if disruption.metadata.is_being_deleted() || disruption.is_expired(now, default_duration) {
        return TerminationStatus::DefinitivelyTerminated;
    }

    let live = live_agents(agents);
    if live.is_empty() {
        return match disruption.status.injection_status {
            InjectionStatus::NotInjected => TerminationStatus::NotTerminated,
            _ => TerminationStatus::TemporarilyTerminated,
        };
    }
    if live.iter().all(|a| exited_cleanly(a)) {
        return TerminationStatus::TemporarilyTerminated;
    }
    TerminationStatus::NotTerminated
}

/// Aggregate status plus injected target count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Folded {
    pub status: InjectionStatus,
    pub injected_targets: u32,
}

/// Next aggregate status.
///
/// A termination maps the current status through the transition table.
/// Otherwise, with agents around, the status follows readiness: injected
/// once as many targets are fully ready as are desired.
pub fn fold_status(
    disruption: &Disruption,
    agents: &[Agent],
    termination: TerminationStatus,
) -> Folded {
    let current = disruption.status.injection_status;
    let live = live_agents(agents);
    let ready = live.iter().filter(|a| a.is_ready()).count();
    let kinds = disruption.spec.faults.len().max(1);
    let injected_targets = (ready / kinds) as u32;

    if termination != TerminationStatus::NotTerminated || current.is_previously() {
        return Folded {
            status: current.on_termination(termination),
            injected_targets,
        };
    }
    if live.is_empty() {
        return Folded {
            status: current,
            injected_targets,
        };
    }

    let ready_targets = fully_ready_targets(disruption, &live);
    let status = if ready_targets.len() as u32 == disruption.status.desired_targets_count
        && disruption.status.desired_targets_count > 0
    {
        InjectionStatus::Injected
    } else {
        InjectionStatus::PartiallyInjected
    };

    Folded {
        status,
        injected_targets,
    }
}

/// Targets with one ready agent per declared fault kind.
pub fn fully_ready_targets(disruption: &Disruption, live: &[&Agent]) -> BTreeSet<String> {
    let kinds: BTreeSet<_> = disruption.fault_kinds().into_iter().collect();
    let mut ready: BTreeMap<&str, BTreeSet<_>> = BTreeMap::new();
    for agent in live.iter().filter(|a| a.is_ready()) {
        if let (Some(target), Some(kind)) = (agent.target(), agent.fault_kind()) {
            ready.entry(target).or_default().insert(kind);
        }
    }
    ready
        .into_iter()
        .filter(|(target, ready_kinds)| {
            disruption.status.has_target(target) && *ready_kinds == kinds
        })
        .map(|(target, _)| target.to_string())
        .collect()
}

/// Refresh per-target entries: agent names and injected state.
///
/// `since` only moves when a target's state flips.
pub fn refresh_targets(disruption: &mut Disruption, agents: &[Agent], now: DateTime<Utc>) {
    let live = live_agents(agents);
    let ready = fully_ready_targets(disruption, &live);

    for (name, entry) in disruption.status.target_injections.iter_mut() {
        let mut agent_names: Vec<String> = live
            .iter()
            .filter(|a| a.target() == Some(name.as_str()))
            .map(|a| a.name().to_string())
            .collect();
        agent_names.sort();
        entry.agent_names = agent_names;

        let state = if ready.contains(name) {
            TargetInjectionStatus::Injected
        } else {
            TargetInjectionStatus::NotInjected
        };
        if entry.injection_status != state {
            entry.injection_status = state;
            entry.since = now;
        }
    }
}
