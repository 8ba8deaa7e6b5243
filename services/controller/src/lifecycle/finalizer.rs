//! When an agent's finalizer may go.
//!
//! An agent keeps its finalizer until its injection is known to be rolled
//! back. If the rollback cannot be confirmed the agent is left in place and
//! the disruption is flagged stuck on removal for an operator to look at.

use crate::model::workload::ContainerState;
use crate::model::{Agent, AgentPhase};

/// Reason the platform gives an agent killed at its active deadline.
pub const DEADLINE_EXCEEDED: &str = "DeadlineExceeded";

/// Reason of a container that never managed to start.
pub const START_ERROR: &str = "StartError";

/// Outcome of inspecting a terminating agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupVerdict {
    /// Rollback confirmed, or not needed.
    Remove,

    /// Target is gone or unhealthy; cleanup is best effort.
    BestEffort,

    /// Agent is still working on it.
    Wait,

    /// Agent failed without confirming the rollback.
    Stuck,
}

impl CleanupVerdict {
    pub fn removes_finalizer(self) -> bool {
        matches!(self, CleanupVerdict::Remove | CleanupVerdict::BestEffort)
    }
}

/// Verdict for one agent pending deletion.
pub fn cleanup_verdict(agent: &Agent, target_healthy: bool) -> CleanupVerdict {
    if !target_healthy {
        return CleanupVerdict::BestEffort;
    }
    if agent.spec.fault_kind.has_no_side_effects() {
        return CleanupVerdict::Remove;
    }

    match agent.status.phase {
        AgentPhase::Succeeded | AgentPhase::Pending => CleanupVerdict::Remove,
        AgentPhase::Failed => {
            let never_started = agent.status.container_statuses.is_empty();
            let deadline = agent.status.reason.as_deref() == Some(DEADLINE_EXCEEDED);
            let start_error = agent.injector_status().is_some_and(|c| {
                matches!(&c.state, ContainerState::Terminated { reason, .. } if reason == START_ERROR)
            });

            if never_started || deadline || start_error {
                CleanupVerdict::Remove
            } else {
                CleanupVerdict::Stuck
            }
        }
        AgentPhase::Running | AgentPhase::Unknown => CleanupVerdict::Wait,
    }
}
