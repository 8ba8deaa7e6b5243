//! Target health notifications.
//!
//! Compares successive versions of a watched target and reports what got
//! worse (or better) while the disruption runs. Notifications land on both
//! the target and the disruption.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use faultline_events::{Event, EventReason, EventType, ObjectRef};
use tracing::{debug, warn};

use crate::model::workload::NodePhase;
use crate::model::{ConditionStatus, Disruption, Node, NodeConditionType, Pod, Target};
use crate::platform::Platform;
use crate::recorder::Recorder;

/// Restarts tolerated between two versions of a pod.
const RESTART_THRESHOLD: u32 = 2;

/// Container exit reasons that are not a sign of trouble.
const BENIGN_REASONS: [&str; 2] = ["Completed", "ContainerCreating"];

fn push(reasons: &mut Vec<EventReason>, reason: EventReason) {
    if !reasons.contains(&reason) {
        reasons.push(reason);
    }
}

fn total_restarts(pod: &Pod) -> u32 {
    pod.status
        .container_statuses
        .iter()
        .map(|c| c.restart_count)
        .sum()
}

/// Health changes between two versions of a pod.
pub fn pod_diff(old: &Pod, new: &Pod) -> Vec<EventReason> {
    let mut reasons = Vec::new();

    if total_restarts(new).saturating_sub(total_restarts(old)) > RESTART_THRESHOLD {
        push(&mut reasons, EventReason::TargetPodTooManyRestarts);
    }

    for container in &new.status.container_statuses {
        let Some(before) = old
            .status
            .container_statuses
            .iter()
            .find(|c| c.name == container.name)
        else {
            continue;
        };

        match (before.state.is_running(), container.state.is_running()) {
            (true, false) if !BENIGN_REASONS.contains(&container.state.reason()) => {
                push(&mut reasons, EventReason::TargetPodContainersInWarningState);
            }
            (false, true) => push(&mut reasons, EventReason::RecoveredWarningStateInTargetPod),
            _ => {}
        }
    }

    reasons
}

/// Health changes between two versions of a node.
pub fn node_diff(old: &Node, new: &Node) -> Vec<EventReason> {
    use ConditionStatus::{False, True, Unknown};

    let mut reasons = Vec::new();

    for condition in &new.status.conditions {
        let Some(before) = old.condition(condition.condition_type) else {
            continue;
        };
        let after = condition.status;
        if before == after {
            continue;
        }

        if after == Unknown {
            push(&mut reasons, EventReason::TargetNodeInWarningState);
            continue;
        }

        match (condition.condition_type, before, after) {
            (NodeConditionType::Ready, True, False) => {
                push(&mut reasons, EventReason::TargetNodeInWarningState)
            }
            (NodeConditionType::Ready, False, True) => {
                push(&mut reasons, EventReason::RecoveredWarningStateInTargetNode)
            }
            (NodeConditionType::DiskPressure, False, True) => {
                push(&mut reasons, EventReason::TargetNodeUnderDiskPressure)
            }
            (NodeConditionType::MemoryPressure, False, True) => {
                push(&mut reasons, EventReason::TargetNodeUnderMemoryPressure)
            }
            (NodeConditionType::NetworkUnavailable, False, True) => {
                push(&mut reasons, EventReason::TargetNodeUnavailableNetwork)
            }
            (NodeConditionType::PIDPressure, False, True) => {
                push(&mut reasons, EventReason::TargetNodeInWarningState)
            }
            _ => {}
        }
    }

    match (old.status.phase, new.status.phase) {
        (Some(NodePhase::Running), Some(NodePhase::Pending | NodePhase::Terminated)) => {
            push(&mut reasons, EventReason::TargetNodeInWarningState)
        }
        (Some(before), Some(NodePhase::Running)) if before != NodePhase::Running => {
            push(&mut reasons, EventReason::RecoveredWarningStateInTargetNode)
        }
        _ => {}
    }

    reasons
}

/// Map a warning recorded by another component on a target.
pub fn classify_platform_event(event: &Event, target: &Target) -> Option<EventReason> {
    if event.is_from_controller() || event.event_type != EventType::Warning {
        return None;
    }
    let message = event.message.to_lowercase();
    match target {
        Target::Pod(_) if message.contains("liveness probe") => {
            Some(EventReason::TargetPodLivenessProbe)
        }
        Target::Pod(_) if message.contains("readiness probe") => {
            Some(EventReason::TargetPodReadinessProbe)
        }
        Target::Pod(_) => Some(EventReason::TargetPodInWarningState),
        Target::Node(_) => Some(EventReason::TargetNodeInWarningState),
    }
}

/// Drop recoveries when the same batch carries a warning.
pub fn suppress_mixed_recovery(reasons: Vec<EventReason>) -> Vec<EventReason> {
    if reasons.iter().any(EventReason::is_warning) {
        reasons.into_iter().filter(|r| !r.is_recovery()).collect()
    } else {
        reasons
    }
}

/// Emits health notifications for one disruption's targets.
pub struct TargetObserver {
    platform: Arc<dyn Platform>,
    recorder: Recorder,
    disruption: Disruption,
}

impl TargetObserver {
    pub fn new(platform: Arc<dyn Platform>, disruption: Disruption) -> Self {
        Self {
            recorder: Recorder::new(platform.clone()),
            platform,
            disruption,
        }
    }

    fn is_ours(&self, event: &Event) -> bool {
        event.is_from_controller()
            && event.annotations.get("disruption-name").map(String::as_str)
                == Some(self.disruption.name())
            && event.annotations.get("disruption-namespace").map(String::as_str)
                == Some(self.disruption.namespace())
    }

    /// Our health notifications on a target, oldest first.
    async fn notifications(&self, involved: &ObjectRef) -> Vec<(EventReason, DateTime<Utc>)> {
        let events = match self.platform.list_events(involved).await {
            Ok(events) => events,
            Err(e) => {
                warn!(object = %involved, error = %e, "Failed to list target events");
                return Vec::new();
            }
        };
        let mut ours: Vec<_> = events
            .iter()
            .filter(|e| self.is_ours(e))
            .filter_map(|e| e.known_reason().map(|r| (r, e.timestamp)))
            .filter(|(r, _)| r.is_target_health())
            .collect();
        ours.sort_by_key(|(_, at)| *at);
        ours
    }

    /// Warnings from other components since the disruption started.
    async fn platform_warnings(&self, target: &Target, since: DateTime<Utc>) -> Vec<EventReason> {
        let events = match self.platform.list_events(&target.object_ref()).await {
            Ok(events) => events,
            Err(e) => {
                warn!(target_name = target.name(), error = %e, "Failed to list target events");
                return Vec::new();
            }
        };
        let mut reasons = Vec::new();
        for event in events.iter().filter(|e| e.timestamp > since) {
            if let Some(reason) = classify_platform_event(event, target) {
                push(&mut reasons, reason);
            }
        }
        reasons
    }

    /// Compute and emit notifications for a target update.
    ///
    /// Returns the reasons actually sent.
    pub async fn observe(&self, old: &Target, new: &Target) -> Vec<EventReason> {
        let mut reasons = match (old, new) {
            (Target::Pod(o), Target::Pod(n)) => pod_diff(o, n),
            (Target::Node(o), Target::Node(n)) => node_diff(o, n),
            _ => Vec::new(),
        };

        let involved = new.object_ref();
        let sent = self.notifications(&involved).await;
        let last_sent_at = sent.last().map(|(_, at)| *at);
        let since = last_sent_at
            .unwrap_or(self.disruption.metadata.creation_timestamp)
            .max(self.disruption.metadata.creation_timestamp);
        for reason in self.platform_warnings(new, since).await {
            push(&mut reasons, reason);
        }

        let reasons = suppress_mixed_recovery(reasons);
        let ever_warned = sent.iter().any(|(r, _)| r.is_warning());
        let mut last = sent.last().map(|(r, _)| *r);
        let mut emitted = Vec::new();

        for reason in reasons {
            if reason.is_recovery() && !ever_warned {
                continue;
            }
            if last == Some(reason) {
                debug!(target_name = new.name(), reason = %reason, "Notification already sent");
                continue;
            }

            self.recorder
                .target(involved.clone(), &self.disruption, reason, &[])
                .await;
            self.recorder
                .disruption(&self.disruption, reason, &[("target", new.name())])
                .await;
            last = Some(reason);
            emitted.push(reason);
        }

        emitted
    }
}
