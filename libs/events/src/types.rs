//! Event reasons, message templates and event records.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::EventError;

/// Source component stamped on every event the controller records.
pub const SOURCE_COMPONENT: &str = "faultline-controller";

// =============================================================================
// Event Type
// =============================================================================

/// Severity of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    Normal,
    Warning,
}

// =============================================================================
// Object References
// =============================================================================

/// Kind of object an event is recorded on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Disruption,
    Pod,
    Node,
    Agent,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Disruption => "disruption",
            ObjectKind::Pod => "pod",
            ObjectKind::Node => "node",
            ObjectKind::Agent => "agent",
        }
    }
}

/// Reference to the object an event is about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef {
    pub kind: ObjectKind,

    /// Namespace; `None` for cluster-scoped objects (nodes).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    pub name: String,
}

impl ObjectRef {
    pub fn new(kind: ObjectKind, namespace: Option<&str>, name: &str) -> Self {
        Self {
            kind,
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind.as_str(), ns, self.name),
            None => write!(f, "{}/{}", self.kind.as_str(), self.name),
        }
    }
}

// =============================================================================
// Reasons
// =============================================================================

/// Which object a reason primarily describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasonCategory {
    /// Describes the health of a target; mirrored on the disruption.
    Target,

    /// Describes the disruption itself.
    Disruption,
}

/// Where a message is going to be displayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageScope {
    /// Recorded on the target.
    Target,

    /// Recorded on the disruption, naming a single target.
    Disruption,

    /// Recorded on the disruption, summarising all targets.
    Aggregate,
}

/// Static description of a reason.
#[derive(Debug, Clone, Copy)]
pub struct ReasonDescriptor {
    pub event_type: EventType,
    pub category: ReasonCategory,

    /// Message recorded on the target, if the reason is ever recorded there.
    pub target_template: Option<&'static str>,

    /// Message recorded on the disruption.
    pub disruption_template: &'static str,

    /// Summary recorded on the disruption when several targets share a reason.
    pub aggregate_template: Option<&'static str>,
}

macro_rules! reasons {
    ($($variant:ident),+ $(,)?) => {
        /// Fixed vocabulary of event reasons.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum EventReason {
            $($variant),+
        }

        impl EventReason {
            /// Every reason, in declaration order.
            pub const ALL: &'static [EventReason] = &[$(EventReason::$variant),+];

            /// The reason as recorded on events.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(EventReason::$variant => stringify!($variant)),+
                }
            }
        }

        impl FromStr for EventReason {
            type Err = EventError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $(stringify!($variant) => Ok(EventReason::$variant),)+
                    other => Err(EventError::UnknownReason(other.to_string())),
                }
            }
        }
    };
}

reasons! {
    // Target health
    TargetPodInWarningState,
    TargetPodContainersInWarningState,
    TargetPodLivenessProbe,
    TargetPodReadinessProbe,
    TargetPodTooManyRestarts,
    RecoveredWarningStateInTargetPod,
    TargetNodeUnderMemoryPressure,
    TargetNodeUnderDiskPressure,
    TargetNodeUnavailableNetwork,
    TargetNodeInWarningState,
    RecoveredWarningStateInTargetNode,

    // Disruption lifecycle
    Created,
    Disrupted,
    CreateFailed,
    EmptyDisruption,
    InvalidSpec,
    InvalidLabelSelector,
    NoTarget,
    SafetyNetTriggered,
    StuckOnRemoval,
    DurationOver,
    Finished,
}

impl EventReason {
    /// Static description of this reason.
    pub fn descriptor(&self) -> ReasonDescriptor {
        use EventType::{Normal, Warning};
        use ReasonCategory::{Disruption, Target};

        let (event_type, category, target, disruption, aggregate) = match self {
            EventReason::TargetPodInWarningState => (
                Warning,
                Target,
                Some("Pod is failing, probably because of disruption {disruption}"),
                "Targeted pod {target} is failing",
                Some("Targeted pods are failing"),
            ),
            EventReason::TargetPodContainersInWarningState => (
                Warning,
                Target,
                Some("Containers of this pod are in a warning state, probably because of disruption {disruption}"),
                "Containers of targeted pod {target} are in a warning state",
                Some("Containers of targeted pods are in a warning state"),
            ),
            EventReason::TargetPodLivenessProbe => (
                Warning,
                Target,
                Some("Liveness probe is failing, probably because of disruption {disruption}"),
                "Liveness probe of targeted pod {target} is failing",
                Some("Liveness probes of targeted pods are failing"),
            ),
            EventReason::TargetPodReadinessProbe => (
                Warning,
                Target,
                Some("Readiness probe is failing, probably because of disruption {disruption}"),
                "Readiness probe of targeted pod {target} is failing",
                Some("Readiness probes of targeted pods are failing"),
            ),
            EventReason::TargetPodTooManyRestarts => (
                Warning,
                Target,
                Some("Pod restarted several times, probably because of disruption {disruption}"),
                "Targeted pod {target} restarted several times",
                Some("Targeted pods restarted several times"),
            ),
            EventReason::RecoveredWarningStateInTargetPod => (
                Normal,
                Target,
                Some("Pod recovered from the warning state reported during disruption {disruption}"),
                "Targeted pod {target} recovered",
                Some("Targeted pods recovered"),
            ),
            EventReason::TargetNodeUnderMemoryPressure => (
                Warning,
                Target,
                Some("Node is under memory pressure, probably because of disruption {disruption}"),
                "Targeted node {target} is under memory pressure",
                Some("Targeted nodes are under memory pressure"),
            ),
            EventReason::TargetNodeUnderDiskPressure => (
                Warning,
                Target,
                Some("Node is under disk pressure, probably because of disruption {disruption}"),
                "Targeted node {target} is under disk pressure",
                Some("Targeted nodes are under disk pressure"),
            ),
            EventReason::TargetNodeUnavailableNetwork => (
                Warning,
                Target,
                Some("Node network is unavailable, probably because of disruption {disruption}"),
                "Network of targeted node {target} is unavailable",
                Some("Network of targeted nodes is unavailable"),
            ),
            EventReason::TargetNodeInWarningState => (
                Warning,
                Target,
                Some("Node is in a warning state, probably because of disruption {disruption}"),
                "Targeted node {target} is in a warning state",
                Some("Targeted nodes are in a warning state"),
            ),
            EventReason::RecoveredWarningStateInTargetNode => (
                Normal,
                Target,
                Some("Node recovered from the warning state reported during disruption {disruption}"),
                "Targeted node {target} recovered",
                Some("Targeted nodes recovered"),
            ),
            EventReason::Created => (
                Normal,
                Disruption,
                None,
                "Created agent {agent} for target {target}",
                None,
            ),
            EventReason::Disrupted => (
                Normal,
                Disruption,
                Some("Agent {agent} from disruption {disruption} targeted this resource for injection"),
                "Target {target} is being disrupted",
                None,
            ),
            EventReason::CreateFailed => (
                Warning,
                Disruption,
                None,
                "Failed to create an agent for target {target}: {error}",
                None,
            ),
            EventReason::EmptyDisruption => (
                Warning,
                Disruption,
                None,
                "No fault is declared, nothing to inject",
                None,
            ),
            EventReason::InvalidSpec => (
                Warning,
                Disruption,
                None,
                "Disruption is invalid: {error}",
                None,
            ),
            EventReason::InvalidLabelSelector => (
                Warning,
                Disruption,
                None,
                "Target selector is invalid: {error}",
                None,
            ),
            EventReason::NoTarget => (
                Warning,
                Disruption,
                None,
                "No eligible target matches the selector",
                None,
            ),
            EventReason::SafetyNetTriggered => (
                Warning,
                Disruption,
                None,
                "Safety net {net} blocked the injection: {error}",
                None,
            ),
            EventReason::StuckOnRemoval => (
                Warning,
                Disruption,
                None,
                "Agent {agent} cannot be cleaned up safely and needs manual intervention",
                None,
            ),
            EventReason::DurationOver => (
                Normal,
                Disruption,
                None,
                "Duration is over, the disruption is deleted {gc_delay} after expiry",
                None,
            ),
            EventReason::Finished => (
                Normal,
                Disruption,
                None,
                "Disruption finished and every agent was cleaned up",
                None,
            ),
        };

        ReasonDescriptor {
            event_type,
            category,
            target_template: target,
            disruption_template: disruption,
            aggregate_template: aggregate,
        }
    }

    pub fn event_type(&self) -> EventType {
        self.descriptor().event_type
    }

    pub fn is_warning(&self) -> bool {
        self.event_type() == EventType::Warning
    }

    /// Whether this reason reports a target getting better.
    pub fn is_recovery(&self) -> bool {
        matches!(
            self,
            EventReason::RecoveredWarningStateInTargetPod
                | EventReason::RecoveredWarningStateInTargetNode
        )
    }

    /// Whether this reason is a target health notification.
    pub fn is_target_health(&self) -> bool {
        self.descriptor().category == ReasonCategory::Target
    }

    /// Render the message for the given scope.
    ///
    /// Returns `None` when the reason has no template for that scope.
    pub fn message(&self, scope: MessageScope, vars: &[(&str, &str)]) -> Option<String> {
        let descriptor = self.descriptor();
        let template = match scope {
            MessageScope::Target => descriptor.target_template?,
            MessageScope::Disruption => descriptor.disruption_template,
            MessageScope::Aggregate => descriptor.aggregate_template?,
        };
        Some(render(template, vars))
    }
}

impl fmt::Display for EventReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Substitute `{name}` placeholders. Unknown placeholders are left as is.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    vars.iter().fold(template.to_string(), |acc, (key, value)| {
        acc.replace(&format!("{{{key}}}"), value)
    })
}

// =============================================================================
// Event Record
// =============================================================================

/// A recorded event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub involved: ObjectRef,
    pub event_type: EventType,

    /// Reason string; one of [`EventReason`] when `source` is the controller.
    pub reason: String,
    pub message: String,

    /// Component that recorded the event.
    pub source: String,
    pub timestamp: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Event {
    /// A controller event with a vocabulary reason.
    pub fn new(involved: ObjectRef, reason: EventReason, message: impl Into<String>) -> Self {
        Self {
            involved,
            event_type: reason.event_type(),
            reason: reason.as_str().to_string(),
            message: message.into(),
            source: SOURCE_COMPONENT.to_string(),
            timestamp: Utc::now(),
            annotations: BTreeMap::new(),
        }
    }

    /// An event recorded by some other component.
    pub fn external(
        involved: ObjectRef,
        event_type: EventType,
        reason: &str,
        message: &str,
        source: &str,
    ) -> Self {
        Self {
            involved,
            event_type,
            reason: reason.to_string(),
            message: message.to_string(),
            source: source.to_string(),
            timestamp: Utc::now(),
            annotations: BTreeMap::new(),
        }
    }

    pub fn with_annotation(mut self, key: &str, value: &str) -> Self {
        self.annotations.insert(key.to_string(), value.to_string());
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Whether the controller recorded this event.
    pub fn is_from_controller(&self) -> bool {
        self.source == SOURCE_COMPONENT
    }

    /// The vocabulary reason, for controller events.
    pub fn known_reason(&self) -> Option<EventReason> {
        if !self.is_from_controller() {
            return None;
        }
        self.reason.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_reason_roundtrip_through_str() {
        for reason in EventReason::ALL {
            assert_eq!(reason.as_str().parse::<EventReason>().unwrap(), *reason);
        }
        assert_eq!(
            "Nope".parse::<EventReason>().unwrap_err(),
            EventError::UnknownReason("Nope".to_string())
        );
    }

    #[test]
    fn test_target_reasons_have_every_template() {
        for reason in EventReason::ALL.iter().filter(|r| r.is_target_health()) {
            let d = reason.descriptor();
            assert!(d.target_template.is_some(), "{reason} lacks a target message");
            assert!(d.aggregate_template.is_some(), "{reason} lacks an aggregate message");
        }
    }

    #[rstest]
    #[case(EventReason::StuckOnRemoval, EventType::Warning)]
    #[case(EventReason::Finished, EventType::Normal)]
    #[case(EventReason::RecoveredWarningStateInTargetPod, EventType::Normal)]
    #[case(EventReason::TargetNodeUnderDiskPressure, EventType::Warning)]
    fn test_severity(#[case] reason: EventReason, #[case] want: EventType) {
        assert_eq!(reason.event_type(), want);
    }

    #[test]
    fn test_message_rendering() {
        let msg = EventReason::TargetPodTooManyRestarts
            .message(MessageScope::Target, &[("disruption", "net-drop")])
            .unwrap();
        assert_eq!(
            msg,
            "Pod restarted several times, probably because of disruption net-drop"
        );

        let msg = EventReason::CreateFailed
            .message(
                MessageScope::Disruption,
                &[("target", "web-1"), ("error", "quota exceeded")],
            )
            .unwrap();
        assert_eq!(msg, "Failed to create an agent for target web-1: quota exceeded");

        assert!(EventReason::Finished
            .message(MessageScope::Target, &[])
            .is_none());
    }

    #[test]
    fn test_known_reason_only_for_controller_events() {
        let target = ObjectRef::new(ObjectKind::Pod, Some("default"), "web-1");
        let ours = Event::new(target.clone(), EventReason::TargetPodInWarningState, "x");
        let theirs = Event::external(
            target,
            EventType::Warning,
            "TargetPodInWarningState",
            "x",
            "kubelet",
        );

        assert_eq!(ours.known_reason(), Some(EventReason::TargetPodInWarningState));
        assert_eq!(theirs.known_reason(), None);
    }

    #[test]
    fn test_object_ref_display() {
        assert_eq!(
            ObjectRef::new(ObjectKind::Pod, Some("ns"), "p").to_string(),
            "pod/ns/p"
        );
        assert_eq!(ObjectRef::new(ObjectKind::Node, None, "n").to_string(), "node/n");
    }
}
