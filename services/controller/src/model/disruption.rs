//! The Disruption resource.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use faultline_events::{ObjectKind, ObjectRef};
use faultline_reconcile::{Count, ReconcileError, SpecHash};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::fault::{Fault, FaultError, FaultKind};
use super::meta::{ObjectKey, ObjectMeta};
use super::selector::{LabelRequirement, LabelSelector, SelectorError};
use super::status::{InjectionStatus, TargetInjectionStatus};

// =============================================================================
// Well-known labels and finalizers
// =============================================================================

/// Agent label naming its target.
pub const TARGET_LABEL: &str = "faultline.io/target";

/// Agent label naming its fault kind.
pub const FAULT_KIND_LABEL: &str = "faultline.io/fault-kind";

/// Agent label naming the owning disruption.
pub const DISRUPTION_NAME_LABEL: &str = "faultline.io/disruption-name";

/// Agent label naming the owning disruption's namespace.
pub const DISRUPTION_NAMESPACE_LABEL: &str = "faultline.io/disruption-namespace";

/// Pod label opting a pod into on-init disruptions.
pub const DISRUPT_ON_INIT_LABEL: &str = "faultline.io/disrupt-on-init";

/// Init container that holds a pod until its on-init agents are ready.
pub const ON_INIT_CONTAINER: &str = "fault-handler";

/// Finalizer blocking disruption removal until agents are cleaned up.
pub const DISRUPTION_FINALIZER: &str = "finalizer.faultline.io";

/// Finalizer blocking agent removal until its injection is rolled back.
pub const AGENT_FINALIZER: &str = "finalizer.faultline.io/agent";

// =============================================================================
// Errors
// =============================================================================

/// Invalid disruption spec. Surfaced to the user, never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SpecError {
    #[error("no fault is declared")]
    NoFault,

    #[error("fault kind {0} is declared more than once")]
    DuplicateKind(FaultKind),

    #[error(transparent)]
    Fault(#[from] FaultError),

    #[error(transparent)]
    Selector(#[from] SelectorError),

    #[error("onInit is only supported at pod level")]
    OnInitAtNodeLevel,
}

// =============================================================================
// Spec
// =============================================================================

/// Level at which targets are picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    #[default]
    Pod,
    Node,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Pod => "pod",
            Level::Node => "node",
        }
    }
}

/// A point in time, absolute or relative to the disruption's creation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TriggerTime {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,

    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub offset: Option<Duration>,
}

impl TriggerTime {
    fn resolve(&self, created: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if let Some(at) = self.not_before {
            return Some(at.max(created));
        }
        self.offset
            .and_then(|o| chrono::Duration::from_std(o).ok())
            .map(|o| created + o)
    }
}

/// Delays before creating agents and before agents start injecting.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Triggers {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inject: Option<TriggerTime>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub create_agents: Option<TriggerTime>,
}

/// Alternate between injecting and pausing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pulse {
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub initial_delay: Option<Duration>,

    #[serde(with = "humantime_serde")]
    pub active_duration: Duration,

    #[serde(with = "humantime_serde")]
    pub dormant_duration: Duration,
}

/// Safety-net overrides.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UnsafeMode {
    pub disable_all: bool,
    pub disable_count_too_large: bool,
    pub disable_neither_host_nor_port: bool,
}

/// Only keep candidates carrying every listed annotation value.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetFilter {
    pub annotations: BTreeMap<String, String>,
}

impl TargetFilter {
    pub fn allows(&self, annotations: &BTreeMap<String, String>) -> bool {
        self.annotations
            .iter()
            .all(|(k, v)| annotations.get(k) == Some(v))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisruptionSpec {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub selector: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub advanced_selector: Vec<LabelRequirement>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<TargetFilter>,

    pub count: Count,

    #[serde(default)]
    pub level: Level,

    /// Target container names; every running container when empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub containers: Vec<String>,

    #[serde(default)]
    pub static_targeting: bool,

    #[serde(default)]
    pub on_init: bool,

    #[serde(default)]
    pub dry_run: bool,

    /// Allow targets already disrupted by another disruption of the same kind.
    #[serde(default)]
    pub allow_disrupted_targets: bool,

    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub duration: Option<Duration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggers: Option<Triggers>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pulse: Option<Pulse>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsafe_mode: Option<UnsafeMode>,

    #[serde(default)]
    pub faults: Vec<Fault>,
}

impl DisruptionSpec {
    /// A pod-level spec selecting on label equality.
    pub fn new(selector: &[(&str, &str)], count: Count, faults: Vec<Fault>) -> Self {
        Self {
            selector: selector
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            advanced_selector: Vec::new(),
            filter: None,
            count,
            level: Level::Pod,
            containers: Vec::new(),
            static_targeting: false,
            on_init: false,
            dry_run: false,
            allow_disrupted_targets: false,
            duration: None,
            triggers: None,
            pulse: None,
            unsafe_mode: None,
            faults,
        }
    }
}

// =============================================================================
// Status
// =============================================================================

/// Chosen target and the state of its injection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInjection {
    pub injection_status: TargetInjectionStatus,

    /// Last time `injection_status` changed.
    pub since: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub agent_names: Vec<String>,
}

impl TargetInjection {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            injection_status: TargetInjectionStatus::NotInjected,
            since: now,
            agent_names: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DisruptionStatus {
    /// Target name to injection state.
    pub target_injections: BTreeMap<String, TargetInjection>,
    pub desired_targets_count: u32,
    pub selected_targets_count: u32,
    pub ignored_targets_count: u32,
    pub injected_targets_count: u32,
    pub injection_status: InjectionStatus,
    pub is_stuck_on_removal: bool,
}

impl DisruptionStatus {
    pub fn has_target(&self, name: &str) -> bool {
        self.target_injections.contains_key(name)
    }

    pub fn target_names(&self) -> Vec<String> {
        self.target_injections.keys().cloned().collect()
    }
}

// =============================================================================
// Disruption
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disruption {
    pub metadata: ObjectMeta,
    pub spec: DisruptionSpec,

    #[serde(default)]
    pub status: DisruptionStatus,
}

impl Disruption {
    pub fn new(namespace: &str, name: &str, spec: DisruptionSpec) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            spec,
            status: DisruptionStatus::default(),
        }
    }

    pub fn key(&self) -> ObjectKey {
        self.metadata.key()
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn namespace(&self) -> &str {
        &self.metadata.namespace
    }

    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(
            ObjectKind::Disruption,
            Some(&self.metadata.namespace),
            &self.metadata.name,
        )
    }

    /// Declared fault kinds, sorted.
    pub fn fault_kinds(&self) -> Vec<FaultKind> {
        let mut kinds: Vec<_> = self.spec.faults.iter().map(Fault::kind).collect();
        kinds.sort();
        kinds
    }

    pub fn fault(&self, kind: FaultKind) -> Option<&Fault> {
        self.spec.faults.iter().find(|f| f.kind() == kind)
    }

    /// Whether the target set is re-evaluated as the population changes.
    pub fn is_dynamic(&self) -> bool {
        !self.spec.static_targeting
    }

    pub fn validate(&self) -> Result<(), SpecError> {
        if self.spec.faults.is_empty() {
            return Err(SpecError::NoFault);
        }
        let mut seen = Vec::with_capacity(self.spec.faults.len());
        for fault in &self.spec.faults {
            let kind = fault.kind();
            if seen.contains(&kind) {
                return Err(SpecError::DuplicateKind(kind));
            }
            seen.push(kind);
            fault.validate()?;
        }
        if self.spec.on_init && self.spec.level == Level::Node {
            return Err(SpecError::OnInitAtNodeLevel);
        }
        Ok(())
    }

    /// The selector targets must match.
    ///
    /// On-init disruptions additionally require the opt-in label.
    pub fn label_selector(&self) -> Result<LabelSelector, SelectorError> {
        let mut selector =
            LabelSelector::build(&self.spec.selector, &self.spec.advanced_selector)?;
        if self.spec.on_init {
            selector = selector.with_requirement(LabelRequirement::exists(DISRUPT_ON_INIT_LABEL));
        }
        Ok(selector)
    }

    /// Hash of the spec without its count.
    ///
    /// Scaling a disruption keeps its hash, so its watch survives.
    pub fn spec_hash_without_count(&self) -> Result<SpecHash, ReconcileError> {
        SpecHash::from_serializable_without(&self.spec, &["count"])
    }

    pub fn spec_hash(&self) -> Result<SpecHash, ReconcileError> {
        SpecHash::from_serializable_without(&self.spec, &[])
    }

    // -------------------------------------------------------------------------
    // Timing
    // -------------------------------------------------------------------------

    pub fn duration_or(&self, default: Duration) -> Duration {
        self.spec.duration.unwrap_or(default)
    }

    /// When agents start injecting.
    pub fn time_to_inject(&self) -> DateTime<Utc> {
        let created = self.metadata.creation_timestamp;
        self.spec
            .triggers
            .as_ref()
            .and_then(|t| t.inject.as_ref())
            .and_then(|t| t.resolve(created))
            .unwrap_or(created)
    }

    /// When agents may be created.
    pub fn time_to_create_agents(&self) -> DateTime<Utc> {
        let created = self.metadata.creation_timestamp;
        self.spec
            .triggers
            .as_ref()
            .and_then(|t| t.create_agents.as_ref())
            .and_then(|t| t.resolve(created))
            .unwrap_or(created)
            .min(self.time_to_inject())
    }

    /// End of the injection window.
    pub fn deadline(&self, default_duration: Duration) -> DateTime<Utc> {
        let duration = chrono::Duration::from_std(self.duration_or(default_duration))
            .unwrap_or(chrono::Duration::MAX);
        self.time_to_inject()
            .checked_add_signed(duration)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Time left before the deadline, zero once passed.
    pub fn remaining(&self, now: DateTime<Utc>, default_duration: Duration) -> Duration {
        (self.deadline(default_duration) - now)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    pub fn is_expired(&self, now: DateTime<Utc>, default_duration: Duration) -> bool {
        now >= self.deadline(default_duration)
    }
}
