//! Injection agents.
//!
//! An agent is a short-lived privileged process (a pod, on a real cluster)
//! doing one fault kind against one target. It carries ownership labels and
//! a finalizer that only the controller removes.

use std::collections::BTreeMap;
use std::time::Duration;

use faultline_events::{ObjectKind, ObjectRef};
use serde::{Deserialize, Serialize};

use super::disruption::{
    DISRUPTION_NAMESPACE_LABEL, DISRUPTION_NAME_LABEL, FAULT_KIND_LABEL, TARGET_LABEL,
};
use super::fault::FaultKind;
use super::meta::{ObjectKey, ObjectMeta};
use super::workload::ContainerStatus;

/// Name of the agent's main container.
pub const INJECTOR_CONTAINER: &str = "injector";

/// Value of an environment variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EnvValue {
    Literal(String),

    /// Filled by the platform from the agent's own object (e.g. `status.podIP`).
    FieldRef(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: EnvValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostMount {
    pub name: String,
    pub host_path: String,
    pub mount_path: String,
}

/// Readiness is the presence of a sentinel file written by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessProbe {
    pub sentinel_path: String,

    #[serde(with = "humantime_serde")]
    pub period: Duration,
    pub failure_threshold: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSpec {
    pub fault_kind: FaultKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    pub image: String,
    pub service_account: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_secret: Option<String>,
    pub args: Vec<String>,
    pub env: Vec<EnvVar>,
    pub mounts: Vec<HostMount>,
    pub readiness_probe: ReadinessProbe,

    #[serde(with = "humantime_serde")]
    pub active_deadline: Duration,

    #[serde(with = "humantime_serde")]
    pub termination_grace_period: Duration,
    pub privileged: bool,
    pub host_pid: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AgentPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentStatus {
    pub phase: AgentPhase,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub container_statuses: Vec<ContainerStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    pub metadata: ObjectMeta,
    pub spec: AgentSpec,

    #[serde(default)]
    pub status: AgentStatus,
}

impl Agent {
    pub fn key(&self) -> ObjectKey {
        self.metadata.key()
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(
            ObjectKind::Agent,
            Some(&self.metadata.namespace),
            &self.metadata.name,
        )
    }

    /// Target name from the ownership labels.
    pub fn target(&self) -> Option<&str> {
        self.metadata.label(TARGET_LABEL)
    }

    /// Fault kind from the ownership labels.
    pub fn fault_kind(&self) -> Option<FaultKind> {
        self.metadata.label(FAULT_KIND_LABEL)?.parse().ok()
    }

    /// Owning disruption from the ownership labels.
    pub fn owner(&self) -> Option<ObjectKey> {
        let name = self.metadata.label(DISRUPTION_NAME_LABEL)?;
        let namespace = self.metadata.label(DISRUPTION_NAMESPACE_LABEL)?;
        Some(ObjectKey::new(namespace, name))
    }

    pub fn injector_status(&self) -> Option<&ContainerStatus> {
        self.status
            .container_statuses
            .iter()
            .find(|c| c.name == INJECTOR_CONTAINER)
    }

    /// Running with its readiness sentinel in place.
    pub fn is_ready(&self) -> bool {
        self.status.phase == AgentPhase::Running
            && self.injector_status().is_some_and(|c| c.ready)
    }
}

/// Labels identifying the agents of one disruption.
pub fn ownership_labels(disruption: &ObjectKey) -> BTreeMap<String, String> {
    BTreeMap::from([
        (DISRUPTION_NAME_LABEL.to_string(), disruption.name.clone()),
        (
            DISRUPTION_NAMESPACE_LABEL.to_string(),
            disruption.namespace.clone(),
        ),
    ])
}
