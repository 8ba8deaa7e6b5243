//! Workloads that can be targeted: pods and nodes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use faultline_events::{ObjectKind, ObjectRef};
use serde::{Deserialize, Serialize};

use super::meta::{ObjectKey, ObjectMeta};

// =============================================================================
// Containers
// =============================================================================

/// Observed state of a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase", tag = "state")]
pub enum ContainerState {
    Waiting {
        #[serde(default)]
        reason: String,
    },
    Running {
        #[serde(default = "Utc::now")]
        started_at: DateTime<Utc>,
    },
    Terminated {
        exit_code: i32,
        #[serde(default)]
        reason: String,
    },
}

impl ContainerState {
    pub fn is_running(&self) -> bool {
        matches!(self, ContainerState::Running { .. })
    }

    /// The waiting or terminated reason, empty when running.
    pub fn reason(&self) -> &str {
        match self {
            ContainerState::Waiting { reason } | ContainerState::Terminated { reason, .. } => reason,
            ContainerState::Running { .. } => "",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStatus {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,

    #[serde(default)]
    pub ready: bool,

    #[serde(default)]
    pub restart_count: u32,

    pub state: ContainerState,
}

impl ContainerStatus {
    pub fn running(name: &str) -> Self {
        Self {
            name: name.to_string(),
            container_id: Some(format!("containerd://{name}")),
            ready: true,
            restart_count: 0,
            state: ContainerState::Running {
                started_at: Utc::now(),
            },
        }
    }
}

// =============================================================================
// Pods
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PodPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,

    #[serde(default)]
    pub containers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodStatus {
    #[serde(default)]
    pub phase: PodPhase,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_ip: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,

    #[serde(default)]
    pub container_statuses: Vec<ContainerStatus>,

    #[serde(default)]
    pub init_container_statuses: Vec<ContainerStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pod {
    pub metadata: ObjectMeta,

    #[serde(default)]
    pub spec: PodSpec,

    #[serde(default)]
    pub status: PodStatus,
}

impl Pod {
    /// A running pod with one ready container per name.
    pub fn running(namespace: &str, name: &str, node: &str, containers: &[&str]) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            spec: PodSpec {
                node_name: Some(node.to_string()),
                containers: containers.iter().map(|c| c.to_string()).collect(),
            },
            status: PodStatus {
                phase: PodPhase::Running,
                pod_ip: Some("10.0.0.10".to_string()),
                host_ip: Some("192.168.0.10".to_string()),
                container_statuses: containers.iter().map(|c| ContainerStatus::running(c)).collect(),
                init_container_statuses: Vec::new(),
            },
        }
    }

    pub fn with_labels(mut self, labels: &[(&str, &str)]) -> Self {
        for (k, v) in labels {
            self.metadata.labels.insert(k.to_string(), v.to_string());
        }
        self
    }

    pub fn with_ips(mut self, pod_ip: &str, host_ip: &str) -> Self {
        self.status.pod_ip = Some(pod_ip.to_string());
        self.status.host_ip = Some(host_ip.to_string());
        self
    }

    /// Whether the given init container is currently running.
    pub fn init_container_running(&self, name: &str) -> bool {
        self.status
            .init_container_statuses
            .iter()
            .any(|c| c.name == name && c.state.is_running())
    }
}

// =============================================================================
// Nodes
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeConditionType {
    Ready,
    MemoryPressure,
    DiskPressure,
    PIDPressure,
    NetworkUnavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeCondition {
    #[serde(rename = "type")]
    pub condition_type: NodeConditionType,
    pub status: ConditionStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodePhase {
    Pending,
    Running,
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<NodePhase>,

    #[serde(default)]
    pub conditions: Vec<NodeCondition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_ip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub metadata: ObjectMeta,

    #[serde(default)]
    pub status: NodeStatus,
}

impl Node {
    /// A node with `Ready=True`.
    pub fn ready(name: &str) -> Self {
        Self {
            metadata: ObjectMeta::new("", name),
            status: NodeStatus {
                phase: Some(NodePhase::Running),
                conditions: vec![NodeCondition {
                    condition_type: NodeConditionType::Ready,
                    status: ConditionStatus::True,
                }],
                internal_ip: Some("192.168.0.10".to_string()),
            },
        }
    }

    pub fn with_labels(mut self, labels: &[(&str, &str)]) -> Self {
        for (k, v) in labels {
            self.metadata.labels.insert(k.to_string(), v.to_string());
        }
        self
    }

    pub fn condition(&self, condition_type: NodeConditionType) -> Option<ConditionStatus> {
        self.status
            .conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
            .map(|c| c.status)
    }

    pub fn is_ready(&self) -> bool {
        self.condition(NodeConditionType::Ready) == Some(ConditionStatus::True)
    }

    /// Set (or add) a condition.
    pub fn set_condition(&mut self, condition_type: NodeConditionType, status: ConditionStatus) {
        match self
            .status
            .conditions
            .iter_mut()
            .find(|c| c.condition_type == condition_type)
        {
            Some(c) => c.status = status,
            None => self.status.conditions.push(NodeCondition {
                condition_type,
                status,
            }),
        }
    }
}

// =============================================================================
// Targets
// =============================================================================

/// Something a disruption can target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Pod(Pod),
    Node(Node),
}

impl Target {
    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            Target::Pod(p) => &p.metadata,
            Target::Node(n) => &n.metadata,
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata().name
    }

    pub fn key(&self) -> ObjectKey {
        self.metadata().key()
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.metadata().labels
    }

    pub fn annotations(&self) -> &BTreeMap<String, String> {
        &self.metadata().annotations
    }

    pub fn object_ref(&self) -> ObjectRef {
        match self {
            Target::Pod(p) => ObjectRef::new(
                ObjectKind::Pod,
                Some(&p.metadata.namespace),
                &p.metadata.name,
            ),
            Target::Node(n) => ObjectRef::new(ObjectKind::Node, None, &n.metadata.name),
        }
    }

    /// Node the target lives on (itself, for nodes).
    pub fn node_name(&self) -> Option<&str> {
        match self {
            Target::Pod(p) => p.spec.node_name.as_deref(),
            Target::Node(n) => Some(&n.metadata.name),
        }
    }
}
