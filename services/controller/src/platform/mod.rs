//! Platform abstraction.
//!
//! The controller reads and writes cluster objects only through
//! [`Platform`]. Semantics follow a typical cluster API:
//!
//! - writes carry the `resource_version` they were based on; a stale write
//!   fails with [`PlatformError::Conflict`]
//! - deleting an object that still has finalizers only marks it (sets
//!   `deletion_timestamp`); removing its last finalizer removes it
//! - every change is published on a broadcast channel

mod memory;

pub use memory::{InMemoryPlatform, SeedState};

use std::collections::BTreeMap;

use async_trait::async_trait;
use faultline_events::{Event, ObjectRef};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::model::{Agent, Disruption, LabelSelector, Node, ObjectKey, Pod};

/// Platform errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlatformError {
    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: ObjectKey },

    #[error("{kind} {key} was modified concurrently")]
    Conflict { kind: &'static str, key: ObjectKey },

    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: &'static str, key: ObjectKey },

    #[error("platform unavailable: {0}")]
    Unavailable(String),
}

impl PlatformError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, PlatformError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, PlatformError::Conflict { .. })
    }
}

pub type PlatformResult<T> = Result<T, PlatformError>;

/// A change notification.
#[derive(Debug, Clone)]
pub enum PlatformEvent {
    Disruption(ObjectKey),

    Agent {
        key: ObjectKey,
        owner: Option<ObjectKey>,
    },

    /// Pod added (`old` empty), updated, or removed (`new` empty).
    Pod {
        old: Option<Box<Pod>>,
        new: Option<Box<Pod>>,
    },

    /// Node added, updated or removed.
    Node {
        old: Option<Box<Node>>,
        new: Option<Box<Node>>,
    },
}

/// Cluster API used by the controller.
#[async_trait]
pub trait Platform: Send + Sync {
    // Disruptions

    async fn get_disruption(&self, key: &ObjectKey) -> PlatformResult<Disruption>;

    async fn list_disruptions(&self) -> PlatformResult<Vec<Disruption>>;

    /// Write metadata and spec; status is ignored.
    async fn update_disruption(&self, disruption: &Disruption) -> PlatformResult<Disruption>;

    /// Write status; metadata and spec are ignored.
    async fn update_disruption_status(&self, disruption: &Disruption)
        -> PlatformResult<Disruption>;

    async fn delete_disruption(&self, key: &ObjectKey) -> PlatformResult<()>;

    // Targets

    /// Pods matching a selector; all namespaces when `namespace` is `None`.
    async fn list_pods(
        &self,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> PlatformResult<Vec<Pod>>;

    async fn get_pod(&self, key: &ObjectKey) -> PlatformResult<Pod>;

    async fn list_nodes(&self, selector: &LabelSelector) -> PlatformResult<Vec<Node>>;

    async fn get_node(&self, name: &str) -> PlatformResult<Node>;

    // Agents

    /// Agents carrying every given label; all namespaces when `namespace` is `None`.
    async fn list_agents(
        &self,
        namespace: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> PlatformResult<Vec<Agent>>;

    async fn get_agent(&self, key: &ObjectKey) -> PlatformResult<Agent>;

    /// Create an agent, generating its name from `generate_name` when empty.
    async fn create_agent(&self, agent: Agent) -> PlatformResult<Agent>;

    /// Write metadata (finalizers, labels); spec and status are ignored.
    async fn update_agent(&self, agent: &Agent) -> PlatformResult<Agent>;

    async fn delete_agent(&self, key: &ObjectKey) -> PlatformResult<()>;

    // Events

    async fn record_event(&self, event: Event) -> PlatformResult<()>;

    async fn list_events(&self, involved: &ObjectRef) -> PlatformResult<Vec<Event>>;

    // Notifications

    fn subscribe(&self) -> broadcast::Receiver<PlatformEvent>;
}
