//! In-memory platform.
//!
//! Holds every object in process memory and applies the same write rules a
//! cluster API would (optimistic concurrency, finalizers, change
//! notifications). Used by the test-suite and by the controller binary when
//! no cluster is configured.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use faultline_events::{Event, ObjectRef};
use serde::Deserialize;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use super::{Platform, PlatformError, PlatformEvent, PlatformResult};
use crate::model::{
    Agent, AgentPhase, AgentStatus, ContainerState, ContainerStatus, Disruption, LabelSelector,
    Node, ObjectKey, ObjectMeta, Pod, INJECTOR_CONTAINER,
};

const NOTIFICATION_CAPACITY: usize = 1024;

/// Objects to preload, e.g. from a JSON file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SeedState {
    pub disruptions: Vec<Disruption>,
    pub pods: Vec<Pod>,
    pub nodes: Vec<Node>,
}

#[derive(Default)]
struct State {
    disruptions: BTreeMap<ObjectKey, Disruption>,
    pods: BTreeMap<ObjectKey, Pod>,
    nodes: BTreeMap<String, Node>,
    agents: BTreeMap<ObjectKey, Agent>,
    events: Vec<Event>,
    version: u64,
}

impl State {
    fn next_version(&mut self) -> u64 {
        self.version += 1;
        self.version
    }
}

/// Platform backed by process memory.
pub struct InMemoryPlatform {
    state: RwLock<State>,
    notifications: broadcast::Sender<PlatformEvent>,
    name_counter: AtomicU64,
    fail_agent_creation: AtomicBool,
}

impl Default for InMemoryPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryPlatform {
    pub fn new() -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            state: RwLock::new(State::default()),
            notifications,
            name_counter: AtomicU64::new(0),
            fail_agent_creation: AtomicBool::new(false),
        }
    }

    /// Create a platform preloaded with objects.
    pub async fn seeded(seed: SeedState) -> Self {
        let platform = Self::new();
        for node in seed.nodes {
            platform.upsert_node(node).await;
        }
        for pod in seed.pods {
            platform.upsert_pod(pod).await;
        }
        for disruption in seed.disruptions {
            platform.apply_disruption(disruption).await;
        }
        platform
    }

    fn notify(&self, event: PlatformEvent) {
        // No subscriber is not an error.
        let _ = self.notifications.send(event);
    }

    // -------------------------------------------------------------------------
    // Direct manipulation, standing in for users and other cluster components
    // -------------------------------------------------------------------------

    /// Create or replace a disruption, bypassing concurrency checks.
    pub async fn apply_disruption(&self, mut disruption: Disruption) -> Disruption {
        let mut state = self.state.write().await;
        let key = disruption.key();
        if let Some(existing) = state.disruptions.get(&key) {
            disruption.metadata.uid = existing.metadata.uid.clone();
            disruption.metadata.creation_timestamp = existing.metadata.creation_timestamp;
        } else if disruption.metadata.uid.is_empty() {
            disruption.metadata.uid = uuid::Uuid::new_v4().to_string();
        }
        disruption.metadata.resource_version = state.next_version();
        state.disruptions.insert(key.clone(), disruption.clone());
        drop(state);

        self.notify(PlatformEvent::Disruption(key));
        disruption
    }

    pub async fn disruption(&self, key: &ObjectKey) -> Option<Disruption> {
        self.state.read().await.disruptions.get(key).cloned()
    }

    pub async fn upsert_pod(&self, mut pod: Pod) {
        let mut state = self.state.write().await;
        pod.metadata.resource_version = state.next_version();
        let old = state.pods.insert(pod.metadata.key(), pod.clone());
        drop(state);

        self.notify(PlatformEvent::Pod {
            old: old.map(Box::new),
            new: Some(Box::new(pod)),
        });
    }

    pub async fn remove_pod(&self, key: &ObjectKey) {
        let old = self.state.write().await.pods.remove(key);
        if let Some(old) = old {
            self.notify(PlatformEvent::Pod {
                old: Some(Box::new(old)),
                new: None,
            });
        }
    }

    pub async fn upsert_node(&self, mut node: Node) {
        let mut state = self.state.write().await;
        node.metadata.resource_version = state.next_version();
        let old = state.nodes.insert(node.metadata.name.clone(), node.clone());
        drop(state);

        self.notify(PlatformEvent::Node {
            old: old.map(Box::new),
            new: Some(Box::new(node)),
        });
    }

    pub async fn remove_node(&self, name: &str) {
        let old = self.state.write().await.nodes.remove(name);
        if let Some(old) = old {
            self.notify(PlatformEvent::Node {
                old: Some(Box::new(old)),
                new: None,
            });
        }
    }

    /// Every agent, in name order.
    pub async fn agents(&self) -> Vec<Agent> {
        self.state.read().await.agents.values().cloned().collect()
    }

    /// Overwrite an agent's observed status.
    pub async fn set_agent_status(&self, key: &ObjectKey, status: AgentStatus) -> bool {
        let mut state = self.state.write().await;
        let version = state.next_version();
        let Some(agent) = state.agents.get_mut(key) else {
            return false;
        };
        agent.status = status;
        agent.metadata.resource_version = version;
        let owner = agent.owner();
        drop(state);

        self.notify(PlatformEvent::Agent {
            key: key.clone(),
            owner,
        });
        true
    }

    /// Mark an agent running with its readiness sentinel in place.
    pub async fn mark_agent_ready(&self, key: &ObjectKey) -> bool {
        self.set_agent_status(
            key,
            AgentStatus {
                phase: AgentPhase::Running,
                reason: None,
                container_statuses: vec![ContainerStatus::running(INJECTOR_CONTAINER)],
            },
        )
        .await
    }

    /// Mark every agent of a target ready.
    pub async fn mark_target_agents_ready(&self, target: &str) -> usize {
        let keys: Vec<ObjectKey> = self
            .agents()
            .await
            .into_iter()
            .filter(|a| a.target() == Some(target))
            .map(|a| a.key())
            .collect();
        for key in &keys {
            self.mark_agent_ready(key).await;
        }
        keys.len()
    }

    /// Mark an agent finished, its injector exited with `exit_code`.
    pub async fn mark_agent_exited(&self, key: &ObjectKey, exit_code: i32) -> bool {
        self.set_agent_status(
            key,
            AgentStatus {
                phase: if exit_code == 0 {
                    AgentPhase::Succeeded
                } else {
                    AgentPhase::Failed
                },
                reason: None,
                container_statuses: vec![ContainerStatus {
                    name: INJECTOR_CONTAINER.to_string(),
                    container_id: None,
                    ready: false,
                    restart_count: 0,
                    state: ContainerState::Terminated {
                        exit_code,
                        reason: if exit_code == 0 { "Completed" } else { "Error" }.to_string(),
                    },
                }],
            },
        )
        .await
    }

    /// Every recorded event.
    pub async fn events(&self) -> Vec<Event> {
        self.state.read().await.events.clone()
    }

    /// Make subsequent agent creations fail.
    pub fn fail_agent_creation(&self, fail: bool) {
        self.fail_agent_creation.store(fail, Ordering::SeqCst);
    }

    fn generate_name(&self, prefix: &str) -> String {
        let n = self.name_counter.fetch_add(1, Ordering::SeqCst);
        format!("{prefix}{n:05x}")
    }
}

fn not_found(kind: &'static str, key: &ObjectKey) -> PlatformError {
    PlatformError::NotFound {
        kind,
        key: key.clone(),
    }
}

fn check_version(
    kind: &'static str,
    stored: &ObjectMeta,
    incoming: &ObjectMeta,
) -> PlatformResult<()> {
    if stored.resource_version != incoming.resource_version {
        return Err(PlatformError::Conflict {
            kind,
            key: incoming.key(),
        });
    }
    Ok(())
}

fn labels_match(meta: &ObjectMeta, labels: &BTreeMap<String, String>) -> bool {
    labels.iter().all(|(k, v)| meta.labels.get(k) == Some(v))
}

#[async_trait]
impl Platform for InMemoryPlatform {
    async fn get_disruption(&self, key: &ObjectKey) -> PlatformResult<Disruption> {
        self.state
            .read()
            .await
            .disruptions
            .get(key)
            .cloned()
            .ok_or_else(|| not_found("disruption", key))
    }

    async fn list_disruptions(&self) -> PlatformResult<Vec<Disruption>> {
        Ok(self.state.read().await.disruptions.values().cloned().collect())
    }

    async fn update_disruption(&self, disruption: &Disruption) -> PlatformResult<Disruption> {
        let key = disruption.key();
        let mut state = self.state.write().await;
        let version = state.next_version();
        let stored = state
            .disruptions
            .get_mut(&key)
            .ok_or_else(|| not_found("disruption", &key))?;
        check_version("disruption", &stored.metadata, &disruption.metadata)?;

        let status = std::mem::take(&mut stored.status);
        let deletion_timestamp = stored.metadata.deletion_timestamp;
        *stored = disruption.clone();
        stored.status = status;
        stored.metadata.deletion_timestamp = deletion_timestamp;
        stored.metadata.resource_version = version;
        let updated = stored.clone();

        if updated.metadata.is_being_deleted() && updated.metadata.finalizers.is_empty() {
            state.disruptions.remove(&key);
            debug!(disruption = %key, "Disruption removed after last finalizer");
        }
        drop(state);

        self.notify(PlatformEvent::Disruption(key));
        Ok(updated)
    }

    async fn update_disruption_status(
        &self,
        disruption: &Disruption,
    ) -> PlatformResult<Disruption> {
        let key = disruption.key();
        let mut state = self.state.write().await;
        let version = state.next_version();
        let stored = state
            .disruptions
            .get_mut(&key)
            .ok_or_else(|| not_found("disruption", &key))?;
        check_version("disruption", &stored.metadata, &disruption.metadata)?;

        stored.status = disruption.status.clone();
        stored.metadata.resource_version = version;
        let updated = stored.clone();
        drop(state);

        self.notify(PlatformEvent::Disruption(key));
        Ok(updated)
    }

    async fn delete_disruption(&self, key: &ObjectKey) -> PlatformResult<()> {
        let mut state = self.state.write().await;
        let version = state.next_version();
        let stored = state
            .disruptions
            .get_mut(key)
            .ok_or_else(|| not_found("disruption", key))?;

        if stored.metadata.finalizers.is_empty() {
            state.disruptions.remove(key);
        } else if stored.metadata.deletion_timestamp.is_none() {
            stored.metadata.deletion_timestamp = Some(Utc::now());
            stored.metadata.resource_version = version;
        }
        drop(state);

        self.notify(PlatformEvent::Disruption(key.clone()));
        Ok(())
    }

    async fn list_pods(
        &self,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> PlatformResult<Vec<Pod>> {
        Ok(self
            .state
            .read()
            .await
            .pods
            .values()
            .filter(|p| namespace.is_none_or(|ns| p.metadata.namespace == ns))
            .filter(|p| selector.matches(&p.metadata.labels))
            .cloned()
            .collect())
    }

    async fn get_pod(&self, key: &ObjectKey) -> PlatformResult<Pod> {
        self.state
            .read()
            .await
            .pods
            .get(key)
            .cloned()
            .ok_or_else(|| not_found("pod", key))
    }

    async fn list_nodes(&self, selector: &LabelSelector) -> PlatformResult<Vec<Node>> {
        Ok(self
            .state
            .read()
            .await
            .nodes
            .values()
            .filter(|n| selector.matches(&n.metadata.labels))
            .cloned()
            .collect())
    }

    async fn get_node(&self, name: &str) -> PlatformResult<Node> {
        self.state
            .read()
            .await
            .nodes
            .get(name)
            .cloned()
            .ok_or_else(|| not_found("node", &ObjectKey::cluster(name)))
    }

    async fn list_agents(
        &self,
        namespace: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> PlatformResult<Vec<Agent>> {
        Ok(self
            .state
            .read()
            .await
            .agents
            .values()
            .filter(|a| namespace.is_none_or(|ns| a.metadata.namespace == ns))
            .filter(|a| labels_match(&a.metadata, labels))
            .cloned()
            .collect())
    }

    async fn get_agent(&self, key: &ObjectKey) -> PlatformResult<Agent> {
        self.state
            .read()
            .await
            .agents
            .get(key)
            .cloned()
            .ok_or_else(|| not_found("agent", key))
    }

    async fn create_agent(&self, mut agent: Agent) -> PlatformResult<Agent> {
        if self.fail_agent_creation.load(Ordering::SeqCst) {
            return Err(PlatformError::Unavailable(
                "agent admission rejected".to_string(),
            ));
        }
        if agent.metadata.name.is_empty() {
            let prefix = agent.metadata.generate_name.clone().unwrap_or_default();
            agent.metadata.name = self.generate_name(&prefix);
        }

        let key = agent.key();
        let mut state = self.state.write().await;
        if state.agents.contains_key(&key) {
            return Err(PlatformError::AlreadyExists { kind: "agent", key });
        }
        agent.metadata.uid = uuid::Uuid::new_v4().to_string();
        agent.metadata.creation_timestamp = Utc::now();
        agent.metadata.deletion_timestamp = None;
        agent.metadata.resource_version = state.next_version();
        agent.status = AgentStatus::default();
        state.agents.insert(key.clone(), agent.clone());
        drop(state);

        self.notify(PlatformEvent::Agent {
            key,
            owner: agent.owner(),
        });
        Ok(agent)
    }

    async fn update_agent(&self, agent: &Agent) -> PlatformResult<Agent> {
        let key = agent.key();
        let mut state = self.state.write().await;
        let version = state.next_version();
        let stored = state
            .agents
            .get_mut(&key)
            .ok_or_else(|| not_found("agent", &key))?;
        check_version("agent", &stored.metadata, &agent.metadata)?;

        stored.metadata.finalizers = agent.metadata.finalizers.clone();
        stored.metadata.labels = agent.metadata.labels.clone();
        stored.metadata.annotations = agent.metadata.annotations.clone();
        stored.metadata.resource_version = version;
        let updated = stored.clone();

        if updated.metadata.is_being_deleted() && updated.metadata.finalizers.is_empty() {
            state.agents.remove(&key);
            debug!(agent = %key, "Agent removed after last finalizer");
        }
        drop(state);

        self.notify(PlatformEvent::Agent {
            key,
            owner: updated.owner(),
        });
        Ok(updated)
    }

    async fn delete_agent(&self, key: &ObjectKey) -> PlatformResult<()> {
        let mut state = self.state.write().await;
        let version = state.next_version();
        let stored = state
            .agents
            .get_mut(key)
            .ok_or_else(|| not_found("agent", key))?;
        let owner = stored.owner();

        if stored.metadata.finalizers.is_empty() {
            state.agents.remove(key);
        } else if stored.metadata.deletion_timestamp.is_none() {
            stored.metadata.deletion_timestamp = Some(Utc::now());
            stored.metadata.resource_version = version;
        }
        drop(state);

        self.notify(PlatformEvent::Agent {
            key: key.clone(),
            owner,
        });
        Ok(())
    }

    async fn record_event(&self, event: Event) -> PlatformResult<()> {
        self.state.write().await.events.push(event);
        Ok(())
    }

    async fn list_events(&self, involved: &ObjectRef) -> PlatformResult<Vec<Event>> {
        Ok(self
            .state
            .read()
            .await
            .events
            .iter()
            .filter(|e| &e.involved == involved)
            .cloned()
            .collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<PlatformEvent> {
        self.notifications.subscribe()
    }
}
