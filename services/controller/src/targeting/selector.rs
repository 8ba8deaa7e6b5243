//! Candidate target selection.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::config::Safeguards;
use crate::error::ControllerResult;
use crate::model::disruption::ON_INIT_CONTAINER;
use crate::model::{Disruption, Level, Node, ObjectKey, Pod, PodPhase, Target};
use crate::platform::{Platform, PlatformError};

/// Why a target cannot be disrupted right now.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TargetHealthError {
    #[error("target {0} not found")]
    NotFound(String),

    #[error("pod is not running")]
    PodNotRunning,

    #[error("node is not ready")]
    NodeNotReady,

    #[error(transparent)]
    Platform(PlatformError),
}

impl TargetHealthError {
    /// The target is gone or unhealthy, as opposed to a failed lookup.
    pub fn is_unhealthy(&self) -> bool {
        !matches!(self, TargetHealthError::Platform(_))
    }
}

/// Result of a selection pass.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    /// Healthy candidates, in name order.
    pub candidates: Vec<Target>,

    /// Raw number of selector matches, healthy or not.
    pub population: usize,
}

#[async_trait]
pub trait TargetSelector: Send + Sync {
    /// Healthy candidates matching the disruption's selector.
    async fn get_matching_targets(&self, disruption: &Disruption) -> ControllerResult<Selection>;

    /// Check that a chosen target can still be disrupted.
    async fn target_is_healthy(
        &self,
        target: &str,
        disruption: &Disruption,
    ) -> Result<(), TargetHealthError>;
}

/// Fetch a target by name at the disruption's level.
pub async fn get_target(
    platform: &dyn Platform,
    name: &str,
    disruption: &Disruption,
) -> Result<Target, PlatformError> {
    match disruption.spec.level {
        Level::Pod => platform
            .get_pod(&ObjectKey::new(disruption.namespace(), name))
            .await
            .map(Target::Pod),
        Level::Node => platform.get_node(name).await.map(Target::Node),
    }
}

/// Selects running pods and ready nodes.
pub struct RunningTargetSelector {
    platform: Arc<dyn Platform>,
    safeguards: Safeguards,
}

impl RunningTargetSelector {
    pub fn new(platform: Arc<dyn Platform>, safeguards: Safeguards) -> Self {
        Self {
            platform,
            safeguards,
        }
    }

    fn is_controller_pod(&self, pod: &Pod) -> bool {
        self.safeguards.enabled
            && self.safeguards.controller_pod_name.as_deref() == Some(pod.metadata.name.as_str())
    }

    fn is_controller_node(&self, node: &Node) -> bool {
        self.safeguards.enabled
            && self.safeguards.controller_node_name.as_deref() == Some(node.metadata.name.as_str())
    }

    /// Pod readiness, accounting for on-init disruptions.
    fn pod_is_selectable(pod: &Pod, disruption: &Disruption) -> bool {
        if pod.metadata.is_being_deleted() {
            return false;
        }
        if disruption.spec.on_init {
            // Targets chosen while held in init stay eligible once they start.
            if disruption.status.has_target(&pod.metadata.name) {
                return matches!(pod.status.phase, PodPhase::Pending | PodPhase::Running);
            }
            return pod.status.phase == PodPhase::Pending
                && pod.init_container_running(ON_INIT_CONTAINER);
        }
        pod.status.phase == PodPhase::Running
    }
}

#[async_trait]
impl TargetSelector for RunningTargetSelector {
    async fn get_matching_targets(&self, disruption: &Disruption) -> ControllerResult<Selection> {
        let selector = disruption.label_selector()?;
        let filter = disruption.spec.filter.clone().unwrap_or_default();

        let (population, mut candidates): (usize, Vec<Target>) = match disruption.spec.level {
            Level::Pod => {
                let pods = self
                    .platform
                    .list_pods(Some(disruption.namespace()), &selector)
                    .await?;
                let population = pods.len();
                let candidates = pods
                    .into_iter()
                    .filter(|p| !self.is_controller_pod(p))
                    .filter(|p| Self::pod_is_selectable(p, disruption))
                    .filter(|p| filter.allows(&p.metadata.annotations))
                    .map(Target::Pod)
                    .collect();
                (population, candidates)
            }
            Level::Node => {
                let nodes = self.platform.list_nodes(&selector).await?;
                let population = nodes.len();
                let candidates = nodes
                    .into_iter()
                    .filter(|n| !self.is_controller_node(n))
                    .filter(|n| n.is_ready() && !n.metadata.is_being_deleted())
                    .filter(|n| filter.allows(&n.metadata.annotations))
                    .map(Target::Node)
                    .collect();
                (population, candidates)
            }
        };

        candidates.sort_by(|a, b| a.name().cmp(b.name()));
        debug!(
            disruption = %disruption.key(),
            selector = %selector,
            population,
            candidates = candidates.len(),
            "Selected candidate targets"
        );

        Ok(Selection {
            candidates,
            population,
        })
    }

    async fn target_is_healthy(
        &self,
        target: &str,
        disruption: &Disruption,
    ) -> Result<(), TargetHealthError> {
        match get_target(self.platform.as_ref(), target, disruption).await {
            Ok(Target::Pod(pod)) => {
                let held_in_init = disruption.spec.on_init
                    && pod.status.phase == PodPhase::Pending
                    && pod.init_container_running(ON_INIT_CONTAINER);
                if pod.status.phase == PodPhase::Running || held_in_init {
                    Ok(())
                } else {
                    Err(TargetHealthError::PodNotRunning)
                }
            }
            Ok(Target::Node(node)) => {
                if node.is_ready() {
                    Ok(())
                } else {
                    Err(TargetHealthError::NodeNotReady)
                }
            }
            Err(e) if e.is_not_found() => Err(TargetHealthError::NotFound(target.to_string())),
            Err(e) => Err(TargetHealthError::Platform(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fault::{CpuPressureFault, Fault};
    use crate::model::workload::ContainerStatus;
    use crate::model::{ConditionStatus, DisruptionSpec, NodeConditionType};
    use crate::platform::InMemoryPlatform;
    use faultline_reconcile::Count;

    fn disruption(level: Level) -> Disruption {
        let mut spec = DisruptionSpec::new(
            &[("app", "web")],
            Count::Percentage(100),
            vec![Fault::CpuPressure(CpuPressureFault::default())],
        );
        spec.level = level;
        Disruption::new("default", "cpu", spec)
    }

    async fn selector_with(platform: Arc<InMemoryPlatform>, safeguards: Safeguards) -> RunningTargetSelector {
        RunningTargetSelector::new(platform, safeguards)
    }

    #[tokio::test]
    async fn test_only_running_pods_are_candidates() {
        let platform = Arc::new(InMemoryPlatform::new());
        platform
            .upsert_pod(Pod::running("default", "web-1", "n1", &["app"]).with_labels(&[("app", "web")]))
            .await;
        let mut pending =
            Pod::running("default", "web-2", "n1", &["app"]).with_labels(&[("app", "web")]);
        pending.status.phase = PodPhase::Pending;
        platform.upsert_pod(pending).await;
        platform
            .upsert_pod(Pod::running("other", "web-3", "n1", &["app"]).with_labels(&[("app", "web")]))
            .await;

        let selector = selector_with(platform, Safeguards::default()).await;
        let selection = selector
            .get_matching_targets(&disruption(Level::Pod))
            .await
            .unwrap();

        assert_eq!(selection.population, 2);
        let names: Vec<_> = selection.candidates.iter().map(Target::name).collect();
        assert_eq!(names, vec!["web-1"]);
    }

    #[tokio::test]
    async fn test_empty_selector_is_a_user_error() {
        let platform = Arc::new(InMemoryPlatform::new());
        let selector = selector_with(platform, Safeguards::default()).await;
        let mut d = disruption(Level::Pod);
        d.spec.selector.clear();

        let err = selector.get_matching_targets(&d).await.unwrap_err();
        assert!(err.is_user_error());
    }

    #[tokio::test]
    async fn test_safeguards_exclude_controller_node() {
        let platform = Arc::new(InMemoryPlatform::new());
        platform.upsert_node(Node::ready("n1").with_labels(&[("app", "web")])).await;
        platform.upsert_node(Node::ready("n2").with_labels(&[("app", "web")])).await;
        let mut sick = Node::ready("n3").with_labels(&[("app", "web")]);
        sick.set_condition(NodeConditionType::Ready, ConditionStatus::False);
        platform.upsert_node(sick).await;

        let safeguards = Safeguards {
            enabled: true,
            controller_node_name: Some("n1".to_string()),
            controller_pod_name: None,
        };
        let selector = selector_with(platform, safeguards).await;
        let selection = selector
            .get_matching_targets(&disruption(Level::Node))
            .await
            .unwrap();

        assert_eq!(selection.population, 3);
        let names: Vec<_> = selection.candidates.iter().map(Target::name).collect();
        assert_eq!(names, vec!["n2"]);
    }

    #[tokio::test]
    async fn test_on_init_pods_are_held_in_init() {
        let platform = Arc::new(InMemoryPlatform::new());
        let mut held = Pod::running("default", "web-1", "n1", &["app"])
            .with_labels(&[("app", "web"), ("faultline.io/disrupt-on-init", "true")]);
        held.status.phase = PodPhase::Pending;
        held.status.init_container_statuses = vec![ContainerStatus::running(ON_INIT_CONTAINER)];
        platform.upsert_pod(held).await;
        platform
            .upsert_pod(
                Pod::running("default", "web-2", "n1", &["app"])
                    .with_labels(&[("app", "web"), ("faultline.io/disrupt-on-init", "true")]),
            )
            .await;

        let selector = selector_with(platform, Safeguards::default()).await;
        let mut d = disruption(Level::Pod);
        d.spec.on_init = true;
        let selection = selector.get_matching_targets(&d).await.unwrap();

        let names: Vec<_> = selection.candidates.iter().map(Target::name).collect();
        assert_eq!(names, vec!["web-1"]);
    }

    #[tokio::test]
    async fn test_target_health() {
        let platform = Arc::new(InMemoryPlatform::new());
        let mut done = Pod::running("default", "web-1", "n1", &["app"]);
        done.status.phase = PodPhase::Succeeded;
        platform.upsert_pod(done).await;

        let selector = selector_with(platform, Safeguards::default()).await;
        let d = disruption(Level::Pod);

        assert_eq!(
            selector.target_is_healthy("web-1", &d).await,
            Err(TargetHealthError::PodNotRunning)
        );
        let missing = selector.target_is_healthy("web-9", &d).await.unwrap_err();
        assert_eq!(missing, TargetHealthError::NotFound("web-9".to_string()));
        assert!(missing.is_unhealthy());
    }
}
