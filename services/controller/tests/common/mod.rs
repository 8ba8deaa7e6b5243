//! Shared harness: a reconciler wired to the in-memory platform.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use faultline_controller::config::Config;
use faultline_controller::controller::WorkQueue;
use faultline_controller::ipranges::IpRangeCatalog;
use faultline_controller::metrics::{MemorySink, Metrics};
use faultline_controller::model::fault::{CpuPressureFault, Fault, HostSpec, NetworkFault};
use faultline_controller::model::workload::Pod;
use faultline_controller::model::{Agent, Disruption, DisruptionSpec, ObjectKey};
use faultline_controller::platform::{InMemoryPlatform, Platform};
use faultline_controller::reconciler::{Action, DisruptionReconciler};
use faultline_controller::watch::CacheContextRegistry;
use faultline_reconcile::Count;

pub const NAMESPACE: &str = "shop";

pub fn test_config() -> Config {
    Config {
        selection_seed: Some(7),
        requeue_min: Duration::from_secs(15),
        requeue_max: Duration::from_secs(20),
        ..Config::default()
    }
}

pub fn network() -> Fault {
    Fault::Network(NetworkFault {
        hosts: vec![HostSpec::new("10.1.0.0/16", Some(443))],
        drop: 30,
        ..Default::default()
    })
}

pub fn cpu() -> Fault {
    Fault::CpuPressure(CpuPressureFault::default())
}

/// A pod-level disruption on `app=web` pods.
pub fn disruption(name: &str, count: Count, faults: Vec<Fault>) -> Disruption {
    Disruption::new(
        NAMESPACE,
        name,
        DisruptionSpec::new(&[("app", "web")], count, faults),
    )
}

pub struct Harness {
    pub platform: Arc<InMemoryPlatform>,
    pub reconciler: DisruptionReconciler,
    pub queue: Arc<WorkQueue>,
    pub caches: Arc<CacheContextRegistry>,
    pub metrics: Arc<MemorySink>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: Config) -> Self {
        let platform = Arc::new(InMemoryPlatform::new());
        let queue = WorkQueue::new();
        let caches = Arc::new(CacheContextRegistry::new());
        let metrics = Arc::new(MemorySink::default());

        let reconciler = DisruptionReconciler::new(
            &config,
            platform.clone(),
            Arc::new(IpRangeCatalog::default()),
            caches.clone(),
            queue.clone(),
            Metrics::new(metrics.clone()),
        );

        Self {
            platform,
            reconciler,
            queue,
            caches,
            metrics,
        }
    }

    /// Running `app=web` pods named `web-0`, `web-1`, ...
    pub async fn add_pods(&self, count: usize) {
        for i in 0..count {
            self.add_pod(&format!("web-{i}"), &[]).await;
        }
    }

    pub async fn add_pod(&self, name: &str, extra_labels: &[(&str, &str)]) {
        let pod = Pod::running(NAMESPACE, name, "node-a", &["app"])
            .with_labels(&[("app", "web")])
            .with_labels(extra_labels);
        self.platform.upsert_pod(pod).await;
    }

    pub async fn apply(&self, disruption: Disruption) -> ObjectKey {
        self.platform.apply_disruption(disruption).await.key()
    }

    /// Change the spec of a stored disruption, keeping its status.
    pub async fn edit(&self, key: &ObjectKey, change: impl FnOnce(&mut Disruption)) {
        let mut disruption = self.get(key).await;
        change(&mut disruption);
        self.platform.apply_disruption(disruption).await;
    }

    pub async fn reconcile(&self, key: &ObjectKey) -> Action {
        self.reconciler.reconcile(key).await.expect("reconcile failed")
    }

    pub async fn get(&self, key: &ObjectKey) -> Disruption {
        self.platform.disruption(key).await.expect("disruption missing")
    }

    pub async fn agents(&self) -> Vec<Agent> {
        self.platform.agents().await
    }

    /// Agents of a disruption not pending deletion.
    pub async fn live_agents_of(&self, key: &ObjectKey) -> Vec<Agent> {
        self.agents()
            .await
            .into_iter()
            .filter(|a| a.owner().as_ref() == Some(key) && !a.metadata.is_being_deleted())
            .collect()
    }

    /// Reasons of the events recorded on a disruption, oldest first.
    pub async fn reasons(&self, disruption: &Disruption) -> Vec<String> {
        self.platform
            .list_events(&disruption.object_ref())
            .await
            .expect("list events")
            .into_iter()
            .map(|e| e.reason)
            .collect()
    }

    /// Registered target names.
    pub async fn targets(&self, key: &ObjectKey) -> Vec<String> {
        self.get(key).await.status.target_names()
    }
}
