//! Expiry, deletion and cleanup of disruptions and their agents.

mod common;

use std::time::Duration;

use common::{cpu, disruption, network, test_config, Harness, NAMESPACE};
use faultline_controller::config::Config;
use faultline_controller::lifecycle::OrphanSweeper;
use faultline_controller::metrics::Metrics;
use faultline_controller::model::disruption::{AGENT_FINALIZER, DISRUPTION_FINALIZER};
use faultline_controller::model::{AgentPhase, AgentStatus, InjectionStatus, ObjectKey};
use faultline_controller::platform::Platform;
use faultline_reconcile::Count;

fn gc_config() -> Config {
    Config {
        expired_gc_delay: Duration::from_secs(300),
        ..test_config()
    }
}

#[tokio::test]
async fn test_expired_disruption_is_deleted_after_its_agents() {
    let h = Harness::with_config(gc_config());
    h.add_pods(2).await;

    // created half an hour ago, one hour to run
    let mut d = disruption("expiring", Count::Fixed(2), vec![cpu()]);
    d.metadata.creation_timestamp = chrono::Utc::now() - chrono::Duration::minutes(30);
    d.spec.duration = Some(Duration::from_secs(3600));
    let key = h.apply(d).await;

    h.reconcile(&key).await;
    for target in ["web-0", "web-1"] {
        h.platform.mark_target_agents_ready(target).await;
    }
    h.reconcile(&key).await;
    assert_eq!(h.get(&key).await.status.injection_status, InjectionStatus::Injected);

    // shorten it so it ended 20 minutes ago, past the 5 minute grace delay
    h.edit(&key, |d| d.spec.duration = Some(Duration::from_secs(600))).await;
    h.reconcile(&key).await;

    let d = h.get(&key).await;
    assert_eq!(d.status.injection_status, InjectionStatus::PreviouslyInjected);
    assert!(d.metadata.is_being_deleted());
    assert!(h.reasons(&d).await.contains(&"DurationOver".to_string()));
    assert!(!h.caches.contains(&key).await);

    // agents still run; the disruption waits for their rollback
    let action = h.reconcile(&key).await;
    assert!(action.requeue_after.is_some());
    assert!(h.platform.disruption(&key).await.is_some());
    assert!(h.agents().await.iter().all(|a| a.metadata.is_being_deleted()));

    for agent in h.agents().await {
        h.platform.mark_agent_exited(&agent.key(), 0).await;
    }
    h.reconcile(&key).await;

    assert!(h.agents().await.is_empty());
    assert!(h.platform.disruption(&key).await.is_none());
    assert_eq!(h.metrics.count("cleaned_up"), 1);
}

#[tokio::test]
async fn test_expired_disruption_lingers_during_grace_delay() {
    let h = Harness::with_config(gc_config());
    h.add_pods(1).await;

    // ended a minute ago
    let mut d = disruption("grace", Count::Fixed(1), vec![cpu()]);
    d.metadata.creation_timestamp = chrono::Utc::now() - chrono::Duration::minutes(11);
    d.spec.duration = Some(Duration::from_secs(600));
    let key = h.apply(d).await;

    let action = h.reconcile(&key).await;

    let d = h.get(&key).await;
    assert!(!d.metadata.is_being_deleted());
    assert_eq!(d.status.injection_status, InjectionStatus::PreviouslyNotInjected);
    assert!(h.agents().await.is_empty());
    let delay = action.requeue_after.unwrap();
    assert!(delay > Duration::from_secs(230) && delay <= Duration::from_secs(240));
}

#[tokio::test]
async fn test_agent_that_never_started_is_released() {
    let h = Harness::new();
    h.add_pods(1).await;
    let key = h.apply(disruption("unstarted", Count::Fixed(1), vec![network()])).await;
    h.reconcile(&key).await;
    assert!(h.get(&key).await.metadata.has_finalizer(DISRUPTION_FINALIZER));

    let agent = h.live_agents_of(&key).await.remove(0);
    assert!(agent.metadata.has_finalizer(AGENT_FINALIZER));
    h.platform
        .set_agent_status(
            &agent.key(),
            AgentStatus {
                phase: AgentPhase::Failed,
                reason: None,
                container_statuses: vec![],
            },
        )
        .await;

    let d = h.get(&key).await;
    h.platform.delete_disruption(&key).await.unwrap();
    h.reconcile(&key).await;

    assert!(h.agents().await.is_empty());
    assert!(h.platform.disruption(&key).await.is_none());
    assert!(h.reasons(&d).await.contains(&"Finished".to_string()));
}

#[tokio::test]
async fn test_failed_rollback_flags_stuck_on_removal() {
    let h = Harness::new();
    h.add_pods(1).await;
    let key = h.apply(disruption("stuck", Count::Fixed(1), vec![network()])).await;
    h.reconcile(&key).await;

    let agent = h.live_agents_of(&key).await.remove(0);
    h.platform.mark_agent_exited(&agent.key(), 1).await;
    h.platform.delete_disruption(&key).await.unwrap();

    let action = h.reconcile(&key).await;

    assert_eq!(action.requeue_after, None);
    let d = h.get(&key).await;
    assert!(d.status.is_stuck_on_removal);
    assert_eq!(d.status.injection_status, InjectionStatus::PreviouslyPartiallyInjected);
    let stuck_agent = h.platform.get_agent(&agent.key()).await.unwrap();
    assert!(stuck_agent.metadata.is_being_deleted());
    assert!(stuck_agent.metadata.has_finalizer(AGENT_FINALIZER));

    // reported once
    h.reconcile(&key).await;
    let stuck_events = h
        .reasons(&d)
        .await
        .into_iter()
        .filter(|r| r == "StuckOnRemoval")
        .count();
    assert_eq!(stuck_events, 1);
    assert_eq!(h.metrics.count("stuck_on_removal"), 1);
}

#[tokio::test]
async fn test_missing_disruption_has_its_agents_swept() {
    let h = Harness::new();
    h.add_pods(1).await;
    let key = h.apply(disruption("vanished", Count::Fixed(1), vec![cpu()])).await;
    h.reconcile(&key).await;
    assert_eq!(h.agents().await.len(), 1);
    assert!(h.caches.contains(&key).await);

    // the disruption disappears without its finalizer running
    let mut d = h.get(&key).await;
    d.metadata.finalizers.clear();
    h.platform.update_disruption(&d).await.unwrap();
    h.platform.delete_disruption(&key).await.unwrap();
    h.platform.remove_pod(&ObjectKey::new(NAMESPACE, "web-0")).await;

    h.reconcile(&key).await;

    assert!(h.agents().await.is_empty());
    assert!(!h.caches.contains(&key).await);
    assert_eq!(h.metrics.count("orphan.found"), 1);
}

#[tokio::test]
async fn test_sweep_leaves_orphans_with_live_targets() {
    let h = Harness::new();
    h.add_pods(1).await;
    let key = h.apply(disruption("kept", Count::Fixed(1), vec![cpu()])).await;
    h.reconcile(&key).await;

    let mut d = h.get(&key).await;
    d.metadata.finalizers.clear();
    h.platform.update_disruption(&d).await.unwrap();
    h.platform.delete_disruption(&key).await.unwrap();

    let sweeper = OrphanSweeper::new(
        h.platform.clone(),
        h.caches.clone(),
        Metrics::noop(),
        Duration::from_secs(60),
    );
    let stats = sweeper.sweep_all().await.unwrap();

    assert_eq!(stats.orphans, 1);
    assert_eq!(stats.removed, 0);
    assert_eq!(stats.cache_contexts_dropped, 1);
    assert_eq!(h.agents().await.len(), 1);

    h.platform.remove_pod(&ObjectKey::new(NAMESPACE, "web-0")).await;
    let stats = sweeper.sweep_all().await.unwrap();
    assert_eq!(stats.removed, 1);
    assert!(h.agents().await.is_empty());
}
