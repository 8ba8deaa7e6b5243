//! Safety nets evaluated before the first injection.

mod common;

use common::{cpu, disruption, test_config, Harness};
use faultline_controller::config::Config;
use faultline_controller::model::disruption::UnsafeMode;
use faultline_controller::model::fault::{Fault, NetworkFault};
use faultline_controller::model::workload::Pod;
use faultline_reconcile::Count;
use rstest::rstest;

fn safe_harness() -> Harness {
    Harness::with_config(Config {
        safemode: true,
        ..test_config()
    })
}

async fn add_foreign_pods(h: &Harness, count: usize) {
    for i in 0..count {
        h.platform
            .upsert_pod(Pod::running("other", &format!("api-{i}"), "node-b", &["api"]))
            .await;
    }
}

#[rstest]
#[case::most_of_the_namespace(10, 0, Count::Percentage(100), true)]
#[case::most_of_the_cluster(4, 0, Count::Fixed(3), true)]
#[case::small_share(4, 6, Count::Fixed(3), false)]
#[case::half(10, 0, Count::Percentage(50), false)]
#[tokio::test]
async fn test_count_too_large(
    #[case] pods: usize,
    #[case] foreign: usize,
    #[case] count: Count,
    #[case] trips: bool,
) {
    let h = safe_harness();
    h.add_pods(pods).await;
    add_foreign_pods(&h, foreign).await;
    let key = h.apply(disruption("wide", count, vec![cpu()])).await;

    h.reconcile(&key).await;

    let d = h.get(&key).await;
    let tripped = h.reasons(&d).await.contains(&"SafetyNetTriggered".to_string());
    assert_eq!(tripped, trips);
    assert_eq!(h.agents().await.is_empty(), trips);
}

#[tokio::test]
async fn test_tripped_net_waits_for_a_spec_change() {
    let h = safe_harness();
    h.add_pods(5).await;
    let key = h
        .apply(disruption("everything", Count::Percentage(100), vec![cpu()]))
        .await;

    let action = h.reconcile(&key).await;
    assert_eq!(action.requeue_after, None);
    assert!(h.get(&key).await.status.target_injections.is_empty());

    h.edit(&key, |d| {
        d.spec.unsafe_mode = Some(UnsafeMode {
            disable_count_too_large: true,
            ..Default::default()
        })
    })
    .await;
    h.reconcile(&key).await;

    assert_eq!(h.agents().await.len(), 5);
}

#[tokio::test]
async fn test_unscoped_network_fault_trips() {
    let h = safe_harness();
    h.add_pods(10).await;
    let everything = Fault::Network(NetworkFault {
        drop: 100,
        ..Default::default()
    });
    let key = h
        .apply(disruption("blackhole", Count::Fixed(1), vec![everything]))
        .await;

    h.reconcile(&key).await;

    let d = h.get(&key).await;
    assert_eq!(h.reasons(&d).await, vec!["SafetyNetTriggered".to_string()]);
    assert!(h.agents().await.is_empty());
}

#[tokio::test]
async fn test_nets_are_off_without_safemode() {
    let h = Harness::new();
    h.add_pods(3).await;
    let key = h
        .apply(disruption("unchecked", Count::Percentage(100), vec![cpu()]))
        .await;

    h.reconcile(&key).await;

    assert_eq!(h.agents().await.len(), 3);
}
