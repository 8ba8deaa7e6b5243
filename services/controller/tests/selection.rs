//! Target selection through full reconcile passes.

mod common;

use std::collections::BTreeSet;

use common::{cpu, disruption, Harness};
use faultline_reconcile::Count;
use rstest::rstest;

#[tokio::test]
async fn test_half_of_ten_pods_are_selected() {
    let h = Harness::new();
    h.add_pods(10).await;
    let key = h.apply(disruption("half", Count::Percentage(50), vec![cpu()])).await;

    h.reconcile(&key).await;

    let d = h.get(&key).await;
    assert_eq!(d.status.desired_targets_count, 5);
    assert_eq!(d.status.selected_targets_count, 5);
    assert_eq!(d.status.ignored_targets_count, 5);
    assert_eq!(d.status.target_injections.len(), 5);

    let agents = h.live_agents_of(&key).await;
    assert_eq!(agents.len(), 5);
    let agent_targets: BTreeSet<String> = agents
        .iter()
        .filter_map(|a| a.target().map(str::to_string))
        .collect();
    let registered: BTreeSet<String> = d.status.target_names().into_iter().collect();
    assert_eq!(agent_targets, registered);
}

#[tokio::test]
async fn test_second_pass_changes_nothing() {
    let h = Harness::new();
    h.add_pods(6).await;
    let key = h.apply(disruption("stable", Count::Fixed(3), vec![cpu()])).await;

    h.reconcile(&key).await;
    let first = h.targets(&key).await;
    let agents_before: Vec<String> = h
        .live_agents_of(&key)
        .await
        .iter()
        .map(|a| a.name().to_string())
        .collect();

    h.reconcile(&key).await;

    assert_eq!(h.targets(&key).await, first);
    let agents_after: Vec<String> = h
        .live_agents_of(&key)
        .await
        .iter()
        .map(|a| a.name().to_string())
        .collect();
    assert_eq!(agents_after, agents_before);
}

#[rstest]
#[case::fixed(Count::Fixed(3), 10, 3)]
#[case::fixed_above_population(Count::Fixed(20), 4, 4)]
#[case::percentage_rounds_up(Count::Percentage(33), 10, 4)]
#[case::everything(Count::Percentage(100), 7, 7)]
#[tokio::test]
async fn test_desired_count(#[case] count: Count, #[case] pods: usize, #[case] expected: u32) {
    let h = Harness::new();
    h.add_pods(pods).await;
    let key = h.apply(disruption("count", count, vec![cpu()])).await;

    h.reconcile(&key).await;

    let d = h.get(&key).await;
    assert_eq!(d.status.desired_targets_count, expected);
    assert_eq!(d.status.selected_targets_count, expected);
    assert_eq!(h.live_agents_of(&key).await.len(), expected as usize);
}

#[tokio::test]
async fn test_scale_down_keeps_a_subset() {
    let h = Harness::new();
    h.add_pods(6).await;
    let key = h.apply(disruption("shrink", Count::Fixed(4), vec![cpu()])).await;
    h.reconcile(&key).await;
    let before: BTreeSet<String> = h.targets(&key).await.into_iter().collect();

    h.edit(&key, |d| d.spec.count = Count::Fixed(2)).await;
    h.reconcile(&key).await;

    let after: BTreeSet<String> = h.targets(&key).await.into_iter().collect();
    assert_eq!(after.len(), 2);
    assert!(after.is_subset(&before));

    // agents of dropped targets are rolled back in the same pass
    let agent_targets: BTreeSet<String> = h
        .agents()
        .await
        .iter()
        .filter_map(|a| a.target().map(str::to_string))
        .collect();
    assert_eq!(agent_targets, after);
}

#[tokio::test]
async fn test_dead_target_is_replaced() {
    let h = Harness::new();
    h.add_pods(3).await;
    let key = h.apply(disruption("replace", Count::Fixed(2), vec![cpu()])).await;
    h.reconcile(&key).await;

    let chosen = h.targets(&key).await;
    let gone = chosen[0].clone();
    h.platform
        .remove_pod(&faultline_controller::model::ObjectKey::new(common::NAMESPACE, gone.as_str()))
        .await;

    h.reconcile(&key).await;

    let now = h.targets(&key).await;
    assert_eq!(now.len(), 2);
    assert!(!now.contains(&gone));
    assert!(now.contains(&chosen[1]));
}

#[tokio::test]
async fn test_static_targets_are_kept() {
    let h = Harness::new();
    h.add_pods(4).await;
    let mut d = disruption("static", Count::Fixed(2), vec![cpu()]);
    d.spec.static_targeting = true;
    let key = h.apply(d).await;
    h.reconcile(&key).await;
    let first = h.targets(&key).await;

    h.edit(&key, |d| d.spec.count = Count::Fixed(3)).await;
    h.reconcile(&key).await;

    assert_eq!(h.targets(&key).await, first);
    assert!(!h.caches.contains(&key).await);
}

#[tokio::test]
async fn test_dynamic_disruption_holds_a_watch() {
    let h = Harness::new();
    h.add_pods(2).await;
    let key = h.apply(disruption("dynamic", Count::Fixed(1), vec![cpu()])).await;

    h.reconcile(&key).await;
    assert!(h.caches.contains(&key).await);

    // scaling keeps the same watch
    h.edit(&key, |d| d.spec.count = Count::Fixed(2)).await;
    h.reconcile(&key).await;
    assert_eq!(h.caches.len().await, 1);
}

#[tokio::test]
async fn test_no_match_records_no_target() {
    let h = Harness::new();
    let key = h.apply(disruption("empty", Count::Fixed(1), vec![cpu()])).await;

    h.reconcile(&key).await;

    let d = h.get(&key).await;
    assert!(d.status.target_injections.is_empty());
    assert!(h.reasons(&d).await.contains(&"NoTarget".to_string()));
}
