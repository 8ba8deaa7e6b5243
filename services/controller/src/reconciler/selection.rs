//! Target registry convergence.
//!
//! The registry is the set of chosen targets persisted in the disruption's
//! status. Each pass drops dead targets, then grows or shrinks the set
//! toward the desired count. Growth picks from eligible candidates at
//! random; once chosen, a target stays until it dies or the disruption
//! scales down.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use faultline_reconcile::pick_random;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::error::ControllerResult;
use crate::model::{Disruption, TargetInjection};
use crate::platform::Platform;
use crate::targeting::{filter_eligible, TargetSelector};

/// Registry changes for one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionPlan {
    /// Registered targets no longer among the candidates.
    pub dead: Vec<String>,

    /// Eligible candidates to register.
    pub added: Vec<String>,

    /// Live targets to drop when scaling down.
    pub removed: Vec<String>,
}

impl SelectionPlan {
    pub fn is_noop(&self) -> bool {
        self.dead.is_empty() && self.added.is_empty() && self.removed.is_empty()
    }

    /// Every target leaving the registry.
    pub fn dropped(&self) -> impl Iterator<Item = &String> {
        self.dead.iter().chain(self.removed.iter())
    }
}

/// Plan the registry changes toward `desired` targets.
///
/// `alive` holds the names of every healthy candidate; `eligible` those a
/// new target may be picked from.
pub fn plan_selection<R: Rng + ?Sized>(
    current: &BTreeSet<String>,
    alive: &BTreeSet<String>,
    eligible: &BTreeSet<String>,
    desired: usize,
    rng: &mut R,
) -> SelectionPlan {
    let (kept, dead): (BTreeSet<String>, BTreeSet<String>) =
        current.iter().cloned().partition(|t| alive.contains(t));

    let mut plan = SelectionPlan {
        dead: dead.into_iter().collect(),
        ..Default::default()
    };

    if kept.len() < desired {
        let pool: Vec<String> = eligible.difference(&kept).cloned().collect();
        plan.added = pick_random(pool, desired - kept.len(), rng);
        plan.added.sort();
    } else if kept.len() > desired {
        let excess = kept.len() - desired;
        plan.removed = pick_random(kept.into_iter().collect(), excess, rng);
        plan.removed.sort();
    }

    plan
}

/// Converges a disruption's registry against the platform.
pub struct TargetRegistry {
    platform: Arc<dyn Platform>,
    selector: Arc<dyn TargetSelector>,
    rng: Mutex<StdRng>,
}

impl TargetRegistry {
    /// Random picks are reproducible when `seed` is set.
    pub fn new(
        platform: Arc<dyn Platform>,
        selector: Arc<dyn TargetSelector>,
        seed: Option<u64>,
    ) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            platform,
            selector,
            rng: Mutex::new(rng),
        }
    }

    /// Update the registry and target counts in `disruption.status`.
    ///
    /// Static disruptions keep their registry once it is filled.
    pub async fn converge(
        &self,
        disruption: &mut Disruption,
        now: DateTime<Utc>,
    ) -> ControllerResult<SelectionPlan> {
        if !disruption.is_dynamic() && !disruption.status.target_injections.is_empty() {
            debug!(disruption = %disruption.key(), "Static targets already chosen");
            return Ok(SelectionPlan::default());
        }

        let selection = self.selector.get_matching_targets(disruption).await?;
        let desired = disruption.spec.count.scale(selection.population, true);
        let alive: BTreeSet<String> = selection
            .candidates
            .iter()
            .map(|t| t.name().to_string())
            .collect();
        let eligible: BTreeSet<String> =
            filter_eligible(self.platform.as_ref(), disruption, selection.candidates)
                .await?
                .iter()
                .map(|t| t.name().to_string())
                .collect();

        let current: BTreeSet<String> = disruption.status.target_injections.keys().cloned().collect();
        let plan = {
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            plan_selection(&current, &alive, &eligible, desired, &mut *rng)
        };

        let status = &mut disruption.status;
        for target in plan.dropped() {
            status.target_injections.remove(target);
        }
        for target in &plan.added {
            status
                .target_injections
                .insert(target.clone(), TargetInjection::new(now));
        }
        status.desired_targets_count = desired as u32;
        status.selected_targets_count = status.target_injections.len() as u32;
        status.ignored_targets_count = selection.population.saturating_sub(desired) as u32;

        if !plan.is_noop() {
            info!(
                disruption = %disruption.key(),
                desired,
                population = selection.population,
                added = plan.added.len(),
                dead = plan.dead.len(),
                removed = plan.removed.len(),
                "Converged target registry"
            );
        }
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn names(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_dead_targets_are_replaced() {
        let mut rng = StdRng::seed_from_u64(1);
        let plan = plan_selection(
            &names(&["a", "b"]),
            &names(&["b", "c"]),
            &names(&["b", "c"]),
            2,
            &mut rng,
        );
        assert_eq!(plan.dead, vec!["a"]);
        assert_eq!(plan.added, vec!["c"]);
        assert!(plan.removed.is_empty());
    }

    #[test]
    fn test_scale_down_keeps_a_subset() {
        let mut rng = StdRng::seed_from_u64(1);
        let current = names(&["a", "b", "c", "d"]);
        let plan = plan_selection(&current, &current, &current, 1, &mut rng);
        assert_eq!(plan.removed.len(), 3);
        assert!(plan.added.is_empty());
    }

    #[test]
    fn test_seeded_picks_are_reproducible() {
        let pool = names(&["a", "b", "c", "d", "e", "f"]);
        let first = plan_selection(&BTreeSet::new(), &pool, &pool, 3, &mut StdRng::seed_from_u64(9));
        let second = plan_selection(&BTreeSet::new(), &pool, &pool, 3, &mut StdRng::seed_from_u64(9));
        assert_eq!(first, second);
    }

    proptest! {
        #[test]
        fn prop_registry_stays_within_desired(
            population in 0usize..30,
            current_mask in proptest::collection::vec(any::<bool>(), 30),
            eligible_mask in proptest::collection::vec(any::<bool>(), 30),
            desired in 0usize..30,
            seed in any::<u64>(),
        ) {
            let all: Vec<String> = (0..population).map(|i| format!("t{i:02}")).collect();
            let alive: BTreeSet<String> = all.iter().cloned().collect();
            let current: BTreeSet<String> = all
                .iter()
                .zip(&current_mask)
                .filter(|(_, keep)| **keep)
                .map(|(t, _)| t.clone())
                .collect();
            let eligible: BTreeSet<String> = all
                .iter()
                .zip(&eligible_mask)
                .filter(|(_, keep)| **keep)
                .map(|(t, _)| t.clone())
                .collect();

            let plan = plan_selection(&current, &alive, &eligible, desired, &mut StdRng::seed_from_u64(seed));

            let mut next = current.clone();
            for t in plan.dropped() {
                next.remove(t);
            }
            next.extend(plan.added.iter().cloned());

            prop_assert!(next.len() <= desired);
            prop_assert!(plan.added.iter().all(|t| eligible.contains(t) && !current.contains(t)));

            // a second pass over the outcome changes nothing
            let again = plan_selection(&next, &alive, &eligible, desired, &mut StdRng::seed_from_u64(seed));
            prop_assert!(again.is_noop());
        }
    }
}
