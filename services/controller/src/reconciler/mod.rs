//! Disruption reconciliation.
//!
//! One pass moves a disruption one step closer to its declared state:
//! - a missing disruption has its leftover agents swept
//! - a deleted disruption has its agents rolled back, then its finalizer
//!   removed
//! - an expired disruption is marked terminated and later deleted
//! - a live disruption has its targets chosen and agents created, and its
//!   status folded from agent health
//!
//! Passes for the same disruption never run concurrently; the work queue
//! guarantees it.

mod injection;
mod selection;
mod status;

pub use selection::{plan_selection, SelectionPlan, TargetRegistry};
pub use status::{classify_termination, fold_status, fully_ready_targets, refresh_targets, Folded};

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use faultline_events::EventReason;
use faultline_reconcile::JitteredRequeue;
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::error::ControllerResult;
use crate::ipranges::IpRangeCatalog;
use crate::lifecycle::{AgentBuilder, AgentManager, OrphanSweeper};
use crate::metrics::Metrics;
use crate::model::disruption::DISRUPTION_FINALIZER;
use crate::model::{Disruption, InjectionStatus, ObjectKey, SpecError, TerminationStatus};
use crate::platform::Platform;
use crate::recorder::Recorder;
use crate::safety::SafetyNets;
use crate::targeting::{RunningTargetSelector, TargetSelector};
use crate::watch::{CacheContextRegistry, DisruptionWatcher, ReconcileTrigger};

/// What to do with a disruption after a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Action {
    /// Run again after this delay; `None` waits for a change notification.
    pub requeue_after: Option<Duration>,
}

impl Action {
    pub fn requeue(after: Duration) -> Self {
        Self {
            requeue_after: Some(after),
        }
    }

    pub fn await_change() -> Self {
        Self {
            requeue_after: None,
        }
    }
}

/// One reconcile pass per key, as driven by the controller's workers.
#[async_trait]
pub trait Reconcile: Send + Sync {
    async fn reconcile(&self, key: &ObjectKey) -> ControllerResult<Action>;
}

/// Durations and toggles the reconciler reads from configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub default_duration: Duration,
    pub expired_gc_delay: Duration,
    pub requeue: JitteredRequeue,
    pub safemode: bool,
    pub observer_enabled: bool,
    pub watcher_queue_capacity: usize,
    pub agent_creation_timeout: Duration,
    pub selection_seed: Option<u64>,
}

impl ReconcilerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            default_duration: config.default_duration,
            expired_gc_delay: config.expired_gc_delay,
            requeue: JitteredRequeue::new(config.requeue_min, config.requeue_max),
            safemode: config.safemode,
            observer_enabled: config.observer_enabled,
            watcher_queue_capacity: config.watcher_queue_capacity,
            agent_creation_timeout: config.agent_creation_timeout,
            selection_seed: config.selection_seed,
        }
    }

    fn watch_lifetime(&self, disruption_duration: Duration) -> Duration {
        disruption_duration + self.expired_gc_delay * 2
    }
}

/// Convert the gap between two instants into a requeue delay.
fn until(at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (at - now).to_std().unwrap_or(Duration::ZERO)
}

pub struct DisruptionReconciler {
    platform: Arc<dyn Platform>,
    settings: ReconcilerSettings,
    registry: TargetRegistry,
    agents: AgentManager,
    caches: Arc<CacheContextRegistry>,
    sweeper: OrphanSweeper,
    safety: SafetyNets,
    recorder: Recorder,
    metrics: Metrics,
    trigger: Arc<dyn ReconcileTrigger>,
}

impl DisruptionReconciler {
    pub fn new(
        config: &Config,
        platform: Arc<dyn Platform>,
        catalog: Arc<IpRangeCatalog>,
        caches: Arc<CacheContextRegistry>,
        trigger: Arc<dyn ReconcileTrigger>,
        metrics: Metrics,
    ) -> Self {
        let settings = ReconcilerSettings::from_config(config);
        let selector: Arc<dyn TargetSelector> = Arc::new(RunningTargetSelector::new(
            platform.clone(),
            config.safeguards.clone(),
        ));

        Self {
            registry: TargetRegistry::new(
                platform.clone(),
                selector.clone(),
                settings.selection_seed,
            ),
            agents: AgentManager::new(
                platform.clone(),
                AgentBuilder::new(config.injector.clone(), catalog),
                selector,
                metrics.clone(),
                settings.agent_creation_timeout,
            ),
            sweeper: OrphanSweeper::new(
                platform.clone(),
                caches.clone(),
                metrics.clone(),
                config.orphan_sweep_interval,
            ),
            safety: SafetyNets::builtin(),
            recorder: Recorder::new(platform.clone()),
            platform,
            settings,
            caches,
            metrics,
            trigger,
        }
    }

    /// Run one pass for a disruption.
    #[instrument(skip(self), fields(disruption = %key))]
    pub async fn reconcile(&self, key: &ObjectKey) -> ControllerResult<Action> {
        let started = Instant::now();
        self.metrics.reconcile(&key.name);

        let result = self.reconcile_inner(key).await;

        self.metrics.reconcile_duration(&key.name, started.elapsed());
        result
    }

    async fn reconcile_inner(&self, key: &ObjectKey) -> ControllerResult<Action> {
        let disruption = match self.platform.get_disruption(key).await {
            Ok(disruption) => disruption,
            Err(e) if e.is_not_found() => return self.handle_missing(key).await,
            Err(e) => return Err(e.into()),
        };
        let now = Utc::now();

        if disruption.metadata.is_being_deleted() {
            return self.handle_deletion(disruption, now).await;
        }
        if disruption.is_expired(now, self.settings.default_duration) {
            return self.handle_expiry(disruption, now).await;
        }

        let disruption = self.ensure_finalizer(disruption).await?;

        if let Err(e) = disruption.validate() {
            self.reject(&disruption, &e).await;
            return Ok(Action::await_change());
        }
        if let Err(e) = disruption.label_selector() {
            let error = e.to_string();
            warn!(error = %error, "Invalid target selector");
            self.recorder
                .disruption(&disruption, EventReason::InvalidLabelSelector, &[("error", error.as_str())])
                .await;
            return Ok(Action::await_change());
        }

        if self.settings.safemode && !self.has_injected(&disruption) {
            let hash = disruption.spec_hash()?;
            if let Some(tripped) = self
                .safety
                .check(&disruption, &hash, self.platform.as_ref())
                .await?
            {
                self.recorder
                    .disruption(
                        &disruption,
                        EventReason::SafetyNetTriggered,
                        &[("net", tripped.net), ("error", tripped.reason.as_str())],
                    )
                    .await;
                return Ok(Action::await_change());
            }
        }

        let create_at = disruption.time_to_create_agents();
        if now < create_at {
            debug!(create_at = %create_at, "Waiting for the agent creation trigger");
            return Ok(Action::requeue(until(create_at, now)));
        }

        if disruption.is_dynamic() {
            self.ensure_cache_context(&disruption).await?;
        }

        self.inject(disruption, now).await
    }

    fn has_injected(&self, disruption: &Disruption) -> bool {
        !disruption.status.target_injections.is_empty()
            || disruption.status.injection_status != InjectionStatus::NotInjected
    }

    async fn reject(&self, disruption: &Disruption, error: &SpecError) {
        warn!(error = %error, "Invalid disruption");
        let reason = match error {
            SpecError::NoFault => EventReason::EmptyDisruption,
            _ => EventReason::InvalidSpec,
        };
        let error = error.to_string();
        self.recorder
            .disruption(disruption, reason, &[("error", error.as_str())])
            .await;
    }

    // =========================================================================
    // Lifecycle edges
    // =========================================================================

    async fn handle_missing(&self, key: &ObjectKey) -> ControllerResult<Action> {
        let stats = self.sweeper.sweep(key).await?;
        let dropped = self.caches.remove(key).await;
        self.safety.forget(key).await;
        if stats.orphans > 0 || dropped > 0 {
            info!(
                orphans = stats.orphans,
                removed = stats.removed,
                cache_contexts = dropped,
                "Cleaned up after a missing disruption"
            );
            self.metrics.watchers(self.caches.len().await);
        }
        Ok(Action::await_change())
    }

    async fn ensure_finalizer(&self, mut disruption: Disruption) -> ControllerResult<Disruption> {
        if !disruption.metadata.add_finalizer(DISRUPTION_FINALIZER) {
            return Ok(disruption);
        }
        let updated = self.platform.update_disruption(&disruption).await?;
        debug!("Added disruption finalizer");
        Ok(updated)
    }

    #[instrument(skip_all)]
    async fn handle_deletion(
        &self,
        mut disruption: Disruption,
        now: DateTime<Utc>,
    ) -> ControllerResult<Action> {
        let key = disruption.key();
        let original = disruption.status.clone();
        if self.caches.remove(&key).await > 0 {
            self.metrics.watchers(self.caches.len().await);
        }

        let agents = self.agents.agents_of(&key).await?;
        self.agents.delete(&agents).await?;

        // Deletion only marks agents carrying a finalizer.
        let agents = self.agents.agents_of(&key).await?;
        let outcome = self.agents.finalize_terminating(&disruption, &agents).await?;
        let remaining = self.agents.agents_of(&key).await?;

        let newly_stuck = outcome.is_stuck() && !disruption.status.is_stuck_on_removal;
        if outcome.is_stuck() {
            disruption.status.is_stuck_on_removal = true;
        }
        let disruption = self
            .persist_status(
                disruption,
                &original,
                &remaining,
                TerminationStatus::DefinitivelyTerminated,
                now,
            )
            .await?;

        if outcome.is_stuck() {
            if newly_stuck {
                self.report_stuck(&disruption, &outcome.stuck).await;
            }
            return Ok(Action::await_change());
        }
        if !remaining.is_empty() {
            debug!(agents = remaining.len(), "Waiting for agents to roll back");
            return Ok(Action::requeue(self.settings.requeue.next_delay()));
        }

        self.recorder
            .disruption(&disruption, EventReason::Finished, &[])
            .await;
        let lifetime = (now - disruption.metadata.creation_timestamp)
            .to_std()
            .unwrap_or(Duration::ZERO);
        self.metrics.cleaned_up(disruption.name(), lifetime);

        let mut released = disruption;
        if released.metadata.remove_finalizer(DISRUPTION_FINALIZER) {
            match self.platform.update_disruption(&released).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.safety.forget(&key).await;
        info!(lifetime_secs = lifetime.as_secs(), "Disruption cleaned up");
        Ok(Action::await_change())
    }

    #[instrument(skip_all)]
    async fn handle_expiry(
        &self,
        disruption: Disruption,
        now: DateTime<Utc>,
    ) -> ControllerResult<Action> {
        let key = disruption.key();
        if self.caches.remove(&key).await > 0 {
            self.metrics.watchers(self.caches.len().await);
        }

        let original = disruption.status.clone();
        let agents = self.agents.agents_of(&key).await?;
        let disruption = self
            .persist_status(
                disruption,
                &original,
                &agents,
                TerminationStatus::DefinitivelyTerminated,
                now,
            )
            .await?;

        let gc_at = disruption.deadline(self.settings.default_duration)
            + chrono::Duration::from_std(self.settings.expired_gc_delay)
                .unwrap_or(chrono::Duration::zero());
        if now < gc_at {
            return Ok(Action::requeue(until(gc_at, now)));
        }

        info!("Disruption expired past its grace delay, deleting it");
        self.recorder
            .disruption(&disruption, EventReason::DurationOver, &[])
            .await;
        match self.platform.delete_disruption(&key).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        Ok(Action::await_change())
    }

    async fn report_stuck(&self, disruption: &Disruption, stuck: &[String]) {
        self.metrics.stuck_on_removal(disruption.name());
        for agent in stuck {
            warn!(agent = %agent, "Disruption stuck on removal");
            self.recorder
                .disruption(disruption, EventReason::StuckOnRemoval, &[("agent", agent.as_str())])
                .await;
        }
    }

    // =========================================================================
    // Dynamic targeting
    // =========================================================================

    async fn ensure_cache_context(&self, disruption: &Disruption) -> ControllerResult<()> {
        let hash = disruption.spec_hash_without_count()?;
        let lifetime = self
            .settings
            .watch_lifetime(disruption.duration_or(self.settings.default_duration));
        let watcher = DisruptionWatcher::new(
            self.platform.clone(),
            disruption.clone(),
            self.metrics.clone(),
            self.trigger.clone(),
            self.settings.watcher_queue_capacity,
            self.settings.observer_enabled,
        )?;

        let created = self
            .caches
            .ensure(&disruption.key(), &hash, lifetime, |cancelled| {
                watcher.spawn(cancelled, lifetime)
            })
            .await;
        if created {
            self.metrics.watchers(self.caches.len().await);
        }
        Ok(())
    }
}

#[async_trait]
impl Reconcile for DisruptionReconciler {
    async fn reconcile(&self, key: &ObjectKey) -> ControllerResult<Action> {
        DisruptionReconciler::reconcile(self, key).await
    }
}
