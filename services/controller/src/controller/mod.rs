//! Controller runner: feeds the work queue and drives reconcile workers.

mod queue;

pub use queue::WorkQueue;

use std::sync::Arc;
use std::time::Duration;

use faultline_reconcile::JitteredRequeue;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::error::ControllerResult;
use crate::lifecycle::OrphanSweeper;
use crate::metrics::Metrics;
use crate::model::ObjectKey;
use crate::platform::{Platform, PlatformEvent};
use crate::reconciler::{Action, Reconcile};
use crate::watch::CacheContextRegistry;

/// Disruption a platform notification should wake up.
fn affected(event: &PlatformEvent) -> Option<ObjectKey> {
    match event {
        PlatformEvent::Disruption(key) => Some(key.clone()),
        PlatformEvent::Agent { owner, .. } => owner.clone(),
        // Target changes reach disruptions through their own watches.
        PlatformEvent::Pod { .. } | PlatformEvent::Node { .. } => None,
    }
}

pub struct Controller {
    platform: Arc<dyn Platform>,
    reconciler: Arc<dyn Reconcile>,
    queue: Arc<WorkQueue>,
    sweeper: Arc<OrphanSweeper>,
    caches: Arc<CacheContextRegistry>,
    metrics: Metrics,
    workers: usize,
    resync_interval: Duration,
    requeue: JitteredRequeue,
}

impl Controller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        platform: Arc<dyn Platform>,
        reconciler: Arc<dyn Reconcile>,
        queue: Arc<WorkQueue>,
        sweeper: Arc<OrphanSweeper>,
        caches: Arc<CacheContextRegistry>,
        metrics: Metrics,
        workers: usize,
        resync_interval: Duration,
        requeue: JitteredRequeue,
    ) -> Self {
        Self {
            platform,
            reconciler,
            queue,
            sweeper,
            caches,
            metrics,
            workers: workers.max(1),
            resync_interval,
            requeue,
        }
    }

    /// Run until `shutdown` flips to true.
    #[instrument(skip_all, fields(workers = self.workers))]
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("Starting controller");

        // Subscribe before the first listing so no change falls in between.
        let notifications = self.platform.subscribe();
        self.resync().await;

        let mut handles = Vec::with_capacity(self.workers + 3);
        for id in 0..self.workers {
            let controller = self.clone();
            handles.push(tokio::spawn(async move { controller.work(id).await }));
        }
        handles.push(tokio::spawn({
            let controller = self.clone();
            let shutdown = shutdown.clone();
            async move { controller.pump(notifications, shutdown).await }
        }));
        handles.push(tokio::spawn({
            let controller = self.clone();
            let shutdown = shutdown.clone();
            async move { controller.resync_loop(shutdown).await }
        }));
        handles.push(tokio::spawn({
            let sweeper = self.sweeper.clone();
            let shutdown = shutdown.clone();
            async move { sweeper.run(shutdown).await }
        }));

        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }

        info!("Controller shutting down");
        self.queue.shutdown();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Controller task panicked");
            }
        }
        self.caches.clear().await;
        info!("Controller stopped");
    }

    /// Queue every known disruption.
    async fn resync(&self) {
        match self.platform.list_disruptions().await {
            Ok(disruptions) => {
                debug!(count = disruptions.len(), "Resyncing disruptions");
                for disruption in disruptions {
                    self.queue.add(disruption.key());
                }
            }
            Err(e) => warn!(error = %e, "Failed to list disruptions for resync"),
        }
    }

    async fn resync_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.resync_interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let expired = self.caches.clear_expired().await;
                    if expired > 0 {
                        info!(expired, "Dropped expired cache contexts");
                        self.metrics.watchers(self.caches.len().await);
                    }
                    self.resync().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Turn platform notifications into queued keys.
    async fn pump(
        &self,
        mut notifications: tokio::sync::broadcast::Receiver<PlatformEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                received = notifications.recv() => match received {
                    Ok(event) => {
                        if let Some(key) = affected(&event) {
                            self.queue.add(key);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Missed platform notifications, resyncing");
                        self.resync().await;
                    }
                    Err(RecvError::Closed) => {
                        warn!("Platform notification stream closed");
                        break;
                    }
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn work(&self, id: usize) {
        debug!(worker = id, "Reconcile worker started");

        while let Some(key) = self.queue.next().await {
            let result = self.reconciler.reconcile(&key).await;
            let requeue_after = self.requeue_after(&key, result);

            self.queue.done(&key);
            if let Some(delay) = requeue_after {
                self.queue.add_after(key, delay);
            }
        }

        debug!(worker = id, "Reconcile worker stopped");
    }

    /// Delay before the next pass of `key`, if any.
    fn requeue_after(
        &self,
        key: &ObjectKey,
        result: ControllerResult<Action>,
    ) -> Option<Duration> {
        match result {
            Ok(action) => action.requeue_after,
            Err(e) if e.is_user_error() => {
                warn!(disruption = %key, error = %e, "Disruption needs fixing, not retrying");
                None
            }
            Err(e) if e.is_conflict() => {
                info!(disruption = %key, error = %e, "Disruption changed concurrently, retrying");
                Some(self.requeue.next_delay())
            }
            Err(e) => {
                error!(disruption = %key, error = %e, "Reconcile failed");
                Some(self.requeue.next_delay())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use faultline_reconcile::Count;
    use rstest::rstest;
    use tokio::time::Instant;

    use super::*;
    use crate::error::ControllerError;
    use crate::model::{Disruption, DisruptionSpec, SpecError};
    use crate::platform::{InMemoryPlatform, PlatformError};

    #[derive(Debug, Clone, Copy)]
    enum Outcome {
        Conflict,
        Failure,
        Invalid,
        Settled,
        Pending,
    }

    /// Answers every pass with the same outcome and records when it ran.
    struct Scripted {
        outcome: Outcome,
        passes: Mutex<Vec<Instant>>,
    }

    impl Scripted {
        fn new(outcome: Outcome) -> Arc<Self> {
            Arc::new(Self {
                outcome,
                passes: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Reconcile for Scripted {
        async fn reconcile(&self, key: &ObjectKey) -> ControllerResult<Action> {
            self.passes.lock().unwrap().push(Instant::now());
            match self.outcome {
                Outcome::Conflict => Err(PlatformError::Conflict {
                    kind: "disruption",
                    key: key.clone(),
                }
                .into()),
                Outcome::Failure => Err(ControllerError::Config("catalog unavailable".into())),
                Outcome::Invalid => Err(SpecError::NoFault.into()),
                Outcome::Settled => Ok(Action::await_change()),
                Outcome::Pending => Ok(Action::requeue(JitteredRequeue::default().next_delay())),
            }
        }
    }

    fn disruption_key() -> ObjectKey {
        ObjectKey::new("chaos", "latency")
    }

    /// Run a controller over one disruption for `window`, adding the key
    /// `nudges` times a second apart first. Returns the start instant.
    async fn drive(reconciler: Arc<Scripted>, nudges: usize, window: Duration) -> Instant {
        let platform = Arc::new(InMemoryPlatform::new());
        platform
            .apply_disruption(Disruption::new(
                "chaos",
                "latency",
                DisruptionSpec::new(&[("app", "web")], Count::Fixed(1), vec![]),
            ))
            .await;

        let hour = Duration::from_secs(3600);
        let queue = WorkQueue::new();
        let caches = Arc::new(CacheContextRegistry::new());
        let sweeper = Arc::new(OrphanSweeper::new(
            platform.clone(),
            caches.clone(),
            Metrics::noop(),
            hour,
        ));
        let controller = Arc::new(Controller::new(
            platform,
            reconciler,
            queue.clone(),
            sweeper,
            caches,
            Metrics::noop(),
            2,
            hour,
            JitteredRequeue::default(),
        ));

        let start = Instant::now();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(controller.run(shutdown_rx));

        for _ in 0..nudges {
            queue.add(disruption_key());
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        tokio::time::sleep(window).await;

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
        start
    }

    #[test]
    fn test_affected_keys() {
        let key = ObjectKey::new("default", "net");
        assert_eq!(
            affected(&PlatformEvent::Disruption(key.clone())),
            Some(key.clone())
        );
        assert_eq!(
            affected(&PlatformEvent::Agent {
                key: ObjectKey::new("faultline", "agent"),
                owner: Some(key.clone()),
            }),
            Some(key)
        );
        assert_eq!(affected(&PlatformEvent::Pod { old: None, new: None }), None);
    }

    #[rstest]
    #[case::conflict(Outcome::Conflict, true)]
    #[case::platform_failure(Outcome::Failure, true)]
    #[case::needs_requeue(Outcome::Pending, true)]
    #[case::invalid_disruption(Outcome::Invalid, false)]
    #[case::settled(Outcome::Settled, false)]
    #[tokio::test(start_paused = true)]
    async fn test_requeue_by_outcome(#[case] outcome: Outcome, #[case] requeued: bool) {
        let reconciler = Scripted::new(outcome);

        drive(reconciler.clone(), 0, Duration::from_secs(61)).await;

        let passes = reconciler.passes.lock().unwrap().len();
        if requeued {
            // the resync pass, then one every 15 to 20 seconds
            assert!((4..=5).contains(&passes), "{passes} passes");
        } else {
            assert_eq!(passes, 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pass_rate_stays_bounded_under_notifications() {
        let reconciler = Scripted::new(Outcome::Pending);

        let start = drive(reconciler.clone(), 5, Duration::from_secs(600)).await;

        let passes = reconciler.passes.lock().unwrap();
        let last_minute = passes
            .iter()
            .filter(|at| **at >= start + Duration::from_secs(546))
            .count();
        assert!(last_minute <= 4, "{last_minute} passes in the last minute");
        assert!(passes.len() <= 6 + 605 / 15 + 1, "{} passes", passes.len());
    }
}
