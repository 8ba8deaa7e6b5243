//! Scoped watch of a dynamic disruption's candidate targets.
//!
//! A forwarder filters platform notifications down to the disruption's
//! scope and pushes them into a bounded queue. A single dispatcher drains
//! the queue: it records the change, lets the observer emit health
//! notifications, then asks for the disruption to be reconciled again.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::observer::TargetObserver;
use crate::metrics::Metrics;
use crate::model::{Disruption, LabelSelector, Level, ObjectKey, SelectorError, Target};
use crate::platform::{Platform, PlatformEvent};

/// Something that can schedule a disruption for reconciliation.
pub trait ReconcileTrigger: Send + Sync {
    fn trigger(&self, disruption: ObjectKey);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Updated,
    Removed,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Added => "add",
            ChangeKind::Updated => "update",
            ChangeKind::Removed => "delete",
        }
    }
}

/// An in-scope target change.
#[derive(Debug, Clone)]
pub struct TargetChange {
    pub kind: ChangeKind,
    pub old: Option<Target>,
    pub new: Option<Target>,
}

impl TargetChange {
    fn from_pair(old: Option<Target>, new: Option<Target>) -> Option<Self> {
        let kind = match (&old, &new) {
            (None, Some(_)) => ChangeKind::Added,
            (Some(_), Some(_)) => ChangeKind::Updated,
            (Some(_), None) => ChangeKind::Removed,
            (None, None) => return None,
        };
        Some(Self { kind, old, new })
    }
}

/// What a disruption's watch covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchScope {
    pub level: Level,

    /// Pod namespace; unset at node level.
    pub namespace: Option<String>,

    pub selector: LabelSelector,
}

impl WatchScope {
    pub fn for_disruption(disruption: &Disruption) -> Result<Self, SelectorError> {
        let level = disruption.spec.level;
        Ok(Self {
            level,
            namespace: (level == Level::Pod).then(|| disruption.namespace().to_string()),
            selector: disruption.label_selector()?,
        })
    }

    fn in_scope(&self, target: &Target) -> bool {
        let namespace_ok = match (&self.namespace, target) {
            (Some(ns), Target::Pod(p)) => &p.metadata.namespace == ns,
            _ => true,
        };
        namespace_ok && self.selector.matches(target.labels())
    }

    /// The change a notification represents, if it concerns this scope.
    ///
    /// A target moving out of the selector still counts, since the
    /// disruption has to drop it.
    pub fn classify(&self, event: &PlatformEvent) -> Option<TargetChange> {
        let (old, new) = match (self.level, event) {
            (Level::Pod, PlatformEvent::Pod { old, new }) => (
                old.as_deref().cloned().map(Target::Pod),
                new.as_deref().cloned().map(Target::Pod),
            ),
            (Level::Node, PlatformEvent::Node { old, new }) => (
                old.as_deref().cloned().map(Target::Node),
                new.as_deref().cloned().map(Target::Node),
            ),
            _ => return None,
        };

        let relevant = old.as_ref().is_some_and(|t| self.in_scope(t))
            || new.as_ref().is_some_and(|t| self.in_scope(t));
        if !relevant {
            return None;
        }
        TargetChange::from_pair(old, new)
    }
}

/// Watch task of one disruption.
pub struct DisruptionWatcher {
    platform: Arc<dyn Platform>,
    disruption: Disruption,
    scope: WatchScope,
    metrics: Metrics,
    trigger: Arc<dyn ReconcileTrigger>,
    queue_capacity: usize,
    observe: bool,
}

impl DisruptionWatcher {
    pub fn new(
        platform: Arc<dyn Platform>,
        disruption: Disruption,
        metrics: Metrics,
        trigger: Arc<dyn ReconcileTrigger>,
        queue_capacity: usize,
        observe: bool,
    ) -> Result<Self, SelectorError> {
        Ok(Self {
            scope: WatchScope::for_disruption(&disruption)?,
            platform,
            disruption,
            metrics,
            trigger,
            queue_capacity: queue_capacity.max(1),
            observe,
        })
    }

    /// Start watching until `cancelled` fires or `lifetime` elapses.
    ///
    /// The subscription is taken before returning, so no change made after
    /// this call is missed.
    pub fn spawn(self, cancelled: watch::Receiver<bool>, lifetime: Duration) -> JoinHandle<()> {
        let notifications = self.platform.subscribe();
        let (tx, rx) = mpsc::channel(self.queue_capacity);

        tokio::spawn(async move {
            let key = self.disruption.key();
            debug!(disruption = %key, scope = ?self.scope, "Watching targets");
            tokio::join!(
                self.forward(notifications, tx, cancelled, lifetime),
                self.dispatch(rx),
            );
            debug!(disruption = %key, "Target watch stopped");
        })
    }

    async fn forward(
        &self,
        mut notifications: broadcast::Receiver<PlatformEvent>,
        tx: mpsc::Sender<TargetChange>,
        mut cancelled: watch::Receiver<bool>,
        lifetime: Duration,
    ) {
        let key = self.disruption.key();
        let expiry = tokio::time::sleep(lifetime);
        tokio::pin!(expiry);

        loop {
            tokio::select! {
                received = notifications.recv() => match received {
                    Ok(event) => {
                        let Some(change) = self.scope.classify(&event) else {
                            continue;
                        };
                        if tx.send(change).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(disruption = %key, skipped, "Target watch lagged, forcing a reconcile");
                        self.trigger.trigger(key.clone());
                    }
                    Err(RecvError::Closed) => break,
                },
                changed = cancelled.changed() => {
                    if changed.is_err() || *cancelled.borrow() {
                        break;
                    }
                }
                _ = &mut expiry => {
                    info!(disruption = %key, "Target watch reached its lifetime");
                    break;
                }
            }
        }
    }

    async fn dispatch(&self, mut rx: mpsc::Receiver<TargetChange>) {
        let key = self.disruption.key();
        let observer = self
            .observe
            .then(|| TargetObserver::new(self.platform.clone(), self.disruption.clone()));

        while let Some(change) = rx.recv().await {
            self.metrics
                .selector_cache_triggered(self.disruption.name(), change.kind.as_str());

            if let (Some(observer), Some(old), Some(new)) = (&observer, &change.old, &change.new) {
                let sent = observer.observe(old, new).await;
                if !sent.is_empty() {
                    debug!(disruption = %key, notifications = sent.len(), "Sent target notifications");
                }
            }

            self.trigger.trigger(key.clone());
        }
    }
}
