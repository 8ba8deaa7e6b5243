//! Owned registry of dynamic-target watches.
//!
//! One cache context per (disruption, spec hash). A context owns a running
//! watch task and a cancel handle; dropping the context from the registry
//! cancels the task. Contexts are force-expired after their lifetime
//! whatever the activity.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use faultline_reconcile::SpecHash;
use serde::Serialize;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::model::ObjectKey;

struct CacheContext {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
    created_at: DateTime<Utc>,
    lifetime: Duration,
    deadline: Instant,
}

impl CacheContext {
    fn cancel(self) {
        // The task may have stopped on its own already.
        let _ = self.cancel.send(true);
        drop(self.handle);
    }
}

/// A live cache context, as reported by the status API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheContextInfo {
    pub disruption: String,
    pub spec_hash: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub running: bool,
}

type ContextKey = (ObjectKey, SpecHash);

#[derive(Default)]
pub struct CacheContextRegistry {
    contexts: RwLock<BTreeMap<ContextKey, CacheContext>>,
}

impl CacheContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make sure a context exists for `(disruption, hash)`.
    ///
    /// Contexts of the same disruption under another hash are cancelled.
    /// `start` is only called when a new context is needed; it receives the
    /// cancel signal and returns the watch task. Returns whether a context
    /// was created.
    pub async fn ensure<F>(
        &self,
        disruption: &ObjectKey,
        hash: &SpecHash,
        lifetime: Duration,
        start: F,
    ) -> bool
    where
        F: FnOnce(watch::Receiver<bool>) -> JoinHandle<()>,
    {
        let mut contexts = self.contexts.write().await;
        let key = (disruption.clone(), hash.clone());

        let live = contexts
            .get(&key)
            .is_some_and(|c| !c.handle.is_finished() && c.deadline > Instant::now());
        if live {
            return false;
        }

        let stale: Vec<ContextKey> = contexts
            .keys()
            .filter(|(d, _)| d == disruption)
            .cloned()
            .collect();
        for stale_key in stale {
            if let Some(context) = contexts.remove(&stale_key) {
                debug!(disruption = %disruption, hash = %stale_key.1, "Replacing cache context");
                context.cancel();
            }
        }

        let (cancel, cancelled) = watch::channel(false);
        let handle = start(cancelled);
        contexts.insert(
            key,
            CacheContext {
                cancel,
                handle,
                created_at: Utc::now(),
                lifetime,
                deadline: Instant::now() + lifetime,
            },
        );
        info!(
            disruption = %disruption,
            hash = %hash,
            lifetime_secs = lifetime.as_secs(),
            "Created cache context"
        );
        true
    }

    /// Cancel and drop every context of a disruption.
    pub async fn remove(&self, disruption: &ObjectKey) -> usize {
        let mut contexts = self.contexts.write().await;
        let keys: Vec<ContextKey> = contexts
            .keys()
            .filter(|(d, _)| d == disruption)
            .cloned()
            .collect();
        for key in &keys {
            if let Some(context) = contexts.remove(key) {
                context.cancel();
            }
        }
        if !keys.is_empty() {
            info!(disruption = %disruption, removed = keys.len(), "Removed cache contexts");
        }
        keys.len()
    }

    /// Drop contexts past their lifetime or whose task stopped.
    pub async fn clear_expired(&self) -> usize {
        let now = Instant::now();
        let mut contexts = self.contexts.write().await;
        let expired: Vec<ContextKey> = contexts
            .iter()
            .filter(|(_, c)| c.deadline <= now || c.handle.is_finished())
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            if let Some(context) = contexts.remove(key) {
                debug!(disruption = %key.0, "Cache context expired");
                context.cancel();
            }
        }
        expired.len()
    }

    /// Drop contexts whose disruption is not in `existing`.
    pub async fn remove_orphans(&self, existing: &BTreeSet<ObjectKey>) -> usize {
        let mut contexts = self.contexts.write().await;
        let orphans: Vec<ContextKey> = contexts
            .keys()
            .filter(|(d, _)| !existing.contains(d))
            .cloned()
            .collect();
        for key in &orphans {
            if let Some(context) = contexts.remove(key) {
                info!(disruption = %key.0, "Dropped cache context of a missing disruption");
                context.cancel();
            }
        }
        orphans.len()
    }

    pub async fn contains(&self, disruption: &ObjectKey) -> bool {
        self.contexts
            .read()
            .await
            .keys()
            .any(|(d, _)| d == disruption)
    }

    pub async fn len(&self) -> usize {
        self.contexts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn list(&self) -> Vec<CacheContextInfo> {
        self.contexts
            .read()
            .await
            .iter()
            .map(|((disruption, hash), c)| CacheContextInfo {
                disruption: disruption.to_string(),
                spec_hash: hash.to_string(),
                created_at: c.created_at,
                expires_at: chrono::Duration::from_std(c.lifetime)
                    .ok()
                    .and_then(|l| c.created_at.checked_add_signed(l))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC),
                running: !c.handle.is_finished(),
            })
            .collect()
    }

    /// Cancel everything, e.g. on shutdown.
    pub async fn clear(&self) {
        let contexts = std::mem::take(&mut *self.contexts.write().await);
        for (_, context) in contexts {
            context.cancel();
        }
    }
}
