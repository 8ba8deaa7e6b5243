//! Safety nets: checks run before a disruption injects anything.
//!
//! A net either passes or trips with a human readable reason. Nets are
//! evaluated once per disruption spec hash; a spec change re-arms them.

mod count;
mod network;

pub use count::{CountTooLarge, CLUSTER_SHARE_LIMIT, NAMESPACE_SHARE_LIMIT};
pub use network::NeitherHostNorPort;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use faultline_reconcile::SpecHash;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::model::disruption::UnsafeMode;
use crate::model::{Disruption, ObjectKey, SelectorError};
use crate::platform::{Platform, PlatformError};

/// Errors evaluating a safety net.
#[derive(Debug, Error)]
pub enum SafetyNetError {
    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error(transparent)]
    Selector(#[from] SelectorError),
}

/// Outcome of one net.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyVerdict {
    Passed,
    Tripped(String),
}

/// A tripped net, with its name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tripped {
    pub net: &'static str,
    pub reason: String,
}

#[async_trait]
pub trait SafetyNet: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the disruption's unsafe mode switches this net off.
    fn disabled_by(&self, unsafe_mode: &UnsafeMode) -> bool;

    async fn check(
        &self,
        disruption: &Disruption,
        platform: &dyn Platform,
    ) -> Result<SafetyVerdict, SafetyNetError>;
}

/// The built-in nets.
pub fn builtin() -> Vec<Arc<dyn SafetyNet>> {
    vec![Arc::new(CountTooLarge), Arc::new(NeitherHostNorPort)]
}

/// Evaluates nets and remembers the verdict per spec hash.
pub struct SafetyNets {
    nets: Vec<Arc<dyn SafetyNet>>,
    verdicts: Mutex<BTreeMap<ObjectKey, (SpecHash, Option<Tripped>)>>,
}

impl SafetyNets {
    pub fn new(nets: Vec<Arc<dyn SafetyNet>>) -> Self {
        Self {
            nets,
            verdicts: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn builtin() -> Self {
        Self::new(builtin())
    }

    /// First tripped net for the disruption, if any.
    pub async fn check(
        &self,
        disruption: &Disruption,
        hash: &SpecHash,
        platform: &dyn Platform,
    ) -> Result<Option<Tripped>, SafetyNetError> {
        let key = disruption.key();
        if let Some((known, verdict)) = self.verdicts.lock().await.get(&key) {
            if known == hash {
                return Ok(verdict.clone());
            }
        }

        let unsafe_mode = disruption.spec.unsafe_mode.clone().unwrap_or_default();
        let mut tripped = None;
        if !unsafe_mode.disable_all {
            for net in &self.nets {
                if net.disabled_by(&unsafe_mode) {
                    debug!(disruption = %key, net = net.name(), "Safety net disabled");
                    continue;
                }
                if let SafetyVerdict::Tripped(reason) = net.check(disruption, platform).await? {
                    warn!(disruption = %key, net = net.name(), reason = %reason, "Safety net tripped");
                    tripped = Some(Tripped {
                        net: net.name(),
                        reason,
                    });
                    break;
                }
            }
        }

        self.verdicts
            .lock()
            .await
            .insert(key, (hash.clone(), tripped.clone()));
        Ok(tripped)
    }

    /// Forget a disruption, e.g. once it is gone.
    pub async fn forget(&self, disruption: &ObjectKey) {
        self.verdicts.lock().await.remove(disruption);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fault::{CpuPressureFault, Fault};
    use crate::model::DisruptionSpec;
    use crate::platform::InMemoryPlatform;
    use faultline_reconcile::Count;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct AlwaysTrips {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SafetyNet for AlwaysTrips {
        fn name(&self) -> &'static str {
            "always"
        }

        fn disabled_by(&self, unsafe_mode: &UnsafeMode) -> bool {
            unsafe_mode.disable_count_too_large
        }

        async fn check(
            &self,
            _disruption: &Disruption,
            _platform: &dyn Platform,
        ) -> Result<SafetyVerdict, SafetyNetError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(SafetyVerdict::Tripped("no".to_string()))
        }
    }

    fn disruption(unsafe_mode: Option<UnsafeMode>) -> Disruption {
        let mut spec = DisruptionSpec::new(
            &[("app", "web")],
            Count::Fixed(1),
            vec![Fault::CpuPressure(CpuPressureFault::default())],
        );
        spec.unsafe_mode = unsafe_mode;
        Disruption::new("default", "cpu", spec)
    }

    #[tokio::test]
    async fn test_verdict_is_cached_per_hash() {
        let net = Arc::new(AlwaysTrips {
            calls: AtomicUsize::new(0),
        });
        let nets = SafetyNets::new(vec![net.clone()]);
        let platform = InMemoryPlatform::new();
        let d = disruption(None);
        let first = SpecHash::from_json(&serde_json::json!({ "v": 1 }));
        let second = SpecHash::from_json(&serde_json::json!({ "v": 2 }));

        let tripped = nets.check(&d, &first, &platform).await.unwrap().unwrap();
        assert_eq!(tripped.net, "always");
        nets.check(&d, &first, &platform).await.unwrap();
        assert_eq!(net.calls.load(Ordering::SeqCst), 1);

        nets.check(&d, &second, &platform).await.unwrap();
        assert_eq!(net.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unsafe_mode_disables_nets() {
        let nets = SafetyNets::new(vec![Arc::new(AlwaysTrips {
            calls: AtomicUsize::new(0),
        })]);
        let platform = InMemoryPlatform::new();
        let hash = SpecHash::from_json(&serde_json::json!({}));

        let all = disruption(Some(UnsafeMode {
            disable_all: true,
            ..Default::default()
        }));
        assert_eq!(nets.check(&all, &hash, &platform).await.unwrap(), None);

        nets.forget(&all.key()).await;
        let one = disruption(Some(UnsafeMode {
            disable_count_too_large: true,
            ..Default::default()
        }));
        assert_eq!(nets.check(&one, &hash, &platform).await.unwrap(), None);
    }
}
