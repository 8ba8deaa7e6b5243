//! Dynamic targeting: scoped watches that re-reconcile on target changes.

mod observer;
mod registry;
mod watcher;

pub use observer::{
    classify_platform_event, node_diff, pod_diff, suppress_mixed_recovery, TargetObserver,
};
pub use registry::{CacheContextInfo, CacheContextRegistry};
pub use watcher::{ChangeKind, DisruptionWatcher, ReconcileTrigger, TargetChange, WatchScope};
