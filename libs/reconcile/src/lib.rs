//! Reconciliation primitives for the fault-injection controller.
//!
//! The controller converges a disruption's declared intent (targets, agents)
//! with what the cluster currently runs. This library holds the pieces of
//! that loop that carry no cluster knowledge:
//!
//! - **Spec hashes**: stable fingerprints of a disruption spec, used to key
//!   per-disruption caches and to detect parameter changes.
//! - **Counts**: `Count = Fixed | Percentage`, resolved against a population.
//! - **Backoff**: bounded exponential waits (agent creation acknowledgement).
//! - **Requeue**: jittered retry windows for the work queue.
//! - **Picking**: seeded random selection used when growing or shrinking a
//!   target set.
//!
//! # Invariants
//!
//! - Hashing is independent of JSON key order
//! - `Count::scale` never exceeds the population it is applied to
//! - Random picks never repeat an element

mod backoff;
mod count;
mod pick;
mod requeue;

use std::time::Duration;

use sha2::{Digest, Sha256};
use thiserror::Error;

pub use backoff::{Backoff, ExponentialBackoff};
pub use count::{Count, CountParseError};
pub use pick::pick_random;
pub use requeue::JitteredRequeue;

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Timeout waiting for a resource to appear.
    #[error("timeout after {elapsed:?} waiting for {resource}")]
    Timeout {
        resource: String,
        elapsed: Duration,
    },

    /// A value could not be serialized for hashing.
    #[error("cannot hash spec: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A spec hash for deterministic comparison.
///
/// Two disruptions with the same parameters (in any key order) hash equally.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpecHash(String);

impl SpecHash {
    /// Compute a spec hash from canonical JSON.
    pub fn from_json(json: &serde_json::Value) -> Self {
        let canonical = canonical_json(json);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let result = hasher.finalize();
        Self(format!("sha256:{}", hex::encode(&result[..16])))
    }

    /// Hash any serializable value, dropping the given top-level fields first.
    ///
    /// Used to hash a disruption spec without its target count so scaling a
    /// disruption does not look like a new disruption.
    pub fn from_serializable_without<T: serde::Serialize>(
        value: &T,
        excluded: &[&str],
    ) -> Result<Self, ReconcileError> {
        let mut json = serde_json::to_value(value)?;
        if let serde_json::Value::Object(map) = &mut json {
            for field in excluded {
                map.remove(*field);
            }
        }
        Ok(Self::from_json(&json))
    }

    /// Get the hash string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SpecHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Produce canonical JSON (sorted keys, no extra whitespace).
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("{}:{}", quote(k), canonical_json(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        serde_json::Value::String(s) => quote(s),
        other => other.to_string(),
    }
}

fn quote(s: &str) -> String {
    // serde_json escapes strings exactly the way canonical output needs.
    serde_json::Value::String(s.to_owned()).to_string()
}

/// Lower bound of the jittered requeue window.
pub const DEFAULT_REQUEUE_MIN: Duration = Duration::from_secs(15);

/// Upper bound of the jittered requeue window.
pub const DEFAULT_REQUEUE_MAX: Duration = Duration::from_secs(20);

/// Longest single wait while polling for a freshly created object.
pub const DEFAULT_BACKOFF_MAX_INTERVAL: Duration = Duration::from_secs(1);

/// Total budget for polling a freshly created object.
pub const DEFAULT_BACKOFF_MAX_ELAPSED: Duration = Duration::from_secs(30);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_hash_deterministic() {
        let json1 = serde_json::json!({"b": 2, "a": {"y": [1, 2], "x": "v"}});
        let json2 = serde_json::json!({"a": {"x": "v", "y": [1, 2]}, "b": 2});

        assert_eq!(SpecHash::from_json(&json1), SpecHash::from_json(&json2));
        assert!(SpecHash::from_json(&json1).as_str().starts_with("sha256:"));
    }

    #[test]
    fn test_spec_hash_array_order_matters() {
        let json1 = serde_json::json!({"a": [1, 2]});
        let json2 = serde_json::json!({"a": [2, 1]});

        assert_ne!(SpecHash::from_json(&json1), SpecHash::from_json(&json2));
    }

    #[test]
    fn test_spec_hash_without_excluded_field() {
        #[derive(serde::Serialize)]
        struct Spec {
            count: u32,
            level: &'static str,
        }

        let small = Spec { count: 1, level: "pod" };
        let large = Spec { count: 7, level: "pod" };
        let node = Spec { count: 1, level: "node" };

        let h_small = SpecHash::from_serializable_without(&small, &["count"]).unwrap();
        let h_large = SpecHash::from_serializable_without(&large, &["count"]).unwrap();
        let h_node = SpecHash::from_serializable_without(&node, &["count"]).unwrap();

        assert_eq!(h_small, h_large);
        assert_ne!(h_small, h_node);
    }

    #[test]
    fn test_canonical_json_escapes_strings() {
        let json = serde_json::json!({"k\"ey": "line\nbreak"});
        assert_eq!(canonical_json(&json), r#"{"k\"ey":"line\nbreak"}"#);
    }
}
