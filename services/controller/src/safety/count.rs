//! Refuse disruptions that would hit most of a namespace or cluster.

use async_trait::async_trait;

use super::{SafetyNet, SafetyNetError, SafetyVerdict};
use crate::model::disruption::UnsafeMode;
use crate::model::{Disruption, LabelSelector, Level};
use crate::platform::Platform;

/// Largest share of a namespace's pods a disruption may target.
pub const NAMESPACE_SHARE_LIMIT: f64 = 0.8;

/// Largest share of the cluster's pods or nodes a disruption may target.
pub const CLUSTER_SHARE_LIMIT: f64 = 0.66;

pub struct CountTooLarge;

fn share(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

#[async_trait]
impl SafetyNet for CountTooLarge {
    fn name(&self) -> &'static str {
        "count-too-large"
    }

    fn disabled_by(&self, unsafe_mode: &UnsafeMode) -> bool {
        unsafe_mode.disable_count_too_large
    }

    async fn check(
        &self,
        disruption: &Disruption,
        platform: &dyn Platform,
    ) -> Result<SafetyVerdict, SafetyNetError> {
        let selector = disruption.label_selector()?;
        let everything = LabelSelector::default();
        let count = disruption.spec.count;

        match disruption.spec.level {
            Level::Pod => {
                let namespace = disruption.namespace();
                let matched = platform.list_pods(Some(namespace), &selector).await?.len();
                let in_namespace = platform.list_pods(Some(namespace), &everything).await?.len();
                let in_cluster = platform.list_pods(None, &everything).await?.len();
                let desired = count.scale(matched, true);

                if share(desired, in_namespace) > NAMESPACE_SHARE_LIMIT {
                    return Ok(SafetyVerdict::Tripped(format!(
                        "{desired} of {in_namespace} pods in namespace {namespace} would be targeted, above {:.0}%",
                        NAMESPACE_SHARE_LIMIT * 100.0
                    )));
                }
                if share(desired, in_cluster) > CLUSTER_SHARE_LIMIT {
                    return Ok(SafetyVerdict::Tripped(format!(
                        "{desired} of {in_cluster} pods in the cluster would be targeted, above {:.0}%",
                        CLUSTER_SHARE_LIMIT * 100.0
                    )));
                }
            }
            Level::Node => {
                let matched = platform.list_nodes(&selector).await?.len();
                let in_cluster = platform.list_nodes(&everything).await?.len();
                let desired = count.scale(matched, true);

                if share(desired, in_cluster) > CLUSTER_SHARE_LIMIT {
                    return Ok(SafetyVerdict::Tripped(format!(
                        "{desired} of {in_cluster} nodes would be targeted, above {:.0}%",
                        CLUSTER_SHARE_LIMIT * 100.0
                    )));
                }
            }
        }

        Ok(SafetyVerdict::Passed)
    }
}
