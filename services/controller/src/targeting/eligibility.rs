//! Eligibility of candidates already disrupted by someone else.

use std::collections::BTreeMap;

use tracing::debug;

use crate::error::ControllerResult;
use crate::model::disruption::{DISRUPTION_NAMESPACE_LABEL, TARGET_LABEL};
use crate::model::{Agent, Disruption, FaultKind, Level, Target};
use crate::platform::Platform;

/// Whether `agents` (owned by other disruptions) leave `target` free for `disruption`.
pub fn is_eligible(disruption: &Disruption, agents: &[Agent]) -> bool {
    let own = disruption.key();
    let foreign: Vec<&Agent> = agents
        .iter()
        .filter(|a| a.owner().as_ref() != Some(&own))
        .collect();

    if foreign.is_empty() {
        return true;
    }
    if !disruption.spec.allow_disrupted_targets {
        return false;
    }

    let kinds = disruption.fault_kinds();
    !foreign
        .iter()
        .filter_map(|a| a.fault_kind())
        .any(|k: FaultKind| kinds.contains(&k))
}

/// Agents labelled with a target, scoped by namespace at pod level.
async fn agents_on(
    platform: &dyn Platform,
    disruption: &Disruption,
    target: &Target,
) -> ControllerResult<Vec<Agent>> {
    let mut labels = BTreeMap::from([(TARGET_LABEL.to_string(), target.name().to_string())]);
    if disruption.spec.level == Level::Pod {
        labels.insert(
            DISRUPTION_NAMESPACE_LABEL.to_string(),
            disruption.namespace().to_string(),
        );
    }
    Ok(platform.list_agents(None, &labels).await?)
}

/// Drop unregistered candidates that another disruption already occupies.
///
/// Registered targets always stay, whatever agents they carry.
pub async fn filter_eligible(
    platform: &dyn Platform,
    disruption: &Disruption,
    candidates: Vec<Target>,
) -> ControllerResult<Vec<Target>> {
    let mut eligible = Vec::with_capacity(candidates.len());

    for candidate in candidates {
        if disruption.status.has_target(candidate.name()) {
            eligible.push(candidate);
            continue;
        }

        let agents = agents_on(platform, disruption, &candidate).await?;
        if is_eligible(disruption, &agents) {
            eligible.push(candidate);
        } else {
            debug!(
                disruption = %disruption.key(),
                target_name = candidate.name(),
                agents = agents.len(),
                "Target already disrupted, skipping"
            );
        }
    }

    Ok(eligible)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::agent::ownership_labels;
    use crate::model::disruption::FAULT_KIND_LABEL;
    use crate::model::fault::{CpuPressureFault, Fault, NetworkFault};
    use crate::model::{AgentSpec, DisruptionSpec, ObjectKey, ObjectMeta};
    use faultline_reconcile::Count;
    use rstest::rstest;
    use std::time::Duration;

    fn disruption(name: &str, faults: Vec<Fault>, allow: bool) -> Disruption {
        let mut spec = DisruptionSpec::new(&[("app", "web")], Count::Fixed(1), faults);
        spec.allow_disrupted_targets = allow;
        Disruption::new("default", name, spec)
    }

    fn agent_of(owner: &str, kind: FaultKind) -> Agent {
        let mut metadata = ObjectMeta::new("faultline", &format!("{owner}-agent"));
        metadata.labels = ownership_labels(&ObjectKey::new("default", owner));
        metadata
            .labels
            .insert(FAULT_KIND_LABEL.to_string(), kind.as_str().to_string());
        Agent {
            metadata,
            spec: AgentSpec {
                fault_kind: kind,
                node_name: None,
                image: String::new(),
                service_account: String::new(),
                image_pull_secret: None,
                args: vec![],
                env: vec![],
                mounts: vec![],
                readiness_probe: crate::model::agent::ReadinessProbe {
                    sentinel_path: "/tmp/readiness_probe".to_string(),
                    period: Duration::from_secs(1),
                    failure_threshold: 5,
                },
                active_deadline: Duration::from_secs(60),
                termination_grace_period: Duration::from_secs(60),
                privileged: true,
                host_pid: true,
            },
            status: Default::default(),
        }
    }

    fn cpu() -> Fault {
        Fault::CpuPressure(CpuPressureFault::default())
    }

    fn network() -> Fault {
        Fault::Network(NetworkFault {
            drop: 10,
            ..Default::default()
        })
    }

    #[rstest]
    #[case::free_target(vec![], false, true)]
    #[case::taken_not_allowed(vec![FaultKind::Network], false, false)]
    #[case::other_kind_allowed(vec![FaultKind::Network], true, true)]
    #[case::same_kind_allowed(vec![FaultKind::CpuPressure], true, false)]
    fn test_eligibility(#[case] existing: Vec<FaultKind>, #[case] allow: bool, #[case] eligible: bool) {
        let d = disruption("cpu", vec![cpu()], allow);
        let agents: Vec<_> = existing.into_iter().map(|k| agent_of("other", k)).collect();
        assert_eq!(is_eligible(&d, &agents), eligible);
    }

    #[test]
    fn test_own_agents_do_not_count() {
        let d = disruption("cpu", vec![cpu(), network()], false);
        let agents = vec![agent_of("cpu", FaultKind::CpuPressure)];
        assert!(is_eligible(&d, &agents));
    }
}
