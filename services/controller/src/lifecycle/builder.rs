//! Agent object construction.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::config::InjectorConfig;
use crate::error::ControllerResult;
use crate::ipranges::IpRangeCatalog;
use crate::model::agent::{
    ownership_labels, EnvValue, EnvVar, HostMount, ReadinessProbe,
};
use crate::model::disruption::{AGENT_FINALIZER, FAULT_KIND_LABEL, TARGET_LABEL};
use crate::model::fault::HostSpec;
use crate::model::{Agent, AgentSpec, AgentStatus, Disruption, Fault, ObjectMeta, Target};

/// File the agent writes once its injection is in place.
pub const READINESS_SENTINEL: &str = "/tmp/readiness_probe";

/// Padding added to the agent's own deadline.
const DEADLINE_PADDING: Duration = Duration::from_secs(2);

/// Slack between the agent's deadline and the platform killing it.
const ACTIVE_DEADLINE_SLACK: Duration = Duration::from_secs(10);

const TERMINATION_GRACE_PERIOD: Duration = Duration::from_secs(60);

fn rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn mount(name: &str, host_path: &str, mount_path: &str) -> HostMount {
    HostMount {
        name: name.to_string(),
        host_path: host_path.to_string(),
        mount_path: mount_path.to_string(),
    }
}

fn env(name: &str, value: EnvValue) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value,
    }
}

/// Builds agents from the injector configuration.
#[derive(Clone)]
pub struct AgentBuilder {
    config: InjectorConfig,
    catalog: Arc<IpRangeCatalog>,
}

impl AgentBuilder {
    pub fn new(config: InjectorConfig, catalog: Arc<IpRangeCatalog>) -> Self {
        Self { config, catalog }
    }

    /// The agent injecting `fault` into `target`.
    ///
    /// `remaining` is the time left in the disruption; the agent stops on
    /// its own once it has elapsed.
    pub fn build(
        &self,
        disruption: &Disruption,
        target: &Target,
        fault: &Fault,
        now: DateTime<Utc>,
        remaining: Duration,
    ) -> ControllerResult<Agent> {
        let kind = fault.kind();

        let mut labels = self.config.labels.clone();
        labels.extend(ownership_labels(&disruption.key()));
        labels.insert(TARGET_LABEL.to_string(), target.name().to_string());
        labels.insert(FAULT_KIND_LABEL.to_string(), kind.as_str().to_string());

        let mut metadata = ObjectMeta::new(self.config.namespace.as_str(), "");
        metadata.generate_name = Some(format!("faultline-{}-", disruption.name()));
        metadata.labels = labels;
        metadata.annotations = self.config.annotations.clone();
        metadata.finalizers = vec![AGENT_FINALIZER.to_string()];

        let mut args = vec![kind.as_str().to_string()];
        args.extend(self.common_args(disruption, target));
        args.extend(fault.args());
        for service in fault.cloud_services() {
            for cidr in self.catalog.resolve(service)? {
                args.push("--hosts".to_string());
                args.push(HostSpec::new(cidr, None).to_arg());
            }
        }
        let deadline = chrono::Duration::from_std(remaining + DEADLINE_PADDING)
            .map(|d| now + d)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        args.push("--deadline".to_string());
        args.push(rfc3339(deadline));

        let host_ip = match target {
            Target::Pod(p) => p.status.host_ip.clone(),
            Target::Node(n) => n.status.internal_ip.clone(),
        };

        Ok(Agent {
            metadata,
            spec: AgentSpec {
                fault_kind: kind,
                node_name: target.node_name().map(str::to_string),
                image: self.config.image.clone(),
                service_account: self.config.service_account.clone(),
                image_pull_secret: self.config.image_pull_secret.clone(),
                args,
                env: vec![
                    env(
                        "TARGET_POD_HOST_IP",
                        EnvValue::Literal(host_ip.unwrap_or_default()),
                    ),
                    env("CHAOS_POD_IP", EnvValue::FieldRef("status.podIP".to_string())),
                    env(
                        "INJECTOR_POD_NAME",
                        EnvValue::FieldRef("metadata.name".to_string()),
                    ),
                ],
                mounts: vec![
                    mount("host", "/", "/mnt/host/"),
                    mount("proc", "/proc", "/mnt/host/proc/"),
                    mount("sysrq", "/proc/sys/kernel/sysrq", "/mnt/sysrq"),
                    mount("sysrq-trigger", "/proc/sysrq-trigger", "/mnt/sysrq-trigger"),
                    mount("cgroup", "/sys/fs/cgroup", "/mnt/cgroup/"),
                ],
                readiness_probe: ReadinessProbe {
                    sentinel_path: READINESS_SENTINEL.to_string(),
                    period: Duration::from_secs(1),
                    failure_threshold: 5,
                },
                active_deadline: remaining + ACTIVE_DEADLINE_SLACK,
                termination_grace_period: TERMINATION_GRACE_PERIOD,
                privileged: true,
                host_pid: true,
            },
            status: AgentStatus::default(),
        })
    }

    fn common_args(&self, disruption: &Disruption, target: &Target) -> Vec<String> {
        let mut args = Vec::new();
        let mut push = |flag: &str, value: String| {
            args.push(flag.to_string());
            args.push(value);
        };

        push("--level", disruption.spec.level.as_str().to_string());
        push("--target-name", target.name().to_string());
        if let Some(node) = target.node_name() {
            push("--target-node-name", node.to_string());
        }
        if let Target::Pod(pod) = target {
            let containers: Vec<String> = pod
                .status
                .container_statuses
                .iter()
                .filter(|c| {
                    disruption.spec.containers.is_empty()
                        || disruption.spec.containers.contains(&c.name)
                })
                .filter_map(|c| c.container_id.as_ref().map(|id| format!("{};{}", c.name, id)))
                .collect();
            if !containers.is_empty() {
                push("--target-containers", containers.join(","));
            }
            if let Some(ip) = &pod.status.pod_ip {
                push("--target-pod-ip", ip.clone());
            }
        }
        push("--disruption-name", disruption.name().to_string());
        push("--disruption-namespace", disruption.namespace().to_string());
        push("--chaos-namespace", self.config.namespace.clone());
        push("--not-injected-before", rfc3339(disruption.time_to_inject()));

        if let Some(pulse) = &disruption.spec.pulse {
            if let Some(delay) = pulse.initial_delay {
                push(
                    "--pulse-initial-delay",
                    humantime::format_duration(delay).to_string(),
                );
            }
            push(
                "--pulse-active-duration",
                humantime::format_duration(pulse.active_duration).to_string(),
            );
            push(
                "--pulse-dormant-duration",
                humantime::format_duration(pulse.dormant_duration).to_string(),
            );
        }
        for host in &self.config.network_allowed_hosts {
            push("--allowed-hosts", host.clone());
        }
        if let Some(dns) = &self.config.dns_server {
            push("--dns-server", dns.clone());
        }

        if disruption.spec.dry_run {
            args.push("--dry-run".to_string());
        }
        if disruption.spec.on_init {
            args.push("--on-init".to_string());
        }
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fault::{CpuPressureFault, NetworkFault};
    use crate::model::{DisruptionSpec, Pod};
    use faultline_reconcile::Count;
    use std::collections::BTreeMap;

    fn builder(catalog: BTreeMap<String, Vec<String>>) -> AgentBuilder {
        let config = InjectorConfig {
            labels: BTreeMap::from([("team".to_string(), "chaos".to_string())]),
            ..Default::default()
        };
        AgentBuilder::new(config, Arc::new(IpRangeCatalog::new(catalog)))
    }

    fn disruption(faults: Vec<Fault>) -> Disruption {
        Disruption::new(
            "default",
            "net",
            DisruptionSpec::new(&[("app", "web")], Count::Fixed(1), faults),
        )
    }

    fn pod() -> Target {
        Target::Pod(Pod::running("default", "web-1", "node-a", &["app", "sidecar"]))
    }

    fn flag<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == name)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn test_agent_shape() {
        let fault = Fault::CpuPressure(CpuPressureFault::default());
        let d = disruption(vec![fault.clone()]);
        let now = Utc::now();
        let agent = builder(BTreeMap::new())
            .build(&d, &pod(), &fault, now, Duration::from_secs(300))
            .unwrap();

        assert_eq!(agent.metadata.namespace, "faultline");
        assert_eq!(agent.metadata.generate_name.as_deref(), Some("faultline-net-"));
        assert_eq!(agent.metadata.finalizers, vec![AGENT_FINALIZER.to_string()]);
        assert_eq!(agent.target(), Some("web-1"));
        assert_eq!(agent.owner(), Some(d.key()));
        assert_eq!(agent.metadata.label("team"), Some("chaos"));
        assert_eq!(agent.spec.node_name.as_deref(), Some("node-a"));
        assert_eq!(agent.spec.active_deadline, Duration::from_secs(310));
        assert!(agent.spec.privileged && agent.spec.host_pid);
        assert_eq!(agent.spec.readiness_probe.sentinel_path, READINESS_SENTINEL);

        let args = &agent.spec.args;
        assert_eq!(args[0], "cpu-pressure");
        assert_eq!(flag(args, "--level"), Some("pod"));
        assert_eq!(
            flag(args, "--target-containers"),
            Some("app;containerd://app,sidecar;containerd://sidecar")
        );
        let deadline = now + chrono::Duration::seconds(302);
        assert_eq!(flag(args, "--deadline"), Some(rfc3339(deadline).as_str()));
        assert_eq!(args[args.len() - 2], "--deadline");
    }

    #[test]
    fn test_container_filter() {
        let fault = Fault::CpuPressure(CpuPressureFault::default());
        let mut d = disruption(vec![fault.clone()]);
        d.spec.containers = vec!["sidecar".to_string()];
        let agent = builder(BTreeMap::new())
            .build(&d, &pod(), &fault, Utc::now(), Duration::from_secs(60))
            .unwrap();

        assert_eq!(
            flag(&agent.spec.args, "--target-containers"),
            Some("sidecar;containerd://sidecar")
        );
    }

    #[test]
    fn test_cloud_services_resolve_to_hosts() {
        let fault = Fault::Network(NetworkFault {
            cloud_services: vec!["aws/s3".to_string()],
            drop: 100,
            ..Default::default()
        });
        let d = disruption(vec![fault.clone()]);
        let catalog = BTreeMap::from([("aws/s3".to_string(), vec!["52.216.0.0/15".to_string()])]);

        let agent = builder(catalog)
            .build(&d, &pod(), &fault, Utc::now(), Duration::from_secs(60))
            .unwrap();
        assert_eq!(flag(&agent.spec.args, "--hosts"), Some("52.216.0.0/15;0;"));

        let err = builder(BTreeMap::new())
            .build(&d, &pod(), &fault, Utc::now(), Duration::from_secs(60))
            .unwrap_err();
        assert!(!err.is_user_error());
    }
}
