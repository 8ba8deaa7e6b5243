use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// How the agents are created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectorConfig {
    /// Namespace agents are created in.
    pub namespace: String,
    pub image: String,
    pub service_account: String,
    pub image_pull_secret: Option<String>,

    /// Extra labels and annotations put on every agent.
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,

    /// Hosts network faults never touch (e.g. the cluster API).
    pub network_allowed_hosts: Vec<String>,
    pub dns_server: Option<String>,
}

impl Default for InjectorConfig {
    fn default() -> Self {
        Self {
            namespace: "faultline".to_string(),
            image: "faultline/injector:latest".to_string(),
            service_account: "faultline-injector".to_string(),
            image_pull_secret: None,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            network_allowed_hosts: Vec::new(),
            dns_server: None,
        }
    }
}

/// Protections for the controller's own workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Safeguards {
    pub enabled: bool,
    pub controller_node_name: Option<String>,
    pub controller_pod_name: Option<String>,
}

impl Default for Safeguards {
    fn default() -> Self {
        Self {
            enabled: true,
            controller_node_name: None,
            controller_pod_name: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MetricsSinkKind {
    #[default]
    Log,
    Noop,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,

    /// Concurrent reconciles (never two for the same disruption).
    pub workers: usize,

    /// Duration of disruptions that declare none.
    pub default_duration: Duration,

    /// How long an expired disruption lingers before being deleted.
    pub expired_gc_delay: Duration,

    pub resync_interval: Duration,
    pub orphan_sweep_interval: Duration,
    pub requeue_min: Duration,
    pub requeue_max: Duration,

    /// Budget for the platform to acknowledge a created agent.
    pub agent_creation_timeout: Duration,

    pub watcher_queue_capacity: usize,

    /// Emit target health notifications from dynamic watches.
    pub observer_enabled: bool,

    pub safeguards: Safeguards,

    /// Run safety nets before the first injection of each disruption.
    pub safemode: bool,

    pub injector: InjectorConfig,
    pub metrics_sink: MetricsSinkKind,

    /// Seed for target picking; random when unset.
    pub selection_seed: Option<u64>,

    pub cloud_ip_ranges_file: Option<PathBuf>,

    /// Objects to preload into the in-memory platform.
    pub seed_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            log_level: "info".to_string(),
            workers: 4,
            default_duration: Duration::from_secs(3600),
            expired_gc_delay: Duration::from_secs(600),
            resync_interval: Duration::from_secs(300),
            orphan_sweep_interval: Duration::from_secs(60),
            requeue_min: faultline_reconcile::DEFAULT_REQUEUE_MIN,
            requeue_max: faultline_reconcile::DEFAULT_REQUEUE_MAX,
            agent_creation_timeout: faultline_reconcile::DEFAULT_BACKOFF_MAX_ELAPSED,
            watcher_queue_capacity: 256,
            observer_enabled: true,
            safeguards: Safeguards::default(),
            safemode: false,
            injector: InjectorConfig::default(),
            metrics_sink: MetricsSinkKind::Log,
            selection_seed: None,
            cloud_ip_ranges_file: None,
            seed_file: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from a variable lookup, defaulting what is unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let duration = |key: &str, default: Duration| -> Result<Duration> {
            match var(key) {
                Some(v) => humantime::parse_duration(v.trim())
                    .with_context(|| format!("{key}: invalid duration {v:?}")),
                None => Ok(default),
            }
        };
        let flag = |key: &str, default: bool| {
            var(key)
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(default)
        };

        let listen_addr = match var("FAULTLINE_LISTEN_ADDR") {
            Some(v) => v
                .parse()
                .with_context(|| format!("FAULTLINE_LISTEN_ADDR: invalid address {v:?}"))?,
            None => defaults.listen_addr,
        };

        let workers = match var("FAULTLINE_WORKERS") {
            Some(v) => v
                .parse()
                .with_context(|| format!("FAULTLINE_WORKERS: invalid number {v:?}"))?,
            None => defaults.workers,
        };
        if workers == 0 {
            bail!("FAULTLINE_WORKERS must be at least 1");
        }

        let watcher_queue_capacity = match var("FAULTLINE_WATCHER_QUEUE_CAPACITY") {
            Some(v) => v.parse().with_context(|| {
                format!("FAULTLINE_WATCHER_QUEUE_CAPACITY: invalid number {v:?}")
            })?,
            None => defaults.watcher_queue_capacity,
        };

        let metrics_sink = match var("FAULTLINE_METRICS_SINK").as_deref() {
            None | Some("log") => MetricsSinkKind::Log,
            Some("noop") => MetricsSinkKind::Noop,
            Some(other) => bail!("FAULTLINE_METRICS_SINK: unknown sink {other:?}"),
        };

        let selection_seed = var("FAULTLINE_SELECTION_SEED")
            .map(|v| {
                v.parse()
                    .with_context(|| format!("FAULTLINE_SELECTION_SEED: invalid seed {v:?}"))
            })
            .transpose()?;

        let injector = InjectorConfig {
            namespace: var("FAULTLINE_AGENT_NAMESPACE").unwrap_or(defaults.injector.namespace),
            image: var("FAULTLINE_INJECTOR_IMAGE").unwrap_or(defaults.injector.image),
            service_account: var("FAULTLINE_INJECTOR_SERVICE_ACCOUNT")
                .unwrap_or(defaults.injector.service_account),
            image_pull_secret: var("FAULTLINE_INJECTOR_IMAGE_PULL_SECRET"),
            labels: parse_pairs("FAULTLINE_INJECTOR_LABELS", var("FAULTLINE_INJECTOR_LABELS"))?,
            annotations: parse_pairs(
                "FAULTLINE_INJECTOR_ANNOTATIONS",
                var("FAULTLINE_INJECTOR_ANNOTATIONS"),
            )?,
            network_allowed_hosts: var("FAULTLINE_INJECTOR_ALLOWED_HOSTS")
                .map(|v| split_list(&v))
                .unwrap_or_default(),
            dns_server: var("FAULTLINE_INJECTOR_DNS_SERVER"),
        };

        let requeue_min = duration("FAULTLINE_REQUEUE_MIN", defaults.requeue_min)?;
        let requeue_max = duration("FAULTLINE_REQUEUE_MAX", defaults.requeue_max)?;
        if requeue_min > requeue_max {
            bail!("FAULTLINE_REQUEUE_MIN must not exceed FAULTLINE_REQUEUE_MAX");
        }

        Ok(Self {
            listen_addr,
            log_level: var("FAULTLINE_LOG_LEVEL").unwrap_or(defaults.log_level),
            workers,
            default_duration: duration("FAULTLINE_DEFAULT_DURATION", defaults.default_duration)?,
            expired_gc_delay: duration(
                "FAULTLINE_EXPIRED_DISRUPTION_GC_DELAY",
                defaults.expired_gc_delay,
            )?,
            resync_interval: duration("FAULTLINE_RESYNC_INTERVAL", defaults.resync_interval)?,
            orphan_sweep_interval: duration(
                "FAULTLINE_ORPHAN_SWEEP_INTERVAL",
                defaults.orphan_sweep_interval,
            )?,
            requeue_min,
            requeue_max,
            agent_creation_timeout: duration(
                "FAULTLINE_AGENT_CREATION_TIMEOUT",
                defaults.agent_creation_timeout,
            )?,
            watcher_queue_capacity,
            observer_enabled: flag("FAULTLINE_TARGET_OBSERVER", defaults.observer_enabled),
            safeguards: Safeguards {
                enabled: flag("FAULTLINE_SAFEGUARDS", defaults.safeguards.enabled),
                controller_node_name: var("FAULTLINE_CONTROLLER_NODE_NAME"),
                controller_pod_name: var("FAULTLINE_CONTROLLER_POD_NAME"),
            },
            safemode: flag("FAULTLINE_SAFEMODE", defaults.safemode),
            injector,
            metrics_sink,
            selection_seed,
            cloud_ip_ranges_file: var("FAULTLINE_CLOUD_IP_RANGES").map(PathBuf::from),
            seed_file: var("FAULTLINE_SEED_FILE").map(PathBuf::from),
        })
    }

    /// Lifetime of a dynamic-target watch.
    pub fn watch_lifetime(&self, disruption_duration: Duration) -> Duration {
        disruption_duration + self.expired_gc_delay * 2
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse `k1=v1,k2=v2`.
fn parse_pairs(key: &str, value: Option<String>) -> Result<BTreeMap<String, String>> {
    let Some(value) = value else {
        return Ok(BTreeMap::new());
    };
    split_list(&value)
        .into_iter()
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.trim().to_string())),
            _ => bail!("{key}: expected key=value, got {pair:?}"),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: BTreeMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();

        assert_eq!(config.default_duration, Duration::from_secs(3600));
        assert_eq!(config.expired_gc_delay, Duration::from_secs(600));
        assert_eq!(config.requeue_min, Duration::from_secs(15));
        assert_eq!(config.requeue_max, Duration::from_secs(20));
        assert_eq!(config.injector.namespace, "faultline");
        assert!(config.safeguards.enabled);
        assert_eq!(config.metrics_sink, MetricsSinkKind::Log);
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("FAULTLINE_EXPIRED_DISRUPTION_GC_DELAY", "90s"),
            ("FAULTLINE_INJECTOR_LABELS", "team=sre, tier=chaos"),
            ("FAULTLINE_INJECTOR_ALLOWED_HOSTS", "10.0.0.1, api.internal"),
            ("FAULTLINE_SAFEGUARDS", "false"),
            ("FAULTLINE_SELECTION_SEED", "42"),
            ("FAULTLINE_METRICS_SINK", "noop"),
        ]))
        .unwrap();

        assert_eq!(config.expired_gc_delay, Duration::from_secs(90));
        assert_eq!(config.injector.labels.get("tier").map(String::as_str), Some("chaos"));
        assert_eq!(config.injector.network_allowed_hosts, vec!["10.0.0.1", "api.internal"]);
        assert!(!config.safeguards.enabled);
        assert_eq!(config.selection_seed, Some(42));
        assert_eq!(config.metrics_sink, MetricsSinkKind::Noop);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(Config::from_lookup(lookup(&[("FAULTLINE_DEFAULT_DURATION", "soon")])).is_err());
        assert!(Config::from_lookup(lookup(&[("FAULTLINE_WORKERS", "0")])).is_err());
        assert!(Config::from_lookup(lookup(&[("FAULTLINE_INJECTOR_LABELS", "novalue")])).is_err());
        assert!(Config::from_lookup(lookup(&[
            ("FAULTLINE_REQUEUE_MIN", "30s"),
            ("FAULTLINE_REQUEUE_MAX", "20s"),
        ]))
        .is_err());
    }

    #[test]
    fn test_watch_lifetime() {
        let config = Config::default();
        assert_eq!(
            config.watch_lifetime(Duration::from_secs(60)),
            Duration::from_secs(60 + 1200)
        );
    }
}
