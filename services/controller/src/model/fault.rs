//! Fault kinds and their payloads.
//!
//! Each [`Fault`] variant carries the parameters of one kind of failure. A
//! disruption holds a list of faults, at most one per [`FaultKind`]; the
//! controller spawns one agent per (target, kind) and hands it the
//! arguments produced by [`Fault::args`].

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use faultline_reconcile::Count;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A fault parameter problem.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{kind} fault: {message}")]
pub struct FaultError {
    pub kind: FaultKind,
    pub message: String,
}

impl FaultError {
    fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

// =============================================================================
// Kinds
// =============================================================================

/// Every kind of fault an agent can inject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FaultKind {
    Network,
    CpuPressure,
    MemoryPressure,
    DiskPressure,
    DiskFailure,
    Dns,
    Grpc,
    ContainerFailure,
    NodeFailure,
}

impl FaultKind {
    pub const ALL: [FaultKind; 9] = [
        FaultKind::Network,
        FaultKind::CpuPressure,
        FaultKind::MemoryPressure,
        FaultKind::DiskPressure,
        FaultKind::DiskFailure,
        FaultKind::Dns,
        FaultKind::Grpc,
        FaultKind::ContainerFailure,
        FaultKind::NodeFailure,
    ];

    /// Name used in agent labels and as the first agent argument.
    pub fn as_str(&self) -> &'static str {
        match self {
            FaultKind::Network => "network",
            FaultKind::CpuPressure => "cpu-pressure",
            FaultKind::MemoryPressure => "memory-pressure",
            FaultKind::DiskPressure => "disk-pressure",
            FaultKind::DiskFailure => "disk-failure",
            FaultKind::Dns => "dns",
            FaultKind::Grpc => "grpc",
            FaultKind::ContainerFailure => "container-failure",
            FaultKind::NodeFailure => "node-failure",
        }
    }

    /// Kinds whose agent leaves nothing to undo once it exits.
    ///
    /// Killing a container or a node cannot be rolled back, so the agent
    /// finalizer never has to wait for a clean exit.
    pub fn has_no_side_effects(&self) -> bool {
        matches!(self, FaultKind::ContainerFailure | FaultKind::NodeFailure)
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FaultKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FaultKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown fault kind {s:?}"))
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// A host (IP, CIDR or hostname) with optional port and protocol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostSpec {
    #[serde(default)]
    pub host: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

impl HostSpec {
    pub fn new(host: &str, port: Option<u16>) -> Self {
        Self {
            host: host.to_string(),
            port,
            protocol: None,
        }
    }

    /// `host;port;protocol` as the agent expects it.
    pub fn to_arg(&self) -> String {
        format!(
            "{};{};{}",
            self.host,
            self.port.unwrap_or(0),
            self.protocol.as_deref().unwrap_or("")
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkFault {
    pub hosts: Vec<HostSpec>,
    pub allowed_hosts: Vec<HostSpec>,

    /// In-cluster services, `namespace/name`.
    pub services: Vec<String>,

    /// Cloud provider services resolved through the IP range catalog.
    pub cloud_services: Vec<String>,

    pub drop: u8,
    pub duplicate: u8,
    pub corrupt: u8,
    pub delay_ms: u32,
    pub delay_jitter: u8,
    pub bandwidth_limit: u64,
    pub disable_default_allowed_hosts: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CpuPressureFault {
    /// Cores to stress; all of them when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<Count>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryPressureFault {
    pub target_percent: u8,

    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub ramp_duration: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskPressureFault {
    pub path: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_bytes_per_sec: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_bytes_per_sec: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskFailureFault {
    pub paths: Vec<String>,

    /// Share of matching syscalls that fail, `0..=100`.
    #[serde(default = "default_probability")]
    pub probability: u8,
}

fn default_probability() -> u8 {
    100
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsRecord {
    pub hostname: String,

    /// `A` or `CNAME`.
    pub record_type: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsFault {
    pub records: Vec<DnsRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrpcEndpointAlteration {
    pub endpoint: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, rename = "override", skip_serializing_if = "Option::is_none")]
    pub override_with: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_percent: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrpcFault {
    pub port: u16,
    pub endpoints: Vec<GrpcEndpointAlteration>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerFailureFault {
    /// SIGKILL instead of SIGTERM.
    pub forced: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeFailureFault {
    /// Power the node off instead of rebooting it.
    pub shutdown: bool,
}

// =============================================================================
// Fault
// =============================================================================

/// One fault declared by a disruption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Fault {
    Network(NetworkFault),
    CpuPressure(CpuPressureFault),
    MemoryPressure(MemoryPressureFault),
    DiskPressure(DiskPressureFault),
    DiskFailure(DiskFailureFault),
    Dns(DnsFault),
    Grpc(GrpcFault),
    ContainerFailure(ContainerFailureFault),
    NodeFailure(NodeFailureFault),
}

impl Fault {
    pub fn kind(&self) -> FaultKind {
        match self {
            Fault::Network(_) => FaultKind::Network,
            Fault::CpuPressure(_) => FaultKind::CpuPressure,
            Fault::MemoryPressure(_) => FaultKind::MemoryPressure,
            Fault::DiskPressure(_) => FaultKind::DiskPressure,
            Fault::DiskFailure(_) => FaultKind::DiskFailure,
            Fault::Dns(_) => FaultKind::Dns,
            Fault::Grpc(_) => FaultKind::Grpc,
            Fault::ContainerFailure(_) => FaultKind::ContainerFailure,
            Fault::NodeFailure(_) => FaultKind::NodeFailure,
        }
    }

    /// Check the parameters of this fault.
    pub fn validate(&self) -> Result<(), FaultError> {
        let kind = self.kind();
        let percent = |name: &str, value: u8| {
            if value > 100 {
                Err(FaultError::new(kind, format!("{name} must be within 0..=100, got {value}")))
            } else {
                Ok(())
            }
        };

        match self {
            Fault::Network(n) => {
                percent("drop", n.drop)?;
                percent("duplicate", n.duplicate)?;
                percent("corrupt", n.corrupt)?;
                percent("delayJitter", n.delay_jitter)?;
                if n.drop == 0
                    && n.duplicate == 0
                    && n.corrupt == 0
                    && n.delay_ms == 0
                    && n.bandwidth_limit == 0
                {
                    return Err(FaultError::new(kind, "no effect is configured"));
                }
                if let Some(bad) = n.services.iter().find(|s| s.split('/').count() != 2) {
                    return Err(FaultError::new(
                        kind,
                        format!("service {bad:?} must be written namespace/name"),
                    ));
                }
                Ok(())
            }
            Fault::CpuPressure(_) | Fault::ContainerFailure(_) | Fault::NodeFailure(_) => Ok(()),
            Fault::MemoryPressure(m) => {
                if m.target_percent == 0 || m.target_percent > 100 {
                    return Err(FaultError::new(kind, "targetPercent must be within 1..=100"));
                }
                Ok(())
            }
            Fault::DiskPressure(d) => {
                if d.path.is_empty() {
                    return Err(FaultError::new(kind, "path is required"));
                }
                if d.read_bytes_per_sec.is_none() && d.write_bytes_per_sec.is_none() {
                    return Err(FaultError::new(kind, "at least one throttle is required"));
                }
                Ok(())
            }
            Fault::DiskFailure(d) => {
                if d.paths.is_empty() || d.paths.iter().any(String::is_empty) {
                    return Err(FaultError::new(kind, "paths must be non-empty"));
                }
                percent("probability", d.probability)
            }
            Fault::Dns(d) => {
                if d.records.is_empty() {
                    return Err(FaultError::new(kind, "at least one record is required"));
                }
                match d
                    .records
                    .iter()
                    .find(|r| !matches!(r.record_type.as_str(), "A" | "CNAME"))
                {
                    Some(r) => Err(FaultError::new(
                        kind,
                        format!("record type {:?} is not supported", r.record_type),
                    )),
                    None => Ok(()),
                }
            }
            Fault::Grpc(g) => {
                if g.endpoints.is_empty() {
                    return Err(FaultError::new(kind, "at least one endpoint is required"));
                }
                for e in &g.endpoints {
                    if e.error.is_some() == e.override_with.is_some() {
                        return Err(FaultError::new(
                            kind,
                            format!("endpoint {} needs exactly one of error or override", e.endpoint),
                        ));
                    }
                    percent("queryPercent", e.query_percent.unwrap_or(0))?;
                }
                Ok(())
            }
        }
    }

    /// Kind-specific agent arguments.
    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::new();
        let mut push = |flag: &str, value: String| {
            args.push(flag.to_string());
            args.push(value);
        };

        match self {
            Fault::Network(n) => {
                for host in &n.hosts {
                    push("--hosts", host.to_arg());
                }
                for service in &n.services {
                    push("--services", service.clone());
                }
                for host in &n.allowed_hosts {
                    push("--allowed-hosts", host.to_arg());
                }
                push("--drop", n.drop.to_string());
                push("--duplicate", n.duplicate.to_string());
                push("--corrupt", n.corrupt.to_string());
                push("--delay", n.delay_ms.to_string());
                push("--delay-jitter", n.delay_jitter.to_string());
                push("--bandwidth-limit", n.bandwidth_limit.to_string());
            }
            Fault::CpuPressure(c) => {
                if let Some(count) = c.count {
                    push("--count", count.to_string());
                }
            }
            Fault::MemoryPressure(m) => {
                push("--target-percent", m.target_percent.to_string());
                if let Some(ramp) = m.ramp_duration {
                    push("--ramp-duration", humantime::format_duration(ramp).to_string());
                }
            }
            Fault::DiskPressure(d) => {
                push("--path", d.path.clone());
                if let Some(read) = d.read_bytes_per_sec {
                    push("--read-bytes-per-sec", read.to_string());
                }
                if let Some(write) = d.write_bytes_per_sec {
                    push("--write-bytes-per-sec", write.to_string());
                }
            }
            Fault::DiskFailure(d) => {
                for path in &d.paths {
                    push("--path", path.clone());
                }
                push("--probability", d.probability.to_string());
            }
            Fault::Dns(d) => {
                for r in &d.records {
                    push(
                        "--host-record-pairs",
                        format!("{};{};{}", r.hostname, r.record_type, r.value),
                    );
                }
            }
            Fault::Grpc(g) => {
                push("--port", g.port.to_string());
                for e in &g.endpoints {
                    let (field, value) = match (&e.error, &e.override_with) {
                        (Some(error), _) => ("error", error.as_str()),
                        (None, Some(over)) => ("override", over.as_str()),
                        (None, None) => ("error", ""),
                    };
                    push(
                        "--endpoint-alterations",
                        format!(
                            "{};{}:{};{}",
                            e.endpoint,
                            field,
                            value,
                            e.query_percent.unwrap_or(0)
                        ),
                    );
                }
            }
            Fault::ContainerFailure(c) => {
                if c.forced {
                    args.push("--forced".to_string());
                }
            }
            Fault::NodeFailure(n) => {
                if n.shutdown {
                    args.push("--shutdown".to_string());
                }
            }
        }

        args
    }

    /// Cloud services the agent needs resolved into IP ranges.
    pub fn cloud_services(&self) -> &[String] {
        match self {
            Fault::Network(n) => &n.cloud_services,
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network(drop: u8) -> Fault {
        Fault::Network(NetworkFault {
            hosts: vec![HostSpec::new("10.0.0.0/8", Some(443))],
            drop,
            ..Default::default()
        })
    }

    #[test]
    fn test_kind_names_roundtrip() {
        for kind in FaultKind::ALL {
            assert_eq!(kind.as_str().parse::<FaultKind>().unwrap(), kind);
        }
        assert!("cpu".parse::<FaultKind>().is_err());
    }

    #[test]
    fn test_side_effect_free_kinds() {
        let free: Vec<_> = FaultKind::ALL
            .into_iter()
            .filter(FaultKind::has_no_side_effects)
            .collect();
        assert_eq!(free, vec![FaultKind::ContainerFailure, FaultKind::NodeFailure]);
    }

    #[test]
    fn test_tagged_serialization() {
        let fault: Fault = serde_json::from_value(serde_json::json!({
            "kind": "memory-pressure",
            "targetPercent": 80,
            "rampDuration": "30s"
        }))
        .unwrap();

        assert_eq!(fault.kind(), FaultKind::MemoryPressure);
        assert_eq!(
            fault.args(),
            vec!["--target-percent", "80", "--ramp-duration", "30s"]
        );
    }

    #[test]
    fn test_network_validation() {
        assert!(network(50).validate().is_ok());
        assert_eq!(
            network(0).validate().unwrap_err().to_string(),
            "network fault: no effect is configured"
        );
        assert!(network(101).validate().is_err());
    }

    #[test]
    fn test_network_args() {
        let args = network(25).args();
        assert_eq!(&args[..2], ["--hosts", "10.0.0.0/8;443;"]);
        assert!(args.windows(2).any(|w| w == ["--drop", "25"]));
    }

    #[test]
    fn test_grpc_requires_single_alteration() {
        let both = Fault::Grpc(GrpcFault {
            port: 50051,
            endpoints: vec![GrpcEndpointAlteration {
                endpoint: "/svc/Method".to_string(),
                error: Some("NOT_FOUND".to_string()),
                override_with: Some("{}".to_string()),
                query_percent: None,
            }],
        });
        assert!(both.validate().is_err());
    }

    #[test]
    fn test_side_effect_free_faults_have_flags() {
        assert_eq!(
            Fault::ContainerFailure(ContainerFailureFault { forced: true }).args(),
            vec!["--forced"]
        );
        assert!(Fault::NodeFailure(NodeFailureFault::default()).args().is_empty());
    }
}
