//! Cloud provider IP ranges.
//!
//! Network faults may target a cloud service by name (e.g. `aws/s3`); the
//! catalog maps those names to the CIDR blocks handed to the agent.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::{ControllerError, ControllerResult};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IpRangeCatalog {
    #[serde(flatten)]
    services: BTreeMap<String, Vec<String>>,
}

impl IpRangeCatalog {
    pub fn new(services: BTreeMap<String, Vec<String>>) -> Self {
        Self { services }
    }

    /// Load a JSON object of `service -> [cidr]`.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// CIDR blocks of a service.
    ///
    /// An unknown service is a configuration error: the disruption cannot be
    /// injected as declared.
    pub fn resolve(&self, service: &str) -> ControllerResult<&[String]> {
        self.services
            .get(service)
            .map(Vec::as_slice)
            .ok_or_else(|| {
                ControllerError::Config(format!("no IP ranges known for cloud service {service:?}"))
            })
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
