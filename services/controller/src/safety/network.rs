//! Refuse network faults whose scope is every flow.

use async_trait::async_trait;

use super::{SafetyNet, SafetyNetError, SafetyVerdict};
use crate::model::disruption::UnsafeMode;
use crate::model::{Disruption, Fault};
use crate::platform::Platform;

pub struct NeitherHostNorPort;

#[async_trait]
impl SafetyNet for NeitherHostNorPort {
    fn name(&self) -> &'static str {
        "neither-host-nor-port"
    }

    fn disabled_by(&self, unsafe_mode: &UnsafeMode) -> bool {
        unsafe_mode.disable_neither_host_nor_port
    }

    async fn check(
        &self,
        disruption: &Disruption,
        _platform: &dyn Platform,
    ) -> Result<SafetyVerdict, SafetyNetError> {
        for fault in &disruption.spec.faults {
            let Fault::Network(network) = fault else {
                continue;
            };

            let unscoped = network.hosts.is_empty()
                && network.services.is_empty()
                && network.cloud_services.is_empty();
            if unscoped {
                return Ok(SafetyVerdict::Tripped(
                    "network fault names no host, service or cloud service and would hit all traffic"
                        .to_string(),
                ));
            }

            let catch_all = network
                .hosts
                .iter()
                .find(|h| h.host.trim().is_empty() && h.port.unwrap_or(0) == 0);
            if catch_all.is_some() {
                return Ok(SafetyVerdict::Tripped(
                    "a network host entry has neither a host nor a port".to_string(),
                ));
            }
        }

        Ok(SafetyVerdict::Passed)
    }
}
