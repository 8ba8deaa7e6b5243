//! User-visible event recording.
//!
//! Recording is best effort: a failed write is logged and dropped.

use std::sync::Arc;

use faultline_events::{Event, EventReason, MessageScope, ObjectRef};
use tracing::warn;

use crate::model::Disruption;
use crate::platform::Platform;

#[derive(Clone)]
pub struct Recorder {
    platform: Arc<dyn Platform>,
}

impl Recorder {
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self { platform }
    }

    pub async fn record(&self, event: Event) {
        let involved = event.involved.clone();
        let reason = event.reason.clone();
        if let Err(e) = self.platform.record_event(event).await {
            warn!(object = %involved, reason, error = %e, "Failed to record event");
        }
    }

    /// Record `reason` on the disruption, rendering its disruption message.
    pub async fn disruption(&self, disruption: &Disruption, reason: EventReason, vars: &[(&str, &str)]) {
        let mut all = vec![("disruption", disruption.name())];
        all.extend_from_slice(vars);
        let message = reason
            .message(MessageScope::Disruption, &all)
            .unwrap_or_default();
        self.record(Event::new(disruption.object_ref(), reason, message))
            .await;
    }

    /// Record `reason` on a target, when the reason has a target message.
    pub async fn target(
        &self,
        target: ObjectRef,
        disruption: &Disruption,
        reason: EventReason,
        vars: &[(&str, &str)],
    ) {
        let mut all = vec![("disruption", disruption.name())];
        all.extend_from_slice(vars);
        if let Some(message) = reason.message(MessageScope::Target, &all) {
            self.record(
                Event::new(target, reason, message)
                    .with_annotation("disruption-name", disruption.name())
                    .with_annotation("disruption-namespace", disruption.namespace()),
            )
            .await;
        }
    }
}
