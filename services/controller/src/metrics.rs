//! Metrics emission.
//!
//! Sinks implement [`MetricsSink`]; the controller talks to them through
//! [`Metrics`], whose helpers never fail: a sink error is logged and
//! dropped so a metrics outage cannot stall reconciliation.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::config::MetricsSinkKind;

const PREFIX: &str = "faultline.controller.";

#[derive(Debug, Error)]
#[error("metrics sink {sink} failed to emit {metric}: {reason}")]
pub struct MetricsError {
    pub sink: &'static str,
    pub metric: String,
    pub reason: String,
}

pub type Tags<'a> = &'a [(&'a str, &'a str)];

pub trait MetricsSink: Send + Sync {
    fn name(&self) -> &'static str;

    fn incr(&self, metric: &str, tags: Tags<'_>) -> Result<(), MetricsError>;

    fn timing(&self, metric: &str, value: Duration, tags: Tags<'_>) -> Result<(), MetricsError>;

    fn gauge(&self, metric: &str, value: f64, tags: Tags<'_>) -> Result<(), MetricsError>;
}

/// Writes samples to the log at debug level.
#[derive(Debug, Default)]
pub struct LogSink;

fn format_tags(tags: Tags<'_>) -> String {
    tags.iter()
        .map(|(k, v)| format!("{k}:{v}"))
        .collect::<Vec<_>>()
        .join(",")
}

impl MetricsSink for LogSink {
    fn name(&self) -> &'static str {
        "log"
    }

    fn incr(&self, metric: &str, tags: Tags<'_>) -> Result<(), MetricsError> {
        debug!(metric, tags = %format_tags(tags), "counter");
        Ok(())
    }

    fn timing(&self, metric: &str, value: Duration, tags: Tags<'_>) -> Result<(), MetricsError> {
        debug!(metric, ms = value.as_millis() as u64, tags = %format_tags(tags), "timing");
        Ok(())
    }

    fn gauge(&self, metric: &str, value: f64, tags: Tags<'_>) -> Result<(), MetricsError> {
        debug!(metric, value, tags = %format_tags(tags), "gauge");
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn incr(&self, _: &str, _: Tags<'_>) -> Result<(), MetricsError> {
        Ok(())
    }

    fn timing(&self, _: &str, _: Duration, _: Tags<'_>) -> Result<(), MetricsError> {
        Ok(())
    }

    fn gauge(&self, _: &str, _: f64, _: Tags<'_>) -> Result<(), MetricsError> {
        Ok(())
    }
}

/// A recorded sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub metric: String,
    pub value: f64,
    pub tags: Vec<(String, String)>,
}

/// Keeps samples in memory so tests can assert on them.
#[derive(Debug, Default)]
pub struct MemorySink {
    samples: Mutex<Vec<Sample>>,
}

impl MemorySink {
    fn push(&self, metric: &str, value: f64, tags: Tags<'_>) -> Result<(), MetricsError> {
        let mut samples = self.samples.lock().map_err(|_| MetricsError {
            sink: "memory",
            metric: metric.to_string(),
            reason: "sample buffer poisoned".to_string(),
        })?;
        samples.push(Sample {
            metric: metric.to_string(),
            value,
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        });
        Ok(())
    }

    pub fn samples(&self) -> Vec<Sample> {
        self.samples.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Number of counter increments recorded for a metric.
    pub fn count(&self, metric: &str) -> usize {
        let full = format!("{PREFIX}{metric}");
        self.samples()
            .iter()
            .filter(|s| s.metric == full)
            .count()
    }
}

impl MetricsSink for MemorySink {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn incr(&self, metric: &str, tags: Tags<'_>) -> Result<(), MetricsError> {
        self.push(metric, 1.0, tags)
    }

    fn timing(&self, metric: &str, value: Duration, tags: Tags<'_>) -> Result<(), MetricsError> {
        self.push(metric, value.as_secs_f64() * 1000.0, tags)
    }

    fn gauge(&self, metric: &str, value: f64, tags: Tags<'_>) -> Result<(), MetricsError> {
        self.push(metric, value, tags)
    }
}

/// Domain-level metric helpers.
#[derive(Clone)]
pub struct Metrics {
    sink: Arc<dyn MetricsSink>,
}

impl Metrics {
    pub fn new(sink: Arc<dyn MetricsSink>) -> Self {
        Self { sink }
    }

    pub fn from_kind(kind: MetricsSinkKind) -> Self {
        match kind {
            MetricsSinkKind::Log => Self::new(Arc::new(LogSink)),
            MetricsSinkKind::Noop => Self::new(Arc::new(NoopSink)),
        }
    }

    pub fn noop() -> Self {
        Self::new(Arc::new(NoopSink))
    }

    fn report(&self, result: Result<(), MetricsError>) {
        if let Err(e) = result {
            warn!(sink = self.sink.name(), error = %e, "Failed to emit metric");
        }
    }

    fn incr(&self, metric: &str, tags: Tags<'_>) {
        self.report(self.sink.incr(&format!("{PREFIX}{metric}"), tags));
    }

    fn timing(&self, metric: &str, value: Duration, tags: Tags<'_>) {
        self.report(self.sink.timing(&format!("{PREFIX}{metric}"), value, tags));
    }

    fn gauge(&self, metric: &str, value: f64, tags: Tags<'_>) {
        self.report(self.sink.gauge(&format!("{PREFIX}{metric}"), value, tags));
    }

    pub fn reconcile(&self, disruption: &str) {
        self.incr("reconcile", &[("disruption", disruption)]);
    }

    pub fn reconcile_duration(&self, disruption: &str, elapsed: Duration) {
        self.timing("reconcile.duration", elapsed, &[("disruption", disruption)]);
    }

    pub fn agent_created(&self, disruption: &str, target: &str, kind: &str, succeeded: bool) {
        let status = if succeeded { "succeed" } else { "failed" };
        self.incr(
            "agents.created",
            &[
                ("disruption", disruption),
                ("target", target),
                ("kind", kind),
                ("status", status),
            ],
        );
    }

    pub fn injected(&self, disruption: &str, status: &str) {
        self.incr("injected", &[("disruption", disruption), ("status", status)]);
    }

    pub fn stuck_on_removal(&self, disruption: &str) {
        self.incr("stuck_on_removal", &[("disruption", disruption)]);
    }

    pub fn orphan_found(&self, disruption: &str, agent: &str) {
        self.incr("orphan.found", &[("disruption", disruption), ("agent", agent)]);
    }

    pub fn selector_cache_triggered(&self, disruption: &str, change: &str) {
        self.incr(
            "selector.cache.triggered",
            &[("disruption", disruption), ("change", change)],
        );
    }

    pub fn cleaned_up(&self, disruption: &str, lifetime: Duration) {
        self.incr("cleaned_up", &[("disruption", disruption)]);
        self.timing("disruption.lifetime", lifetime, &[("disruption", disruption)]);
    }

    pub fn watchers(&self, count: usize) {
        self.gauge("watchers", count as f64, &[]);
    }
}
