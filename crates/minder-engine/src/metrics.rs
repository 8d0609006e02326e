//! Prometheus metrics for the entity pipeline.
//!
//! One [`EngineMetrics`] handle is shared by every handler and the
//! executor gate. Metrics register against a caller-owned
//! [`prometheus::Registry`] so embedding daemons control the scrape
//! surface.

use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, IntGauge, Opts, Registry, TextEncoder,
};
use thiserror::Error;

/// Histogram buckets for evaluation latency, in seconds.
pub const EVALUATION_BUCKETS: &[f64] = &[0.005, 0.025, 0.1, 0.5, 1.0, 5.0, 30.0];

/// Errors raised registering or encoding metrics.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MetricsError {
    /// A metric failed to register, e.g. a duplicate name.
    #[error("failed to register metric: {0}")]
    Registration(#[from] prometheus::Error),

    /// Encoding the scrape output failed.
    #[error("failed to encode metrics: {0}")]
    Encoding(String),
}

/// Pipeline metrics. Cheap to clone; all clones share the series.
#[derive(Clone)]
pub struct EngineMetrics {
    /// Messages seen per topic, labeled by outcome
    /// (`ok`/`dropped`/`error`).
    messages_total: CounterVec,

    /// Evaluation executions, labeled by outcome
    /// (`ok`/`failed`/`duplicate`).
    executions_total: CounterVec,

    /// Executions currently holding the per-entity latch.
    executions_in_flight: IntGauge,

    /// Wall time of one evaluation, labeled by entity type.
    evaluation_seconds: HistogramVec,

    /// Property reads served from the store versus refetched
    /// (`hit`/`stale`/`miss`).
    property_cache_total: CounterVec,

    /// Provider fetches, labeled by entity type.
    provider_fetches_total: CounterVec,
}

impl EngineMetrics {
    /// Creates the pipeline metrics and registers them on `registry`.
    pub fn new(registry: &Registry) -> Result<Self, MetricsError> {
        let messages_total = CounterVec::new(
            Opts::new(
                "minder_engine_messages_total",
                "Messages handled per topic",
            ),
            &["topic", "outcome"],
        )?;
        registry.register(Box::new(messages_total.clone()))?;

        let executions_total = CounterVec::new(
            Opts::new(
                "minder_engine_executions_total",
                "Evaluation executions by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(executions_total.clone()))?;

        let executions_in_flight = IntGauge::new(
            "minder_engine_executions_in_flight",
            "Executions currently holding the per-entity latch",
        )?;
        registry.register(Box::new(executions_in_flight.clone()))?;

        let evaluation_seconds = HistogramVec::new(
            HistogramOpts::new(
                "minder_engine_evaluation_seconds",
                "Wall time of one evaluation",
            )
            .buckets(EVALUATION_BUCKETS.to_vec()),
            &["entity_type"],
        )?;
        registry.register(Box::new(evaluation_seconds.clone()))?;

        let property_cache_total = CounterVec::new(
            Opts::new(
                "minder_engine_property_cache_total",
                "Property reads by cache outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(property_cache_total.clone()))?;

        let provider_fetches_total = CounterVec::new(
            Opts::new(
                "minder_engine_provider_fetches_total",
                "Provider fetches by entity type",
            ),
            &["entity_type"],
        )?;
        registry.register(Box::new(provider_fetches_total.clone()))?;

        Ok(Self {
            messages_total,
            executions_total,
            executions_in_flight,
            evaluation_seconds,
            property_cache_total,
            provider_fetches_total,
        })
    }

    /// Records the outcome of one handled message.
    pub fn message_handled(&self, topic: &str, outcome: &str) {
        self.messages_total
            .with_label_values(&[topic, outcome])
            .inc();
    }

    /// Records an admitted execution starting.
    pub fn execution_started(&self) {
        self.executions_in_flight.inc();
    }

    /// Records an execution finishing with the given outcome.
    pub fn execution_finished(&self, outcome: &str) {
        self.executions_in_flight.dec();
        self.executions_total.with_label_values(&[outcome]).inc();
    }

    /// Records a duplicate that was dropped at the gate.
    pub fn execution_deduplicated(&self) {
        self.executions_total
            .with_label_values(&["duplicate"])
            .inc();
    }

    /// Observes the wall time of one evaluation.
    pub fn observe_evaluation(&self, entity_type: &str, seconds: f64) {
        self.evaluation_seconds
            .with_label_values(&[entity_type])
            .observe(seconds);
    }

    /// Records a property read served from the store (`hit`), served
    /// despite staleness (`stale`), or refetched (`miss`).
    pub fn property_cache(&self, outcome: &str) {
        self.property_cache_total
            .with_label_values(&[outcome])
            .inc();
    }

    /// Records one provider fetch.
    pub fn provider_fetch(&self, entity_type: &str) {
        self.provider_fetches_total
            .with_label_values(&[entity_type])
            .inc();
    }

    /// Current messages counter for a topic and outcome; test hook.
    #[must_use]
    pub fn messages(&self, topic: &str, outcome: &str) -> f64 {
        self.messages_total
            .with_label_values(&[topic, outcome])
            .get()
    }
}

/// Encodes every metric on `registry` in Prometheus text format.
pub fn encode_text(registry: &Registry) -> Result<String, MetricsError> {
    let mut buf = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buf)
        .map_err(MetricsError::Registration)?;
    String::from_utf8(buf).map_err(|e| MetricsError::Encoding(e.to_string()))
}
