//! Evaluation admission gate.
//!
//! The gate sits between the evaluate topic and the profile evaluator. It
//! keeps at most one execution in flight per entity, stamps each admitted
//! envelope with a fresh execution id, and forwards the stamped envelope to
//! the flush topic once evaluation finishes. Duplicates that arrive while
//! an entity is in flight are dropped, not queued.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use minder_core::events::envelope::{EntityEnvelope, EnvelopeError};
use minder_core::events::{Message, TOPIC_ENTITY_FLUSH};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use crate::metrics::EngineMetrics;
use crate::router::{Delivery, RouterError, TopicRouter};

/// Errors raised by the executor gate.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExecutorError {
    /// The envelope could not be decoded.
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    /// The envelope carries no internal entity id.
    #[error("envelope carries no entity id")]
    MissingEntityId,

    /// Profile evaluation failed.
    #[error("evaluation failed: {message}")]
    Evaluation {
        /// Evaluator-supplied failure description.
        message: String,
    },

    /// Forwarding to the flush topic failed.
    #[error(transparent)]
    Router(#[from] RouterError),

    /// The in-flight latch was poisoned.
    #[error("in-flight latch poisoned")]
    Poisoned,
}

/// Evaluates profiles against one admitted entity.
#[async_trait]
pub trait Evaluator: Send + Sync {
    /// Runs evaluation for the envelope; the execution id is already
    /// stamped.
    async fn evaluate(&self, envelope: &EntityEnvelope) -> Result<(), ExecutorError>;
}

struct InFlight {
    entities: Mutex<HashSet<Uuid>>,
    count_tx: watch::Sender<usize>,
}

/// Releases the latch for one entity, including on panic unwind.
struct LatchGuard {
    in_flight: Arc<InFlight>,
    entity_id: Uuid,
}

impl Drop for LatchGuard {
    fn drop(&mut self) {
        if let Ok(mut entities) = self.in_flight.entities.lock() {
            entities.remove(&self.entity_id);
            let _ = self.in_flight.count_tx.send(entities.len());
        }
    }
}

/// Serializes evaluation per entity and forwards completions to flush.
pub struct ExecutorGate {
    evaluator: Arc<dyn Evaluator>,
    router: Arc<TopicRouter>,
    in_flight: Arc<InFlight>,
    count_rx: watch::Receiver<usize>,
    metrics: EngineMetrics,
}

impl ExecutorGate {
    /// Builds the gate around an evaluator and the outbound router.
    #[must_use]
    pub fn new(
        evaluator: Arc<dyn Evaluator>,
        router: Arc<TopicRouter>,
        metrics: EngineMetrics,
    ) -> Self {
        let (count_tx, count_rx) = watch::channel(0);
        Self {
            evaluator,
            router,
            in_flight: Arc::new(InFlight {
                entities: Mutex::new(HashSet::new()),
                count_tx,
            }),
            count_rx,
            metrics,
        }
    }

    /// Consumes deliveries from the evaluate topic until it ends.
    pub async fn run(self: Arc<Self>, mut rx: tokio::sync::mpsc::Receiver<Delivery>) {
        while let Some(delivery) = rx.recv().await {
            if let Err(err) = self.handle(&delivery.message).await {
                error!(uuid = %delivery.message.uuid, %err, "evaluation message failed");
            }
            delivery.ack();
        }
        debug!("executor subscription ended");
    }

    /// Admits one envelope: latch, stamp, evaluate, flush.
    #[instrument(skip_all)]
    pub async fn handle(&self, message: &Message) -> Result<(), ExecutorError> {
        let envelope = EntityEnvelope::from_message(message)?;
        let entity_id = envelope.entity_id.ok_or(ExecutorError::MissingEntityId)?;

        let guard = match self.latch(entity_id)? {
            Some(guard) => guard,
            None => {
                self.metrics.execution_deduplicated();
                info!(%entity_id, "evaluation already in flight, dropping duplicate");
                return Ok(());
            }
        };
        self.metrics.execution_started();

        let execution_id = Uuid::new_v4();
        let stamped = envelope.with_execution_id(execution_id);
        debug!(%entity_id, %execution_id, "execution admitted");

        // Flush must go out even when evaluation fails, so downstream
        // bookkeeping for this execution id is always closed out.
        let started = std::time::Instant::now();
        let outcome = self.evaluator.evaluate(&stamped).await;
        self.metrics.observe_evaluation(
            stamped.entity_type().as_str(),
            started.elapsed().as_secs_f64(),
        );
        self.metrics
            .execution_finished(if outcome.is_ok() { "ok" } else { "failed" });
        if let Err(err) = &outcome {
            error!(%entity_id, %execution_id, %err, "evaluation failed");
        }
        self.router
            .publish(TOPIC_ENTITY_FLUSH, stamped.to_message())
            .await?;
        drop(guard);
        outcome
    }

    /// Waits until no executions are in flight.
    pub async fn wait(&self) {
        let mut rx = self.count_rx.clone();
        while *rx.borrow() != 0 {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn latch(&self, entity_id: Uuid) -> Result<Option<LatchGuard>, ExecutorError> {
        let mut entities = self
            .in_flight
            .entities
            .lock()
            .map_err(|_| ExecutorError::Poisoned)?;
        if !entities.insert(entity_id) {
            return Ok(None);
        }
        let _ = self.in_flight.count_tx.send(entities.len());
        drop(entities);
        Ok(Some(LatchGuard {
            in_flight: Arc::clone(&self.in_flight),
            entity_id,
        }))
    }
}
