//! Pipeline assembly: topics, handlers, executor, shutdown.

use std::sync::Arc;

use minder_core::events::{
    Message, TOPIC_ENTITY_EVALUATE, TOPIC_GET_ENTITY_AND_DELETE, TOPIC_ORIGINATING_ENTITY_ADD,
    TOPIC_ORIGINATING_ENTITY_DELETE, TOPIC_RECONCILE_ENTITY_DELETE,
    TOPIC_REFRESH_ENTITY_AND_EVALUATE, TOPIC_REFRESH_ENTITY_BY_ID_AND_EVALUATE,
};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::EngineConfig;
use crate::executor::{Evaluator, ExecutorGate};
use crate::handlers::{
    AddOriginatingEntityStrategy, CreateMessageStrategy, DelOriginatingEntityStrategy, EntityHandler,
    GetEntityByUpstreamIdStrategy, RefreshByIdStrategy, RefreshByUpstreamPropsStrategy, ToEmpty,
    ToEntityDeleteEvent, ToEntityEnvelope,
};
use crate::metrics::{EngineMetrics, MetricsError};
use crate::providers::ProviderManager;
use crate::router::{RouterError, TopicRouter};
use crate::service::PropertiesService;
use crate::store::Database;

/// Errors raised assembling the pipeline.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PipelineError {
    /// Metric registration failed.
    #[error(transparent)]
    Metrics(#[from] MetricsError),
}

/// A running entity pipeline.
///
/// Owns the router, the five topic handlers and the executor gate.
/// Dropping the pipeline without calling [`Pipeline::shutdown`] aborts
/// nothing; workers keep draining until the router closes.
pub struct Pipeline {
    router: Arc<TopicRouter>,
    service: Arc<PropertiesService>,
    gate: Arc<ExecutorGate>,
    workers: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// Assembles and starts the pipeline.
    ///
    /// Handlers and the executor gate are subscribed before this returns,
    /// so a publish immediately afterwards cannot be lost.
    pub async fn start(
        db: Database,
        providers: Arc<ProviderManager>,
        evaluator: Arc<dyn Evaluator>,
        config: &EngineConfig,
        registry: &prometheus::Registry,
    ) -> Result<Self, PipelineError> {
        let metrics = EngineMetrics::new(registry)?;
        let router = TopicRouter::new(config.router.queue_depth, config.router.wait_for_ack);
        let service = Arc::new(
            PropertiesService::new(db.clone(), config.cache.ttl()).with_metrics(metrics.clone()),
        );

        let envelope_creator: Arc<dyn CreateMessageStrategy> = Arc::new(ToEntityEnvelope::new(
            Arc::clone(&service),
            Arc::clone(&providers),
        ));

        let handlers = [
            EntityHandler::new(
                TOPIC_REFRESH_ENTITY_AND_EVALUATE,
                TOPIC_ENTITY_EVALUATE,
                Arc::new(RefreshByUpstreamPropsStrategy::new(
                    Arc::clone(&service),
                    Arc::clone(&providers),
                )),
                Arc::clone(&envelope_creator),
                db.clone(),
                Arc::clone(&router),
                metrics.clone(),
            ),
            EntityHandler::new(
                TOPIC_REFRESH_ENTITY_BY_ID_AND_EVALUATE,
                TOPIC_ENTITY_EVALUATE,
                Arc::new(RefreshByIdStrategy::new(
                    Arc::clone(&service),
                    Arc::clone(&providers),
                )),
                Arc::clone(&envelope_creator),
                db.clone(),
                Arc::clone(&router),
                metrics.clone(),
            ),
            EntityHandler::new(
                TOPIC_GET_ENTITY_AND_DELETE,
                TOPIC_RECONCILE_ENTITY_DELETE,
                Arc::new(GetEntityByUpstreamIdStrategy::new(
                    Arc::clone(&service),
                    Arc::clone(&providers),
                )),
                Arc::new(ToEntityDeleteEvent),
                db.clone(),
                Arc::clone(&router),
                metrics.clone(),
            ),
            EntityHandler::new(
                TOPIC_ORIGINATING_ENTITY_ADD,
                TOPIC_ENTITY_EVALUATE,
                Arc::new(AddOriginatingEntityStrategy::new(
                    Arc::clone(&service),
                    Arc::clone(&providers),
                    db.clone(),
                )),
                Arc::clone(&envelope_creator),
                db.clone(),
                Arc::clone(&router),
                metrics.clone(),
            ),
            EntityHandler::new(
                TOPIC_ORIGINATING_ENTITY_DELETE,
                TOPIC_ENTITY_EVALUATE,
                Arc::new(DelOriginatingEntityStrategy::new(
                    Arc::clone(&service),
                    Arc::clone(&providers),
                    db.clone(),
                )),
                Arc::new(ToEmpty),
                db.clone(),
                Arc::clone(&router),
                metrics.clone(),
            ),
        ];

        let mut workers = Vec::new();
        for handler in handlers {
            let rx = router.subscribe(handler.topic()).await;
            workers.push(tokio::spawn(Arc::new(handler).run(rx)));
        }

        let gate = Arc::new(ExecutorGate::new(
            evaluator,
            Arc::clone(&router),
            metrics,
        ));
        let rx = router.subscribe(TOPIC_ENTITY_EVALUATE).await;
        workers.push(tokio::spawn(Arc::clone(&gate).run(rx)));

        info!(workers = workers.len(), "entity pipeline started");
        Ok(Self {
            router,
            service,
            gate,
            workers,
        })
    }

    /// Publishes a message onto an inbound topic.
    pub async fn publish(&self, topic: &str, message: Message) -> Result<(), RouterError> {
        self.router.publish(topic, message).await
    }

    /// Registers an external subscriber, e.g. for the flush topic.
    pub async fn subscribe(&self, topic: &str) -> tokio::sync::mpsc::Receiver<crate::router::Delivery> {
        self.router.subscribe(topic).await
    }

    /// The shared property service.
    #[must_use]
    pub fn service(&self) -> Arc<PropertiesService> {
        Arc::clone(&self.service)
    }

    /// Waits until no evaluation is in flight.
    pub async fn wait_idle(&self) {
        self.gate.wait().await;
    }

    /// Stops intake, drains every queue and joins the workers.
    pub async fn shutdown(self) {
        self.router.close().await;
        for worker in self.workers {
            // A worker that panicked already logged through the panic hook.
            let _ = worker.await;
        }
        self.gate.wait().await;
        info!("entity pipeline stopped");
    }
}
