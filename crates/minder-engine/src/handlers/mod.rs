//! Reconciliation topic handlers.
//!
//! Every inbound topic is served by one [`EntityHandler`], which is the
//! composition of a get strategy (how the entity is resolved or mutated)
//! and a message strategy (what, if anything, is forwarded). The handler
//! body itself only owns the shared checks: match properties and
//! repository visibility.

use std::sync::Arc;

use minder_core::entities::{
    EntityError, EntityType, EntityWithProperties, PropertyError,
};
use minder_core::events::{EventError, HandleEntityAndDoMessage, Message};
use minder_core::providers::ProviderError;
use thiserror::Error;
use tracing::{debug, error, info, instrument};

use crate::metrics::EngineMetrics;
use crate::providers::RegistryError;
use crate::router::{Delivery, RouterError, TopicRouter};
use crate::service::{RequestCache, ServiceError};
use crate::store::{Database, StoreError};

mod get_strategies;
mod message_strategies;

pub use get_strategies::{
    AddOriginatingEntityStrategy, DelOriginatingEntityStrategy, GetEntityByUpstreamIdStrategy,
    RefreshByIdStrategy, RefreshByUpstreamPropsStrategy,
};
pub use message_strategies::{ToEmpty, ToEntityDeleteEvent, ToEntityEnvelope};

/// Errors raised while handling a reconciliation message.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HandlerError {
    /// The message payload could not be decoded.
    #[error(transparent)]
    Decode(#[from] EventError),

    /// The message lacks the internal entity id its topic requires.
    #[error("message carries no entity id")]
    MissingEntityId,

    /// The message lacks the originator its topic requires.
    #[error("message carries no originator")]
    MissingOriginator,

    /// Property retrieval or persistence failed.
    #[error(transparent)]
    Service(#[from] ServiceError),

    /// A provider could not be resolved.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// A provider call failed.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// The store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A property value was malformed.
    #[error(transparent)]
    Properties(#[from] PropertyError),

    /// An entity type tag was invalid.
    #[error(transparent)]
    Entity(#[from] EntityError),

    /// Forwarding the produced message failed.
    #[error(transparent)]
    Router(#[from] RouterError),
}

/// Resolves (and possibly mutates) the entity a message refers to.
#[async_trait::async_trait]
pub trait GetEntityStrategy: Send + Sync {
    /// Strategy name, used in logs.
    fn name(&self) -> &'static str;

    /// Resolves the message to an entity with its properties.
    async fn get_entity(
        &self,
        msg: &HandleEntityAndDoMessage,
        cache: &RequestCache,
    ) -> Result<EntityWithProperties, HandlerError>;
}

/// Builds the outbound message for a resolved entity, if any.
pub trait CreateMessageStrategy: Send + Sync {
    /// Strategy name, used in logs.
    fn name(&self) -> &'static str;

    /// Builds the message to forward; `None` forwards nothing.
    fn create_message(
        &self,
        ewp: &EntityWithProperties,
    ) -> Result<Option<Message>, HandlerError>;
}

/// One reconciliation topic handler.
pub struct EntityHandler {
    topic: &'static str,
    forward_to: &'static str,
    getter: Arc<dyn GetEntityStrategy>,
    creator: Arc<dyn CreateMessageStrategy>,
    db: Database,
    router: Arc<TopicRouter>,
    metrics: EngineMetrics,
}

impl EntityHandler {
    /// Composes a handler from its strategies.
    #[must_use]
    pub fn new(
        topic: &'static str,
        forward_to: &'static str,
        getter: Arc<dyn GetEntityStrategy>,
        creator: Arc<dyn CreateMessageStrategy>,
        db: Database,
        router: Arc<TopicRouter>,
        metrics: EngineMetrics,
    ) -> Self {
        Self {
            topic,
            forward_to,
            getter,
            creator,
            db,
            router,
            metrics,
        }
    }

    /// The topic this handler serves.
    #[must_use]
    pub fn topic(&self) -> &'static str {
        self.topic
    }

    /// Consumes deliveries until the subscription ends.
    ///
    /// Every failure is logged and acknowledged; a poison message must
    /// never wedge the topic.
    pub async fn run(self: Arc<Self>, mut rx: tokio::sync::mpsc::Receiver<Delivery>) {
        while let Some(delivery) = rx.recv().await {
            if let Err(err) = self.handle(&delivery.message).await {
                self.metrics.message_handled(self.topic, "error");
                error!(
                    topic = self.topic,
                    uuid = %delivery.message.uuid,
                    %err,
                    "message handling failed, dropping"
                );
            }
            delivery.ack();
        }
        debug!(topic = self.topic, "handler subscription ended");
    }

    /// Handles one message: resolve, check, create, forward.
    #[instrument(skip_all, fields(topic = self.topic))]
    pub async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        let msg = HandleEntityAndDoMessage::from_message(message)?;
        let cache = RequestCache::new();

        let ewp = self.getter.get_entity(&msg, &cache).await?;
        debug!(
            strategy = self.getter.name(),
            entity_id = %ewp.entity.id,
            entity_type = %ewp.entity.entity_type,
            "entity resolved"
        );

        if !self.matches_properties(&msg, &ewp)? {
            self.metrics.message_handled(self.topic, "dropped");
            info!(entity_id = %ewp.entity.id, "match properties differ, dropping");
            return Ok(());
        }
        if !self.passes_visibility(&ewp)? {
            self.metrics.message_handled(self.topic, "dropped");
            info!(entity_id = %ewp.entity.id, "repository not eligible, dropping");
            return Ok(());
        }

        if let Some(out) = self.creator.create_message(&ewp)? {
            self.router.publish(self.forward_to, out).await?;
        }
        self.metrics.message_handled(self.topic, "ok");
        Ok(())
    }

    /// Every match property must equal the resolved entity's value.
    fn matches_properties(
        &self,
        msg: &HandleEntityAndDoMessage,
        ewp: &EntityWithProperties,
    ) -> Result<bool, HandlerError> {
        let wanted = msg.match_properties()?;
        for (key, prop) in wanted.iter() {
            if ewp.properties.get(key) != Some(prop) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Archived repositories never forward; private ones only when the
    /// owning project allows them.
    fn passes_visibility(&self, ewp: &EntityWithProperties) -> Result<bool, HandlerError> {
        if ewp.entity.entity_type != EntityType::Repository {
            return Ok(true);
        }
        if ewp.properties.get_bool("is_archived") {
            return Ok(false);
        }
        if ewp.properties.get_bool("is_private") {
            let flags = self
                .db
                .get_project_flags(ewp.entity.project_id)
                .map_err(ServiceError::from)?
                .unwrap_or_default();
            return Ok(flags.allow_private_repositories);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests;
