//! Outbound message strategies.

use std::sync::Arc;

use minder_core::entities::EntityWithProperties;
use minder_core::events::envelope::EntityEnvelope;
use minder_core::events::{EntityDeleteEvent, Message};

use crate::providers::ProviderManager;
use crate::service::PropertiesService;

use super::{CreateMessageStrategy, HandlerError};

/// Wraps the entity in its typed envelope for the evaluation pipeline.
pub struct ToEntityEnvelope {
    service: Arc<PropertiesService>,
    providers: Arc<ProviderManager>,
}

impl ToEntityEnvelope {
    /// Builds the strategy.
    #[must_use]
    pub fn new(service: Arc<PropertiesService>, providers: Arc<ProviderManager>) -> Self {
        Self { service, providers }
    }
}

impl CreateMessageStrategy for ToEntityEnvelope {
    fn name(&self) -> &'static str {
        "to-entity-envelope"
    }

    fn create_message(&self, ewp: &EntityWithProperties) -> Result<Option<Message>, HandlerError> {
        let body = self
            .service
            .entity_with_properties_as_proto(ewp, &self.providers)?;
        let envelope = EntityEnvelope::new(body, ewp.entity.project_id, ewp.entity.provider_id)
            .with_entity_id(ewp.entity.id);
        Ok(Some(envelope.to_message()))
    }
}

/// Emits the id-only event consumed by delete reconciliation.
pub struct ToEntityDeleteEvent;

impl CreateMessageStrategy for ToEntityDeleteEvent {
    fn name(&self) -> &'static str {
        "to-entity-delete-event"
    }

    fn create_message(&self, ewp: &EntityWithProperties) -> Result<Option<Message>, HandlerError> {
        let event = EntityDeleteEvent::new(
            ewp.entity.entity_type,
            ewp.entity.id,
            ewp.entity.project_id,
            ewp.entity.provider_id,
        );
        Ok(Some(event.to_message()?))
    }
}

/// Forwards nothing; the get strategy's side effect is the whole point.
pub struct ToEmpty;

impl CreateMessageStrategy for ToEmpty {
    fn name(&self) -> &'static str {
        "to-empty"
    }

    fn create_message(&self, _ewp: &EntityWithProperties) -> Result<Option<Message>, HandlerError> {
        Ok(None)
    }
}
