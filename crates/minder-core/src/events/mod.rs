//! Bus message types and topic names for the entity pipeline.
//!
//! The pipeline communicates over an in-process, topic-oriented bus. A
//! [`Message`] is the unit of exchange: opaque payload bytes plus string
//! metadata. The [`HandleEntityAndDoMessage`] JSON document is the payload
//! of every inbound reconciliation topic.

pub mod envelope;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use crate::entities::{EntityError, EntityType, Properties, PropertyError};

/// Inbound: resolve an entity by upstream properties, refresh, evaluate.
pub const TOPIC_REFRESH_ENTITY_AND_EVALUATE: &str = "refresh-entity-and-evaluate";
/// Inbound: refresh an entity known by internal id, then evaluate.
pub const TOPIC_REFRESH_ENTITY_BY_ID_AND_EVALUATE: &str = "refresh-entity-by-id-and-evaluate";
/// Inbound: resolve an entity and emit a delete reconciliation event.
pub const TOPIC_GET_ENTITY_AND_DELETE: &str = "get-entity-and-delete";
/// Inbound: create a child entity tied to an originator.
pub const TOPIC_ORIGINATING_ENTITY_ADD: &str = "originating-entity-add";
/// Inbound: delete a child entity tied to an originator.
pub const TOPIC_ORIGINATING_ENTITY_DELETE: &str = "originating-entity-delete";
/// Forward: admit an entity for profile evaluation.
pub const TOPIC_ENTITY_EVALUATE: &str = "entity-evaluate";
/// Forward: reconcile the deletion of an entity downstream.
pub const TOPIC_RECONCILE_ENTITY_DELETE: &str = "reconcile-entity-delete";
/// Terminal: evaluation completed, flush downstream state.
pub const TOPIC_ENTITY_FLUSH: &str = "entity-flush";

/// Errors raised building or decoding bus messages.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EventError {
    /// JSON (de)serialization of the payload failed.
    #[error("message payload codec failed: {0}")]
    Codec(#[from] serde_json::Error),

    /// A property map embedded in the payload is invalid.
    #[error(transparent)]
    Properties(#[from] PropertyError),

    /// The payload carries an invalid entity type tag.
    #[error(transparent)]
    Entity(#[from] EntityError),
}

/// A bus message: payload bytes plus string metadata.
#[derive(Debug, Clone, Default)]
pub struct Message {
    /// Unique message id, assigned at construction.
    pub uuid: Uuid,
    /// String metadata keyed by well-known names.
    pub metadata: HashMap<String, String>,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
}

impl Message {
    /// Builds a message around payload bytes.
    #[must_use]
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            metadata: HashMap::new(),
            payload,
        }
    }

    /// Sets a metadata key.
    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    /// Reads a metadata key.
    #[must_use]
    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

/// Reference to an entity by type and lookup properties.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityRef {
    /// Numeric entity type tag.
    #[serde(rename = "type")]
    pub entity_type: i32,
    /// Lookup properties in wire encoding.
    pub get_by_props: serde_json::Map<String, JsonValue>,
}

impl EntityRef {
    /// Builds a reference from a type and lookup properties.
    #[must_use]
    pub fn new(entity_type: EntityType, get_by_props: &Properties) -> Self {
        Self {
            entity_type: entity_type.as_i32(),
            get_by_props: get_by_props.to_wire_struct(),
        }
    }

    /// The decoded entity type.
    ///
    /// # Errors
    ///
    /// Returns [`EntityError::InvalidEntityType`] for unknown tags.
    pub fn entity_type(&self) -> Result<EntityType, EntityError> {
        EntityType::from_i32(self.entity_type)
    }

    /// The decoded lookup properties.
    pub fn properties(&self) -> Result<Properties, PropertyError> {
        Properties::from_wire_struct(&self.get_by_props)
    }
}

/// Provider resolution hint used when project and provider are not yet
/// known.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EntityHint {
    /// Match providers implementing this interface, e.g. `github`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_implements: Option<String>,
    /// Match providers of this class, e.g. `github-app`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_class: Option<String>,
}

impl EntityHint {
    /// True when the hint constrains nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.provider_implements.is_none() && self.provider_class.is_none()
    }
}

/// The JSON document carried on every inbound reconciliation topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HandleEntityAndDoMessage {
    /// The entity to resolve.
    pub entity: EntityRef,
    /// The originator to tie a child entity to, when adding one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub originator: Option<EntityRef>,
    /// Properties the resolved entity must match for forwarding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_props: Option<serde_json::Map<String, JsonValue>>,
    /// Provider resolution hint.
    #[serde(default, skip_serializing_if = "EntityHint::is_empty")]
    pub hint: EntityHint,
    /// Internal entity id, set only on the id-based refresh topic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<Uuid>,
}

impl HandleEntityAndDoMessage {
    /// Starts a message for the given entity reference.
    #[must_use]
    pub fn for_entity(entity_type: EntityType, get_by_props: &Properties) -> Self {
        Self {
            entity: EntityRef::new(entity_type, get_by_props),
            originator: None,
            match_props: None,
            hint: EntityHint::default(),
            entity_id: None,
        }
    }

    /// Attaches an originator reference.
    #[must_use]
    pub fn with_originator(mut self, entity_type: EntityType, get_by_props: &Properties) -> Self {
        self.originator = Some(EntityRef::new(entity_type, get_by_props));
        self
    }

    /// Attaches match properties the resolved entity must satisfy.
    #[must_use]
    pub fn with_match_props(mut self, match_props: &Properties) -> Self {
        self.match_props = Some(match_props.to_wire_struct());
        self
    }

    /// Attaches a provider resolution hint.
    #[must_use]
    pub fn with_hint(mut self, hint: EntityHint) -> Self {
        self.hint = hint;
        self
    }

    /// Attaches the internal entity id for the id-based topic.
    #[must_use]
    pub fn with_entity_id(mut self, entity_id: Uuid) -> Self {
        self.entity_id = Some(entity_id);
        self
    }

    /// Decoded match properties, empty when absent.
    pub fn match_properties(&self) -> Result<Properties, PropertyError> {
        match &self.match_props {
            Some(map) => Properties::from_wire_struct(map),
            None => Ok(Properties::new()),
        }
    }

    /// Serializes into a bus message payload.
    pub fn to_message(&self) -> Result<Message, EventError> {
        Ok(Message::new(serde_json::to_vec(self)?))
    }

    /// Deserializes from a bus message payload.
    pub fn from_message(message: &Message) -> Result<Self, EventError> {
        Ok(serde_json::from_slice(&message.payload)?)
    }
}

/// Id-only entity event published on the delete reconciliation topic.
///
/// Carries no properties: by the time a consumer runs, the upstream entity
/// is gone, so ids are all that can still be trusted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntityDeleteEvent {
    /// Numeric entity type tag.
    #[serde(rename = "type")]
    pub entity_type: i32,
    /// Internal id of the deleted entity.
    pub entity_id: Uuid,
    /// Owning project.
    pub project_id: Uuid,
    /// Owning provider.
    pub provider_id: Uuid,
}

impl EntityDeleteEvent {
    /// Builds the event for one deleted entity.
    #[must_use]
    pub fn new(entity_type: EntityType, entity_id: Uuid, project_id: Uuid, provider_id: Uuid) -> Self {
        Self {
            entity_type: entity_type.as_i32(),
            entity_id,
            project_id,
            provider_id,
        }
    }

    /// The decoded entity type.
    pub fn entity_type(&self) -> Result<EntityType, EntityError> {
        EntityType::from_i32(self.entity_type)
    }

    /// Serializes into a bus message payload.
    pub fn to_message(&self) -> Result<Message, EventError> {
        Ok(Message::new(serde_json::to_vec(self)?))
    }

    /// Deserializes from a bus message payload.
    pub fn from_message(message: &Message) -> Result<Self, EventError> {
        Ok(serde_json::from_slice(&message.payload)?)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::entities::Property;

    fn upstream_props(id: &str) -> Properties {
        let mut props = Properties::new();
        props
            .set(
                crate::entities::properties::PROP_UPSTREAM_ID,
                Property::from_string(id),
            )
            .unwrap();
        props
    }

    #[test]
    fn test_handle_message_roundtrip() {
        let original = HandleEntityAndDoMessage::for_entity(
            EntityType::PullRequest,
            &upstream_props("789"),
        )
        .with_originator(EntityType::Repository, &upstream_props("123"))
        .with_hint(EntityHint {
            provider_implements: Some("github".to_owned()),
            provider_class: None,
        });

        let message = original.to_message().unwrap();
        let decoded = HandleEntityAndDoMessage::from_message(&message).unwrap();
        assert_eq!(decoded, original);
        assert_eq!(
            decoded.entity.entity_type().unwrap(),
            EntityType::PullRequest
        );
        assert_eq!(
            decoded.originator.unwrap().entity_type().unwrap(),
            EntityType::Repository
        );
    }

    #[test]
    fn test_match_props_survive_integer_wrapping() {
        let mut match_props = Properties::new();
        match_props
            .set("github/hook_id", Property::from_int64(456))
            .unwrap();

        let msg = HandleEntityAndDoMessage::for_entity(
            EntityType::Repository,
            &upstream_props("123"),
        )
        .with_match_props(&match_props);

        let decoded =
            HandleEntityAndDoMessage::from_message(&msg.to_message().unwrap()).unwrap();
        let decoded_props = decoded.match_properties().unwrap();
        assert_eq!(decoded_props.get_int64("github/hook_id"), 456);
    }

    #[test]
    fn test_schema_shape_is_stable() {
        let msg =
            HandleEntityAndDoMessage::for_entity(EntityType::Repository, &upstream_props("123"));
        let value: JsonValue = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["entity"]["type"], json!(1));
        assert!(value["entity"]["get_by_props"].is_object());
        assert!(value.get("originator").is_none());
        assert!(value.get("hint").is_none());
    }

    #[test]
    fn test_metadata_accessors() {
        let mut msg = Message::new(Vec::new());
        msg.set_metadata("entity_id", "abc");
        assert_eq!(msg.metadata("entity_id"), Some("abc"));
        assert_eq!(msg.metadata("missing"), None);
    }
}
