//! The canonical in-flight entity representation on the bus.
//!
//! An [`EntityEnvelope`] pairs a typed wire body with the metadata keys
//! every evaluation message carries. Parsing accepts the legacy per-type id
//! keys older publishers emitted; building writes only the unified
//! `entity_id` key.

use thiserror::Error;
use uuid::Uuid;

use super::Message;
use crate::entities::{EntityError, EntityType};
use crate::proto::{EntityMessage, WireError};

/// Metadata key carrying the entity type string.
pub const META_ENTITY_TYPE: &str = "entity_type";
/// Metadata key carrying the unified entity id.
pub const META_ENTITY_ID: &str = "entity_id";
/// Metadata key carrying the owning project id.
pub const META_PROJECT_ID: &str = "project_id";
/// Metadata key carrying the provider id.
pub const META_PROVIDER_ID: &str = "provider_id";
/// Metadata key carrying the execution id stamped by the executor gate.
pub const META_EXECUTION_ID: &str = "execution_id";

/// Legacy id key for repositories; read-only fallback.
pub const META_LEGACY_REPOSITORY_ID: &str = "repository_id";
/// Legacy id key for artifacts; read-only fallback.
pub const META_LEGACY_ARTIFACT_ID: &str = "artifact_id";
/// Legacy id key for pull requests; read-only fallback.
pub const META_LEGACY_PULL_REQUEST_ID: &str = "pull_request_id";

/// Errors raised building or parsing envelopes.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EnvelopeError {
    /// A required metadata key is absent.
    #[error("envelope metadata missing required key {key:?}")]
    MissingMetadata {
        /// The absent key.
        key: &'static str,
    },

    /// A metadata value did not parse as a UUID.
    #[error("envelope metadata key {key:?} holds a malformed UUID: {source}")]
    MalformedUuid {
        /// The offending key.
        key: &'static str,
        /// The parse failure.
        #[source]
        source: uuid::Error,
    },

    /// The entity type metadata is invalid or unspecified.
    #[error(transparent)]
    Entity(#[from] EntityError),

    /// The payload did not decode as the typed entity body.
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// A typed entity message in flight on the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityEnvelope {
    /// The typed wire body.
    pub body: EntityMessage,
    /// Owning project.
    pub project_id: Uuid,
    /// Provider id.
    pub provider_id: Uuid,
    /// Internal entity id, absent for entities not yet persisted.
    pub entity_id: Option<Uuid>,
    /// Execution id, stamped by the executor gate on admission.
    pub execution_id: Option<Uuid>,
}

impl EntityEnvelope {
    /// Builds an envelope; project and provider ids are always required.
    #[must_use]
    pub fn new(body: EntityMessage, project_id: Uuid, provider_id: Uuid) -> Self {
        Self {
            body,
            project_id,
            provider_id,
            entity_id: None,
            execution_id: None,
        }
    }

    /// Attaches the internal entity id.
    #[must_use]
    pub fn with_entity_id(mut self, entity_id: Uuid) -> Self {
        self.entity_id = Some(entity_id);
        self
    }

    /// Attaches an execution id.
    #[must_use]
    pub fn with_execution_id(mut self, execution_id: Uuid) -> Self {
        self.execution_id = Some(execution_id);
        self
    }

    /// The entity type of the carried body.
    #[must_use]
    pub fn entity_type(&self) -> EntityType {
        self.body.entity_type()
    }

    /// Encodes into a bus message.
    ///
    /// Only the unified `entity_id` key is written; legacy per-type keys are
    /// never emitted.
    #[must_use]
    pub fn to_message(&self) -> Message {
        let mut message = Message::new(self.body.encode_to_vec());
        message.set_metadata(META_ENTITY_TYPE, self.entity_type().as_str());
        message.set_metadata(META_PROJECT_ID, self.project_id.to_string());
        message.set_metadata(META_PROVIDER_ID, self.provider_id.to_string());
        if let Some(entity_id) = self.entity_id {
            message.set_metadata(META_ENTITY_ID, entity_id.to_string());
        }
        if let Some(execution_id) = self.execution_id {
            message.set_metadata(META_EXECUTION_ID, execution_id.to_string());
        }
        message
    }

    /// Decodes from a bus message.
    ///
    /// Prefers the unified `entity_id` key and falls back to the legacy
    /// per-type keys. Rejects the unspecified entity type.
    pub fn from_message(message: &Message) -> Result<Self, EnvelopeError> {
        let type_str = message
            .metadata(META_ENTITY_TYPE)
            .ok_or(EnvelopeError::MissingMetadata {
                key: META_ENTITY_TYPE,
            })?;
        let entity_type: EntityType = type_str.parse::<EntityType>()?.require_specified()?;

        let project_id = required_uuid(message, META_PROJECT_ID)?;
        let provider_id = required_uuid(message, META_PROVIDER_ID)?;
        let execution_id = optional_uuid(message, META_EXECUTION_ID)?;
        let entity_id = match optional_uuid(message, META_ENTITY_ID)? {
            Some(id) => Some(id),
            None => legacy_entity_id(message, entity_type)?,
        };

        let body = EntityMessage::decode(entity_type, &message.payload)?;

        Ok(Self {
            body,
            project_id,
            provider_id,
            entity_id,
            execution_id,
        })
    }
}

fn required_uuid(message: &Message, key: &'static str) -> Result<Uuid, EnvelopeError> {
    let raw = message
        .metadata(key)
        .ok_or(EnvelopeError::MissingMetadata { key })?;
    raw.parse()
        .map_err(|source| EnvelopeError::MalformedUuid { key, source })
}

fn optional_uuid(message: &Message, key: &'static str) -> Result<Option<Uuid>, EnvelopeError> {
    match message.metadata(key) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|source| EnvelopeError::MalformedUuid { key, source }),
        None => Ok(None),
    }
}

fn legacy_entity_id(
    message: &Message,
    entity_type: EntityType,
) -> Result<Option<Uuid>, EnvelopeError> {
    let key = match entity_type {
        EntityType::Repository => META_LEGACY_REPOSITORY_ID,
        EntityType::Artifact => META_LEGACY_ARTIFACT_ID,
        EntityType::PullRequest => META_LEGACY_PULL_REQUEST_ID,
        _ => return Ok(None),
    };
    optional_uuid(message, key)
}
