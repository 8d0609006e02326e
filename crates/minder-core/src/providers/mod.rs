//! The provider adapter seam.
//!
//! A [`Provider`] talks to the upstream source of truth for entities of one
//! or more types. Adapters are instantiated by the engine's registry; the
//! wire protocols they speak are out of scope here.

use async_trait::async_trait;
use thiserror::Error;

use crate::entities::{EntityType, Properties, Property};
use crate::events::EntityHint;
use crate::proto::EntityMessage;

/// Errors surfaced by provider adapters.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProviderError {
    /// The upstream source reports the entity does not exist.
    #[error("entity not found upstream")]
    EntityNotFound,

    /// The adapter does not support the requested entity type.
    #[error("provider does not support entity type {0}")]
    UnsupportedEntityType(EntityType),

    /// A property required for the operation is absent.
    #[error("required property {key:?} is missing")]
    MissingProperty {
        /// The absent key.
        key: String,
    },

    /// An upstream call failed for reasons other than absence.
    #[error("upstream call failed: {message}")]
    Upstream {
        /// Adapter-supplied failure description.
        message: String,
    },
}

/// An adapter over one upstream hosting provider.
///
/// Adapters are cheap to clone behind `Arc` and are considered I/O-free to
/// instantiate once the registry has cached them.
#[async_trait]
pub trait Provider: std::fmt::Debug + Send + Sync {
    /// The provider class, e.g. `github-app`.
    fn class(&self) -> &str;

    /// The interfaces this provider implements, e.g. `["github", "git"]`.
    fn implements(&self) -> &[String];

    /// Whether entities of this type can be fetched from this provider.
    fn supports_entity_type(&self, entity_type: EntityType) -> bool;

    /// Fetches the full property set for an entity from upstream.
    ///
    /// `cached` carries the previously persisted set, which adapters may use
    /// to cut upstream calls (e.g. conditional requests).
    async fn fetch_all_properties(
        &self,
        lookup: &Properties,
        entity_type: EntityType,
        cached: Option<&Properties>,
    ) -> Result<Properties, ProviderError>;

    /// Fetches a single property from upstream.
    async fn fetch_property(
        &self,
        lookup: &Properties,
        entity_type: EntityType,
        key: &str,
    ) -> Result<Property, ProviderError>;

    /// Converts a property set into the typed wire body for the bus.
    fn properties_to_message(
        &self,
        entity_type: EntityType,
        props: &Properties,
    ) -> Result<EntityMessage, ProviderError>;

    /// Derives the canonical entity name from a property set.
    fn entity_name(
        &self,
        entity_type: EntityType,
        props: &Properties,
    ) -> Result<String, ProviderError>;

    /// Extracts the upstream identifier from a property set.
    fn upstream_id(
        &self,
        entity_type: EntityType,
        props: &Properties,
    ) -> Result<String, ProviderError> {
        let _ = entity_type;
        props
            .get(crate::entities::properties::PROP_UPSTREAM_ID)
            .map(Property::get_string)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ProviderError::MissingProperty {
                key: crate::entities::properties::PROP_UPSTREAM_ID.to_owned(),
            })
    }

    /// Whether this provider satisfies a resolution hint.
    fn matches_hint(&self, hint: &EntityHint) -> bool {
        if let Some(class) = &hint.provider_class {
            if self.class() != class {
                return false;
            }
        }
        if let Some(implements) = &hint.provider_implements {
            if !self.implements().iter().any(|i| i == implements) {
                return false;
            }
        }
        true
    }
}
