//! Entity resolution strategies.

use std::sync::Arc;

use async_trait::async_trait;
use minder_core::entities::{EntityType, EntityWithProperties, Properties};
use minder_core::events::HandleEntityAndDoMessage;
use minder_core::providers::Provider;
use tracing::debug;
use uuid::Uuid;

use crate::providers::ProviderManager;
use crate::service::{PropertiesService, ReadOptions, RequestCache};
use crate::store::Database;

use super::{GetEntityStrategy, HandlerError};

/// Resolves the entity from the store by upstream properties, without
/// touching the provider. Used on the delete path, where upstream is
/// already gone.
pub struct GetEntityByUpstreamIdStrategy {
    service: Arc<PropertiesService>,
    providers: Arc<ProviderManager>,
}

impl GetEntityByUpstreamIdStrategy {
    /// Builds the strategy.
    #[must_use]
    pub fn new(service: Arc<PropertiesService>, providers: Arc<ProviderManager>) -> Self {
        Self { service, providers }
    }
}

#[async_trait]
impl GetEntityStrategy for GetEntityByUpstreamIdStrategy {
    fn name(&self) -> &'static str {
        "get-by-upstream-id"
    }

    async fn get_entity(
        &self,
        msg: &HandleEntityAndDoMessage,
        _cache: &RequestCache,
    ) -> Result<EntityWithProperties, HandlerError> {
        let entity_type = msg.entity.entity_type()?.require_specified()?;
        let get_by = msg.entity.properties()?;
        Ok(self.service.entity_with_properties_by_upstream_hint(
            entity_type,
            &get_by,
            &msg.hint,
            &self.providers,
        )?)
    }
}

/// Resolves the entity by upstream properties and refreshes its property
/// set through the owning provider.
pub struct RefreshByUpstreamPropsStrategy {
    service: Arc<PropertiesService>,
    providers: Arc<ProviderManager>,
}

impl RefreshByUpstreamPropsStrategy {
    /// Builds the strategy.
    #[must_use]
    pub fn new(service: Arc<PropertiesService>, providers: Arc<ProviderManager>) -> Self {
        Self { service, providers }
    }
}

#[async_trait]
impl GetEntityStrategy for RefreshByUpstreamPropsStrategy {
    fn name(&self) -> &'static str {
        "refresh-by-upstream-props"
    }

    async fn get_entity(
        &self,
        msg: &HandleEntityAndDoMessage,
        _cache: &RequestCache,
    ) -> Result<EntityWithProperties, HandlerError> {
        let entity_type = msg.entity.entity_type()?.require_specified()?;
        let get_by = msg.entity.properties()?;
        let mut ewp = self.service.entity_with_properties_by_upstream_hint(
            entity_type,
            &get_by,
            &msg.hint,
            &self.providers,
        )?;
        let provider = self.providers.instantiate(ewp.entity.provider_id)?;
        self.service
            .retrieve_all_properties_by_entity(&mut ewp, provider.as_ref(), &ReadOptions::default())
            .await?;
        Ok(ewp)
    }
}

/// Resolves the entity by internal id and refreshes its property set.
pub struct RefreshByIdStrategy {
    service: Arc<PropertiesService>,
    providers: Arc<ProviderManager>,
}

impl RefreshByIdStrategy {
    /// Builds the strategy.
    #[must_use]
    pub fn new(service: Arc<PropertiesService>, providers: Arc<ProviderManager>) -> Self {
        Self { service, providers }
    }
}

#[async_trait]
impl GetEntityStrategy for RefreshByIdStrategy {
    fn name(&self) -> &'static str {
        "refresh-by-id"
    }

    async fn get_entity(
        &self,
        msg: &HandleEntityAndDoMessage,
        cache: &RequestCache,
    ) -> Result<EntityWithProperties, HandlerError> {
        let id = msg.entity_id.ok_or(HandlerError::MissingEntityId)?;
        let mut ewp = self.service.entity_with_properties_by_id(id, Some(cache))?;
        let provider = self.providers.instantiate(ewp.entity.provider_id)?;
        self.service
            .retrieve_all_properties_by_entity(&mut ewp, provider.as_ref(), &ReadOptions::default())
            .await?;
        Ok(ewp)
    }
}

/// Registers a child entity under an already-registered originator.
///
/// The child's properties are fetched through the originator's provider;
/// the child row, its legacy id row and its property set are written in
/// one transaction.
pub struct AddOriginatingEntityStrategy {
    service: Arc<PropertiesService>,
    providers: Arc<ProviderManager>,
    db: Database,
}

impl AddOriginatingEntityStrategy {
    /// Builds the strategy.
    #[must_use]
    pub fn new(
        service: Arc<PropertiesService>,
        providers: Arc<ProviderManager>,
        db: Database,
    ) -> Self {
        Self {
            service,
            providers,
            db,
        }
    }
}

#[async_trait]
impl GetEntityStrategy for AddOriginatingEntityStrategy {
    fn name(&self) -> &'static str {
        "add-originating-entity"
    }

    async fn get_entity(
        &self,
        msg: &HandleEntityAndDoMessage,
        _cache: &RequestCache,
    ) -> Result<EntityWithProperties, HandlerError> {
        let (originator, provider, child_type, lookup) =
            resolve_originator(msg, &self.service, &self.providers)?;

        let props = self
            .service
            .retrieve_all_properties(
                provider.as_ref(),
                originator.entity.project_id,
                originator.entity.provider_id,
                &lookup,
                child_type,
                &ReadOptions::default(),
            )
            .await?;
        let name = provider.entity_name(child_type, &props)?;
        let upstream_id = provider.upstream_id(child_type, &props)?;

        let entity = self.db.with_tx(|tx| {
            let entity = tx.create_or_ensure_entity_by_id(
                Uuid::new_v4(),
                child_type,
                &name,
                originator.entity.project_id,
                originator.entity.provider_id,
                Some(originator.entity.id),
            )?;
            tx.upsert_legacy_id(child_type, &upstream_id, entity.id)?;
            tx.delete_all_properties(entity.id)?;
            for (key, prop) in props.iter() {
                tx.upsert_property(entity.id, key, prop)?;
            }
            Ok(entity)
        })?;
        debug!(entity_id = %entity.id, originator_id = %originator.entity.id, "child entity registered");

        Ok(EntityWithProperties::new(entity, props))
    }
}

/// Deletes a child entity of an originator by its provider-derived name.
pub struct DelOriginatingEntityStrategy {
    service: Arc<PropertiesService>,
    providers: Arc<ProviderManager>,
    db: Database,
}

impl DelOriginatingEntityStrategy {
    /// Builds the strategy.
    #[must_use]
    pub fn new(
        service: Arc<PropertiesService>,
        providers: Arc<ProviderManager>,
        db: Database,
    ) -> Self {
        Self {
            service,
            providers,
            db,
        }
    }
}

#[async_trait]
impl GetEntityStrategy for DelOriginatingEntityStrategy {
    fn name(&self) -> &'static str {
        "del-originating-entity"
    }

    async fn get_entity(
        &self,
        msg: &HandleEntityAndDoMessage,
        _cache: &RequestCache,
    ) -> Result<EntityWithProperties, HandlerError> {
        let (originator, provider, child_type, lookup) =
            resolve_originator(msg, &self.service, &self.providers)?;

        let name = provider.entity_name(child_type, &lookup)?;
        let child = self
            .db
            .get_entity_by_name(
                originator.entity.project_id,
                originator.entity.provider_id,
                child_type,
                &name,
            )?
            .ok_or(crate::service::ServiceError::EntityNotFound)
            .map_err(HandlerError::Service)?;
        let snapshot = self.service.entity_with_properties_by_id(child.id, None)?;

        self.db.with_tx(|tx| {
            tx.delete_entity_by_name(
                originator.entity.project_id,
                originator.entity.provider_id,
                child_type,
                &name,
            )
        })?;
        debug!(entity_id = %child.id, "child entity deleted");

        Ok(snapshot)
    }
}

/// Common originator resolution for the add/delete strategies: the
/// originator entity, its live provider, and the child's type and lookup
/// properties.
fn resolve_originator(
    msg: &HandleEntityAndDoMessage,
    service: &PropertiesService,
    providers: &Arc<ProviderManager>,
) -> Result<
    (
        EntityWithProperties,
        Arc<dyn Provider>,
        EntityType,
        Properties,
    ),
    HandlerError,
> {
    let originator_ref = msg
        .originator
        .as_ref()
        .ok_or(HandlerError::MissingOriginator)?;
    let originator = service.entity_with_properties_by_upstream_hint(
        originator_ref.entity_type()?.require_specified()?,
        &originator_ref.properties()?,
        &msg.hint,
        providers,
    )?;
    let provider = providers.instantiate(originator.entity.provider_id)?;
    let child_type = msg.entity.entity_type()?.require_specified()?;
    let lookup = msg.entity.properties()?;
    Ok((originator, provider, child_type, lookup))
}
