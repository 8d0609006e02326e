//! Read-through property service.
//!
//! All property access goes through [`PropertiesService`]: reads are served
//! from the store while every cached row is younger than the configured
//! TTL, and fall through to the owning provider otherwise. Fetched sets are
//! persisted back whenever the entity is already registered, so the next
//! read within the TTL window is store-only.

use std::collections::HashMap;
use std::sync::Mutex;

use minder_core::entities::{
    EntityType, EntityWithProperties, Properties, Property, PropertyError,
    properties::{PROP_NAME, PROP_UPSTREAM_ID},
};
use minder_core::events::EntityHint;
use minder_core::proto::EntityMessage;
use minder_core::providers::{Provider, ProviderError};
use chrono::Utc;
use thiserror::Error;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::metrics::EngineMetrics;
use crate::providers::{ProviderManager, RegistryError};
use crate::store::{Database, EntityFilter, PropertyRow, StoreError};


/// Errors raised by property retrieval and persistence.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ServiceError {
    /// No entity matched the lookup, in the store or upstream.
    #[error("entity not found")]
    EntityNotFound,

    /// A lookup that must resolve to one entity matched several.
    #[error("lookup matched {count} entities, expected exactly one")]
    MultipleEntities {
        /// How many rows matched.
        count: usize,
    },

    /// The requested property does not exist, cached or upstream.
    #[error("property {key:?} not found")]
    PropertyNotFound {
        /// The absent key.
        key: String,
    },

    /// The store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The provider adapter failed.
    #[error(transparent)]
    Provider(ProviderError),

    /// A provider could not be resolved.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// A property value was malformed.
    #[error(transparent)]
    Properties(#[from] PropertyError),
}

impl From<ProviderError> for ServiceError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::EntityNotFound => Self::EntityNotFound,
            other => Self::Provider(other),
        }
    }
}

/// How long a cached property row stays authoritative, in seconds.
///
/// A negative TTL is the bypass sentinel: every cached row is treated as
/// stale and reads always go upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTtl(i64);

impl CacheTtl {
    /// Treat every cached row as stale.
    pub const BYPASS: Self = Self(-1);

    /// Builds a TTL from whole seconds; negative values bypass the cache.
    #[must_use]
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs)
    }

    /// True when cached rows are never served.
    #[must_use]
    pub const fn is_bypass(self) -> bool {
        self.0 < 0
    }

    fn is_fresh(self, row: &PropertyRow, now: i64) -> bool {
        !self.is_bypass() && now - row.updated_at.timestamp() < self.0
    }
}

impl Default for CacheTtl {
    fn default() -> Self {
        Self(300)
    }
}

/// Per-read options.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    /// Serve cached rows even when older than the TTL. Reads never go
    /// upstream under this flag unless nothing is cached at all.
    pub tolerate_stale: bool,
}

/// Entity cache scoped to one message handling pass.
///
/// Handlers resolve the same entity several times while building their
/// output; the cache keeps that to one store read per pass. Never share a
/// cache across messages, it has no invalidation.
#[derive(Debug, Default)]
pub struct RequestCache {
    entries: Mutex<HashMap<Uuid, EntityWithProperties>>,
}

impl RequestCache {
    /// Empty cache for one handling pass.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, id: Uuid) -> Option<EntityWithProperties> {
        self.entries.lock().ok()?.get(&id).cloned()
    }

    fn put(&self, value: &EntityWithProperties) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(value.entity.id, value.clone());
        }
    }
}

/// Read-through property access over the store and providers.
#[derive(Clone)]
pub struct PropertiesService {
    db: Database,
    ttl: CacheTtl,
    metrics: Option<EngineMetrics>,
}

impl PropertiesService {
    /// Creates a service with the given freshness window.
    #[must_use]
    pub fn new(db: Database, ttl: CacheTtl) -> Self {
        Self {
            db,
            ttl,
            metrics: None,
        }
    }

    /// Attaches cache and fetch instrumentation.
    #[must_use]
    pub fn with_metrics(mut self, metrics: EngineMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn record_cache(&self, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.property_cache(outcome);
        }
    }

    fn record_fetch(&self, entity_type: EntityType) {
        if let Some(metrics) = &self.metrics {
            metrics.provider_fetch(entity_type.as_str());
        }
    }

    /// Retrieves the full property set for an entity identified by lookup
    /// properties, hitting the provider when the cache is stale.
    ///
    /// The entity is resolved by `upstream_id` first, then by provider
    /// name. When it resolves to a registered entity, the fetched set is
    /// persisted; unregistered entities are fetched but never written.
    #[instrument(skip_all, fields(entity_type = %entity_type))]
    pub async fn retrieve_all_properties(
        &self,
        provider: &dyn Provider,
        project_id: Uuid,
        provider_id: Uuid,
        lookup: &Properties,
        entity_type: EntityType,
        opts: &ReadOptions,
    ) -> Result<Properties, ServiceError> {
        let entity_id = self
            .resolve_entity_id(provider, project_id, provider_id, entity_type, lookup)?
            .map(|e| e.id);
        self.retrieve_all_inner(provider, entity_id, entity_type, lookup, opts)
            .await
    }

    /// Refreshes the properties of an already-resolved entity in place.
    pub async fn retrieve_all_properties_by_entity(
        &self,
        ewp: &mut EntityWithProperties,
        provider: &dyn Provider,
        opts: &ReadOptions,
    ) -> Result<(), ServiceError> {
        let lookup = ewp.properties.clone();
        let props = self
            .retrieve_all_inner(
                provider,
                Some(ewp.entity.id),
                ewp.entity.entity_type,
                &lookup,
                opts,
            )
            .await?;
        ewp.update_properties(props);
        Ok(())
    }

    /// Retrieves a single property, hitting the provider when the cached
    /// row is stale or absent.
    pub async fn retrieve_property(
        &self,
        provider: &dyn Provider,
        project_id: Uuid,
        provider_id: Uuid,
        lookup: &Properties,
        entity_type: EntityType,
        key: &str,
        opts: &ReadOptions,
    ) -> Result<Property, ServiceError> {
        let entity = self.resolve_entity_id(provider, project_id, provider_id, entity_type, lookup)?;

        if let Some(entity) = &entity {
            if let Some(row) = self.db.get_property(entity.id, key)? {
                let fresh = self.ttl.is_fresh(&row, Utc::now().timestamp());
                if opts.tolerate_stale || fresh {
                    self.record_cache(if fresh { "hit" } else { "stale" });
                    return Ok(row.value);
                }
            }
        }

        self.record_cache("miss");
        self.record_fetch(entity_type);
        let fetched = provider
            .fetch_property(lookup, entity_type, key)
            .await
            .map_err(|err| match err {
                ProviderError::MissingProperty { key } => ServiceError::PropertyNotFound { key },
                other => ServiceError::from(other),
            })?;

        if let Some(entity) = entity {
            self.db
                .with_tx(|tx| tx.upsert_property(entity.id, key, &fetched))?;
        }
        Ok(fetched)
    }

    /// Atomically replaces the entire persisted property set of an entity.
    pub fn replace_all_properties(
        &self,
        entity_id: Uuid,
        props: &Properties,
    ) -> Result<(), ServiceError> {
        self.db.with_tx(|tx| {
            tx.delete_all_properties(entity_id)?;
            for (key, prop) in props.iter() {
                tx.upsert_property(entity_id, key, prop)?;
            }
            Ok(())
        })?;
        Ok(())
    }

    /// Persists every given property, leaving other cached keys in place.
    pub fn save_all_properties(
        &self,
        entity_id: Uuid,
        props: &Properties,
    ) -> Result<(), ServiceError> {
        self.db.with_tx(|tx| {
            for (key, prop) in props.iter() {
                tx.upsert_property(entity_id, key, prop)?;
            }
            Ok(())
        })?;
        Ok(())
    }

    /// Persists one property; `None` deletes the cached row.
    pub fn replace_property(
        &self,
        entity_id: Uuid,
        key: &str,
        prop: Option<&Property>,
    ) -> Result<(), ServiceError> {
        self.db.with_tx(|tx| match prop {
            Some(prop) => tx.upsert_property(entity_id, key, prop),
            None => tx.delete_property(entity_id, key),
        })?;
        Ok(())
    }

    /// Loads an entity and its full cached property set by internal id.
    ///
    /// Reads are store-only; staleness does not apply here. The request
    /// cache short-circuits repeated loads within one handling pass.
    pub fn entity_with_properties_by_id(
        &self,
        entity_id: Uuid,
        cache: Option<&RequestCache>,
    ) -> Result<EntityWithProperties, ServiceError> {
        if let Some(hit) = cache.and_then(|c| c.get(entity_id)) {
            return Ok(hit);
        }

        let entity = self
            .db
            .get_entity_by_id(entity_id)?
            .ok_or(ServiceError::EntityNotFound)?;
        let props = rows_to_properties(self.db.get_all_properties_for_entity(entity_id)?);
        let ewp = EntityWithProperties::new(entity, props);
        if let Some(cache) = cache {
            cache.put(&ewp);
        }
        Ok(ewp)
    }

    /// Resolves an entity by upstream properties when project and provider
    /// are not yet known, narrowing candidates by the resolution hint.
    ///
    /// Matches by `upstream_id` first, then by name across every provider
    /// the hint admits. Exactly one match is required.
    pub fn entity_with_properties_by_upstream_hint(
        &self,
        entity_type: EntityType,
        get_by: &Properties,
        hint: &EntityHint,
        providers: &ProviderManager,
    ) -> Result<EntityWithProperties, ServiceError> {
        let mut matched = Vec::new();

        if let Some(upstream_id) = get_by.get(PROP_UPSTREAM_ID) {
            for entity in self.db.get_typed_entities_by_property(
                entity_type,
                PROP_UPSTREAM_ID,
                upstream_id,
                EntityFilter::default(),
            )? {
                let record = self
                    .db
                    .get_provider_record(entity.provider_id)?
                    .ok_or(RegistryError::UnknownProvider {
                        id: entity.provider_id,
                    })?;
                if crate::providers::registry::record_matches_hint(&record, hint) {
                    matched.push(entity);
                }
            }
        }

        if matched.is_empty() {
            let name = get_by.get_string(PROP_NAME);
            if !name.is_empty() {
                for (record, _) in providers.find_by_hint(hint, None)? {
                    if let Some(entity) = self.db.get_entity_by_name(
                        record.project_id,
                        record.id,
                        entity_type,
                        &name,
                    )? {
                        matched.push(entity);
                    }
                }
            }
        }

        match matched.len() {
            0 => Err(ServiceError::EntityNotFound),
            1 => {
                let entity = matched.remove(0);
                let props = rows_to_properties(self.db.get_all_properties_for_entity(entity.id)?);
                Ok(EntityWithProperties::new(entity, props))
            }
            count => Err(ServiceError::MultipleEntities { count }),
        }
    }

    /// Converts an entity's property set into its typed bus message via
    /// the owning provider.
    pub fn entity_with_properties_as_proto(
        &self,
        ewp: &EntityWithProperties,
        providers: &ProviderManager,
    ) -> Result<EntityMessage, ServiceError> {
        let provider = providers.instantiate(ewp.entity.provider_id)?;
        Ok(provider.properties_to_message(ewp.entity.entity_type, &ewp.properties)?)
    }

    async fn retrieve_all_inner(
        &self,
        provider: &dyn Provider,
        entity_id: Option<Uuid>,
        entity_type: EntityType,
        lookup: &Properties,
        opts: &ReadOptions,
    ) -> Result<Properties, ServiceError> {
        let mut cached = None;
        if let Some(id) = entity_id {
            let rows = self.db.get_all_properties_for_entity(id)?;
            if !rows.is_empty() {
                let now = Utc::now().timestamp();
                let all_fresh = rows.iter().all(|row| self.ttl.is_fresh(row, now));
                let props = rows_to_properties(rows);
                if opts.tolerate_stale || all_fresh {
                    self.record_cache(if all_fresh { "hit" } else { "stale" });
                    debug!(entity_id = %id, "serving cached properties");
                    return Ok(props);
                }
                cached = Some(props);
            }
        }

        self.record_cache("miss");
        self.record_fetch(entity_type);
        let fetched = provider
            .fetch_all_properties(lookup, entity_type, cached.as_ref())
            .await?;
        let merged = lookup.merge(&fetched);

        if let Some(id) = entity_id {
            debug!(entity_id = %id, count = merged.len(), "persisting refreshed properties");
            self.db.with_tx(|tx| {
                tx.delete_all_properties(id)?;
                for (key, prop) in merged.iter() {
                    tx.upsert_property(id, key, prop)?;
                }
                Ok(())
            })?;
        }
        Ok(merged)
    }

    /// Resolves lookup properties to a registered entity: by upstream id,
    /// then by the provider-derived name. `None` means not yet registered.
    fn resolve_entity_id(
        &self,
        provider: &dyn Provider,
        project_id: Uuid,
        provider_id: Uuid,
        entity_type: EntityType,
        lookup: &Properties,
    ) -> Result<Option<minder_core::entities::Entity>, ServiceError> {
        let filter = EntityFilter {
            project_id: Some(project_id),
            provider_id: Some(provider_id),
        };
        if let Some(upstream_id) = lookup.get(PROP_UPSTREAM_ID) {
            let mut found = self.db.get_typed_entities_by_property(
                entity_type,
                PROP_UPSTREAM_ID,
                upstream_id,
                filter,
            )?;
            match found.len() {
                0 => {}
                1 => return Ok(Some(found.remove(0))),
                count => return Err(ServiceError::MultipleEntities { count }),
            }
        }

        if let Ok(name) = provider.entity_name(entity_type, lookup) {
            if let Some(entity) =
                self.db
                    .get_entity_by_name(project_id, provider_id, entity_type, &name)?
            {
                return Ok(Some(entity));
            }
        }
        Ok(None)
    }
}

fn rows_to_properties(rows: Vec<PropertyRow>) -> Properties {
    rows.into_iter().map(|row| (row.key, row.value)).collect()
}
