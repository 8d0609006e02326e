//! Provider manager: class builders, instantiation cache, hint lookup.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use minder_core::events::EntityHint;
use minder_core::providers::Provider;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::store::{Database, ProviderRecord, StoreError};

/// Errors raised while resolving providers.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RegistryError {
    /// No provider row exists for the requested id.
    #[error("provider {id} is not configured")]
    UnknownProvider {
        /// The missing provider id.
        id: Uuid,
    },

    /// A provider row names a class no builder was registered for.
    #[error("no builder registered for provider class {class:?}")]
    UnknownClass {
        /// The unregistered class.
        class: String,
    },

    /// A builder failed to construct its provider.
    #[error("provider construction failed: {message}")]
    Build {
        /// Builder-supplied failure description.
        message: String,
    },

    /// The provider table could not be read.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The instance cache lock was poisoned.
    #[error("provider cache lock poisoned")]
    Poisoned,
}

/// Constructs a live provider from its stored configuration row.
pub type ProviderBuilder =
    Arc<dyn Fn(&ProviderRecord) -> Result<Arc<dyn Provider>, RegistryError> + Send + Sync>;

/// Resolves provider ids and hints to live [`Provider`] instances.
///
/// Builders are registered once per class at startup. Instantiated
/// providers are cached by id, so a burst of messages for one provider
/// shares a single client.
pub struct ProviderManager {
    db: Database,
    builders: HashMap<String, ProviderBuilder>,
    instances: RwLock<HashMap<Uuid, Arc<dyn Provider>>>,
}

impl ProviderManager {
    /// Creates an empty manager over the given store.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self {
            db,
            builders: HashMap::new(),
            instances: RwLock::new(HashMap::new()),
        }
    }

    /// Registers the builder for one provider class, replacing any
    /// previous registration.
    pub fn register_class(&mut self, class: impl Into<String>, builder: ProviderBuilder) {
        self.builders.insert(class.into(), builder);
    }

    /// Returns the live provider for `provider_id`, constructing and
    /// caching it on first use.
    pub fn instantiate(&self, provider_id: Uuid) -> Result<Arc<dyn Provider>, RegistryError> {
        if let Some(provider) = self
            .instances
            .read()
            .map_err(|_| RegistryError::Poisoned)?
            .get(&provider_id)
        {
            return Ok(Arc::clone(provider));
        }

        let record = self
            .db
            .get_provider_record(provider_id)?
            .ok_or(RegistryError::UnknownProvider { id: provider_id })?;
        let provider = self.build(&record)?;

        let mut cache = self.instances.write().map_err(|_| RegistryError::Poisoned)?;
        // A concurrent caller may have built the same provider; keep the
        // first one so all holders share a client.
        Ok(Arc::clone(
            cache.entry(provider_id).or_insert(provider),
        ))
    }

    /// Returns every configured provider matching `hint`, instantiated.
    ///
    /// An empty hint matches all providers. Results are scoped to
    /// `project_id` when given.
    pub fn find_by_hint(
        &self,
        hint: &EntityHint,
        project_id: Option<Uuid>,
    ) -> Result<Vec<(ProviderRecord, Arc<dyn Provider>)>, RegistryError> {
        let mut matched = Vec::new();
        for record in self.db.list_provider_records()? {
            if let Some(project) = project_id {
                if record.project_id != project {
                    continue;
                }
            }
            if !record_matches_hint(&record, hint) {
                continue;
            }
            let provider = self.instantiate(record.id)?;
            matched.push((record, provider));
        }
        Ok(matched)
    }

    fn build(&self, record: &ProviderRecord) -> Result<Arc<dyn Provider>, RegistryError> {
        let builder = self
            .builders
            .get(&record.class)
            .ok_or_else(|| RegistryError::UnknownClass {
                class: record.class.clone(),
            })?;
        debug!(provider_id = %record.id, class = %record.class, "instantiating provider");
        builder(record)
    }
}

impl std::fmt::Debug for ProviderManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderManager")
            .field("classes", &self.builders.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

pub(crate) fn record_matches_hint(record: &ProviderRecord, hint: &EntityHint) -> bool {
    if let Some(implements) = &hint.provider_implements {
        if !record.implements.iter().any(|i| i == implements) {
            return false;
        }
    }
    if let Some(class) = &hint.provider_class {
        if record.class != *class {
            return false;
        }
    }
    true
}
