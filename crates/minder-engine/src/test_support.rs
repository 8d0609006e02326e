//! Fixtures shared across unit tests: a scripted provider and a seeded
//! in-memory store.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use minder_core::entities::{
    EntityType, Properties, Property,
    properties::{PROP_NAME, PROP_UPSTREAM_ID},
};
use minder_core::proto::{EntityMessage, PullRequest, Repository};
use minder_core::providers::{Provider, ProviderError};
use uuid::Uuid;

use crate::providers::ProviderManager;
use crate::store::{Database, ProjectFlags, ProviderRecord};

/// Provider whose upstream answers are scripted by the test.
#[derive(Debug)]
pub(crate) struct FakeProvider {
    upstream: Mutex<Properties>,
    pub(crate) fetch_all_calls: AtomicUsize,
    pub(crate) fetch_one_calls: AtomicUsize,
}

impl FakeProvider {
    pub(crate) fn new(upstream: Properties) -> Self {
        Self {
            upstream: Mutex::new(upstream),
            fetch_all_calls: AtomicUsize::new(0),
            fetch_one_calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn set_upstream(&self, props: Properties) {
        *self.upstream.lock().unwrap() = props;
    }

    pub(crate) fn fetch_all_count(&self) -> usize {
        self.fetch_all_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for FakeProvider {
    fn class(&self) -> &str {
        "fake"
    }

    fn implements(&self) -> &[String] {
        &[]
    }

    fn supports_entity_type(&self, entity_type: EntityType) -> bool {
        matches!(
            entity_type,
            EntityType::Repository | EntityType::PullRequest
        )
    }

    async fn fetch_all_properties(
        &self,
        _lookup: &Properties,
        _entity_type: EntityType,
        _cached: Option<&Properties>,
    ) -> Result<Properties, ProviderError> {
        self.fetch_all_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.upstream.lock().unwrap().clone())
    }

    async fn fetch_property(
        &self,
        _lookup: &Properties,
        _entity_type: EntityType,
        key: &str,
    ) -> Result<Property, ProviderError> {
        self.fetch_one_calls.fetch_add(1, Ordering::SeqCst);
        self.upstream
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| ProviderError::MissingProperty {
                key: key.to_owned(),
            })
    }

    fn properties_to_message(
        &self,
        entity_type: EntityType,
        props: &Properties,
    ) -> Result<EntityMessage, ProviderError> {
        match entity_type {
            EntityType::Repository => Ok(EntityMessage::Repository(Repository {
                name: props.get_string(PROP_NAME),
                is_fork: props.get_bool("is_fork"),
                is_private: props.get_bool("is_private"),
                is_archived: props.get_bool("is_archived"),
                ..Repository::default()
            })),
            EntityType::PullRequest => Ok(EntityMessage::PullRequest(PullRequest {
                url: props.get_string(PROP_NAME),
                number: props.get_uint64("number"),
                title: props.get_string("title"),
                ..PullRequest::default()
            })),
            other => Err(ProviderError::UnsupportedEntityType(other)),
        }
    }

    fn entity_name(
        &self,
        _entity_type: EntityType,
        props: &Properties,
    ) -> Result<String, ProviderError> {
        let name = props.get_string(PROP_NAME);
        if name.is_empty() {
            return Err(ProviderError::MissingProperty {
                key: PROP_NAME.to_owned(),
            });
        }
        Ok(name)
    }
}

/// In-memory store seeded with one project and one `fake`-class provider.
pub(crate) struct StoreFixture {
    pub(crate) db: Database,
    pub(crate) project_id: Uuid,
    pub(crate) provider_id: Uuid,
}

pub(crate) fn store_fixture() -> StoreFixture {
    let db = Database::open_in_memory().unwrap();
    let project_id = Uuid::new_v4();
    let provider_id = Uuid::new_v4();
    db.with_tx(|tx| {
        tx.upsert_project(project_id, "p", ProjectFlags::default())?;
        tx.upsert_provider(&ProviderRecord {
            id: provider_id,
            project_id,
            name: "fake".to_owned(),
            class: "fake".to_owned(),
            implements: vec!["fake-api".to_owned()],
        })
    })
    .unwrap();
    StoreFixture {
        db,
        project_id,
        provider_id,
    }
}

/// Manager whose `fake` class instantiates to one shared provider.
pub(crate) fn fake_manager(db: Database, provider: Arc<FakeProvider>) -> Arc<ProviderManager> {
    let mut manager = ProviderManager::new(db);
    manager.register_class(
        "fake",
        Arc::new(move |_record: &ProviderRecord| {
            Ok(Arc::clone(&provider) as Arc<dyn Provider>)
        }),
    );
    Arc::new(manager)
}

pub(crate) fn upstream_props(name: &str, fork: bool) -> Properties {
    let mut props = Properties::new();
    props
        .set(PROP_UPSTREAM_ID, Property::from_string("123"))
        .unwrap();
    props.set(PROP_NAME, Property::from_string(name)).unwrap();
    props.set("is_fork", Property::from_bool(fork)).unwrap();
    props
}

pub(crate) fn lookup_by_name(name: &str) -> Properties {
    let mut props = Properties::new();
    props.set(PROP_NAME, Property::from_string(name)).unwrap();
    props
}

pub(crate) fn register_repo(f: &StoreFixture, name: &str) -> Uuid {
    let id = Uuid::new_v4();
    f.db.with_tx(|tx| {
        tx.create_or_ensure_entity_by_id(
            id,
            EntityType::Repository,
            name,
            f.project_id,
            f.provider_id,
            None,
        )
    })
    .unwrap();
    id
}
