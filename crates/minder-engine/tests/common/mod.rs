//! Shared harness for the pipeline integration tests: a scripted provider,
//! a recording evaluator, and a started pipeline over an in-memory store.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use minder_core::entities::{
    EntityType, Properties, Property,
    properties::{PROP_NAME, PROP_UPSTREAM_ID},
};
use minder_core::events::envelope::EntityEnvelope;
use minder_core::events::{EntityHint, Message, TOPIC_ENTITY_FLUSH};
use minder_core::proto::{EntityMessage, PullRequest, Repository};
use minder_core::providers::{Provider, ProviderError};
use minder_engine::config::EngineConfig;
use minder_engine::executor::{Evaluator, ExecutorError};
use minder_engine::pipeline::Pipeline;
use minder_engine::providers::ProviderManager;
use minder_engine::store::{Database, ProjectFlags, ProviderRecord};
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Provider whose upstream answers are scripted by the test.
#[derive(Debug)]
pub struct ScriptedProvider {
    upstream: Mutex<Properties>,
    fetch_all_calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            upstream: Mutex::new(Properties::new()),
            fetch_all_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_upstream(&self, props: Properties) {
        *self.upstream.lock().unwrap() = props;
    }

    pub fn fetch_all_count(&self) -> usize {
        self.fetch_all_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn class(&self) -> &str {
        "scripted"
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

/// Evaluator that records every admitted envelope; flips to failing when
/// asked.
pub struct RecordingEvaluator {
    envelopes: Mutex<Vec<EntityEnvelope>>,
    fail: AtomicBool,
}

impl RecordingEvaluator {
    pub fn new() -> Self {
        Self {
            envelopes: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        }
    }

    pub fn fail_next(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn envelopes(&self) -> Vec<EntityEnvelope> {
        self.envelopes.lock().unwrap().clone()
    }
}

#[async_trait]
impl Evaluator for RecordingEvaluator {
    async fn evaluate(&self, envelope: &EntityEnvelope) -> Result<(), ExecutorError> {
        self.envelopes.lock().unwrap().push(envelope.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(ExecutorError::Evaluation {
                message: "profile evaluation rejected the entity".to_owned(),
            });
        }
        Ok(())
    }
}

/// A started pipeline over a seeded in-memory store.
///
/// The router runs in wait-for-ack mode, so `publish` resolves only once
/// the whole handler-executor-flush cascade for that message settled.
pub struct Harness {
    pub pipeline: Pipeline,
    pub db: Database,
    pub provider: Arc<ScriptedProvider>,
    pub evaluator: Arc<RecordingEvaluator>,
    pub registry: prometheus::Registry,
    pub project_id: Uuid,
    pub provider_id: Uuid,
    pub flush: mpsc::UnboundedReceiver<Message>,
}

impl Harness {
    pub async fn start() -> Self {
        let config = EngineConfig::from_toml("[router]\nwait_for_ack = true\n").unwrap();
        Self::start_with(&config).await
    }

    pub async fn start_with(config: &EngineConfig) -> Self {
        let db = Database::open_in_memory().unwrap();
        let project_id = Uuid::new_v4();
        let provider_id = Uuid::new_v4();
        db.with_tx(|tx| {
            tx.upsert_project(project_id, "testproj", ProjectFlags::default())?;
            tx.upsert_provider(&ProviderRecord {
                id: provider_id,
                project_id,
                name: "scripted".to_owned(),
                class: "scripted".to_owned(),
                implements: vec!["scripted-api".to_owned()],
            })
        })
        .unwrap();

        let provider = Arc::new(ScriptedProvider::new());
        let shared = Arc::clone(&provider);
        let mut manager = ProviderManager::new(db.clone());
        manager.register_class(
            "scripted",
            Arc::new(move |_record: &ProviderRecord| {
                Ok(Arc::clone(&shared) as Arc<dyn Provider>)
            }),
        );

        let evaluator = Arc::new(RecordingEvaluator::new());
        let registry = prometheus::Registry::new();
        let pipeline = Pipeline::start(
            db.clone(),
            Arc::new(manager),
            Arc::clone(&evaluator) as Arc<dyn Evaluator>,
            config,
            &registry,
        )
        .await
        .unwrap();

        let flush = drain(&pipeline, TOPIC_ENTITY_FLUSH).await;
        Self {
            pipeline,
            db,
            provider,
            evaluator,
            registry,
            project_id,
            provider_id,
            flush,
        }
    }

    /// Registers a repository entity without any cached properties.
    pub fn register_repo(&self, name: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.db
            .with_tx(|tx| {
                tx.create_or_ensure_entity_by_id(
                    id,
                    EntityType::Repository,
                    name,
                    self.project_id,
                    self.provider_id,
                    None,
                )
            })
            .unwrap();
        id
    }

    /// Receives the next flushed envelope.
    pub async fn recv_flush(&mut self) -> EntityEnvelope {
        let message = timeout(RECV_TIMEOUT, self.flush.recv())
            .await
            .expect("timed out waiting for flush")
            .expect("flush subscription ended");
        EntityEnvelope::from_message(&message).unwrap()
    }
}

/// Subscribes to `topic`, acknowledging every delivery and forwarding the
/// raw messages. Keeps wait-for-ack publishes from blocking on the test.
pub async fn drain(pipeline: &Pipeline, topic: &str) -> mpsc::UnboundedReceiver<Message> {
    let mut rx = pipeline.subscribe(topic).await;
    let (tx, out) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(delivery) = rx.recv().await {
            let _ = tx.send(delivery.message.clone());
            delivery.ack();
        }
    });
    out
}

pub async fn recv_message(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
    timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for message")
        .expect("subscription ended")
}

/// Upstream property set for a repository.
pub fn repo_upstream(name: &str, fork: bool) -> Properties {
    let mut props = Properties::new();
    props
        .set(PROP_UPSTREAM_ID, Property::from_string("123"))
        .unwrap();
    props.set(PROP_NAME, Property::from_string(name)).unwrap();
    props.set("is_fork", Property::from_bool(fork)).unwrap();
    props
}

/// Upstream property set for a pull request.
pub fn pr_upstream(url: &str, number: u64) -> Properties {
    let mut props = Properties::new();
    props
        .set(PROP_UPSTREAM_ID, Property::from_string("999"))
        .unwrap();
    props.set(PROP_NAME, Property::from_string(url)).unwrap();
    props
        .set("number", Property::from_uint64(number))
        .unwrap();
    props
        .set("title", Property::from_string("fix all the things"))
        .unwrap();
    props
}

/// Lookup properties carrying only the entity name.
pub fn by_name(name: &str) -> Properties {
    let mut props = Properties::new();
    props.set(PROP_NAME, Property::from_string(name)).unwrap();
    props
}

/// The provider hint every inbound message carries.
pub fn hint() -> EntityHint {
    EntityHint {
        provider_class: Some("scripted".to_owned()),
        provider_implements: None,
    }
}
