//! Handler tests: strategy composition, forwarding checks, topic output.

use std::sync::Arc;

use minder_core::entities::{Properties, Property};
use minder_core::events::envelope::EntityEnvelope;
use minder_core::events::{
    EntityDeleteEvent, TOPIC_ENTITY_EVALUATE, TOPIC_ORIGINATING_ENTITY_ADD,
    TOPIC_ORIGINATING_ENTITY_DELETE, TOPIC_RECONCILE_ENTITY_DELETE,
    TOPIC_REFRESH_ENTITY_AND_EVALUATE, TOPIC_REFRESH_ENTITY_BY_ID_AND_EVALUATE,
};
use minder_core::proto::EntityMessage;
use minder_core::entities::properties::PROP_UPSTREAM_ID;

use crate::metrics::EngineMetrics;
use crate::service::{CacheTtl, PropertiesService};
use crate::store::ProjectFlags;
use crate::test_support::{
    FakeProvider, StoreFixture, fake_manager, register_repo, store_fixture, upstream_props,
};

use super::*;

struct HandlerFixture {
    store: StoreFixture,
    provider: Arc<FakeProvider>,
    providers: Arc<crate::providers::ProviderManager>,
    svc: Arc<PropertiesService>,
    router: Arc<TopicRouter>,
    metrics: EngineMetrics,
}

fn handler_fixture(upstream: Properties) -> HandlerFixture {
    let store = store_fixture();
    let provider = Arc::new(FakeProvider::new(upstream));
    let providers = fake_manager(store.db.clone(), Arc::clone(&provider));
    let svc = Arc::new(PropertiesService::new(store.db.clone(), CacheTtl::default()));
    let router = TopicRouter::new(16, false);
    let metrics = EngineMetrics::new(&prometheus::Registry::new()).unwrap();
    HandlerFixture {
        store,
        provider,
        providers,
        svc,
        router,
        metrics,
    }
}

impl HandlerFixture {
    fn refresh_handler(&self) -> EntityHandler {
        EntityHandler::new(
            TOPIC_REFRESH_ENTITY_AND_EVALUATE,
            TOPIC_ENTITY_EVALUATE,
            Arc::new(RefreshByUpstreamPropsStrategy::new(
                Arc::clone(&self.svc),
                Arc::clone(&self.providers),
            )),
            Arc::new(ToEntityEnvelope::new(
                Arc::clone(&self.svc),
                Arc::clone(&self.providers),
            )),
            self.store.db.clone(),
            Arc::clone(&self.router),
            self.metrics.clone(),
        )
    }
}

fn get_by_upstream_id() -> Properties {
    let mut props = Properties::new();
    props
        .set(PROP_UPSTREAM_ID, Property::from_string("123"))
        .unwrap();
    props
}

#[tokio::test]
async fn test_refresh_forwards_an_envelope() {
    let fx = handler_fixture(upstream_props("org/repo", false));
    let id = register_repo(&fx.store, "org/repo");
    fx.svc
        .replace_all_properties(id, &upstream_props("org/repo", false))
        .unwrap();

    let mut rx = fx.router.subscribe(TOPIC_ENTITY_EVALUATE).await;
    let handler = fx.refresh_handler();

    let msg = HandleEntityAndDoMessage::for_entity(EntityType::Repository, &get_by_upstream_id())
        .to_message()
        .unwrap();
    handler.handle(&msg).await.unwrap();

    let delivery = rx.recv().await.unwrap();
    let envelope = EntityEnvelope::from_message(&delivery.message).unwrap();
    assert_eq!(envelope.entity_id, Some(id));
    assert_eq!(envelope.project_id, fx.store.project_id);
    match &envelope.body {
        EntityMessage::Repository(repo) => assert_eq!(repo.name, "org/repo"),
        other => panic!("unexpected body: {other:?}"),
    }
}

#[tokio::test]
async fn test_match_properties_mismatch_drops() {
    let fx = handler_fixture(upstream_props("org/repo", false));
    let id = register_repo(&fx.store, "org/repo");
    fx.svc
        .replace_all_properties(id, &upstream_props("org/repo", false))
        .unwrap();

    let mut rx = fx.router.subscribe(TOPIC_ENTITY_EVALUATE).await;
    let handler = fx.refresh_handler();

    let mut wanted = Properties::new();
    wanted.set("is_fork", Property::from_bool(true)).unwrap();
    let msg = HandleEntityAndDoMessage::for_entity(EntityType::Repository, &get_by_upstream_id())
        .with_match_props(&wanted)
        .to_message()
        .unwrap();
    handler.handle(&msg).await.unwrap();

    assert!(rx.try_recv().is_err());
    assert!(
        (fx.metrics
            .messages(TOPIC_REFRESH_ENTITY_AND_EVALUATE, "dropped")
            - 1.0)
            .abs()
            < f64::EPSILON
    );
}

#[tokio::test]
async fn test_archived_repository_never_forwards() {
    let mut upstream = upstream_props("org/repo", false);
    upstream
        .set("is_archived", Property::from_bool(true))
        .unwrap();
    let fx = handler_fixture(upstream.clone());
    let id = register_repo(&fx.store, "org/repo");
    fx.svc.replace_all_properties(id, &upstream).unwrap();

    let mut rx = fx.router.subscribe(TOPIC_ENTITY_EVALUATE).await;
    let handler = fx.refresh_handler();

    let msg = HandleEntityAndDoMessage::for_entity(EntityType::Repository, &get_by_upstream_id())
        .to_message()
        .unwrap();
    handler.handle(&msg).await.unwrap();
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_private_repository_honors_project_flag() {
    let mut upstream = upstream_props("org/repo", false);
    upstream
        .set("is_private", Property::from_bool(true))
        .unwrap();
    let fx = handler_fixture(upstream.clone());
    let id = register_repo(&fx.store, "org/repo");
    fx.svc.replace_all_properties(id, &upstream).unwrap();

    let mut rx = fx.router.subscribe(TOPIC_ENTITY_EVALUATE).await;
    let handler = fx.refresh_handler();
    let msg = HandleEntityAndDoMessage::for_entity(EntityType::Repository, &get_by_upstream_id())
        .to_message()
        .unwrap();

    // Default project flags exclude private repositories.
    handler.handle(&msg).await.unwrap();
    assert!(rx.try_recv().is_err());

    fx.store
        .db
        .with_tx(|tx| {
            tx.upsert_project(
                fx.store.project_id,
                "p",
                ProjectFlags {
                    allow_private_repositories: true,
                },
            )
        })
        .unwrap();
    handler.handle(&msg).await.unwrap();
    assert!(rx.recv().await.is_some());
}

#[tokio::test]
async fn test_add_originating_registers_a_child() {
    let fx = handler_fixture(Properties::new());
    let repo_id = register_repo(&fx.store, "org/repo");
    fx.svc
        .replace_all_properties(repo_id, &upstream_props("org/repo", false))
        .unwrap();

    // The provider answers child fetches with the pull request's set.
    let mut pr_props = Properties::new();
    pr_props
        .set(PROP_UPSTREAM_ID, Property::from_string("789"))
        .unwrap();
    pr_props
        .set(
            minder_core::entities::properties::PROP_NAME,
            Property::from_string("org/repo/1"),
        )
        .unwrap();
    pr_props
        .set("number", Property::from_uint64(1))
        .unwrap();
    fx.provider.set_upstream(pr_props.clone());

    let mut rx = fx.router.subscribe(TOPIC_ENTITY_EVALUATE).await;
    let handler = EntityHandler::new(
        TOPIC_ORIGINATING_ENTITY_ADD,
        TOPIC_ENTITY_EVALUATE,
        Arc::new(AddOriginatingEntityStrategy::new(
            Arc::clone(&fx.svc),
            Arc::clone(&fx.providers),
            fx.store.db.clone(),
        )),
        Arc::new(ToEntityEnvelope::new(
            Arc::clone(&fx.svc),
            Arc::clone(&fx.providers),
        )),
        fx.store.db.clone(),
        Arc::clone(&fx.router),
        fx.metrics.clone(),
    );

    let msg = HandleEntityAndDoMessage::for_entity(EntityType::PullRequest, &pr_props)
        .with_originator(EntityType::Repository, &get_by_upstream_id())
        .to_message()
        .unwrap();
    handler.handle(&msg).await.unwrap();

    let child = fx
        .store
        .db
        .get_entity_by_name(
            fx.store.project_id,
            fx.store.provider_id,
            EntityType::PullRequest,
            "org/repo/1",
        )
        .unwrap()
        .expect("child entity missing");
    assert_eq!(child.originated_from, Some(repo_id));
    assert!(
        !fx.store
            .db
            .get_all_properties_for_entity(child.id)
            .unwrap()
            .is_empty()
    );

    let delivery = rx.recv().await.unwrap();
    let envelope = EntityEnvelope::from_message(&delivery.message).unwrap();
    assert_eq!(envelope.entity_id, Some(child.id));
    match &envelope.body {
        EntityMessage::PullRequest(pr) => assert_eq!(pr.number, 1),
        other => panic!("unexpected body: {other:?}"),
    }
}

#[tokio::test]
async fn test_del_originating_removes_the_child() {
    let fx = handler_fixture(Properties::new());
    let repo_id = register_repo(&fx.store, "org/repo");
    fx.svc
        .replace_all_properties(repo_id, &upstream_props("org/repo", false))
        .unwrap();

    let child_id = uuid::Uuid::new_v4();
    fx.store
        .db
        .with_tx(|tx| {
            tx.create_or_ensure_entity_by_id(
                child_id,
                EntityType::PullRequest,
                "org/repo/1",
                fx.store.project_id,
                fx.store.provider_id,
                Some(repo_id),
            )
        })
        .unwrap();

    let handler = EntityHandler::new(
        TOPIC_ORIGINATING_ENTITY_DELETE,
        TOPIC_ENTITY_EVALUATE,
        Arc::new(DelOriginatingEntityStrategy::new(
            Arc::clone(&fx.svc),
            Arc::clone(&fx.providers),
            fx.store.db.clone(),
        )),
        Arc::new(ToEmpty),
        fx.store.db.clone(),
        Arc::clone(&fx.router),
        fx.metrics.clone(),
    );

    let mut child_lookup = Properties::new();
    child_lookup
        .set(
            minder_core::entities::properties::PROP_NAME,
            Property::from_string("org/repo/1"),
        )
        .unwrap();
    let msg = HandleEntityAndDoMessage::for_entity(EntityType::PullRequest, &child_lookup)
        .with_originator(EntityType::Repository, &get_by_upstream_id())
        .to_message()
        .unwrap();
    handler.handle(&msg).await.unwrap();

    assert!(fx.store.db.get_entity_by_id(child_id).unwrap().is_none());
}

#[tokio::test]
async fn test_get_and_delete_emits_the_id_event() {
    let fx = handler_fixture(Properties::new());
    let id = register_repo(&fx.store, "org/repo");
    fx.svc
        .replace_all_properties(id, &upstream_props("org/repo", false))
        .unwrap();

    let mut rx = fx.router.subscribe(TOPIC_RECONCILE_ENTITY_DELETE).await;
    let handler = EntityHandler::new(
        minder_core::events::TOPIC_GET_ENTITY_AND_DELETE,
        TOPIC_RECONCILE_ENTITY_DELETE,
        Arc::new(GetEntityByUpstreamIdStrategy::new(
            Arc::clone(&fx.svc),
            Arc::clone(&fx.providers),
        )),
        Arc::new(ToEntityDeleteEvent),
        fx.store.db.clone(),
        Arc::clone(&fx.router),
        fx.metrics.clone(),
    );

    let msg = HandleEntityAndDoMessage::for_entity(EntityType::Repository, &get_by_upstream_id())
        .to_message()
        .unwrap();
    handler.handle(&msg).await.unwrap();

    // The get strategy never fetched upstream; the entity is gone there.
    assert_eq!(fx.provider.fetch_all_count(), 0);

    let delivery = rx.recv().await.unwrap();
    let event = EntityDeleteEvent::from_message(&delivery.message).unwrap();
    assert_eq!(event.entity_id, id);
    assert_eq!(event.entity_type().unwrap(), EntityType::Repository);
}

#[tokio::test]
async fn test_refresh_by_id_requires_the_id() {
    let fx = handler_fixture(Properties::new());
    let handler = EntityHandler::new(
        TOPIC_REFRESH_ENTITY_BY_ID_AND_EVALUATE,
        TOPIC_ENTITY_EVALUATE,
        Arc::new(RefreshByIdStrategy::new(
            Arc::clone(&fx.svc),
            Arc::clone(&fx.providers),
        )),
        Arc::new(ToEntityEnvelope::new(
            Arc::clone(&fx.svc),
            Arc::clone(&fx.providers),
        )),
        fx.store.db.clone(),
        Arc::clone(&fx.router),
        fx.metrics.clone(),
    );

    let msg = HandleEntityAndDoMessage::for_entity(EntityType::Repository, &get_by_upstream_id())
        .to_message()
        .unwrap();
    let err = handler.handle(&msg).await.unwrap_err();
    assert!(matches!(err, HandlerError::MissingEntityId));
}

#[tokio::test]
async fn test_poison_payload_is_a_decode_error() {
    let fx = handler_fixture(Properties::new());
    let handler = fx.refresh_handler();
    let err = handler
        .handle(&Message::new(b"not json".to_vec()))
        .await
        .unwrap_err();
    assert!(matches!(err, HandlerError::Decode(_)));
}

#[tokio::test]
async fn test_run_loop_survives_poison_messages() {
    let fx = handler_fixture(upstream_props("org/repo", false));
    let id = register_repo(&fx.store, "org/repo");
    fx.svc
        .replace_all_properties(id, &upstream_props("org/repo", false))
        .unwrap();

    let mut out = fx.router.subscribe(TOPIC_ENTITY_EVALUATE).await;
    let inbound = fx.router.subscribe(TOPIC_REFRESH_ENTITY_AND_EVALUATE).await;
    let handler = Arc::new(fx.refresh_handler());
    let worker = tokio::spawn(Arc::clone(&handler).run(inbound));

    fx.router
        .publish(TOPIC_REFRESH_ENTITY_AND_EVALUATE, Message::new(b"junk".to_vec()))
        .await
        .unwrap();
    let good = HandleEntityAndDoMessage::for_entity(EntityType::Repository, &get_by_upstream_id())
        .to_message()
        .unwrap();
    fx.router
        .publish(TOPIC_REFRESH_ENTITY_AND_EVALUATE, good)
        .await
        .unwrap();

    // The poison message was dropped, the good one still flowed through.
    let delivery = out.recv().await.unwrap();
    assert!(EntityEnvelope::from_message(&delivery.message).is_ok());

    fx.router.close().await;
    worker.await.unwrap();
}
