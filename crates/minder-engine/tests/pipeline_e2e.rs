//! End-to-end pipeline tests: inbound reconciliation messages in, evaluated
//! envelopes and flush notifications out, with the store as the witness.
//!
//! The router runs in wait-for-ack mode throughout, so every `publish`
//! below resolves only after the full handler-executor-flush cascade for
//! that message has settled.

mod common;

use minder_core::entities::{EntityType, Properties, Property, properties::PROP_UPSTREAM_ID};
use minder_core::events::{
    EntityDeleteEvent, HandleEntityAndDoMessage, TOPIC_GET_ENTITY_AND_DELETE,
    TOPIC_ORIGINATING_ENTITY_ADD, TOPIC_ORIGINATING_ENTITY_DELETE, TOPIC_RECONCILE_ENTITY_DELETE,
    TOPIC_REFRESH_ENTITY_AND_EVALUATE, TOPIC_REFRESH_ENTITY_BY_ID_AND_EVALUATE,
};
use minder_core::proto::EntityMessage;
use minder_core::selectors::{
    EvalOptions, Selection, SelectionChecker, Selector, SelectorEntity,
};
use minder_engine::config::EngineConfig;
use minder_engine::metrics::encode_text;

use common::{by_name, hint, pr_upstream, repo_upstream, Harness};

const REPO: &str = "acme/app";
const PR_URL: &str = "https://api.acme.test/repos/acme/app/pulls/7";

fn refresh_message() -> minder_core::events::Message {
    HandleEntityAndDoMessage::for_entity(EntityType::Repository, &by_name(REPO))
        .with_hint(hint())
        .to_message()
        .unwrap()
}

#[tokio::test]
async fn test_refresh_flows_to_evaluation_and_flush() {
    let mut h = Harness::start().await;
    let repo_id = h.register_repo(REPO);
    h.provider.set_upstream(repo_upstream(REPO, false));

    h.pipeline
        .publish(TOPIC_REFRESH_ENTITY_AND_EVALUATE, refresh_message())
        .await
        .unwrap();

    let envelopes = h.evaluator.envelopes();
    assert_eq!(envelopes.len(), 1);
    let envelope = &envelopes[0];
    assert_eq!(envelope.entity_id, Some(repo_id));
    assert_eq!(envelope.project_id, h.project_id);
    assert!(envelope.execution_id.is_some(), "execution id not stamped");
    match &envelope.body {
        EntityMessage::Repository(repo) => {
            assert_eq!(repo.name, REPO);
            assert!(!repo.is_fork);
        }
        other => panic!("expected repository body, got {other:?}"),
    }

    // The flush notification closes out the same execution.
    let flushed = h.recv_flush().await;
    assert_eq!(flushed.execution_id, envelope.execution_id);
    assert_eq!(flushed.entity_id, Some(repo_id));

    // The refreshed property set was persisted.
    let ewp = h
        .pipeline
        .service()
        .entity_with_properties_by_id(repo_id, None)
        .unwrap();
    assert_eq!(ewp.properties.get_string(PROP_UPSTREAM_ID), "123");
    assert_eq!(h.provider.fetch_all_count(), 1);
}

#[tokio::test]
async fn test_refresh_by_internal_id() {
    let mut h = Harness::start().await;
    let repo_id = h.register_repo(REPO);
    h.provider.set_upstream(repo_upstream(REPO, true));

    let message = HandleEntityAndDoMessage::for_entity(EntityType::Repository, &by_name(REPO))
        .with_entity_id(repo_id)
        .to_message()
        .unwrap();
    h.pipeline
        .publish(TOPIC_REFRESH_ENTITY_BY_ID_AND_EVALUATE, message)
        .await
        .unwrap();

    let flushed = h.recv_flush().await;
    assert_eq!(flushed.entity_id, Some(repo_id));
    match &flushed.body {
        EntityMessage::Repository(repo) => assert!(repo.is_fork),
        other => panic!("expected repository body, got {other:?}"),
    }
}

#[tokio::test]
async fn test_match_properties_gate_drops_mismatches() {
    let h = Harness::start().await;
    h.register_repo(REPO);
    h.provider.set_upstream(repo_upstream(REPO, false));

    let mut wanted = Properties::new();
    wanted.set("is_fork", Property::from_bool(true)).unwrap();
    let message = HandleEntityAndDoMessage::for_entity(EntityType::Repository, &by_name(REPO))
        .with_match_props(&wanted)
        .with_hint(hint())
        .to_message()
        .unwrap();
    h.pipeline
        .publish(TOPIC_REFRESH_ENTITY_AND_EVALUATE, message)
        .await
        .unwrap();
    assert!(h.evaluator.envelopes().is_empty());

    // Without the mismatching constraint the same entity goes through.
    h.pipeline
        .publish(TOPIC_REFRESH_ENTITY_AND_EVALUATE, refresh_message())
        .await
        .unwrap();
    assert_eq!(h.evaluator.envelopes().len(), 1);
}

#[tokio::test]
async fn test_archived_repository_is_not_forwarded() {
    let h = Harness::start().await;
    let repo_id = h.register_repo(REPO);
    let mut upstream = repo_upstream(REPO, false);
    upstream
        .set("is_archived", Property::from_bool(true))
        .unwrap();
    h.provider.set_upstream(upstream);

    h.pipeline
        .publish(TOPIC_REFRESH_ENTITY_AND_EVALUATE, refresh_message())
        .await
        .unwrap();

    assert!(h.evaluator.envelopes().is_empty());
    // The refresh itself still persisted what upstream reported.
    let ewp = h
        .pipeline
        .service()
        .entity_with_properties_by_id(repo_id, None)
        .unwrap();
    assert!(ewp.properties.get_bool("is_archived"));
}

#[tokio::test]
async fn test_originating_entity_add_then_delete() {
    let h = Harness::start().await;
    let repo_id = h.register_repo(REPO);
    h.provider.set_upstream(pr_upstream(PR_URL, 7));

    let add = HandleEntityAndDoMessage::for_entity(EntityType::PullRequest, &by_name(PR_URL))
        .with_originator(EntityType::Repository, &by_name(REPO))
        .with_hint(hint())
        .to_message()
        .unwrap();
    h.pipeline
        .publish(TOPIC_ORIGINATING_ENTITY_ADD, add)
        .await
        .unwrap();

    let child = h
        .db
        .get_entity_by_name(h.project_id, h.provider_id, EntityType::PullRequest, PR_URL)
        .unwrap()
        .expect("child entity not registered");
    assert_eq!(child.originated_from, Some(repo_id));

    let envelopes = h.evaluator.envelopes();
    assert_eq!(envelopes.len(), 1);
    match &envelopes[0].body {
        EntityMessage::PullRequest(pr) => {
            assert_eq!(pr.url, PR_URL);
            assert_eq!(pr.number, 7);
        }
        other => panic!("expected pull request body, got {other:?}"),
    }

    let del = HandleEntityAndDoMessage::for_entity(EntityType::PullRequest, &by_name(PR_URL))
        .with_originator(EntityType::Repository, &by_name(REPO))
        .with_hint(hint())
        .to_message()
        .unwrap();
    h.pipeline
        .publish(TOPIC_ORIGINATING_ENTITY_DELETE, del)
        .await
        .unwrap();

    assert!(h
        .db
        .get_entity_by_name(h.project_id, h.provider_id, EntityType::PullRequest, PR_URL)
        .unwrap()
        .is_none());
    // Deletion does not trigger another evaluation.
    assert_eq!(h.evaluator.envelopes().len(), 1);
}

#[tokio::test]
async fn test_get_and_delete_emits_delete_event_without_fetching() {
    let h = Harness::start().await;
    let repo_id = h.register_repo(REPO);
    let mut reconcile = common::drain(&h.pipeline, TOPIC_RECONCILE_ENTITY_DELETE).await;

    h.pipeline
        .publish(TOPIC_GET_ENTITY_AND_DELETE, refresh_message())
        .await
        .unwrap();

    let message = common::recv_message(&mut reconcile).await;
    let event = EntityDeleteEvent::from_message(&message).unwrap();
    assert_eq!(event.entity_id, repo_id);
    assert_eq!(event.entity_type().unwrap(), EntityType::Repository);
    assert_eq!(event.project_id, h.project_id);

    // The delete path never consults upstream and never evaluates.
    assert_eq!(h.provider.fetch_all_count(), 0);
    assert!(h.evaluator.envelopes().is_empty());
}

#[tokio::test]
async fn test_failed_evaluation_still_flushes() {
    let mut h = Harness::start().await;
    let repo_id = h.register_repo(REPO);
    h.provider.set_upstream(repo_upstream(REPO, false));
    h.evaluator.fail_next();

    h.pipeline
        .publish(TOPIC_REFRESH_ENTITY_AND_EVALUATE, refresh_message())
        .await
        .unwrap();

    let flushed = h.recv_flush().await;
    assert_eq!(flushed.entity_id, Some(repo_id));
    assert!(flushed.execution_id.is_some());

    let text = encode_text(&h.registry).unwrap();
    assert!(
        text.contains("outcome=\"failed\""),
        "failed execution not recorded: {text}"
    );
}

#[tokio::test]
async fn test_selectors_gate_on_refreshed_properties() {
    let h = Harness::start().await;
    let repo_id = h.register_repo(REPO);
    h.provider.set_upstream(repo_upstream(REPO, true));

    h.pipeline
        .publish(TOPIC_REFRESH_ENTITY_AND_EVALUATE, refresh_message())
        .await
        .unwrap();

    let ewp = h
        .pipeline
        .service()
        .entity_with_properties_by_id(repo_id, None)
        .unwrap();
    let subject = SelectorEntity::new(&ewp.entity).with_properties(&ewp.properties);

    let no_forks = SelectionChecker::compile(&[Selector {
        entity_type: EntityType::Repository,
        expression: "repository.properties.is_fork == false".to_owned(),
    }])
    .unwrap();
    assert_eq!(
        no_forks.select(&subject, &EvalOptions::default()).unwrap(),
        Selection::NotSelected {
            source: "repository.properties.is_fork == false".to_owned()
        }
    );

    let by_repo_name = SelectionChecker::compile(&[Selector {
        entity_type: EntityType::Repository,
        expression: "repository.name == 'acme/app'".to_owned(),
    }])
    .unwrap();
    assert_eq!(
        by_repo_name
            .select(&subject, &EvalOptions::default())
            .unwrap(),
        Selection::Selected
    );
}

#[tokio::test]
async fn test_cache_bypass_refetches_on_every_refresh() {
    let config =
        EngineConfig::from_toml("[cache]\nttl_secs = -1\n\n[router]\nwait_for_ack = true\n")
            .unwrap();
    let h = Harness::start_with(&config).await;
    h.register_repo(REPO);
    h.provider.set_upstream(repo_upstream(REPO, false));

    for _ in 0..2 {
        h.pipeline
            .publish(TOPIC_REFRESH_ENTITY_AND_EVALUATE, refresh_message())
            .await
            .unwrap();
    }
    assert_eq!(h.provider.fetch_all_count(), 2);

    let h = Harness::start().await;
    h.register_repo(REPO);
    h.provider.set_upstream(repo_upstream(REPO, false));
    for _ in 0..2 {
        h.pipeline
            .publish(TOPIC_REFRESH_ENTITY_AND_EVALUATE, refresh_message())
            .await
            .unwrap();
    }
    // Default TTL serves the second refresh from the store.
    assert_eq!(h.provider.fetch_all_count(), 1);
    let text = encode_text(&h.registry).unwrap();
    assert!(text.contains("minder_engine_property_cache_total{outcome=\"hit\"} 1"));
}

#[tokio::test]
async fn test_shutdown_drains_and_stops_intake() {
    let mut h = Harness::start().await;
    let repo_id = h.register_repo(REPO);
    h.provider.set_upstream(repo_upstream(REPO, false));

    h.pipeline
        .publish(TOPIC_REFRESH_ENTITY_AND_EVALUATE, refresh_message())
        .await
        .unwrap();
    let flushed = h.recv_flush().await;
    assert_eq!(flushed.entity_id, Some(repo_id));

    h.pipeline.shutdown().await;
}
