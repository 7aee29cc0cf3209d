mod common;

use std::sync::Arc;

use assert_matches::assert_matches;
use async_trait::async_trait;
use common::TestEngine;
use mockall::mock;
use serde_json::{json, Value};
use stockkeeper::{
    catalog::InMemoryCatalog,
    entities::{SessionLine, SessionNotes, SessionStatus},
    errors::ServiceError,
    services::{
        document_emitter::{DocumentEmitter, EmissionStrategy, EmittedDocument, EmitterError},
        emissions::{EmissionTicket, EmissionTracker},
        reservation::ReservationService,
        sessions::{with_conflict_retry, SessionService, SESSION_EMISSION_TYPE},
    },
};

mock! {
    pub Emitter {}

    #[async_trait]
    impl DocumentEmitter for Emitter {
        async fn emit(&self, idempotency_key: &str, payload: &Value) -> Result<EmittedDocument, EmitterError>;
    }
}

const SKU: &str = "X-1";

fn line(quantity: i32) -> Vec<SessionLine> {
    vec![SessionLine {
        sku: SKU.to_string(),
        quantity,
    }]
}

fn notes() -> SessionNotes {
    SessionNotes {
        picker_id: Some("picker-1".into()),
        picker_name: Some("Ana Picker".into()),
        comment: None,
    }
}

fn document(id: &str) -> EmittedDocument {
    EmittedDocument {
        external_document_id: id.to_string(),
        public_url: Some(format!("https://docs.example.test/{}", id)),
        serial_number: Some("F-0001".to_string()),
    }
}

async fn live(emitter: MockEmitter) -> TestEngine {
    let t = TestEngine::with(|b| {
        b.emission_strategy(EmissionStrategy::Live)
            .emitter(Arc::new(emitter))
    })
    .await;
    t.seed(SKU, &[("A", 10), ("B", 3)]).await;
    t
}

/// A session created and verified, at version 2.
async fn verified_session(t: &TestEngine, quantity: i32) -> uuid::Uuid {
    let session = t
        .engine
        .create_session(line(quantity), notes(), &t.actor)
        .await
        .into_result()
        .unwrap();
    let verified = t
        .engine
        .verify_session(session.id, session.version, &t.actor)
        .await
        .into_result()
        .unwrap();
    assert_eq!(verified.version, 2);
    session.id
}

fn bare_service(t: &TestEngine) -> SessionService {
    let reservations = ReservationService::new(t.db.clone(), Arc::new(InMemoryCatalog::new()));
    SessionService::new(
        t.db.clone(),
        reservations,
        EmissionTracker::new(t.db.clone()),
        None,
        EmissionStrategy::Migration,
    )
}

#[tokio::test]
async fn creating_a_session_reserves_its_lines() {
    let t = TestEngine::new().await;
    t.seed(SKU, &[("A", 10)]).await;

    let session = t
        .engine
        .create_session(line(4), notes(), &t.actor)
        .await
        .into_result()
        .unwrap();

    assert_eq!(session.status().unwrap(), SessionStatus::InProgress);
    assert_eq!(session.version, 1);
    assert_eq!(session.lines().unwrap(), line(4));
    assert_eq!(session.notes().picker_name.as_deref(), Some("Ana Picker"));
    assert_eq!(t.levels(SKU, "A").await, (6, 4));
    assert_eq!(t.assignments(&session.id.to_string()).await.len(), 1);
}

#[tokio::test]
async fn a_session_that_cannot_be_reserved_is_not_created() {
    let t = TestEngine::new().await;
    t.seed(SKU, &[("A", 2)]).await;

    let result = t.engine.create_session(line(5), notes(), &t.actor).await;
    assert_eq!(result.error_code(), Some("insufficient_stock"));
    assert!(t.engine.list_sessions(None).await.into_result().unwrap().is_empty());
    assert_eq!(t.levels(SKU, "A").await, (2, 0));
}

#[tokio::test]
async fn stale_versions_conflict() {
    let t = TestEngine::new().await;
    t.seed(SKU, &[("A", 10)]).await;
    let sessions = bare_service(&t);

    let session = sessions
        .create_session(line(1), notes(), &t.actor)
        .await
        .unwrap();
    sessions
        .record_activity(session.id, 1, None, &t.actor)
        .await
        .unwrap();

    let stale = sessions.verify(session.id, 1, &t.actor).await;
    assert_matches!(
        stale,
        Err(ServiceError::VersionConflict { expected: 1, current: 2, .. })
    );
    let current = sessions.get_session(session.id).await.unwrap();
    assert_eq!(current.status().unwrap(), SessionStatus::InProgress);
}

#[tokio::test]
async fn conflicts_are_retried_once_with_the_current_version() {
    let t = TestEngine::new().await;
    t.seed(SKU, &[("A", 10)]).await;
    let sessions = bare_service(&t);
    let session = sessions
        .create_session(line(1), notes(), &t.actor)
        .await
        .unwrap();
    sessions
        .record_activity(session.id, 1, None, &t.actor)
        .await
        .unwrap();

    let mut seen = Vec::new();
    let verified = with_conflict_retry(1, |version| {
        seen.push(version);
        sessions.verify(session.id, version, &t.actor)
    })
    .await
    .unwrap();

    assert_eq!(seen, vec![1, 2]);
    assert_eq!(verified.version, 3);
    assert_eq!(verified.status().unwrap(), SessionStatus::Verified);
}

#[tokio::test]
async fn every_accepted_mutation_bumps_the_version_by_one() {
    let t = TestEngine::new().await;
    t.seed(SKU, &[("A", 10)]).await;
    let session = t
        .engine
        .create_session(line(2), notes(), &t.actor)
        .await
        .into_result()
        .unwrap();

    let mut version = session.version;
    for comment in ["first shelf", "second shelf"] {
        let touched = t
            .engine
            .record_activity(
                session.id,
                version,
                Some(SessionNotes {
                    comment: Some(comment.to_string()),
                    ..notes()
                }),
                &t.actor,
            )
            .await
            .into_result()
            .unwrap();
        assert_eq!(touched.version, version + 1);
        assert_eq!(touched.notes().comment.as_deref(), Some(comment));
        version = touched.version;
    }
}

#[tokio::test]
async fn finalize_requires_verification() {
    let t = TestEngine::new().await;
    t.seed(SKU, &[("A", 10)]).await;
    let session = t
        .engine
        .create_session(line(2), notes(), &t.actor)
        .await
        .into_result()
        .unwrap();

    let result = t
        .engine
        .finalize_session(session.id, session.version, &t.actor)
        .await;
    assert_eq!(result.error_code(), Some("invalid_transition"));
    assert_eq!(result.details.as_ref().unwrap()["from"], "in_progress");
    assert_eq!(t.levels(SKU, "A").await, (8, 2));
}

#[tokio::test]
async fn finalize_in_migration_mode_consumes_without_emitting() {
    let t = TestEngine::new().await;
    t.seed(SKU, &[("A", 10), ("B", 3)]).await;
    let id = verified_session(&t, 12).await;

    let completed = t
        .engine
        .finalize_session(id, 2, &t.actor)
        .await
        .into_result()
        .unwrap();

    assert_eq!(completed.status().unwrap(), SessionStatus::Completed);
    assert_eq!(completed.version, 4);
    assert!(completed.external_document_id.is_none());
    assert_eq!(t.levels(SKU, "A").await, (0, 0));
    assert_eq!(t.levels(SKU, "B").await, (1, 0));
    assert!(t
        .engine
        .emission_attempts(&id.to_string(), SESSION_EMISSION_TYPE)
        .await
        .into_result()
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn finalize_emits_exactly_once_and_completes() {
    let mut emitter = MockEmitter::new();
    emitter
        .expect_emit()
        .withf(|key, payload| key.ends_with(":invoice:1") && payload["lines"][0]["sku"] == SKU)
        .times(1)
        .returning(|_, _| Ok(document("DOC-1")));
    let t = live(emitter).await;
    let id = verified_session(&t, 5).await;

    let completed = t
        .engine
        .finalize_session(id, 2, &t.actor)
        .await
        .into_result()
        .unwrap();

    assert_eq!(completed.status().unwrap(), SessionStatus::Completed);
    assert_eq!(completed.external_document_id.as_deref(), Some("DOC-1"));
    assert_eq!(t.levels(SKU, "A").await, (5, 0));

    let attempts = t
        .engine
        .emission_attempts(&id.to_string(), SESSION_EMISSION_TYPE)
        .await
        .into_result()
        .unwrap();
    assert_eq!(attempts.len(), 1);
    assert!(attempts[0].is_completed());
    assert_eq!(attempts[0].external_document_id.as_deref(), Some("DOC-1"));

    // finalizing again is rejected by the state machine, not re-emitted
    let again = t.engine.finalize_session(id, completed.version, &t.actor).await;
    assert_eq!(again.error_code(), Some("invalid_transition"));
}

#[tokio::test]
async fn failed_emission_is_recorded_and_retry_uses_the_next_attempt() {
    let mut emitter = MockEmitter::new();
    let mut seq = mockall::Sequence::new();
    emitter
        .expect_emit()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_, _| {
            Err(EmitterError::Rejected {
                status: 503,
                body: "maintenance".into(),
            })
        });
    emitter
        .expect_emit()
        .withf(|key, _| key.ends_with(":invoice:2"))
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_, _| Ok(document("DOC-2")));
    let t = live(emitter).await;
    let id = verified_session(&t, 4).await;

    let failed = t.engine.finalize_session(id, 2, &t.actor).await;
    assert_eq!(failed.error_code(), Some("external_emission_failure"));

    let session = t.engine.get_session(id).await.into_result().unwrap();
    assert_eq!(session.status().unwrap(), SessionStatus::Error);
    assert_eq!(session.retry_count, 1);
    assert!(session.last_error.as_deref().unwrap_or_default().contains("503"));
    // stock stays committed for the retry
    assert_eq!(t.levels(SKU, "A").await, (6, 4));

    let completed = t
        .engine
        .finalize_session(id, session.version, &t.actor)
        .await
        .into_result()
        .unwrap();
    assert_eq!(completed.external_document_id.as_deref(), Some("DOC-2"));
    assert_eq!(t.levels(SKU, "A").await, (6, 0));

    let attempts = t
        .engine
        .emission_attempts(&id.to_string(), SESSION_EMISSION_TYPE)
        .await
        .into_result()
        .unwrap();
    let statuses: Vec<(i32, &str)> = attempts
        .iter()
        .map(|a| (a.attempt_number, a.status.as_str()))
        .collect();
    assert_eq!(statuses, vec![(2, "completed"), (1, "failed")]);
    assert_eq!(attempts[1].error_details.as_ref().unwrap()["status"], 503);
}

#[tokio::test]
async fn failed_consume_parks_the_session_in_error_and_can_be_resumed() {
    let t = TestEngine::new().await;
    t.seed(SKU, &[("A", 10)]).await;
    let id = verified_session(&t, 4).await;
    let before = t.assignments(&id.to_string()).await;
    assert_eq!(before.len(), 1);

    // the committed units vanish from under the assignment
    t.set_levels(SKU, "A", 10, 0).await;

    let failed = t.engine.finalize_session(id, 2, &t.actor).await;
    assert_eq!(failed.error_code(), Some("insufficient_stock"));

    let session = t.engine.get_session(id).await.into_result().unwrap();
    assert_eq!(session.status().unwrap(), SessionStatus::Error);
    assert_eq!(session.retry_count, 1);
    assert!(session.last_error.is_some());
    let after = t.assignments(&id.to_string()).await;
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].id, before[0].id);
    assert_eq!(after[0].quantity_assigned, 4);
    assert_eq!(t.levels(SKU, "A").await, (10, 0));

    t.set_levels(SKU, "A", 6, 4).await;
    let completed = t
        .engine
        .finalize_session(id, session.version, &t.actor)
        .await
        .into_result()
        .unwrap();
    assert_eq!(completed.status().unwrap(), SessionStatus::Completed);
    assert_eq!(t.levels(SKU, "A").await, (6, 0));
    assert!(t.assignments(&id.to_string()).await.is_empty());
}

#[tokio::test]
async fn an_already_completed_emission_is_not_repeated() {
    let mut emitter = MockEmitter::new();
    emitter.expect_emit().times(0);
    let t = live(emitter).await;
    let id = verified_session(&t, 3).await;
    let context = id.to_string();

    // a previous run emitted the document but died before updating the session
    let ticket = t
        .engine
        .get_or_create_emission(&context, SESSION_EMISSION_TYPE, json!({}), &t.actor)
        .await
        .into_result()
        .unwrap();
    let claimed = assert_matches!(ticket, EmissionTicket::Claimed(e) => e);
    t.engine
        .complete_emission_success(claimed.id, json!({"ok": true}), "DOC-OLD", &t.actor)
        .await
        .into_result()
        .unwrap();

    let completed = t
        .engine
        .finalize_session(id, 2, &t.actor)
        .await
        .into_result()
        .unwrap();
    assert_eq!(completed.external_document_id.as_deref(), Some("DOC-OLD"));
    assert_eq!(completed.status().unwrap(), SessionStatus::Completed);
}

#[tokio::test]
async fn a_pending_emission_blocks_a_second_call() {
    let mut emitter = MockEmitter::new();
    emitter.expect_emit().times(0);
    let t = live(emitter).await;
    let id = verified_session(&t, 3).await;

    t.engine
        .get_or_create_emission(&id.to_string(), SESSION_EMISSION_TYPE, json!({}), &t.actor)
        .await
        .into_result()
        .unwrap();

    let result = t.engine.finalize_session(id, 2, &t.actor).await;
    assert_eq!(result.error_code(), Some("emission_in_flight"));
    let session = t.engine.get_session(id).await.into_result().unwrap();
    assert_eq!(session.status().unwrap(), SessionStatus::Emitting);
    assert_eq!(t.levels(SKU, "A").await, (7, 3));
}

#[tokio::test]
async fn cancel_releases_everything_and_is_terminal() {
    let t = TestEngine::new().await;
    t.seed(SKU, &[("A", 10), ("B", 3)]).await;
    let id = verified_session(&t, 12).await;

    let outcome = t
        .engine
        .cancel_session(id, 2, &t.actor)
        .await
        .into_result()
        .unwrap();
    assert_eq!(outcome.session.status().unwrap(), SessionStatus::Cancelled);
    assert_eq!(outcome.released.units, 12);
    assert_eq!(t.levels(SKU, "A").await, (10, 0));
    assert_eq!(t.levels(SKU, "B").await, (3, 0));

    let again = t
        .engine
        .cancel_session(id, outcome.session.version, &t.actor)
        .await;
    assert_eq!(again.error_code(), Some("invalid_transition"));

    let touch = t
        .engine
        .record_activity(id, outcome.session.version, None, &t.actor)
        .await;
    assert_eq!(touch.error_code(), Some("invalid_operation"));
}

#[tokio::test]
async fn unknown_sessions_are_not_found() {
    let t = TestEngine::new().await;
    let result = t.engine.get_session(uuid::Uuid::new_v4()).await;
    assert_eq!(result.error_code(), Some("not_found"));
}
