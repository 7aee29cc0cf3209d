mod common;

use assert_matches::assert_matches;
use common::TestEngine;
use serde_json::json;
use stockkeeper::{entities::emission::EmissionStatus, services::emissions::EmissionTicket};

const CTX: &str = "order-77";
const TYPE: &str = "invoice";

#[tokio::test]
async fn first_caller_claims_and_second_sees_in_flight() {
    let t = TestEngine::new().await;

    let first = t
        .engine
        .get_or_create_emission(CTX, TYPE, json!({"total": 12}), &t.actor)
        .await
        .into_result()
        .unwrap();
    let claimed = assert_matches!(first, EmissionTicket::Claimed(e) => e);
    assert_eq!(claimed.attempt_number, 1);
    assert_eq!(claimed.idempotency_key, "order-77:invoice:1");
    assert_eq!(claimed.status().unwrap(), EmissionStatus::Pending);
    assert_eq!(claimed.request_payload["total"], 12);

    let second = t
        .engine
        .get_or_create_emission(CTX, TYPE, json!({"total": 12}), &t.actor)
        .await
        .into_result()
        .unwrap();
    assert_matches!(second, EmissionTicket::InFlight(e) if e.id == claimed.id);
}

#[tokio::test]
async fn success_is_final_and_repeatable() {
    let t = TestEngine::new().await;
    let claimed = t
        .engine
        .get_or_create_emission(CTX, TYPE, json!({}), &t.actor)
        .await
        .into_result()
        .unwrap()
        .into_emission();

    let done = t
        .engine
        .complete_emission_success(claimed.id, json!({"id": "INV-9"}), "INV-9", &t.actor)
        .await
        .into_result()
        .unwrap();
    assert_eq!(done.status().unwrap(), EmissionStatus::Completed);
    assert_eq!(done.external_document_id.as_deref(), Some("INV-9"));
    assert!(done.completed_at.is_some());

    // the same acknowledgement arriving twice changes nothing
    let again = t
        .engine
        .complete_emission_success(claimed.id, json!({"id": "INV-9"}), "INV-9", &t.actor)
        .await
        .into_result()
        .unwrap();
    assert_eq!(again.id, done.id);

    let ticket = t
        .engine
        .get_or_create_emission(CTX, TYPE, json!({}), &t.actor)
        .await
        .into_result()
        .unwrap();
    assert_matches!(ticket, EmissionTicket::Completed(e) if e.external_document_id.as_deref() == Some("INV-9"));

    let failed = t
        .engine
        .complete_emission_failure(claimed.id, "late timeout", None, &t.actor)
        .await;
    assert_eq!(failed.error_code(), Some("invalid_operation"));
}

#[tokio::test]
async fn a_conflicting_document_id_is_rejected() {
    let t = TestEngine::new().await;
    let claimed = t
        .engine
        .get_or_create_emission(CTX, TYPE, json!({}), &t.actor)
        .await
        .into_result()
        .unwrap()
        .into_emission();
    t.engine
        .complete_emission_success(claimed.id, json!({}), "INV-1", &t.actor)
        .await
        .into_result()
        .unwrap();

    let result = t
        .engine
        .complete_emission_success(claimed.id, json!({}), "INV-2", &t.actor)
        .await;
    assert_eq!(result.error_code(), Some("invalid_operation"));
}

#[tokio::test]
async fn failure_frees_the_next_attempt() {
    let t = TestEngine::new().await;
    let first = t
        .engine
        .get_or_create_emission(CTX, TYPE, json!({}), &t.actor)
        .await
        .into_result()
        .unwrap()
        .into_emission();

    let failed = t
        .engine
        .complete_emission_failure(
            first.id,
            "gateway timeout",
            Some(json!({"status": 504})),
            &t.actor,
        )
        .await
        .into_result()
        .unwrap();
    assert_eq!(failed.status().unwrap(), EmissionStatus::Failed);
    assert_eq!(failed.error_message.as_deref(), Some("gateway timeout"));

    let retry = t
        .engine
        .get_or_create_emission(CTX, TYPE, json!({}), &t.actor)
        .await
        .into_result()
        .unwrap();
    let retry = assert_matches!(retry, EmissionTicket::Claimed(e) => e);
    assert_eq!(retry.attempt_number, 2);
    assert!(retry.idempotency_key.ends_with(":2"));

    let attempts = t
        .engine
        .emission_attempts(CTX, TYPE)
        .await
        .into_result()
        .unwrap();
    let numbers: Vec<i32> = attempts.iter().map(|e| e.attempt_number).collect();
    assert_eq!(numbers, vec![2, 1]);
}

#[tokio::test]
async fn contexts_and_types_are_tracked_separately() {
    let t = TestEngine::new().await;
    for (ctx, kind) in [(CTX, TYPE), (CTX, "delivery_note"), ("order-78", TYPE)] {
        let ticket = t
            .engine
            .get_or_create_emission(ctx, kind, json!({}), &t.actor)
            .await
            .into_result()
            .unwrap();
        assert_matches!(ticket, EmissionTicket::Claimed(e) if e.attempt_number == 1);
    }
}

#[tokio::test]
async fn blank_context_is_rejected() {
    let t = TestEngine::new().await;
    let result = t
        .engine
        .get_or_create_emission("  ", TYPE, json!({}), &t.actor)
        .await;
    assert_eq!(result.error_code(), Some("validation_error"));
}
