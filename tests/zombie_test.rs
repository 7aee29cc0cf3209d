mod common;

use std::time::Duration;

use assert_matches::assert_matches;
use common::TestEngine;
use serde_json::json;
use stockkeeper::{
    auth::Actor,
    entities::{SessionLine, SessionNotes, SessionStatus},
    services::{sessions::SESSION_EMISSION_TYPE, zombies::RecoveryOutcome},
};
use uuid::Uuid;

const SKU: &str = "X-1";
const TIMEOUT_SECS: i64 = 300;

async fn engine() -> TestEngine {
    let t = TestEngine::with(|b| b.zombie_timeout(Duration::from_secs(TIMEOUT_SECS as u64))).await;
    t.seed(SKU, &[("A", 10)]).await;
    t
}

async fn session(t: &TestEngine, quantity: i32) -> (Uuid, i32) {
    let session = t
        .engine
        .create_session(
            vec![SessionLine {
                sku: SKU.to_string(),
                quantity,
            }],
            SessionNotes {
                picker_name: Some("Luis".into()),
                ..Default::default()
            },
            &t.actor,
        )
        .await
        .into_result()
        .unwrap();
    (session.id, session.version)
}

#[tokio::test]
async fn only_stale_sessions_are_zombies() {
    let t = engine().await;
    let (stale, _) = session(&t, 2).await;
    let (fresh, _) = session(&t, 1).await;
    t.age_session(stale, TIMEOUT_SECS + 60).await;
    t.age_session(fresh, TIMEOUT_SECS - 60).await;

    let zombies = t.engine.detect_zombies().await.into_result().unwrap();
    assert_eq!(zombies.len(), 1);
    assert_eq!(zombies[0].session_id, stale);
    assert_eq!(zombies[0].status, SessionStatus::InProgress);
    assert_eq!(zombies[0].picker_name.as_deref(), Some("Luis"));
    assert!(zombies[0].idle_secs >= TIMEOUT_SECS);
}

#[tokio::test]
async fn detection_ignores_settled_and_verified_sessions() {
    let t = engine().await;
    let (verified, version) = session(&t, 1).await;
    t.engine
        .verify_session(verified, version, &t.actor)
        .await
        .into_result()
        .unwrap();
    let (cancelled, version) = session(&t, 1).await;
    t.engine
        .cancel_session(cancelled, version, &t.actor)
        .await
        .into_result()
        .unwrap();
    t.age_session(verified, TIMEOUT_SECS * 2).await;
    t.age_session(cancelled, TIMEOUT_SECS * 2).await;

    assert!(t.engine.detect_zombies().await.into_result().unwrap().is_empty());
}

#[tokio::test]
async fn recovery_rechecks_the_version() {
    let t = engine().await;
    let (id, version) = session(&t, 2).await;
    t.age_session(id, TIMEOUT_SECS + 1).await;

    // the picker came back between detection and recovery
    let touched = t
        .engine
        .record_activity(id, version, None, &t.actor)
        .await
        .into_result()
        .unwrap();

    let result = t.engine.recover_zombie(id, version, false, &t.actor).await;
    assert_eq!(result.error_code(), Some("version_conflict"));

    // and it is no longer stale either
    let result = t
        .engine
        .recover_zombie(id, touched.version, false, &t.actor)
        .await;
    assert_eq!(result.error_code(), Some("invalid_operation"));
    assert_eq!(t.levels(SKU, "A").await, (8, 2));
}

#[tokio::test]
async fn force_cancel_releases_stock() {
    let t = engine().await;
    let (id, version) = session(&t, 4).await;
    t.age_session(id, TIMEOUT_SECS + 1).await;

    let outcome = t
        .engine
        .recover_zombie(id, version, true, &t.actor)
        .await
        .into_result()
        .unwrap();
    assert_matches!(
        outcome,
        RecoveryOutcome::Cancelled { released_units: 4, alerted: false, ref session }
            if session.status == "cancelled"
    );
    assert_eq!(t.levels(SKU, "A").await, (10, 0));
    assert!(t.engine.alerts(10).await.into_result().unwrap().is_empty());
}

#[tokio::test]
async fn abandoned_in_progress_session_is_cancelled_with_an_alert() {
    let t = engine().await;
    let (id, version) = session(&t, 3).await;
    t.age_session(id, TIMEOUT_SECS + 1).await;

    let outcome = t
        .engine
        .recover_zombie(id, version, false, &t.actor)
        .await
        .into_result()
        .unwrap();
    assert_matches!(outcome, RecoveryOutcome::Cancelled { alerted: true, .. });
    assert_eq!(t.levels(SKU, "A").await, (10, 0));

    let alerts = t.engine.alerts(10).await.into_result().unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].entity_id, id.to_string());
    assert_eq!(alerts[0].action, "operator_alert");
}

#[tokio::test]
async fn stuck_emitting_session_is_resumed() {
    let t = engine().await;
    let (id, version) = session(&t, 5).await;
    let verified = t
        .engine
        .verify_session(id, version, &t.actor)
        .await
        .into_result()
        .unwrap();
    // crashed right after entering emitting
    t.force_status(id, "emitting").await;
    t.age_session(id, TIMEOUT_SECS + 1).await;

    let outcome = t
        .engine
        .recover_zombie(id, verified.version, false, &t.actor)
        .await
        .into_result()
        .unwrap();
    let session = assert_matches!(outcome, RecoveryOutcome::Resumed { session } => session);
    assert_eq!(session.status().unwrap(), SessionStatus::Completed);
    assert_eq!(t.levels(SKU, "A").await, (5, 0));
}

#[tokio::test]
async fn pending_emission_is_escalated_untouched() {
    let t = engine().await;
    let (id, version) = session(&t, 5).await;
    let verified = t
        .engine
        .verify_session(id, version, &t.actor)
        .await
        .into_result()
        .unwrap();
    t.engine
        .get_or_create_emission(&id.to_string(), SESSION_EMISSION_TYPE, json!({}), &t.actor)
        .await
        .into_result()
        .unwrap();
    t.force_status(id, "emitting").await;
    t.age_session(id, TIMEOUT_SECS + 1).await;

    let outcome = t
        .engine
        .recover_zombie(id, verified.version, false, &t.actor)
        .await
        .into_result()
        .unwrap();
    assert_matches!(outcome, RecoveryOutcome::Escalated { session_id, .. } if session_id == id);

    let session = t.engine.get_session(id).await.into_result().unwrap();
    assert_eq!(session.status().unwrap(), SessionStatus::Emitting);
    assert_eq!(t.levels(SKU, "A").await, (5, 5));
    assert_eq!(t.engine.alerts(10).await.into_result().unwrap().len(), 1);
}

#[tokio::test]
async fn sweep_reports_without_recovering_unless_enabled() {
    let t = engine().await;
    let (id, _) = session(&t, 2).await;
    t.age_session(id, TIMEOUT_SECS + 1).await;
    let recoverer = t.engine.zombie_recoverer();

    assert_eq!(recoverer.sweep(false).await.unwrap(), 1);
    let session = t.engine.get_session(id).await.into_result().unwrap();
    assert_eq!(session.status().unwrap(), SessionStatus::InProgress);

    assert_eq!(recoverer.sweep(true).await.unwrap(), 1);
    let session = t.engine.get_session(id).await.into_result().unwrap();
    assert_eq!(session.status().unwrap(), SessionStatus::Cancelled);
    assert_eq!(t.levels(SKU, "A").await, (10, 0));

    let history = t
        .engine
        .get_assignment_history(&id.to_string())
        .await
        .into_result()
        .unwrap();
    let release = history.last().unwrap();
    assert_eq!(release.action, "released");
    assert_eq!(release.actor_id.as_deref(), Some(Actor::system().actor_id.as_str()));
}
