//! Failure paths: recognition loss, storage outages, shutdown and resuming
//! a stored conversation.

use crate::helpers::*;
use async_trait::async_trait;
use parley::handoff::HandoffRequest;
use parley::session::{DurableStore, MemoryDurableStore, new_session_id};
use parley::{
    EndReason, FsDurableStore, HandoffVisibility, ParleyError, RuntimeEvent, SessionState,
};
use std::sync::Arc;
use std::time::Duration;

/// A store whose backend is always down.
struct UnreachableStore;

#[async_trait]
impl DurableStore for UnreachableStore {
    async fn load(&self, _session_id: &str) -> parley::Result<Option<SessionState>> {
        Err(ParleyError::Persistence("store unreachable".into()))
    }

    async fn save(&self, _state: &SessionState) -> parley::Result<()> {
        Err(ParleyError::Persistence("store unreachable".into()))
    }

    async fn delete(&self, _session_id: &str) -> parley::Result<()> {
        Err(ParleyError::Persistence("store unreachable".into()))
    }
}

fn registry() -> Arc<parley::AgentRegistry> {
    concierge_and_billing(billing_trigger(HandoffVisibility::Announced, true))
}

#[tokio::test]
async fn fatal_recognition_failure_disconnects_with_explanation() {
    let generator = ScriptedGenerator::new(Vec::new());
    let synthesizer = WordSynthesizer::new(Duration::ZERO);
    let session = start(
        registry(),
        capabilities(&generator, &synthesizer),
        test_config(),
        Arc::new(MemoryDurableStore::new()),
        "recognition-fatal",
    );

    session.caller.break_recognizer().await;
    let done = session.join().await;

    assert!(matches!(
        done.summary.end_reason,
        EndReason::RecognitionFatal(_)
    ));
    let reason = done.caller.close_reason().expect("connection closed");
    assert!(reason.contains("trouble hearing"), "{reason}");
    assert!(done.saw(|e| matches!(
        e,
        RuntimeEvent::SessionEnded {
            reason: EndReason::RecognitionFatal(_)
        }
    )));
}

#[tokio::test]
async fn unreachable_store_never_interrupts_the_conversation() {
    let generator = ScriptedGenerator::new(vec![Round::text("Still here.")]);
    let synthesizer = WordSynthesizer::new(Duration::ZERO);
    let mut session = start(
        registry(),
        capabilities(&generator, &synthesizer),
        test_config(),
        Arc::new(UnreachableStore),
        "store-down",
    );

    session.caller.say("are you there").await;
    assert_eq!(session.caller.hear_words(2).await, "Still here.");
    session
        .wait_for(|e| matches!(e, RuntimeEvent::TurnCompleted { .. }))
        .await;

    let done = session.hang_up().await;
    assert!(done.saw(|e| matches!(e, RuntimeEvent::PersistenceFailed { .. })));
    assert!(done.saw(|e| matches!(e, RuntimeEvent::SessionStarted { rehydrated: false, .. })));
    assert_eq!(done.summary.end_reason, EndReason::ConnectionClosed);
    assert_eq!(done.summary.state.turns_completed, 1);
}

#[tokio::test]
async fn stored_conversation_resumes_on_its_agent() {
    let store = Arc::new(MemoryDurableStore::new());
    let mut stored = snapshot("resume", "Billing");
    stored.slot_values.insert("account".into(), "42".into());
    stored.pending_handoff = Some(HandoffRequest {
        trigger_tool: "transfer_to_billing".into(),
        target_agent: "Billing".into(),
        reason: "left over".into(),
        carried_context: serde_json::json!({}),
        visibility: HandoffVisibility::Announced,
        share_context: true,
        immediate: true,
    });
    store.save(&stored).await.expect("seed snapshot");

    let generator = ScriptedGenerator::new(vec![Round::text("Welcome back.")]);
    let synthesizer = WordSynthesizer::new(Duration::ZERO);
    let mut session = start(
        registry(),
        capabilities(&generator, &synthesizer),
        test_config(),
        store.clone(),
        "resume",
    );

    let started = session
        .wait_for(|e| matches!(e, RuntimeEvent::SessionStarted { .. }))
        .await;
    assert!(matches!(
        started,
        RuntimeEvent::SessionStarted { rehydrated: true, ref agent, .. } if agent == "Billing"
    ));

    session.caller.say("I'm back").await;
    assert_eq!(session.caller.hear_words(2).await, "Welcome back.");
    session
        .wait_for(|e| matches!(e, RuntimeEvent::TurnCompleted { .. }))
        .await;
    let done = session.hang_up().await;

    assert_eq!(generator.instructions(), vec!["You are Billing. Reason: ."]);
    assert_eq!(done.summary.final_agent, "Billing");
    assert!(done.summary.state.pending_handoff.is_none());

    let flushed = store.load("resume").await.expect("load").expect("snapshot");
    assert_eq!(flushed.slot_values.get("account").map(String::as_str), Some("42"));
    assert_eq!(flushed.turns_completed, 1);
    assert!(flushed.pending_handoff.is_none());
    assert_eq!(flushed.history("Billing").len(), 2);
}

#[tokio::test]
async fn snapshot_naming_a_retired_agent_resumes_on_entry_point() {
    let store = Arc::new(MemoryDurableStore::new());
    store
        .save(&snapshot("retired", "Collections"))
        .await
        .expect("seed snapshot");

    let generator = ScriptedGenerator::new(Vec::new());
    let synthesizer = WordSynthesizer::new(Duration::ZERO);
    let mut session = start(
        registry(),
        capabilities(&generator, &synthesizer),
        test_config(),
        store,
        "retired",
    );

    session.caller.say("hello").await;
    session
        .wait_for(|e| matches!(e, RuntimeEvent::TurnCompleted { agent, .. } if agent == "Concierge"))
        .await;
    let done = session.hang_up().await;
    assert_eq!(done.summary.final_agent, "Concierge");
}

#[tokio::test]
async fn filesystem_store_keeps_the_final_snapshot() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(FsDurableStore::new(dir.path()).expect("fs store"));
    let session_id = new_session_id();

    let generator = ScriptedGenerator::new(vec![Round::text("Noted.")]);
    let synthesizer = WordSynthesizer::new(Duration::ZERO);
    let mut session = start(
        registry(),
        capabilities(&generator, &synthesizer),
        test_config(),
        store,
        &session_id,
    );
    session.caller.say("remember this").await;
    session.caller.next_audio().await;
    session
        .wait_for(|e| matches!(e, RuntimeEvent::TurnCompleted { .. }))
        .await;
    session.hang_up().await;

    let reopened = FsDurableStore::new(dir.path()).expect("reopen");
    let state = reopened
        .load(&session_id)
        .await
        .expect("load")
        .expect("snapshot on disk");
    assert_eq!(state.session_id, session_id);
    assert_eq!(state.history("Concierge")[0].content, "remember this");
}

#[tokio::test]
async fn shutdown_cancels_the_active_response() {
    let generator = ScriptedGenerator::new(vec![Round::slow(
        &["This ", "will ", "take ", "a ", "while. ", "More ", "words ", "follow."],
        Duration::from_millis(50),
    )]);
    let synthesizer = WordSynthesizer::new(Duration::ZERO);
    let mut session = start(
        registry(),
        capabilities(&generator, &synthesizer),
        test_config(),
        Arc::new(MemoryDurableStore::new()),
        "shutdown",
    );

    session.caller.say("go ahead").await;
    session.caller.next_audio().await;
    session.cancel.cancel();

    let done = session.join().await;
    assert_eq!(done.summary.end_reason, EndReason::Shutdown);
    assert_eq!(done.caller.close_reason().as_deref(), Some("session ended"));
    assert!(done.saw(|e| matches!(e, RuntimeEvent::TurnCancelled { turn_id: 1 })));
    assert_eq!(generator.max_concurrent(), 1);
}
