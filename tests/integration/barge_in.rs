//! Barge-in: caller speech cuts the active response short.

use crate::helpers::*;
use parley::capabilities::Role;
use parley::pipeline::messages::OutboundFrame;
use parley::session::MemoryDurableStore;
use parley::{HandoffVisibility, RuntimeEvent};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn long_answer() -> Round {
    Round::slow(
        &[
            "Let me explain. ",
            "Your plan ",
            "covers ",
            "calls, ",
            "texts ",
            "and ",
            "data ",
            "in ",
            "every ",
            "region ",
            "we ",
            "serve.",
        ],
        Duration::from_millis(40),
    )
}

#[tokio::test]
async fn partial_speech_cancels_response_and_stops_audio() {
    let config = test_config();
    let grace = config.processor.cancel_grace();
    let generator = ScriptedGenerator::new(vec![long_answer()]);
    let synthesizer = WordSynthesizer::new(Duration::ZERO);
    let mut session = start(
        concierge_and_billing(billing_trigger(HandoffVisibility::Announced, true)),
        capabilities(&generator, &synthesizer),
        config,
        Arc::new(MemoryDurableStore::new()),
        "barge-in",
    );

    session.caller.say("tell me about my plan").await;
    let (response_id, word) = session.caller.next_audio().await;
    assert_eq!(word, "Let");

    let interrupted_at = Instant::now();
    session.caller.partial("wait").await;
    loop {
        if session.caller.next_frame().await == OutboundFrame::Stop {
            break;
        }
    }
    session
        .wait_for(|e| matches!(e, RuntimeEvent::TurnCancelled { turn_id: 1 }))
        .await;
    assert!(interrupted_at.elapsed() < grace);

    let late = session.caller.frames_within(Duration::from_millis(200)).await;
    assert!(
        !late.iter().any(|f| matches!(
            f,
            OutboundFrame::Audio { response_id: id, .. } if *id == response_id
        )),
        "audio of the cancelled response leaked after stop: {late:?}"
    );

    let done = session.hang_up().await;
    assert!(done.saw(|e| matches!(
        e,
        RuntimeEvent::InterruptionRequested { response_id: Some(id) } if *id == response_id
    )));
    let state = &done.summary.state;
    assert!(state.interruption_flag);
    assert_eq!(state.turns_completed, 0);
    let history = state.history("Concierge");
    assert_eq!(history[0].role, Role::User);
    let spoken = history
        .iter()
        .find(|m| m.role == Role::Assistant)
        .expect("partial answer kept");
    assert!(spoken.content.starts_with("Let me explain."));
    assert!(!spoken.content.ends_with("serve."));
}

#[tokio::test]
async fn repeated_partials_interrupt_once() {
    let generator = ScriptedGenerator::new(vec![long_answer()]);
    let synthesizer = WordSynthesizer::new(Duration::ZERO);
    let mut session = start(
        concierge_and_billing(billing_trigger(HandoffVisibility::Announced, true)),
        capabilities(&generator, &synthesizer),
        test_config(),
        Arc::new(MemoryDurableStore::new()),
        "barge-in-repeat",
    );

    session.caller.say("tell me about my plan").await;
    session.caller.next_audio().await;
    session.caller.partial("wait a").await;
    session.caller.partial("wait a second").await;
    session
        .wait_for(|e| matches!(e, RuntimeEvent::TurnCancelled { .. }))
        .await;

    let done = session.hang_up().await;
    let interruptions = done
        .events
        .iter()
        .filter(|e| matches!(e, RuntimeEvent::InterruptionRequested { .. }))
        .count();
    assert_eq!(interruptions, 1);
}

#[tokio::test]
async fn next_utterance_after_barge_in_is_answered() {
    let generator = ScriptedGenerator::new(vec![long_answer(), Round::text("Sure, one moment.")]);
    let synthesizer = WordSynthesizer::new(Duration::ZERO);
    let mut session = start(
        concierge_and_billing(billing_trigger(HandoffVisibility::Announced, true)),
        capabilities(&generator, &synthesizer),
        test_config(),
        Arc::new(MemoryDurableStore::new()),
        "barge-in-resume",
    );

    session.caller.say("tell me about my plan").await;
    let (first_response, _) = session.caller.next_audio().await;
    session.caller.partial("actually").await;
    session.caller.say("actually, just cancel it").await;

    let (response_id, word) = loop {
        let (id, word) = session.caller.next_audio().await;
        if id != first_response {
            break (id, word);
        }
    };
    assert!(response_id > first_response);
    assert_eq!(word, "Sure,");
    session
        .wait_for(|e| matches!(e, RuntimeEvent::TurnCompleted { turn_id: 2, .. }))
        .await;

    let done = session.hang_up().await;
    assert!(!done.summary.state.interruption_flag);
    assert_eq!(done.summary.turns_processed, 2);
}
