//! Turn sequencing: one response at a time, newest utterance wins.

use crate::helpers::*;
use parley::pipeline::messages::OutboundFrame;
use parley::session::MemoryDurableStore;
use parley::{EndReason, HandoffVisibility, RuntimeEvent};
use std::sync::Arc;
use std::time::Duration;

fn registry() -> Arc<parley::AgentRegistry> {
    concierge_and_billing(billing_trigger(HandoffVisibility::Announced, true))
}

#[tokio::test]
async fn short_partial_is_noise_and_final_is_answered() {
    let generator = ScriptedGenerator::new(vec![Round::text("Happy to help.")]);
    let synthesizer = WordSynthesizer::new(Duration::ZERO);
    let mut session = start(
        registry(),
        capabilities(&generator, &synthesizer),
        test_config(),
        Arc::new(MemoryDurableStore::new()),
        "turn-basic",
    );

    session.caller.partial("hel").await;
    session.caller.say("hello, I need help").await;
    assert_eq!(session.caller.hear_words(3).await, "Happy to help.");
    session
        .wait_for(|e| matches!(e, RuntimeEvent::TurnCompleted { turn_id: 1, .. }))
        .await;

    let done = session.hang_up().await;
    assert!(!done.saw(|e| matches!(e, RuntimeEvent::InterruptionRequested { .. })));
    assert_eq!(done.summary.end_reason, EndReason::ConnectionClosed);
    assert_eq!(done.summary.turns_processed, 1);
    assert_eq!(done.summary.final_agent, "Concierge");

    let state = &done.summary.state;
    assert_eq!(
        state.visited_agents.iter().collect::<Vec<_>>(),
        vec!["Concierge"]
    );
    assert_eq!(state.turns_completed, 1);
    assert_eq!(state.latency_samples.len(), 1);
    assert!(!state.interruption_flag);
    assert_eq!(generator.instructions(), vec!["You are Concierge."]);

    let history = state.history("Concierge");
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].content, "hello, I need help");
    assert_eq!(history[1].content, "Happy to help.");
}

#[tokio::test]
async fn streamed_reply_is_spoken_sentence_by_sentence() {
    let generator = ScriptedGenerator::new(vec![Round::slow(
        &["Your balance ", "is ten dollars. ", "Anything ", "else?"],
        Duration::from_millis(10),
    )]);
    let synthesizer = WordSynthesizer::new(Duration::ZERO);
    let mut session = start(
        registry(),
        capabilities(&generator, &synthesizer),
        test_config(),
        Arc::new(MemoryDurableStore::new()),
        "turn-chunked",
    );

    session.caller.say("what is my balance").await;
    assert_eq!(
        session.caller.hear_words(7).await,
        "Your balance is ten dollars. Anything else?"
    );
    session
        .wait_for(|e| matches!(e, RuntimeEvent::TurnCompleted { .. }))
        .await;
    session.hang_up().await;

    assert_eq!(
        synthesizer.spoken(),
        vec!["Your balance is ten dollars.", "Anything else?"]
    );
}

#[tokio::test]
async fn at_most_one_response_runs_at_a_time() {
    let slow = |answer: &'static str| {
        Round::slow(
            &[answer, "and ", "then ", "some ", "more ", "words ", "to ", "say."],
            Duration::from_millis(30),
        )
    };
    let generator = ScriptedGenerator::new(vec![
        slow("First answer. "),
        slow("Second answer. "),
        slow("Third answer. "),
    ]);
    let synthesizer = WordSynthesizer::new(Duration::ZERO);
    let mut session = start(
        registry(),
        capabilities(&generator, &synthesizer),
        test_config(),
        Arc::new(MemoryDurableStore::new()),
        "turn-serial",
    );

    let mut last_response = 0;
    for question in ["first question", "second question", "third question"] {
        session.caller.say(question).await;
        loop {
            let (response_id, _) = session.caller.next_audio().await;
            if response_id > last_response {
                last_response = response_id;
                break;
            }
        }
    }
    session
        .wait_for(|e| matches!(e, RuntimeEvent::TurnCompleted { turn_id: 3, .. }))
        .await;

    let done = session.hang_up().await;
    assert_eq!(generator.max_concurrent(), 1);
    assert_eq!(done.summary.turns_processed, 3);
    for turn in [1, 2] {
        assert!(
            done.saw(|e| matches!(e, RuntimeEvent::TurnCancelled { turn_id } if *turn_id == turn)),
            "turn {turn} should have been superseded"
        );
    }
    assert_eq!(done.summary.state.turns_completed, 1);
}

#[tokio::test]
async fn superseding_turn_stops_previous_audio_before_answering() {
    let generator = ScriptedGenerator::new(vec![
        Round::slow(
            &["Let me explain. ", "Your plan ", "covers ", "calls ", "and ", "texts ", "everywhere."],
            Duration::from_millis(40),
        ),
        Round::text("Okay, never mind."),
    ]);
    let synthesizer = WordSynthesizer::new(Duration::ZERO);
    let mut session = start(
        registry(),
        capabilities(&generator, &synthesizer),
        test_config(),
        Arc::new(MemoryDurableStore::new()),
        "turn-supersede",
    );

    session.caller.say("tell me about my plan").await;
    let (first_response, _) = session.caller.next_audio().await;
    // Too short to count as barge-in; only the final utterance arrives.
    session.caller.say("no").await;

    let mut stopped = false;
    let next_response = loop {
        match session.caller.next_frame().await {
            OutboundFrame::Stop => stopped = true,
            OutboundFrame::Audio { response_id, .. } if response_id == first_response => {
                assert!(!stopped, "superseded audio followed the stop frame");
            }
            OutboundFrame::Audio { response_id, .. } => break response_id,
        }
    };
    assert!(stopped, "no stop frame before the next response's audio");
    assert!(next_response > first_response);
    session
        .wait_for(|e| matches!(e, RuntimeEvent::TurnCompleted { turn_id: 2, .. }))
        .await;

    let done = session.hang_up().await;
    assert!(!done.saw(|e| matches!(e, RuntimeEvent::InterruptionRequested { .. })));
    assert!(done.saw(|e| matches!(e, RuntimeEvent::TurnCancelled { turn_id: 1 })));
    assert_eq!(generator.max_concurrent(), 1);
}

#[tokio::test]
async fn buffered_turn_is_dropped_when_a_newer_one_arrives() {
    // Non-immediate announced hand-off: Billing introduces itself slowly and
    // the introduction cannot be interrupted, so later turns pile up.
    let registry = concierge_and_billing(billing_trigger(HandoffVisibility::Announced, false));
    let generator = ScriptedGenerator::new(vec![
        Round::tool_call("transfer_to_billing", "invoice"),
        Round::text("Looking at one."),
        Round::text("Looking at three."),
    ]);
    let synthesizer = WordSynthesizer::new(Duration::from_millis(60));
    let mut session = start(
        registry,
        capabilities(&generator, &synthesizer),
        test_config(),
        Arc::new(MemoryDurableStore::new()),
        "turn-overflow",
    );

    session.caller.say("I have a billing question").await;
    let (_, first) = session.caller.next_audio().await;
    assert_eq!(first, "Billing");

    session.caller.say("one").await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    session.caller.say("two").await;
    session.caller.say("three").await;

    let dropped = session
        .wait_for(|e| matches!(e, RuntimeEvent::TurnDropped { .. }))
        .await;
    assert!(matches!(dropped, RuntimeEvent::TurnDropped { turn_id: 3 }));

    assert_eq!(
        session.caller.hear_words(6).await,
        "here, picking up from Concierge now."
    );
    session
        .wait_for(|e| matches!(e, RuntimeEvent::TurnCompleted { turn_id: 4, .. }))
        .await;

    let done = session.hang_up().await;
    assert_eq!(done.summary.turns_dropped, 1);
    assert_eq!(done.summary.turns_processed, 3);
    assert!(!done.saw(|e| matches!(e, RuntimeEvent::TurnStarted { turn_id: 3, .. })));
}
