//! Voice swap integration tests

mod common;

use std::sync::Arc;
use std::time::Duration;

use beacon_live::capture::samples_to_pcm16;
use beacon_live::realtime::{ClientMessage, Role, ServerEvent};
use beacon_live::{Error, Phase, SwapOutcome, Voice};

use common::{Harness, WAIT, fast_config, speech_block, wait_for_state};

#[tokio::test]
async fn test_swap_suppresses_capture_until_introduction_ends() {
    let mut harness = Harness::new(fast_config());
    let mut first = harness.start().await;

    let session = Arc::clone(&harness.session);
    let swap = tokio::spawn(async move { session.select_voice(Voice::Ash).await });

    let swapping = wait_for_state(&harness.state, |s| s.is_voice_swapping).await;
    assert_eq!(swapping.selected_voice, Voice::Ash);

    // Old channel is closed and the new one opened with the new voice
    first.until_closed().await;
    let mut second = harness.next_server().await;
    assert_eq!(second.voice, Voice::Ash);

    harness.mic.feed(&[0.25; 4096]);

    second
        .send(ServerEvent::SessionReady { session_id: None })
        .await;
    let ClientMessage::ConversationItem { role, .. } = second.next_message().await else {
        panic!("expected the introduction instruction");
    };
    assert_eq!(role, Role::System);
    assert_eq!(second.next_message().await, ClientMessage::ResponseCreate);

    assert_eq!(swap.await.unwrap().unwrap(), SwapOutcome::Swapped);
    assert!(harness.state.snapshot().is_voice_swapping);
    harness.mic.feed(&[0.25; 4096]);

    second.send(ServerEvent::TurnComplete).await;
    wait_for_state(&harness.state, |s| !s.is_voice_swapping).await;

    let block = speech_block(4096);
    harness.mic.feed(&block);
    assert_eq!(
        second.next_message().await,
        ClientMessage::AudioAppend {
            audio: samples_to_pcm16(&block)
        }
    );

    harness.session.stop().await;
}

#[tokio::test]
async fn test_swap_retries_transient_failures() {
    let mut harness = Harness::new(fast_config());
    let _first = harness.start().await;
    harness.relay.fail_next(2);

    let session = Arc::clone(&harness.session);
    let swap = tokio::spawn(async move { session.select_voice(Voice::Sage).await });

    let second = harness.next_server().await;
    assert_eq!(second.voice, Voice::Sage);
    second
        .send(ServerEvent::SessionReady { session_id: None })
        .await;

    assert_eq!(swap.await.unwrap().unwrap(), SwapOutcome::Swapped);
    assert_eq!(
        harness.relay.requested_voices(),
        vec![Voice::Alloy, Voice::Sage, Voice::Sage, Voice::Sage]
    );

    harness.session.stop().await;
}

#[tokio::test]
async fn test_exhausted_swap_restores_previous_voice() {
    let mut harness = Harness::new(fast_config());
    let _first = harness.start().await;
    harness.relay.refuse(Voice::Ash);

    let outcome = harness.session.select_voice(Voice::Ash).await.unwrap();

    assert_eq!(
        outcome,
        SwapOutcome::Reverted {
            voice: Voice::Alloy
        }
    );
    let snapshot = harness.state.snapshot();
    assert!(snapshot.active);
    assert!(!snapshot.is_voice_swapping);
    assert_eq!(snapshot.selected_voice, Voice::Alloy);
    assert_eq!(snapshot.phase, Phase::Listening);
    assert_eq!(
        harness.relay.requested_voices(),
        vec![
            Voice::Alloy,
            Voice::Ash,
            Voice::Ash,
            Voice::Ash,
            Voice::Alloy
        ]
    );

    let mut restored = harness.next_server().await;
    assert_eq!(restored.voice, Voice::Alloy);
    harness.mic.feed(&speech_block(4096));
    assert!(matches!(
        restored.next_message().await,
        ClientMessage::AudioAppend { .. }
    ));

    harness.session.stop().await;
}

#[tokio::test]
async fn test_failed_swap_and_restore_ends_session() {
    let mut harness = Harness::new(fast_config());
    let _first = harness.start().await;
    harness.relay.refuse(Voice::Ash);
    harness.relay.refuse(Voice::Alloy);

    let result = harness.session.select_voice(Voice::Ash).await;

    assert!(matches!(result, Err(Error::VoiceSwapFailed(_))));
    let snapshot = harness.state.snapshot();
    assert!(!snapshot.active);
    assert!(!snapshot.is_voice_swapping);
    assert_eq!(snapshot.phase, Phase::Idle);
    assert_eq!(snapshot.selected_voice, Voice::Alloy);
    assert!(!harness.mic.is_open());
}

#[tokio::test]
async fn test_overlapping_swaps_are_rejected() {
    let mut harness = Harness::new(fast_config());
    let _first = harness.start().await;

    let session = Arc::clone(&harness.session);
    let swap = tokio::spawn(async move { session.select_voice(Voice::Ash).await });
    wait_for_state(&harness.state, |s| s.is_voice_swapping).await;

    // While reconnecting
    let result = harness.session.select_voice(Voice::Coral).await;
    assert!(matches!(result, Err(Error::SwapInProgress)));

    let second = harness.next_server().await;
    second
        .send(ServerEvent::SessionReady { session_id: None })
        .await;
    assert_eq!(swap.await.unwrap().unwrap(), SwapOutcome::Swapped);

    // While the new voice introduces itself
    let result = harness.session.select_voice(Voice::Coral).await;
    assert!(matches!(result, Err(Error::SwapInProgress)));
    assert_eq!(harness.state.snapshot().selected_voice, Voice::Ash);

    second.send(ServerEvent::TurnComplete).await;
    wait_for_state(&harness.state, |s| !s.is_voice_swapping).await;

    harness.session.stop().await;
}

#[tokio::test]
async fn test_missing_introduction_times_out() {
    let mut config = fast_config();
    config.swap.ready_timeout = Duration::from_millis(100);
    config.swap.introduction_timeout = Duration::from_millis(100);
    let mut harness = Harness::new(config);
    let _first = harness.start().await;

    // The new service never reports ready nor finishes a turn
    let outcome = harness.session.select_voice(Voice::Verse).await.unwrap();
    assert_eq!(outcome, SwapOutcome::Swapped);

    wait_for_state(&harness.state, |s| !s.is_voice_swapping).await;

    let mut second = harness.next_server().await;
    assert!(matches!(
        second.next_message().await,
        ClientMessage::ConversationItem {
            role: Role::System,
            ..
        }
    ));
    assert_eq!(second.next_message().await, ClientMessage::ResponseCreate);

    let block = speech_block(4096);
    harness.mic.feed(&block);
    assert_eq!(
        second.next_message().await,
        ClientMessage::AudioAppend {
            audio: samples_to_pcm16(&block)
        }
    );

    harness.session.stop().await;
}

#[tokio::test]
async fn test_swap_without_session_records_preference() {
    let mut harness = Harness::new(fast_config());

    let outcome = harness.session.select_voice(Voice::Verse).await.unwrap();

    assert_eq!(outcome, SwapOutcome::Recorded);
    assert_eq!(harness.state.snapshot().selected_voice, Voice::Verse);
    assert!(harness.relay.requested_voices().is_empty());

    let server = harness.start().await;
    assert_eq!(server.voice, Voice::Verse);

    harness.session.stop().await;
}

#[tokio::test]
async fn test_swap_to_current_voice_is_noop() {
    let mut harness = Harness::new(fast_config());
    let _first = harness.start().await;

    let outcome = harness.session.select_voice(Voice::Alloy).await.unwrap();

    assert_eq!(outcome, SwapOutcome::Unchanged);
    assert!(!harness.state.snapshot().is_voice_swapping);
    assert!(harness.servers.try_recv().is_err());

    harness.session.stop().await;
}

#[tokio::test]
async fn test_channel_closing_before_ready_is_retried() {
    let mut harness = Harness::new(fast_config());
    let _first = harness.start().await;

    let session = Arc::clone(&harness.session);
    let swap = tokio::spawn(async move { session.select_voice(Voice::Ash).await });

    let second = harness.next_server().await;
    assert_eq!(second.voice, Voice::Ash);
    drop(second);

    let third = harness.next_server().await;
    assert_eq!(third.voice, Voice::Ash);
    third
        .send(ServerEvent::SessionReady { session_id: None })
        .await;

    assert_eq!(swap.await.unwrap().unwrap(), SwapOutcome::Swapped);
    let snapshot = harness.state.snapshot();
    assert!(snapshot.active);
    assert_eq!(snapshot.selected_voice, Voice::Ash);

    third.send(ServerEvent::TurnComplete).await;
    let resumed = wait_for_state(&harness.state, |s| !s.is_voice_swapping).await;
    assert!(resumed.allows_capture());

    harness.session.stop().await;
}

#[tokio::test]
async fn test_channels_closing_before_ready_fall_back() {
    let mut harness = Harness::new(fast_config());
    let _first = harness.start().await;

    let session = Arc::clone(&harness.session);
    let swap = tokio::spawn(async move { session.select_voice(Voice::Ash).await });

    for _ in 0..3 {
        let attempt = harness.next_server().await;
        assert_eq!(attempt.voice, Voice::Ash);
        drop(attempt);
    }
    let restored = harness.next_server().await;
    assert_eq!(restored.voice, Voice::Alloy);

    assert_eq!(
        swap.await.unwrap().unwrap(),
        SwapOutcome::Reverted {
            voice: Voice::Alloy
        }
    );
    let snapshot = harness.state.snapshot();
    assert!(snapshot.active);
    assert!(!snapshot.is_voice_swapping);
    assert_eq!(snapshot.selected_voice, Voice::Alloy);
    assert_eq!(snapshot.phase, Phase::Listening);

    harness.session.stop().await;
}

#[tokio::test]
async fn test_unanswered_relay_during_swap_ends_session() {
    let mut config = fast_config();
    config.session.connect_timeout = Duration::from_millis(20);
    let mut harness = Harness::new(config);
    let _first = harness.start().await;
    harness.relay.stall();

    let result = tokio::time::timeout(WAIT, harness.session.select_voice(Voice::Ash))
        .await
        .expect("swap hung on the relay");

    assert!(matches!(result, Err(Error::VoiceSwapFailed(_))));
    let snapshot = harness.state.snapshot();
    assert!(!snapshot.is_voice_swapping);
    assert!(!snapshot.active);
    assert!(!harness.mic.is_open());
}
