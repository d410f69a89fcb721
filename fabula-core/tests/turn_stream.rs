//! End-to-end turn flow against a scripted provider.
//!
//! These tests cover:
//! - The event sequence of a successful turn, including extracted card
//!   changes and digest creation
//! - Partial persistence when the stream fails mid-turn
//! - Cancellation keeping the last persisted chunk and nothing after it
//! - Reroll discarding the previous reply and its world changes

use fabula_core::testing::MockProvider;
use fabula_core::{
    CharacterProfile, ErrorKind, Game, GameSession, GameStore, TurnConfig, TurnEvent,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

async fn new_session(provider: Arc<MockProvider>, config: TurnConfig) -> GameSession {
    let store = GameStore::in_memory().await.unwrap();
    GameSession::create(store, provider, config, Game::new("The Hollow Road"))
        .await
        .unwrap()
}

async fn drain(mut events: ReceiverStream<TurnEvent>) -> Vec<TurnEvent> {
    let mut collected = Vec::new();
    while let Some(event) = events.next().await {
        collected.push(event);
    }
    collected
}

// =============================================================================
// HAPPY PATH
// =============================================================================

#[tokio::test]
async fn test_turn_streams_start_chunks_done() {
    let provider = Arc::new(MockProvider::new());
    provider.script_turn(vec!["The gate ", "grinds open."]);
    provider.script_completion(
        r#"{"changes":[{"action":"add","kind":"world","title":"The Iron Gate","content":"Stands open since tonight.","triggers":["gate"]}]}"#,
    );
    provider.script_completion("The hero forced the iron gate of the keep.");

    let session = new_session(provider.clone(), TurnConfig::default()).await;
    let events = session
        .send("I push the gate.", CancellationToken::new())
        .await
        .unwrap();
    let events = drain(events).await;

    assert!(matches!(
        events.first(),
        Some(TurnEvent::Start {
            user_message_id: Some(_),
            ..
        })
    ));
    let deltas: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            TurnEvent::Chunk { delta, .. } => Some(delta.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(deltas, vec!["The gate ", "grinds open."]);

    match events.last() {
        Some(TurnEvent::Done {
            message,
            world_card_events,
            plot_card_events,
            plot_card_created,
        }) => {
            assert_eq!(message.content, "The gate grinds open.");
            assert_eq!(world_card_events.len(), 1);
            assert_eq!(plot_card_events.len(), 1);
            assert!(plot_card_created);
        }
        other => panic!("expected done event, got {other:?}"),
    }

    let cards = session.list_world_cards().await.unwrap();
    assert_eq!(cards.len(), 1);
    assert_eq!(cards[0].title, "The Iron Gate");

    let digest = session
        .store()
        .find_digest_card(session.game_id())
        .await
        .unwrap()
        .unwrap();
    assert!(digest.content.contains("forced the iron gate"));

    let messages = session.list_messages().await.unwrap();
    assert_eq!(messages.len(), 2);
    assert!(messages[1].is_assistant());
}

#[tokio::test]
async fn test_context_rides_along_with_the_request() {
    let provider = Arc::new(MockProvider::new());
    provider.script_turn(vec!["Dusk settles."]);

    let session = new_session(provider.clone(), TurnConfig::default()).await;
    session
        .set_main_hero(CharacterProfile::new("Aldric", "A knight out of favor."))
        .await
        .unwrap();

    drain(
        session
            .send("I walk the walls.", CancellationToken::new())
            .await
            .unwrap(),
    )
    .await;

    let requests = provider.turn_requests();
    assert_eq!(requests.len(), 1);
    let context = &requests[0].context;
    assert_eq!(context.world_cards.len(), 1);
    assert!(context.world_cards[0].is_main_hero());
    assert_eq!(context.history.len(), 1);
    assert_eq!(context.history[0].content, "I walk the walls.");
}

// =============================================================================
// FAILURE AND CANCELLATION
// =============================================================================

#[tokio::test]
async fn test_provider_not_ready_refuses_the_turn() {
    let provider = Arc::new(MockProvider::new());
    provider.set_ready(false);
    let session = new_session(provider, TurnConfig::default()).await;

    let refused = session.send("Hello?", CancellationToken::new()).await;
    match refused {
        Err(err) => assert_eq!(err.kind(), ErrorKind::Upstream),
        Ok(_) => panic!("expected the turn to be refused"),
    }
}

#[tokio::test]
async fn test_stream_failure_keeps_the_partial_text() {
    let provider = Arc::new(MockProvider::new());
    provider.script_turn_with_error(vec!["Half a ", "sentence"], "connection reset");

    let session = new_session(provider, TurnConfig::default()).await;
    let events = drain(
        session
            .send("Go on.", CancellationToken::new())
            .await
            .unwrap(),
    )
    .await;

    assert!(
        events
            .iter()
            .any(|e| matches!(e, TurnEvent::Error { detail } if detail.contains("connection reset")))
    );
    assert!(!events.iter().any(|e| matches!(e, TurnEvent::Done { .. })));

    let messages = session.list_messages().await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].content, "Half a sentence");
}

#[tokio::test]
async fn test_empty_prompt_is_refused() {
    let provider = Arc::new(MockProvider::new());
    let session = new_session(provider, TurnConfig::default()).await;

    let refused = session.send("   ", CancellationToken::new()).await;
    match refused {
        Err(err) => assert_eq!(err.kind(), ErrorKind::Validation),
        Ok(_) => panic!("expected the empty prompt to be refused"),
    }
}

#[tokio::test]
async fn test_cancel_keeps_the_last_persisted_chunk() {
    let provider = Arc::new(MockProvider::new());
    let feed = provider.manual_turn();
    let config = TurnConfig::default()
        .with_persist_min_chars(8)
        .with_persist_max_interval(Duration::from_secs(600));
    let session = new_session(provider, config).await;

    let cancel = CancellationToken::new();
    let mut events = session
        .send("The cave mouth.", cancel.clone())
        .await
        .unwrap();
    assert!(matches!(
        events.next().await,
        Some(TurnEvent::Start { .. })
    ));

    // Crosses the persistence threshold, so it is written through.
    feed.send(Ok("The dragon ".to_string())).unwrap();
    assert!(matches!(events.next().await, Some(TurnEvent::Chunk { .. })));

    // Stays below the threshold, so it only lives in the buffer.
    feed.send(Ok("wakes".to_string())).unwrap();
    assert!(matches!(events.next().await, Some(TurnEvent::Chunk { .. })));

    cancel.cancel();
    let rest = drain(events).await;
    assert!(!rest.iter().any(|e| matches!(e, TurnEvent::Done { .. })));

    let messages = session.list_messages().await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].content, "The dragon ");
}

// =============================================================================
// REROLL
// =============================================================================

#[tokio::test]
async fn test_reroll_replaces_the_reply_and_rewinds_its_changes() {
    let provider = Arc::new(MockProvider::new());
    provider.script_turn(vec!["A stranger ", "arrives."]);
    provider.script_completion(
        r#"{"changes":[{"action":"add","kind":"npc","title":"The Stranger","content":"Face hidden under a hood.","triggers":["stranger"]}]}"#,
    );
    provider.script_completion("");

    let session = new_session(provider.clone(), TurnConfig::default()).await;
    let first = drain(
        session
            .send("I wait by the fire.", CancellationToken::new())
            .await
            .unwrap(),
    )
    .await;
    let first_reply_id = match first.last() {
        Some(TurnEvent::Done { message, .. }) => message.id,
        other => panic!("expected done event, got {other:?}"),
    };
    assert_eq!(session.list_world_cards().await.unwrap().len(), 1);

    provider.script_turn(vec!["Rain falls on an empty road."]);
    provider.script_completion(r#"{"changes":[]}"#);
    provider.script_completion("");

    let second = drain(session.reroll(CancellationToken::new()).await.unwrap()).await;
    match second.last() {
        Some(TurnEvent::Done { message, .. }) => {
            assert_eq!(message.content, "Rain falls on an empty road.");
            assert_ne!(message.id, first_reply_id);
        }
        other => panic!("expected done event, got {other:?}"),
    }

    // The stranger and the event that introduced him are both gone.
    assert!(session.list_world_cards().await.unwrap().is_empty());
    assert!(session.list_world_events().await.unwrap().is_empty());

    let messages = session.list_messages().await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].content, "I wait by the fire.");
    assert_eq!(messages[1].content, "Rain falls on an empty road.");
}

#[tokio::test]
async fn test_reroll_twice_in_a_row_works() {
    let provider = Arc::new(MockProvider::new());
    for reply in ["First take.", "Second take.", "Third take."] {
        provider.script_turn(vec![reply]);
        provider.script_completion(r#"{"changes":[]}"#);
        provider.script_completion("");
    }

    let session = new_session(provider, TurnConfig::default()).await;
    drain(
        session
            .send("Begin.", CancellationToken::new())
            .await
            .unwrap(),
    )
    .await;
    drain(session.reroll(CancellationToken::new()).await.unwrap()).await;
    drain(session.reroll(CancellationToken::new()).await.unwrap()).await;

    let messages = session.list_messages().await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].content, "Third take.");
}
