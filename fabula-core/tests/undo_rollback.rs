//! Undo and rollback across real turns.
//!
//! Turns here run against a scripted provider whose extraction output
//! mutates the world, so every undo acts on events the engine itself
//! recorded. The rollback tests check the rewind property: after rolling
//! a reply back, the card set matches the pre-turn state (resurrected
//! cards may carry fresh ids).

use fabula_core::testing::MockProvider;
use fabula_core::{
    CardKind, Game, GameSession, GameStore, TurnConfig, TurnEvent, UndoOutcome, WorldCard,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

async fn new_session(provider: Arc<MockProvider>) -> GameSession {
    let store = GameStore::in_memory().await.unwrap();
    GameSession::create(
        store,
        provider,
        TurnConfig::default(),
        Game::new("The Hollow Road"),
    )
    .await
    .unwrap()
}

/// Run one turn to completion and return its done event.
async fn run_turn(session: &GameSession, prompt: &str) -> TurnEvent {
    let mut events = session
        .send(prompt, CancellationToken::new())
        .await
        .unwrap();
    let mut done = None;
    while let Some(event) = events.next().await {
        if matches!(event, TurnEvent::Done { .. }) {
            done = Some(event);
        }
    }
    done.expect("turn did not finish")
}

fn card_fingerprints(cards: &[WorldCard]) -> BTreeSet<(String, String)> {
    cards
        .iter()
        .map(|c| (c.title.clone(), c.content.clone()))
        .collect()
}

#[tokio::test]
async fn test_undo_of_an_ai_update_restores_the_card() {
    let provider = Arc::new(MockProvider::new());
    let session = new_session(provider.clone()).await;
    let (bridge, _) = session
        .create_world_card(WorldCard::new(
            session.game_id(),
            "The Rope Bridge",
            "Sways over the gorge, planks missing.",
            CardKind::World,
        ))
        .await
        .unwrap();

    provider.script_turn(vec!["The bridge snaps behind you."]);
    provider.script_completion(
        r#"{"changes":[{"action":"update","title":"the rope bridge","content":"Cut. Only frayed ropes remain."}]}"#,
    );
    provider.script_completion("");
    let done = run_turn(&session, "I cut the bridge.").await;

    let event = match &done {
        TurnEvent::Done {
            world_card_events, ..
        } => world_card_events[0].clone(),
        _ => unreachable!(),
    };
    let changed = session.get_world_card(bridge.id).await.unwrap();
    assert!(changed.content.contains("frayed ropes"));

    assert!(matches!(
        session.undo_world_event(event.id).await.unwrap(),
        UndoOutcome::Undone
    ));
    let restored = session.get_world_card(bridge.id).await.unwrap();
    assert_eq!(restored.content, bridge.content);

    // A second undo of the same event changes nothing.
    assert!(matches!(
        session.undo_world_event(event.id).await.unwrap(),
        UndoOutcome::AlreadyUndone
    ));
    assert_eq!(
        session.get_world_card(bridge.id).await.unwrap().content,
        bridge.content
    );
}

#[tokio::test]
async fn test_undo_of_an_ai_add_removes_the_card() {
    let provider = Arc::new(MockProvider::new());
    let session = new_session(provider.clone()).await;

    provider.script_turn(vec!["A watchtower looms ahead."]);
    provider.script_completion(
        r#"{"changes":[{"action":"add","kind":"world","title":"The Watchtower","content":"Abandoned, but the brazier is warm.","triggers":["watchtower"]}]}"#,
    );
    provider.script_completion("");
    let done = run_turn(&session, "I scan the ridge.").await;

    let event = match &done {
        TurnEvent::Done {
            world_card_events, ..
        } => world_card_events[0].clone(),
        _ => unreachable!(),
    };
    assert_eq!(session.list_world_cards().await.unwrap().len(), 1);

    session.undo_world_event(event.id).await.unwrap();
    assert!(session.list_world_cards().await.unwrap().is_empty());

    // The event survives as history, marked undone and detached.
    let history = session.list_world_events().await.unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].is_undone());
    assert!(history[0].card_id.is_none());
}

#[tokio::test]
async fn test_rollback_rewinds_a_whole_turn() {
    let provider = Arc::new(MockProvider::new());
    let session = new_session(provider.clone()).await;
    session
        .create_world_card(WorldCard::new(
            session.game_id(),
            "The Ferryman",
            "Poles his raft across the black river.",
            CardKind::World,
        ))
        .await
        .unwrap();
    session
        .create_world_card(WorldCard::new(
            session.game_id(),
            "The Lantern",
            "Burns green when spirits are near.",
            CardKind::World,
        ))
        .await
        .unwrap();
    let before = card_fingerprints(&session.list_world_cards().await.unwrap());

    // One turn that adds, updates, and deletes in a single reply.
    provider.script_turn(vec!["The ferryman takes the lantern and is gone."]);
    provider.script_completion(
        r#"{"changes":[
            {"action":"add","kind":"npc","title":"The Pale Passenger","content":"Boarded without paying.","triggers":["passenger"]},
            {"action":"update","title":"The Ferryman","content":"Gone. The raft drifts unmanned."},
            {"action":"delete","title":"The Lantern"}
        ]}"#,
    );
    provider.script_completion("The ferryman vanished mid-crossing.");
    let done = run_turn(&session, "I hand over the lantern.").await;

    let (message_id, world_events, created_digest) = match &done {
        TurnEvent::Done {
            message,
            world_card_events,
            plot_card_created,
            ..
        } => (message.id, world_card_events.len(), *plot_card_created),
        _ => unreachable!(),
    };
    assert_eq!(world_events, 3);
    assert!(created_digest);
    assert_ne!(
        card_fingerprints(&session.list_world_cards().await.unwrap()),
        before
    );

    let report = session.rollback_message(message_id).await.unwrap();
    assert_eq!(report.world_undone, 3);
    assert_eq!(report.plot_undone, 1);

    // Same titles and contents as before the turn; the digest is gone too.
    let after = card_fingerprints(&session.list_world_cards().await.unwrap());
    assert_eq!(after, before);
    assert!(session.list_plot_cards().await.unwrap().is_empty());

    // The reply and its event trail are gone; only the user-made creation
    // events, which belong to no message, remain.
    let messages = session.list_messages().await.unwrap();
    assert_eq!(messages.len(), 1);
    assert!(!messages[0].is_assistant());
    let world_history = session.list_world_events().await.unwrap();
    assert_eq!(world_history.len(), 2);
    assert!(world_history.iter().all(|e| e.message_id.is_none()));
    assert!(session.list_plot_events().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_open_events_narrow_to_one_message() {
    let provider = Arc::new(MockProvider::new());
    let session = new_session(provider.clone()).await;

    provider.script_turn(vec!["A shrine by the road."]);
    provider.script_completion(
        r#"{"changes":[{"action":"add","kind":"world","title":"The Shrine","content":"Moss-grown, recently swept.","triggers":["shrine"]}]}"#,
    );
    provider.script_completion("");
    let first = run_turn(&session, "I follow the road.").await;

    provider.script_turn(vec!["An offering bowl sits empty."]);
    provider.script_completion(
        r#"{"changes":[{"action":"update","title":"The Shrine","content":"Its offering bowl sits empty."}]}"#,
    );
    provider.script_completion("");
    let second = run_turn(&session, "I look closer.").await;

    let first_id = match &first {
        TurnEvent::Done { message, .. } => message.id,
        _ => unreachable!(),
    };
    let second_id = match &second {
        TurnEvent::Done { message, .. } => message.id,
        _ => unreachable!(),
    };

    assert_eq!(session.list_open_world_events(None).await.unwrap().len(), 2);
    let narrowed = session
        .list_open_world_events(Some(second_id))
        .await
        .unwrap();
    assert_eq!(narrowed.len(), 1);
    assert_eq!(narrowed[0].message_id, Some(second_id));
    assert_ne!(narrowed[0].message_id, Some(first_id));
}
