//! Undo engine: reverses change events against their stored snapshots.
//!
//! A single undo flips one event to undone and applies the inverse of its
//! action inside one transaction. Rollback reverses every open event of an
//! assistant message newest-first, purges the message's event rows, and
//! deletes the message itself, all or nothing. Undo is idempotent: a second
//! undo of the same event reports `AlreadyUndone` and changes no state.

use crate::changelog::{ChangeAction, PlotChangeEvent, WorldChangeEvent};
use crate::game::MessageRole;
use crate::ids::{CardId, GameId, MessageId, PlotCardId, PlotEventId, WorldEventId};
use crate::store::{cards, changelog, messages, GameStore, StoreError};
use chrono::Utc;
use sqlx::SqliteConnection;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UndoError {
    /// The event's snapshots no longer describe a restorable card.
    #[error("change event cannot be undone: {0}")]
    Conflict(String),

    #[error("unsupported change action: {0}")]
    UnsupportedAction(String),

    #[error("rollback target is not an assistant message")]
    NotAssistantMessage,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<sqlx::Error> for UndoError {
    fn from(err: sqlx::Error) -> Self {
        UndoError::Store(StoreError::from(err))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndoOutcome {
    Undone,
    AlreadyUndone,
}

/// What a rollback removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollbackReport {
    pub world_undone: usize,
    pub plot_undone: usize,
}

#[derive(Clone)]
pub struct UndoEngine {
    store: GameStore,
}

impl UndoEngine {
    pub fn new(store: GameStore) -> Self {
        Self { store }
    }

    /// Reverse one world-card event.
    pub async fn undo_world_event(
        &self,
        game_id: GameId,
        event_id: WorldEventId,
    ) -> Result<UndoOutcome, UndoError> {
        let mut tx = self.store.pool().begin().await?;
        let event = changelog::get_world_event_row(&mut *tx, game_id, event_id)
            .await?
            .ok_or_else(|| StoreError::not_found("world card event", event_id))?;
        if event.is_undone() {
            return Ok(UndoOutcome::AlreadyUndone);
        }
        apply_world_undo(&mut tx, game_id, &event, &mut HashMap::new()).await?;
        if !changelog::mark_world_event_undone(&mut *tx, event_id, Utc::now()).await? {
            // Lost a race against another undo of the same event.
            tx.rollback().await?;
            return Ok(UndoOutcome::AlreadyUndone);
        }
        crate::store::touch_game(&mut *tx, game_id, Utc::now()).await?;
        tx.commit().await?;
        tracing::debug!(event_id = %event_id, "undid world card event");
        Ok(UndoOutcome::Undone)
    }

    /// Reverse one plot-card event.
    pub async fn undo_plot_event(
        &self,
        game_id: GameId,
        event_id: PlotEventId,
    ) -> Result<UndoOutcome, UndoError> {
        let mut tx = self.store.pool().begin().await?;
        let event = changelog::get_plot_event_row(&mut *tx, game_id, event_id)
            .await?
            .ok_or_else(|| StoreError::not_found("plot card event", event_id))?;
        if event.is_undone() {
            return Ok(UndoOutcome::AlreadyUndone);
        }
        apply_plot_undo(&mut tx, game_id, &event, &mut HashMap::new()).await?;
        if !changelog::mark_plot_event_undone(&mut *tx, event_id, Utc::now()).await? {
            tx.rollback().await?;
            return Ok(UndoOutcome::AlreadyUndone);
        }
        crate::store::touch_game(&mut *tx, game_id, Utc::now()).await?;
        tx.commit().await?;
        tracing::debug!(event_id = %event_id, "undid plot card event");
        Ok(UndoOutcome::Undone)
    }

    /// Throw away an assistant reply and everything it changed: reverse its
    /// open events newest-first, purge all its event rows, and delete the
    /// message. Runs in one transaction; an unsupported event aborts the
    /// whole rollback.
    pub async fn rollback_message(
        &self,
        game_id: GameId,
        message_id: MessageId,
    ) -> Result<RollbackReport, UndoError> {
        let mut tx = self.store.pool().begin().await?;
        let message = messages::get_message_row(&mut *tx, game_id, message_id)
            .await?
            .ok_or_else(|| StoreError::not_found("message", message_id))?;
        if message.role != MessageRole::Assistant {
            return Err(UndoError::NotAssistantMessage);
        }

        // One remap per rollback: a card resurrected mid-rollback keeps
        // being addressed by its old id in older events of the same turn,
        // so undoing [add, delete] nets out to nothing.
        let mut world_remap = HashMap::new();
        let world_events =
            changelog::open_world_events_for_message_desc(&mut *tx, game_id, message_id).await?;
        for event in &world_events {
            apply_world_undo(&mut tx, game_id, event, &mut world_remap).await?;
        }
        let mut plot_remap = HashMap::new();
        let plot_events =
            changelog::open_plot_events_for_message_desc(&mut *tx, game_id, message_id).await?;
        for event in &plot_events {
            apply_plot_undo(&mut tx, game_id, event, &mut plot_remap).await?;
        }

        changelog::delete_world_events_for_message(&mut *tx, game_id, message_id).await?;
        changelog::delete_plot_events_for_message(&mut *tx, game_id, message_id).await?;
        messages::delete_message_row(&mut *tx, game_id, message_id).await?;
        crate::store::touch_game(&mut *tx, game_id, Utc::now()).await?;
        tx.commit().await?;

        let report = RollbackReport {
            world_undone: world_events.len(),
            plot_undone: plot_events.len(),
        };
        tracing::debug!(
            message_id = %message_id,
            world = report.world_undone,
            plot = report.plot_undone,
            "rolled back assistant message"
        );
        Ok(report)
    }
}

/// Apply the inverse of a world-card event. Leaves the event row alone.
/// `remap` carries old-id to resurrected-id entries across the events of one
/// rollback; single undos pass an empty map.
async fn apply_world_undo(
    tx: &mut SqliteConnection,
    game_id: GameId,
    event: &WorldChangeEvent,
    remap: &mut HashMap<CardId, CardId>,
) -> Result<(), UndoError> {
    match &event.action {
        ChangeAction::Added => {
            let card_id = event
                .card_id
                .or_else(|| event.after.as_ref().map(|snap| snap.id))
                .ok_or_else(|| {
                    UndoError::Conflict("added event carries no card reference".into())
                })?;
            let target = remap.remove(&card_id).unwrap_or(card_id);
            // Null out every reference first so no event points at a
            // missing row. The card may already be gone; that is fine.
            changelog::detach_world_event_card_refs(&mut *tx, target).await?;
            cards::delete_world_card_row(&mut *tx, target).await?;
        }
        ChangeAction::Updated | ChangeAction::Deleted => {
            let snapshot = event
                .before
                .as_ref()
                .ok_or_else(|| UndoError::Conflict("event has no before snapshot".into()))?;
            let mut card = snapshot
                .to_card(game_id)
                .map_err(|e| UndoError::Conflict(e.to_string()))?;
            let target = remap.get(&snapshot.id).copied().unwrap_or(snapshot.id);
            let existing = cards::get_world_card_row(&mut *tx, game_id, target).await?;
            if existing.is_some() {
                card.id = target;
                cards::update_world_card_row(&mut *tx, &card).await?;
            } else {
                // The original row is gone, so the restore becomes a new
                // card and the event is re-pointed at it.
                card.id = CardId::new();
                cards::insert_world_card(&mut *tx, &card).await?;
                changelog::set_world_event_card_ref(&mut *tx, event.id, Some(card.id)).await?;
                remap.insert(snapshot.id, card.id);
            }
        }
        ChangeAction::Unknown(action) => {
            return Err(UndoError::UnsupportedAction(action.clone()));
        }
    }
    Ok(())
}

async fn apply_plot_undo(
    tx: &mut SqliteConnection,
    game_id: GameId,
    event: &PlotChangeEvent,
    remap: &mut HashMap<PlotCardId, PlotCardId>,
) -> Result<(), UndoError> {
    match &event.action {
        ChangeAction::Added => {
            let card_id = event
                .card_id
                .or_else(|| event.after.as_ref().map(|snap| snap.id))
                .ok_or_else(|| {
                    UndoError::Conflict("added event carries no card reference".into())
                })?;
            let target = remap.remove(&card_id).unwrap_or(card_id);
            changelog::detach_plot_event_card_refs(&mut *tx, target).await?;
            cards::delete_plot_card_row(&mut *tx, target).await?;
        }
        ChangeAction::Updated | ChangeAction::Deleted => {
            let snapshot = event
                .before
                .as_ref()
                .ok_or_else(|| UndoError::Conflict("event has no before snapshot".into()))?;
            let mut card = snapshot
                .to_card(game_id)
                .map_err(|e| UndoError::Conflict(e.to_string()))?;
            let target = remap.get(&snapshot.id).copied().unwrap_or(snapshot.id);
            let existing = cards::get_plot_card_row(&mut *tx, game_id, target).await?;
            if existing.is_some() {
                card.id = target;
                cards::update_plot_card_row(&mut *tx, &card).await?;
            } else {
                card.id = PlotCardId::new();
                cards::insert_plot_card(&mut *tx, &card).await?;
                changelog::set_plot_event_card_ref(&mut *tx, event.id, Some(card.id)).await?;
                remap.insert(snapshot.id, card.id);
            }
        }
        ChangeAction::Unknown(action) => {
            return Err(UndoError::UnsupportedAction(action.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cards::{CardKind, WorldCard};
    use crate::changelog::WorldCardSnapshot;
    use crate::game::Game;

    async fn setup() -> (GameStore, UndoEngine, GameId) {
        let store = GameStore::in_memory().await.unwrap();
        let game = store.create_game(Game::new("g")).await.unwrap();
        let engine = UndoEngine::new(store.clone());
        (store, engine, game.id)
    }

    #[tokio::test]
    async fn test_undo_added_removes_the_card() {
        let (store, engine, game_id) = setup().await;
        let card = WorldCard::new(game_id, "Shrine", "Mossy.", CardKind::World);
        let (card, event) = store.create_world_card(card, None).await.unwrap();

        let outcome = engine.undo_world_event(game_id, event.id).await.unwrap();
        assert_eq!(outcome, UndoOutcome::Undone);
        assert!(matches!(
            store.get_world_card(game_id, card.id).await,
            Err(StoreError::NotFound { .. })
        ));
        let event = store.get_world_event(game_id, event.id).await.unwrap();
        assert!(event.is_undone());
        assert!(event.card_id.is_none());
    }

    #[tokio::test]
    async fn test_undo_updated_restores_before_content() {
        let (store, engine, game_id) = setup().await;
        let card = WorldCard::new(game_id, "Shrine", "Mossy.", CardKind::World);
        let (card, _) = store.create_world_card(card, None).await.unwrap();
        let (_, update_event) = store
            .update_world_card(game_id, card.id, None, |c| {
                c.content = "Mossy and cracked.".into();
            })
            .await
            .unwrap();

        engine
            .undo_world_event(game_id, update_event.id)
            .await
            .unwrap();
        let restored = store.get_world_card(game_id, card.id).await.unwrap();
        assert_eq!(restored.content, "Mossy.");
    }

    #[tokio::test]
    async fn test_undo_deleted_resurrects_with_new_id() {
        let (store, engine, game_id) = setup().await;
        let card = WorldCard::new(game_id, "Shrine", "Mossy.", CardKind::World);
        let (card, _) = store.create_world_card(card, None).await.unwrap();
        let delete_event = store
            .delete_world_card(game_id, card.id, None)
            .await
            .unwrap();

        engine
            .undo_world_event(game_id, delete_event.id)
            .await
            .unwrap();
        let cards = store.list_world_cards(game_id).await.unwrap();
        assert_eq!(cards.len(), 1);
        assert_eq!(cards[0].content, "Mossy.");
        assert_ne!(cards[0].id, card.id);

        // The undone delete event points at the resurrected card.
        let event = store
            .get_world_event(game_id, delete_event.id)
            .await
            .unwrap();
        assert_eq!(event.card_id, Some(cards[0].id));
        assert!(event.is_undone());
    }

    #[tokio::test]
    async fn test_undo_is_idempotent() {
        let (store, engine, game_id) = setup().await;
        let card = WorldCard::new(game_id, "Shrine", "Mossy.", CardKind::World);
        let (_, event) = store.create_world_card(card, None).await.unwrap();

        assert_eq!(
            engine.undo_world_event(game_id, event.id).await.unwrap(),
            UndoOutcome::Undone
        );
        assert_eq!(
            engine.undo_world_event(game_id, event.id).await.unwrap(),
            UndoOutcome::AlreadyUndone
        );
        assert!(store.list_world_cards(game_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rollback_nets_out_add_then_delete() {
        let (store, engine, game_id) = setup().await;
        let message = store
            .create_message(game_id, MessageRole::Assistant, "a reply")
            .await
            .unwrap();
        let card = WorldCard::new(game_id, "Ghost", "Brief.", CardKind::World);
        let (card, _) = store
            .create_world_card(card, Some(message.id))
            .await
            .unwrap();
        store
            .delete_world_card(game_id, card.id, Some(message.id))
            .await
            .unwrap();

        let report = engine.rollback_message(game_id, message.id).await.unwrap();
        assert_eq!(report.world_undone, 2);
        assert!(store.list_world_cards(game_id).await.unwrap().is_empty());
        assert!(store.list_world_events(game_id).await.unwrap().is_empty());
        assert!(matches!(
            store.get_message(game_id, message.id).await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_rollback_refuses_user_messages() {
        let (store, engine, game_id) = setup().await;
        let message = store
            .create_message(game_id, MessageRole::User, "hello")
            .await
            .unwrap();
        let result = engine.rollback_message(game_id, message.id).await;
        assert!(matches!(result, Err(UndoError::NotAssistantMessage)));
        assert!(store.get_message(game_id, message.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_action_is_refused() {
        let (store, engine, game_id) = setup().await;
        let card = WorldCard::new(game_id, "Shrine", "Mossy.", CardKind::World);
        let snap = WorldCardSnapshot::capture(&card);
        let event = changelog::record_world_event(
            store.pool(),
            game_id,
            None,
            Some(card.id),
            ChangeAction::Unknown("merged".into()),
            Some(&snap),
            Some(&snap),
        )
        .await
        .unwrap();

        let result = engine.undo_world_event(game_id, event.id).await;
        assert!(matches!(result, Err(UndoError::UnsupportedAction(a)) if a == "merged"));
        let event = store.get_world_event(game_id, event.id).await.unwrap();
        assert!(!event.is_undone());
    }
}
