//! Change-event persistence. Events are append-only: undo flips `undone_at`,
//! and only a full turn rollback deletes rows. The raw helpers here are
//! executor-generic so the undo engine can call them mid-transaction.

use super::{parse_id, GameStore, StoreError};
use crate::changelog::{
    plot_change_summary, world_change_summary, ChangeAction, PlotCardSnapshot, PlotChangeEvent,
    WorldCardSnapshot, WorldChangeEvent,
};
use crate::ids::{CardId, GameId, MessageId, PlotCardId, PlotEventId, WorldEventId};
use chrono::{DateTime, Utc};
use sqlx::Row;

impl GameStore {
    pub async fn get_world_event(
        &self,
        game_id: GameId,
        event_id: WorldEventId,
    ) -> Result<WorldChangeEvent, StoreError> {
        let row = sqlx::query("SELECT * FROM world_card_events WHERE game_id = ? AND id = ?")
            .bind(game_id.to_string())
            .bind(event_id.as_i64())
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| StoreError::not_found("world card event", event_id))?;
        world_event_from_row(&row)
    }

    pub async fn get_plot_event(
        &self,
        game_id: GameId,
        event_id: PlotEventId,
    ) -> Result<PlotChangeEvent, StoreError> {
        let row = sqlx::query("SELECT * FROM plot_card_events WHERE game_id = ? AND id = ?")
            .bind(game_id.to_string())
            .bind(event_id.as_i64())
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| StoreError::not_found("plot card event", event_id))?;
        plot_event_from_row(&row)
    }

    /// Full world-card history for a game, oldest first. Undone events are
    /// included so a changelog view can gray them out.
    pub async fn list_world_events(
        &self,
        game_id: GameId,
    ) -> Result<Vec<WorldChangeEvent>, StoreError> {
        let rows = sqlx::query("SELECT * FROM world_card_events WHERE game_id = ? ORDER BY id ASC")
            .bind(game_id.to_string())
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(world_event_from_row).collect()
    }

    pub async fn list_plot_events(
        &self,
        game_id: GameId,
    ) -> Result<Vec<PlotChangeEvent>, StoreError> {
        let rows = sqlx::query("SELECT * FROM plot_card_events WHERE game_id = ? ORDER BY id ASC")
            .bind(game_id.to_string())
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(plot_event_from_row).collect()
    }

    /// Events still in effect, optionally narrowed to one assistant message.
    pub async fn list_open_world_events(
        &self,
        game_id: GameId,
        message_id: Option<MessageId>,
    ) -> Result<Vec<WorldChangeEvent>, StoreError> {
        let rows = match message_id {
            Some(message_id) => {
                sqlx::query(
                    "SELECT * FROM world_card_events
                     WHERE game_id = ? AND message_id = ? AND undone_at IS NULL
                     ORDER BY id ASC",
                )
                .bind(game_id.to_string())
                .bind(message_id.to_string())
                .fetch_all(self.pool())
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM world_card_events
                     WHERE game_id = ? AND undone_at IS NULL
                     ORDER BY id ASC",
                )
                .bind(game_id.to_string())
                .fetch_all(self.pool())
                .await?
            }
        };
        rows.iter().map(world_event_from_row).collect()
    }

    pub async fn list_open_plot_events(
        &self,
        game_id: GameId,
        message_id: Option<MessageId>,
    ) -> Result<Vec<PlotChangeEvent>, StoreError> {
        let rows = match message_id {
            Some(message_id) => {
                sqlx::query(
                    "SELECT * FROM plot_card_events
                     WHERE game_id = ? AND message_id = ? AND undone_at IS NULL
                     ORDER BY id ASC",
                )
                .bind(game_id.to_string())
                .bind(message_id.to_string())
                .fetch_all(self.pool())
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM plot_card_events
                     WHERE game_id = ? AND undone_at IS NULL
                     ORDER BY id ASC",
                )
                .bind(game_id.to_string())
                .fetch_all(self.pool())
                .await?
            }
        };
        rows.iter().map(plot_event_from_row).collect()
    }
}

pub(crate) async fn record_world_event<'e, E>(
    executor: E,
    game_id: GameId,
    message_id: Option<MessageId>,
    card_id: Option<CardId>,
    action: ChangeAction,
    before: Option<&WorldCardSnapshot>,
    after: Option<&WorldCardSnapshot>,
) -> Result<WorldChangeEvent, StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let (label, excerpt) = world_change_summary(before, after);
    let before_json = before.map(WorldCardSnapshot::to_json).transpose()?;
    let after_json = after.map(WorldCardSnapshot::to_json).transpose()?;
    let created_at = Utc::now();
    let result = sqlx::query(
        "INSERT INTO world_card_events
         (game_id, message_id, card_id, action, label, excerpt,
          before_snapshot, after_snapshot, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(game_id.to_string())
    .bind(message_id.map(|id| id.to_string()))
    .bind(card_id.map(|id| id.to_string()))
    .bind(action.as_str())
    .bind(&label)
    .bind(&excerpt)
    .bind(before_json)
    .bind(after_json)
    .bind(created_at)
    .execute(executor)
    .await?;
    Ok(WorldChangeEvent {
        id: WorldEventId::from_i64(result.last_insert_rowid()),
        game_id,
        message_id,
        card_id,
        action,
        label,
        excerpt,
        before: before.cloned(),
        after: after.cloned(),
        created_at,
        undone_at: None,
    })
}

pub(crate) async fn record_plot_event<'e, E>(
    executor: E,
    game_id: GameId,
    message_id: Option<MessageId>,
    card_id: Option<PlotCardId>,
    action: ChangeAction,
    before: Option<&PlotCardSnapshot>,
    after: Option<&PlotCardSnapshot>,
) -> Result<PlotChangeEvent, StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let (label, excerpt) = plot_change_summary(before, after);
    let before_json = before.map(PlotCardSnapshot::to_json).transpose()?;
    let after_json = after.map(PlotCardSnapshot::to_json).transpose()?;
    let created_at = Utc::now();
    let result = sqlx::query(
        "INSERT INTO plot_card_events
         (game_id, message_id, card_id, action, label, excerpt,
          before_snapshot, after_snapshot, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(game_id.to_string())
    .bind(message_id.map(|id| id.to_string()))
    .bind(card_id.map(|id| id.to_string()))
    .bind(action.as_str())
    .bind(&label)
    .bind(&excerpt)
    .bind(before_json)
    .bind(after_json)
    .bind(created_at)
    .execute(executor)
    .await?;
    Ok(PlotChangeEvent {
        id: PlotEventId::from_i64(result.last_insert_rowid()),
        game_id,
        message_id,
        card_id,
        action,
        label,
        excerpt,
        before: before.cloned(),
        after: after.cloned(),
        created_at,
        undone_at: None,
    })
}

pub(crate) async fn get_world_event_row<'e, E>(
    executor: E,
    game_id: GameId,
    event_id: WorldEventId,
) -> Result<Option<WorldChangeEvent>, StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let row = sqlx::query("SELECT * FROM world_card_events WHERE game_id = ? AND id = ?")
        .bind(game_id.to_string())
        .bind(event_id.as_i64())
        .fetch_optional(executor)
        .await?;
    row.as_ref().map(world_event_from_row).transpose()
}

pub(crate) async fn get_plot_event_row<'e, E>(
    executor: E,
    game_id: GameId,
    event_id: PlotEventId,
) -> Result<Option<PlotChangeEvent>, StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let row = sqlx::query("SELECT * FROM plot_card_events WHERE game_id = ? AND id = ?")
        .bind(game_id.to_string())
        .bind(event_id.as_i64())
        .fetch_optional(executor)
        .await?;
    row.as_ref().map(plot_event_from_row).transpose()
}

/// Open events for one assistant message, newest first. Rollback order.
pub(crate) async fn open_world_events_for_message_desc<'e, E>(
    executor: E,
    game_id: GameId,
    message_id: MessageId,
) -> Result<Vec<WorldChangeEvent>, StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let rows = sqlx::query(
        "SELECT * FROM world_card_events
         WHERE game_id = ? AND message_id = ? AND undone_at IS NULL
         ORDER BY id DESC",
    )
    .bind(game_id.to_string())
    .bind(message_id.to_string())
    .fetch_all(executor)
    .await?;
    rows.iter().map(world_event_from_row).collect()
}

pub(crate) async fn open_plot_events_for_message_desc<'e, E>(
    executor: E,
    game_id: GameId,
    message_id: MessageId,
) -> Result<Vec<PlotChangeEvent>, StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let rows = sqlx::query(
        "SELECT * FROM plot_card_events
         WHERE game_id = ? AND message_id = ? AND undone_at IS NULL
         ORDER BY id DESC",
    )
    .bind(game_id.to_string())
    .bind(message_id.to_string())
    .fetch_all(executor)
    .await?;
    rows.iter().map(plot_event_from_row).collect()
}

/// Stamp an event undone. Returns false when it was already undone.
pub(crate) async fn mark_world_event_undone<'e, E>(
    executor: E,
    event_id: WorldEventId,
    at: DateTime<Utc>,
) -> Result<bool, StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let result = sqlx::query(
        "UPDATE world_card_events SET undone_at = ? WHERE id = ? AND undone_at IS NULL",
    )
    .bind(at)
    .bind(event_id.as_i64())
    .execute(executor)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub(crate) async fn mark_plot_event_undone<'e, E>(
    executor: E,
    event_id: PlotEventId,
    at: DateTime<Utc>,
) -> Result<bool, StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let result = sqlx::query(
        "UPDATE plot_card_events SET undone_at = ? WHERE id = ? AND undone_at IS NULL",
    )
    .bind(at)
    .bind(event_id.as_i64())
    .execute(executor)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub(crate) async fn set_world_event_card_ref<'e, E>(
    executor: E,
    event_id: WorldEventId,
    card_id: Option<CardId>,
) -> Result<(), StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query("UPDATE world_card_events SET card_id = ? WHERE id = ?")
        .bind(card_id.map(|id| id.to_string()))
        .bind(event_id.as_i64())
        .execute(executor)
        .await?;
    Ok(())
}

pub(crate) async fn set_plot_event_card_ref<'e, E>(
    executor: E,
    event_id: PlotEventId,
    card_id: Option<PlotCardId>,
) -> Result<(), StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query("UPDATE plot_card_events SET card_id = ? WHERE id = ?")
        .bind(card_id.map(|id| id.to_string()))
        .bind(event_id.as_i64())
        .execute(executor)
        .await?;
    Ok(())
}

/// Null every event reference to a card that no longer exists.
pub(crate) async fn detach_world_event_card_refs<'e, E>(
    executor: E,
    card_id: CardId,
) -> Result<u64, StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let result = sqlx::query("UPDATE world_card_events SET card_id = NULL WHERE card_id = ?")
        .bind(card_id.to_string())
        .execute(executor)
        .await?;
    Ok(result.rows_affected())
}

pub(crate) async fn detach_plot_event_card_refs<'e, E>(
    executor: E,
    card_id: PlotCardId,
) -> Result<u64, StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let result = sqlx::query("UPDATE plot_card_events SET card_id = NULL WHERE card_id = ?")
        .bind(card_id.to_string())
        .execute(executor)
        .await?;
    Ok(result.rows_affected())
}

pub(crate) async fn delete_world_events_for_message<'e, E>(
    executor: E,
    game_id: GameId,
    message_id: MessageId,
) -> Result<u64, StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let result = sqlx::query("DELETE FROM world_card_events WHERE game_id = ? AND message_id = ?")
        .bind(game_id.to_string())
        .bind(message_id.to_string())
        .execute(executor)
        .await?;
    Ok(result.rows_affected())
}

pub(crate) async fn delete_plot_events_for_message<'e, E>(
    executor: E,
    game_id: GameId,
    message_id: MessageId,
) -> Result<u64, StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let result = sqlx::query("DELETE FROM plot_card_events WHERE game_id = ? AND message_id = ?")
        .bind(game_id.to_string())
        .bind(message_id.to_string())
        .execute(executor)
        .await?;
    Ok(result.rows_affected())
}

fn world_event_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<WorldChangeEvent, StoreError> {
    let game_id: String = row.try_get("game_id")?;
    let message_id: Option<String> = row.try_get("message_id")?;
    let card_id: Option<String> = row.try_get("card_id")?;
    let action: String = row.try_get("action")?;
    let before: Option<String> = row.try_get("before_snapshot")?;
    let after: Option<String> = row.try_get("after_snapshot")?;
    Ok(WorldChangeEvent {
        id: WorldEventId::from_i64(row.try_get("id")?),
        game_id: parse_id(&game_id, "game")?,
        message_id: message_id
            .as_deref()
            .map(|raw| parse_id(raw, "message"))
            .transpose()?,
        card_id: card_id
            .as_deref()
            .map(|raw| parse_id(raw, "world card"))
            .transpose()?,
        action: ChangeAction::parse(&action),
        label: row.try_get("label")?,
        excerpt: row.try_get("excerpt")?,
        before: before
            .as_deref()
            .map(WorldCardSnapshot::from_json)
            .transpose()?,
        after: after
            .as_deref()
            .map(WorldCardSnapshot::from_json)
            .transpose()?,
        created_at: row.try_get("created_at")?,
        undone_at: row.try_get("undone_at")?,
    })
}

fn plot_event_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<PlotChangeEvent, StoreError> {
    let game_id: String = row.try_get("game_id")?;
    let message_id: Option<String> = row.try_get("message_id")?;
    let card_id: Option<String> = row.try_get("card_id")?;
    let action: String = row.try_get("action")?;
    let before: Option<String> = row.try_get("before_snapshot")?;
    let after: Option<String> = row.try_get("after_snapshot")?;
    Ok(PlotChangeEvent {
        id: PlotEventId::from_i64(row.try_get("id")?),
        game_id: parse_id(&game_id, "game")?,
        message_id: message_id
            .as_deref()
            .map(|raw| parse_id(raw, "message"))
            .transpose()?,
        card_id: card_id
            .as_deref()
            .map(|raw| parse_id(raw, "plot card"))
            .transpose()?,
        action: ChangeAction::parse(&action),
        label: row.try_get("label")?,
        excerpt: row.try_get("excerpt")?,
        before: before
            .as_deref()
            .map(PlotCardSnapshot::from_json)
            .transpose()?,
        after: after
            .as_deref()
            .map(PlotCardSnapshot::from_json)
            .transpose()?,
        created_at: row.try_get("created_at")?,
        undone_at: row.try_get("undone_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cards::{CardKind, WorldCard};
    use crate::game::Game;

    #[tokio::test]
    async fn test_events_filter_by_message_and_undone() {
        let store = GameStore::in_memory().await.unwrap();
        let game = store.create_game(Game::new("g")).await.unwrap();
        let message_id = MessageId::new();

        let card = WorldCard::new(game.id, "Ruined Tower", "A tower.", CardKind::World);
        let after = WorldCardSnapshot::capture(&card);
        let first = record_world_event(
            store.pool(),
            game.id,
            Some(message_id),
            Some(card.id),
            ChangeAction::Added,
            None,
            Some(&after),
        )
        .await
        .unwrap();
        let second = record_world_event(
            store.pool(),
            game.id,
            None,
            Some(card.id),
            ChangeAction::Updated,
            Some(&after),
            Some(&after),
        )
        .await
        .unwrap();
        assert!(second.id > first.id);

        let scoped = store
            .list_open_world_events(game.id, Some(message_id))
            .await
            .unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].id, first.id);
        assert_eq!(scoped[0].label, "Ruined Tower");

        assert!(mark_world_event_undone(store.pool(), first.id, Utc::now())
            .await
            .unwrap());
        assert!(!mark_world_event_undone(store.pool(), first.id, Utc::now())
            .await
            .unwrap());

        let open = store.list_open_world_events(game.id, None).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, second.id);

        let all = store.list_world_events(game.id).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[0].is_undone());
    }

    #[tokio::test]
    async fn test_detach_clears_card_refs() {
        let store = GameStore::in_memory().await.unwrap();
        let game = store.create_game(Game::new("g")).await.unwrap();
        let card = WorldCard::new(game.id, "Bell", "Rings.", CardKind::World);
        let snap = WorldCardSnapshot::capture(&card);
        let event = record_world_event(
            store.pool(),
            game.id,
            None,
            Some(card.id),
            ChangeAction::Added,
            None,
            Some(&snap),
        )
        .await
        .unwrap();

        let touched = detach_world_event_card_refs(store.pool(), card.id)
            .await
            .unwrap();
        assert_eq!(touched, 1);
        let loaded = store.get_world_event(game.id, event.id).await.unwrap();
        assert!(loaded.card_id.is_none());
        assert!(loaded.after.is_some());
    }
}
