//! World and plot card persistence. Every mutation normalizes the card,
//! appends a change event, and touches the game inside one transaction.

use super::changelog::{
    detach_plot_event_card_refs, detach_world_event_card_refs, record_plot_event,
    record_world_event,
};
use super::{is_unique_violation, parse_id, touch_game, GameStore, StoreError};
use crate::cards::{
    normalize_plot_card, normalize_world_card, CardKind, CardSource, MemoryWindow, PlotCard,
    WorldCard,
};
use crate::changelog::{
    ChangeAction, PlotCardSnapshot, PlotChangeEvent, WorldCardSnapshot, WorldChangeEvent,
};
use crate::ids::{CardId, CharacterId, GameId, MessageId, PlotCardId};
use chrono::Utc;
use sqlx::Row;

impl GameStore {
    /// Normalize and insert a world card, appending an `added` event.
    /// `message_id` ties AI-made cards to the turn that produced them.
    pub async fn create_world_card(
        &self,
        mut card: WorldCard,
        message_id: Option<MessageId>,
    ) -> Result<(WorldCard, WorldChangeEvent), StoreError> {
        normalize_world_card(&mut card, None)?;
        let mut tx = self.pool().begin().await?;
        if card.is_main_hero() && get_main_hero_row(&mut *tx, card.game_id).await?.is_some() {
            return Err(StoreError::DuplicateMainHero);
        }
        insert_world_card(&mut *tx, &card).await?;
        let after = WorldCardSnapshot::capture(&card);
        let event = record_world_event(
            &mut *tx,
            card.game_id,
            message_id,
            Some(card.id),
            ChangeAction::Added,
            None,
            Some(&after),
        )
        .await?;
        touch_game(&mut *tx, card.game_id, card.updated_at).await?;
        tx.commit().await?;
        tracing::debug!(card_id = %card.id, title = %card.title, "created world card");
        Ok((card, event))
    }

    /// Load, mutate, renormalize, and save a world card, appending an
    /// `updated` event. Identity, kind, and source are fixed at creation;
    /// edits to them through `mutate` are discarded.
    pub async fn update_world_card<F>(
        &self,
        game_id: GameId,
        card_id: CardId,
        message_id: Option<MessageId>,
        mutate: F,
    ) -> Result<(WorldCard, WorldChangeEvent), StoreError>
    where
        F: FnOnce(&mut WorldCard),
    {
        let mut tx = self.pool().begin().await?;
        let mut card = get_world_card_row(&mut *tx, game_id, card_id)
            .await?
            .ok_or_else(|| StoreError::not_found("world card", card_id))?;
        let before = WorldCardSnapshot::capture(&card);
        let previous_content = card.content.clone();
        let (kind, source, character_id, created_at) =
            (card.kind, card.source, card.character_id, card.created_at);
        mutate(&mut card);
        card.id = card_id;
        card.game_id = game_id;
        card.kind = kind;
        card.source = source;
        card.character_id = character_id;
        card.created_at = created_at;
        normalize_world_card(&mut card, Some(&previous_content))?;
        card.touch();
        update_world_card_row(&mut *tx, &card).await?;
        let after = WorldCardSnapshot::capture(&card);
        let event = record_world_event(
            &mut *tx,
            game_id,
            message_id,
            Some(card.id),
            ChangeAction::Updated,
            Some(&before),
            Some(&after),
        )
        .await?;
        touch_game(&mut *tx, game_id, card.updated_at).await?;
        tx.commit().await?;
        Ok((card, event))
    }

    /// Delete a world card, appending a `deleted` event that carries the
    /// final snapshot. References from older events are nulled out first so
    /// the log never points at a missing row. The main hero cannot be
    /// deleted.
    pub async fn delete_world_card(
        &self,
        game_id: GameId,
        card_id: CardId,
        message_id: Option<MessageId>,
    ) -> Result<WorldChangeEvent, StoreError> {
        let mut tx = self.pool().begin().await?;
        let card = get_world_card_row(&mut *tx, game_id, card_id)
            .await?
            .ok_or_else(|| StoreError::not_found("world card", card_id))?;
        if card.is_main_hero() {
            return Err(StoreError::MainHeroUndeletable);
        }
        let before = WorldCardSnapshot::capture(&card);
        detach_world_event_card_refs(&mut *tx, card_id).await?;
        delete_world_card_row(&mut *tx, card_id).await?;
        let event = record_world_event(
            &mut *tx,
            game_id,
            message_id,
            None,
            ChangeAction::Deleted,
            Some(&before),
            None,
        )
        .await?;
        touch_game(&mut *tx, game_id, Utc::now()).await?;
        tx.commit().await?;
        tracing::debug!(card_id = %card_id, title = %card.title, "deleted world card");
        Ok(event)
    }

    pub async fn get_world_card(
        &self,
        game_id: GameId,
        card_id: CardId,
    ) -> Result<WorldCard, StoreError> {
        get_world_card_row(self.pool(), game_id, card_id)
            .await?
            .ok_or_else(|| StoreError::not_found("world card", card_id))
    }

    /// All world cards for a game in stable id order.
    pub async fn list_world_cards(&self, game_id: GameId) -> Result<Vec<WorldCard>, StoreError> {
        let rows = sqlx::query("SELECT * FROM world_cards WHERE game_id = ? ORDER BY id ASC")
            .bind(game_id.to_string())
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(world_card_from_row).collect()
    }

    pub async fn find_main_hero(&self, game_id: GameId) -> Result<Option<WorldCard>, StoreError> {
        get_main_hero_row(self.pool(), game_id).await
    }

    /// Card previously created for a roster character, if any.
    pub async fn find_card_for_character(
        &self,
        game_id: GameId,
        character_id: CharacterId,
    ) -> Result<Option<WorldCard>, StoreError> {
        let row = sqlx::query("SELECT * FROM world_cards WHERE game_id = ? AND character_id = ?")
            .bind(game_id.to_string())
            .bind(character_id.to_string())
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(world_card_from_row).transpose()
    }

    pub async fn create_plot_card(
        &self,
        mut card: PlotCard,
        message_id: Option<MessageId>,
    ) -> Result<(PlotCard, PlotChangeEvent), StoreError> {
        normalize_plot_card(&mut card)?;
        let mut tx = self.pool().begin().await?;
        insert_plot_card(&mut *tx, &card).await?;
        let after = PlotCardSnapshot::capture(&card);
        let event = record_plot_event(
            &mut *tx,
            card.game_id,
            message_id,
            Some(card.id),
            ChangeAction::Added,
            None,
            Some(&after),
        )
        .await?;
        touch_game(&mut *tx, card.game_id, card.updated_at).await?;
        tx.commit().await?;
        tracing::debug!(card_id = %card.id, title = %card.title, "created plot card");
        Ok((card, event))
    }

    pub async fn update_plot_card<F>(
        &self,
        game_id: GameId,
        card_id: PlotCardId,
        message_id: Option<MessageId>,
        mutate: F,
    ) -> Result<(PlotCard, PlotChangeEvent), StoreError>
    where
        F: FnOnce(&mut PlotCard),
    {
        let mut tx = self.pool().begin().await?;
        let mut card = get_plot_card_row(&mut *tx, game_id, card_id)
            .await?
            .ok_or_else(|| StoreError::not_found("plot card", card_id))?;
        let before = PlotCardSnapshot::capture(&card);
        let (source, created_at) = (card.source, card.created_at);
        mutate(&mut card);
        card.id = card_id;
        card.game_id = game_id;
        card.source = source;
        card.created_at = created_at;
        normalize_plot_card(&mut card)?;
        card.touch();
        update_plot_card_row(&mut *tx, &card).await?;
        let after = PlotCardSnapshot::capture(&card);
        let event = record_plot_event(
            &mut *tx,
            game_id,
            message_id,
            Some(card.id),
            ChangeAction::Updated,
            Some(&before),
            Some(&after),
        )
        .await?;
        touch_game(&mut *tx, game_id, card.updated_at).await?;
        tx.commit().await?;
        Ok((card, event))
    }

    pub async fn delete_plot_card(
        &self,
        game_id: GameId,
        card_id: PlotCardId,
        message_id: Option<MessageId>,
    ) -> Result<PlotChangeEvent, StoreError> {
        let mut tx = self.pool().begin().await?;
        let card = get_plot_card_row(&mut *tx, game_id, card_id)
            .await?
            .ok_or_else(|| StoreError::not_found("plot card", card_id))?;
        let before = PlotCardSnapshot::capture(&card);
        detach_plot_event_card_refs(&mut *tx, card_id).await?;
        delete_plot_card_row(&mut *tx, card_id).await?;
        let event = record_plot_event(
            &mut *tx,
            game_id,
            message_id,
            None,
            ChangeAction::Deleted,
            Some(&before),
            None,
        )
        .await?;
        touch_game(&mut *tx, game_id, Utc::now()).await?;
        tx.commit().await?;
        Ok(event)
    }

    pub async fn get_plot_card(
        &self,
        game_id: GameId,
        card_id: PlotCardId,
    ) -> Result<PlotCard, StoreError> {
        get_plot_card_row(self.pool(), game_id, card_id)
            .await?
            .ok_or_else(|| StoreError::not_found("plot card", card_id))
    }

    pub async fn list_plot_cards(&self, game_id: GameId) -> Result<Vec<PlotCard>, StoreError> {
        let rows = sqlx::query("SELECT * FROM plot_cards WHERE game_id = ? ORDER BY id ASC")
            .bind(game_id.to_string())
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(plot_card_from_row).collect()
    }

    /// The AI-maintained plot digest card, if one exists yet.
    pub async fn find_digest_card(&self, game_id: GameId) -> Result<Option<PlotCard>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM plot_cards WHERE game_id = ? AND source = 'ai' ORDER BY id ASC LIMIT 1",
        )
        .bind(game_id.to_string())
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(plot_card_from_row).transpose()
    }
}

pub(crate) async fn insert_world_card<'e, E>(executor: E, card: &WorldCard) -> Result<(), StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let triggers = super::encode_json(&card.triggers)?;
    let result = sqlx::query(
        "INSERT INTO world_cards
         (id, game_id, title, content, triggers, kind, character_id, memory_window,
          locked, ai_editable, source, avatar, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(card.id.to_string())
    .bind(card.game_id.to_string())
    .bind(&card.title)
    .bind(&card.content)
    .bind(triggers)
    .bind(card.kind.as_str())
    .bind(card.character_id.map(|id| id.to_string()))
    .bind(card.memory_window.as_raw())
    .bind(card.locked)
    .bind(card.ai_editable)
    .bind(card.source.as_str())
    .bind(card.avatar.as_deref())
    .bind(card.created_at)
    .bind(card.updated_at)
    .execute(executor)
    .await;
    match result {
        Ok(_) => Ok(()),
        Err(e) if is_unique_violation(&e) && card.is_main_hero() => {
            Err(StoreError::DuplicateMainHero)
        }
        Err(e) => Err(e.into()),
    }
}

pub(crate) async fn update_world_card_row<'e, E>(
    executor: E,
    card: &WorldCard,
) -> Result<(), StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let triggers = super::encode_json(&card.triggers)?;
    let result = sqlx::query(
        "UPDATE world_cards SET
         title = ?, content = ?, triggers = ?, kind = ?, character_id = ?,
         memory_window = ?, locked = ?, ai_editable = ?, source = ?, avatar = ?,
         updated_at = ?
         WHERE id = ?",
    )
    .bind(&card.title)
    .bind(&card.content)
    .bind(triggers)
    .bind(card.kind.as_str())
    .bind(card.character_id.map(|id| id.to_string()))
    .bind(card.memory_window.as_raw())
    .bind(card.locked)
    .bind(card.ai_editable)
    .bind(card.source.as_str())
    .bind(card.avatar.as_deref())
    .bind(card.updated_at)
    .bind(card.id.to_string())
    .execute(executor)
    .await?;
    if result.rows_affected() == 0 {
        return Err(StoreError::not_found("world card", card.id));
    }
    Ok(())
}

pub(crate) async fn delete_world_card_row<'e, E>(
    executor: E,
    card_id: CardId,
) -> Result<bool, StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let result = sqlx::query("DELETE FROM world_cards WHERE id = ?")
        .bind(card_id.to_string())
        .execute(executor)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub(crate) async fn get_world_card_row<'e, E>(
    executor: E,
    game_id: GameId,
    card_id: CardId,
) -> Result<Option<WorldCard>, StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let row = sqlx::query("SELECT * FROM world_cards WHERE game_id = ? AND id = ?")
        .bind(game_id.to_string())
        .bind(card_id.to_string())
        .fetch_optional(executor)
        .await?;
    row.as_ref().map(world_card_from_row).transpose()
}

pub(crate) async fn get_main_hero_row<'e, E>(
    executor: E,
    game_id: GameId,
) -> Result<Option<WorldCard>, StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let row = sqlx::query("SELECT * FROM world_cards WHERE game_id = ? AND kind = 'main_hero'")
        .bind(game_id.to_string())
        .fetch_optional(executor)
        .await?;
    row.as_ref().map(world_card_from_row).transpose()
}

pub(crate) async fn insert_plot_card<'e, E>(executor: E, card: &PlotCard) -> Result<(), StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(
        "INSERT INTO plot_cards
         (id, game_id, title, content, locked, ai_editable, source, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(card.id.to_string())
    .bind(card.game_id.to_string())
    .bind(&card.title)
    .bind(&card.content)
    .bind(card.locked)
    .bind(card.ai_editable)
    .bind(card.source.as_str())
    .bind(card.created_at)
    .bind(card.updated_at)
    .execute(executor)
    .await?;
    Ok(())
}

pub(crate) async fn update_plot_card_row<'e, E>(
    executor: E,
    card: &PlotCard,
) -> Result<(), StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let result = sqlx::query(
        "UPDATE plot_cards SET
         title = ?, content = ?, locked = ?, ai_editable = ?, source = ?, updated_at = ?
         WHERE id = ?",
    )
    .bind(&card.title)
    .bind(&card.content)
    .bind(card.locked)
    .bind(card.ai_editable)
    .bind(card.source.as_str())
    .bind(card.updated_at)
    .bind(card.id.to_string())
    .execute(executor)
    .await?;
    if result.rows_affected() == 0 {
        return Err(StoreError::not_found("plot card", card.id));
    }
    Ok(())
}

pub(crate) async fn delete_plot_card_row<'e, E>(
    executor: E,
    card_id: PlotCardId,
) -> Result<bool, StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let result = sqlx::query("DELETE FROM plot_cards WHERE id = ?")
        .bind(card_id.to_string())
        .execute(executor)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub(crate) async fn get_plot_card_row<'e, E>(
    executor: E,
    game_id: GameId,
    card_id: PlotCardId,
) -> Result<Option<PlotCard>, StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let row = sqlx::query("SELECT * FROM plot_cards WHERE game_id = ? AND id = ?")
        .bind(game_id.to_string())
        .bind(card_id.to_string())
        .fetch_optional(executor)
        .await?;
    row.as_ref().map(plot_card_from_row).transpose()
}

fn world_card_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<WorldCard, StoreError> {
    let id: String = row.try_get("id")?;
    let game_id: String = row.try_get("game_id")?;
    let triggers: String = row.try_get("triggers")?;
    let kind: String = row.try_get("kind")?;
    let character_id: Option<String> = row.try_get("character_id")?;
    let source: String = row.try_get("source")?;
    let raw_window: i32 = row.try_get("memory_window")?;
    Ok(WorldCard {
        id: parse_id(&id, "world card")?,
        game_id: parse_id(&game_id, "game")?,
        title: row.try_get("title")?,
        content: row.try_get("content")?,
        triggers: super::decode_json(&triggers)?,
        kind: CardKind::parse(&kind)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown card kind: {kind}")))?,
        character_id: character_id
            .as_deref()
            .map(|raw| parse_id(raw, "character"))
            .transpose()?,
        memory_window: MemoryWindow::from(raw_window),
        locked: row.try_get("locked")?,
        ai_editable: row.try_get("ai_editable")?,
        source: CardSource::parse(&source)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown card source: {source}")))?,
        avatar: row.try_get("avatar")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn plot_card_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<PlotCard, StoreError> {
    let id: String = row.try_get("id")?;
    let game_id: String = row.try_get("game_id")?;
    let source: String = row.try_get("source")?;
    Ok(PlotCard {
        id: parse_id(&id, "plot card")?,
        game_id: parse_id(&game_id, "game")?,
        title: row.try_get("title")?,
        content: row.try_get("content")?,
        locked: row.try_get("locked")?,
        ai_editable: row.try_get("ai_editable")?,
        source: CardSource::parse(&source)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown card source: {source}")))?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
