//! Transcript persistence. Messages carry a store-assigned `seq` so turn
//! order survives identical timestamps.

use super::{parse_id, touch_game, GameStore, StoreError};
use crate::game::{Message, MessageRole};
use crate::ids::{GameId, MessageId};
use chrono::Utc;
use sqlx::Row;

impl GameStore {
    /// Append a message to the transcript and bump game activity.
    pub async fn create_message(
        &self,
        game_id: GameId,
        role: MessageRole,
        content: impl Into<String>,
    ) -> Result<Message, StoreError> {
        let mut message = Message::new(game_id, role, content);
        let mut tx = self.pool().begin().await?;
        let result = sqlx::query(
            "INSERT INTO messages (id, game_id, role, content, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(message.id.to_string())
        .bind(game_id.to_string())
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(message.created_at)
        .bind(message.updated_at)
        .execute(&mut *tx)
        .await?;
        message.seq = result.last_insert_rowid();
        touch_game(&mut *tx, game_id, message.updated_at).await?;
        tx.commit().await?;
        Ok(message)
    }

    pub async fn get_message(
        &self,
        game_id: GameId,
        message_id: MessageId,
    ) -> Result<Message, StoreError> {
        let row = sqlx::query("SELECT * FROM messages WHERE game_id = ? AND id = ?")
            .bind(game_id.to_string())
            .bind(message_id.to_string())
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| StoreError::not_found("message", message_id))?;
        message_from_row(&row)
    }

    /// Overwrite a message's content. Used for streamed partial saves, so it
    /// runs in one transaction with the activity touch.
    pub async fn update_message_content(
        &self,
        game_id: GameId,
        message_id: MessageId,
        content: &str,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut tx = self.pool().begin().await?;
        let result = sqlx::query(
            "UPDATE messages SET content = ?, updated_at = ? WHERE game_id = ? AND id = ?",
        )
        .bind(content)
        .bind(now)
        .bind(game_id.to_string())
        .bind(message_id.to_string())
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("message", message_id));
        }
        touch_game(&mut *tx, game_id, now).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Full transcript in turn order.
    pub async fn list_messages(&self, game_id: GameId) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query("SELECT * FROM messages WHERE game_id = ? ORDER BY seq ASC")
            .bind(game_id.to_string())
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(message_from_row).collect()
    }

    /// The newest `limit` messages, oldest first.
    pub async fn recent_messages(
        &self,
        game_id: GameId,
        limit: u32,
    ) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE game_id = ? ORDER BY seq DESC LIMIT ?",
        )
        .bind(game_id.to_string())
        .bind(i64::from(limit))
        .fetch_all(self.pool())
        .await?;
        let mut messages = rows
            .iter()
            .map(message_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        messages.reverse();
        Ok(messages)
    }

    pub async fn last_message(
        &self,
        game_id: GameId,
        role: MessageRole,
    ) -> Result<Option<Message>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM messages WHERE game_id = ? AND role = ? ORDER BY seq DESC LIMIT 1",
        )
        .bind(game_id.to_string())
        .bind(role.as_str())
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    /// How many assistant replies the game already holds.
    pub async fn count_assistant_messages(&self, game_id: GameId) -> Result<u32, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM messages WHERE game_id = ? AND role = 'assistant'",
        )
        .bind(game_id.to_string())
        .fetch_one(self.pool())
        .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n as u32)
    }
}

pub(crate) async fn get_message_row<'e, E>(
    executor: E,
    game_id: GameId,
    message_id: MessageId,
) -> Result<Option<Message>, StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let row = sqlx::query("SELECT * FROM messages WHERE game_id = ? AND id = ?")
        .bind(game_id.to_string())
        .bind(message_id.to_string())
        .fetch_optional(executor)
        .await?;
    row.as_ref().map(message_from_row).transpose()
}

pub(crate) async fn delete_message_row<'e, E>(
    executor: E,
    game_id: GameId,
    message_id: MessageId,
) -> Result<bool, StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let result = sqlx::query("DELETE FROM messages WHERE game_id = ? AND id = ?")
        .bind(game_id.to_string())
        .bind(message_id.to_string())
        .execute(executor)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub(crate) fn message_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Message, StoreError> {
    let id: String = row.try_get("id")?;
    let game_id: String = row.try_get("game_id")?;
    let role: String = row.try_get("role")?;
    Ok(Message {
        seq: row.try_get("seq")?,
        id: parse_id(&id, "message")?,
        game_id: parse_id(&game_id, "game")?,
        role: MessageRole::parse(&role)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown message role: {role}")))?,
        content: row.try_get("content")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
