//! SQLite-backed persistence for games, cards, messages, and change events.
//!
//! `GameStore` wraps a connection pool and exposes one method per store
//! operation. Mutating methods run inside a transaction together with the
//! change-event append and the game activity touch, so a crash never leaves
//! a half-applied write. Low-level row helpers are generic over the executor
//! and shared with the undo engine, which stitches them into its own
//! transactions.

pub(crate) mod cards;
pub(crate) mod changelog;
mod counters;
pub(crate) mod messages;

pub use counters::{RateOutcome, ScenarioStats, ViewOutcome};

use crate::cards::CardError;
use crate::changelog::SnapshotError;
use crate::game::Game;
use crate::ids::GameId;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use std::path::Path;
use thiserror::Error;

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("stored row is corrupt: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Card(#[from] CardError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error("game already has a main hero card")]
    DuplicateMainHero,

    #[error("the main hero card cannot be deleted")]
    MainHeroUndeletable,

    #[error("game name is empty")]
    EmptyGameName,

    #[error("rating value {0} is out of range (1-5)")]
    RatingOutOfRange(i32),
}

impl StoreError {
    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        StoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS games (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        instructions TEXT NOT NULL DEFAULT '[]',
        created_at TEXT NOT NULL,
        last_activity_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS messages (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        game_id TEXT NOT NULL REFERENCES games(id),
        role TEXT NOT NULL,
        content TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS messages_game_idx ON messages(game_id)",
    "CREATE TABLE IF NOT EXISTS world_cards (
        id TEXT PRIMARY KEY,
        game_id TEXT NOT NULL REFERENCES games(id),
        title TEXT NOT NULL,
        content TEXT NOT NULL,
        triggers TEXT NOT NULL DEFAULT '[]',
        kind TEXT NOT NULL,
        character_id TEXT,
        memory_window INTEGER NOT NULL,
        locked INTEGER NOT NULL DEFAULT 0,
        ai_editable INTEGER NOT NULL DEFAULT 1,
        source TEXT NOT NULL,
        avatar TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS world_cards_game_idx ON world_cards(game_id)",
    "CREATE UNIQUE INDEX IF NOT EXISTS world_cards_one_hero_idx
        ON world_cards(game_id) WHERE kind = 'main_hero'",
    "CREATE TABLE IF NOT EXISTS plot_cards (
        id TEXT PRIMARY KEY,
        game_id TEXT NOT NULL REFERENCES games(id),
        title TEXT NOT NULL,
        content TEXT NOT NULL,
        locked INTEGER NOT NULL DEFAULT 0,
        ai_editable INTEGER NOT NULL DEFAULT 1,
        source TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS plot_cards_game_idx ON plot_cards(game_id)",
    "CREATE TABLE IF NOT EXISTS world_card_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        game_id TEXT NOT NULL REFERENCES games(id),
        message_id TEXT,
        card_id TEXT,
        action TEXT NOT NULL,
        label TEXT NOT NULL,
        excerpt TEXT NOT NULL,
        before_snapshot TEXT,
        after_snapshot TEXT,
        created_at TEXT NOT NULL,
        undone_at TEXT
    )",
    "CREATE INDEX IF NOT EXISTS world_card_events_game_idx ON world_card_events(game_id)",
    "CREATE INDEX IF NOT EXISTS world_card_events_message_idx ON world_card_events(message_id)",
    "CREATE TABLE IF NOT EXISTS plot_card_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        game_id TEXT NOT NULL REFERENCES games(id),
        message_id TEXT,
        card_id TEXT,
        action TEXT NOT NULL,
        label TEXT NOT NULL,
        excerpt TEXT NOT NULL,
        before_snapshot TEXT,
        after_snapshot TEXT,
        created_at TEXT NOT NULL,
        undone_at TEXT
    )",
    "CREATE INDEX IF NOT EXISTS plot_card_events_game_idx ON plot_card_events(game_id)",
    "CREATE INDEX IF NOT EXISTS plot_card_events_message_idx ON plot_card_events(message_id)",
    "CREATE TABLE IF NOT EXISTS scenario_stats (
        scenario_id TEXT PRIMARY KEY,
        rating_sum INTEGER NOT NULL DEFAULT 0,
        rating_count INTEGER NOT NULL DEFAULT 0,
        view_count INTEGER NOT NULL DEFAULT 0,
        launch_count INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS scenario_ratings (
        scenario_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        value INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        PRIMARY KEY (scenario_id, user_id)
    )",
    "CREATE TABLE IF NOT EXISTS scenario_views (
        scenario_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        created_at TEXT NOT NULL,
        PRIMARY KEY (scenario_id, user_id)
    )",
];

/// Handle to the game database. Cheap to clone.
#[derive(Clone)]
pub struct GameStore {
    pool: SqlitePool,
}

impl GameStore {
    /// Open (or create) a database file and run migrations.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let url = format!("sqlite://{}?mode=rwc", path.as_ref().display());
        Self::connect(&url, 5).await
    }

    /// Open an in-memory database. Useful for tests; the single pooled
    /// connection keeps the database alive.
    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::connect("sqlite::memory:", 1).await
    }

    async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .idle_timeout(None)
            .max_lifetime(None)
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    sqlx::query("PRAGMA foreign_keys = ON").execute(&mut *conn).await?;
                    sqlx::query("PRAGMA busy_timeout = 5000").execute(&mut *conn).await?;
                    Ok(())
                })
            })
            .connect(url)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        for statement in MIGRATIONS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        tracing::debug!("database schema is up to date");
        Ok(())
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Persist a new game.
    pub async fn create_game(&self, mut game: Game) -> Result<Game, StoreError> {
        game.name = crate::cards::normalize::collapse_whitespace(&game.name);
        if game.name.is_empty() {
            return Err(StoreError::EmptyGameName);
        }
        let instructions = encode_json(&game.instructions)?;
        sqlx::query(
            "INSERT INTO games (id, name, instructions, created_at, last_activity_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(game.id.to_string())
        .bind(&game.name)
        .bind(instructions)
        .bind(game.created_at)
        .bind(game.last_activity_at)
        .execute(&self.pool)
        .await?;
        tracing::debug!(game_id = %game.id, "created game");
        Ok(game)
    }

    pub async fn get_game(&self, game_id: GameId) -> Result<Game, StoreError> {
        let row = sqlx::query("SELECT * FROM games WHERE id = ?")
            .bind(game_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("game", game_id))?;
        game_from_row(&row)
    }

    /// All games, most recently active first.
    pub async fn list_games(&self) -> Result<Vec<Game>, StoreError> {
        let rows = sqlx::query("SELECT * FROM games ORDER BY last_activity_at DESC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(game_from_row).collect()
    }

    /// Bump the game's activity timestamp.
    pub async fn touch_game(&self, game_id: GameId) -> Result<(), StoreError> {
        touch_game(&self.pool, game_id, Utc::now()).await
    }

    /// Replace the game's standing instructions.
    pub async fn update_game_instructions(
        &self,
        game_id: GameId,
        instructions: Vec<String>,
    ) -> Result<Game, StoreError> {
        let encoded = encode_json(&instructions)?;
        let result = sqlx::query(
            "UPDATE games SET instructions = ?, last_activity_at = ? WHERE id = ?",
        )
        .bind(encoded)
        .bind(Utc::now())
        .bind(game_id.to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("game", game_id));
        }
        self.get_game(game_id).await
    }
}

fn game_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Game, StoreError> {
    let id: String = row.try_get("id")?;
    let instructions: String = row.try_get("instructions")?;
    Ok(Game {
        id: parse_id(&id, "game")?,
        name: row.try_get("name")?,
        instructions: decode_json(&instructions)?,
        created_at: row.try_get("created_at")?,
        last_activity_at: row.try_get("last_activity_at")?,
    })
}

pub(crate) async fn touch_game<'e, E>(
    executor: E,
    game_id: GameId,
    at: DateTime<Utc>,
) -> Result<(), StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let result = sqlx::query("UPDATE games SET last_activity_at = ? WHERE id = ?")
        .bind(at)
        .bind(game_id.to_string())
        .execute(executor)
        .await?;
    if result.rows_affected() == 0 {
        return Err(StoreError::not_found("game", game_id));
    }
    Ok(())
}

pub(crate) fn parse_id<T>(raw: &str, entity: &'static str) -> Result<T, StoreError>
where
    T: std::str::FromStr,
{
    raw.parse::<T>()
        .map_err(|_| StoreError::Corrupt(format!("invalid {entity} id: {raw}")))
}

pub(crate) fn encode_json<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Corrupt(format!("encode failed: {e}")))
}

pub(crate) fn decode_json<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Corrupt(format!("decode failed: {e}")))
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}
