//! Scenario engagement counters: ratings, unique views, launches.
//!
//! Uniqueness rides on primary keys instead of read-then-write checks. Each
//! writer inserts first and downgrades on a unique violation, so two racing
//! writers for the same (scenario, user) pair converge to one row.

use super::{is_unique_violation, GameStore, StoreError};
use crate::ids::{ScenarioId, UserId};
use chrono::Utc;
use sqlx::Row;

/// What a rating write did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateOutcome {
    /// First rating from this user.
    Created,
    /// The user's earlier rating was replaced.
    Updated,
}

/// What a view write did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewOutcome {
    Recorded,
    AlreadySeen,
}

/// Aggregated counters for one scenario.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioStats {
    pub scenario_id: ScenarioId,
    pub rating_sum: i64,
    pub rating_count: i64,
    pub view_count: i64,
    pub launch_count: i64,
}

impl ScenarioStats {
    fn empty(scenario_id: ScenarioId) -> Self {
        Self {
            scenario_id,
            rating_sum: 0,
            rating_count: 0,
            view_count: 0,
            launch_count: 0,
        }
    }

    pub fn average_rating(&self) -> Option<f64> {
        if self.rating_count == 0 {
            None
        } else {
            Some(self.rating_sum as f64 / self.rating_count as f64)
        }
    }
}

impl GameStore {
    /// Record or replace a user's rating. Re-rating adjusts the sum by the
    /// delta and leaves the count alone.
    pub async fn rate_scenario(
        &self,
        scenario_id: ScenarioId,
        user_id: UserId,
        value: i32,
    ) -> Result<RateOutcome, StoreError> {
        if !(1..=5).contains(&value) {
            return Err(StoreError::RatingOutOfRange(value));
        }
        let mut tx = self.pool().begin().await?;
        ensure_stats_row(&mut *tx, scenario_id).await?;
        let inserted = sqlx::query(
            "INSERT INTO scenario_ratings (scenario_id, user_id, value, created_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(scenario_id.to_string())
        .bind(user_id.to_string())
        .bind(value)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await;

        // A failed INSERT leaves the transaction usable in SQLite, so the
        // unique-violation loser can fall through to the update path.
        let outcome = match inserted {
            Ok(_) => {
                sqlx::query(
                    "UPDATE scenario_stats
                     SET rating_sum = rating_sum + ?, rating_count = rating_count + 1
                     WHERE scenario_id = ?",
                )
                .bind(i64::from(value))
                .bind(scenario_id.to_string())
                .execute(&mut *tx)
                .await?;
                RateOutcome::Created
            }
            Err(e) if is_unique_violation(&e) => {
                let row = sqlx::query(
                    "SELECT value FROM scenario_ratings WHERE scenario_id = ? AND user_id = ?",
                )
                .bind(scenario_id.to_string())
                .bind(user_id.to_string())
                .fetch_one(&mut *tx)
                .await?;
                let old: i64 = row.try_get("value")?;
                sqlx::query(
                    "UPDATE scenario_ratings SET value = ? WHERE scenario_id = ? AND user_id = ?",
                )
                .bind(value)
                .bind(scenario_id.to_string())
                .bind(user_id.to_string())
                .execute(&mut *tx)
                .await?;
                sqlx::query(
                    "UPDATE scenario_stats SET rating_sum = rating_sum + ? WHERE scenario_id = ?",
                )
                .bind(i64::from(value) - old)
                .bind(scenario_id.to_string())
                .execute(&mut *tx)
                .await?;
                RateOutcome::Updated
            }
            Err(e) => return Err(e.into()),
        };
        tx.commit().await?;
        Ok(outcome)
    }

    /// Count a view once per user. Repeat views change nothing.
    pub async fn record_view(
        &self,
        scenario_id: ScenarioId,
        user_id: UserId,
    ) -> Result<ViewOutcome, StoreError> {
        let mut tx = self.pool().begin().await?;
        ensure_stats_row(&mut *tx, scenario_id).await?;
        let inserted = sqlx::query(
            "INSERT INTO scenario_views (scenario_id, user_id, created_at) VALUES (?, ?, ?)",
        )
        .bind(scenario_id.to_string())
        .bind(user_id.to_string())
        .bind(Utc::now())
        .execute(&mut *tx)
        .await;

        let outcome = match inserted {
            Ok(_) => {
                sqlx::query(
                    "UPDATE scenario_stats SET view_count = view_count + 1 WHERE scenario_id = ?",
                )
                .bind(scenario_id.to_string())
                .execute(&mut *tx)
                .await?;
                ViewOutcome::Recorded
            }
            Err(e) if is_unique_violation(&e) => ViewOutcome::AlreadySeen,
            Err(e) => return Err(e.into()),
        };
        tx.commit().await?;
        Ok(outcome)
    }

    /// Count a game launch. Every launch counts; returns the new total.
    pub async fn record_launch(&self, scenario_id: ScenarioId) -> Result<i64, StoreError> {
        let mut tx = self.pool().begin().await?;
        ensure_stats_row(&mut *tx, scenario_id).await?;
        sqlx::query(
            "UPDATE scenario_stats SET launch_count = launch_count + 1 WHERE scenario_id = ?",
        )
        .bind(scenario_id.to_string())
        .execute(&mut *tx)
        .await?;
        let row = sqlx::query("SELECT launch_count FROM scenario_stats WHERE scenario_id = ?")
            .bind(scenario_id.to_string())
            .fetch_one(&mut *tx)
            .await?;
        let count: i64 = row.try_get("launch_count")?;
        tx.commit().await?;
        Ok(count)
    }

    pub async fn scenario_stats(
        &self,
        scenario_id: ScenarioId,
    ) -> Result<ScenarioStats, StoreError> {
        let row = sqlx::query("SELECT * FROM scenario_stats WHERE scenario_id = ?")
            .bind(scenario_id.to_string())
            .fetch_optional(self.pool())
            .await?;
        let Some(row) = row else {
            return Ok(ScenarioStats::empty(scenario_id));
        };
        Ok(ScenarioStats {
            scenario_id,
            rating_sum: row.try_get("rating_sum")?,
            rating_count: row.try_get("rating_count")?,
            view_count: row.try_get("view_count")?,
            launch_count: row.try_get("launch_count")?,
        })
    }
}

async fn ensure_stats_row<'e, E>(executor: E, scenario_id: ScenarioId) -> Result<(), StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query("INSERT OR IGNORE INTO scenario_stats (scenario_id) VALUES (?)")
        .bind(scenario_id.to_string())
        .execute(executor)
        .await?;
    Ok(())
}
