//! Plot cards: running-summary facts that are always offered to the prompt.

use super::world::CardSource;
use crate::ids::{GameId, PlotCardId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A free-form running-summary fact. Not trigger-gated; included verbatim up
/// to a configurable cap. By convention at most one AI-authored plot card per
/// game acts as the evolving memory digest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlotCard {
    /// Unique identifier.
    pub id: PlotCardId,
    /// The game this card belongs to.
    pub game_id: GameId,
    pub title: String,
    pub content: String,
    /// True when the card is not user-editable.
    pub locked: bool,
    /// Whether the digest update may rewrite this card.
    pub ai_editable: bool,
    pub source: CardSource,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PlotCard {
    /// Create a new plot card. Field normalization runs when the card is
    /// written to the store.
    pub fn new(game_id: GameId, title: impl Into<String>, content: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: PlotCardId::new(),
            game_id,
            title: title.into(),
            content: content.into(),
            locked: false,
            ai_editable: true,
            source: CardSource::User,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_source(mut self, source: CardSource) -> Self {
        self.source = source;
        self
    }

    pub fn with_locked(mut self, locked: bool) -> Self {
        self.locked = locked;
        self
    }

    pub fn with_ai_editable(mut self, ai_editable: bool) -> Self {
        self.ai_editable = ai_editable;
        self
    }

    /// Whether this card is the AI-maintained memory digest.
    pub fn is_digest(&self) -> bool {
        self.source == CardSource::Ai
    }

    /// Bump the modification timestamp.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
