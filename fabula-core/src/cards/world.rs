//! World cards: structured facts about the world, its NPCs, and the main hero.

use crate::ids::{CardId, CharacterId, GameId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How many assistant turns a card stays active after its trigger last matched.
///
/// Encoded as an integer on the wire and in storage: `-1` means "always
/// active" (reserved for the main hero), any other value is a turn count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum MemoryWindow {
    /// Active on every turn regardless of triggers.
    Always,
    /// Active while a trigger matched within the last N assistant turns.
    Turns(u32),
}

impl MemoryWindow {
    /// Turn counts a non-hero card may use.
    pub const ALLOWED_TURNS: [u32; 3] = [5, 10, 15];

    /// The integer encoding (`-1` for always-active).
    pub fn as_raw(&self) -> i32 {
        match self {
            MemoryWindow::Always => -1,
            MemoryWindow::Turns(n) => *n as i32,
        }
    }

    pub fn is_always(&self) -> bool {
        matches!(self, MemoryWindow::Always)
    }
}

impl From<i32> for MemoryWindow {
    fn from(raw: i32) -> Self {
        if raw < 0 {
            MemoryWindow::Always
        } else {
            MemoryWindow::Turns(raw as u32)
        }
    }
}

impl From<MemoryWindow> for i32 {
    fn from(window: MemoryWindow) -> Self {
        window.as_raw()
    }
}

/// What a world card describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardKind {
    /// A place, faction, object, or other world fact.
    World,
    /// A non-player character.
    Npc,
    /// The player's protagonist. At most one per game.
    MainHero,
}

impl CardKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CardKind::World => "world",
            CardKind::Npc => "npc",
            CardKind::MainHero => "main_hero",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "world" => Some(CardKind::World),
            "npc" => Some(CardKind::Npc),
            "main_hero" => Some(CardKind::MainHero),
            _ => None,
        }
    }

    /// The memory window used when a caller does not supply one.
    pub fn default_window(&self) -> MemoryWindow {
        match self {
            CardKind::World => MemoryWindow::Turns(5),
            CardKind::Npc => MemoryWindow::Turns(10),
            CardKind::MainHero => MemoryWindow::Always,
        }
    }
}

/// Who authored a card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardSource {
    User,
    Ai,
}

impl CardSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CardSource::User => "user",
            CardSource::Ai => "ai",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(CardSource::User),
            "ai" => Some(CardSource::Ai),
            _ => None,
        }
    }
}

/// A structured fact about the world, an NPC, or the main hero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldCard {
    /// Unique identifier.
    pub id: CardId,
    /// The game this card belongs to.
    pub game_id: GameId,
    /// Short display name; also acts as an implicit activation trigger.
    pub title: String,
    /// The fact itself, injected into the prompt when the card is active.
    pub content: String,
    /// Phrases whose occurrence in recent dialogue activates the card.
    pub triggers: Vec<String>,
    pub kind: CardKind,
    /// Character this card was promoted from, if any.
    pub character_id: Option<CharacterId>,
    pub memory_window: MemoryWindow,
    /// True when the card is not user-editable.
    pub locked: bool,
    /// Whether mutation extraction may rewrite this card.
    pub ai_editable: bool,
    pub source: CardSource,
    /// Avatar image reference, if any.
    pub avatar: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorldCard {
    /// Create a new card with kind-appropriate defaults. Field normalization
    /// runs when the card is written to the store.
    pub fn new(
        game_id: GameId,
        title: impl Into<String>,
        content: impl Into<String>,
        kind: CardKind,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: CardId::new(),
            game_id,
            title: title.into(),
            content: content.into(),
            triggers: Vec::new(),
            kind,
            character_id: None,
            memory_window: kind.default_window(),
            locked: false,
            ai_editable: true,
            source: CardSource::User,
            avatar: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_triggers(mut self, triggers: Vec<String>) -> Self {
        self.triggers = triggers;
        self
    }

    pub fn with_memory_window(mut self, window: MemoryWindow) -> Self {
        self.memory_window = window;
        self
    }

    pub fn with_character(mut self, character_id: CharacterId) -> Self {
        self.character_id = Some(character_id);
        self
    }

    pub fn with_avatar(mut self, avatar: impl Into<String>) -> Self {
        self.avatar = Some(avatar.into());
        self
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

    pub fn is_main_hero(&self) -> bool {
        self.kind == CardKind::MainHero
    }

    /// Bump the modification timestamp.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_window_raw_round_trip() {
        assert_eq!(MemoryWindow::from(-1), MemoryWindow::Always);
        assert_eq!(MemoryWindow::Always.as_raw(), -1);
        assert_eq!(MemoryWindow::from(10), MemoryWindow::Turns(10));
        assert_eq!(MemoryWindow::Turns(5).as_raw(), 5);
    }

    #[test]
    fn test_kind_defaults() {
        assert_eq!(CardKind::World.default_window(), MemoryWindow::Turns(5));
        assert_eq!(CardKind::Npc.default_window(), MemoryWindow::Turns(10));
        assert!(CardKind::MainHero.default_window().is_always());
    }

    #[test]
    fn test_kind_string_round_trip() {
        for kind in [CardKind::World, CardKind::Npc, CardKind::MainHero] {
            assert_eq!(CardKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(CardKind::parse("villain"), None);
    }

    #[test]
    fn test_card_creation() {
        let game_id = GameId::new();
        let card = WorldCard::new(game_id, "Mira", "A wandering bard.", CardKind::Npc)
            .with_triggers(vec!["bard".to_string()])
            .with_source(CardSource::Ai);

        assert_eq!(card.game_id, game_id);
        assert_eq!(card.kind, CardKind::Npc);
        assert_eq!(card.memory_window, MemoryWindow::Turns(10));
        assert_eq!(card.source, CardSource::Ai);
        assert!(card.ai_editable);
        assert!(!card.locked);
    }
}
