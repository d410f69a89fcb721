//! Games and their message transcripts.

use crate::ids::{GameId, MessageId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One playthrough: a transcript plus the card state that evolves with it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Game {
    pub id: GameId,
    pub name: String,
    /// Style directives handed verbatim to the generation provider.
    pub instructions: Vec<String>,
    pub created_at: DateTime<Utc>,
    /// Touched by every mutation to the game or anything inside it.
    pub last_activity_at: DateTime<Utc>,
}

impl Game {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: GameId::new(),
            name: name.into(),
            instructions: Vec::new(),
            created_at: now,
            last_activity_at: now,
        }
    }

    pub fn with_instructions(mut self, instructions: Vec<String>) -> Self {
        self.instructions = instructions;
        self
    }
}

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(MessageRole::User),
            "assistant" => Some(MessageRole::Assistant),
            _ => None,
        }
    }
}

/// A turn's user prompt or assistant reply. Assistant messages anchor the
/// change events produced by their generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    /// Storage-level monotonic sequence; ascending order is transcript order.
    #[serde(default)]
    pub seq: i64,
    pub game_id: GameId,
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    /// Create a message. The storage layer assigns `seq` on insert.
    pub fn new(game_id: GameId, role: MessageRole, content: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: MessageId::new(),
            seq: 0,
            game_id,
            role,
            content: content.into(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_assistant(&self) -> bool {
        self.role == MessageRole::Assistant
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_game_creation() {
        let game = Game::new("The Long Road").with_instructions(vec![
            "Write in second person.".to_string(),
            "Keep scenes under 300 words.".to_string(),
        ]);
        assert_eq!(game.name, "The Long Road");
        assert_eq!(game.instructions.len(), 2);
    }

    #[test]
    fn test_role_round_trip() {
        for role in [MessageRole::User, MessageRole::Assistant] {
            assert_eq!(MessageRole::parse(role.as_str()), Some(role));
        }
        assert_eq!(MessageRole::parse("system"), None);
    }
}
