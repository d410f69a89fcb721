//! Change events and their snapshot codec.
//!
//! Every card mutation appends one immutable event row carrying a
//! before-snapshot and an after-snapshot. Snapshots are explicit versioned
//! structs, stored independently of the live card row, so undo keeps working
//! after the card has been further mutated or deleted. Decoding fills
//! defaults for absent optional fields, which keeps old rows readable as the
//! schema grows.

use crate::cards::normalize::{normalize_plot_card, normalize_world_card};
use crate::cards::{CardError, CardKind, CardSource, MemoryWindow, PlotCard, WorldCard};
use crate::ids::{CardId, CharacterId, GameId, MessageId, PlotCardId, PlotEventId, WorldEventId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Current snapshot format version.
const SNAPSHOT_VERSION: u32 = 1;

/// Maximum excerpt length in characters.
pub const EXCERPT_MAX_CHARS: usize = 120;

/// Errors from snapshot encoding and decoding.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot encode failed: {0}")]
    Encode(serde_json::Error),

    #[error("snapshot decode failed: {0}")]
    Decode(serde_json::Error),

    #[error("snapshot version {found} is newer than supported version {supported}")]
    Version { found: u32, supported: u32 },
}

/// What a change event did to its card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeAction {
    Added,
    Updated,
    Deleted,
    /// An action value this build does not know. Kept verbatim so the undo
    /// path can reject it explicitly instead of failing at decode time.
    Unknown(String),
}

impl ChangeAction {
    pub fn as_str(&self) -> &str {
        match self {
            ChangeAction::Added => "added",
            ChangeAction::Updated => "updated",
            ChangeAction::Deleted => "deleted",
            ChangeAction::Unknown(raw) => raw,
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "added" => ChangeAction::Added,
            "updated" => ChangeAction::Updated,
            "deleted" => ChangeAction::Deleted,
            other => ChangeAction::Unknown(other.to_string()),
        }
    }
}

impl Serialize for ChangeAction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ChangeAction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(ChangeAction::parse(&raw))
    }
}

fn snapshot_version() -> u32 {
    SNAPSHOT_VERSION
}

fn default_kind() -> CardKind {
    CardKind::World
}

fn default_window() -> MemoryWindow {
    MemoryWindow::Turns(5)
}

fn default_source() -> CardSource {
    CardSource::User
}

fn default_true() -> bool {
    true
}

/// A structural copy of a world card's fields at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldCardSnapshot {
    #[serde(default = "snapshot_version")]
    pub version: u32,
    pub id: CardId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub triggers: Vec<String>,
    #[serde(default = "default_kind")]
    pub kind: CardKind,
    #[serde(default)]
    pub character_id: Option<CharacterId>,
    #[serde(default = "default_window")]
    pub memory_window: MemoryWindow,
    #[serde(default)]
    pub locked: bool,
    #[serde(default = "default_true")]
    pub ai_editable: bool,
    #[serde(default = "default_source")]
    pub source: CardSource,
    #[serde(default)]
    pub avatar: Option<String>,
}

impl WorldCardSnapshot {
    /// Capture a card's current fields. Timestamps are deliberately not part
    /// of a snapshot; restore assigns fresh ones.
    pub fn capture(card: &WorldCard) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            id: card.id,
            title: card.title.clone(),
            content: card.content.clone(),
            triggers: card.triggers.clone(),
            kind: card.kind,
            character_id: card.character_id,
            memory_window: card.memory_window,
            locked: card.locked,
            ai_editable: card.ai_editable,
            source: card.source,
            avatar: card.avatar.clone(),
        }
    }

    /// Rebuild a card from this snapshot, re-running full normalization.
    /// Fails when the snapshot lacks a usable title or content.
    pub fn to_card(&self, game_id: GameId) -> Result<WorldCard, CardError> {
        let now = Utc::now();
        let mut card = WorldCard {
            id: self.id,
            game_id,
            title: self.title.clone(),
            content: self.content.clone(),
            triggers: self.triggers.clone(),
            kind: self.kind,
            character_id: self.character_id,
            memory_window: self.memory_window,
            locked: self.locked,
            ai_editable: self.ai_editable,
            source: self.source,
            avatar: self.avatar.clone(),
            created_at: now,
            updated_at: now,
        };
        normalize_world_card(&mut card, None)?;
        Ok(card)
    }

    pub fn to_json(&self) -> Result<String, SnapshotError> {
        serde_json::to_string(self).map_err(SnapshotError::Encode)
    }

    pub fn from_json(raw: &str) -> Result<Self, SnapshotError> {
        let snapshot: Self = serde_json::from_str(raw).map_err(SnapshotError::Decode)?;
        check_version(snapshot.version)?;
        Ok(snapshot)
    }
}

/// A structural copy of a plot card's fields at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlotCardSnapshot {
    #[serde(default = "snapshot_version")]
    pub version: u32,
    pub id: PlotCardId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub locked: bool,
    #[serde(default = "default_true")]
    pub ai_editable: bool,
    #[serde(default = "default_source")]
    pub source: CardSource,
}

impl PlotCardSnapshot {
    pub fn capture(card: &PlotCard) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            id: card.id,
            title: card.title.clone(),
            content: card.content.clone(),
            locked: card.locked,
            ai_editable: card.ai_editable,
            source: card.source,
        }
    }

    /// Rebuild a card from this snapshot, re-running full normalization.
    pub fn to_card(&self, game_id: GameId) -> Result<PlotCard, CardError> {
        let now = Utc::now();
        let mut card = PlotCard {
            id: self.id,
            game_id,
            title: self.title.clone(),
            content: self.content.clone(),
            locked: self.locked,
            ai_editable: self.ai_editable,
            source: self.source,
            created_at: now,
            updated_at: now,
        };
        normalize_plot_card(&mut card)?;
        Ok(card)
    }

    pub fn to_json(&self) -> Result<String, SnapshotError> {
        serde_json::to_string(self).map_err(SnapshotError::Encode)
    }

    pub fn from_json(raw: &str) -> Result<Self, SnapshotError> {
        let snapshot: Self = serde_json::from_str(raw).map_err(SnapshotError::Decode)?;
        check_version(snapshot.version)?;
        Ok(snapshot)
    }
}

fn check_version(found: u32) -> Result<(), SnapshotError> {
    if found > SNAPSHOT_VERSION {
        return Err(SnapshotError::Version {
            found,
            supported: SNAPSHOT_VERSION,
        });
    }
    Ok(())
}

/// One logged mutation of a world card.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldChangeEvent {
    pub id: WorldEventId,
    pub game_id: GameId,
    /// The assistant message whose generation produced this mutation, if any.
    pub message_id: Option<MessageId>,
    /// The affected card. Cleared when the card is later deleted.
    pub card_id: Option<CardId>,
    pub action: ChangeAction,
    /// Short human-readable label, usually the card title.
    pub label: String,
    /// Excerpt of the changed text.
    pub excerpt: String,
    pub before: Option<WorldCardSnapshot>,
    pub after: Option<WorldCardSnapshot>,
    pub created_at: DateTime<Utc>,
    pub undone_at: Option<DateTime<Utc>>,
}

impl WorldChangeEvent {
    pub fn is_undone(&self) -> bool {
        self.undone_at.is_some()
    }
}

/// One logged mutation of a plot card.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlotChangeEvent {
    pub id: PlotEventId,
    pub game_id: GameId,
    /// The assistant message whose generation produced this mutation, if any.
    pub message_id: Option<MessageId>,
    /// The affected card. Cleared when the card is later deleted.
    pub card_id: Option<PlotCardId>,
    pub action: ChangeAction,
    pub label: String,
    pub excerpt: String,
    pub before: Option<PlotCardSnapshot>,
    pub after: Option<PlotCardSnapshot>,
    pub created_at: DateTime<Utc>,
    pub undone_at: Option<DateTime<Utc>>,
}

impl PlotChangeEvent {
    pub fn is_undone(&self) -> bool {
        self.undone_at.is_some()
    }
}

/// Derive a label and excerpt for a world-card change.
pub fn world_change_summary(
    before: Option<&WorldCardSnapshot>,
    after: Option<&WorldCardSnapshot>,
) -> (String, String) {
    summary_parts(
        before.map(|s| (s.title.as_str(), s.content.as_str())),
        after.map(|s| (s.title.as_str(), s.content.as_str())),
    )
}

/// Derive a label and excerpt for a plot-card change.
pub fn plot_change_summary(
    before: Option<&PlotCardSnapshot>,
    after: Option<&PlotCardSnapshot>,
) -> (String, String) {
    summary_parts(
        before.map(|s| (s.title.as_str(), s.content.as_str())),
        after.map(|s| (s.title.as_str(), s.content.as_str())),
    )
}

fn summary_parts(before: Option<(&str, &str)>, after: Option<(&str, &str)>) -> (String, String) {
    use crate::cards::normalize::{clamp_chars, collapse_whitespace};

    let (title, content) = after.or(before).unwrap_or(("(unknown card)", ""));
    let label = title.to_string();
    let excerpt = clamp_chars(&collapse_whitespace(content), EXCERPT_MAX_CHARS);
    (label, excerpt)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalized_card() -> WorldCard {
        let mut card = WorldCard::new(
            GameId::new(),
            "The Bandit Chief",
            "Leads the toll-road ambushes. Scar over the left eye.",
            CardKind::World,
        )
        .with_triggers(vec!["bandit".to_string(), "chief".to_string()]);
        normalize_world_card(&mut card, None).unwrap();
        card
    }

    #[test]
    fn test_action_round_trip() {
        for action in [
            ChangeAction::Added,
            ChangeAction::Updated,
            ChangeAction::Deleted,
        ] {
            assert_eq!(ChangeAction::parse(action.as_str()), action);
        }
        assert_eq!(
            ChangeAction::parse("promoted"),
            ChangeAction::Unknown("promoted".to_string())
        );
    }

    #[test]
    fn test_capture_and_rebuild_round_trip() {
        let card = normalized_card();
        let snapshot = WorldCardSnapshot::capture(&card);
        let rebuilt = snapshot.to_card(card.game_id).unwrap();

        assert_eq!(rebuilt.id, card.id);
        assert_eq!(rebuilt.title, card.title);
        assert_eq!(rebuilt.content, card.content);
        assert_eq!(rebuilt.triggers, card.triggers);
        assert_eq!(rebuilt.kind, card.kind);
        assert_eq!(rebuilt.memory_window, card.memory_window);
        assert_eq!(rebuilt.locked, card.locked);
        assert_eq!(rebuilt.ai_editable, card.ai_editable);
        assert_eq!(rebuilt.source, card.source);
    }

    #[test]
    fn test_rebuild_rejects_missing_title() {
        let card = normalized_card();
        let mut snapshot = WorldCardSnapshot::capture(&card);
        snapshot.title = String::new();
        assert!(matches!(
            snapshot.to_card(card.game_id),
            Err(CardError::EmptyTitle)
        ));
    }

    #[test]
    fn test_decode_fills_absent_optional_fields() {
        let raw = format!(
            "{{\"id\":\"{}\",\"title\":\"Mira\",\"content\":\"A bard.\"}}",
            CardId::nil()
        );
        let snapshot = WorldCardSnapshot::from_json(&raw).unwrap();

        assert_eq!(snapshot.version, 1);
        assert_eq!(snapshot.kind, CardKind::World);
        assert_eq!(snapshot.memory_window, MemoryWindow::Turns(5));
        assert!(snapshot.ai_editable);
        assert!(!snapshot.locked);
        assert!(snapshot.triggers.is_empty());
        assert!(snapshot.avatar.is_none());
    }

    #[test]
    fn test_decode_ignores_unknown_fields() {
        let raw = format!(
            "{{\"id\":\"{}\",\"title\":\"Mira\",\"content\":\"A bard.\",\"mood\":\"wistful\"}}",
            CardId::nil()
        );
        assert!(WorldCardSnapshot::from_json(&raw).is_ok());
    }

    #[test]
    fn test_decode_rejects_future_version() {
        let raw = format!(
            "{{\"version\":99,\"id\":\"{}\",\"title\":\"Mira\",\"content\":\"A bard.\"}}",
            CardId::nil()
        );
        assert!(matches!(
            WorldCardSnapshot::from_json(&raw),
            Err(SnapshotError::Version { found: 99, .. })
        ));
    }

    #[test]
    fn test_summary_prefers_after_snapshot() {
        let card = normalized_card();
        let before = WorldCardSnapshot::capture(&card);
        let mut after = before.clone();
        after.title = "The Bandit King".to_string();
        after.content = "Crowned himself after the ambush at the ford.".to_string();

        let (label, excerpt) = world_change_summary(Some(&before), Some(&after));
        assert_eq!(label, "The Bandit King");
        assert!(excerpt.starts_with("Crowned himself"));

        let (label, _) = world_change_summary(Some(&before), None);
        assert_eq!(label, "The Bandit Chief");
    }
}
