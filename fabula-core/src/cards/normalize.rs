//! Pure field normalization for cards.
//!
//! Every store write re-runs these functions, and the undo path reuses them
//! when rebuilding a card from a snapshot, so they must be idempotent:
//! normalizing already-normalized input returns it unchanged.

use super::plot::PlotCard;
use super::world::{CardKind, MemoryWindow, WorldCard};
use std::collections::HashSet;
use thiserror::Error;

/// Maximum title length in characters.
pub const TITLE_MAX_CHARS: usize = 120;
/// Maximum content length in characters.
pub const CONTENT_MAX_CHARS: usize = 4000;
/// Maximum length of a single trigger phrase in characters.
pub const TRIGGER_MAX_CHARS: usize = 80;
/// Maximum number of trigger phrases kept per card.
pub const MAX_TRIGGERS: usize = 20;

const NPC_APPEARANCE_HEADING: &str = "Appearance and character:";
const NPC_IMPORTANCE_HEADING: &str = "Importance:";
const NPC_IMPORTANCE_FALLBACK: &str = "Not yet established.";

// Per-section caps. Their sum plus the headings stays under
// CONTENT_MAX_CHARS, so the rebuilt two-part content never needs a final cut.
const NPC_APPEARANCE_MAX_CHARS: usize = 3000;
const NPC_IMPORTANCE_MAX_CHARS: usize = 600;

/// Validation failures surfaced by normalization.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CardError {
    #[error("card title is empty")]
    EmptyTitle,

    #[error("card content is empty")]
    EmptyContent,
}

/// Normalize a world card in place. `previous_content` is the stored content
/// being replaced, used to carry an NPC card's importance section forward when
/// the new text lacks one.
pub fn normalize_world_card(
    card: &mut WorldCard,
    previous_content: Option<&str>,
) -> Result<(), CardError> {
    card.title = normalize_title(&card.title)?;

    let prose = normalize_prose(&card.content);
    if prose.is_empty() {
        return Err(CardError::EmptyContent);
    }
    card.content = if card.kind == CardKind::Npc {
        npc_shape(&prose, previous_content)
    } else {
        clamp_chars(&prose, CONTENT_MAX_CHARS)
    };

    card.triggers = normalize_triggers(&card.triggers);
    card.memory_window = clamp_memory_window(card.kind, card.memory_window);
    Ok(())
}

/// Normalize a plot card in place.
pub fn normalize_plot_card(card: &mut PlotCard) -> Result<(), CardError> {
    card.title = normalize_title(&card.title)?;
    let prose = normalize_prose(&card.content);
    if prose.is_empty() {
        return Err(CardError::EmptyContent);
    }
    card.content = clamp_chars(&prose, CONTENT_MAX_CHARS);
    Ok(())
}

/// Collapse whitespace runs to single spaces, clamp, and reject empty titles.
pub fn normalize_title(raw: &str) -> Result<String, CardError> {
    let title = clamp_chars(&collapse_whitespace(raw), TITLE_MAX_CHARS);
    if title.is_empty() {
        return Err(CardError::EmptyTitle);
    }
    Ok(title)
}

/// Clean each trigger, drop empties, dedupe case-insensitively preserving
/// first occurrence, and cap the count.
pub fn normalize_triggers(raw: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for trigger in raw {
        let cleaned = clamp_chars(&collapse_whitespace(trigger), TRIGGER_MAX_CHARS);
        if cleaned.is_empty() {
            continue;
        }
        if !seen.insert(cleaned.to_lowercase()) {
            continue;
        }
        out.push(cleaned);
        if out.len() == MAX_TRIGGERS {
            break;
        }
    }
    out
}

/// Clamp a memory window to what the card kind allows. Main-hero cards are
/// always-active no matter what the caller supplied; other kinds snap to the
/// nearest allowed turn count, with "always" mapping to the longest window.
pub fn clamp_memory_window(kind: CardKind, window: MemoryWindow) -> MemoryWindow {
    if kind == CardKind::MainHero {
        return MemoryWindow::Always;
    }
    let turns = match window {
        MemoryWindow::Always => return MemoryWindow::Turns(15),
        MemoryWindow::Turns(n) => n,
    };
    let snapped = if turns <= 7 {
        5
    } else if turns <= 12 {
        10
    } else {
        15
    };
    MemoryWindow::Turns(snapped)
}

/// Trim, unify line endings, and collapse runs of three or more newlines
/// down to a single blank line. Inline whitespace is left alone.
pub fn normalize_prose(raw: &str) -> String {
    let unified = raw.replace("\r\n", "\n").replace('\r', "\n");
    let mut out = String::with_capacity(unified.len());
    let mut newline_run = 0usize;
    for ch in unified.chars() {
        if ch == '\n' {
            newline_run += 1;
            if newline_run <= 2 {
                out.push(ch);
            }
        } else {
            newline_run = 0;
            out.push(ch);
        }
    }
    out.trim().to_string()
}

/// Whether NPC content already carries both canonical sections.
pub fn has_npc_shape(content: &str) -> bool {
    split_npc_parts(content).is_some()
}

/// Rebuild NPC content into the canonical two-part shape. Unshaped input
/// becomes the appearance section; the importance section is carried over
/// from the previous content when available.
pub fn npc_shape(content: &str, previous_content: Option<&str>) -> String {
    let carried_importance = || {
        previous_content
            .and_then(split_npc_parts)
            .map(|(_, importance)| importance.to_string())
            .filter(|importance| !importance.is_empty())
            .unwrap_or_else(|| NPC_IMPORTANCE_FALLBACK.to_string())
    };

    let (appearance, importance) = match split_npc_parts(content) {
        Some((appearance, importance)) => {
            let importance = if importance.is_empty() {
                carried_importance()
            } else {
                importance.to_string()
            };
            (appearance.to_string(), importance)
        }
        None => (content.trim().to_string(), carried_importance()),
    };

    let appearance = clamp_chars(&appearance, NPC_APPEARANCE_MAX_CHARS);
    let importance = clamp_chars(&importance, NPC_IMPORTANCE_MAX_CHARS);
    format!("{NPC_APPEARANCE_HEADING} {appearance}\n{NPC_IMPORTANCE_HEADING} {importance}")
}

fn split_npc_parts(content: &str) -> Option<(&str, &str)> {
    let appearance_at = find_ignore_ascii_case(content, NPC_APPEARANCE_HEADING)?;
    let after_heading = appearance_at + NPC_APPEARANCE_HEADING.len();
    let importance_rel = find_ignore_ascii_case(&content[after_heading..], NPC_IMPORTANCE_HEADING)?;
    let importance_at = after_heading + importance_rel;
    let appearance = content[after_heading..importance_at].trim();
    let importance = content[importance_at + NPC_IMPORTANCE_HEADING.len()..].trim();
    Some((appearance, importance))
}

// Byte-wise scan is safe here: the needles are pure ASCII, so a match can
// only start and end on character boundaries.
fn find_ignore_ascii_case(haystack: &str, needle: &str) -> Option<usize> {
    let h = haystack.as_bytes();
    let n = needle.as_bytes();
    if n.is_empty() || n.len() > h.len() {
        return None;
    }
    (0..=h.len() - n.len()).find(|&i| h[i..i + n.len()].eq_ignore_ascii_case(n))
}

/// Collapse all whitespace runs (including newlines) to single spaces and
/// trim the ends.
pub fn collapse_whitespace(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Truncate to at most `max` characters, cutting on a character boundary.
pub fn clamp_chars(raw: &str, max: usize) -> String {
    if raw.chars().count() <= max {
        raw.to_string()
    } else {
        raw.chars().take(max).collect::<String>().trim_end().to_string()
    }
}
