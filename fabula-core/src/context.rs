//! Turn context selection.
//!
//! Decides which cards ride along with a prompt. Plot cards always go; world
//! cards go when a trigger word appears recently enough for the card's
//! memory window. Distances are measured in turns, not messages: the current
//! prompt is distance 0, the newest assistant reply and the prompt that
//! produced it are distance 1, and so on. A card with window N is active
//! when a trigger lands at a distance strictly below N.

use crate::cards::{PlotCard, WorldCard};
use crate::game::Message;

/// Everything the provider needs to render one turn.
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub world_cards: Vec<WorldCard>,
    pub plot_cards: Vec<PlotCard>,
    pub history: Vec<Message>,
}

/// Stateless card selector. Caps bound how many cards a prompt can carry.
#[derive(Debug, Clone, Copy)]
pub struct ContextSelector {
    world_card_cap: usize,
    plot_card_cap: usize,
}

impl ContextSelector {
    pub fn new(world_card_cap: usize, plot_card_cap: usize) -> Self {
        Self {
            world_card_cap,
            plot_card_cap,
        }
    }

    /// Pick the active cards for the next turn. `history` must be in turn
    /// order and end with the prompt being answered.
    ///
    /// The result is deterministic: the main hero (always active) leads,
    /// then remaining active cards in id order, truncated at the cap.
    pub fn select(
        &self,
        world_cards: Vec<WorldCard>,
        plot_cards: Vec<PlotCard>,
        history: Vec<Message>,
    ) -> TurnContext {
        let distances = turn_distances(&history);

        let mut hero = None;
        let mut active = Vec::new();
        for card in world_cards {
            if card.is_main_hero() {
                hero = Some(card);
            } else if card_is_active(&card, &history, &distances) {
                active.push(card);
            }
        }
        active.sort_by_key(|card| *card.id.as_uuid());

        let mut selected = Vec::new();
        if let Some(hero) = hero {
            selected.push(hero);
        }
        for card in active {
            if selected.len() >= self.world_card_cap {
                break;
            }
            selected.push(card);
        }

        let mut plot = plot_cards;
        plot.sort_by_key(|card| *card.id.as_uuid());
        plot.truncate(self.plot_card_cap);

        TurnContext {
            world_cards: selected,
            plot_cards: plot,
            history,
        }
    }
}

/// Turn distance of each message, newest turn = 0.
fn turn_distances(history: &[Message]) -> Vec<u32> {
    let mut distances = vec![0; history.len()];
    let mut distance = 0u32;
    for (i, message) in history.iter().enumerate().rev() {
        if message.is_assistant() {
            distance += 1;
        }
        distances[i] = distance;
    }
    distances
}

fn card_is_active(card: &WorldCard, history: &[Message], distances: &[u32]) -> bool {
    let window = match card.memory_window.as_raw() {
        raw if raw < 0 => return true,
        raw => raw as u32,
    };
    for (message, &distance) in history.iter().zip(distances) {
        if distance >= window {
            continue;
        }
        if contains_phrase(&message.content, &card.title) {
            return true;
        }
        if card
            .triggers
            .iter()
            .any(|trigger| contains_phrase(&message.content, trigger))
        {
            return true;
        }
    }
    false
}

/// Case-insensitive whole-word search. Multi-word phrases match as a unit;
/// `gate` does not match inside `gatehouse`.
fn contains_phrase(text: &str, phrase: &str) -> bool {
    if phrase.is_empty() {
        return false;
    }
    let text = text.to_lowercase();
    let phrase = phrase.to_lowercase();
    let step = phrase.chars().next().map_or(1, char::len_utf8);
    let mut from = 0;
    while let Some(pos) = text[from..].find(&phrase) {
        let start = from + pos;
        let end = start + phrase.len();
        let head_clear = text[..start]
            .chars()
            .next_back()
            .map_or(true, |c| !c.is_alphanumeric());
        let tail_clear = text[end..]
            .chars()
            .next()
            .map_or(true, |c| !c.is_alphanumeric());
        if head_clear && tail_clear {
            return true;
        }
        from = start + step;
    }
    false
}
