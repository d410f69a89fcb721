//! Turns a finished scene into world-state mutations.
//!
//! After a reply is persisted, the extractor asks the provider what changed,
//! parses the JSON change list, and applies it through the store so every
//! mutation lands in the changelog tied to the assistant message. Malformed
//! or forbidden changes are skipped with a warning; the story never fails
//! because bookkeeping did.

use crate::cards::{CardKind, CardSource, PlotCard, WorldCard};
use crate::changelog::{PlotChangeEvent, WorldChangeEvent};
use crate::game::Message;
use crate::ids::{CardId, GameId, MessageId};
use crate::provider::{ProviderError, StoryProvider};
use crate::store::{GameStore, StoreError};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

const EXTRACT_MAX_TOKENS: usize = 900;
const DIGEST_MAX_TOKENS: usize = 400;
const DIGEST_TITLE: &str = "The story so far";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("change list was not valid JSON: {0}")]
    Parse(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Everything one extraction pass changed.
#[derive(Debug, Default)]
pub struct ExtractedChanges {
    pub world_events: Vec<WorldChangeEvent>,
    pub plot_events: Vec<PlotChangeEvent>,
    /// True when this pass created the plot digest card.
    pub plot_card_created: bool,
}

pub struct MutationExtractor {
    store: GameStore,
    provider: Arc<dyn StoryProvider>,
}

impl MutationExtractor {
    pub fn new(store: GameStore, provider: Arc<dyn StoryProvider>) -> Self {
        Self { store, provider }
    }

    /// Extract and apply world changes for a finished reply, then fold the
    /// scene into the plot digest. Digest trouble is logged, not fatal.
    pub async fn process_turn(
        &self,
        game_id: GameId,
        message: &Message,
    ) -> Result<ExtractedChanges, ExtractError> {
        let mut changes = self.extract_world_changes(game_id, message).await?;
        match self.refresh_digest(game_id, message).await {
            Ok((event, created)) => {
                changes.plot_events.extend(event);
                changes.plot_card_created = created;
            }
            Err(e) => tracing::warn!(error = %e, "plot digest refresh failed"),
        }
        Ok(changes)
    }

    async fn extract_world_changes(
        &self,
        game_id: GameId,
        message: &Message,
    ) -> Result<ExtractedChanges, ExtractError> {
        let cards = self.store.list_world_cards(game_id).await?;
        let prompt = render_extract_prompt(&cards, &message.content);
        let raw = self
            .provider
            .complete(include_str!("prompts/extract.txt"), &prompt, EXTRACT_MAX_TOKENS)
            .await?;
        let items = parse_change_list(&raw)?;
        let world_events =
            apply_world_changes(&self.store, game_id, message.id, &cards, items).await?;
        Ok(ExtractedChanges {
            world_events,
            plot_events: Vec::new(),
            plot_card_created: false,
        })
    }

    /// Rewrite the AI-maintained plot digest in light of the new scene.
    async fn refresh_digest(
        &self,
        game_id: GameId,
        message: &Message,
    ) -> Result<(Option<PlotChangeEvent>, bool), ExtractError> {
        let current = self.store.find_digest_card(game_id).await?;
        let prompt = render_digest_prompt(
            current.as_ref().map(|card| card.content.as_str()),
            &message.content,
        );
        let summary = self
            .provider
            .complete(include_str!("prompts/digest.txt"), &prompt, DIGEST_MAX_TOKENS)
            .await?;
        let summary = summary.trim().to_string();
        if summary.is_empty() {
            return Ok((None, false));
        }

        match current {
            Some(card) => {
                let result = self
                    .store
                    .update_plot_card(game_id, card.id, Some(message.id), move |c| {
                        c.content = summary;
                    })
                    .await;
                match result {
                    Ok((_, event)) => Ok((Some(event), false)),
                    Err(e) if is_validation(&e) => {
                        tracing::warn!(error = %e, "digest update rejected");
                        Ok((None, false))
                    }
                    Err(e) => Err(e.into()),
                }
            }
            None => {
                let card = PlotCard::new(game_id, DIGEST_TITLE, summary)
                    .with_source(CardSource::Ai);
                let (_, event) = self.store.create_plot_card(card, Some(message.id)).await?;
                Ok((Some(event), true))
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChangeList {
    #[serde(default)]
    changes: Vec<ChangeItem>,
}

#[derive(Debug, Deserialize)]
struct ChangeItem {
    action: String,
    #[serde(default)]
    kind: Option<String>,
    title: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    triggers: Vec<String>,
}

fn parse_change_list(raw: &str) -> Result<Vec<ChangeItem>, ExtractError> {
    let json = extract_json(raw);
    let list: ChangeList =
        serde_json::from_str(json).map_err(|e| ExtractError::Parse(format!("{e}: {json}")))?;
    Ok(list.changes)
}

/// Pull JSON out of a response that may be wrapped in markdown fences.
fn extract_json(text: &str) -> &str {
    let text = text.trim();
    if let Some(start) = text.find("```json") {
        let content_start = start + 7;
        if let Some(end) = text[content_start..].find("```") {
            return text[content_start..content_start + end].trim();
        }
    }
    if let Some(start) = text.find("```") {
        let content_start = start + 3;
        if let Some(end) = text[content_start..].find("```") {
            return text[content_start..content_start + end].trim();
        }
    }
    text
}

/// Apply a parsed change list against the store. Returns the recorded
/// events; changes that are malformed, forbidden, or aimed at unknown cards
/// are skipped.
async fn apply_world_changes(
    store: &GameStore,
    game_id: GameId,
    message_id: MessageId,
    cards: &[WorldCard],
    items: Vec<ChangeItem>,
) -> Result<Vec<WorldChangeEvent>, ExtractError> {
    // Title lookup is case-insensitive; adds feed back in so a later change
    // in the same list can reference them.
    let mut known: HashMap<String, CardRef> = cards
        .iter()
        .map(|card| {
            (
                card.title.to_lowercase(),
                CardRef {
                    id: card.id,
                    ai_editable: card.ai_editable,
                    is_hero: card.is_main_hero(),
                },
            )
        })
        .collect();

    let mut events = Vec::new();
    for item in items {
        let title = item.title.trim().to_string();
        if title.is_empty() {
            tracing::warn!("skipping change with empty title");
            continue;
        }
        let key = title.to_lowercase();
        let action = item.action.trim().to_lowercase();
        match action.as_str() {
            "add" if !known.contains_key(&key) => {
                let Some(content) = item.content else {
                    tracing::warn!(title = %title, "skipping add without content");
                    continue;
                };
                let card = WorldCard::new(game_id, title.clone(), content, parse_kind(&item.kind))
                    .with_source(CardSource::Ai)
                    .with_triggers(item.triggers);
                match store.create_world_card(card, Some(message_id)).await {
                    Ok((card, event)) => {
                        known.insert(
                            key,
                            CardRef {
                                id: card.id,
                                ai_editable: card.ai_editable,
                                is_hero: false,
                            },
                        );
                        events.push(event);
                    }
                    Err(e) if is_validation(&e) => {
                        tracing::warn!(title = %title, error = %e, "add rejected");
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            // An add aimed at an existing title becomes an update.
            "add" | "update" => {
                let Some(card_ref) = known.get(&key).copied() else {
                    tracing::warn!(title = %title, "skipping update of unknown card");
                    continue;
                };
                if !card_ref.ai_editable {
                    tracing::warn!(title = %title, "card is closed to story edits");
                    continue;
                }
                let content = item.content;
                let triggers = item.triggers;
                let result = store
                    .update_world_card(game_id, card_ref.id, Some(message_id), move |c| {
                        if let Some(content) = content {
                            c.content = content;
                        }
                        if !triggers.is_empty() {
                            c.triggers = triggers;
                        }
                    })
                    .await;
                match result {
                    Ok((_, event)) => events.push(event),
                    Err(e) if is_validation(&e) => {
                        tracing::warn!(title = %title, error = %e, "update rejected");
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            "delete" => {
                let Some(card_ref) = known.get(&key).copied() else {
                    tracing::warn!(title = %title, "skipping delete of unknown card");
                    continue;
                };
                if card_ref.is_hero {
                    tracing::warn!(title = %title, "the main hero cannot be deleted");
                    continue;
                }
                if !card_ref.ai_editable {
                    tracing::warn!(title = %title, "card is closed to story edits");
                    continue;
                }
                match store
                    .delete_world_card(game_id, card_ref.id, Some(message_id))
                    .await
                {
                    Ok(event) => {
                        known.remove(&key);
                        events.push(event);
                    }
                    Err(e) if is_validation(&e) => {
                        tracing::warn!(title = %title, error = %e, "delete rejected");
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            other => {
                tracing::warn!(action = other, title = %title, "unknown change action");
            }
        }
    }
    Ok(events)
}

#[derive(Debug, Clone, Copy)]
struct CardRef {
    id: CardId,
    ai_editable: bool,
    is_hero: bool,
}

fn parse_kind(kind: &Option<String>) -> CardKind {
    match kind.as_deref().map(str::trim) {
        Some("npc") => CardKind::Npc,
        Some("world") | None => CardKind::World,
        Some(other) => {
            tracing::warn!(kind = other, "unknown card kind, treating as world");
            CardKind::World
        }
    }
}

/// Only hard failures abort an extraction pass; rule rejections are the
/// model picking a fight with the store, and the store wins quietly.
fn is_validation(err: &StoreError) -> bool {
    matches!(
        err,
        StoreError::Card(_)
            | StoreError::MainHeroUndeletable
            | StoreError::DuplicateMainHero
            | StoreError::NotFound { .. }
    )
}

fn render_extract_prompt(cards: &[WorldCard], scene: &str) -> String {
    let mut prompt = String::new();
    if cards.is_empty() {
        prompt.push_str("There are no cards yet.\n");
    } else {
        prompt.push_str("Current cards:\n");
        for card in cards {
            prompt.push_str(&format!(
                "### {} [{}]\n{}\n",
                card.title,
                card.kind.as_str(),
                card.content
            ));
        }
    }
    prompt.push_str("\nScene:\n");
    prompt.push_str(scene);
    prompt
}

fn render_digest_prompt(current: Option<&str>, scene: &str) -> String {
    let mut prompt = String::new();
    prompt.push_str("Current summary:\n");
    prompt.push_str(current.unwrap_or("(none yet)"));
    prompt.push_str("\n\nNew scene:\n");
    prompt.push_str(scene);
    prompt
}
