//! The streaming turn runtime.
//!
//! One turn: persist the prompt, pick context, stream the reply while saving
//! partials, then extract world changes. Failures before the stream opens
//! come back as plain errors; once events are flowing, trouble turns into an
//! `error` event and the stream closes. Cancellation is cooperative and is
//! checked between chunks; whatever was last saved stays saved.

use crate::config::TurnConfig;
use crate::changelog::{PlotChangeEvent, WorldChangeEvent};
use crate::cards::normalize::normalize_prose;
use crate::context::ContextSelector;
use crate::extract::{ExtractedChanges, MutationExtractor};
use crate::game::{Game, Message, MessageRole};
use crate::ids::{GameId, MessageId};
use crate::provider::{ProviderError, StoryProvider, TurnRequest};
use crate::store::{messages, GameStore, StoreError};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum TurnError {
    #[error("no text generator is configured")]
    ProviderNotReady,

    #[error("the prompt is empty")]
    EmptyPrompt,

    #[error("there is no prompt to answer yet")]
    NothingToContinue,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// What starts a turn: a fresh prompt, or a rerun over existing history.
#[derive(Debug, Clone)]
pub enum TurnInput {
    Prompt(String),
    Continue,
}

/// Events emitted over one turn, in order: `start`, any number of `chunk`s,
/// then exactly one of `done` or `error`.
#[derive(Debug, Clone)]
pub enum TurnEvent {
    Start {
        assistant_message_id: MessageId,
        user_message_id: Option<MessageId>,
    },
    Chunk {
        assistant_message_id: MessageId,
        delta: String,
    },
    Error {
        detail: String,
    },
    Done {
        message: Message,
        world_card_events: Vec<WorldChangeEvent>,
        plot_card_events: Vec<PlotChangeEvent>,
        plot_card_created: bool,
    },
}

impl TurnEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TurnEvent::Start { .. } => "start",
            TurnEvent::Chunk { .. } => "chunk",
            TurnEvent::Error { .. } => "error",
            TurnEvent::Done { .. } => "done",
        }
    }

    /// Render as a server-sent event frame.
    pub fn to_sse(&self) -> String {
        let data = match self {
            TurnEvent::Start {
                assistant_message_id,
                user_message_id,
            } => serde_json::json!({
                "assistant_message_id": assistant_message_id,
                "user_message_id": user_message_id,
            }),
            TurnEvent::Chunk {
                assistant_message_id,
                delta,
            } => serde_json::json!({
                "assistant_message_id": assistant_message_id,
                "delta": delta,
            }),
            TurnEvent::Error { detail } => serde_json::json!({ "detail": detail }),
            TurnEvent::Done {
                message,
                world_card_events,
                plot_card_events,
                plot_card_created,
            } => serde_json::json!({
                "message": message,
                "world_card_events": world_card_events,
                "plot_card_events": plot_card_events,
                "plot_card_created": plot_card_created,
            }),
        };
        format!("event: {}\ndata: {}\n\n", self.name(), data)
    }
}

#[derive(Clone)]
pub struct TurnRuntime {
    store: GameStore,
    provider: Arc<dyn StoryProvider>,
    config: TurnConfig,
}

impl TurnRuntime {
    pub fn new(store: GameStore, provider: Arc<dyn StoryProvider>, config: TurnConfig) -> Self {
        Self {
            store,
            provider,
            config,
        }
    }

    /// Start a turn. Persists the prompt and an empty assistant message,
    /// then drives generation in a background task; the returned stream
    /// yields the turn's events starting with `start`.
    pub async fn run(
        &self,
        game_id: GameId,
        input: TurnInput,
        cancel: CancellationToken,
    ) -> Result<ReceiverStream<TurnEvent>, TurnError> {
        if !self.provider.is_ready() {
            return Err(TurnError::ProviderNotReady);
        }
        let game = self.store.get_game(game_id).await?;

        match input {
            TurnInput::Prompt(ref text) if text.trim().is_empty() => {
                return Err(TurnError::EmptyPrompt);
            }
            TurnInput::Prompt(text) => {
                self.store
                    .create_message(game_id, MessageRole::User, text)
                    .await?;
            }
            TurnInput::Continue => {}
        }

        let history = self
            .store
            .recent_messages(game_id, self.config.history_budget)
            .await?;
        if history.is_empty() {
            return Err(TurnError::NothingToContinue);
        }
        let user_message_id = history
            .last()
            .filter(|m| m.role == MessageRole::User)
            .map(|m| m.id);

        let world_cards = self.store.list_world_cards(game_id).await?;
        let plot_cards = self.store.list_plot_cards(game_id).await?;
        let selector =
            ContextSelector::new(self.config.world_card_cap, self.config.plot_card_cap);
        let context = selector.select(world_cards, plot_cards, history);
        tracing::debug!(
            game_id = %game_id,
            world_cards = context.world_cards.len(),
            plot_cards = context.plot_cards.len(),
            "selected turn context"
        );

        let assistant = self
            .store
            .create_message(game_id, MessageRole::Assistant, "")
            .await?;

        let request = build_request(&game, context, &self.config);
        let (events_tx, events_rx) = mpsc::channel(32);
        let _ = events_tx
            .send(TurnEvent::Start {
                assistant_message_id: assistant.id,
                user_message_id,
            })
            .await;

        let driver = TurnDriver {
            store: self.store.clone(),
            extractor: MutationExtractor::new(self.store.clone(), self.provider.clone()),
            provider: self.provider.clone(),
            config: self.config.clone(),
            game_id,
            assistant,
        };
        tokio::spawn(driver.drive(request, events_tx, cancel));

        Ok(ReceiverStream::new(events_rx))
    }
}

fn build_request(game: &Game, context: crate::context::TurnContext, config: &TurnConfig) -> TurnRequest {
    TurnRequest {
        context,
        instructions: game.instructions.clone(),
        max_tokens: config.max_tokens,
        temperature: config.temperature,
    }
}

struct TurnDriver {
    store: GameStore,
    extractor: MutationExtractor,
    provider: Arc<dyn StoryProvider>,
    config: TurnConfig,
    game_id: GameId,
    assistant: Message,
}

impl TurnDriver {
    async fn drive(
        self,
        request: TurnRequest,
        events_tx: mpsc::Sender<TurnEvent>,
        cancel: CancellationToken,
    ) {
        let mut stream = match self.provider.stream_turn(request).await {
            Ok(stream) => stream,
            Err(e) => {
                self.discard_placeholder().await;
                let _ = events_tx
                    .send(TurnEvent::Error {
                        detail: e.to_string(),
                    })
                    .await;
                return;
            }
        };

        let mut buffer = String::new();
        let mut persisted_len = 0usize;
        let mut last_persist = Instant::now();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(message_id = %self.assistant.id, "turn cancelled");
                    return;
                }
                next = stream.next() => match next {
                    Some(Ok(chunk)) => {
                        buffer.push_str(&chunk);
                        let sent = events_tx
                            .send(TurnEvent::Chunk {
                                assistant_message_id: self.assistant.id,
                                delta: chunk,
                            })
                            .await;
                        if sent.is_err() {
                            // Receiver gone; treat like a cancel.
                            return;
                        }
                        let grown = buffer.len() - persisted_len;
                        if grown >= self.config.persist_min_chars
                            || (grown > 0
                                && last_persist.elapsed() >= self.config.persist_max_interval)
                        {
                            // A failed partial save is retried by the next one.
                            match self.save_partial(&buffer).await {
                                Ok(()) => {
                                    persisted_len = buffer.len();
                                    last_persist = Instant::now();
                                }
                                Err(e) => {
                                    tracing::warn!(error = %e, "partial save failed");
                                }
                            }
                        }
                    }
                    Some(Err(e)) => {
                        if buffer.len() > persisted_len {
                            if let Err(e) = self.save_partial(&buffer).await {
                                tracing::warn!(error = %e, "partial save failed");
                            }
                        }
                        let _ = events_tx
                            .send(TurnEvent::Error {
                                detail: e.to_string(),
                            })
                            .await;
                        return;
                    }
                    None => break,
                }
            }
        }

        let final_text = normalize_prose(&buffer);
        if final_text.is_empty() {
            if persisted_len == 0 {
                self.discard_placeholder().await;
            }
            let _ = events_tx
                .send(TurnEvent::Error {
                    detail: "the story came back empty".to_string(),
                })
                .await;
            return;
        }

        if let Err(e) = self.save_partial(&final_text).await {
            if persisted_len == 0 {
                let _ = events_tx
                    .send(TurnEvent::Error {
                        detail: e.to_string(),
                    })
                    .await;
                return;
            }
            // The last partial save stands in for the final one.
            tracing::warn!(error = %e, "final save failed, keeping last partial");
        }

        let message = match self.store.get_message(self.game_id, self.assistant.id).await {
            Ok(message) => message,
            Err(e) => {
                let _ = events_tx
                    .send(TurnEvent::Error {
                        detail: e.to_string(),
                    })
                    .await;
                return;
            }
        };

        let changes = match self.extractor.process_turn(self.game_id, &message).await {
            Ok(changes) => changes,
            Err(e) => {
                tracing::warn!(error = %e, "change extraction failed");
                ExtractedChanges::default()
            }
        };

        let _ = events_tx
            .send(TurnEvent::Done {
                message,
                world_card_events: changes.world_events,
                plot_card_events: changes.plot_events,
                plot_card_created: changes.plot_card_created,
            })
            .await;
    }

    async fn save_partial(&self, content: &str) -> Result<(), StoreError> {
        self.store
            .update_message_content(self.game_id, self.assistant.id, content)
            .await
    }

    /// Remove the empty assistant message after a turn that produced
    /// nothing at all.
    async fn discard_placeholder(&self) {
        if let Err(e) =
            messages::delete_message_row(self.store.pool(), self.game_id, self.assistant.id).await
        {
            tracing::warn!(error = %e, "failed to discard empty reply");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sse_framing() {
        let id = MessageId::new();
        let event = TurnEvent::Chunk {
            assistant_message_id: id,
            delta: "The door".to_string(),
        };
        let frame = event.to_sse();
        assert!(frame.starts_with("event: chunk\ndata: "));
        assert!(frame.ends_with("\n\n"));
        assert!(frame.contains(&id.to_string()));
        assert!(frame.contains("The door"));
    }

    #[test]
    fn test_event_names() {
        let start = TurnEvent::Start {
            assistant_message_id: MessageId::new(),
            user_message_id: None,
        };
        assert_eq!(start.name(), "start");
        assert_eq!(
            TurnEvent::Error {
                detail: "x".into()
            }
            .name(),
            "error"
        );
    }
}
