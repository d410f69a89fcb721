//! Seam between the engine and text generation.
//!
//! The turn runtime talks to a `StoryProvider` and nothing else, so tests
//! script turns without a network and deployments can wrap any
//! OpenAI-compatible endpoint through [`TextGenProvider`].

use crate::config::ProviderConfig;
use crate::context::TurnContext;
use crate::game::MessageRole;
use async_trait::async_trait;
use futures::StreamExt;
use std::pin::Pin;
use textgen::{StreamEvent, TextGen};
use thiserror::Error;
use tokio_stream::Stream;

/// Text chunks of one streamed reply.
pub type StoryStream = Pin<Box<dyn Stream<Item = Result<String, ProviderError>> + Send>>;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("no text generator is configured")]
    NotConfigured,

    #[error("generation request failed: {0}")]
    Request(String),

    #[error("generation stream broke off: {0}")]
    Interrupted(String),
}

/// One turn's worth of prompt material. `context.history` ends with the
/// prompt being answered.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub context: TurnContext,
    pub instructions: Vec<String>,
    pub max_tokens: usize,
    pub temperature: f32,
}

#[async_trait]
pub trait StoryProvider: Send + Sync {
    /// Whether the provider can take requests at all.
    fn is_ready(&self) -> bool;

    /// Stream the next scene as text chunks.
    async fn stream_turn(&self, request: TurnRequest) -> Result<StoryStream, ProviderError>;

    /// One-shot completion for auxiliary work (change extraction, digests).
    async fn complete(
        &self,
        system: &str,
        prompt: &str,
        max_tokens: usize,
    ) -> Result<String, ProviderError>;
}

/// Production provider backed by the textgen client.
#[derive(Clone)]
pub struct TextGenProvider {
    client: TextGen,
}

impl TextGenProvider {
    pub fn new(client: TextGen) -> Self {
        Self { client }
    }

    /// Build a client from config, falling back to the textgen environment
    /// variables for anything unset.
    pub fn from_config(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let mut client = match &config.base_url {
            Some(base_url) => TextGen::new(base_url.clone()),
            None => TextGen::from_env().map_err(|e| ProviderError::Request(e.to_string()))?,
        };
        if let Some(api_key) = &config.api_key {
            client = client.with_api_key(api_key.clone());
        }
        if let Some(model) = &config.model {
            client = client.with_model(model.clone());
        }
        Ok(Self::new(client))
    }
}

#[async_trait]
impl StoryProvider for TextGenProvider {
    fn is_ready(&self) -> bool {
        self.client.is_configured()
    }

    async fn stream_turn(&self, request: TurnRequest) -> Result<StoryStream, ProviderError> {
        if !self.is_ready() {
            return Err(ProviderError::NotConfigured);
        }
        let system = render_system_prompt(&request);
        let messages = render_messages(&request.context);
        let api_request = textgen::Request::new(messages)
            .with_system(system)
            .with_max_tokens(request.max_tokens)
            .with_temperature(request.temperature);

        let stream = self
            .client
            .stream(api_request)
            .await
            .map_err(|e| ProviderError::Request(e.to_string()))?;

        let chunks = stream.filter_map(|event| {
            futures::future::ready(match event {
                Ok(StreamEvent::TextDelta { text }) => Some(Ok(text)),
                Ok(StreamEvent::Error { message }) => {
                    Some(Err(ProviderError::Interrupted(message)))
                }
                Ok(_) => None,
                Err(e) => Some(Err(ProviderError::Interrupted(e.to_string()))),
            })
        });
        Ok(Box::pin(chunks))
    }

    async fn complete(
        &self,
        system: &str,
        prompt: &str,
        max_tokens: usize,
    ) -> Result<String, ProviderError> {
        if !self.is_ready() {
            return Err(ProviderError::NotConfigured);
        }
        let api_request = textgen::Request::new(vec![textgen::Message::user(prompt.to_string())])
            .with_system(system.to_string())
            .with_max_tokens(max_tokens);
        let response = self
            .client
            .complete(api_request)
            .await
            .map_err(|e| ProviderError::Request(e.to_string()))?;
        Ok(response.content)
    }
}

fn render_system_prompt(request: &TurnRequest) -> String {
    let mut prompt = String::new();
    prompt.push_str(include_str!("prompts/narrator.txt"));

    if !request.instructions.is_empty() {
        prompt.push_str("\n## Story Instructions\n");
        for instruction in &request.instructions {
            prompt.push_str(&format!("- {instruction}\n"));
        }
    }

    if let Some(hero) = request.context.world_cards.iter().find(|c| c.is_main_hero()) {
        prompt.push_str("\n## The Main Hero\n");
        prompt.push_str(&format!("**{}**\n{}\n", hero.title, hero.content));
    }

    if !request.context.plot_cards.is_empty() {
        prompt.push_str("\n## Plot\n");
        for card in &request.context.plot_cards {
            prompt.push_str(&format!("### {}\n{}\n", card.title, card.content));
        }
    }

    let world: Vec<_> = request
        .context
        .world_cards
        .iter()
        .filter(|c| !c.is_main_hero())
        .collect();
    if !world.is_empty() {
        prompt.push_str("\n## World Notes\n");
        for card in world {
            prompt.push_str(&format!("### {}\n{}\n", card.title, card.content));
        }
    }

    prompt
}

fn render_messages(context: &TurnContext) -> Vec<textgen::Message> {
    context
        .history
        .iter()
        .map(|message| match message.role {
            MessageRole::User => textgen::Message::user(message.content.clone()),
            MessageRole::Assistant => textgen::Message::assistant(message.content.clone()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cards::{CardKind, PlotCard, WorldCard};
    use crate::game::Message;
    use crate::ids::GameId;

    fn request_with(world: Vec<WorldCard>, plot: Vec<PlotCard>) -> TurnRequest {
        let game_id = GameId::new();
        TurnRequest {
            context: TurnContext {
                world_cards: world,
                plot_cards: plot,
                history: vec![Message::new(game_id, MessageRole::User, "I open the door.")],
            },
            instructions: vec!["Keep it grim.".to_string()],
            max_tokens: 256,
            temperature: 0.8,
        }
    }

    #[test]
    fn test_system_prompt_sections() {
        let game_id = GameId::new();
        let hero = WorldCard::new(game_id, "Aria", "A wary scout.", CardKind::MainHero);
        let gate = WorldCard::new(game_id, "Rusty Gate", "Creaks.", CardKind::World);
        let plot = PlotCard::new(game_id, "Act I", "Reach the city.");
        let prompt = render_system_prompt(&request_with(vec![hero, gate], vec![plot]));

        assert!(prompt.contains("## Story Instructions"));
        assert!(prompt.contains("- Keep it grim."));
        assert!(prompt.contains("## The Main Hero"));
        assert!(prompt.contains("**Aria**"));
        assert!(prompt.contains("## Plot"));
        assert!(prompt.contains("### Act I"));
        assert!(prompt.contains("## World Notes"));
        assert!(prompt.contains("### Rusty Gate"));
        // The hero stays out of the general world section.
        assert!(!prompt.contains("### Aria"));
    }

    #[test]
    fn test_empty_sections_are_omitted() {
        let mut request = request_with(Vec::new(), Vec::new());
        request.instructions.clear();
        let prompt = render_system_prompt(&request);
        assert!(!prompt.contains("## Story Instructions"));
        assert!(!prompt.contains("## Plot"));
        assert!(!prompt.contains("## World Notes"));
    }

    #[test]
    fn test_history_becomes_chat_messages() {
        let game_id = GameId::new();
        let context = TurnContext {
            world_cards: Vec::new(),
            plot_cards: Vec::new(),
            history: vec![
                Message::new(game_id, MessageRole::User, "Hello?"),
                Message::new(game_id, MessageRole::Assistant, "The hall answers."),
                Message::new(game_id, MessageRole::User, "I step in."),
            ],
        };
        let messages = render_messages(&context);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, textgen::Role::User);
        assert_eq!(messages[1].role, textgen::Role::Assistant);
        assert_eq!(messages[2].content, "I step in.");
    }
}
