//! One open game behind a single handle.
//!
//! [`GameSession`] bundles the store, the turn runtime, and the undo engine
//! for a single game, and enforces the rules that only apply to edits made
//! by a person: locked cards refuse user edits, created cards are stamped
//! with the user source, and hero setup keeps exactly one main hero.
//!
//! The AI's own writes bypass this layer. The mutation extractor works
//! against the store directly and answers to the `ai_editable` flag
//! instead.

use crate::cards::{CardKind, CardSource, PlotCard, WorldCard};
use crate::changelog::{PlotChangeEvent, WorldChangeEvent};
use crate::config::TurnConfig;
use crate::error::SessionError;
use crate::game::{Game, Message};
use crate::ids::{CardId, CharacterId, GameId, MessageId, PlotCardId, PlotEventId, WorldEventId};
use crate::provider::StoryProvider;
use crate::store::GameStore;
use crate::turn::{TurnEvent, TurnInput, TurnRuntime};
use crate::undo::{RollbackReport, UndoEngine, UndoOutcome};
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// A character sheet being promoted into the story world.
#[derive(Debug, Clone)]
pub struct CharacterProfile {
    pub character_id: CharacterId,
    pub name: String,
    pub description: String,
    pub avatar: Option<String>,
}

impl CharacterProfile {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            character_id: CharacterId::new(),
            name: name.into(),
            description: description.into(),
            avatar: None,
        }
    }

    pub fn with_character_id(mut self, character_id: CharacterId) -> Self {
        self.character_id = character_id;
        self
    }

    pub fn with_avatar(mut self, avatar: impl Into<String>) -> Self {
        self.avatar = Some(avatar.into());
        self
    }
}

/// Handle on one game: turns, cards, history, undo.
#[derive(Clone)]
pub struct GameSession {
    store: GameStore,
    runtime: TurnRuntime,
    undo: UndoEngine,
    game_id: GameId,
}

impl GameSession {
    /// Create a new game and open a session on it.
    pub async fn create(
        store: GameStore,
        provider: Arc<dyn StoryProvider>,
        config: TurnConfig,
        game: Game,
    ) -> Result<Self, SessionError> {
        let game = store.create_game(game).await?;
        Ok(Self::assemble(store, provider, config, game.id))
    }

    /// Open a session on an existing game.
    pub async fn open(
        store: GameStore,
        provider: Arc<dyn StoryProvider>,
        config: TurnConfig,
        game_id: GameId,
    ) -> Result<Self, SessionError> {
        store.get_game(game_id).await?;
        Ok(Self::assemble(store, provider, config, game_id))
    }

    fn assemble(
        store: GameStore,
        provider: Arc<dyn StoryProvider>,
        config: TurnConfig,
        game_id: GameId,
    ) -> Self {
        let runtime = TurnRuntime::new(store.clone(), provider, config);
        let undo = UndoEngine::new(store.clone());
        Self {
            store,
            runtime,
            undo,
            game_id,
        }
    }

    pub fn game_id(&self) -> GameId {
        self.game_id
    }

    /// Direct store access, for concerns the session does not wrap
    /// (scenario counters, cross-game listings).
    pub fn store(&self) -> &GameStore {
        &self.store
    }

    pub async fn game(&self) -> Result<Game, SessionError> {
        Ok(self.store.get_game(self.game_id).await?)
    }

    pub async fn set_instructions(
        &self,
        instructions: Vec<String>,
    ) -> Result<Game, SessionError> {
        Ok(self
            .store
            .update_game_instructions(self.game_id, instructions)
            .await?)
    }

    // --- Turns ---

    /// Send a player prompt and stream the resulting turn.
    pub async fn send(
        &self,
        prompt: impl Into<String>,
        cancel: CancellationToken,
    ) -> Result<ReceiverStream<TurnEvent>, SessionError> {
        Ok(self
            .runtime
            .run(self.game_id, TurnInput::Prompt(prompt.into()), cancel)
            .await?)
    }

    /// Discard the latest assistant reply, rewind its world changes, and
    /// generate a fresh reply from the same history.
    pub async fn reroll(
        &self,
        cancel: CancellationToken,
    ) -> Result<ReceiverStream<TurnEvent>, SessionError> {
        let last = self
            .store
            .recent_messages(self.game_id, 1)
            .await?
            .pop()
            .ok_or(SessionError::NothingToReroll)?;
        if !last.is_assistant() {
            return Err(SessionError::NothingToReroll);
        }
        self.undo.rollback_message(self.game_id, last.id).await?;
        Ok(self
            .runtime
            .run(self.game_id, TurnInput::Continue, cancel)
            .await?)
    }

    // --- Undo ---

    pub async fn undo_world_event(
        &self,
        event_id: WorldEventId,
    ) -> Result<UndoOutcome, SessionError> {
        Ok(self.undo.undo_world_event(self.game_id, event_id).await?)
    }

    pub async fn undo_plot_event(
        &self,
        event_id: PlotEventId,
    ) -> Result<UndoOutcome, SessionError> {
        Ok(self.undo.undo_plot_event(self.game_id, event_id).await?)
    }

    /// Remove an assistant message and rewind every change it made.
    pub async fn rollback_message(
        &self,
        message_id: MessageId,
    ) -> Result<RollbackReport, SessionError> {
        Ok(self.undo.rollback_message(self.game_id, message_id).await?)
    }

    // --- World cards ---

    /// Add a user-authored world card. The card is re-homed to this game
    /// and stamped as user-sourced regardless of how it was built.
    pub async fn create_world_card(
        &self,
        mut card: WorldCard,
    ) -> Result<(WorldCard, WorldChangeEvent), SessionError> {
        card.game_id = self.game_id;
        card.source = CardSource::User;
        Ok(self.store.create_world_card(card, None).await?)
    }

    /// Edit a world card. Locked cards refuse the edit.
    pub async fn update_world_card<F>(
        &self,
        card_id: CardId,
        mutate: F,
    ) -> Result<(WorldCard, WorldChangeEvent), SessionError>
    where
        F: FnOnce(&mut WorldCard),
    {
        let current = self.store.get_world_card(self.game_id, card_id).await?;
        if current.locked {
            return Err(SessionError::CardLocked {
                title: current.title,
            });
        }
        Ok(self
            .store
            .update_world_card(self.game_id, card_id, None, mutate)
            .await?)
    }

    pub async fn delete_world_card(
        &self,
        card_id: CardId,
    ) -> Result<WorldChangeEvent, SessionError> {
        let current = self.store.get_world_card(self.game_id, card_id).await?;
        if current.locked {
            return Err(SessionError::CardLocked {
                title: current.title,
            });
        }
        Ok(self.store.delete_world_card(self.game_id, card_id, None).await?)
    }

    /// Flip the lock latch itself. This is the one edit a locked card
    /// accepts, otherwise unlocking would be impossible.
    pub async fn set_world_card_locked(
        &self,
        card_id: CardId,
        locked: bool,
    ) -> Result<(WorldCard, WorldChangeEvent), SessionError> {
        Ok(self
            .store
            .update_world_card(self.game_id, card_id, None, move |card| card.locked = locked)
            .await?)
    }

    pub async fn get_world_card(&self, card_id: CardId) -> Result<WorldCard, SessionError> {
        Ok(self.store.get_world_card(self.game_id, card_id).await?)
    }

    pub async fn list_world_cards(&self) -> Result<Vec<WorldCard>, SessionError> {
        Ok(self.store.list_world_cards(self.game_id).await?)
    }

    // --- Characters and the hero ---

    /// Promote a roster character into an NPC card. Promoting the same
    /// character again refreshes the existing card instead of duplicating
    /// it.
    pub async fn promote_character(
        &self,
        profile: CharacterProfile,
    ) -> Result<(WorldCard, WorldChangeEvent), SessionError> {
        if let Some(existing) = self
            .store
            .find_card_for_character(self.game_id, profile.character_id)
            .await?
        {
            if existing.locked {
                return Err(SessionError::CardLocked {
                    title: existing.title,
                });
            }
            let CharacterProfile {
                name,
                description,
                avatar,
                ..
            } = profile;
            return Ok(self
                .store
                .update_world_card(self.game_id, existing.id, None, move |card| {
                    card.title = name;
                    card.content = description;
                    if avatar.is_some() {
                        card.avatar = avatar;
                    }
                })
                .await?);
        }
        let mut card = WorldCard::new(
            self.game_id,
            profile.name,
            profile.description,
            CardKind::Npc,
        )
        .with_character(profile.character_id);
        if let Some(avatar) = profile.avatar {
            card = card.with_avatar(avatar);
        }
        Ok(self.store.create_world_card(card, None).await?)
    }

    /// Create the main hero card, or refresh it if one already exists.
    /// The hero's memory window is pinned to always-active and the card
    /// cannot be deleted, so setup bypasses the lock latch.
    pub async fn set_main_hero(
        &self,
        profile: CharacterProfile,
    ) -> Result<(WorldCard, WorldChangeEvent), SessionError> {
        if let Some(hero) = self.store.find_main_hero(self.game_id).await? {
            let CharacterProfile {
                name,
                description,
                avatar,
                ..
            } = profile;
            return Ok(self
                .store
                .update_world_card(self.game_id, hero.id, None, move |card| {
                    card.title = name;
                    card.content = description;
                    if avatar.is_some() {
                        card.avatar = avatar;
                    }
                })
                .await?);
        }
        let mut card = WorldCard::new(
            self.game_id,
            profile.name,
            profile.description,
            CardKind::MainHero,
        )
        .with_character(profile.character_id);
        if let Some(avatar) = profile.avatar {
            card = card.with_avatar(avatar);
        }
        Ok(self.store.create_world_card(card, None).await?)
    }

    // --- Plot cards ---

    pub async fn create_plot_card(
        &self,
        mut card: PlotCard,
    ) -> Result<(PlotCard, PlotChangeEvent), SessionError> {
        card.game_id = self.game_id;
        card.source = CardSource::User;
        Ok(self.store.create_plot_card(card, None).await?)
    }

    pub async fn update_plot_card<F>(
        &self,
        card_id: PlotCardId,
        mutate: F,
    ) -> Result<(PlotCard, PlotChangeEvent), SessionError>
    where
        F: FnOnce(&mut PlotCard),
    {
        let current = self.store.get_plot_card(self.game_id, card_id).await?;
        if current.locked {
            return Err(SessionError::CardLocked {
                title: current.title,
            });
        }
        Ok(self
            .store
            .update_plot_card(self.game_id, card_id, None, mutate)
            .await?)
    }

    pub async fn delete_plot_card(
        &self,
        card_id: PlotCardId,
    ) -> Result<PlotChangeEvent, SessionError> {
        let current = self.store.get_plot_card(self.game_id, card_id).await?;
        if current.locked {
            return Err(SessionError::CardLocked {
                title: current.title,
            });
        }
        Ok(self.store.delete_plot_card(self.game_id, card_id, None).await?)
    }

    pub async fn set_plot_card_locked(
        &self,
        card_id: PlotCardId,
        locked: bool,
    ) -> Result<(PlotCard, PlotChangeEvent), SessionError> {
        Ok(self
            .store
            .update_plot_card(self.game_id, card_id, None, move |card| card.locked = locked)
            .await?)
    }

    pub async fn list_plot_cards(&self) -> Result<Vec<PlotCard>, SessionError> {
        Ok(self.store.list_plot_cards(self.game_id).await?)
    }

    // --- History and the change log ---

    pub async fn list_messages(&self) -> Result<Vec<Message>, SessionError> {
        Ok(self.store.list_messages(self.game_id).await?)
    }

    pub async fn list_world_events(&self) -> Result<Vec<WorldChangeEvent>, SessionError> {
        Ok(self.store.list_world_events(self.game_id).await?)
    }

    pub async fn list_plot_events(&self) -> Result<Vec<PlotChangeEvent>, SessionError> {
        Ok(self.store.list_plot_events(self.game_id).await?)
    }

    /// Not-yet-undone world events, optionally narrowed to one message.
    pub async fn list_open_world_events(
        &self,
        message_id: Option<MessageId>,
    ) -> Result<Vec<WorldChangeEvent>, SessionError> {
        Ok(self
            .store
            .list_open_world_events(self.game_id, message_id)
            .await?)
    }

    pub async fn list_open_plot_events(
        &self,
        message_id: Option<MessageId>,
    ) -> Result<Vec<PlotChangeEvent>, SessionError> {
        Ok(self
            .store
            .list_open_plot_events(self.game_id, message_id)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cards::MemoryWindow;
    use crate::testing::MockProvider;
    use tokio_stream::StreamExt;

    async fn session_with(provider: Arc<MockProvider>) -> GameSession {
        let store = GameStore::in_memory().await.unwrap();
        GameSession::create(
            store,
            provider,
            TurnConfig::default(),
            Game::new("The Hollow Road"),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_locked_card_refuses_user_edits() {
        let session = session_with(Arc::new(MockProvider::new())).await;
        let (card, _) = session
            .create_world_card(WorldCard::new(
                session.game_id(),
                "The Vault",
                "A sealed iron door beneath the keep.",
                CardKind::World,
            ))
            .await
            .unwrap();
        assert_eq!(card.source, CardSource::User);

        session.set_world_card_locked(card.id, true).await.unwrap();

        let update = session
            .update_world_card(card.id, |c| c.content = "Pried open.".to_string())
            .await;
        assert!(matches!(update, Err(SessionError::CardLocked { .. })));
        let delete = session.delete_world_card(card.id).await;
        assert!(matches!(delete, Err(SessionError::CardLocked { .. })));

        session.set_world_card_locked(card.id, false).await.unwrap();
        session.delete_world_card(card.id).await.unwrap();
        assert!(session.list_world_cards().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_promote_character_twice_refreshes_one_card() {
        let session = session_with(Arc::new(MockProvider::new())).await;
        let profile = CharacterProfile::new("Mira", "A smuggler with a code.");
        let character_id = profile.character_id;

        let (first, _) = session.promote_character(profile).await.unwrap();
        assert_eq!(first.kind, CardKind::Npc);
        assert_eq!(first.character_id, Some(character_id));

        let again = CharacterProfile::new("Mira", "A smuggler turned informant.")
            .with_character_id(character_id)
            .with_avatar("mira.png");
        let (second, _) = session.promote_character(again).await.unwrap();

        assert_eq!(second.id, first.id);
        assert!(second.content.contains("turned informant"));
        assert_eq!(second.avatar.as_deref(), Some("mira.png"));
        assert_eq!(session.list_world_cards().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_set_main_hero_creates_then_refreshes() {
        let session = session_with(Arc::new(MockProvider::new())).await;

        let (hero, _) = session
            .set_main_hero(CharacterProfile::new("Aldric", "A knight out of favor."))
            .await
            .unwrap();
        assert_eq!(hero.kind, CardKind::MainHero);
        assert_eq!(hero.memory_window, MemoryWindow::Always);

        let (updated, _) = session
            .set_main_hero(CharacterProfile::new("Aldric", "A knight, restored."))
            .await
            .unwrap();
        assert_eq!(updated.id, hero.id);
        assert!(updated.content.contains("restored"));

        let heroes: Vec<_> = session
            .list_world_cards()
            .await
            .unwrap()
            .into_iter()
            .filter(|c| c.is_main_hero())
            .collect();
        assert_eq!(heroes.len(), 1);
    }

    #[tokio::test]
    async fn test_send_runs_a_full_turn() {
        let provider = Arc::new(MockProvider::new());
        provider.script_turn(vec!["You step ", "into the rain."]);
        provider.script_completion(r#"{"changes":[]}"#);
        provider.script_completion("");
        let session = session_with(provider).await;

        let mut events = session
            .send("I leave the tavern.", CancellationToken::new())
            .await
            .unwrap();
        let mut saw_done = false;
        while let Some(event) = events.next().await {
            if let TurnEvent::Done { message, .. } = event {
                assert_eq!(message.content, "You step into the rain.");
                saw_done = true;
            }
        }
        assert!(saw_done);

        let messages = session.list_messages().await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "I leave the tavern.");
        assert!(messages[1].is_assistant());
    }

    #[tokio::test]
    async fn test_reroll_without_assistant_reply_is_refused() {
        let session = session_with(Arc::new(MockProvider::new())).await;
        let rerolled = session.reroll(CancellationToken::new()).await;
        assert!(matches!(rerolled, Err(SessionError::NothingToReroll)));
    }
}
