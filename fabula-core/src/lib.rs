//! Story engine with an AI narrator and a card-based living world.
//!
//! This crate provides:
//! - World and plot cards with trigger phrases and turn-relative memory windows
//! - A streaming turn runtime over any text generation backend
//! - An append-only change log with snapshot-based undo and whole-turn rollback
//! - SQLite persistence for games, messages, cards, events, and scenario counters
//!
//! # Quick Start
//!
//! ```ignore
//! use fabula_core::{
//!     CharacterProfile, EngineConfig, Game, GameSession, GameStore, TextGenProvider, TurnEvent,
//! };
//! use std::sync::Arc;
//! use tokio_stream::StreamExt;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EngineConfig::from_env();
//!     let store = GameStore::open("stories.db").await?;
//!     let provider = Arc::new(TextGenProvider::from_config(&config.provider)?);
//!
//!     let session = GameSession::create(
//!         store,
//!         provider,
//!         config.turn,
//!         Game::new("The Hollow Road"),
//!     )
//!     .await?;
//!     session
//!         .set_main_hero(CharacterProfile::new("Aldric", "A knight out of favor."))
//!         .await?;
//!
//!     let mut events = session
//!         .send("I leave the tavern at dusk.", CancellationToken::new())
//!         .await?;
//!     while let Some(event) = events.next().await {
//!         if let TurnEvent::Chunk { delta, .. } = event {
//!             print!("{delta}");
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod cards;
pub mod changelog;
pub mod config;
pub mod context;
pub mod error;
pub mod extract;
pub mod game;
pub mod ids;
pub mod provider;
pub mod session;
pub mod store;
pub mod testing;
pub mod turn;
pub mod undo;

// Primary public API
pub use cards::{CardKind, CardSource, MemoryWindow, PlotCard, WorldCard};
pub use changelog::{ChangeAction, PlotChangeEvent, WorldChangeEvent};
pub use config::{EngineConfig, ProviderConfig, TurnConfig};
pub use error::{ErrorKind, SessionError};
pub use game::{Game, Message, MessageRole};
pub use provider::{StoryProvider, TextGenProvider};
pub use session::{CharacterProfile, GameSession};
pub use store::{GameStore, RateOutcome, ScenarioStats, StoreError, ViewOutcome};
pub use turn::{TurnEvent, TurnInput, TurnRuntime};
pub use undo::{RollbackReport, UndoEngine, UndoOutcome};
