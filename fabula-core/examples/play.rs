//! Interactive story loop on the terminal.
//!
//! This example opens (or creates) a game in a local SQLite file, sets up
//! a main hero, and streams narrator turns as you type.
//!
//! Run with: cargo run -p fabula-core --example play
//! (Make sure .env has TEXTGEN_BASE_URL set, and TEXTGEN_API_KEY if your
//! backend wants one.)
//!
//! Commands inside the loop: `reroll` regenerates the last reply,
//! `cards` lists the world cards, `quit` exits.

use fabula_core::{
    CharacterProfile, EngineConfig, Game, GameSession, GameStore, TextGenProvider, TurnEvent,
};
use std::io::{self, Write};
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();

    let config = EngineConfig::from_env();
    let provider = match TextGenProvider::from_config(&config.provider) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Please set TEXTGEN_BASE_URL in .env");
            std::process::exit(1);
        }
    };

    let path = config
        .database_path
        .clone()
        .unwrap_or_else(|| "fabula.db".into());
    let store = GameStore::open(&path).await?;

    let session = GameSession::create(
        store,
        Arc::new(provider),
        config.turn,
        Game::new("An Evening Road")
            .with_instructions(vec!["Keep replies under three paragraphs.".to_string()]),
    )
    .await?;
    session
        .set_main_hero(CharacterProfile::new(
            "The Wanderer",
            "A traveler with a long coat and a longer memory.",
        ))
        .await?;

    println!("An Evening Road");
    println!("===============");
    println!("Type your action. `reroll`, `cards`, or `quit`.\n");

    loop {
        print!("You: ");
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        let input = input.trim();

        if input.eq_ignore_ascii_case("quit") {
            println!("The road goes on without you.");
            break;
        }
        if input.is_empty() {
            continue;
        }
        if input.eq_ignore_ascii_case("cards") {
            for card in session.list_world_cards().await? {
                println!("  [{}] {}", card.kind.as_str(), card.title);
            }
            println!();
            continue;
        }

        let turn = if input.eq_ignore_ascii_case("reroll") {
            session.reroll(CancellationToken::new()).await
        } else {
            session.send(input, CancellationToken::new()).await
        };

        match turn {
            Ok(events) => narrate(events).await?,
            Err(e) => eprintln!("\nError: {}\n", e),
        }
    }

    Ok(())
}

async fn narrate(mut events: ReceiverStream<TurnEvent>) -> io::Result<()> {
    println!();
    while let Some(event) = events.next().await {
        match event {
            TurnEvent::Start { .. } => {}
            TurnEvent::Chunk { delta, .. } => {
                print!("{}", delta);
                io::stdout().flush()?;
            }
            TurnEvent::Error { detail } => {
                eprintln!("\n[the narrator falters: {}]", detail);
            }
            TurnEvent::Done {
                world_card_events,
                plot_card_created,
                ..
            } => {
                println!("\n");
                if !world_card_events.is_empty() {
                    println!("({} world change(s) recorded)", world_card_events.len());
                }
                if plot_card_created {
                    println!("(the story digest has begun)");
                }
            }
        }
    }
    Ok(())
}
