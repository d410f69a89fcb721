//! Engine configuration. Everything has a sensible default; `from_env`
//! layers environment overrides on top for deployment, and the `with_`
//! builders cover programmatic setup and tests.

use std::path::PathBuf;
use std::time::Duration;

const ENV_DATABASE: &str = "FABULA_DATABASE";
const ENV_MODEL: &str = "FABULA_MODEL";

/// Top-level engine settings.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub database_path: Option<PathBuf>,
    pub provider: ProviderConfig,
    pub turn: TurnConfig,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read overrides from the environment. Provider endpoint settings are
    /// picked up by the textgen client itself (`TEXTGEN_BASE_URL` and
    /// friends); this only adds the engine-level knobs.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(path) = std::env::var(ENV_DATABASE) {
            config.database_path = Some(PathBuf::from(path));
        }
        if let Ok(model) = std::env::var(ENV_MODEL) {
            config.provider.model = Some(model);
        }
        config
    }

    /// Store the game database at `path` instead of in memory.
    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = Some(path.into());
        self
    }

    pub fn with_provider(mut self, provider: ProviderConfig) -> Self {
        self.provider = provider;
        self
    }

    pub fn with_turn(mut self, turn: TurnConfig) -> Self {
        self.turn = turn;
        self
    }
}

/// Text-generation endpoint overrides. `None` fields fall back to the
/// client's own environment handling and defaults.
#[derive(Debug, Clone, Default)]
pub struct ProviderConfig {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
}

impl ProviderConfig {
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// Per-turn tuning: how much context rides along and how eagerly partial
/// output is saved.
#[derive(Debug, Clone)]
pub struct TurnConfig {
    /// Save streamed output once this many new characters have arrived.
    pub persist_min_chars: usize,
    /// Save streamed output at least this often while text is arriving.
    pub persist_max_interval: Duration,
    /// How many transcript messages are carried into the prompt.
    pub history_budget: u32,
    pub max_tokens: usize,
    pub temperature: f32,
    /// Most world cards a single turn may carry.
    pub world_card_cap: usize,
    /// Most plot cards a single turn may carry.
    pub plot_card_cap: usize,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            persist_min_chars: 160,
            persist_max_interval: Duration::from_secs(2),
            history_budget: 40,
            max_tokens: 1024,
            temperature: 0.8,
            world_card_cap: 20,
            plot_card_cap: 8,
        }
    }
}

impl TurnConfig {
    pub fn with_persist_min_chars(mut self, chars: usize) -> Self {
        self.persist_min_chars = chars;
        self
    }

    pub fn with_persist_max_interval(mut self, interval: Duration) -> Self {
        self.persist_max_interval = interval;
        self
    }

    pub fn with_history_budget(mut self, messages: u32) -> Self {
        self.history_budget = messages;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_world_card_cap(mut self, cap: usize) -> Self {
        self.world_card_cap = cap;
        self
    }

    pub fn with_plot_card_cap(mut self, cap: usize) -> Self {
        self.plot_card_cap = cap;
        self
    }
}
