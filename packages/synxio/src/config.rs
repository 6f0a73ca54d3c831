use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

use crate::persistence::DEFAULT_REPLAY_BUFFER;

/// Default quiet period before a state change is broadcast.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(20);

/// Runtime configuration, loaded from the environment or built in code.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Log database URL, e.g. `sqlite://./tmp/synxio.db`.
    pub database_url: String,
    pub max_connections: u32,
    /// Quiet period applied to state changes before subscribers see them.
    pub debounce: Duration,
    /// Capacity of each stream replay channel.
    pub replay_buffer: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            max_connections: 5,
            debounce: DEFAULT_DEBOUNCE,
            replay_buffer: DEFAULT_REPLAY_BUFFER,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let defaults = Self::default();

        Ok(Self {
            database_url: env::var("SYNXIO_DATABASE_URL").unwrap_or(defaults.database_url),
            max_connections: match env::var("SYNXIO_MAX_CONNECTIONS") {
                Ok(value) => value
                    .parse()
                    .context("SYNXIO_MAX_CONNECTIONS must be a valid number")?,
                Err(_) => defaults.max_connections,
            },
            debounce: match env::var("SYNXIO_DEBOUNCE_MS") {
                Ok(value) => Duration::from_millis(
                    value
                        .parse()
                        .context("SYNXIO_DEBOUNCE_MS must be a number of milliseconds")?,
                ),
                Err(_) => defaults.debounce,
            },
            replay_buffer: defaults.replay_buffer,
        })
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_database_url(mut self, database_url: impl Into<String>) -> Self {
        self.database_url = database_url.into();
        self
    }
}
