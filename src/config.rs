//! Configuration loading and persistence.
//!
//! Handles reading and writing the keyper configuration file. The session
//! token itself is never part of the config file; it lives in the slot
//! store (OS keyring, or a file in test mode).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf};

use crate::constants;

/// Configuration for the keyper CLI.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
    /// Base URL of the authentication backend.
    pub server_url: String,
    /// Name of the persisted slot holding the session record.
    #[serde(default = "default_session_key")]
    pub session_key: String,
}

fn default_session_key() -> String {
    constants::SESSION_KEY.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: "https://api.keyper.dev".to_string(),
            session_key: default_session_key(),
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// Directory selection priority:
    /// 1. `#[cfg(test)]` (unit tests): `tmp/keyper-test`
    /// 2. `KEYPER_CONFIG_DIR` env var: explicit override
    /// 3. `KEYPER_ENV=test`: `tmp/keyper-test` (integration tests)
    /// 4. Default: platform config dir (macOS: ~/Library/Application Support/keyper)
    pub fn config_dir() -> Result<PathBuf> {
        let dir = {
            #[cfg(test)]
            {
                // Unit tests: use the repo's tmp/ directory (gitignored)
                PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tmp/keyper-test")
            }

            #[cfg(not(test))]
            {
                if let Ok(test_dir) = std::env::var("KEYPER_CONFIG_DIR") {
                    // Explicit override via env var
                    PathBuf::from(test_dir)
                } else if crate::env::is_test_mode() {
                    // Integration tests (KEYPER_ENV=test): use the repo's tmp/ directory
                    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tmp/keyper-test")
                } else {
                    // Production: use platform-standard config directory
                    dirs::config_dir()
                        .context("Could not determine config directory")?
                        .join("keyper")
                }
            }
        };
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Loads configuration from file, with environment variable overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file().unwrap_or_else(|_| Self::default());
        config.apply_env_overrides();
        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let config_path = Self::config_dir()?.join("config.json");
        if config_path.exists() {
            let content = fs::read_to_string(&config_path)?;
            Ok(serde_json::from_str(&content)?)
        } else {
            anyhow::bail!("Config file not found")
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(server_url) = std::env::var("KEYPER_SERVER_URL") {
            self.server_url = server_url;
        }

        if let Ok(session_key) = std::env::var("KEYPER_SESSION_KEY") {
            self.session_key = session_key;
        }
    }

    /// Saves the configuration to disk.
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_dir()?.join("config.json");
        fs::write(&config_path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("writing {}", config_path.display()))?;
        Ok(())
    }
}
