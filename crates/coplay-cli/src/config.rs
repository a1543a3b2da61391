//! Configuration file for the Coplay CLI.

use anyhow::Context;
use coplay_core::CoplayConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Coplay configuration file
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Engine configuration
    pub coplay: CoplayConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Log level or `EnvFilter` directive
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    String::from("info")
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Read and parse the TOML file at `path`.
    ///
    /// # Errors
    /// Fails when the file is unreadable or not valid TOML for this layout.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Write the configuration to `path`, creating missing directories.
    ///
    /// # Errors
    /// Fails when the directories or the file cannot be written.
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        fs::write(path, toml::to_string_pretty(self)?)
            .with_context(|| format!("writing {}", path.display()))
    }

    /// `<config dir>/coplay/config.toml`, or a relative path without a config dir.
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .map(|dir| dir.join("coplay"))
            .unwrap_or_default()
            .join("config.toml")
    }

    /// The file at [`Config::default_path`] if there is one, defaults otherwise.
    ///
    /// # Errors
    /// As [`Config::load`] when the file exists.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();
        if path.is_file() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Check the engine settings and the log filter.
    ///
    /// # Errors
    /// Names the first invalid setting.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.coplay.validate()?;

        const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
        let level = self.logging.level.to_ascii_lowercase();
        if !level.contains('=') && !LEVELS.contains(&level.as_str()) {
            anyhow::bail!(
                "unknown log level {:?}, expected one of {} or an env-filter directive",
                self.logging.level,
                LEVELS.join(", ")
            );
        }
        Ok(())
    }
}
