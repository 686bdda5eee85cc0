//! Configuration management for WatchPrompt
//!
//! This module provides the configuration structure, its defaults, TOML file
//! loading, environment overrides and validation. A configuration is always
//! applied as a whole: the service cancels pending work and rebuilds its
//! watch pipeline from the new value.

use std::path::Path;
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TriggerError};
use crate::matcher::WatchRule;

/// Default quiet period before a pending prompt is dispatched
pub const DEFAULT_DELAY_MS: u64 = 2000;

/// Global configuration for WatchPrompt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    /// Master switch; when off no event is scheduled
    pub enabled: bool,
    /// Quiet period in milliseconds
    pub delay_ms: u64,
    /// Print a notification line for every dispatched prompt
    pub notifications: bool,
    /// How dispatched prompts are written to stdout
    pub output: OutputFormat,
    /// Also honour the workspace `.gitignore`
    pub use_gitignore: bool,
    /// Directory names ignored in addition to the built-in set
    pub ignore_dirs: Vec<String>,
    /// Command spawned per dispatch with the prompt on stdin
    pub dispatch_command: Option<Vec<String>>,
    /// Watch rules in priority order; empty means the default rule set
    pub rules: Vec<WatchRule>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human readable text (default)
    Text,
    /// One JSON object per dispatch
    Json,
    /// Single-line format
    Compact,
}

impl Default for OutputFormat {
    fn default() -> Self {
        Self::Text
    }
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delay_ms: DEFAULT_DELAY_MS,
            notifications: true,
            output: OutputFormat::Text,
            use_gitignore: true,
            ignore_dirs: Vec::new(),
            dispatch_command: None,
            rules: Vec::new(),
        }
    }
}

impl TriggerConfig {
    /// Get the quiet period as a duration
    pub fn delay_duration(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// Load and validate configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file if given, otherwise use default
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Override values with environment variables if present
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("WATCHPROMPT_ENABLED") {
            if let Ok(enabled) = val.parse::<bool>() {
                self.enabled = enabled;
            }
        }

        if let Ok(val) = std::env::var("WATCHPROMPT_DELAY_MS") {
            if let Ok(ms) = val.parse::<u64>() {
                self.delay_ms = ms;
            }
        }

        if let Ok(val) = std::env::var("WATCHPROMPT_NOTIFICATIONS") {
            if let Ok(on) = val.parse::<bool>() {
                self.notifications = on;
            }
        }

        self
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        for rule in &self.rules {
            rule.compile()?;
        }

        if let Some(command) = &self.dispatch_command {
            if command.first().map_or(true, |program| program.trim().is_empty()) {
                return Err(TriggerError::Config(
                    "dispatch_command must name a program".to_string(),
                ));
            }
        }

        for name in &self.ignore_dirs {
            if name.is_empty() || name.contains(['/', '\\']) {
                return Err(TriggerError::Config(format!(
                    "ignore_dirs entry must be a single directory name: `{name}`"
                )));
            }
        }

        Ok(())
    }
}
