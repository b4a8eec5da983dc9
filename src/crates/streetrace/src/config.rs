//! Configuration for the streetrace CLI.
//!
//! Dual-location TOML configuration:
//! - User-level: `~/.config/streetrace/config.toml`
//! - Project-level: `./.streetrace/config.toml`
//!
//! Project-level values override user-level values; both override the
//! defaults. The runtime core never reads configuration or environment
//! variables itself — everything it needs arrives through its capabilities.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Main CLI configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CliConfig {
    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Default provider/model used when a workflow declares no model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmConfig {
    /// Fallback `provider/model` id.
    pub default_model: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            default_model: "anthropic/claude-sonnet".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Tracing filter directive, e.g. "info" or "streetrace_runtime=debug".
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
        }
    }
}

impl CliConfig {
    /// Load configuration, layering project config over user config over
    /// defaults.
    pub fn load() -> anyhow::Result<CliConfig> {
        let mut config = CliConfig::default();
        if let Some(user_path) = user_config_path() {
            config = config.merged_from(&user_path)?;
        }
        config = config.merged_from(Path::new(".streetrace/config.toml"))?;
        Ok(config)
    }

    fn merged_from(self, path: &Path) -> anyhow::Result<CliConfig> {
        if !path.exists() {
            return Ok(self);
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let overlay: CliConfig = toml::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(overlay)
    }
}

fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("streetrace").join("config.toml"))
}
