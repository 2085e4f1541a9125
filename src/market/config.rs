//! Model agent configuration loaded from a YAML file.
//!
//! File shape:
//!
//! ```yaml
//! models:
//!   - id: gpt-5.2
//!     provider: openai
//!     model_name: gpt-5.2
//!     enabled: true
//!     strategy_profile: default
//!     max_daily_picks: 10
//!     temperature: 0.2
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// One configured model agent. `strategy` names a registered strategy
/// variant; omitted means the default ranking strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelAgentConfig {
    pub id: String,
    pub provider: String,
    pub model_name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_strategy_profile")]
    pub strategy_profile: String,
    #[serde(default = "default_max_daily_picks")]
    pub max_daily_picks: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default)]
    pub strategy: Option<String>,
}

fn default_enabled() -> bool {
    true
}

fn default_strategy_profile() -> String {
    "default".to_string()
}

fn default_max_daily_picks() -> usize {
    10
}

fn default_temperature() -> f64 {
    0.2
}

#[derive(Debug, Deserialize)]
struct ModelAgentsFile {
    #[serde(default)]
    models: Vec<ModelAgentConfig>,
}

/// Load agent configs. A missing or empty file yields no agents rather than
/// an error, so deployments without agents need no config at all.
pub fn load_model_configs(path: &Path) -> Result<Vec<ModelAgentConfig>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read model config {}", path.display()))?;
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    let file: ModelAgentsFile = serde_yaml::from_str(&raw)
        .with_context(|| format!("Failed to parse model config {}", path.display()))?;
    Ok(file.models)
}
