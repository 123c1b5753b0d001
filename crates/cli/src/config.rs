use std::path::{Path, PathBuf};

use anyhow::Context;
use history::HistoryConfig;
use replay::{ReplayConfig, RevealUnit};
use serde::Deserialize;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub history: HistoryConfig,
    pub replay: ReplaySettings,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ReplaySettings {
    /// Humantime duration, e.g. "40ms".
    pub tick: String,
    pub chars_per_tick: usize,
    pub unit: RevealUnit,
    pub confirmation_hold_ticks: usize,
}

impl Default for ReplaySettings {
    fn default() -> Self {
        let defaults = ReplayConfig::default();
        Self {
            tick: humantime::format_duration(defaults.tick).to_string(),
            chars_per_tick: defaults.chars_per_tick,
            unit: defaults.unit,
            confirmation_hold_ticks: defaults.confirmation_hold_ticks,
        }
    }
}

impl ReplaySettings {
    pub fn to_replay_config(&self) -> anyhow::Result<ReplayConfig> {
        let tick = humantime::parse_duration(&self.tick)
            .with_context(|| format!("invalid replay.tick {:?}", self.tick))?;
        anyhow::ensure!(!tick.is_zero(), "replay.tick must be greater than zero");
        Ok(ReplayConfig {
            tick,
            chars_per_tick: self.chars_per_tick.max(1),
            unit: self.unit,
            confirmation_hold_ticks: self.confirmation_hold_ticks,
        })
    }
}

impl Config {
    /// Reads `path`, or `<config_dir>/threadline/config.toml` when none is
    /// given. Only the default location may be absent.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let config_path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let default = dirs::config_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("threadline")
                    .join("config.toml");
                if !default.exists() {
                    return Ok(Self::default());
                }
                default
            }
        };

        let content = std::fs::read_to_string(&config_path)
            .with_context(|| format!("failed to read config file at {}", config_path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        toml::from_str(content).map_err(|e| anyhow::anyhow!("failed to parse config file: {e}"))
    }
}
