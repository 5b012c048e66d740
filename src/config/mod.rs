//! Configuration
//!
//! Layered in precedence order: compiled defaults, then an optional TOML
//! file, then `SKIRMISH_` environment variables. Nested keys use `__`,
//! e.g. `SKIRMISH_TIMER__TURN_TIMEOUT_SECS=120`.

use std::path::Path;

use anyhow::Result;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::battle::{EngineSettings, PotionTable, TurnModel};
use crate::combat::BattleMode;
use crate::timers::TimerSettings;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "SKIRMISH_";

/// Default rules for battles that do not choose their own
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BattleDefaults {
    pub turn_model: TurnModel,
    pub mode: BattleMode,
}

/// Daemon configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub timer: TimerSettings,
    pub potions: PotionTable,
    pub battle: BattleDefaults,
}

impl Config {
    /// Load defaults, an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Ok(Self::figment(path).extract()?)
    }

    /// The layered provider, exposed so callers can merge more sources
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Engine settings derived from this configuration
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            potions: self.potions,
            turn_model: self.battle.turn_model,
            mode: self.battle.mode,
        }
    }
}
