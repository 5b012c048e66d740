//! skirmish - turn-based battle engine for chat-driven RPG sessions
//!
//! Players exchange attacks through chat commands. A shared registry
//! arbitrates turn order, the combat rules resolve dice rolls, and a
//! background timer enforces deadlines.

pub mod battle;
pub mod characters;
pub mod combat;
pub mod commands;
pub mod config;
pub mod notify;
pub mod timers;

use std::sync::Arc;

use battle::{BattleEngine, BattleRegistry};
use characters::CharacterRepository;
use commands::CommandHandler;
use config::Config;
use notify::Notifier;
use timers::{BattleTimer, TimerHandle};

/// A wired-up battle service
pub struct App {
    config: Config,
    engine: Arc<BattleEngine>,
    handler: Arc<CommandHandler>,
    timer: Arc<BattleTimer>,
}

impl App {
    /// Wire the registry, engine, command handler and timer together
    pub fn new(config: Config, characters: Arc<dyn CharacterRepository>, notifier: Arc<dyn Notifier>) -> Self {
        let engine = Arc::new(BattleEngine::new(
            BattleRegistry::shared(),
            characters,
            config.engine_settings(),
        ));
        Self::with_engine(config, engine, notifier)
    }

    /// Wire around an existing engine (e.g. one with scripted dice)
    pub fn with_engine(config: Config, engine: Arc<BattleEngine>, notifier: Arc<dyn Notifier>) -> Self {
        let handler = Arc::new(CommandHandler::new(engine.clone(), notifier.clone()));
        let timer = BattleTimer::shared(engine.clone(), notifier, config.timer);
        Self {
            config,
            engine,
            handler,
            timer,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the engine handle
    pub fn engine(&self) -> Arc<BattleEngine> {
        self.engine.clone()
    }

    /// Get the command handler
    pub fn handler(&self) -> Arc<CommandHandler> {
        self.handler.clone()
    }

    /// Get the timer
    pub fn timer(&self) -> Arc<BattleTimer> {
        self.timer.clone()
    }

    /// Start the background timer
    pub fn start_timer(&self) -> TimerHandle {
        self.timer.clone().spawn()
    }
}
