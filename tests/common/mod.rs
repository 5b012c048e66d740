//! Common test utilities - BattleTest harness
//!
//! Builds an engine over an in-memory character store, an outbox notifier
//! and scripted dice. Unscripted rolls fall back to 10, so two default
//! fighters trade 0-damage hits once the script runs out.

#![allow(dead_code)]

use std::sync::Arc;

use skirmish::battle::{BattleEngine, BattleRegistry, BattleSession, EngineSettings, StartOptions, StartReport, TurnModel};
use skirmish::characters::{CharacterRecord, CharacterRepository, MemoryCharacterStore};
use skirmish::combat::{Roller, ScriptedRoller};
use skirmish::commands::{parse_line, CommandHandler};
use skirmish::notify::{Delivery, OutboxNotifier};

/// A default fighter: attack/defense 10, agility 5, luck 0, 100 HP
pub fn fighter(id: &str) -> CharacterRecord {
    let mut record = CharacterRecord::new(id, &capitalize(id));
    record.attack = 10;
    record.defense = 10;
    record.agility = 5;
    record
}

fn capitalize(id: &str) -> String {
    let mut chars = id.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

pub fn ids(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

/// Test harness around one engine
pub struct BattleTest {
    pub store: Arc<MemoryCharacterStore>,
    pub outbox: Arc<OutboxNotifier>,
    pub engine: Arc<BattleEngine>,
    pub handler: CommandHandler,
}

impl BattleTest {
    /// Harness with default fighters for `characters` and scripted dice
    pub async fn new(characters: &[&str], rolls: Vec<u32>) -> Self {
        Self::with_settings(characters, ScriptedRoller::new(rolls), EngineSettings::default()).await
    }

    /// Harness whose battles default to the simultaneous turn model
    pub async fn simultaneous(characters: &[&str], rolls: Vec<u32>) -> Self {
        let settings = EngineSettings {
            turn_model: TurnModel::Simultaneous,
            ..EngineSettings::default()
        };
        Self::with_settings(characters, ScriptedRoller::new(rolls), settings).await
    }

    pub async fn with_settings(characters: &[&str], roller: impl Roller + 'static, settings: EngineSettings) -> Self {
        let store = MemoryCharacterStore::shared();
        for id in characters {
            store.insert(fighter(id)).await;
        }
        let outbox = OutboxNotifier::shared();
        let engine = Arc::new(BattleEngine::new(BattleRegistry::shared(), store.clone(), settings).with_roller(roller));
        let handler = CommandHandler::new(engine.clone(), outbox.clone());
        Self {
            store,
            outbox,
            engine,
            handler,
        }
    }

    /// Replace a character sheet
    pub async fn put(&self, record: CharacterRecord) {
        self.store.insert(record).await;
    }

    /// Stored character sheet
    pub async fn record(&self, id: &str) -> CharacterRecord {
        self.store.find_user(id).await.unwrap().unwrap()
    }

    /// Start a battle opened by the first participant
    pub async fn start(&self, participants: &[&str]) -> StartReport {
        self.engine
            .start_battle("thread-1", participants[0], &ids(participants), StartOptions::default())
            .await
            .unwrap()
    }

    /// Snapshot of the battle a user is in
    pub async fn session_of(&self, user: &str) -> Option<BattleSession> {
        self.engine.registry().find_by_participant(user).await
    }

    /// HP of a participant inside its battle
    pub async fn battle_hp(&self, user: &str) -> i32 {
        let session = self.session_of(user).await.unwrap();
        session.combatant(user).unwrap().hp
    }

    /// Feed one chat line through the command handler
    pub async fn say(&self, line: &str) {
        let inbound = parse_line(line, "thread-1").unwrap();
        let _ = self.handler.handle_inbound(inbound).await;
    }

    /// Deliveries sent so far
    pub async fn sent(&self) -> Vec<Delivery> {
        self.outbox.drain().await
    }
}
