//! Character repository
//!
//! Battles read character stats and write back HP and inventory through the
//! [`CharacterRepository`] contract. The real backing store lives outside
//! this crate; [`MemoryCharacterStore`] is the in-process implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

/// Base HP before vitality
pub const BASE_HP: i32 = 100;
/// Extra max HP per vitality point
pub const HP_PER_VITALITY: i32 = 10;

/// Repository errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("character not found: {0}")]
    NotFound(String),

    #[error("character store error: {0}")]
    Backend(String),
}

/// A character sheet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacterRecord {
    pub id: String,
    pub name: String,
    #[serde(alias = "HP")]
    pub hp: i32,
    #[serde(default)]
    pub attack: i32,
    #[serde(default)]
    pub defense: i32,
    #[serde(default)]
    pub agility: i32,
    #[serde(default)]
    pub luck: i32,
    #[serde(default)]
    pub vitality: i32,
    /// Inventory; stored either as a list or a comma separated string
    #[serde(default, deserialize_with = "items_from_list_or_string")]
    pub items: Vec<String>,
}

impl CharacterRecord {
    /// Create a character with zeroed stats and full base HP
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            hp: BASE_HP,
            attack: 0,
            defense: 0,
            agility: 0,
            luck: 0,
            vitality: 0,
            items: Vec::new(),
        }
    }

    /// Maximum HP: 100 + vitality x 10
    pub fn max_hp(&self) -> i32 {
        BASE_HP + self.vitality * HP_PER_VITALITY
    }

    /// Inventory with one copy of `item` removed, if present
    pub fn items_without_one(&self, item: &str) -> Option<Vec<String>> {
        let pos = self.items.iter().position(|i| i == item)?;
        let mut items = self.items.clone();
        items.remove(pos);
        Some(items)
    }

    /// Apply a partial update in place
    pub fn apply(&mut self, update: &CharacterUpdate) {
        if let Some(ref name) = update.name {
            self.name = name.clone();
        }
        if let Some(hp) = update.hp {
            self.hp = hp;
        }
        if let Some(attack) = update.attack {
            self.attack = attack;
        }
        if let Some(defense) = update.defense {
            self.defense = defense;
        }
        if let Some(agility) = update.agility {
            self.agility = agility;
        }
        if let Some(luck) = update.luck {
            self.luck = luck;
        }
        if let Some(vitality) = update.vitality {
            self.vitality = vitality;
        }
        if let Some(ref items) = update.items {
            self.items = items.clone();
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ItemList {
    List(Vec<String>),
    Delimited(String),
}

fn items_from_list_or_string<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match ItemList::deserialize(deserializer)? {
        ItemList::List(items) => items,
        ItemList::Delimited(s) => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
    })
}

/// Partial character update; `None` fields are left untouched
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacterUpdate {
    pub name: Option<String>,
    pub hp: Option<i32>,
    pub attack: Option<i32>,
    pub defense: Option<i32>,
    pub agility: Option<i32>,
    pub luck: Option<i32>,
    pub vitality: Option<i32>,
    pub items: Option<Vec<String>>,
}

impl CharacterUpdate {
    /// Update only HP
    pub fn hp(hp: i32) -> Self {
        Self {
            hp: Some(hp),
            ..Self::default()
        }
    }

    /// Also replace the inventory
    pub fn with_items(mut self, items: Vec<String>) -> Self {
        self.items = Some(items);
        self
    }
}

/// Lookup and update of character sheets
#[async_trait]
pub trait CharacterRepository: Send + Sync {
    /// Find a character by id
    async fn find_user(&self, id: &str) -> Result<Option<CharacterRecord>, RepositoryError>;

    /// Apply a partial update to a character
    async fn update_user(&self, id: &str, update: CharacterUpdate) -> Result<(), RepositoryError>;

    /// Set a character's HP
    async fn update_user_hp(&self, id: &str, hp: i32) -> Result<(), RepositoryError> {
        self.update_user(id, CharacterUpdate::hp(hp)).await
    }
}

/// In-memory character store
#[derive(Debug, Default)]
pub struct MemoryCharacterStore {
    records: RwLock<HashMap<String, CharacterRecord>>,
    offline: AtomicBool,
}

impl MemoryCharacterStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shared instance
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Insert or replace a character
    pub async fn insert(&self, record: CharacterRecord) {
        self.records.write().await.insert(record.id.clone(), record);
    }

    /// Load characters from a JSON array
    pub async fn load_json(&self, json: &str) -> Result<usize, RepositoryError> {
        let records: Vec<CharacterRecord> =
            serde_json::from_str(json).map_err(|e| RepositoryError::Backend(e.to_string()))?;
        let count = records.len();
        let mut map = self.records.write().await;
        for record in records {
            map.insert(record.id.clone(), record);
        }
        debug!("Loaded {} characters", count);
        Ok(count)
    }

    /// Simulate a backend outage: every call fails while offline
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<(), RepositoryError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(RepositoryError::Backend("store offline".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CharacterRepository for MemoryCharacterStore {
    async fn find_user(&self, id: &str) -> Result<Option<CharacterRecord>, RepositoryError> {
        self.check_online()?;
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn update_user(&self, id: &str, update: CharacterUpdate) -> Result<(), RepositoryError> {
        self.check_online()?;
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| RepositoryError::NotFound(id.to_string()))?;
        record.apply(&update);
        Ok(())
    }
}
