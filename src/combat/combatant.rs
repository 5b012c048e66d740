//! Per-battle combatant snapshot
//!
//! A battle copies each participant's stats out of the character store when
//! it starts. All HP arithmetic during the battle happens on this snapshot.

use serde::{Deserialize, Serialize};

use crate::characters::CharacterRecord;

/// Combat stats of one participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Combatant {
    /// Character id
    pub id: String,
    /// Display name
    pub name: String,
    /// Current hit points
    pub hp: i32,
    /// Maximum hit points
    pub max_hp: i32,
    pub attack: i32,
    pub defense: i32,
    pub agility: i32,
    pub luck: i32,
}

impl Combatant {
    /// Create a combatant with the given stats and full HP
    pub fn new(id: &str, attack: i32, defense: i32, agility: i32, luck: i32, max_hp: i32) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            hp: max_hp,
            max_hp,
            attack,
            defense,
            agility,
            luck,
        }
    }

    /// Check if the combatant is down
    pub fn is_dead(&self) -> bool {
        self.hp <= 0
    }

    /// Take damage, clamping HP at zero. Returns the HP actually lost.
    pub fn take_damage(&mut self, amount: i32) -> i32 {
        let lost = amount.max(0).min(self.hp.max(0));
        self.hp = (self.hp - amount.max(0)).max(0);
        lost
    }

    /// Heal (cannot exceed max_hp). Returns the HP actually restored.
    pub fn heal(&mut self, amount: i32) -> i32 {
        let actual = amount.max(0).min((self.max_hp - self.hp).max(0));
        self.hp += actual;
        actual
    }
}

impl From<&CharacterRecord> for Combatant {
    fn from(record: &CharacterRecord) -> Self {
        let max_hp = record.max_hp();
        Self {
            id: record.id.clone(),
            name: record.name.clone(),
            hp: record.hp.clamp(0, max_hp),
            max_hp,
            attack: record.attack,
            defense: record.defense,
            agility: record.agility,
            luck: record.luck,
        }
    }
}
