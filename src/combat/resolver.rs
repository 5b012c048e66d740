//! Combat resolution
//!
//! Pure roll and damage math:
//! - Attack/defense rolls (stat + d20)
//! - Critical hits (two distinct models, see [`CritModel`])
//! - Guard mitigation (half damage, rounded up)
//! - Counter damage (two distinct models, see [`CounterModel`])
//!
//! Nothing here touches a session. Callers decide which stances are live and
//! apply the resulting damage themselves.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::combatant::Combatant;
use super::dice::Roller;

/// A d20 roll plus the stat it was added to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roll {
    /// The raw die result
    pub roll: u32,
    /// Stat + roll
    pub total: i32,
}

impl Roll {
    fn new(stat: i32, roll: u32) -> Self {
        Self {
            roll,
            total: stat + roll as i32,
        }
    }
}

/// attack + d20
pub fn roll_attack(attacker: &Combatant, roller: &mut dyn Roller) -> Roll {
    Roll::new(attacker.attack, roller.d20())
}

/// defense + d20
pub fn roll_defense(defender: &Combatant, roller: &mut dyn Roller) -> Roll {
    Roll::new(defender.defense, roller.d20())
}

/// agility + d20, used for turn order
pub fn roll_initiative(combatant: &Combatant, roller: &mut dyn Roller) -> Roll {
    Roll::new(combatant.agility, roller.d20())
}

/// luck + agility + d20, used by the fleeing side
pub fn roll_escape(combatant: &Combatant, roller: &mut dyn Roller) -> Roll {
    Roll::new(combatant.luck + combatant.agility, roller.d20())
}

/// Critical hit model.
///
/// The two models give different results for identical inputs and are tied
/// to the battle mode that selects them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CritModel {
    /// Crit when the attack d20 reaches `max(20 - luck/2, 2)`
    Threshold,
    /// Crit when a d100 lands at or under `min(luck/2, 50)`
    Percentile,
}

impl CritModel {
    /// Lowest attack roll that crits under the threshold model
    pub fn threshold(luck: i32) -> i32 {
        (20 - luck.div_euclid(2)).max(2)
    }

    /// Crit chance in percent under the percentile model
    pub fn chance(luck: i32) -> i32 {
        luck.div_euclid(2).min(50)
    }

    /// Decide whether an attack crits.
    ///
    /// The percentile model always consumes one d100 from the roller.
    pub fn check(self, luck: i32, attack_roll: u32, roller: &mut dyn Roller) -> bool {
        match self {
            CritModel::Threshold => attack_roll as i32 >= Self::threshold(luck),
            CritModel::Percentile => roller.d100() as i32 <= Self::chance(luck),
        }
    }
}

/// Counter damage model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterModel {
    /// The defender deals the full counter difference
    Full,
    /// The defender deals half the counter difference (rounded down)
    Halved,
}

impl CounterModel {
    /// Apply this model to a raw counter difference
    pub fn apply(self, damage: i32) -> i32 {
        match self {
            CounterModel::Full => damage,
            CounterModel::Halved => damage / 2,
        }
    }
}

/// Crit and counter models used together by one battle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionRules {
    pub crit: CritModel,
    pub counter: CounterModel,
}

impl ResolutionRules {
    /// Player-versus-player rules
    pub const PVP: ResolutionRules = ResolutionRules {
        crit: CritModel::Threshold,
        counter: CounterModel::Full,
    };

    /// Dungeon rules
    pub const DUNGEON: ResolutionRules = ResolutionRules {
        crit: CritModel::Percentile,
        counter: CounterModel::Halved,
    };
}

/// Battle mode, selecting a rule set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BattleMode {
    #[default]
    Pvp,
    Dungeon,
}

impl BattleMode {
    /// Rules for this mode
    pub fn rules(self) -> ResolutionRules {
        match self {
            BattleMode::Pvp => ResolutionRules::PVP,
            BattleMode::Dungeon => ResolutionRules::DUNGEON,
        }
    }
}

impl FromStr for BattleMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pvp" | "duel" => Ok(BattleMode::Pvp),
            "dungeon" | "pve" => Ok(BattleMode::Dungeon),
            _ => Err(()),
        }
    }
}

/// max(attack total - defense total, 0)
pub fn base_damage(attack_total: i32, defense_total: i32) -> i32 {
    (attack_total - defense_total).max(0)
}

/// Damage x1.5, truncated toward zero
pub fn critical_damage(damage: i32) -> i32 {
    damage * 3 / 2
}

/// Half damage, rounded up
pub fn guarded_damage(damage: i32) -> i32 {
    if damage <= 0 {
        0
    } else {
        (damage + 1) / 2
    }
}

/// Counter damage dealt back to an attacker
pub fn counter_damage(counter_total: i32, attacker_defense_total: i32, model: CounterModel) -> i32 {
    model.apply(base_damage(counter_total, attacker_defense_total))
}

/// Stances live on the defender for one incoming hit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stance {
    /// Guard is available to halve this hit
    pub guarded: bool,
    /// Counter is available to answer this hit
    pub countering: bool,
}

/// Result of a counter attack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterResolution {
    /// Defender's attack roll
    pub attack: Roll,
    /// Attacker's defense roll
    pub defense: Roll,
    /// Damage dealt back to the attacker
    pub damage: i32,
}

/// Result of one attack against one defender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HitResolution {
    pub attack: Roll,
    pub defense: Roll,
    /// Whether the attack crit
    pub critical: bool,
    /// Whether the defender's guard was spent on this hit
    pub guarded: bool,
    /// Damage before crit and guard
    pub base_damage: i32,
    /// Damage the defender takes
    pub damage: i32,
    /// Counter attack, if the defender's counter fired
    pub counter: Option<CounterResolution>,
}

impl HitResolution {
    /// Whether the hit did any damage
    pub fn connected(&self) -> bool {
        self.base_damage > 0
    }
}

/// Resolve one attack.
///
/// Dice are consumed in a fixed order: attack d20, defense d20, crit d100
/// (percentile model only), then counter attack d20 and attacker defense d20
/// when a counter fires. A guard only halves a hit that connects. A
/// counter fires only when the hit connects and the defender survives it.
pub fn resolve_hit(
    attacker: &Combatant,
    defender: &Combatant,
    stance: Stance,
    rules: ResolutionRules,
    roller: &mut dyn Roller,
) -> HitResolution {
    let attack = roll_attack(attacker, roller);
    let defense = roll_defense(defender, roller);
    let critical = rules.crit.check(attacker.luck, attack.roll, roller);

    let base = base_damage(attack.total, defense.total);
    let mut damage = if critical { critical_damage(base) } else { base };

    let guarded = stance.guarded && base > 0;
    if guarded {
        damage = guarded_damage(damage);
    }

    let survives = defender.hp - damage > 0;
    let counter = if stance.countering && base > 0 && survives {
        let counter_attack = roll_attack(defender, roller);
        let attacker_defense = roll_defense(attacker, roller);
        Some(CounterResolution {
            attack: counter_attack,
            defense: attacker_defense,
            damage: counter_damage(counter_attack.total, attacker_defense.total, rules.counter),
        })
    } else {
        None
    };

    HitResolution {
        attack,
        defense,
        critical,
        guarded,
        base_damage: base,
        damage,
        counter,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combat::dice::ScriptedRoller;

    fn fighter(id: &str, attack: i32, defense: i32, luck: i32) -> Combatant {
        Combatant::new(id, attack, defense, 5, luck, 100)
    }

    #[test]
    fn test_plain_hit() {
        // attack 10 + 15 = 25 vs defense 10 + 5 = 15
        let attacker = fighter("a", 10, 10, 0);
        let defender = fighter("d", 10, 10, 0);
        let mut roller = ScriptedRoller::new([15, 5]);

        let hit = resolve_hit(&attacker, &defender, Stance::default(), ResolutionRules::PVP, &mut roller);
        assert_eq!(hit.attack.total, 25);
        assert_eq!(hit.defense.total, 15);
        assert!(!hit.critical);
        assert!(!hit.guarded);
        assert_eq!(hit.damage, 10);
        assert!(hit.counter.is_none());
    }

    #[test]
    fn test_damage_never_negative() {
        assert_eq!(base_damage(5, 30), 0);
        let attacker = fighter("a", 0, 10, 0);
        let defender = fighter("d", 10, 40, 0);
        let mut roller = ScriptedRoller::new([1, 20]);
        let hit = resolve_hit(&attacker, &defender, Stance { guarded: true, countering: true }, ResolutionRules::PVP, &mut roller);
        assert_eq!(hit.damage, 0);
        assert!(!hit.guarded, "guard is not spent on a miss");
        assert!(hit.counter.is_none(), "counter needs a connecting hit");
    }

    #[test]
    fn test_crit_threshold() {
        assert_eq!(CritModel::threshold(0), 20);
        assert_eq!(CritModel::threshold(7), 17);
        assert_eq!(CritModel::threshold(36), 2);
        assert_eq!(CritModel::threshold(100), 2);
        // floor division for negative luck
        assert_eq!(CritModel::threshold(-1), 21);
    }

    #[test]
    fn test_crit_chance() {
        assert_eq!(CritModel::chance(0), 0);
        assert_eq!(CritModel::chance(9), 4);
        assert_eq!(CritModel::chance(100), 50);
        assert_eq!(CritModel::chance(250), 50);
    }

    #[test]
    fn test_threshold_crit_multiplies_and_truncates() {
        // luck 10 -> threshold 15; roll 15 crits
        let attacker = fighter("a", 10, 10, 10);
        let defender = fighter("d", 10, 10, 0);
        let mut roller = ScriptedRoller::new([15, 4]);
        let hit = resolve_hit(&attacker, &defender, Stance::default(), ResolutionRules::PVP, &mut roller);
        assert!(hit.critical);
        assert_eq!(hit.base_damage, 11);
        assert_eq!(hit.damage, 16); // 11 * 1.5 = 16.5 -> 16
    }

    #[test]
    fn test_models_differ_for_same_inputs() {
        // Same attack/defense rolls, luck 10: threshold crits on 15,
        // percentile (5% chance) misses on a d100 of 50.
        let attacker = fighter("a", 10, 10, 10);
        let defender = fighter("d", 10, 10, 0);

        let mut roller = ScriptedRoller::new([15, 5]);
        let a = resolve_hit(&attacker, &defender, Stance::default(), ResolutionRules::PVP, &mut roller);

        let mut roller = ScriptedRoller::new([15, 5, 50]);
        let b = resolve_hit(&attacker, &defender, Stance::default(), ResolutionRules::DUNGEON, &mut roller);

        assert!(a.critical);
        assert!(!b.critical);
        assert_ne!(a.damage, b.damage);
    }

    #[test]
    fn test_percentile_crit() {
        let attacker = fighter("a", 10, 10, 20); // 10% chance
        let defender = fighter("d", 10, 10, 0);
        let mut roller = ScriptedRoller::new([10, 10, 10]);
        let hit = resolve_hit(&attacker, &defender, Stance::default(), ResolutionRules::DUNGEON, &mut roller);
        assert!(hit.critical);
        assert_eq!(hit.damage, 0);
    }

    #[test]
    fn test_guard_rounds_up() {
        assert_eq!(guarded_damage(10), 5);
        assert_eq!(guarded_damage(11), 6);
        assert_eq!(guarded_damage(1), 1);
        assert_eq!(guarded_damage(0), 0);

        let attacker = fighter("a", 10, 10, 0);
        let defender = fighter("d", 10, 10, 0);
        let mut roller = ScriptedRoller::new([16, 5]);
        let hit = resolve_hit(&attacker, &defender, Stance { guarded: true, countering: false }, ResolutionRules::PVP, &mut roller);
        assert!(hit.guarded);
        assert_eq!(hit.base_damage, 11);
        assert_eq!(hit.damage, 6);
    }

    #[test]
    fn test_counter_models() {
        let attacker = fighter("a", 10, 10, 0);
        let defender = fighter("d", 20, 10, 0);
        let stance = Stance { guarded: false, countering: true };

        // hit: 25 vs 15; counter: 20 + 18 = 38 vs 10 + 3 = 13 -> 25
        let mut roller = ScriptedRoller::new([15, 5, 18, 3]);
        let full = resolve_hit(&attacker, &defender, stance, ResolutionRules::PVP, &mut roller);
        assert_eq!(full.counter.map(|c| c.damage), Some(25));

        let mut roller = ScriptedRoller::new([15, 5, 99, 18, 3]);
        let halved = resolve_hit(&attacker, &defender, stance, ResolutionRules::DUNGEON, &mut roller);
        assert_eq!(halved.counter.map(|c| c.damage), Some(12));
    }

    #[test]
    fn test_dead_defender_does_not_counter() {
        let attacker = fighter("a", 10, 10, 0);
        let mut defender = fighter("d", 20, 10, 0);
        defender.hp = 5;
        let mut roller = ScriptedRoller::new([15, 5, 18, 3]);
        let hit = resolve_hit(&attacker, &defender, Stance { guarded: false, countering: true }, ResolutionRules::PVP, &mut roller);
        assert_eq!(hit.damage, 10);
        assert!(hit.counter.is_none());
        assert_eq!(roller.remaining(), 2);
    }

    #[test]
    fn test_battle_mode_parsing() {
        assert_eq!("PvP".parse::<BattleMode>(), Ok(BattleMode::Pvp));
        assert_eq!("dungeon".parse::<BattleMode>(), Ok(BattleMode::Dungeon));
        assert!("arena".parse::<BattleMode>().is_err());
        assert_eq!(BattleMode::Dungeon.rules(), ResolutionRules::DUNGEON);
    }
}
