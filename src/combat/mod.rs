//! Combat system module
//!
//! Implements the dice and damage rules battles run on:
//! - Dice rolling behind a swappable [`Roller`]
//! - Attack/defense rolls and damage
//! - Critical hits (threshold and percentile models)
//! - Guard mitigation and counter damage
//! - Per-battle combatant snapshots

mod combatant;
mod dice;
mod resolver;

pub use combatant::Combatant;
pub use dice::{RandomRoller, Roller, ScriptedRoller};
pub use resolver::{
    base_damage, counter_damage, critical_damage, guarded_damage, resolve_hit, roll_attack,
    roll_defense, roll_escape, roll_initiative, BattleMode, CounterModel, CounterResolution,
    CritModel, HitResolution, ResolutionRules, Roll, Stance,
};
