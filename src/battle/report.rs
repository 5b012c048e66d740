//! Battle reports
//!
//! Typed results of engine operations. The chat-facing text is their
//! `Display` rendering.

use std::fmt;

use serde::Serialize;

use super::potion::PotionSize;
use super::session::{EndReason, Resolution, Teams, TurnModel};
use crate::combat::{BattleMode, HitResolution, Roll};

/// One resolved attack
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttackReport {
    pub attacker: String,
    pub attacker_name: String,
    /// Participant the attack was aimed at
    pub target: String,
    /// Participant that actually took the hit (a guardian may step in)
    pub defender: String,
    pub defender_name: String,
    pub hit: HitResolution,
    pub defender_hp: i32,
    pub defender_max_hp: i32,
    pub attacker_hp: i32,
}

impl AttackReport {
    /// Whether a guardian took the hit for the target
    pub fn redirected(&self) -> bool {
        self.target != self.defender
    }
}

/// One potion use
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealReport {
    pub actor: String,
    pub target: String,
    pub target_name: String,
    pub size: PotionSize,
    /// HP actually restored
    pub healed: i32,
    pub hp: i32,
    pub max_hp: i32,
}

/// Something that happened during an action
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BattleEvent {
    Hit(AttackReport),
    Guard { actor: String, covering: Option<String> },
    Counter { actor: String },
    Queued { actor: String, target: String },
    ForcedDefend { actor: String },
    Fled { actor: String, escape: Roll, chase: Roll },
    FleeFailed { actor: String, escape: Roll, chase: Roll },
    Healed(HealReport),
    Eliminated { id: String, name: String },
    RoundStarted { round: u32 },
}

/// Result of an in-battle action
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionReport {
    pub session_id: String,
    pub thread_id: String,
    /// Everyone to tag in the reply
    pub mentions: Vec<String>,
    pub events: Vec<BattleEvent>,
    /// Whose turn it is now (sequential model)
    pub next_turn: Option<String>,
    pub round: u32,
    pub resolution: Option<Resolution>,
}

impl ActionReport {
    /// Attack reports in resolution order
    pub fn hits(&self) -> impl Iterator<Item = &AttackReport> {
        self.events.iter().filter_map(|e| match e {
            BattleEvent::Hit(report) => Some(report),
            _ => None,
        })
    }

    pub fn is_finished(&self) -> bool {
        self.resolution.is_some()
    }
}

/// Result of starting a battle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartReport {
    pub session_id: String,
    pub thread_id: String,
    pub participants: Vec<String>,
    pub teams: Option<Teams>,
    pub turn_order: Vec<String>,
    pub first_turn: Option<String>,
    pub turn_model: TurnModel,
    pub mode: BattleMode,
    /// Initiative roll of every participant, in input order
    pub initiative: Vec<(String, Roll)>,
}

/// Result of an HP check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HpReport {
    pub id: String,
    pub name: String,
    pub hp: i32,
    pub max_hp: i32,
    pub in_battle: bool,
}

impl fmt::Display for AttackReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hit = &self.hit;
        write!(
            f,
            "{} attacks {} ({} vs {})",
            self.attacker_name, self.target, hit.attack.total, hit.defense.total
        )?;
        if self.redirected() {
            write!(f, ", {} takes the blow", self.defender_name)?;
        }
        if hit.critical {
            write!(f, ", critical hit!")?;
        }
        if hit.guarded {
            write!(f, ", guarded")?;
        }
        write!(
            f,
            ": {} damage, {} HP {}/{}",
            hit.damage, self.defender_name, self.defender_hp, self.defender_max_hp
        )?;
        if let Some(counter) = hit.counter {
            write!(
                f,
                ". {} counters ({} vs {}) for {} damage, {} HP {}",
                self.defender_name,
                counter.attack.total,
                counter.defense.total,
                counter.damage,
                self.attacker_name,
                self.attacker_hp
            )?;
        }
        Ok(())
    }
}

impl fmt::Display for HealReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} uses a {} on {}: +{} HP ({}/{})",
            self.actor, self.size, self.target_name, self.healed, self.hp, self.max_hp
        )
    }
}

impl fmt::Display for BattleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BattleEvent::Hit(report) => write!(f, "{}", report),
            BattleEvent::Guard { actor, covering: Some(ally) } => {
                write!(f, "{} stands guard over {}", actor, ally)
            }
            BattleEvent::Guard { actor, covering: None } => write!(f, "{} raises their guard", actor),
            BattleEvent::Counter { actor } => write!(f, "{} readies a counter", actor),
            BattleEvent::Queued { actor, target } => {
                write!(f, "{} will attack {} when the round resolves", actor, target)
            }
            BattleEvent::ForcedDefend { actor } => {
                write!(f, "{} ran out of time and defends", actor)
            }
            BattleEvent::Fled { actor, escape, chase } => {
                write!(f, "{} escapes ({} vs {})", actor, escape.total, chase.total)
            }
            BattleEvent::FleeFailed { actor, escape, chase } => {
                write!(f, "{} fails to escape ({} vs {})", actor, escape.total, chase.total)
            }
            BattleEvent::Healed(report) => write!(f, "{}", report),
            BattleEvent::Eliminated { name, .. } => write!(f, "{} is defeated!", name),
            BattleEvent::RoundStarted { round } => write!(f, "Round {} begins", round),
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.reason, self.winner) {
            (EndReason::Fled { actor }, _) => write!(f, "Battle over: {} fled", actor),
            (EndReason::Stopped { gm }, _) => write!(f, "Battle stopped by {}", gm),
            (EndReason::HpTotal { a, b }, None) => {
                write!(f, "Time is up! Remaining HP {} vs {}: a draw", a, b)
            }
            (EndReason::HpTotal { a, b }, Some(side)) => write!(
                f,
                "Time is up! Remaining HP {} vs {}: {} wins ({})",
                a,
                b,
                side,
                self.winners.join(", ")
            ),
            (EndReason::Defeat, Some(side)) => {
                write!(f, "Battle over: {} wins ({})", side, self.winners.join(", "))
            }
            (EndReason::Defeat, None) => write!(f, "Battle over"),
        }
    }
}

impl fmt::Display for ActionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut lines: Vec<String> = self.events.iter().map(|e| e.to_string()).collect();
        if let Some(ref resolution) = self.resolution {
            lines.push(resolution.to_string());
        } else if let Some(ref next) = self.next_turn {
            lines.push(format!("Next turn: {}", next));
        }
        write!(f, "{}", lines.join("\n"))
    }
}

impl fmt::Display for StartReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.teams {
            Some(ref teams) => writeln!(
                f,
                "Battle start! {} vs {}",
                teams.a.join(", "),
                teams.b.join(", ")
            )?,
            None => writeln!(f, "Battle start! {}", self.participants.join(" vs "))?,
        }
        let rolls: Vec<String> = self
            .initiative
            .iter()
            .map(|(id, roll)| format!("{} {}", id, roll.total))
            .collect();
        writeln!(f, "Initiative: {}", rolls.join(", "))?;
        write!(f, "Turn order: {}", self.turn_order.join(" > "))?;
        if let Some(ref first) = self.first_turn {
            write!(f, "\n{} goes first", first)?;
        }
        Ok(())
    }
}

impl fmt::Display for HpReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} HP {}/{}", self.name, self.hp, self.max_hp)
    }
}
