//! Battle session state
//!
//! A [`BattleSession`] is one active encounter: who is fighting, on which
//! side, in what order, and which stances are live this round.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::combat::{BattleMode, Combatant};

/// How turns are taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnModel {
    /// One participant acts at a time, round-robin over the turn order
    #[default]
    Sequential,
    /// Everyone submits an action each round; attacks resolve together
    Simultaneous,
}

impl FromStr for TurnModel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sequential" | "turn" | "turns" => Ok(TurnModel::Sequential),
            "simultaneous" | "round" | "rounds" => Ok(TurnModel::Simultaneous),
            _ => Err(()),
        }
    }
}

/// One side of a battle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    A,
    B,
}

impl Side {
    /// The other side
    pub fn opposite(self) -> Side {
        match self {
            Side::A => Side::B,
            Side::B => Side::A,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::A => write!(f, "Team A"),
            Side::B => write!(f, "Team B"),
        }
    }
}

/// Team partition of the living participants
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Teams {
    pub a: Vec<String>,
    pub b: Vec<String>,
}

impl Teams {
    /// Split participants in half by input order
    pub fn split(participants: &[String]) -> Self {
        let half = participants.len() / 2;
        Self {
            a: participants[..half].to_vec(),
            b: participants[half..].to_vec(),
        }
    }

    /// Which team a participant is on
    pub fn side_of(&self, id: &str) -> Option<Side> {
        if self.a.iter().any(|p| p == id) {
            Some(Side::A)
        } else if self.b.iter().any(|p| p == id) {
            Some(Side::B)
        } else {
            None
        }
    }

    /// Members of one team
    pub fn members(&self, side: Side) -> &[String] {
        match side {
            Side::A => &self.a,
            Side::B => &self.b,
        }
    }

    /// Remove a participant from whichever team holds it
    pub fn remove(&mut self, id: &str) {
        self.a.retain(|p| p != id);
        self.b.retain(|p| p != id);
    }
}

/// Per-participant round state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantFlags {
    /// Guard stance is up
    pub guarded: bool,
    /// Counter stance is up
    pub countering: bool,
    /// Guard already spent on an attack this round
    pub guard_consumed: bool,
    /// Counter already spent on an attack this round
    pub counter_consumed: bool,
    /// Already submitted an action this round (simultaneous model)
    pub acted: bool,
}

/// An attack waiting for the round to resolve
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingAttack {
    pub actor: String,
    pub target: String,
}

/// Why a battle ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum EndReason {
    /// A side was wiped out
    Defeat,
    /// A participant escaped
    Fled { actor: String },
    /// The GM aborted the battle
    Stopped { gm: String },
    /// The session ran out of time and was decided on remaining HP
    HpTotal { a: i32, b: i32 },
}

/// Terminal state of a battle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    /// Winning side, or none for a draw/abort/escape
    pub winner: Option<Side>,
    /// Participants of the winning side still standing
    pub winners: Vec<String>,
    pub reason: EndReason,
}

/// Coarse state of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BattlePhase {
    /// Waiting for every living participant to act
    AwaitingActions,
    /// Waiting for this participant
    Turn(String),
    /// Battle is over
    Resolved(Option<Side>),
}

/// Options fixed at battle start
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOptions {
    /// Participant who opened the battle and may abort it
    pub gm_id: String,
    /// Whether participants are split into two targetable teams
    pub team_mode: bool,
    pub turn_model: TurnModel,
    pub mode: BattleMode,
}

/// One active battle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BattleSession {
    pub id: String,
    /// Chat thread the battle lives in
    pub thread_id: String,
    /// Everyone who started the battle, eliminated or not
    pub roster: Vec<String>,
    /// Living participants
    pub participants: Vec<String>,
    /// Stat snapshots, including eliminated participants
    pub combatants: HashMap<String, Combatant>,
    /// Starting side of every roster member
    pub sides: HashMap<String, Side>,
    /// Team partition (team mode only)
    pub teams: Option<Teams>,
    pub turn_order: Vec<String>,
    /// Participant whose turn it is (sequential model only)
    pub current_turn: Option<String>,
    pub flags: HashMap<String, ParticipantFlags>,
    /// Covered ally -> guardian taking hits in their place
    pub defend_targets: HashMap<String, String>,
    pub pending_actions: Vec<PendingAttack>,
    pub turn_model: TurnModel,
    pub mode: BattleMode,
    pub round: u32,
    pub gm_id: String,
    pub created_at: DateTime<Utc>,
    /// Last mutation of any kind
    pub last_action: DateTime<Utc>,
    /// Last action a participant took themselves
    pub last_player_action: DateTime<Utc>,
    /// Bumped on every mutation
    pub revision: u64,
    pub resolution: Option<Resolution>,
}

impl BattleSession {
    /// Build a fresh session. `turn_order` must be a permutation of the roster.
    pub fn new(
        id: String,
        thread_id: &str,
        roster: Vec<Combatant>,
        turn_order: Vec<String>,
        options: SessionOptions,
    ) -> Self {
        let now = Utc::now();
        let participants: Vec<String> = roster.iter().map(|c| c.id.clone()).collect();
        let half = participants.len() / 2;
        let sides = participants
            .iter()
            .enumerate()
            .map(|(i, p)| (p.clone(), if i < half { Side::A } else { Side::B }))
            .collect();
        let teams = options.team_mode.then(|| Teams::split(&participants));
        let flags = participants
            .iter()
            .map(|p| (p.clone(), ParticipantFlags::default()))
            .collect();
        let current_turn = match options.turn_model {
            TurnModel::Sequential => turn_order.first().cloned(),
            TurnModel::Simultaneous => None,
        };

        Self {
            id,
            thread_id: thread_id.to_string(),
            roster: participants.clone(),
            participants,
            combatants: roster.into_iter().map(|c| (c.id.clone(), c)).collect(),
            sides,
            teams,
            turn_order,
            current_turn,
            flags,
            defend_targets: HashMap::new(),
            pending_actions: Vec::new(),
            turn_model: options.turn_model,
            mode: options.mode,
            round: 1,
            gm_id: options.gm_id,
            created_at: now,
            last_action: now,
            last_player_action: now,
            revision: 0,
            resolution: None,
        }
    }

    /// Current state-machine phase
    pub fn phase(&self) -> BattlePhase {
        if let Some(ref resolution) = self.resolution {
            return BattlePhase::Resolved(resolution.winner);
        }
        match (self.turn_model, &self.current_turn) {
            (TurnModel::Sequential, Some(holder)) => BattlePhase::Turn(holder.clone()),
            _ => BattlePhase::AwaitingActions,
        }
    }

    pub fn is_team(&self) -> bool {
        self.teams.is_some()
    }

    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }

    /// Whether this id is still fighting
    pub fn is_participant(&self, id: &str) -> bool {
        self.participants.iter().any(|p| p == id)
    }

    pub fn is_turn_of(&self, id: &str) -> bool {
        self.current_turn.as_deref() == Some(id)
    }

    /// Starting side of a roster member
    pub fn side_of(&self, id: &str) -> Option<Side> {
        self.sides.get(id).copied()
    }

    /// Living members of a side
    pub fn side_members(&self, side: Side) -> Vec<String> {
        self.participants
            .iter()
            .filter(|p| self.side_of(p) == Some(side))
            .cloned()
            .collect()
    }

    /// Living participants on the other side
    pub fn opponents_of(&self, id: &str) -> Vec<String> {
        match self.side_of(id) {
            Some(side) => self.side_members(side.opposite()),
            None => Vec::new(),
        }
    }

    pub fn combatant(&self, id: &str) -> Option<&Combatant> {
        self.combatants.get(id)
    }

    pub fn combatant_mut(&mut self, id: &str) -> Option<&mut Combatant> {
        self.combatants.get_mut(id)
    }

    pub fn flags(&self, id: &str) -> ParticipantFlags {
        self.flags.get(id).copied().unwrap_or_default()
    }

    pub fn flags_mut(&mut self, id: &str) -> &mut ParticipantFlags {
        self.flags.entry(id.to_string()).or_default()
    }

    /// Drop the stances an actor set on an earlier turn
    pub fn drop_stances(&mut self, actor: &str) {
        let flags = self.flags_mut(actor);
        flags.guarded = false;
        flags.countering = false;
        self.defend_targets.retain(|_, guardian| guardian != actor);
    }

    /// Whether every living participant has acted this round
    pub fn all_acted(&self) -> bool {
        self.participants.iter().all(|p| self.flags(p).acted)
    }

    /// Start a new round.
    ///
    /// Consumed markers and acted flags always reset. In the simultaneous
    /// model stances and covers only last one round, so they reset as well.
    pub fn start_round(&mut self) {
        self.round += 1;
        let simultaneous = self.turn_model == TurnModel::Simultaneous;
        for flags in self.flags.values_mut() {
            flags.guard_consumed = false;
            flags.counter_consumed = false;
            flags.acted = false;
            if simultaneous {
                flags.guarded = false;
                flags.countering = false;
            }
        }
        if simultaneous {
            self.defend_targets.clear();
        }
    }

    /// Move the turn pointer to the next participant in turn order.
    ///
    /// Returns true when the pointer wrapped and a new round started.
    pub fn advance_turn(&mut self) -> bool {
        if self.turn_model != TurnModel::Sequential || self.turn_order.is_empty() {
            return false;
        }
        let next = match self
            .current_turn
            .as_deref()
            .and_then(|holder| self.turn_order.iter().position(|p| p == holder))
        {
            Some(idx) => (idx + 1) % self.turn_order.len(),
            None => 0,
        };
        let wrapped = next == 0;
        if wrapped {
            self.start_round();
        }
        self.current_turn = Some(self.turn_order[next].clone());
        wrapped
    }

    /// Remove a defeated participant everywhere it is referenced.
    ///
    /// If it held the turn, the turn passes on first. Returns the side that
    /// was wiped out by this removal, if any.
    pub fn eliminate(&mut self, id: &str) -> Option<Side> {
        if !self.is_participant(id) {
            return None;
        }
        if self.is_turn_of(id) && self.turn_order.len() > 1 {
            self.advance_turn();
        }

        self.participants.retain(|p| p != id);
        self.turn_order.retain(|p| p != id);
        if let Some(ref mut teams) = self.teams {
            teams.remove(id);
        }
        self.flags.remove(id);
        self.defend_targets
            .retain(|covered, guardian| covered != id && guardian != id);
        self.pending_actions
            .retain(|p| p.actor != id && p.target != id);
        if self.is_turn_of(id) {
            self.current_turn = self.turn_order.first().cloned();
        }

        let side = self.side_of(id)?;
        self.side_members(side).is_empty().then_some(side)
    }

    /// Sum of living HP per side
    pub fn hp_totals(&self) -> (i32, i32) {
        let total = |side| {
            self.side_members(side)
                .iter()
                .filter_map(|p| self.combatant(p))
                .map(|c| c.hp.max(0))
                .sum::<i32>()
        };
        (total(Side::A), total(Side::B))
    }

    /// Mark the battle over
    pub fn resolve(&mut self, winner: Option<Side>, reason: EndReason) {
        let winners = winner.map(|side| self.side_members(side)).unwrap_or_default();
        self.current_turn = None;
        self.resolution = Some(Resolution {
            winner,
            winners,
            reason,
        });
    }

    /// Verify the structural invariants of the session
    pub fn check_invariants(&self) -> Result<(), String> {
        if let Some(ref holder) = self.current_turn {
            if !self.turn_order.contains(holder) || !self.is_participant(holder) {
                return Err(format!("turn holder {} is not an active participant", holder));
            }
        }
        if let Some(ref teams) = self.teams {
            let mut members: Vec<&String> = teams.a.iter().chain(teams.b.iter()).collect();
            let mut living: Vec<&String> = self.participants.iter().collect();
            members.sort();
            living.sort();
            if members != living {
                return Err("teams do not partition the participants".to_string());
            }
        }
        if let Some(stray) = self.turn_order.iter().find(|p| !self.is_participant(p)) {
            return Err(format!("turn order retains eliminated participant {}", stray));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(ids: &[&str], team_mode: bool, turn_model: TurnModel) -> BattleSession {
        let roster = ids
            .iter()
            .map(|id| Combatant::new(id, 10, 10, 5, 0, 100))
            .collect();
        let order = ids.iter().map(|s| s.to_string()).collect();
        BattleSession::new(
            "s1".to_string(),
            "t1",
            roster,
            order,
            SessionOptions {
                gm_id: ids[0].to_string(),
                team_mode,
                turn_model,
                mode: BattleMode::Pvp,
            },
        )
    }

    #[test]
    fn test_new_session() {
        let s = session(&["a", "b", "c", "d"], true, TurnModel::Sequential);
        let teams = s.teams.as_ref().unwrap();
        assert_eq!(teams.a, vec!["a", "b"]);
        assert_eq!(teams.b, vec!["c", "d"]);
        assert_eq!(s.phase(), BattlePhase::Turn("a".to_string()));
        assert_eq!(s.opponents_of("a"), vec!["c", "d"]);
        assert!(s.check_invariants().is_ok());

        let s = session(&["a", "b"], false, TurnModel::Simultaneous);
        assert!(s.teams.is_none());
        assert_eq!(s.phase(), BattlePhase::AwaitingActions);
        assert_eq!(s.side_of("b"), Some(Side::B));
    }

    #[test]
    fn test_rotation_is_cyclic() {
        let mut s = session(&["a", "b", "c", "d"], true, TurnModel::Sequential);
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(s.current_turn.clone().unwrap());
            s.advance_turn();
        }
        assert_eq!(seen, vec!["a", "b", "c", "d"]);
        assert_eq!(s.current_turn.as_deref(), Some("a"));
        assert_eq!(s.round, 2);
    }

    #[test]
    fn test_sequential_round_keeps_stances() {
        let mut s = session(&["a", "b"], false, TurnModel::Sequential);
        s.flags_mut("b").guarded = true;
        s.flags_mut("b").guard_consumed = true;
        s.start_round();
        assert!(s.flags("b").guarded);
        assert!(!s.flags("b").guard_consumed);

        let mut s = session(&["a", "b"], false, TurnModel::Simultaneous);
        s.flags_mut("b").guarded = true;
        s.start_round();
        assert!(!s.flags("b").guarded);
    }

    #[test]
    fn test_eliminate_turn_holder() {
        let mut s = session(&["a", "b", "c", "d"], true, TurnModel::Sequential);
        s.advance_turn(); // b
        assert_eq!(s.eliminate("b"), None);
        assert_eq!(s.current_turn.as_deref(), Some("c"));
        assert_eq!(s.turn_order, vec!["a", "c", "d"]);
        assert!(s.check_invariants().is_ok());

        assert_eq!(s.eliminate("a"), Some(Side::A));
        assert!(s.check_invariants().is_ok());
    }

    #[test]
    fn test_eliminate_clears_references() {
        let mut s = session(&["a", "b", "c", "d"], true, TurnModel::Simultaneous);
        s.defend_targets.insert("a".into(), "b".into());
        s.pending_actions.push(PendingAttack { actor: "c".into(), target: "b".into() });
        s.eliminate("b");
        assert!(s.defend_targets.is_empty());
        assert!(s.pending_actions.is_empty());
        assert!(!s.flags.contains_key("b"));
        assert!(s.combatants.contains_key("b"), "snapshot kept for the final flush");
    }

    #[test]
    fn test_hp_totals_and_resolve() {
        let mut s = session(&["a", "b", "c", "d"], true, TurnModel::Sequential);
        s.combatant_mut("a").unwrap().hp = 40;
        s.combatant_mut("c").unwrap().hp = 10;
        assert_eq!(s.hp_totals(), (140, 110));

        s.resolve(Some(Side::A), EndReason::HpTotal { a: 140, b: 110 });
        assert_eq!(s.phase(), BattlePhase::Resolved(Some(Side::A)));
        assert_eq!(s.resolution.as_ref().unwrap().winners, vec!["a", "b"]);
    }

    #[test]
    fn test_turn_model_parsing() {
        assert_eq!("Simultaneous".parse::<TurnModel>(), Ok(TurnModel::Simultaneous));
        assert_eq!("turn".parse::<TurnModel>(), Ok(TurnModel::Sequential));
        assert!("chaos".parse::<TurnModel>().is_err());
    }
}
