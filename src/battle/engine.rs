//! Battle engine
//!
//! Orchestrates battle commands:
//! - Validates preconditions and computes one transition on a session snapshot
//! - Resolves combat through the combat rules
//! - Writes HP and inventory to the character store, then commits the session
//!
//! A failed store write undoes the writes already made and drops the
//! transition, so the battle stays where it was.
//!
//! Sequential battles rotate a turn pointer over the turn order. Simultaneous
//! battles collect one action per living participant, then resolve queued
//! attacks together.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use super::error::BattleError;
use super::potion::{PotionSize, PotionTable};
use super::registry::BattleRegistry;
use super::report::{ActionReport, AttackReport, BattleEvent, HealReport, HpReport, StartReport};
use super::session::{BattleSession, EndReason, PendingAttack, SessionOptions, Side, TurnModel};
use crate::characters::{CharacterRecord, CharacterRepository, CharacterUpdate, RepositoryError};
use crate::combat::{
    resolve_hit, roll_escape, roll_initiative, BattleMode, Combatant, RandomRoller, Roller, Stance,
};

/// Participant counts a battle may start with
pub const VALID_SIZES: [usize; 3] = [2, 4, 8];

/// Engine-wide defaults
#[derive(Debug, Clone, Default)]
pub struct EngineSettings {
    pub potions: PotionTable,
    pub turn_model: TurnModel,
    pub mode: BattleMode,
}

/// Per-battle start options; unset fields fall back to [`EngineSettings`]
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Split participants into two teams (implied for more than two)
    pub team: bool,
    pub turn_model: Option<TurnModel>,
    pub mode: Option<BattleMode>,
}

/// Result of drinking a potion
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PotionOutcome {
    /// Used as a battle action
    InBattle(ActionReport),
    /// Used outside any battle
    OutOfBattle(HealReport),
}

/// Report plus the HP values to persist before the session is committed
struct Applied {
    report: ActionReport,
    hp_writes: Vec<(String, i32)>,
}

/// A character store write and the update that undoes it
struct StoreWrite {
    id: String,
    update: CharacterUpdate,
    undo: CharacterUpdate,
}

impl StoreWrite {
    fn hp(id: &str, hp: i32, before: i32) -> Self {
        Self {
            id: id.to_string(),
            update: CharacterUpdate::hp(hp),
            undo: CharacterUpdate::hp(before),
        }
    }

    fn items(id: &str, items: Vec<String>, before: Vec<String>) -> Self {
        Self {
            id: id.to_string(),
            update: CharacterUpdate {
                items: Some(items),
                ..CharacterUpdate::default()
            },
            undo: CharacterUpdate {
                items: Some(before),
                ..CharacterUpdate::default()
            },
        }
    }
}

/// Battle command processor
pub struct BattleEngine {
    registry: Arc<BattleRegistry>,
    characters: Arc<dyn CharacterRepository>,
    roller: Mutex<Box<dyn Roller>>,
    /// Serializes transitions from snapshot to commit
    gate: AsyncMutex<()>,
    settings: EngineSettings,
}

impl std::fmt::Debug for BattleEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BattleEngine")
            .field("settings", &self.settings)
            .finish()
    }
}

impl BattleEngine {
    /// Create an engine rolling real dice
    pub fn new(
        registry: Arc<BattleRegistry>,
        characters: Arc<dyn CharacterRepository>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            registry,
            characters,
            roller: Mutex::new(Box::new(RandomRoller::from_os())),
            gate: AsyncMutex::new(()),
            settings,
        }
    }

    /// Replace the dice source
    pub fn with_roller(mut self, roller: impl Roller + 'static) -> Self {
        self.roller = Mutex::new(Box::new(roller));
        self
    }

    pub fn registry(&self) -> &Arc<BattleRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Start a battle in a thread.
    ///
    /// Turn order is agility + d20 descending; equal totals keep the order
    /// the participants were listed in.
    pub async fn start_battle(
        &self,
        thread_id: &str,
        initiator: &str,
        participants: &[String],
        options: StartOptions,
    ) -> Result<StartReport, BattleError> {
        if !VALID_SIZES.contains(&participants.len()) {
            return Err(BattleError::InvalidSize(participants.len()));
        }
        for (i, p) in participants.iter().enumerate() {
            if participants[..i].contains(p) {
                return Err(BattleError::InvalidTarget(format!("{} is listed twice", p)));
            }
        }
        for p in participants {
            if self.registry.find_by_participant(p).await.is_some() {
                return Err(BattleError::AlreadyInBattle(p.clone()));
            }
        }

        let mut roster = Vec::with_capacity(participants.len());
        for p in participants {
            let record = self
                .find_character(p)
                .await?
                .ok_or_else(|| BattleError::UnregisteredParticipant(p.clone()))?;
            roster.push(Combatant::from(&record));
        }

        let initiative: Vec<_> = {
            let mut roller = self.roller.lock();
            roster
                .iter()
                .map(|c| (c.id.clone(), roll_initiative(c, &mut **roller)))
                .collect()
        };
        let mut ranked = initiative.clone();
        ranked.sort_by(|a, b| b.1.total.cmp(&a.1.total));
        let turn_order: Vec<String> = ranked.into_iter().map(|(id, _)| id).collect();

        let session_options = SessionOptions {
            gm_id: initiator.to_string(),
            team_mode: options.team || participants.len() > 2,
            turn_model: options.turn_model.unwrap_or(self.settings.turn_model),
            mode: options.mode.unwrap_or(self.settings.mode),
        };
        let turn_model = session_options.turn_model;
        let mode = session_options.mode;
        let session_id = self
            .registry
            .create(thread_id, roster, turn_order.clone(), session_options)
            .await;
        let session = self
            .registry
            .get(&session_id)
            .await
            .ok_or(BattleError::NoActiveBattle)?;

        info!(session_id = %session_id, gm = %initiator, ?turn_model, ?mode, "Battle started");
        Ok(StartReport {
            session_id,
            thread_id: thread_id.to_string(),
            participants: participants.to_vec(),
            teams: session.teams.clone(),
            turn_order,
            first_turn: session.current_turn.clone(),
            turn_model,
            mode,
            initiative,
        })
    }

    /// Attack an opponent. In 1:1 the target is the other participant.
    pub async fn attack(&self, actor: &str, target: Option<&str>) -> Result<ActionReport, BattleError> {
        let session_id = self.session_of(actor).await?;
        self.transition(&session_id, |session, roller| {
            ensure_can_act(session, actor)?;
            let target = attack_target(session, actor, target)?;

            session.drop_stances(actor);
            session.last_player_action = Utc::now();
            let mut events = Vec::new();
            match session.turn_model {
                TurnModel::Sequential => {
                    strike(session, actor, &target, roller, &mut events);
                    complete_action(session, actor, roller, &mut events);
                }
                TurnModel::Simultaneous => {
                    session.pending_actions.push(PendingAttack {
                        actor: actor.to_string(),
                        target: target.clone(),
                    });
                    events.push(BattleEvent::Queued {
                        actor: actor.to_string(),
                        target,
                    });
                    complete_action(session, actor, roller, &mut events);
                }
            }
            Ok(events)
        })
        .await
    }

    /// Raise a guard, optionally covering a teammate
    pub async fn defend(&self, actor: &str, target: Option<&str>) -> Result<ActionReport, BattleError> {
        let session_id = self.session_of(actor).await?;
        self.transition(&session_id, |session, roller| {
            ensure_can_act(session, actor)?;
            let covering = cover_target(session, actor, target)?;

            session.drop_stances(actor);
            session.last_player_action = Utc::now();
            session.flags_mut(actor).guarded = true;
            if let Some(ref ally) = covering {
                session
                    .defend_targets
                    .insert(ally.clone(), actor.to_string());
            }

            let mut events = vec![BattleEvent::Guard {
                actor: actor.to_string(),
                covering,
            }];
            complete_action(session, actor, roller, &mut events);
            Ok(events)
        })
        .await
    }

    /// Ready a counter
    pub async fn counter(&self, actor: &str) -> Result<ActionReport, BattleError> {
        let session_id = self.session_of(actor).await?;
        self.transition(&session_id, |session, roller| {
            ensure_can_act(session, actor)?;

            session.drop_stances(actor);
            session.last_player_action = Utc::now();
            session.flags_mut(actor).countering = true;

            let mut events = vec![BattleEvent::Counter {
                actor: actor.to_string(),
            }];
            complete_action(session, actor, roller, &mut events);
            Ok(events)
        })
        .await
    }

    /// Try to escape a 1:1 battle
    pub async fn flee(&self, actor: &str) -> Result<ActionReport, BattleError> {
        let session_id = self.session_of(actor).await?;
        self.transition(&session_id, |session, roller| {
            if session.is_team() {
                return Err(BattleError::FleeNotAllowed);
            }
            ensure_can_act(session, actor)?;
            let opponent = session
                .opponents_of(actor)
                .into_iter()
                .next()
                .and_then(|id| session.combatant(&id).cloned())
                .ok_or(BattleError::NoActiveBattle)?;
            let runner = session
                .combatant(actor)
                .cloned()
                .ok_or(BattleError::NoActiveBattle)?;

            session.drop_stances(actor);
            session.last_player_action = Utc::now();
            let escape = roll_escape(&runner, roller);
            let chase = roll_initiative(&opponent, roller);
            let mut events = Vec::new();
            if escape.total > chase.total {
                events.push(BattleEvent::Fled {
                    actor: actor.to_string(),
                    escape,
                    chase,
                });
                session.resolve(
                    None,
                    EndReason::Fled {
                        actor: actor.to_string(),
                    },
                );
            } else {
                events.push(BattleEvent::FleeFailed {
                    actor: actor.to_string(),
                    escape,
                    chase,
                });
                complete_action(session, actor, roller, &mut events);
            }
            Ok(events)
        })
        .await
    }

    /// Drink a potion, or give it to a teammate.
    ///
    /// Inside a battle this is the actor's action for the turn; outside one
    /// it just heals. The potion leaves the inventory before the heal is
    /// stored; if either write fails, neither sticks.
    pub async fn use_potion(
        &self,
        actor: &str,
        size: &str,
        target: Option<&str>,
    ) -> Result<PotionOutcome, BattleError> {
        let size: PotionSize = size
            .parse()
            .map_err(|_| BattleError::UnknownPotion(size.to_string()))?;
        let record = self
            .find_character(actor)
            .await?
            .ok_or(BattleError::UnregisteredUser)?;
        let item = size.item_name();
        let remaining = record
            .items_without_one(&item)
            .ok_or_else(|| BattleError::NotHoldingItem(item.clone()))?;
        let held = record.items.clone();
        let amount = self.settings.potions.heal_amount(size);
        let target_id = target.unwrap_or(actor);

        match self.registry.find_by_participant(actor).await {
            Some(session) => {
                let consume = vec![StoreWrite::items(actor, remaining, held)];
                let report = self
                    .transition_with(&session.id, consume, |session, roller| {
                        ensure_can_act(session, actor)?;
                        if !session.is_participant(target_id) {
                            return Err(BattleError::InvalidTarget(target_id.to_string()));
                        }
                        if session.side_of(target_id) != session.side_of(actor) {
                            return Err(BattleError::WrongTeam(target_id.to_string()));
                        }

                        session.drop_stances(actor);
                        session.last_player_action = Utc::now();
                        let combatant = session
                            .combatant_mut(target_id)
                            .ok_or_else(|| BattleError::InvalidTarget(target_id.to_string()))?;
                        let healed = combatant.heal(amount);
                        let heal = HealReport {
                            actor: actor.to_string(),
                            target: target_id.to_string(),
                            target_name: combatant.name.clone(),
                            size,
                            healed,
                            hp: combatant.hp,
                            max_hp: combatant.max_hp,
                        };

                        let mut events = vec![BattleEvent::Healed(heal)];
                        complete_action(session, actor, roller, &mut events);
                        Ok(Some(events))
                    })
                    .await?
                    .ok_or(BattleError::NoActiveBattle)?;
                Ok(PotionOutcome::InBattle(report))
            }
            None => {
                if target_id != actor && self.registry.find_by_participant(target_id).await.is_some() {
                    return Err(BattleError::InvalidTarget(format!("{} is in a battle", target_id)));
                }
                let mut patient = if target_id == actor {
                    record
                } else {
                    self.find_character(target_id)
                        .await?
                        .ok_or_else(|| BattleError::InvalidTarget(target_id.to_string()))?
                };

                let max_hp = patient.max_hp();
                let before = patient.hp;
                let hp = (before + amount).min(max_hp).max(before);
                let healed = hp - before;
                patient.hp = hp;

                if target_id == actor {
                    self.characters
                        .update_user(actor, CharacterUpdate::hp(hp).with_items(remaining))
                        .await
                        .map_err(|e| repository_failure(actor, e))?;
                } else {
                    self.persist(&[
                        StoreWrite::items(actor, remaining, held),
                        StoreWrite::hp(target_id, hp, before),
                    ])
                    .await?;
                }

                debug!(actor = %actor, target = %target_id, healed, "Potion used outside battle");
                Ok(PotionOutcome::OutOfBattle(HealReport {
                    actor: actor.to_string(),
                    target: target_id.to_string(),
                    target_name: patient.name,
                    size,
                    healed,
                    hp,
                    max_hp,
                }))
            }
        }
    }

    /// Abort a battle. Only its GM may do this.
    pub async fn stop_battle(&self, actor: &str) -> Result<ActionReport, BattleError> {
        let session = match self.registry.find_by_gm(actor).await {
            Some(session) => session,
            None => self
                .registry
                .find_by_participant(actor)
                .await
                .ok_or(BattleError::NoActiveBattle)?,
        };
        self.transition(&session.id, |session, _| {
            if session.gm_id != actor {
                return Err(BattleError::NotGm);
            }
            session.resolve(
                None,
                EndReason::Stopped {
                    gm: actor.to_string(),
                },
            );
            Ok(Vec::new())
        })
        .await
    }

    /// Force a defend for everyone who has not acted this round, then
    /// resolve the round.
    ///
    /// Only acts if nothing happened in the session after `cutoff`; returns
    /// `None` otherwise, and for sequential battles.
    pub async fn auto_defend_timeout(
        &self,
        session_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<ActionReport>, BattleError> {
        self.transition_with(session_id, Vec::new(), |session, roller| {
            if session.turn_model != TurnModel::Simultaneous || session.last_action > cutoff {
                return Ok(None);
            }
            let idle: Vec<String> = session
                .participants
                .iter()
                .filter(|p| !session.flags(p).acted)
                .cloned()
                .collect();

            let mut events = Vec::new();
            for id in idle {
                let flags = session.flags_mut(&id);
                flags.guarded = true;
                flags.acted = true;
                events.push(BattleEvent::ForcedDefend { actor: id });
            }
            finish_round_if_ready(session, roller, &mut events);
            Ok(Some(events))
        })
        .await
    }

    /// End a battle on remaining HP: the side with more total HP wins.
    ///
    /// Only acts if no player acted after `cutoff`; returns `None` otherwise.
    pub async fn end_battle_by_hp_total(
        &self,
        session_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<ActionReport>, BattleError> {
        self.transition_with(session_id, Vec::new(), |session, _| {
            if session.last_player_action > cutoff {
                return Ok(None);
            }
            let (a, b) = session.hp_totals();
            let winner = match a.cmp(&b) {
                std::cmp::Ordering::Greater => Some(Side::A),
                std::cmp::Ordering::Less => Some(Side::B),
                std::cmp::Ordering::Equal => None,
            };
            session.resolve(winner, EndReason::HpTotal { a, b });
            Ok(Some(Vec::new()))
        })
        .await
    }

    /// Current HP of a character; battle HP while it is fighting
    pub async fn check_hp(&self, actor: &str, target: Option<&str>) -> Result<HpReport, BattleError> {
        let id = target.unwrap_or(actor);
        if let Some(session) = self.registry.find_by_participant(id).await {
            if let Some(c) = session.combatant(id) {
                return Ok(HpReport {
                    id: id.to_string(),
                    name: c.name.clone(),
                    hp: c.hp,
                    max_hp: c.max_hp,
                    in_battle: true,
                });
            }
        }

        let record = self.find_character(id).await?.ok_or_else(|| {
            if id == actor {
                BattleError::UnregisteredUser
            } else {
                BattleError::InvalidTarget(id.to_string())
            }
        })?;
        Ok(HpReport {
            id: id.to_string(),
            name: record.name.clone(),
            hp: record.hp,
            max_hp: record.max_hp(),
            in_battle: false,
        })
    }

    async fn session_of(&self, actor: &str) -> Result<String, BattleError> {
        self.registry
            .find_by_participant(actor)
            .await
            .map(|s| s.id)
            .ok_or(BattleError::NoActiveBattle)
    }

    async fn find_character(&self, id: &str) -> Result<Option<CharacterRecord>, BattleError> {
        self.characters
            .find_user(id)
            .await
            .map_err(|e| repository_failure(id, e))
    }

    async fn transition<F>(&self, session_id: &str, f: F) -> Result<ActionReport, BattleError>
    where
        F: FnOnce(&mut BattleSession, &mut dyn Roller) -> Result<Vec<BattleEvent>, BattleError> + Send,
    {
        self.transition_with(session_id, Vec::new(), |session, roller| f(session, roller).map(Some))
            .await?
            .ok_or(BattleError::NoActiveBattle)
    }

    /// Apply one transition to a snapshot, persist, then commit.
    ///
    /// The closure validates and mutates the snapshot; `Ok(None)` means there
    /// is nothing to do. `writes` go to the character store ahead of the HP
    /// changes. The stored session is only replaced once every write went
    /// through.
    async fn transition_with<F>(
        &self,
        session_id: &str,
        mut writes: Vec<StoreWrite>,
        f: F,
    ) -> Result<Option<ActionReport>, BattleError>
    where
        F: FnOnce(&mut BattleSession, &mut dyn Roller) -> Result<Option<Vec<BattleEvent>>, BattleError> + Send,
    {
        let _gate = self.gate.lock().await;
        let current = self
            .registry
            .get(session_id)
            .await
            .ok_or(BattleError::NoActiveBattle)?;

        let mut next = current.clone();
        let events = {
            let mut roller = self.roller.lock();
            f(&mut next, &mut **roller)?
        };
        let Some(events) = events else {
            return Ok(None);
        };
        let Applied { report, hp_writes } = snapshot(&next, events);

        for (id, hp) in hp_writes {
            let before = current.combatant(&id).map_or(hp, |c| c.hp);
            writes.push(StoreWrite::hp(&id, hp, before));
        }
        self.persist(&writes).await?;

        if !self.registry.commit(next, current.revision).await {
            warn!(session_id = %session_id, "Battle changed before commit, dropping transition");
            self.undo(&writes).await;
            return Err(BattleError::NoActiveBattle);
        }
        Ok(Some(report))
    }

    /// Apply writes in order; on failure undo the ones already made
    async fn persist(&self, writes: &[StoreWrite]) -> Result<(), BattleError> {
        for (i, write) in writes.iter().enumerate() {
            if let Err(e) = self.characters.update_user(&write.id, write.update.clone()).await {
                self.undo(&writes[..i]).await;
                return Err(repository_failure(&write.id, e));
            }
        }
        Ok(())
    }

    async fn undo(&self, writes: &[StoreWrite]) {
        for write in writes.iter().rev() {
            if let Err(e) = self.characters.update_user(&write.id, write.undo.clone()).await {
                warn!(character = %write.id, "Failed to undo character write: {}", e);
            }
        }
    }
}

fn repository_failure(id: &str, e: RepositoryError) -> BattleError {
    warn!(character = %id, "Character store failure: {}", e);
    BattleError::Repository(e)
}

/// Snapshot the session into a report and collect HP to persist
fn snapshot(session: &BattleSession, events: Vec<BattleEvent>) -> Applied {
    let mut touched: Vec<String> = if session.is_resolved() {
        session.roster.clone()
    } else {
        events
            .iter()
            .flat_map(|e| match e {
                BattleEvent::Hit(hit) => vec![hit.defender.clone(), hit.attacker.clone()],
                BattleEvent::Healed(heal) => vec![heal.target.clone()],
                _ => Vec::new(),
            })
            .collect()
    };
    touched.dedup();
    let mut hp_writes: Vec<(String, i32)> = Vec::new();
    for id in touched {
        if hp_writes.iter().any(|(seen, _)| *seen == id) {
            continue;
        }
        if let Some(c) = session.combatant(&id) {
            hp_writes.push((id, c.hp));
        }
    }

    let mut mentions = session.roster.clone();
    if !mentions.contains(&session.gm_id) {
        mentions.push(session.gm_id.clone());
    }

    Applied {
        report: ActionReport {
            session_id: session.id.clone(),
            thread_id: session.thread_id.clone(),
            mentions,
            events,
            next_turn: session.current_turn.clone(),
            round: session.round,
            resolution: session.resolution.clone(),
        },
        hp_writes,
    }
}

fn display_name(session: &BattleSession, id: &str) -> String {
    session
        .combatant(id)
        .map(|c| c.name.clone())
        .unwrap_or_else(|| id.to_string())
}

fn ensure_can_act(session: &BattleSession, actor: &str) -> Result<(), BattleError> {
    if !session.is_participant(actor) {
        return Err(BattleError::NoActiveBattle);
    }
    match session.turn_model {
        TurnModel::Sequential => match session.current_turn {
            Some(ref holder) if holder != actor => {
                Err(BattleError::NotYourTurn(display_name(session, holder)))
            }
            _ => Ok(()),
        },
        TurnModel::Simultaneous if session.flags(actor).acted => Err(BattleError::AlreadyActed),
        TurnModel::Simultaneous => Ok(()),
    }
}

fn attack_target(session: &BattleSession, actor: &str, target: Option<&str>) -> Result<String, BattleError> {
    if session.is_team() {
        let target = target
            .ok_or_else(|| BattleError::InvalidTarget("name an opponent to attack".to_string()))?;
        if !session.is_participant(target) {
            return Err(BattleError::InvalidTarget(target.to_string()));
        }
        if session.side_of(target) == session.side_of(actor) {
            return Err(BattleError::WrongTeam(target.to_string()));
        }
        return Ok(target.to_string());
    }

    let opponent = session
        .opponents_of(actor)
        .into_iter()
        .next()
        .ok_or(BattleError::NoActiveBattle)?;
    match target {
        Some(t) if t != opponent => Err(BattleError::InvalidTarget(t.to_string())),
        _ => Ok(opponent),
    }
}

fn cover_target(
    session: &BattleSession,
    actor: &str,
    target: Option<&str>,
) -> Result<Option<String>, BattleError> {
    let target = match target {
        Some(t) if t != actor => t,
        _ => return Ok(None),
    };
    if !session.is_team() {
        return Err(BattleError::InvalidTarget(format!(
            "{}: covering an ally needs a team battle",
            target
        )));
    }
    if !session.is_participant(target) {
        return Err(BattleError::InvalidTarget(target.to_string()));
    }
    if session.side_of(target) != session.side_of(actor) {
        return Err(BattleError::WrongTeam(target.to_string()));
    }
    Ok(Some(target.to_string()))
}

/// Close out an actor's action: pass the turn, or mark the actor done for
/// the round and resolve the round once everyone is in.
fn complete_action(
    session: &mut BattleSession,
    actor: &str,
    roller: &mut dyn Roller,
    events: &mut Vec<BattleEvent>,
) {
    if session.is_resolved() {
        return;
    }
    match session.turn_model {
        TurnModel::Sequential => {
            if session.is_turn_of(actor) && session.advance_turn() {
                events.push(BattleEvent::RoundStarted {
                    round: session.round,
                });
            }
        }
        TurnModel::Simultaneous => {
            if session.is_participant(actor) {
                session.flags_mut(actor).acted = true;
            }
            finish_round_if_ready(session, roller, events);
        }
    }
}

/// Resolve queued attacks in turn order once every living participant acted
fn finish_round_if_ready(session: &mut BattleSession, roller: &mut dyn Roller, events: &mut Vec<BattleEvent>) {
    if session.is_resolved() || !session.all_acted() {
        return;
    }

    let mut queue = std::mem::take(&mut session.pending_actions);
    queue.sort_by_key(|p| {
        session
            .turn_order
            .iter()
            .position(|id| *id == p.actor)
            .unwrap_or(usize::MAX)
    });
    for attack in queue {
        if session.is_resolved() {
            break;
        }
        if !session.is_participant(&attack.actor) || !session.is_participant(&attack.target) {
            continue;
        }
        strike(session, &attack.actor, &attack.target, roller, events);
    }

    if !session.is_resolved() {
        session.start_round();
        events.push(BattleEvent::RoundStarted {
            round: session.round,
        });
    }
}

/// Resolve one attack, apply damage and counter damage, spend the
/// defender's stances, and knock out whoever dropped to zero.
fn strike(
    session: &mut BattleSession,
    actor: &str,
    target: &str,
    roller: &mut dyn Roller,
    events: &mut Vec<BattleEvent>,
) {
    let defender_id = session
        .defend_targets
        .get(target)
        .filter(|guardian| guardian.as_str() != actor && session.is_participant(guardian))
        .cloned()
        .unwrap_or_else(|| target.to_string());
    let (Some(attacker), Some(defender)) = (
        session.combatant(actor).cloned(),
        session.combatant(&defender_id).cloned(),
    ) else {
        return;
    };

    let flags = session.flags(&defender_id);
    let stance = Stance {
        guarded: flags.guarded && !flags.guard_consumed,
        countering: flags.countering && !flags.counter_consumed,
    };
    let hit = resolve_hit(&attacker, &defender, stance, session.mode.rules(), roller);
    debug!(
        session_id = %session.id,
        attacker = %actor,
        defender = %defender_id,
        attack = hit.attack.total,
        defense = hit.defense.total,
        critical = hit.critical,
        damage = hit.damage,
        "Attack resolved"
    );

    let defender_hp = match session.combatant_mut(&defender_id) {
        Some(c) => {
            c.take_damage(hit.damage);
            c.hp
        }
        None => 0,
    };
    let attacker_hp = match session.combatant_mut(actor) {
        Some(c) => {
            if let Some(counter) = hit.counter {
                c.take_damage(counter.damage);
            }
            c.hp
        }
        None => 0,
    };

    // Any attack spends the defender's stances, hit or miss
    let flags = session.flags_mut(&defender_id);
    flags.guard_consumed |= stance.guarded;
    flags.counter_consumed |= stance.countering;
    flags.guarded = false;
    flags.countering = false;
    if defender_id != target {
        session.defend_targets.remove(target);
    }

    events.push(BattleEvent::Hit(AttackReport {
        attacker: actor.to_string(),
        attacker_name: attacker.name.clone(),
        target: target.to_string(),
        defender: defender_id.clone(),
        defender_name: defender.name.clone(),
        hit,
        defender_hp,
        defender_max_hp: defender.max_hp,
        attacker_hp,
    }));

    for id in [defender_id.as_str(), actor] {
        if session.is_resolved() {
            break;
        }
        if session.combatant(id).is_some_and(|c| c.is_dead()) {
            knock_out(session, id, events);
        }
    }
}

fn knock_out(session: &mut BattleSession, id: &str, events: &mut Vec<BattleEvent>) {
    let name = display_name(session, id);
    let wiped = session.eliminate(id);
    info!(session_id = %session.id, participant = %id, "Participant defeated");
    events.push(BattleEvent::Eliminated {
        id: id.to_string(),
        name,
    });
    if let Some(side) = wiped {
        session.resolve(Some(side.opposite()), EndReason::Defeat);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;

    use crate::characters::MemoryCharacterStore;
    use crate::combat::ScriptedRoller;

    /// Store that can refuse inventory or HP writes
    #[derive(Debug, Default)]
    struct FlakyStore {
        inner: MemoryCharacterStore,
        refuse_items: AtomicBool,
        refuse_hp: AtomicBool,
    }

    #[async_trait]
    impl CharacterRepository for FlakyStore {
        async fn find_user(&self, id: &str) -> Result<Option<CharacterRecord>, RepositoryError> {
            self.inner.find_user(id).await
        }

        async fn update_user(&self, id: &str, update: CharacterUpdate) -> Result<(), RepositoryError> {
            let refused = (update.items.is_some() && self.refuse_items.load(Ordering::SeqCst))
                || (update.hp.is_some() && self.refuse_hp.load(Ordering::SeqCst));
            if refused {
                return Err(RepositoryError::Backend("write refused".to_string()));
            }
            self.inner.update_user(id, update).await
        }
    }

    async fn flaky_engine(rolls: Vec<u32>) -> (BattleEngine, Arc<FlakyStore>) {
        let store = Arc::new(FlakyStore::default());
        for id in ["a", "b"] {
            let mut record = CharacterRecord::new(id, &id.to_uppercase());
            record.hp = 50;
            record.items = vec!["소형 포션".to_string()];
            store.inner.insert(record).await;
        }
        let engine = BattleEngine::new(BattleRegistry::shared(), store.clone(), EngineSettings::default())
            .with_roller(ScriptedRoller::new(rolls));
        (engine, store)
    }

    async fn engine_with(rolls: Vec<u32>, ids: &[&str]) -> (BattleEngine, Arc<MemoryCharacterStore>) {
        let store = MemoryCharacterStore::shared();
        for id in ids {
            let mut record = CharacterRecord::new(id, &id.to_uppercase());
            record.attack = 10;
            record.defense = 10;
            record.agility = 5;
            store.insert(record).await;
        }
        let engine = BattleEngine::new(BattleRegistry::shared(), store.clone(), EngineSettings::default())
            .with_roller(ScriptedRoller::new(rolls));
        (engine, store)
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_start_rejects_bad_sizes() {
        let (engine, _) = engine_with(vec![], &["a", "b", "c"]).await;
        let err = engine
            .start_battle("t", "a", &ids(&["a", "b", "c"]), StartOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, BattleError::InvalidSize(3));
        assert_eq!(engine.registry().count().await, 0);
    }

    #[tokio::test]
    async fn test_start_tie_keeps_input_order() {
        let (engine, _) = engine_with(vec![12, 12], &["a", "b"]).await;
        let report = engine
            .start_battle("t", "a", &ids(&["a", "b"]), StartOptions::default())
            .await
            .unwrap();
        assert_eq!(report.turn_order, vec!["a", "b"]);
        assert_eq!(report.first_turn.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_start_higher_initiative_first() {
        let (engine, _) = engine_with(vec![3, 17], &["a", "b"]).await;
        let report = engine
            .start_battle("t", "a", &ids(&["a", "b"]), StartOptions::default())
            .await
            .unwrap();
        assert_eq!(report.turn_order, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_attack_example() {
        // initiative a=15 b=10, then attack 15 vs defense 5
        let (engine, store) = engine_with(vec![10, 5, 15, 5], &["a", "b"]).await;
        engine
            .start_battle("t", "a", &ids(&["a", "b"]), StartOptions::default())
            .await
            .unwrap();

        let report = engine.attack("a", None).await.unwrap();
        let hit = report.hits().next().unwrap();
        assert_eq!(hit.hit.damage, 10);
        assert_eq!(hit.defender_hp, 90);
        assert!(!hit.hit.critical);
        assert_eq!(report.next_turn.as_deref(), Some("b"));

        let stored = store.find_user("b").await.unwrap().unwrap();
        assert_eq!(stored.hp, 90);
    }

    #[tokio::test]
    async fn test_not_your_turn_does_not_mutate() {
        let (engine, _) = engine_with(vec![10, 5], &["a", "b"]).await;
        let start = engine
            .start_battle("t", "a", &ids(&["a", "b"]), StartOptions::default())
            .await
            .unwrap();
        let before = engine.registry().get(&start.session_id).await.unwrap();

        let err = engine.attack("b", None).await.unwrap_err();
        assert_eq!(err, BattleError::NotYourTurn("A".to_string()));
        assert_eq!(engine.registry().get(&start.session_id).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_potion_kept_when_inventory_write_fails() {
        let (engine, store) = flaky_engine(vec![10, 5]).await;
        let start = engine
            .start_battle("t", "a", &ids(&["a", "b"]), StartOptions::default())
            .await
            .unwrap();
        let before = engine.registry().get(&start.session_id).await.unwrap();

        store.refuse_items.store(true, Ordering::SeqCst);
        let err = engine.use_potion("a", "소형", None).await.unwrap_err();
        assert!(matches!(err, BattleError::Repository(_)));
        assert_eq!(engine.registry().get(&start.session_id).await.unwrap(), before);
        let record = store.find_user("a").await.unwrap().unwrap();
        assert_eq!(record.hp, 50);
        assert_eq!(record.items, vec!["소형 포션"]);

        store.refuse_items.store(false, Ordering::SeqCst);
        engine.use_potion("a", "소형", None).await.unwrap();
        let record = store.find_user("a").await.unwrap().unwrap();
        assert_eq!(record.hp, 70);
        assert!(record.items.is_empty());
    }

    #[tokio::test]
    async fn test_potion_restored_when_heal_write_fails() {
        let (engine, store) = flaky_engine(vec![10, 5]).await;
        let start = engine
            .start_battle("t", "a", &ids(&["a", "b"]), StartOptions::default())
            .await
            .unwrap();

        store.refuse_hp.store(true, Ordering::SeqCst);
        let err = engine.use_potion("a", "소형", None).await.unwrap_err();
        assert!(matches!(err, BattleError::Repository(_)));

        let session = engine.registry().get(&start.session_id).await.unwrap();
        assert_eq!(session.combatant("a").unwrap().hp, 50);
        assert_eq!(session.current_turn.as_deref(), Some("a"));
        assert_eq!(store.find_user("a").await.unwrap().unwrap().items, vec!["소형 포션"]);
    }

    #[tokio::test]
    async fn test_potion_for_another_restored_when_heal_write_fails() {
        let (engine, store) = flaky_engine(vec![]).await;

        store.refuse_hp.store(true, Ordering::SeqCst);
        let err = engine.use_potion("a", "소형", Some("b")).await.unwrap_err();
        assert!(matches!(err, BattleError::Repository(_)));
        assert_eq!(store.find_user("a").await.unwrap().unwrap().items, vec!["소형 포션"]);
        assert_eq!(store.find_user("b").await.unwrap().unwrap().hp, 50);

        store.refuse_hp.store(false, Ordering::SeqCst);
        engine.use_potion("a", "소형", Some("b")).await.unwrap();
        assert!(store.find_user("a").await.unwrap().unwrap().items.is_empty());
        assert_eq!(store.find_user("b").await.unwrap().unwrap().hp, 70);
    }
}
