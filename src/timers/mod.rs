//! Battle timer
//!
//! Periodic background task that enforces battle deadlines:
//! - Turn timeout: idle participants of simultaneous battles are forced to defend
//! - Session timeout: battles without player input are decided on remaining HP
//! - Staleness sweep: forgotten sessions are removed
//!
//! [`BattleTimer::tick_at`] runs one pass against an explicit clock, so the
//! handlers can be driven directly without waiting on real time.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::battle::{ActionReport, BattleEngine, TurnModel};
use crate::notify::{MessageRef, Notifier};

/// Timer thresholds, in seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerSettings {
    /// Interval between ticks
    pub tick_interval_secs: u64,
    /// Idle time after which a round is forced (simultaneous model)
    pub turn_timeout_secs: u64,
    /// Time without player input after which the battle is decided on HP
    pub session_timeout_secs: u64,
    /// Time without any activity after which a session is dropped
    pub stale_after_secs: u64,
}

impl Default for TimerSettings {
    fn default() -> Self {
        Self {
            tick_interval_secs: 30,
            turn_timeout_secs: 240,
            session_timeout_secs: 3600,
            stale_after_secs: 7200,
        }
    }
}

impl TimerSettings {
    pub fn tick_interval(&self) -> StdDuration {
        StdDuration::from_secs(self.tick_interval_secs.max(1))
    }

    pub fn turn_timeout(&self) -> Duration {
        Duration::seconds(self.turn_timeout_secs as i64)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::seconds(self.session_timeout_secs as i64)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::seconds(self.stale_after_secs as i64)
    }
}

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Sessions whose round was forced by auto-defend
    pub auto_defended: Vec<String>,
    /// Sessions decided on remaining HP
    pub hp_decided: Vec<String>,
    /// Number of stale sessions removed
    pub swept: usize,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        self.auto_defended.is_empty() && self.hp_decided.is_empty() && self.swept == 0
    }
}

/// Deadline enforcer for active battles
pub struct BattleTimer {
    engine: Arc<BattleEngine>,
    notifier: Arc<dyn Notifier>,
    settings: TimerSettings,
}

impl std::fmt::Debug for BattleTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BattleTimer")
            .field("settings", &self.settings)
            .finish()
    }
}

impl BattleTimer {
    pub fn new(engine: Arc<BattleEngine>, notifier: Arc<dyn Notifier>, settings: TimerSettings) -> Self {
        Self {
            engine,
            notifier,
            settings,
        }
    }

    /// Create a shared instance
    pub fn shared(engine: Arc<BattleEngine>, notifier: Arc<dyn Notifier>, settings: TimerSettings) -> Arc<Self> {
        Arc::new(Self::new(engine, notifier, settings))
    }

    pub fn settings(&self) -> &TimerSettings {
        &self.settings
    }

    /// Run one pass now
    pub async fn tick(&self) -> TickReport {
        self.tick_at(Utc::now()).await
    }

    /// Run one pass against the given clock.
    ///
    /// Candidates come from a snapshot; each forced action re-checks its
    /// deadline against the live session, so a player who acted in the
    /// meantime keeps their round.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();
        let registry = self.engine.registry();
        let session_cutoff = now - self.settings.session_timeout();
        let turn_cutoff = now - self.settings.turn_timeout();

        for session in registry.list().await {
            if session.last_player_action < session_cutoff {
                match self.engine.end_battle_by_hp_total(&session.id, session_cutoff).await {
                    Ok(Some(result)) => {
                        info!(session_id = %session.id, "Battle decided on remaining HP");
                        self.deliver(&result).await;
                        report.hp_decided.push(session.id.clone());
                    }
                    Ok(None) => {}
                    Err(e) => debug!(session_id = %session.id, "HP decision skipped: {}", e),
                }
            } else if session.turn_model == TurnModel::Simultaneous && session.last_action < turn_cutoff {
                match self.engine.auto_defend_timeout(&session.id, turn_cutoff).await {
                    Ok(Some(result)) => {
                        info!(session_id = %session.id, round = session.round, "Round forced by timeout");
                        self.deliver(&result).await;
                        report.auto_defended.push(session.id.clone());
                    }
                    Ok(None) => {}
                    Err(e) => debug!(session_id = %session.id, "Auto-defend skipped: {}", e),
                }
            }
        }

        report.swept = registry.sweep_stale_at(now, self.settings.stale_after()).await;
        if report.swept > 0 {
            warn!("Swept {} stale battles", report.swept);
        }
        report
    }

    async fn deliver(&self, result: &ActionReport) {
        self.notifier
            .reply_with_mentions(
                &MessageRef::thread(&result.thread_id),
                &result.to_string(),
                &result.mentions,
            )
            .await;
    }

    /// Start ticking in the background.
    ///
    /// A panicking tick is logged and the loop carries on with the next
    /// interval.
    pub fn spawn(self: Arc<Self>) -> TimerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let period = self.settings.tick_interval();

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let timer = self.clone();
                        match tokio::spawn(async move { timer.tick().await }).await {
                            Ok(report) if !report.is_empty() => debug!(?report, "Timer tick"),
                            Ok(_) => {}
                            Err(e) => error!("Battle timer tick failed: {}", e),
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Battle timer stopped");
        });

        TimerHandle { shutdown_tx, task }
    }
}

/// Handle to a running [`BattleTimer`]
#[derive(Debug)]
pub struct TimerHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl TimerHandle {
    /// Stop the timer, letting an in-flight tick finish first
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            error!("Battle timer task failed: {}", e);
        }
    }
}
