//! Battle sessions
//!
//! Provides:
//! - Registry: every active battle behind one lock
//! - Engine: start, actions, aborts and timer-forced resolutions
//! - Reports: typed results rendered for chat

mod engine;
mod error;
mod potion;
mod registry;
mod report;
mod session;

pub use engine::{BattleEngine, EngineSettings, PotionOutcome, StartOptions, VALID_SIZES};
pub use error::BattleError;
pub use potion::{PotionSize, PotionTable};
pub use registry::{BattleRegistry, SessionPatch};
pub use report::{ActionReport, AttackReport, BattleEvent, HealReport, HpReport, StartReport};
pub use session::{
    BattlePhase, BattleSession, EndReason, ParticipantFlags, PendingAttack, Resolution,
    SessionOptions, Side, Teams, TurnModel,
};
