//! Chat commands
//!
//! Maps inbound verbs onto [`BattleEngine`] operations and delivers the
//! outcome through a [`Notifier`], tagging every participant.
//!
//! Line format: `[#thread] <user> <verb> [args...]`

use std::sync::{Arc, LazyLock};

use regex::Regex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::battle::{BattleEngine, BattleError, PotionOutcome, StartOptions, TurnModel};
use crate::combat::BattleMode;
use crate::notify::{MessageRef, Notifier};

/// Parse failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("empty command")]
    Empty,

    #[error("unknown command: {0}")]
    UnknownVerb(String),

    #[error("missing {0}")]
    MissingArgument(&'static str),

    #[error("unknown option: {0}")]
    UnknownOption(String),
}

/// A battle command with its arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    CheckHp {
        target: Option<String>,
    },
    StartBattle {
        participants: Vec<String>,
        team: bool,
        turn_model: Option<TurnModel>,
        mode: Option<BattleMode>,
    },
    StopBattle,
    Attack {
        target: Option<String>,
    },
    Defend {
        target: Option<String>,
    },
    Counter,
    Flee,
    UsePotion {
        size: String,
        target: Option<String>,
    },
}

impl Command {
    /// Build a command from a verb and its whitespace separated arguments
    pub fn parse(verb: &str, args: &[&str]) -> Result<Self, CommandError> {
        let first = args.first().map(|s| s.to_string());
        match verb.to_lowercase().as_str() {
            "check-hp" | "hp" => Ok(Command::CheckHp { target: first }),
            "start-battle" | "start" => parse_start(args),
            "stop-battle" | "stop" => Ok(Command::StopBattle),
            "attack" => Ok(Command::Attack { target: first }),
            "defend" => Ok(Command::Defend { target: first }),
            "counter" => Ok(Command::Counter),
            "flee" => Ok(Command::Flee),
            "use-potion" | "potion" => {
                let size = first.ok_or(CommandError::MissingArgument("potion size"))?;
                Ok(Command::UsePotion {
                    size,
                    target: args.get(1).map(|s| s.to_string()),
                })
            }
            other => Err(CommandError::UnknownVerb(other.to_string())),
        }
    }

    /// Canonical verb name
    pub fn verb(&self) -> &'static str {
        match self {
            Command::CheckHp { .. } => "check-hp",
            Command::StartBattle { .. } => "start-battle",
            Command::StopBattle => "stop-battle",
            Command::Attack { .. } => "attack",
            Command::Defend { .. } => "defend",
            Command::Counter => "counter",
            Command::Flee => "flee",
            Command::UsePotion { .. } => "use-potion",
        }
    }
}

fn parse_start(args: &[&str]) -> Result<Command, CommandError> {
    let mut participants = Vec::new();
    let mut team = false;
    let mut turn_model = None;
    let mut mode = None;

    for arg in args {
        let Some(option) = arg.strip_prefix("--") else {
            participants.push(arg.to_string());
            continue;
        };
        if option == "team" {
            team = true;
        } else if let Ok(model) = option.parse::<TurnModel>() {
            turn_model = Some(model);
        } else if let Ok(m) = option.parse::<BattleMode>() {
            mode = Some(m);
        } else {
            return Err(CommandError::UnknownOption(arg.to_string()));
        }
    }
    if participants.is_empty() {
        return Err(CommandError::MissingArgument("participants"));
    }

    Ok(Command::StartBattle {
        participants,
        team,
        turn_model,
        mode,
    })
}

/// A parsed chat line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub message: MessageRef,
    pub user: String,
    pub command: Command,
}

static LINE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:#(\S+)\s+)?(\S+)\s+(\S+)(?:\s+(.*))?$").unwrap());

/// Parse `[#thread] <user> <verb> [args...]`
pub fn parse_line(line: &str, default_thread: &str) -> Result<Inbound, CommandError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(CommandError::Empty);
    }
    let caps = LINE_REGEX
        .captures(line)
        .ok_or(CommandError::MissingArgument("verb"))?;

    let thread = caps.get(1).map_or(default_thread, |m| m.as_str());
    let user = caps[2].to_string();
    let args: Vec<&str> = caps
        .get(4)
        .map(|m| m.as_str().split_whitespace().collect())
        .unwrap_or_default();
    let command = Command::parse(&caps[3], &args)?;

    Ok(Inbound {
        message: MessageRef::thread(thread),
        user,
        command,
    })
}

/// Runs commands against the engine and replies with the outcome
pub struct CommandHandler {
    engine: Arc<BattleEngine>,
    notifier: Arc<dyn Notifier>,
}

impl CommandHandler {
    pub fn new(engine: Arc<BattleEngine>, notifier: Arc<dyn Notifier>) -> Self {
        Self { engine, notifier }
    }

    pub fn engine(&self) -> &Arc<BattleEngine> {
        &self.engine
    }

    /// Execute a command and reply in its thread.
    ///
    /// Refusals are replied as plain text and also returned to the caller.
    pub async fn handle(&self, message: &MessageRef, user: &str, command: Command) -> Result<(), BattleError> {
        debug!(user = %user, verb = command.verb(), thread = %message.thread_id, "Handling command");
        match self.execute(message, user, command).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if !e.is_validation() {
                    warn!(user = %user, "Command failed: {}", e);
                }
                self.notifier.reply(message, &e.user_message()).await;
                Err(e)
            }
        }
    }

    /// Execute a parsed line
    pub async fn handle_inbound(&self, inbound: Inbound) -> Result<(), BattleError> {
        self.handle(&inbound.message, &inbound.user, inbound.command).await
    }

    async fn execute(&self, message: &MessageRef, user: &str, command: Command) -> Result<(), BattleError> {
        let engine = &self.engine;
        let report = match command {
            Command::CheckHp { target } => {
                let hp = engine.check_hp(user, target.as_deref()).await?;
                self.notifier.reply(message, &hp.to_string()).await;
                return Ok(());
            }
            Command::StartBattle {
                participants,
                team,
                turn_model,
                mode,
            } => {
                let options = StartOptions {
                    team,
                    turn_model,
                    mode,
                };
                let start = engine
                    .start_battle(&message.thread_id, user, &participants, options)
                    .await?;
                let mut mentions = start.participants.clone();
                if !mentions.iter().any(|p| p == user) {
                    mentions.push(user.to_string());
                }
                self.notifier
                    .reply_with_mentions(message, &start.to_string(), &mentions)
                    .await;
                return Ok(());
            }
            Command::StopBattle => engine.stop_battle(user).await?,
            Command::Attack { target } => engine.attack(user, target.as_deref()).await?,
            Command::Defend { target } => engine.defend(user, target.as_deref()).await?,
            Command::Counter => engine.counter(user).await?,
            Command::Flee => engine.flee(user).await?,
            Command::UsePotion { size, target } => {
                match engine.use_potion(user, &size, target.as_deref()).await? {
                    PotionOutcome::InBattle(report) => report,
                    PotionOutcome::OutOfBattle(heal) => {
                        self.notifier.reply(message, &heal.to_string()).await;
                        return Ok(());
                    }
                }
            }
        };

        self.notifier
            .reply_with_mentions(message, &report.to_string(), &report.mentions)
            .await;
        Ok(())
    }
}
