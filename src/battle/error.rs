//! Battle errors

use thiserror::Error;

use crate::characters::RepositoryError;

/// Reasons a battle command is refused.
///
/// Everything except [`BattleError::Repository`] is a validation failure:
/// the command is rejected before any state changes.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BattleError {
    #[error("a battle needs 2, 4 or 8 participants (got {0})")]
    InvalidSize(usize),

    #[error("{0} is already in a battle")]
    AlreadyInBattle(String),

    #[error("{0} is not a registered character")]
    UnregisteredParticipant(String),

    #[error("you are not a registered character")]
    UnregisteredUser,

    #[error("there is no active battle")]
    NoActiveBattle,

    #[error("it is not your turn (waiting for {0})")]
    NotYourTurn(String),

    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error("{0} is on the wrong team for that")]
    WrongTeam(String),

    #[error("only the GM can stop this battle")]
    NotGm,

    #[error("you are not holding a {0}")]
    NotHoldingItem(String),

    #[error("unknown potion size: {0}")]
    UnknownPotion(String),

    #[error("you have already acted this round")]
    AlreadyActed,

    #[error("you can only flee from a 1:1 battle")]
    FleeNotAllowed,

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl BattleError {
    /// Whether this is a rejected command rather than a backend failure
    pub fn is_validation(&self) -> bool {
        !matches!(self, BattleError::Repository(_))
    }

    /// Text shown to the player
    pub fn user_message(&self) -> String {
        match self {
            BattleError::Repository(_) => {
                "Something went wrong reading character data. Please try again.".to_string()
            }
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_messages() {
        assert_eq!(
            BattleError::NotYourTurn("Aria".into()).user_message(),
            "it is not your turn (waiting for Aria)"
        );
        let backend = BattleError::from(RepositoryError::Backend("disk on fire".into()));
        assert!(!backend.is_validation());
        assert!(!backend.user_message().contains("disk"));
        assert!(BattleError::NotGm.is_validation());
    }
}
