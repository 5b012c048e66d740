//! Healing potions

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Potion size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PotionSize {
    /// 소형
    Small,
    /// 중형
    Medium,
    /// 대형
    Large,
}

impl PotionSize {
    /// Size label as it appears on items
    pub fn label(self) -> &'static str {
        match self {
            PotionSize::Small => "소형",
            PotionSize::Medium => "중형",
            PotionSize::Large => "대형",
        }
    }

    /// Inventory item name for this size
    pub fn item_name(self) -> String {
        format!("{} 포션", self.label())
    }
}

impl FromStr for PotionSize {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "소형" | "small" | "s" => Ok(PotionSize::Small),
            "중형" | "medium" | "m" => Ok(PotionSize::Medium),
            "대형" | "large" | "l" => Ok(PotionSize::Large),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for PotionSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.item_name())
    }
}

/// Heal amount per potion size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PotionTable {
    pub small: i32,
    pub medium: i32,
    pub large: i32,
}

impl Default for PotionTable {
    fn default() -> Self {
        Self {
            small: 20,
            medium: 50,
            large: 100,
        }
    }
}

impl PotionTable {
    /// HP restored by one potion of this size
    pub fn heal_amount(&self, size: PotionSize) -> i32 {
        match size {
            PotionSize::Small => self.small,
            PotionSize::Medium => self.medium,
            PotionSize::Large => self.large,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sizes() {
        assert_eq!("소형".parse::<PotionSize>(), Ok(PotionSize::Small));
        assert_eq!("MEDIUM".parse::<PotionSize>(), Ok(PotionSize::Medium));
        assert_eq!("대형".parse::<PotionSize>(), Ok(PotionSize::Large));
        assert!("huge".parse::<PotionSize>().is_err());
    }

    #[test]
    fn test_item_names_and_amounts() {
        assert_eq!(PotionSize::Small.item_name(), "소형 포션");
        let table = PotionTable::default();
        assert_eq!(table.heal_amount(PotionSize::Small), 20);
        assert_eq!(table.heal_amount(PotionSize::Large), 100);
    }
}
