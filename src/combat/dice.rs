//! Dice rolling
//!
//! All randomness in a battle flows through a [`Roller`], so a battle can be
//! driven by real entropy, a fixed seed, or a scripted list of rolls.

use std::collections::VecDeque;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Source of die results
pub trait Roller: Send {
    /// Roll one die with the given number of sides (1..=sides)
    fn roll(&mut self, sides: u32) -> u32;

    /// Roll a single d20
    fn d20(&mut self) -> u32 {
        self.roll(20)
    }

    /// Roll a single d100
    fn d100(&mut self) -> u32 {
        self.roll(100)
    }
}

/// Roller backed by a seedable PRNG
#[derive(Debug, Clone)]
pub struct RandomRoller {
    rng: StdRng,
}

impl RandomRoller {
    /// Create a roller seeded from the operating system
    pub fn from_os() -> Self {
        Self {
            rng: StdRng::from_os_rng(),
        }
    }

    /// Create a reproducible roller
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for RandomRoller {
    fn default() -> Self {
        Self::from_os()
    }
}

impl Roller for RandomRoller {
    fn roll(&mut self, sides: u32) -> u32 {
        self.rng.random_range(1..=sides.max(1))
    }
}

/// Roller that replays a fixed list of results.
///
/// Each scripted value is clamped into `1..=sides` of the die being rolled.
/// Once the script runs out, every die rolls its fallback value.
#[derive(Debug, Clone)]
pub struct ScriptedRoller {
    script: VecDeque<u32>,
    fallback: u32,
}

impl ScriptedRoller {
    /// Create a roller from a sequence of results
    pub fn new(rolls: impl IntoIterator<Item = u32>) -> Self {
        Self {
            script: rolls.into_iter().collect(),
            fallback: 10,
        }
    }

    /// Value rolled once the script is exhausted
    pub fn with_fallback(mut self, fallback: u32) -> Self {
        self.fallback = fallback;
        self
    }

    /// Append more results to the script
    pub fn push(&mut self, rolls: impl IntoIterator<Item = u32>) {
        self.script.extend(rolls);
    }

    /// Number of scripted rolls not yet consumed
    pub fn remaining(&self) -> usize {
        self.script.len()
    }
}

impl Roller for ScriptedRoller {
    fn roll(&mut self, sides: u32) -> u32 {
        let value = self.script.pop_front().unwrap_or(self.fallback);
        value.clamp(1, sides.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_bounds() {
        let mut roller = RandomRoller::seeded(7);
        for _ in 0..200 {
            let d20 = roller.d20();
            assert!((1..=20).contains(&d20), "d20 out of range: {}", d20);
            let d100 = roller.d100();
            assert!((1..=100).contains(&d100), "d100 out of range: {}", d100);
        }
    }

    #[test]
    fn test_seeded_is_reproducible() {
        let mut a = RandomRoller::seeded(42);
        let mut b = RandomRoller::seeded(42);
        let first: Vec<u32> = (0..10).map(|_| a.d20()).collect();
        let second: Vec<u32> = (0..10).map(|_| b.d20()).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_scripted_replay_and_fallback() {
        let mut roller = ScriptedRoller::new([15, 5]).with_fallback(3);
        assert_eq!(roller.remaining(), 2);
        assert_eq!(roller.d20(), 15);
        assert_eq!(roller.d20(), 5);
        assert_eq!(roller.d20(), 3);
        assert_eq!(roller.remaining(), 0);
    }

    #[test]
    fn test_scripted_clamps_to_die() {
        let mut roller = ScriptedRoller::new([99, 0]);
        assert_eq!(roller.d20(), 20);
        assert_eq!(roller.d20(), 1);
    }
}
