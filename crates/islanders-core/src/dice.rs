//! Dice strategies for the session engine.
//!
//! Two interchangeable strategies sit behind [`DiceEngine`]:
//! - `Random`: independent uniform sampling per die.
//! - `Balanced`: a 36-card deck (one card per die pair) drawn without
//!   replacement, with a short recency window that damps streaks of the
//!   same total. Long-run totals stay near-uniform while short-run
//!   repeats become rare.
//!
//! Both honor an `avoid` set of forbidden totals, used to keep a 7 off a
//! player's very first roll of the game.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Which dice strategy a session uses, from its config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DiceMode {
    #[default]
    Random,
    Balanced,
}

/// Refill the deck once fewer cards than this remain, checked before a draw.
const RESHUFFLE_BELOW: usize = 12;
/// How many recent totals the balanced deck remembers.
const RECENT_WINDOW: usize = 5;
/// Weight reduction applied per recent occurrence of a total.
const RECENCY_STEP: f64 = 0.30;
/// Recency reduction never removes a total entirely on its own.
const RECENCY_CAP: f64 = 0.95;

/// A two-die roll. Each die is 1..=6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiceRoll {
    pub d1: u8,
    pub d2: u8,
}

impl DiceRoll {
    pub fn total(&self) -> u8 {
        self.d1 + self.d2
    }
}

/// Per-total slice of the 36-card deck.
#[derive(Debug, Clone, Default)]
struct TotalEntry {
    /// Concrete (d1, d2) pairs still in the deck for this total.
    pairs: Vec<(u8, u8)>,
    /// How many of the recent-window draws had this total.
    recent: u32,
}

#[derive(Debug, Clone)]
struct BalancedDeck {
    /// Indexed by total - 2 (totals 2..=12).
    by_total: Vec<TotalEntry>,
    recent_rolls: VecDeque<u8>,
    cards_left: usize,
}

impl BalancedDeck {
    fn new() -> Self {
        let mut deck = Self {
            by_total: vec![TotalEntry::default(); 11],
            recent_rolls: VecDeque::new(),
            cards_left: 0,
        };
        deck.reshuffle();
        deck
    }

    fn entry_mut(&mut self, total: u8) -> &mut TotalEntry {
        &mut self.by_total[total as usize - 2]
    }

    /// Refill all 36 cards and clear the recency window.
    fn reshuffle(&mut self) {
        for entry in &mut self.by_total {
            entry.pairs.clear();
            entry.recent = 0;
        }
        for d1 in 1..=6u8 {
            for d2 in 1..=6u8 {
                self.entry_mut(d1 + d2).pairs.push((d1, d2));
            }
        }
        self.cards_left = 36;
        self.recent_rolls.clear();
    }

    fn push_recent(&mut self, total: u8) {
        self.recent_rolls.push_back(total);
        self.entry_mut(total).recent += 1;
        while self.recent_rolls.len() > RECENT_WINDOW {
            if let Some(old) = self.recent_rolls.pop_front() {
                let entry = self.entry_mut(old);
                entry.recent = entry.recent.saturating_sub(1);
            }
        }
    }

    fn draw(&mut self, rng: &mut StdRng, avoid: &[u8]) -> DiceRoll {
        if self.cards_left < RESHUFFLE_BELOW {
            self.reshuffle();
        }

        // Dynamic weight per total: cards remaining, damped by recency,
        // zeroed for avoided or exhausted totals.
        let mut weights = [0.0f64; 11];
        let mut total_weight = 0.0;
        for (i, entry) in self.by_total.iter().enumerate() {
            let total = (i + 2) as u8;
            if entry.pairs.is_empty() || avoid.contains(&total) {
                continue;
            }
            let reduction = (entry.recent as f64 * RECENCY_STEP).min(RECENCY_CAP);
            let w = entry.pairs.len() as f64 * (1.0 - reduction);
            weights[i] = w;
            total_weight += w;
        }

        // Avoid set too strict: ignore it for this draw only.
        if total_weight <= 0.0 {
            for (i, entry) in self.by_total.iter().enumerate() {
                weights[i] = entry.pairs.len() as f64;
                total_weight += weights[i];
            }
        }

        let mut r = rng.gen::<f64>() * total_weight;
        let mut chosen = None;
        for (i, &w) in weights.iter().enumerate() {
            if w <= 0.0 {
                continue;
            }
            if r <= w {
                chosen = Some(i);
                break;
            }
            r -= w;
        }
        // Floating-point fallthrough lands on the last non-empty total.
        let chosen = chosen
            .or_else(|| self.by_total.iter().rposition(|e| !e.pairs.is_empty()))
            .unwrap_or(5);

        let entry = &mut self.by_total[chosen];
        let pair_idx = rng.gen_range(0..entry.pairs.len());
        let (d1, d2) = entry.pairs.swap_remove(pair_idx);
        self.cards_left -= 1;
        self.push_recent(d1 + d2);

        DiceRoll { d1, d2 }
    }
}

#[derive(Debug, Clone)]
enum Strategy {
    Uniform,
    Balanced(BalancedDeck),
}

/// Produces two-die rolls for a session.
#[derive(Debug, Clone)]
pub struct DiceEngine {
    rng: StdRng,
    strategy: Strategy,
}

impl DiceEngine {
    pub fn new(mode: DiceMode) -> Self {
        Self::with_rng(mode, StdRng::from_entropy())
    }

    /// Deterministic engine for tests.
    pub fn from_seed(mode: DiceMode, seed: u64) -> Self {
        Self::with_rng(mode, StdRng::seed_from_u64(seed))
    }

    fn with_rng(mode: DiceMode, rng: StdRng) -> Self {
        let strategy = match mode {
            DiceMode::Random => Strategy::Uniform,
            DiceMode::Balanced => Strategy::Balanced(BalancedDeck::new()),
        };
        Self { rng, strategy }
    }

    /// Roll both dice. The returned total is never a member of `avoid`
    /// unless the avoid set forbids every drawable total.
    pub fn roll(&mut self, avoid: &[u8]) -> DiceRoll {
        match &mut self.strategy {
            Strategy::Uniform => {
                let mut d1 = self.rng.gen_range(1..=6);
                let mut d2 = self.rng.gen_range(1..=6);
                while avoid.contains(&(d1 + d2)) {
                    d1 = self.rng.gen_range(1..=6);
                    d2 = self.rng.gen_range(1..=6);
                }
                DiceRoll { d1, d2 }
            }
            Strategy::Balanced(deck) => deck.draw(&mut self.rng, avoid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn uniform_rolls_stay_in_range() {
        let mut dice = DiceEngine::from_seed(DiceMode::Random, 1);
        for _ in 0..200 {
            let roll = dice.roll(&[]);
            assert!((1..=6).contains(&roll.d1));
            assert!((1..=6).contains(&roll.d2));
        }
    }

    #[test]
    fn uniform_respects_avoid_set() {
        let mut dice = DiceEngine::from_seed(DiceMode::Random, 2);
        for _ in 0..500 {
            assert_ne!(dice.roll(&[7]).total(), 7);
        }
    }

    #[test]
    fn balanced_respects_avoid_set() {
        let mut dice = DiceEngine::from_seed(DiceMode::Balanced, 3);
        for _ in 0..500 {
            let total = dice.roll(&[2, 7, 12]).total();
            assert!(![2, 7, 12].contains(&total));
        }
    }

    #[test]
    fn balanced_never_repeats_a_card_between_reshuffles() {
        let mut dice = DiceEngine::from_seed(DiceMode::Balanced, 4);
        // The deck reshuffles when fewer than 12 cards remain, so the
        // first 25 draws come from one deck fill.
        let mut seen = HashSet::new();
        for _ in 0..25 {
            let roll = dice.roll(&[]);
            assert!(
                seen.insert((roll.d1, roll.d2)),
                "pair ({}, {}) drawn twice before reshuffle",
                roll.d1,
                roll.d2
            );
        }
    }

    #[test]
    fn balanced_ignores_avoid_set_when_exhaustive() {
        let mut dice = DiceEngine::from_seed(DiceMode::Balanced, 5);
        let all: Vec<u8> = (2..=12).collect();
        // Must still produce a legal pair rather than spin forever.
        let roll = dice.roll(&all);
        assert!((2..=12).contains(&roll.total()));
    }

    #[test]
    fn balanced_totals_cover_the_range_over_time() {
        let mut dice = DiceEngine::from_seed(DiceMode::Balanced, 6);
        let mut seen = HashSet::new();
        for _ in 0..300 {
            seen.insert(dice.roll(&[]).total());
        }
        for total in 2..=12u8 {
            assert!(seen.contains(&total), "total {total} never drawn");
        }
    }
}
