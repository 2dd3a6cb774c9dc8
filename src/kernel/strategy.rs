//! Tie-break policies used when more than one candidate event is selectable.
//!
//! Candidates reach a strategy already ordered by thread registration order,
//! then by position in each thread's request list. Every strategy here is
//! deterministic: the same candidates (and, for [`SeededRandom`], the same
//! seed and call history) always produce the same choice.

use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::Candidate;

#[mockall::automock]
pub trait EventSelectionStrategy: Send {
    fn name(&self) -> &'static str;

    /// Returns the index of the chosen candidate. `candidates` is never empty.
    fn select(&mut self, candidates: &[Candidate]) -> usize;
}

/// First candidate of the earliest registered requesting thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct RegistrationOrder;

impl EventSelectionStrategy for RegistrationOrder {
    fn name(&self) -> &'static str {
        "registration_order"
    }

    fn select(&mut self, _candidates: &[Candidate]) -> usize {
        0
    }
}

/// Highest thread priority wins, ties fall back to registration order.
#[derive(Debug, Default, Clone, Copy)]
pub struct Priority;

impl EventSelectionStrategy for Priority {
    fn name(&self) -> &'static str {
        "priority"
    }

    fn select(&mut self, candidates: &[Candidate]) -> usize {
        let mut best = 0;
        for (index, candidate) in candidates.iter().enumerate().skip(1) {
            if candidate.priority > candidates[best].priority {
                best = index;
            }
        }
        best
    }
}

/// Uniform choice from a seeded generator; reproducible for a given seed.
#[derive(Debug, Clone)]
pub struct SeededRandom {
    rng: StdRng,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl EventSelectionStrategy for SeededRandom {
    fn name(&self) -> &'static str {
        "seeded_random"
    }

    fn select(&mut self, candidates: &[Candidate]) -> usize {
        self.rng.gen_range(0..candidates.len())
    }
}

/// Configurable name of a built-in strategy.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum::EnumString,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SelectionPolicy {
    #[default]
    RegistrationOrder,
    Priority,
    SeededRandom,
}

impl SelectionPolicy {
    pub fn build(self, seed: u64) -> Box<dyn EventSelectionStrategy> {
        match self {
            SelectionPolicy::RegistrationOrder => Box::new(RegistrationOrder),
            SelectionPolicy::Priority => Box::new(Priority),
            SelectionPolicy::SeededRandom => Box::new(SeededRandom::new(seed)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;
    use crate::{bthread::ThreadId, event::Event};

    fn candidate(thread: u64, name: &str, priority: i32) -> Candidate {
        Candidate {
            event: Event::new(name),
            thread: ThreadId(thread),
            thread_name: format!("t{}", thread),
            priority,
        }
    }

    #[test]
    fn test_priority_prefers_highest_then_earliest() {
        let candidates = vec![
            candidate(0, "A", 1),
            candidate(1, "B", 5),
            candidate(2, "C", 5),
        ];
        assert_eq!(Priority.select(&candidates), 1);
        assert_eq!(Priority.select(&candidates[..1]), 0);
    }

    #[test]
    fn test_seeded_random_is_reproducible() {
        let candidates: Vec<Candidate> = (0..8).map(|i| candidate(i, "E", 0)).collect();
        let mut first = SeededRandom::new(42);
        let mut second = SeededRandom::new(42);
        let a: Vec<usize> = (0..32).map(|_| first.select(&candidates)).collect();
        let b: Vec<usize> = (0..32).map(|_| second.select(&candidates)).collect();
        assert_eq!(a, b);
        assert!(a.iter().all(|i| *i < candidates.len()));
    }

    #[test]
    fn test_policy_parses_from_string() {
        assert_eq!(
            SelectionPolicy::from_str("seeded_random").unwrap(),
            SelectionPolicy::SeededRandom
        );
        assert_eq!(SelectionPolicy::Priority.build(0).name(), "priority");
        assert_eq!(SelectionPolicy::default().to_string(), "registration_order");
    }
}
