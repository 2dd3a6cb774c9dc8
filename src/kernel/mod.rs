//! # Arbitration Kernel
//!
//! Given the declarations of every suspended b-thread, picks the single event
//! of the round or reports that none is selectable.
//!
//! ```text
//! candidates  = requested events, in registration order then request order
//! forbidden   = candidates matched by any block set
//! valid       = candidates - forbidden
//!
//! valid non-empty  -> strategy picks one            -> Selected(Requested)
//! valid empty      -> first unblocked external event -> Selected(External)
//! otherwise        -> NoEventSelectable (deadlock round)
//! ```
//!
//! The kernel is pure: it never resumes threads or mutates declarations. The
//! scheduler feeds it and acts on the outcome.

pub mod strategy;

pub use strategy::{
    EventSelectionStrategy, Priority, RegistrationOrder, SeededRandom, SelectionPolicy,
};

use serde::Serialize;
use thiserror::Error;
use tracing::trace;

use crate::{bthread::ThreadId, declaration::Declaration, event::Event};

/// A suspended thread as seen by the kernel.
#[derive(Debug, Clone, Copy)]
pub struct Participant<'a> {
    pub id: ThreadId,
    pub name: &'a str,
    pub priority: i32,
    pub declaration: &'a Declaration,
}

/// A requested, unblocked event offered to the selection strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub event: Event,
    pub thread: ThreadId,
    pub thread_name: String,
    pub priority: i32,
}

/// A requested event vetoed this round, with the threads that requested and blocked it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockedCandidate {
    pub event: Event,
    pub requested_by: String,
    pub blocked_by: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectionSource {
    Requested { thread: ThreadId, thread_name: String },
    External { queue_index: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub event: Event,
    pub source: SelectionSource,
}

impl Selection {
    pub fn requested_by(&self) -> Option<&str> {
        match &self.source {
            SelectionSource::Requested { thread_name, .. } => Some(thread_name),
            SelectionSource::External { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Arbitration {
    Selected(Selection),
    NoEventSelectable { blocked: Vec<BlockedCandidate> },
}

/// Configuration smell surfaced for tests and diagnostics; never changes the outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    SelfBlockedRequest { thread: String, event: Event },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoundDecision {
    pub arbitration: Arbitration,
    pub observations: Vec<Observation>,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum KernelError {
    #[error("Selection strategy {strategy} returned index {index} for {candidates} candidates")]
    InvalidSelection {
        strategy: &'static str,
        index: usize,
        candidates: usize,
    },
}

pub type KernelResult<T> = Result<T, KernelError>;

/// Names of the participants whose block set matches `event`.
pub fn blockers<'a>(participants: &[Participant<'a>], event: &Event) -> Vec<&'a str> {
    participants
        .iter()
        .filter(|p| p.declaration.blocks().matches(event))
        .map(|p| p.name)
        .collect()
}

pub fn is_blocked(participants: &[Participant<'_>], event: &Event) -> bool {
    participants
        .iter()
        .any(|p| p.declaration.blocks().matches(event))
}

/// Every requested event, in registration order then request order.
pub fn candidates(participants: &[Participant<'_>]) -> Vec<Candidate> {
    participants
        .iter()
        .flat_map(|p| {
            p.declaration.requested().iter().map(move |event| Candidate {
                event: event.clone(),
                thread: p.id,
                thread_name: p.name.to_string(),
                priority: p.priority,
            })
        })
        .collect()
}

/// Threads to resume for `event`, in registration order.
pub fn matched_threads(participants: &[Participant<'_>], event: &Event) -> Vec<ThreadId> {
    participants
        .iter()
        .filter(|p| p.declaration.resumes_on(event))
        .map(|p| p.id)
        .collect()
}

/// Runs one arbitration. `participants` must be sorted by registration order;
/// `external` is the host's FIFO queue of injected events.
pub fn arbitrate(
    participants: &[Participant<'_>],
    external: &[Event],
    strategy: &mut dyn EventSelectionStrategy,
) -> KernelResult<RoundDecision> {
    let observations: Vec<Observation> = participants
        .iter()
        .flat_map(|p| {
            p.declaration
                .self_blocked()
                .map(move |event| Observation::SelfBlockedRequest {
                    thread: p.name.to_string(),
                    event: event.clone(),
                })
        })
        .collect();

    let mut valid = Vec::new();
    let mut blocked = Vec::new();
    for candidate in candidates(participants) {
        let blocked_by = blockers(participants, &candidate.event);
        if blocked_by.is_empty() {
            valid.push(candidate);
        } else {
            trace!(event = %candidate.event, ?blocked_by, "candidate blocked");
            blocked.push(BlockedCandidate {
                event: candidate.event,
                requested_by: candidate.thread_name,
                blocked_by: blocked_by.into_iter().map(str::to_string).collect(),
            });
        }
    }

    let arbitration = if !valid.is_empty() {
        let index = if valid.len() == 1 {
            0
        } else {
            strategy.select(&valid)
        };
        if index >= valid.len() {
            return Err(KernelError::InvalidSelection {
                strategy: strategy.name(),
                index,
                candidates: valid.len(),
            });
        }
        let chosen = valid.swap_remove(index);
        Arbitration::Selected(Selection {
            event: chosen.event,
            source: SelectionSource::Requested {
                thread: chosen.thread,
                thread_name: chosen.thread_name,
            },
        })
    } else {
        match external.iter().position(|event| !is_blocked(participants, event)) {
            Some(queue_index) => Arbitration::Selected(Selection {
                event: external[queue_index].clone(),
                source: SelectionSource::External { queue_index },
            }),
            None => Arbitration::NoEventSelectable { blocked },
        }
    };

    Ok(RoundDecision {
        arbitration,
        observations,
    })
}

#[cfg(test)]
mod tests {
    use super::strategy::MockEventSelectionStrategy;
    use super::*;
    use crate::event::EventSet;
    use pretty_assertions::assert_eq;

    fn participants(declarations: &[(&'static str, Declaration)]) -> Vec<Participant<'static>> {
        // Leaked so the borrowed participants can outlive the helper in tests.
        let declarations: &'static [(&'static str, Declaration)] =
            Box::leak(declarations.to_vec().into_boxed_slice());
        declarations
            .iter()
            .enumerate()
            .map(|(i, (name, declaration))| Participant {
                id: ThreadId(i as u64),
                name: *name,
                priority: 0,
                declaration,
            })
            .collect()
    }

    fn selected(decision: &RoundDecision) -> Option<&str> {
        match &decision.arbitration {
            Arbitration::Selected(selection) => Some(selection.event.name()),
            Arbitration::NoEventSelectable { .. } => None,
        }
    }

    #[test]
    fn test_single_requester_is_selected() {
        let ps = participants(&[("a", Declaration::new().request(Event::new("X")))]);
        let decision = arbitrate(&ps, &[], &mut RegistrationOrder).unwrap();
        assert_eq!(selected(&decision), Some("X"));
        assert!(decision.observations.is_empty());
    }

    #[test]
    fn test_blocked_only_candidate_is_deadlock() {
        let ps = participants(&[
            ("limiter", Declaration::new().block("ADD_DRY")),
            ("mixer", Declaration::new().request(Event::new("ADD_DRY"))),
        ]);
        let decision = arbitrate(&ps, &[], &mut RegistrationOrder).unwrap();
        assert_eq!(
            decision.arbitration,
            Arbitration::NoEventSelectable {
                blocked: vec![BlockedCandidate {
                    event: Event::new("ADD_DRY"),
                    requested_by: "mixer".to_string(),
                    blocked_by: vec!["limiter".to_string()],
                }]
            }
        );
    }

    #[test]
    fn test_registration_order_breaks_ties() {
        let ps = participants(&[
            ("first", Declaration::new().requests([Event::new("B"), Event::new("A")])),
            ("second", Declaration::new().request(Event::new("C"))),
        ]);
        let decision = arbitrate(&ps, &[], &mut RegistrationOrder).unwrap();
        assert_eq!(selected(&decision), Some("B"));
    }

    #[test]
    fn test_waiting_alone_is_no_event_selectable() {
        let ps = participants(&[("w", Declaration::new().wait_for(EventSet::any()))]);
        let decision = arbitrate(&ps, &[], &mut RegistrationOrder).unwrap();
        assert_eq!(
            decision.arbitration,
            Arbitration::NoEventSelectable { blocked: vec![] }
        );
    }

    #[test]
    fn test_external_event_used_when_nothing_requested() {
        let ps = participants(&[
            ("w", Declaration::new().wait_for("TIMEOUT").block("DENIED")),
        ]);
        let external = vec![Event::new("DENIED"), Event::new("TIMEOUT")];
        let decision = arbitrate(&ps, &external, &mut RegistrationOrder).unwrap();
        assert_eq!(
            decision.arbitration,
            Arbitration::Selected(Selection {
                event: Event::new("TIMEOUT"),
                source: SelectionSource::External { queue_index: 1 },
            })
        );
    }

    #[test]
    fn test_requested_events_take_precedence_over_external() {
        let ps = participants(&[("r", Declaration::new().request(Event::new("INTERNAL")))]);
        let decision = arbitrate(&ps, &[Event::new("EXTERNAL")], &mut RegistrationOrder).unwrap();
        assert_eq!(selected(&decision), Some("INTERNAL"));
    }

    #[test]
    fn test_self_blocked_request_is_observed_and_block_wins() {
        let ps = participants(&[
            (
                "confused",
                Declaration::new().request(Event::new("A")).block("A"),
            ),
            ("other", Declaration::new().request(Event::new("B"))),
        ]);
        let decision = arbitrate(&ps, &[], &mut RegistrationOrder).unwrap();
        assert_eq!(selected(&decision), Some("B"));
        assert_eq!(
            decision.observations,
            vec![Observation::SelfBlockedRequest {
                thread: "confused".to_string(),
                event: Event::new("A"),
            }]
        );
    }

    #[test]
    fn test_strategy_not_consulted_for_single_candidate() {
        let ps = participants(&[("a", Declaration::new().request(Event::new("X")))]);
        let mut strategy = MockEventSelectionStrategy::new();
        strategy.expect_select().times(0);
        let decision = arbitrate(&ps, &[], &mut strategy).unwrap();
        assert_eq!(selected(&decision), Some("X"));
    }

    #[test]
    fn test_strategy_sees_only_unblocked_candidates() {
        let ps = participants(&[
            ("a", Declaration::new().requests([Event::new("X"), Event::new("Y")])),
            ("b", Declaration::new().request(Event::new("Z")).block("Y")),
        ]);
        let mut strategy = MockEventSelectionStrategy::new();
        strategy
            .expect_select()
            .times(1)
            .withf(|candidates| {
                candidates
                    .iter()
                    .map(|c| c.event.name())
                    .eq(["X", "Z"].into_iter())
            })
            .return_const(1usize);
        let decision = arbitrate(&ps, &[], &mut strategy).unwrap();
        assert_eq!(selected(&decision), Some("Z"));
    }

    #[test]
    fn test_out_of_range_selection_is_an_error() {
        let ps = participants(&[
            ("a", Declaration::new().request(Event::new("X"))),
            ("b", Declaration::new().request(Event::new("Y"))),
        ]);
        let mut strategy = MockEventSelectionStrategy::new();
        strategy.expect_select().return_const(7usize);
        strategy.expect_name().return_const("broken");
        assert_eq!(
            arbitrate(&ps, &[], &mut strategy),
            Err(KernelError::InvalidSelection {
                strategy: "broken",
                index: 7,
                candidates: 2,
            })
        );
    }

    #[test]
    fn test_matched_threads_by_wait_or_request() {
        let ps = participants(&[
            ("requester", Declaration::new().request(Event::new("X"))),
            ("waiter", Declaration::new().wait_for(EventSet::names(["X", "Y"]))),
            ("bystander", Declaration::new().wait_for("Z")),
            ("blocker", Declaration::new().block("X")),
        ]);
        assert_eq!(
            matched_threads(&ps, &Event::new("X")),
            vec![ThreadId(0), ThreadId(1)]
        );
    }
}
