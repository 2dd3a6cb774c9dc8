//! # Declarations
//!
//! A [`Declaration`] is what a b-thread publishes each time it synchronizes:
//!
//! - `request`: concrete events it proposes as the next occurrence, in
//!   preference order. The kernel never invents events; candidates come only
//!   from here (and from the host's external queue).
//! - `wait_for`: events it wants to be resumed by without proposing them.
//! - `block`: events it vetoes while this declaration is pending.
//!
//! Every part defaults to "none".

use std::fmt;

use thiserror::Error;

use crate::event::{Event, EventSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum DeclarationField {
    Request,
    WaitFor,
    Block,
}

/// Malformed declaration, reported from the `sync` call that published it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeclarationError {
    #[error("Event name must not be empty in {field}")]
    EmptyEventName { field: DeclarationField },
    #[error("Payload predicate in {field} has no label")]
    UnlabeledPredicate { field: DeclarationField },
    #[error("Union in {field} has no members")]
    EmptyUnion { field: DeclarationField },
}

pub type DeclarationResult<T> = Result<T, DeclarationError>;

/// ```rust
/// # use bpsync::declaration::Declaration;
/// # use bpsync::event::{Event, EventSet};
/// let declaration = Declaration::new()
///     .wait_for(EventSet::names(["ADD_DRY", "ADD_WET"]))
///     .block("ADD_DRY");
/// assert!(declaration.resumes_on(&Event::new("ADD_WET")));
/// assert!(declaration.blocks().matches(&Event::new("ADD_DRY")));
/// ```
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Declaration {
    request: Vec<Event>,
    wait_for: EventSet,
    block: EventSet,
}

impl Declaration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `event` to the request list.
    pub fn request(mut self, event: Event) -> Self {
        self.request.push(event);
        self
    }

    pub fn requests(mut self, events: impl IntoIterator<Item = Event>) -> Self {
        self.request.extend(events);
        self
    }

    pub fn wait_for(mut self, set: impl Into<EventSet>) -> Self {
        self.wait_for = set.into();
        self
    }

    pub fn block(mut self, set: impl Into<EventSet>) -> Self {
        self.block = set.into();
        self
    }

    pub fn requested(&self) -> &[Event] {
        &self.request
    }

    pub fn waits_for(&self) -> &EventSet {
        &self.wait_for
    }

    pub fn blocks(&self) -> &EventSet {
        &self.block
    }

    pub fn requests_event(&self, event: &Event) -> bool {
        self.request.iter().any(|requested| requested.same_name(event))
    }

    /// A thread resumes iff the selected event is in its wait set or its own request list.
    pub fn resumes_on(&self, event: &Event) -> bool {
        self.requests_event(event) || self.wait_for.matches(event)
    }

    /// Requested events this same declaration blocks. The block always wins.
    pub fn self_blocked(&self) -> impl Iterator<Item = &Event> {
        self.request.iter().filter(|event| self.block.matches(event))
    }

    /// A declaration that can never be resumed: nothing requested, nothing awaited.
    pub fn is_passive(&self) -> bool {
        self.request.is_empty() && self.wait_for.is_none()
    }

    pub fn validate(&self) -> DeclarationResult<()> {
        for event in &self.request {
            if event.name().trim().is_empty() {
                return Err(DeclarationError::EmptyEventName {
                    field: DeclarationField::Request,
                });
            }
        }
        self.wait_for.validate(DeclarationField::WaitFor)?;
        self.block.validate(DeclarationField::Block)
    }
}

impl fmt::Display for Declaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let requested: Vec<String> = self.request.iter().map(ToString::to_string).collect();
        write!(
            f,
            "request=[{}] waitFor={} block={}",
            requested.join(", "),
            self.wait_for,
            self.block
        )
    }
}
