//! Selectors over [`Event`]s used in wait and block declarations.

use std::{collections::BTreeSet, fmt, sync::Arc};

use super::{Event, Value};
use crate::declaration::{DeclarationError, DeclarationField, DeclarationResult};

pub type PayloadTest = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Payload-refined selector. Matches events whose payload satisfies `test`,
/// optionally restricted to a single event name.
#[derive(Clone)]
pub struct EventPredicate {
    label: String,
    name: Option<String>,
    test: PayloadTest,
}

impl EventPredicate {
    pub fn new(
        label: impl Into<String>,
        name: Option<String>,
        test: impl Fn(&Value) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            label: label.into(),
            name,
            test: Arc::new(test),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn event_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn matches(&self, event: &Event) -> bool {
        if let Some(name) = &self.name {
            if name != event.name() {
                return false;
            }
        }
        (self.test)(event.payload())
    }
}

impl fmt::Debug for EventPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventPredicate")
            .field("label", &self.label)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

// Closures have no structural equality; the same Arc is the same predicate.
impl PartialEq for EventPredicate {
    fn eq(&self, other: &Self) -> bool {
        self.label == other.label && self.name == other.name && Arc::ptr_eq(&self.test, &other.test)
    }
}

/// # EventSet
///
/// A selector over events, tested with [`EventSet::matches`].
///
/// | Variant     | Matches                                           |
/// |-------------|---------------------------------------------------|
/// | `None`      | nothing (the default, `bp.none`)                  |
/// | `Any`       | every event                                       |
/// | `Named`     | events with exactly this name                     |
/// | `Names`     | events whose name is in the set                   |
/// | `Predicate` | events whose payload satisfies a labeled closure  |
/// | `Union`     | events matched by any member                      |
///
/// ```rust
/// # use bpsync::event::{Event, EventSet};
/// let additions = EventSet::names(["ADD_DRY", "ADD_WET"]);
/// assert!(additions.matches(&Event::new("ADD_WET")));
/// assert!(!additions.matches(&Event::new("VISCOSITY")));
///
/// let too_thick = EventSet::payload("VISCOSITY", "viscosity > 2", |v| {
///     v.as_i64().is_some_and(|v| v > 2)
/// });
/// assert!(too_thick.matches(&Event::with_payload("VISCOSITY", 3)));
/// assert!(!too_thick.matches(&Event::with_payload("VISCOSITY", 2)));
/// ```
#[derive(Debug, Clone, PartialEq, Default)]
pub enum EventSet {
    #[default]
    None,
    Any,
    Named(String),
    Names(BTreeSet<String>),
    Predicate(EventPredicate),
    Union(Vec<EventSet>),
}

impl EventSet {
    pub fn none() -> Self {
        EventSet::None
    }

    pub fn any() -> Self {
        EventSet::Any
    }

    pub fn named(name: impl Into<String>) -> Self {
        EventSet::Named(name.into())
    }

    pub fn names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        EventSet::Names(names.into_iter().map(Into::into).collect())
    }

    /// Events named `name` whose payload satisfies `test`.
    pub fn payload(
        name: impl Into<String>,
        label: impl Into<String>,
        test: impl Fn(&Value) -> bool + Send + Sync + 'static,
    ) -> Self {
        EventSet::Predicate(EventPredicate::new(label, Some(name.into()), test))
    }

    /// Events of any name whose payload satisfies `test`.
    pub fn predicate(
        label: impl Into<String>,
        test: impl Fn(&Value) -> bool + Send + Sync + 'static,
    ) -> Self {
        EventSet::Predicate(EventPredicate::new(label, None, test))
    }

    pub fn union(sets: impl IntoIterator<Item = EventSet>) -> Self {
        EventSet::Union(sets.into_iter().collect())
    }

    pub fn matches(&self, event: &Event) -> bool {
        match self {
            EventSet::None => false,
            EventSet::Any => true,
            EventSet::Named(name) => name == event.name(),
            EventSet::Names(names) => names.contains(event.name()),
            EventSet::Predicate(predicate) => predicate.matches(event),
            EventSet::Union(sets) => sets.iter().any(|set| set.matches(event)),
        }
    }

    /// True when the set can never match anything.
    pub fn is_none(&self) -> bool {
        match self {
            EventSet::None => true,
            EventSet::Names(names) => names.is_empty(),
            EventSet::Union(sets) => sets.iter().all(EventSet::is_none),
            _ => false,
        }
    }

    /// Rejects malformed selectors. `field` names the declaration slot being
    /// checked so the error points at the offending part of the `sync` call.
    pub fn validate(&self, field: DeclarationField) -> DeclarationResult<()> {
        match self {
            EventSet::None | EventSet::Any => Ok(()),
            EventSet::Named(name) => check_name(name, field),
            EventSet::Names(names) => names.iter().try_for_each(|name| check_name(name, field)),
            EventSet::Predicate(predicate) => {
                if predicate.label.trim().is_empty() {
                    return Err(DeclarationError::UnlabeledPredicate { field });
                }
                match &predicate.name {
                    Some(name) => check_name(name, field),
                    None => Ok(()),
                }
            }
            EventSet::Union(sets) if sets.is_empty() => Err(DeclarationError::EmptyUnion { field }),
            EventSet::Union(sets) => sets.iter().try_for_each(|set| set.validate(field)),
        }
    }
}

fn check_name(name: &str, field: DeclarationField) -> DeclarationResult<()> {
    if name.trim().is_empty() {
        return Err(DeclarationError::EmptyEventName { field });
    }
    Ok(())
}

impl From<&Event> for EventSet {
    fn from(event: &Event) -> Self {
        EventSet::Named(event.name().to_string())
    }
}

impl From<Event> for EventSet {
    fn from(event: Event) -> Self {
        EventSet::Named(event.name)
    }
}

impl From<&str> for EventSet {
    fn from(name: &str) -> Self {
        EventSet::Named(name.to_string())
    }
}

impl fmt::Display for EventSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventSet::None => write!(f, "none"),
            EventSet::Any => write!(f, "any"),
            EventSet::Named(name) => write!(f, "{}", name),
            EventSet::Names(names) => {
                let names: Vec<&str> = names.iter().map(String::as_str).collect();
                write!(f, "{{{}}}", names.join(", "))
            }
            EventSet::Predicate(predicate) => write!(f, "<{}>", predicate.label),
            EventSet::Union(sets) => {
                let parts: Vec<String> = sets.iter().map(ToString::to_string).collect();
                write!(f, "({})", parts.join(" | "))
            }
        }
    }
}
