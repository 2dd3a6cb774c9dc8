//! # Events
//!
//! An [`Event`] is the unit of synchronization between b-threads. It carries a
//! name, which is what request/wait/block declarations match on by default, and
//! an optional [`Value`] payload (for example the measured viscosity).
//!
//! Selectors over events live in [`event_set`].

pub mod event_set;

pub use event_set::{EventPredicate, EventSet};

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};

/// # Event
///
/// Immutable occurrence identified by `name`, optionally carrying a payload.
///
/// ## Example
///
/// ```rust
/// # use bpsync::event::{Event, Value};
/// let measured = Event::with_payload("VISCOSITY", 3);
/// assert_eq!(measured.name(), "VISCOSITY");
/// assert_eq!(measured.payload(), &Value::Integer(3));
/// assert!(measured.same_name(&Event::new("VISCOSITY")));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    name: String,
    #[serde(default)]
    payload: Value,
}

impl Event {
    /// Creates an event without payload.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: Value::Null,
        }
    }

    /// Creates an event carrying `payload`.
    pub fn with_payload(name: impl Into<String>, payload: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            payload: payload.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Name-based equality, the default notion of "the same event" for matching.
    pub fn same_name(&self, other: &Event) -> bool {
        self.name == other.name
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.payload {
            Value::Null => write!(f, "{}", self.name),
            payload => write!(f, "{}({})", self.name, payload),
        }
    }
}

/// Payload value carried by an [`Event`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Value {
    #[default]
    Null,
    Integer(i64),
    Float(f64),
    String(String),
    Boolean(bool),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric view of the payload; integers are widened.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::String(s) => write!(f, "\"{}\"", s),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Map(entries) => {
                write!(f, "{{")?;
                for (i, (key, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", key, value)?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Integer(value as i64)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::List(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_with_and_without_payload() {
        assert_eq!(Event::new("ADD_DRY").to_string(), "ADD_DRY");
        assert_eq!(Event::with_payload("VISCOSITY", -3).to_string(), "VISCOSITY(-3)");
        assert_eq!(
            Event::with_payload("NOTE", "thick").to_string(),
            "NOTE(\"thick\")"
        );
    }

    #[test]
    fn test_same_name_ignores_payload() {
        let a = Event::with_payload("VISCOSITY", 1);
        let b = Event::with_payload("VISCOSITY", 2);
        assert!(a.same_name(&b));
        assert_ne!(a, b);
    }

    #[test]
    fn test_numeric_views() {
        assert_eq!(Value::Integer(4).as_f64(), Some(4.0));
        assert_eq!(Value::Float(1.5).as_i64(), None);
        assert!(Value::default().is_null());
    }

    #[test]
    fn test_event_deserializes_without_payload() {
        let event: Event = serde_json::from_str(r#"{"name":"ADD_WET"}"#).unwrap();
        assert_eq!(event, Event::new("ADD_WET"));
    }
}
