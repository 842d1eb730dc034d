//! Dynamically-typed settlement payloads.
//!
//! Every settlement carries a `Value`. The variants cover exactly the
//! payload shapes the settlement contract needs:
//!
//! - **`Value::Promise`**: a promise handle as a payload is what triggers
//!   adoption in the resolution procedure
//! - **`Value::Error`**: structured error objects (class name + message)
//!   so rejection reasons survive serialization and replay
//! - **`Value::Outcome`**: the tagged per-input record `allSettled`
//!   aggregates produce
//!
//! The model carries no floats, so `Eq` is derivable and values can sit in
//! deterministic containers.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::promise_model::{PromiseHandle, SettledOutcome};

// ---------------------------------------------------------------------------
// ErrorValue
// ---------------------------------------------------------------------------

/// Structured error payload: a class name plus a message, the model's
/// analogue of a host `Error` object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorValue {
    pub name: String,
    pub message: String,
}

impl ErrorValue {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    /// The error class the resolution procedure raises for self-resolution
    /// and non-callable misuse.
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }
}

impl fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

/// A settlement payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    /// Structured error object; the usual shape of a rejection reason.
    Error(ErrorValue),
    /// Reference to another engine-owned promise. As a resolution payload
    /// this triggers adoption rather than plain fulfillment.
    Promise(PromiseHandle),
    /// Ordered list, as produced by `all` and `allSettled` aggregates.
    List(Vec<Value>),
    /// Tagged per-input settlement record from `allSettled`.
    Outcome(Box<SettledOutcome>),
}

impl Value {
    pub fn str(s: impl Into<String>) -> Self {
        Value::Str(s.into())
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Value::Error(ErrorValue::type_error(message))
    }

    pub fn is_promise(&self) -> bool {
        matches!(self, Value::Promise(_))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "undefined"),
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::Error(e) => write!(f, "{e}"),
            Value::Promise(h) => write!(f, "{h}"),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Outcome(outcome) => write!(f, "{outcome}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::promise_model::OutcomeStatus;

    // -- Display --

    #[test]
    fn scalar_display_forms() {
        assert_eq!(Value::Undefined.to_string(), "undefined");
        assert_eq!(Value::Null.to_string(), "null");
        assert_eq!(Value::Bool(true).to_string(), "true");
        assert_eq!(Value::Int(-7).to_string(), "-7");
        assert_eq!(Value::str("hi").to_string(), "hi");
    }

    #[test]
    fn list_display_is_bracketed_and_comma_separated() {
        let list = Value::List(vec![Value::Int(1), Value::Int(2), Value::str("x")]);
        assert_eq!(list.to_string(), "[1, 2, x]");
    }

    #[test]
    fn error_display_is_name_colon_message() {
        let err = Value::Error(ErrorValue::new("RangeError", "out of range"));
        assert_eq!(err.to_string(), "RangeError: out of range");
    }

    #[test]
    fn promise_display_delegates_to_handle() {
        assert_eq!(Value::Promise(PromiseHandle(3)).to_string(), "Promise(3)");
    }

    #[test]
    fn outcome_display_shows_status_and_value() {
        let outcome = Value::Outcome(Box::new(SettledOutcome {
            status: OutcomeStatus::Rejected,
            value: Value::str("boom"),
        }));
        assert_eq!(outcome.to_string(), "rejected(boom)");
    }

    // -- Constructors --

    #[test]
    fn type_error_carries_the_class_name() {
        let v = Value::type_error("bad");
        match v {
            Value::Error(e) => {
                assert_eq!(e.name, "TypeError");
                assert_eq!(e.message, "bad");
            }
            other => panic!("expected error value, got {other:?}"),
        }
    }

    #[test]
    fn is_promise_only_matches_promise_payloads() {
        assert!(Value::Promise(PromiseHandle(0)).is_promise());
        assert!(!Value::Int(0).is_promise());
        assert!(!Value::List(vec![Value::Promise(PromiseHandle(0))]).is_promise());
    }

    // -- Serde --

    #[test]
    fn value_round_trips_through_json() {
        let original = Value::List(vec![
            Value::Undefined,
            Value::Int(42),
            Value::Error(ErrorValue::type_error("oops")),
            Value::Promise(PromiseHandle(9)),
        ]);
        let encoded = serde_json::to_string(&original).expect("serialize");
        let decoded: Value = serde_json::from_str(&encoded).expect("deserialize");
        assert_eq!(decoded, original);
    }
}
