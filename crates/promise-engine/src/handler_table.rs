//! Executable continuation registry.
//!
//! The settlement model stores only `HandlerHandle`s; the closures they
//! name live here, outside the serializable boundary. A handler receives
//! the settlement payload and either returns a value, fulfilling the
//! downstream path, or a [`CapturedError`], the thrown-exception
//! analogue that rejects it. Handlers run against an
//! [`EngineCx`](crate::resolution_engine::EngineCx), so they can create
//! and settle promises while executing.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::resolution_engine::EngineCx;
use crate::value_model::Value;

// ---------------------------------------------------------------------------
// HandlerHandle
// ---------------------------------------------------------------------------

/// Opaque identifier of a registered continuation. Dense, allocated
/// from 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HandlerHandle(pub u32);

impl fmt::Display for HandlerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handler({})", self.0)
    }
}

// ---------------------------------------------------------------------------
// CapturedError
// ---------------------------------------------------------------------------

/// A thrown exception, as distinct from a returned error value.
/// Returning `Value::Error` from a continuation fulfills the downstream
/// path with that payload; only this wrapper rejects it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedError {
    pub reason: Value,
}

impl CapturedError {
    pub fn new(reason: Value) -> Self {
        Self { reason }
    }
}

impl fmt::Display for CapturedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "captured: {}", self.reason)
    }
}

impl std::error::Error for CapturedError {}

/// What a continuation produces.
pub type HandlerResult = Result<Value, CapturedError>;

/// Boxed continuation. `FnMut` so a handler can carry state across
/// invocations.
pub type HandlerFn = Box<dyn FnMut(&mut EngineCx<'_>, Value) -> HandlerResult>;

// ---------------------------------------------------------------------------
// HandlerTable
// ---------------------------------------------------------------------------

/// Dense registry of continuations, keyed by `HandlerHandle`.
#[derive(Default)]
pub struct HandlerTable {
    handlers: Vec<HandlerFn>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, handler: F) -> HandlerHandle
    where
        F: FnMut(&mut EngineCx<'_>, Value) -> HandlerResult + 'static,
    {
        let handle = HandlerHandle(self.handlers.len() as u32);
        self.handlers.push(Box::new(handler));
        handle
    }

    pub fn contains(&self, handle: HandlerHandle) -> bool {
        (handle.0 as usize) < self.handlers.len()
    }

    /// Invokes a continuation. `None` when the handle names nothing.
    pub fn invoke(
        &mut self,
        handle: HandlerHandle,
        cx: &mut EngineCx<'_>,
        argument: Value,
    ) -> Option<HandlerResult> {
        let handler = self.handlers.get_mut(handle.0 as usize)?;
        Some(handler(cx, argument))
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerTable")
            .field("len", &self.handlers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::promise_model::{MicrotaskQueue, PromiseStore};

    fn cx_parts() -> (PromiseStore, MicrotaskQueue) {
        (PromiseStore::new(), MicrotaskQueue::new())
    }

    #[test]
    fn registration_allocates_dense_handles() {
        let mut table = HandlerTable::new();
        let a = table.register(|_cx, v| Ok(v));
        let b = table.register(|_cx, _v| Err(CapturedError::new(Value::Int(0))));
        assert_eq!((a, b), (HandlerHandle(0), HandlerHandle(1)));
        assert!(table.contains(a));
        assert!(table.contains(b));
        assert!(!table.contains(HandlerHandle(2)));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn invoke_passes_the_argument_through() {
        let mut table = HandlerTable::new();
        let double = table.register(|_cx, v| match v {
            Value::Int(n) => Ok(Value::Int(n * 2)),
            other => Ok(other),
        });
        let (mut store, mut queue) = cx_parts();
        let mut cx = EngineCx {
            store: &mut store,
            microtasks: &mut queue,
        };
        let out = table.invoke(double, &mut cx, Value::Int(21)).expect("known handler");
        assert_eq!(out, Ok(Value::Int(42)));
    }

    #[test]
    fn invoke_unknown_handle_returns_none() {
        let mut table = HandlerTable::new();
        let (mut store, mut queue) = cx_parts();
        let mut cx = EngineCx {
            store: &mut store,
            microtasks: &mut queue,
        };
        assert!(table.invoke(HandlerHandle(7), &mut cx, Value::Null).is_none());
    }

    #[test]
    fn handlers_can_settle_promises_through_the_cx() {
        let mut table = HandlerTable::new();
        let settle = table.register(|cx, v| {
            let p = cx.create();
            cx.resolve(p, v.clone());
            Ok(Value::Promise(p))
        });
        let (mut store, mut queue) = cx_parts();
        let mut cx = EngineCx {
            store: &mut store,
            microtasks: &mut queue,
        };
        let out = table.invoke(settle, &mut cx, Value::Int(5)).expect("known handler");
        assert!(matches!(out, Ok(Value::Promise(_))));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn debug_hides_the_closures() {
        let mut table = HandlerTable::new();
        table.register(|_cx, v| Ok(v));
        let text = format!("{table:?}");
        assert!(text.contains("HandlerTable"), "{text}");
        assert!(text.contains("len"), "{text}");
    }

    #[test]
    fn captured_error_displays_its_reason() {
        let err = CapturedError::new(Value::type_error("nope"));
        assert_eq!(err.to_string(), "captured: TypeError: nope");
    }
}
