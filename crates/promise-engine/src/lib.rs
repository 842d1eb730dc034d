//! Deterministic single-assignment promise engine.
//!
//! A from-scratch settlement model in the replayable-state-machine style:
//! promises are records behind dense `u32` handles, continuations are
//! queued microtasks, and every transition appends to a witness log so two
//! runs with identical inputs can be compared byte for byte.
//!
//! - [`value_model`]: the dynamically-typed settlement payloads
//! - [`promise_model`]: the settlement state machine, deferred-execution
//!   queues, virtual clock, and combinator trackers
//! - [`handler_table`]: executable continuations, kept outside the
//!   serializable boundary
//! - [`resolution_engine`]: the drain loop, thenable adoption, and the
//!   public operation surface

#![forbid(unsafe_code)]

pub mod handler_table;
pub mod promise_model;
pub mod resolution_engine;
pub mod value_model;
