//! Single-assignment promise settlement model.
//!
//! Pure data driven by explicit state machines: promise records behind
//! dense `u32` handles, `BTreeMap` storage so every iteration order is
//! deterministic, and an append-only witness log on each mutating
//! structure so two runs can be compared log for log. Key pieces:
//!
//! - **`PromiseStore`**: pending transitions to fulfilled or rejected
//!   exactly once; insertion-ordered reactions; a first-wins finalizer
//!   slot; per-record unhandled-rejection bookkeeping
//! - **`MicrotaskQueue`**: FIFO with a consumed-prefix cursor, the
//!   deferred-execution seam every continuation runs through
//! - **`MacrotaskQueue` / `VirtualClock` / `EventLoop`**: the host
//!   scheduling model, with source-class priority and manual time
//! - **Combinator trackers**: `all` / `allSettled` / `race` bookkeeping
//!   with tracker-local settled guards
//!
//! Executable continuations live in [`crate::handler_table`]; this module
//! only carries their handles, so the whole model serializes and replays.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::mem;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::handler_table::HandlerHandle;
use crate::value_model::Value;

// ---------------------------------------------------------------------------
// Handles and settlement state
// ---------------------------------------------------------------------------

/// Opaque identifier of a promise record. Dense, allocated from 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PromiseHandle(pub u32);

impl fmt::Display for PromiseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Promise({})", self.0)
    }
}

/// Settlement state. Pending moves to exactly one terminal state; the
/// payload is written at the same transition and never changes again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PromiseState {
    Pending,
    Fulfilled(Value),
    Rejected(Value),
}

impl PromiseState {
    pub fn is_settled(&self) -> bool {
        !matches!(self, PromiseState::Pending)
    }

    pub fn is_fulfilled(&self) -> bool {
        matches!(self, PromiseState::Fulfilled(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, PromiseState::Rejected(_))
    }

    /// The settled payload, if any.
    pub fn value(&self) -> Option<&Value> {
        match self {
            PromiseState::Pending => None,
            PromiseState::Fulfilled(v) | PromiseState::Rejected(v) => Some(v),
        }
    }
}

impl fmt::Display for PromiseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromiseState::Pending => write!(f, "pending"),
            PromiseState::Fulfilled(_) => write!(f, "fulfilled"),
            PromiseState::Rejected(_) => write!(f, "rejected"),
        }
    }
}

// ---------------------------------------------------------------------------
// Reactions
// ---------------------------------------------------------------------------

/// Identifier of a combinator tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TrackerId(pub u32);

impl fmt::Display for TrackerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tracker({})", self.0)
    }
}

/// Which settlement class a reaction responds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReactionKind {
    Fulfill,
    Reject,
}

/// Where a reaction delivers its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReactionTarget {
    /// Settle the derived promise allocated by the registering `then`.
    Settle(PromiseHandle),
    /// Notify one slot of a combinator tracker.
    Combinator { tracker: TrackerId, index: u32 },
}

/// One registered continuation. `handler: None` is the normalized no-op
/// pass-through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromiseReaction {
    pub kind: ReactionKind,
    pub handler: Option<HandlerHandle>,
    pub target: ReactionTarget,
}

// ---------------------------------------------------------------------------
// PromiseRecord
// ---------------------------------------------------------------------------

/// One promise: its state, its registered reactions, and its finalizer
/// slot. Reactions are append-only while pending and are taken out of the
/// record when it settles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromiseRecord {
    pub handle: PromiseHandle,
    pub state: PromiseState,
    pub reactions: Vec<PromiseReaction>,
    pub finalizer: Option<HandlerHandle>,
    pub finalizer_dispatched: bool,
    pub creation_seq: u64,
    pub rejection_handled: bool,
}

// ---------------------------------------------------------------------------
// PromiseError
// ---------------------------------------------------------------------------

/// API misuse, surfaced synchronously at the call site. Settlement-path
/// failures (a throwing continuation, a resolution cycle) are never
/// errors here; they become rejections.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PromiseError {
    /// One-shot settlement was attempted a second time.
    #[error("{handle} is already settled")]
    AlreadySettled { handle: PromiseHandle },
    /// The handle names no record in this store.
    #[error("invalid handle {handle}")]
    InvalidHandle { handle: PromiseHandle },
    /// The handler handle names no registered continuation.
    #[error("handler {handler} is not callable")]
    UnknownHandler { handler: HandlerHandle },
}

// ---------------------------------------------------------------------------
// Witness events
// ---------------------------------------------------------------------------

/// Append-only observability record. Identical inputs produce identical
/// logs, which is what the replay digest checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WitnessEvent {
    PromiseCreated { handle: PromiseHandle, seq: u64 },
    PromiseFulfilled { handle: PromiseHandle, value: Value },
    PromiseRejected { handle: PromiseHandle, reason: Value },
    MicrotaskEnqueued { index: u64 },
    MicrotaskDequeued { index: u64 },
    MacrotaskExecuted { source: MacrotaskSource, registration_seq: u64 },
    ClockAdvanced { from_ms: u64, to_ms: u64 },
    FinalizerInvoked { handle: PromiseHandle },
    HandlerThrew { handler: HandlerHandle, reason: Value },
}

/// Replay digest: sha-256 over the canonical JSON encoding of a witness
/// log.
pub fn witness_digest(events: &[WitnessEvent]) -> String {
    let bytes = serde_json::to_vec(events).unwrap_or_default();
    sha256_hex(&bytes)
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

// ---------------------------------------------------------------------------
// Microtasks
// ---------------------------------------------------------------------------

/// One unit of deferred work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Microtask {
    /// Deliver a settlement payload to a registered reaction.
    Reaction {
        kind: ReactionKind,
        handler: Option<HandlerHandle>,
        argument: Value,
        target: ReactionTarget,
    },
    /// Invoke a finalizer with the settled payload of its promise.
    Finalizer {
        promise: PromiseHandle,
        handler: HandlerHandle,
        payload: Value,
    },
}

/// FIFO deferred-execution queue with a consumed-prefix cursor. Indices
/// in the witness log are lifetime positions, stable across `compact`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MicrotaskQueue {
    tasks: Vec<Microtask>,
    cursor: usize,
    total_enqueued: u64,
    total_dequeued: u64,
    witness: Vec<WitnessEvent>,
}

impl MicrotaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a task and returns its lifetime index.
    pub fn enqueue(&mut self, task: Microtask) -> u64 {
        let index = self.total_enqueued;
        self.total_enqueued += 1;
        self.tasks.push(task);
        self.witness.push(WitnessEvent::MicrotaskEnqueued { index });
        index
    }

    pub fn dequeue(&mut self) -> Option<Microtask> {
        if self.cursor >= self.tasks.len() {
            return None;
        }
        let task = self.tasks[self.cursor].clone();
        self.cursor += 1;
        let index = self.total_dequeued;
        self.total_dequeued += 1;
        self.witness.push(WitnessEvent::MicrotaskDequeued { index });
        Some(task)
    }

    pub fn pending_count(&self) -> usize {
        self.tasks.len() - self.cursor
    }

    pub fn is_empty(&self) -> bool {
        self.pending_count() == 0
    }

    pub fn total_enqueued(&self) -> u64 {
        self.total_enqueued
    }

    /// Drops the consumed prefix and resets the cursor. Call between
    /// turns to keep the backing storage bounded.
    pub fn compact(&mut self) {
        self.tasks.drain(..self.cursor);
        self.cursor = 0;
    }

    pub fn witness_log(&self) -> &[WitnessEvent] {
        &self.witness
    }
}

// ---------------------------------------------------------------------------
// Macrotasks and the virtual clock
// ---------------------------------------------------------------------------

/// Deferred-execution source class, in dispatch priority order. The
/// ladder mirrors the host fallbacks a deferral shim probes: channel
/// callbacks run before timers, timers before completed io.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MacrotaskSource {
    MessageChannel,
    Timer,
    IoCompletion,
}

impl fmt::Display for MacrotaskSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MacrotaskSource::MessageChannel => write!(f, "message-channel"),
            MacrotaskSource::Timer => write!(f, "timer"),
            MacrotaskSource::IoCompletion => write!(f, "io-completion"),
        }
    }
}

/// One scheduled macrotask.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Macrotask {
    pub source: MacrotaskSource,
    pub handler: HandlerHandle,
    pub scheduled_at: u64,
    pub registration_seq: u64,
}

/// Pending macrotasks. Dispatch order among ready tasks is source class,
/// then scheduled time, then registration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacrotaskQueue {
    tasks: Vec<Macrotask>,
    next_seq: u64,
}

impl MacrotaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a task and returns its registration sequence.
    pub fn schedule(
        &mut self,
        source: MacrotaskSource,
        handler: HandlerHandle,
        scheduled_at: u64,
    ) -> u64 {
        let registration_seq = self.next_seq;
        self.next_seq += 1;
        self.tasks.push(Macrotask {
            source,
            handler,
            scheduled_at,
            registration_seq,
        });
        registration_seq
    }

    /// Removes and returns the next task whose deadline is at or before
    /// `now`, if any.
    pub fn dequeue_ready(&mut self, now: u64) -> Option<Macrotask> {
        let best = self
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, task)| task.scheduled_at <= now)
            .min_by_key(|(_, task)| (task.source, task.scheduled_at, task.registration_seq))
            .map(|(index, _)| index)?;
        Some(self.tasks.remove(best))
    }

    /// Earliest deadline over all pending tasks.
    pub fn next_scheduled_time(&self) -> Option<u64> {
        self.tasks.iter().map(|task| task.scheduled_at).min()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Manual time source. Never moves backward; no wall clock anywhere.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualClock {
    now_ms: u64,
    next_timer_seq: u64,
}

impl VirtualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    /// Moves time forward. A target at or before the current time is
    /// ignored; returns whether time changed.
    pub fn advance_to(&mut self, target_ms: u64) -> bool {
        if target_ms <= self.now_ms {
            return false;
        }
        self.now_ms = target_ms;
        true
    }

    /// Allocates a timer identity for callers that track their timers.
    pub fn register_timer(&mut self) -> u64 {
        let seq = self.next_timer_seq;
        self.next_timer_seq += 1;
        seq
    }
}

/// Microtask budget applied per turn when none is configured.
pub const DEFAULT_MAX_MICROTASKS_PER_TURN: usize = 4096;

/// Aggregated host scheduling state. Pure data; execution belongs to the
/// resolution engine driving it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLoop {
    pub microtasks: MicrotaskQueue,
    pub macrotasks: MacrotaskQueue,
    pub clock: VirtualClock,
    pub witness: Vec<WitnessEvent>,
    pub max_microtasks_per_turn: usize,
}

impl Default for EventLoop {
    fn default() -> Self {
        Self {
            microtasks: MicrotaskQueue::new(),
            macrotasks: MacrotaskQueue::new(),
            clock: VirtualClock::new(),
            witness: Vec::new(),
            max_microtasks_per_turn: DEFAULT_MAX_MICROTASKS_PER_TURN,
        }
    }
}

impl EventLoop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules a timer macrotask `delay_ms` past the current virtual
    /// time. Returns its registration sequence.
    pub fn set_timeout(&mut self, handler: HandlerHandle, delay_ms: u64) -> u64 {
        let deadline = self.clock.now_ms().saturating_add(delay_ms);
        self.macrotasks.schedule(MacrotaskSource::Timer, handler, deadline)
    }

    pub fn has_pending_work(&self) -> bool {
        self.microtasks.pending_count() > 0 || !self.macrotasks.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Settled outcomes
// ---------------------------------------------------------------------------

/// Settlement class of one `allSettled` input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeStatus {
    Fulfilled,
    Rejected,
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutcomeStatus::Fulfilled => write!(f, "fulfilled"),
            OutcomeStatus::Rejected => write!(f, "rejected"),
        }
    }
}

/// Tagged record of how one `allSettled` input settled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettledOutcome {
    pub status: OutcomeStatus,
    pub value: Value,
}

impl SettledOutcome {
    pub fn fulfilled(value: Value) -> Self {
        Self {
            status: OutcomeStatus::Fulfilled,
            value,
        }
    }

    pub fn rejected(reason: Value) -> Self {
        Self {
            status: OutcomeStatus::Rejected,
            value: reason,
        }
    }
}

impl fmt::Display for SettledOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.status, self.value)
    }
}

// ---------------------------------------------------------------------------
// Combinator trackers
// ---------------------------------------------------------------------------

/// Bookkeeping for one `all` aggregate. The `settled` guard is local to
/// the tracker; input promise records are never touched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromiseAllTracker {
    pub result: PromiseHandle,
    pub total: u32,
    pub values: BTreeMap<u32, Value>,
    pub settled: bool,
}

impl PromiseAllTracker {
    pub fn new(result: PromiseHandle, total: u32) -> Self {
        Self {
            result,
            total,
            values: BTreeMap::new(),
            settled: false,
        }
    }

    /// Records one input fulfillment at its slot. Returns true when every
    /// slot has reported and the aggregate should fulfill.
    pub fn record_fulfillment(&mut self, index: u32, value: Value) -> bool {
        if self.settled {
            return false;
        }
        self.values.insert(index, value);
        self.values.len() as u32 == self.total
    }

    /// Values in input order.
    pub fn collect_values(&self) -> Vec<Value> {
        self.values.values().cloned().collect()
    }

    pub fn mark_settled(&mut self) {
        self.settled = true;
    }
}

/// Bookkeeping for one `allSettled` aggregate. Both settlement classes
/// feed the same slot table; the aggregate always fulfills.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromiseAllSettledTracker {
    pub result: PromiseHandle,
    pub total: u32,
    pub outcomes: BTreeMap<u32, SettledOutcome>,
    pub settled: bool,
}

impl PromiseAllSettledTracker {
    pub fn new(result: PromiseHandle, total: u32) -> Self {
        Self {
            result,
            total,
            outcomes: BTreeMap::new(),
            settled: false,
        }
    }

    pub fn record_fulfillment(&mut self, index: u32, value: Value) -> bool {
        self.record(index, SettledOutcome::fulfilled(value))
    }

    pub fn record_rejection(&mut self, index: u32, reason: Value) -> bool {
        self.record(index, SettledOutcome::rejected(reason))
    }

    fn record(&mut self, index: u32, outcome: SettledOutcome) -> bool {
        if self.settled {
            return false;
        }
        self.outcomes.insert(index, outcome);
        self.outcomes.len() as u32 == self.total
    }

    /// Outcomes in input order.
    pub fn collect_outcomes(&self) -> Vec<SettledOutcome> {
        self.outcomes.values().cloned().collect()
    }

    pub fn mark_settled(&mut self) {
        self.settled = true;
    }
}

/// Bookkeeping for one `race` aggregate: a single first-wins latch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromiseRaceTracker {
    pub result: PromiseHandle,
    pub settled: bool,
}

impl PromiseRaceTracker {
    pub fn new(result: PromiseHandle) -> Self {
        Self {
            result,
            settled: false,
        }
    }

    /// Claims the race. Only the first caller gets true.
    pub fn try_settle(&mut self) -> bool {
        if self.settled {
            return false;
        }
        self.settled = true;
        true
    }
}

/// Any combinator tracker, as stored by the resolution engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CombinatorTracker {
    All(PromiseAllTracker),
    AllSettled(PromiseAllSettledTracker),
    Race(PromiseRaceTracker),
}

impl CombinatorTracker {
    /// The aggregate promise this tracker settles.
    pub fn result(&self) -> PromiseHandle {
        match self {
            CombinatorTracker::All(t) => t.result,
            CombinatorTracker::AllSettled(t) => t.result,
            CombinatorTracker::Race(t) => t.result,
        }
    }
}

// ---------------------------------------------------------------------------
// PromiseStore
// ---------------------------------------------------------------------------

/// The settlement state machine: every promise record plus the witness
/// log of every transition. Operations that can schedule work take the
/// microtask queue explicitly; the store never executes anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromiseStore {
    records: BTreeMap<u32, PromiseRecord>,
    next_handle: u32,
    creation_seq: u64,
    witness: Vec<WitnessEvent>,
}

impl PromiseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a pending record.
    pub fn create(&mut self) -> PromiseHandle {
        let handle = PromiseHandle(self.next_handle);
        self.next_handle += 1;
        let seq = self.creation_seq;
        self.creation_seq += 1;
        self.records.insert(
            handle.0,
            PromiseRecord {
                handle,
                state: PromiseState::Pending,
                reactions: Vec::new(),
                finalizer: None,
                finalizer_dispatched: false,
                creation_seq: seq,
                rejection_handled: false,
            },
        );
        self.witness.push(WitnessEvent::PromiseCreated { handle, seq });
        handle
    }

    /// Strict one-shot fulfillment. The payload is stored as given;
    /// adoption of promise-valued payloads belongs to the resolution
    /// engine.
    pub fn fulfill(
        &mut self,
        handle: PromiseHandle,
        value: Value,
        queue: &mut MicrotaskQueue,
    ) -> Result<(), PromiseError> {
        self.ensure_pending(handle)?;
        self.settle(handle, ReactionKind::Fulfill, value, queue);
        Ok(())
    }

    /// Strict one-shot rejection.
    pub fn reject(
        &mut self,
        handle: PromiseHandle,
        reason: Value,
        queue: &mut MicrotaskQueue,
    ) -> Result<(), PromiseError> {
        self.ensure_pending(handle)?;
        self.settle(handle, ReactionKind::Reject, reason, queue);
        Ok(())
    }

    /// Creates a record already fulfilled with `value`.
    pub fn resolve(&mut self, value: Value, queue: &mut MicrotaskQueue) -> PromiseHandle {
        let handle = self.create();
        self.settle(handle, ReactionKind::Fulfill, value, queue);
        handle
    }

    /// Creates a record already rejected with `reason`.
    pub fn reject_with(&mut self, reason: Value, queue: &mut MicrotaskQueue) -> PromiseHandle {
        let handle = self.create();
        self.settle(handle, ReactionKind::Reject, reason, queue);
        handle
    }

    /// Registers a continuation pair and returns the derived promise it
    /// settles. On an already-settled source the matching reaction is
    /// enqueued immediately with the settled payload.
    pub fn then(
        &mut self,
        handle: PromiseHandle,
        on_fulfilled: Option<HandlerHandle>,
        on_rejected: Option<HandlerHandle>,
        queue: &mut MicrotaskQueue,
    ) -> Result<PromiseHandle, PromiseError> {
        if !self.records.contains_key(&handle.0) {
            return Err(PromiseError::InvalidHandle { handle });
        }
        if on_rejected.is_some() {
            self.mark_rejection_handled(handle);
        }
        let result = self.create();
        let pair = [
            PromiseReaction {
                kind: ReactionKind::Fulfill,
                handler: on_fulfilled,
                target: ReactionTarget::Settle(result),
            },
            PromiseReaction {
                kind: ReactionKind::Reject,
                handler: on_rejected,
                target: ReactionTarget::Settle(result),
            },
        ];
        self.register(handle, pair, queue);
        Ok(result)
    }

    /// Records a finalizer. The first registration wins and returns true;
    /// later ones are ignored and return false. Registering on a settled
    /// record dispatches the finalizer microtask immediately.
    pub fn set_finalizer(
        &mut self,
        handle: PromiseHandle,
        handler: HandlerHandle,
        queue: &mut MicrotaskQueue,
    ) -> Result<bool, PromiseError> {
        let record = self
            .records
            .get_mut(&handle.0)
            .ok_or(PromiseError::InvalidHandle { handle })?;
        if record.finalizer.is_some() {
            return Ok(false);
        }
        record.finalizer = Some(handler);
        self.dispatch_finalizer(handle, queue);
        Ok(true)
    }

    /// Wires `inner`'s eventual settlement through to `outer` with a
    /// no-op pass-through pair. Forwarded rejections count as handled at
    /// `inner`.
    pub(crate) fn add_adoption(
        &mut self,
        inner: PromiseHandle,
        outer: PromiseHandle,
        queue: &mut MicrotaskQueue,
    ) {
        self.mark_rejection_handled(inner);
        let pair = [
            PromiseReaction {
                kind: ReactionKind::Fulfill,
                handler: None,
                target: ReactionTarget::Settle(outer),
            },
            PromiseReaction {
                kind: ReactionKind::Reject,
                handler: None,
                target: ReactionTarget::Settle(outer),
            },
        ];
        self.register(inner, pair, queue);
    }

    /// Registers the notification pair that feeds one combinator slot.
    /// The caller has validated `handle`.
    pub(crate) fn add_combinator_reactions(
        &mut self,
        handle: PromiseHandle,
        tracker: TrackerId,
        index: u32,
        queue: &mut MicrotaskQueue,
    ) {
        self.mark_rejection_handled(handle);
        let target = ReactionTarget::Combinator { tracker, index };
        let pair = [
            PromiseReaction {
                kind: ReactionKind::Fulfill,
                handler: None,
                target,
            },
            PromiseReaction {
                kind: ReactionKind::Reject,
                handler: None,
                target,
            },
        ];
        self.register(handle, pair, queue);
    }

    /// One-shot transition. The caller has verified the record exists and
    /// is pending. Matching-kind reactions are enqueued in registration
    /// order, then the finalizer; the non-matching half of each pair is
    /// discarded with the settlement class that never happened.
    pub(crate) fn settle(
        &mut self,
        handle: PromiseHandle,
        kind: ReactionKind,
        value: Value,
        queue: &mut MicrotaskQueue,
    ) {
        let Some(record) = self.records.get_mut(&handle.0) else {
            return;
        };
        record.state = match kind {
            ReactionKind::Fulfill => PromiseState::Fulfilled(value.clone()),
            ReactionKind::Reject => PromiseState::Rejected(value.clone()),
        };
        let reactions = mem::take(&mut record.reactions);
        self.witness.push(match kind {
            ReactionKind::Fulfill => WitnessEvent::PromiseFulfilled {
                handle,
                value: value.clone(),
            },
            ReactionKind::Reject => WitnessEvent::PromiseRejected {
                handle,
                reason: value.clone(),
            },
        });
        for reaction in reactions {
            if reaction.kind == kind {
                queue.enqueue(Microtask::Reaction {
                    kind: reaction.kind,
                    handler: reaction.handler,
                    argument: value.clone(),
                    target: reaction.target,
                });
            }
        }
        self.dispatch_finalizer(handle, queue);
    }

    fn ensure_pending(&self, handle: PromiseHandle) -> Result<(), PromiseError> {
        let record = self
            .records
            .get(&handle.0)
            .ok_or(PromiseError::InvalidHandle { handle })?;
        if record.state.is_settled() {
            return Err(PromiseError::AlreadySettled { handle });
        }
        Ok(())
    }

    pub(crate) fn mark_rejection_handled(&mut self, handle: PromiseHandle) {
        if let Some(record) = self.records.get_mut(&handle.0) {
            record.rejection_handled = true;
        }
    }

    /// Appends a reaction pair, or enqueues the matching half immediately
    /// when the record is already settled.
    fn register(
        &mut self,
        handle: PromiseHandle,
        pair: [PromiseReaction; 2],
        queue: &mut MicrotaskQueue,
    ) {
        let Some(record) = self.records.get_mut(&handle.0) else {
            return;
        };
        match record.state.clone() {
            PromiseState::Pending => record.reactions.extend(pair),
            PromiseState::Fulfilled(value) => {
                for reaction in pair {
                    if reaction.kind == ReactionKind::Fulfill {
                        queue.enqueue(Microtask::Reaction {
                            kind: reaction.kind,
                            handler: reaction.handler,
                            argument: value.clone(),
                            target: reaction.target,
                        });
                    }
                }
            }
            PromiseState::Rejected(reason) => {
                for reaction in pair {
                    if reaction.kind == ReactionKind::Reject {
                        queue.enqueue(Microtask::Reaction {
                            kind: reaction.kind,
                            handler: reaction.handler,
                            argument: reason.clone(),
                            target: reaction.target,
                        });
                    }
                }
            }
        }
    }

    /// Enqueues the finalizer microtask once the record is settled and a
    /// finalizer is present. At most one dispatch per record.
    fn dispatch_finalizer(&mut self, handle: PromiseHandle, queue: &mut MicrotaskQueue) {
        let Some(record) = self.records.get_mut(&handle.0) else {
            return;
        };
        if record.finalizer_dispatched {
            return;
        }
        let Some(handler) = record.finalizer else {
            return;
        };
        let payload = match &record.state {
            PromiseState::Pending => return,
            PromiseState::Fulfilled(v) | PromiseState::Rejected(v) => v.clone(),
        };
        record.finalizer_dispatched = true;
        queue.enqueue(Microtask::Finalizer {
            promise: handle,
            handler,
            payload,
        });
    }

    pub fn get(&self, handle: PromiseHandle) -> Option<&PromiseRecord> {
        self.records.get(&handle.0)
    }

    pub fn state(&self, handle: PromiseHandle) -> Option<&PromiseState> {
        self.records.get(&handle.0).map(|record| &record.state)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn witness_log(&self) -> &[WitnessEvent] {
        &self.witness
    }

    /// Takes the witness log, leaving it empty.
    pub fn drain_witness(&mut self) -> Vec<WitnessEvent> {
        mem::take(&mut self.witness)
    }

    /// Rejected records whose rejection no registered reject-side
    /// handler, adoption, or combinator will observe. Diagnostic only;
    /// reporting policy belongs to the embedder.
    pub fn unhandled_rejections(&self) -> Vec<PromiseHandle> {
        self.records
            .values()
            .filter(|record| record.state.is_rejected() && !record.rejection_handled)
            .map(|record| record.handle)
            .collect()
    }
}
