//! Continuation execution and thenable resolution.
//!
//! [`ResolutionEngine`] owns the four pieces the settlement contract
//! splits apart: the promise store, the event loop, the handler table,
//! and the combinator trackers. The drain is an explicit loop over
//! queued microtasks; nothing here recurses over a chain, so arbitrarily
//! long chains cost queue entries rather than stack frames.
//!
//! The resolution procedure distinguishes payloads: a plain value
//! fulfills, a promise payload is adopted (settled sources on the
//! current tick, pending sources by suspending behind a pass-through
//! pair), and a promise resolving with itself rejects with the standard
//! `TypeError`. Rejection reasons are never unwrapped.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::handler_table::{HandlerHandle, HandlerResult, HandlerTable};
use crate::promise_model::{
    witness_digest, CombinatorTracker, EventLoop, Macrotask, Microtask, MicrotaskQueue,
    PromiseAllSettledTracker, PromiseAllTracker, PromiseError, PromiseHandle, PromiseRaceTracker,
    PromiseState, PromiseStore, ReactionKind, ReactionTarget, TrackerId, WitnessEvent,
    DEFAULT_MAX_MICROTASKS_PER_TURN,
};
use crate::value_model::Value;

/// Rejection message for a resolution cycle where a promise would adopt
/// itself.
pub const SELF_RESOLUTION_TYPE_ERROR: &str = "promise and value refer to the same object.";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Engine tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Microtask budget per turn.
    pub max_microtasks_per_turn: usize,
    /// Upper bound on turns a single `run` call may take.
    pub max_turns_per_run: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_microtasks_per_turn: DEFAULT_MAX_MICROTASKS_PER_TURN,
            max_turns_per_run: 10_000,
        }
    }
}

/// What one event-loop turn did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnResult {
    pub microtasks_drained: usize,
    pub macrotask: Option<Macrotask>,
    pub clock_advanced: bool,
}

// ---------------------------------------------------------------------------
// EngineCx
// ---------------------------------------------------------------------------

/// The store/queue view handed to executing continuations. Settling
/// through it goes through the full resolution procedure, so adoption
/// and the self-resolution check apply inside handlers too.
#[derive(Debug)]
pub struct EngineCx<'a> {
    pub store: &'a mut PromiseStore,
    pub microtasks: &'a mut MicrotaskQueue,
}

impl EngineCx<'_> {
    pub fn create(&mut self) -> PromiseHandle {
        self.store.create()
    }

    pub fn resolve(&mut self, handle: PromiseHandle, value: Value) {
        resolve_promise(self.store, self.microtasks, handle, value);
    }

    pub fn reject(&mut self, handle: PromiseHandle, reason: Value) {
        reject_promise(self.store, self.microtasks, handle, reason);
    }

    pub fn state(&self, handle: PromiseHandle) -> Option<&PromiseState> {
        self.store.state(handle)
    }
}

// ---------------------------------------------------------------------------
// ResolutionEngine
// ---------------------------------------------------------------------------

/// The executing promise engine.
#[derive(Debug)]
pub struct ResolutionEngine {
    store: PromiseStore,
    event_loop: EventLoop,
    handlers: HandlerTable,
    trackers: BTreeMap<u32, CombinatorTracker>,
    next_tracker: u32,
    config: EngineConfig,
}

impl Default for ResolutionEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ResolutionEngine {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let mut event_loop = EventLoop::new();
        event_loop.max_microtasks_per_turn = config.max_microtasks_per_turn;
        Self {
            store: PromiseStore::new(),
            event_loop,
            handlers: HandlerTable::new(),
            trackers: BTreeMap::new(),
            next_tracker: 0,
            config,
        }
    }

    // -- registration and construction --------------------------------------

    /// Registers a continuation and returns the handle that `then`,
    /// `catch`, `finally`, and `set_timeout` accept.
    pub fn register_handler<F>(&mut self, handler: F) -> HandlerHandle
    where
        F: FnMut(&mut EngineCx<'_>, Value) -> HandlerResult + 'static,
    {
        self.handlers.register(handler)
    }

    /// A fresh pending promise.
    pub fn create(&mut self) -> PromiseHandle {
        self.store.create()
    }

    /// Runs `executor` synchronously with the settle capability for a
    /// fresh promise. Competing settles inside the executor are no-ops
    /// after the first.
    pub fn with_executor<F>(&mut self, executor: F) -> PromiseHandle
    where
        F: FnOnce(&mut EngineCx<'_>, PromiseHandle),
    {
        let handle = self.store.create();
        let mut cx = EngineCx {
            store: &mut self.store,
            microtasks: &mut self.event_loop.microtasks,
        };
        executor(&mut cx, handle);
        handle
    }

    /// A promise resolved with `value`: non-promise payloads fulfill it,
    /// promise payloads are adopted.
    pub fn resolved(&mut self, value: Value) -> PromiseHandle {
        let handle = self.store.create();
        resolve_promise(
            &mut self.store,
            &mut self.event_loop.microtasks,
            handle,
            value,
        );
        handle
    }

    /// A promise rejected with `reason`, stored as given.
    pub fn rejected(&mut self, reason: Value) -> PromiseHandle {
        self.store
            .reject_with(reason, &mut self.event_loop.microtasks)
    }

    // -- settlement ----------------------------------------------------------

    /// Resolves `handle` with `value` through the resolution procedure.
    /// Idempotent: settling an already-settled promise is a no-op.
    pub fn resolve(&mut self, handle: PromiseHandle, value: Value) -> Result<(), PromiseError> {
        self.ensure_known(handle)?;
        resolve_promise(
            &mut self.store,
            &mut self.event_loop.microtasks,
            handle,
            value,
        );
        Ok(())
    }

    /// Rejects `handle` with `reason` unchanged; a promise-valued reason
    /// is never unwrapped. Idempotent like [`resolve`](Self::resolve).
    pub fn reject(&mut self, handle: PromiseHandle, reason: Value) -> Result<(), PromiseError> {
        self.ensure_known(handle)?;
        reject_promise(
            &mut self.store,
            &mut self.event_loop.microtasks,
            handle,
            reason,
        );
        Ok(())
    }

    // -- chaining ------------------------------------------------------------

    /// Registers continuations and returns the derived promise they
    /// settle. `None` normalizes to the pass-through reaction.
    pub fn then(
        &mut self,
        handle: PromiseHandle,
        on_fulfilled: Option<HandlerHandle>,
        on_rejected: Option<HandlerHandle>,
    ) -> Result<PromiseHandle, PromiseError> {
        self.ensure_callable(on_fulfilled)?;
        self.ensure_callable(on_rejected)?;
        self.store.then(
            handle,
            on_fulfilled,
            on_rejected,
            &mut self.event_loop.microtasks,
        )
    }

    /// `then` with only a rejection continuation.
    pub fn catch(
        &mut self,
        handle: PromiseHandle,
        on_rejected: HandlerHandle,
    ) -> Result<PromiseHandle, PromiseError> {
        self.then(handle, None, Some(on_rejected))
    }

    /// Records a finalizer for `handle`. The first registration wins and
    /// returns true; later ones return false. The finalizer runs once
    /// after settlement with the settled payload; its result is
    /// discarded.
    pub fn finally(
        &mut self,
        handle: PromiseHandle,
        handler: HandlerHandle,
    ) -> Result<bool, PromiseError> {
        self.ensure_callable(Some(handler))?;
        self.store
            .set_finalizer(handle, handler, &mut self.event_loop.microtasks)
    }

    // -- combinators ---------------------------------------------------------

    /// Fulfills with every input's value in input order, or rejects with
    /// the first rejection reason. `all(&[])` fulfills immediately with
    /// an empty list.
    pub fn all(&mut self, inputs: &[PromiseHandle]) -> Result<PromiseHandle, PromiseError> {
        self.ensure_all_known(inputs)?;
        let result = self.store.create();
        if inputs.is_empty() {
            resolve_promise(
                &mut self.store,
                &mut self.event_loop.microtasks,
                result,
                Value::List(Vec::new()),
            );
            return Ok(result);
        }
        let tracker = self.alloc_tracker(CombinatorTracker::All(PromiseAllTracker::new(
            result,
            inputs.len() as u32,
        )));
        self.attach_inputs(inputs, tracker);
        Ok(result)
    }

    /// Settles like the first input to settle, same class and payload.
    /// `race(&[])` never settles.
    pub fn race(&mut self, inputs: &[PromiseHandle]) -> Result<PromiseHandle, PromiseError> {
        self.ensure_all_known(inputs)?;
        let result = self.store.create();
        let tracker =
            self.alloc_tracker(CombinatorTracker::Race(PromiseRaceTracker::new(result)));
        self.attach_inputs(inputs, tracker);
        Ok(result)
    }

    /// Always fulfills, with one tagged outcome per input in input order,
    /// once every input has settled. `all_settled(&[])` fulfills
    /// immediately with an empty list.
    pub fn all_settled(&mut self, inputs: &[PromiseHandle]) -> Result<PromiseHandle, PromiseError> {
        self.ensure_all_known(inputs)?;
        let result = self.store.create();
        if inputs.is_empty() {
            resolve_promise(
                &mut self.store,
                &mut self.event_loop.microtasks,
                result,
                Value::List(Vec::new()),
            );
            return Ok(result);
        }
        let tracker = self.alloc_tracker(CombinatorTracker::AllSettled(
            PromiseAllSettledTracker::new(result, inputs.len() as u32),
        ));
        self.attach_inputs(inputs, tracker);
        Ok(result)
    }

    // -- timers --------------------------------------------------------------

    /// Schedules `handler` as a timer macrotask `delay_ms` of virtual
    /// time from now. Returns the macrotask registration sequence.
    pub fn set_timeout(
        &mut self,
        handler: HandlerHandle,
        delay_ms: u64,
    ) -> Result<u64, PromiseError> {
        self.ensure_callable(Some(handler))?;
        Ok(self.event_loop.set_timeout(handler, delay_ms))
    }

    // -- drivers -------------------------------------------------------------

    /// Executes at most one microtask. Returns whether one ran.
    pub fn tick(&mut self) -> bool {
        let Some(task) = self.event_loop.microtasks.dequeue() else {
            return false;
        };
        self.execute_microtask(task);
        true
    }

    /// Executes queued microtasks up to the per-turn budget, including
    /// ones enqueued while draining.
    pub fn drain_microtasks(&mut self) -> usize {
        let budget = self.event_loop.max_microtasks_per_turn;
        let mut drained = 0;
        while drained < budget && self.tick() {
            drained += 1;
        }
        drained
    }

    /// One event-loop turn: drain microtasks, then run the next ready
    /// macrotask, advancing the virtual clock to its deadline when it
    /// lies in the future. Macrotasks wait while drained microtasks
    /// remain over budget.
    pub fn turn(&mut self) -> TurnResult {
        let microtasks_drained = self.drain_microtasks();
        let mut clock_advanced = false;
        let mut executed = None;
        if self.event_loop.microtasks.is_empty() {
            if let Some(deadline) = self.event_loop.macrotasks.next_scheduled_time() {
                let from_ms = self.event_loop.clock.now_ms();
                if deadline > from_ms {
                    clock_advanced = self.event_loop.clock.advance_to(deadline);
                    if clock_advanced {
                        self.event_loop.witness.push(WitnessEvent::ClockAdvanced {
                            from_ms,
                            to_ms: deadline,
                        });
                    }
                }
            }
            let now = self.event_loop.clock.now_ms();
            if let Some(task) = self.event_loop.macrotasks.dequeue_ready(now) {
                self.event_loop.witness.push(WitnessEvent::MacrotaskExecuted {
                    source: task.source,
                    registration_seq: task.registration_seq,
                });
                self.invoke_macrotask(&task);
                executed = Some(task);
            }
        }
        TurnResult {
            microtasks_drained,
            macrotask: executed,
            clock_advanced,
        }
    }

    /// Turns until no queued work remains, bounded by the configured
    /// turn budget. Returns the number of turns taken. A promise that is
    /// pending with nothing queued leaves no work, so this terminates.
    pub fn run(&mut self) -> usize {
        let mut turns = 0;
        while turns < self.config.max_turns_per_run && self.event_loop.has_pending_work() {
            self.turn();
            turns += 1;
        }
        turns
    }

    // -- inspection ----------------------------------------------------------

    pub fn store(&self) -> &PromiseStore {
        &self.store
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    /// Mutable scheduling access, for embedders that feed macrotasks
    /// from their own sources.
    pub fn event_loop_mut(&mut self) -> &mut EventLoop {
        &mut self.event_loop
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self, handle: PromiseHandle) -> Option<&PromiseState> {
        self.store.state(handle)
    }

    /// Tracker state for an aggregate promise produced by a combinator.
    pub fn tracker_for(&self, result: PromiseHandle) -> Option<&CombinatorTracker> {
        self.trackers.values().find(|t| t.result() == result)
    }

    pub fn unhandled_rejections(&self) -> Vec<PromiseHandle> {
        self.store.unhandled_rejections()
    }

    /// Replay digest over the store's witness log.
    pub fn witness_digest(&self) -> String {
        witness_digest(self.store.witness_log())
    }

    // -- internals -----------------------------------------------------------

    fn ensure_known(&self, handle: PromiseHandle) -> Result<(), PromiseError> {
        if self.store.get(handle).is_none() {
            return Err(PromiseError::InvalidHandle { handle });
        }
        Ok(())
    }

    fn ensure_all_known(&self, handles: &[PromiseHandle]) -> Result<(), PromiseError> {
        for handle in handles {
            self.ensure_known(*handle)?;
        }
        Ok(())
    }

    fn ensure_callable(&self, handler: Option<HandlerHandle>) -> Result<(), PromiseError> {
        if let Some(handler) = handler {
            if !self.handlers.contains(handler) {
                return Err(PromiseError::UnknownHandler { handler });
            }
        }
        Ok(())
    }

    fn alloc_tracker(&mut self, tracker: CombinatorTracker) -> TrackerId {
        let id = TrackerId(self.next_tracker);
        self.next_tracker += 1;
        self.trackers.insert(id.0, tracker);
        id
    }

    fn attach_inputs(&mut self, inputs: &[PromiseHandle], tracker: TrackerId) {
        for (index, input) in inputs.iter().enumerate() {
            self.store.add_combinator_reactions(
                *input,
                tracker,
                index as u32,
                &mut self.event_loop.microtasks,
            );
        }
    }

    fn execute_microtask(&mut self, task: Microtask) {
        match task {
            Microtask::Reaction {
                kind,
                handler,
                argument,
                target,
            } => match target {
                ReactionTarget::Settle(result) => self.run_reaction(kind, handler, argument, result),
                ReactionTarget::Combinator { tracker, index } => {
                    self.notify_tracker(tracker, index, kind, argument)
                }
            },
            Microtask::Finalizer {
                promise,
                handler,
                payload,
            } => {
                self.event_loop
                    .witness
                    .push(WitnessEvent::FinalizerInvoked { handle: promise });
                let mut cx = EngineCx {
                    store: &mut self.store,
                    microtasks: &mut self.event_loop.microtasks,
                };
                // A throwing finalizer settles nothing; it only leaves a
                // witness entry.
                if let Some(Err(captured)) = self.handlers.invoke(handler, &mut cx, payload) {
                    self.event_loop.witness.push(WitnessEvent::HandlerThrew {
                        handler,
                        reason: captured.reason,
                    });
                }
            }
        }
    }

    /// Delivers one settlement payload to a `then`-registered reaction.
    fn run_reaction(
        &mut self,
        kind: ReactionKind,
        handler: Option<HandlerHandle>,
        argument: Value,
        result: PromiseHandle,
    ) {
        let Some(handler) = handler else {
            // Pass-through: a fulfillment re-enters the resolution
            // procedure so adopted promise payloads keep unwrapping; a
            // rejection propagates its reason unchanged.
            match kind {
                ReactionKind::Fulfill => resolve_promise(
                    &mut self.store,
                    &mut self.event_loop.microtasks,
                    result,
                    argument,
                ),
                ReactionKind::Reject => reject_promise(
                    &mut self.store,
                    &mut self.event_loop.microtasks,
                    result,
                    argument,
                ),
            }
            return;
        };
        let mut cx = EngineCx {
            store: &mut self.store,
            microtasks: &mut self.event_loop.microtasks,
        };
        match self.handlers.invoke(handler, &mut cx, argument) {
            Some(Ok(value)) => resolve_promise(
                &mut self.store,
                &mut self.event_loop.microtasks,
                result,
                value,
            ),
            Some(Err(captured)) => reject_promise(
                &mut self.store,
                &mut self.event_loop.microtasks,
                result,
                captured.reason,
            ),
            None => {
                // Handles are validated at registration; reaching here
                // means the queue outlived its engine. Reject so the
                // chain still settles.
                reject_promise(
                    &mut self.store,
                    &mut self.event_loop.microtasks,
                    result,
                    Value::type_error("handler is not callable"),
                )
            }
        }
    }

    /// Feeds one input settlement into a combinator tracker, settling
    /// the aggregate when the tracker says so. Input promise records are
    /// never touched.
    fn notify_tracker(&mut self, id: TrackerId, index: u32, kind: ReactionKind, value: Value) {
        let Some(tracker) = self.trackers.get_mut(&id.0) else {
            return;
        };
        match tracker {
            CombinatorTracker::All(all) => {
                let result = all.result;
                match kind {
                    ReactionKind::Fulfill => {
                        if all.record_fulfillment(index, value) {
                            all.mark_settled();
                            let values = all.collect_values();
                            resolve_promise(
                                &mut self.store,
                                &mut self.event_loop.microtasks,
                                result,
                                Value::List(values),
                            );
                        }
                    }
                    ReactionKind::Reject => {
                        if !all.settled {
                            all.mark_settled();
                            reject_promise(
                                &mut self.store,
                                &mut self.event_loop.microtasks,
                                result,
                                value,
                            );
                        }
                    }
                }
            }
            CombinatorTracker::AllSettled(settled) => {
                let result = settled.result;
                let complete = match kind {
                    ReactionKind::Fulfill => settled.record_fulfillment(index, value),
                    ReactionKind::Reject => settled.record_rejection(index, value),
                };
                if complete {
                    settled.mark_settled();
                    let outcomes: Vec<Value> = settled
                        .collect_outcomes()
                        .into_iter()
                        .map(|outcome| Value::Outcome(Box::new(outcome)))
                        .collect();
                    resolve_promise(
                        &mut self.store,
                        &mut self.event_loop.microtasks,
                        result,
                        Value::List(outcomes),
                    );
                }
            }
            CombinatorTracker::Race(race) => {
                let result = race.result;
                if race.try_settle() {
                    match kind {
                        ReactionKind::Fulfill => resolve_promise(
                            &mut self.store,
                            &mut self.event_loop.microtasks,
                            result,
                            value,
                        ),
                        ReactionKind::Reject => reject_promise(
                            &mut self.store,
                            &mut self.event_loop.microtasks,
                            result,
                            value,
                        ),
                    }
                }
            }
        }
    }

    fn invoke_macrotask(&mut self, task: &Macrotask) {
        let mut cx = EngineCx {
            store: &mut self.store,
            microtasks: &mut self.event_loop.microtasks,
        };
        if let Some(Err(captured)) = self.handlers.invoke(task.handler, &mut cx, Value::Undefined) {
            self.event_loop.witness.push(WitnessEvent::HandlerThrew {
                handler: task.handler,
                reason: captured.reason,
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Resolution procedure
// ---------------------------------------------------------------------------

/// Resolves `handle` with `value`, unwrapping promise-valued payloads:
/// settled sources are adopted on the current tick, pending sources
/// suspend the resolution behind a pass-through pair. No-op when
/// `handle` is unknown or already settled.
fn resolve_promise(
    store: &mut PromiseStore,
    queue: &mut MicrotaskQueue,
    handle: PromiseHandle,
    mut value: Value,
) {
    let mut hops = 0usize;
    loop {
        match store.state(handle) {
            None => return,
            Some(state) if state.is_settled() => return,
            Some(_) => {}
        }
        match value {
            Value::Promise(inner) if inner == handle => {
                store.settle(
                    handle,
                    ReactionKind::Reject,
                    Value::type_error(SELF_RESOLUTION_TYPE_ERROR),
                    queue,
                );
                return;
            }
            Value::Promise(inner) => match store.state(inner).cloned() {
                None => {
                    store.settle(
                        handle,
                        ReactionKind::Reject,
                        Value::type_error(format!("{inner} is not a known promise")),
                        queue,
                    );
                    return;
                }
                Some(PromiseState::Fulfilled(adopted)) => {
                    // The engine never fulfills with a promise payload,
                    // but the raw store can; bound the unwrap so a stored
                    // reference cycle rejects instead of spinning.
                    hops += 1;
                    if hops > store.len() {
                        store.settle(
                            handle,
                            ReactionKind::Reject,
                            Value::type_error("promise resolution cycle detected"),
                            queue,
                        );
                        return;
                    }
                    value = adopted;
                }
                Some(PromiseState::Rejected(reason)) => {
                    // Adoption consumes the source's rejection, exactly as
                    // the pending-source path does.
                    store.mark_rejection_handled(inner);
                    store.settle(handle, ReactionKind::Reject, reason, queue);
                    return;
                }
                Some(PromiseState::Pending) => {
                    store.add_adoption(inner, handle, queue);
                    return;
                }
            },
            other => {
                store.settle(handle, ReactionKind::Fulfill, other, queue);
                return;
            }
        }
    }
}

/// Rejects `handle` with `reason` unchanged; promise-valued reasons are
/// never unwrapped. No-op when `handle` is unknown or already settled.
fn reject_promise(
    store: &mut PromiseStore,
    queue: &mut MicrotaskQueue,
    handle: PromiseHandle,
    reason: Value,
) {
    match store.state(handle) {
        None => return,
        Some(state) if state.is_settled() => return,
        Some(_) => {}
    }
    store.settle(handle, ReactionKind::Reject, reason, queue);
}
