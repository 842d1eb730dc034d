//! Integration tests for `resolution_engine` edge cases and gaps not
//! covered by inline unit tests: resolution cycles, deep chains and
//! adoption ladders, settle-once interplay with adoption, combinator
//! corner cases, scheduling order under budget pressure, and witness
//! order sensitivity.

use std::cell::RefCell;
use std::rc::Rc;

use promise_engine::handler_table::HandlerHandle;
use promise_engine::promise_model::{
    MacrotaskSource, MicrotaskQueue, PromiseHandle, PromiseState, PromiseStore,
};
use promise_engine::resolution_engine::{
    EngineConfig, EngineCx, ResolutionEngine, SELF_RESOLUTION_TYPE_ERROR,
};
use promise_engine::value_model::Value;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn int(n: i64) -> Value {
    Value::Int(n)
}

fn text(s: &str) -> Value {
    Value::str(s)
}

fn recorder(engine: &mut ResolutionEngine, log: &Rc<RefCell<Vec<i64>>>, tag: i64) -> HandlerHandle {
    let log = Rc::clone(log);
    engine.register_handler(move |_cx, v| {
        log.borrow_mut().push(tag);
        Ok(v)
    })
}

// ===========================================================================
// Resolution cycles
// ===========================================================================

#[test]
fn self_resolution_rejects_with_the_standard_type_error() {
    let mut engine = ResolutionEngine::new();
    let p = engine.create();
    engine.resolve(p, Value::Promise(p)).expect("resolve");
    assert_eq!(
        engine.state(p),
        Some(&PromiseState::Rejected(Value::type_error(
            SELF_RESOLUTION_TYPE_ERROR
        )))
    );
}

#[test]
fn the_self_resolution_reason_formats_like_the_host_error() {
    assert_eq!(
        Value::type_error(SELF_RESOLUTION_TYPE_ERROR).to_string(),
        "TypeError: promise and value refer to the same object."
    );
}

#[test]
fn a_handler_returning_its_own_derived_promise_rejects_it() {
    let mut engine = ResolutionEngine::new();
    let slot: Rc<RefCell<Option<PromiseHandle>>> = Rc::new(RefCell::new(None));
    let slot_in = Rc::clone(&slot);
    let selfish = engine.register_handler(move |_cx, _v| {
        let q = slot_in.borrow().expect("derived handle recorded");
        Ok(Value::Promise(q))
    });
    let p = engine.resolved(int(0));
    let q = engine.then(p, Some(selfish), None).expect("then");
    *slot.borrow_mut() = Some(q);
    engine.run();
    assert_eq!(
        engine.state(q),
        Some(&PromiseState::Rejected(Value::type_error(
            SELF_RESOLUTION_TYPE_ERROR
        )))
    );
}

#[test]
fn resolving_with_an_unknown_promise_handle_rejects() {
    let mut engine = ResolutionEngine::new();
    let outer = engine.create();
    engine
        .resolve(outer, Value::Promise(PromiseHandle(777)))
        .expect("resolve");
    assert_eq!(
        engine.state(outer),
        Some(&PromiseState::Rejected(Value::type_error(
            "Promise(777) is not a known promise"
        )))
    );
}

#[test]
fn a_stored_fulfillment_cycle_rejects_instead_of_spinning() {
    // The engine API never fulfills with a promise payload, but a raw
    // store can hold one; the resolution loop has to notice the cycle.
    let mut store = PromiseStore::new();
    let mut queue = MicrotaskQueue::new();
    let a = store.create();
    let b = store.create();
    store.fulfill(a, Value::Promise(b), &mut queue).expect("a");
    store.fulfill(b, Value::Promise(a), &mut queue).expect("b");
    let c = store.create();
    let mut cx = EngineCx {
        store: &mut store,
        microtasks: &mut queue,
    };
    cx.resolve(c, Value::Promise(a));
    assert_eq!(
        store.state(c),
        Some(&PromiseState::Rejected(Value::type_error(
            "promise resolution cycle detected"
        )))
    );
}

// ===========================================================================
// Deep chains and adoption ladders
// ===========================================================================

#[test]
fn a_thousand_link_chain_drains_in_one_turn() {
    let mut engine = ResolutionEngine::new();
    let increment = engine.register_handler(|_cx, v| match v {
        Value::Int(n) => Ok(Value::Int(n + 1)),
        other => Ok(other),
    });
    let mut tail = engine.resolved(int(0));
    for _ in 0..1000 {
        tail = engine.then(tail, Some(increment), None).expect("then");
    }
    let turns = engine.run();
    assert_eq!(turns, 1);
    assert_eq!(engine.state(tail), Some(&PromiseState::Fulfilled(int(1000))));
}

#[test]
fn a_deep_adoption_ladder_collapses_to_the_innermost_value() {
    let mut engine = ResolutionEngine::new();
    let mut ladder = Vec::new();
    for _ in 0..200 {
        ladder.push(engine.create());
    }
    for i in 0..ladder.len() - 1 {
        engine
            .resolve(ladder[i], Value::Promise(ladder[i + 1]))
            .expect("adopt");
    }
    engine.resolve(ladder[199], int(7)).expect("innermost");
    let turns = engine.run();
    assert_eq!(turns, 1);
    assert_eq!(engine.state(ladder[0]), Some(&PromiseState::Fulfilled(int(7))));
}

// ===========================================================================
// Settle-once interplay with adoption
// ===========================================================================

#[test]
fn a_direct_settle_beats_a_pending_adoption() {
    let mut engine = ResolutionEngine::new();
    let inner = engine.create();
    let outer = engine.create();
    engine.resolve(outer, Value::Promise(inner)).expect("adopt");
    engine.resolve(outer, int(9)).expect("direct settle");
    assert_eq!(engine.state(outer), Some(&PromiseState::Fulfilled(int(9))));
    engine.resolve(inner, int(1)).expect("inner");
    engine.run();
    // The forwarded settlement found `outer` already settled.
    assert_eq!(engine.state(outer), Some(&PromiseState::Fulfilled(int(9))));
    assert_eq!(engine.state(inner), Some(&PromiseState::Fulfilled(int(1))));
}

#[test]
fn one_source_can_be_adopted_by_several_promises() {
    let mut engine = ResolutionEngine::new();
    let inner = engine.create();
    let first = engine.create();
    let second = engine.create();
    engine.resolve(first, Value::Promise(inner)).expect("first");
    engine.resolve(second, Value::Promise(inner)).expect("second");
    engine.resolve(inner, int(6)).expect("inner");
    engine.run();
    assert_eq!(engine.state(first), Some(&PromiseState::Fulfilled(int(6))));
    assert_eq!(engine.state(second), Some(&PromiseState::Fulfilled(int(6))));
}

#[test]
fn a_handler_may_return_a_promise_it_settled_itself() {
    let mut engine = ResolutionEngine::new();
    let nested = engine.register_handler(|cx, v| {
        let p = cx.create();
        cx.resolve(p, v);
        Ok(Value::Promise(p))
    });
    let start = engine.resolved(int(5));
    let q = engine.then(start, Some(nested), None).expect("then");
    engine.run();
    assert_eq!(engine.state(q), Some(&PromiseState::Fulfilled(int(5))));
}

// ===========================================================================
// Combinator corner cases
// ===========================================================================

#[test]
fn race_decides_by_queue_order_when_both_settle_before_the_drain() {
    let mut engine = ResolutionEngine::new();
    let a = engine.create();
    let b = engine.create();
    let winner = engine.race(&[a, b]).expect("race");
    engine.reject(b, text("fast")).expect("b settles first");
    engine.resolve(a, int(1)).expect("a settles second");
    engine.run();
    assert_eq!(engine.state(winner), Some(&PromiseState::Rejected(text("fast"))));
}

#[test]
fn duplicate_inputs_occupy_separate_slots() {
    let mut engine = ResolutionEngine::new();
    let p = engine.create();
    let agg = engine.all(&[p, p]).expect("all");
    engine.resolve(p, int(4)).expect("resolve");
    engine.run();
    assert_eq!(
        engine.state(agg),
        Some(&PromiseState::Fulfilled(Value::List(vec![int(4), int(4)])))
    );
}

#[test]
fn an_aggregate_can_feed_another_combinator() {
    let mut engine = ResolutionEngine::new();
    let a = engine.create();
    let inner_race = engine.race(&[a]).expect("race");
    let outer_all = engine.all(&[inner_race]).expect("all");
    engine.resolve(a, int(3)).expect("resolve");
    engine.run();
    assert_eq!(
        engine.state(outer_all),
        Some(&PromiseState::Fulfilled(Value::List(vec![int(3)])))
    );
}

#[test]
fn a_then_chain_continues_from_an_aggregate() {
    let mut engine = ResolutionEngine::new();
    let sum = engine.register_handler(|_cx, v| match v {
        Value::List(items) => {
            let mut total = 0;
            for item in &items {
                if let Value::Int(n) = item {
                    total += n;
                }
            }
            Ok(Value::Int(total))
        }
        other => Ok(other),
    });
    let a = engine.resolved(int(10));
    let b = engine.resolved(int(20));
    let agg = engine.all(&[a, b]).expect("all");
    let q = engine.then(agg, Some(sum), None).expect("then");
    engine.run();
    assert_eq!(engine.state(q), Some(&PromiseState::Fulfilled(int(30))));
}

#[test]
fn all_settled_display_of_the_aggregate_value() {
    let mut engine = ResolutionEngine::new();
    let a = engine.rejected(text("bad"));
    let b = engine.resolved(int(2));
    let agg = engine.all_settled(&[a, b]).expect("all_settled");
    engine.run();
    match engine.state(agg) {
        Some(PromiseState::Fulfilled(v)) => {
            assert_eq!(v.to_string(), "[rejected(bad), fulfilled(2)]");
        }
        other => panic!("expected fulfillment, got {other:?}"),
    }
}

// ===========================================================================
// Scheduling order under budget pressure
// ===========================================================================

#[test]
fn tick_and_drain_on_an_empty_engine_do_nothing() {
    let mut engine = ResolutionEngine::new();
    assert!(!engine.tick());
    assert_eq!(engine.drain_microtasks(), 0);
}

#[test]
fn a_macrotask_waits_until_the_microtask_backlog_clears() {
    let mut engine = ResolutionEngine::with_config(EngineConfig {
        max_microtasks_per_turn: 2,
        max_turns_per_run: 100,
    });
    let log = Rc::new(RefCell::new(Vec::new()));
    let a = recorder(&mut engine, &log, 1);
    let b = recorder(&mut engine, &log, 2);
    let c = recorder(&mut engine, &log, 3);
    let timer = recorder(&mut engine, &log, 4);
    let p = engine.resolved(int(0));
    engine.then(p, Some(a), None).expect("a");
    engine.then(p, Some(b), None).expect("b");
    engine.then(p, Some(c), None).expect("c");
    engine.set_timeout(timer, 0).expect("timer");
    let turns = engine.run();
    assert_eq!(turns, 2);
    assert_eq!(*log.borrow(), vec![1, 2, 3, 4]);
}

#[test]
fn finalizers_and_reactions_share_one_fifo() {
    let mut engine = ResolutionEngine::new();
    let log = Rc::new(RefCell::new(Vec::new()));
    let fin = recorder(&mut engine, &log, 1);
    let late = recorder(&mut engine, &log, 2);
    let p = engine.resolved(int(1));
    engine.finally(p, fin).expect("finally");
    engine.then(p, Some(late), None).expect("then");
    engine.run();
    // Enqueue time decides; the finalizer was queued first.
    assert_eq!(*log.borrow(), vec![1, 2]);
}

#[test]
fn reject_reactions_run_in_registration_order() {
    let mut engine = ResolutionEngine::new();
    let log = Rc::new(RefCell::new(Vec::new()));
    let c1 = recorder(&mut engine, &log, 1);
    let c2 = recorder(&mut engine, &log, 2);
    let p = engine.create();
    engine.catch(p, c1).expect("first catch");
    engine.catch(p, c2).expect("second catch");
    engine.reject(p, text("r")).expect("reject");
    engine.run();
    assert_eq!(*log.borrow(), vec![1, 2]);
}

#[test]
fn later_timeouts_are_relative_to_the_advanced_clock() {
    let mut engine = ResolutionEngine::new();
    let log = Rc::new(RefCell::new(Vec::new()));
    let first = recorder(&mut engine, &log, 1);
    let second = recorder(&mut engine, &log, 2);
    engine.set_timeout(first, 10).expect("first");
    engine.run();
    assert_eq!(engine.event_loop().clock.now_ms(), 10);
    engine.set_timeout(second, 5).expect("second");
    engine.run();
    assert_eq!(engine.event_loop().clock.now_ms(), 15);
    assert_eq!(*log.borrow(), vec![1, 2]);
}

#[test]
fn embedder_fed_channel_tasks_outrank_timers() {
    let mut engine = ResolutionEngine::new();
    let log = Rc::new(RefCell::new(Vec::new()));
    let channel = recorder(&mut engine, &log, 1);
    let timer = recorder(&mut engine, &log, 2);
    engine.set_timeout(timer, 0).expect("timer");
    engine
        .event_loop_mut()
        .macrotasks
        .schedule(MacrotaskSource::MessageChannel, channel, 0);
    let turns = engine.run();
    assert_eq!(turns, 2);
    assert_eq!(*log.borrow(), vec![1, 2]);
}

// ===========================================================================
// Diagnostics and witness order sensitivity
// ===========================================================================

#[test]
fn a_finalizer_does_not_consume_a_rejection() {
    let mut engine = ResolutionEngine::new();
    let fin = engine.register_handler(|_cx, _payload| Ok(Value::Undefined));
    let p = engine.rejected(text("x"));
    engine.finally(p, fin).expect("finally");
    engine.run();
    assert_eq!(engine.unhandled_rejections(), vec![p]);
}

#[test]
fn settlement_order_changes_the_witness_digest() {
    let run_in_order = |flip: bool| {
        let mut engine = ResolutionEngine::new();
        let a = engine.create();
        let b = engine.create();
        if flip {
            engine.resolve(b, int(2)).expect("b");
            engine.resolve(a, int(1)).expect("a");
        } else {
            engine.resolve(a, int(1)).expect("a");
            engine.resolve(b, int(2)).expect("b");
        }
        engine.witness_digest()
    };
    assert_eq!(run_in_order(false), run_in_order(false));
    assert_ne!(run_in_order(false), run_in_order(true));
}
