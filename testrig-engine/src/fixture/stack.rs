// Copyright (c) The testrig Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The live fixture stack and its reconciliation against the next test.
//!
//! Between tests the manager retains the stack of currently set-up fixtures
//! (root at the bottom). Given the next test's chain it tears down only
//! what no longer applies, resets what survives, and sets up what is
//! missing:
//!
//! 1. Keep the longest common prefix of the live stack and the chain.
//! 2. Tear down everything above it, leaf first.
//! 3. Reset the survivors root first; a failed reset tears that element and
//!    everything above it down so it is set up afresh.
//! 4. Set up the chain's missing suffix, root first.
//!
//! Reset failures never fail the current test; they cost a teardown and a
//! fresh set-up before the next one. Errors recorded during `set_up` or
//! `tear_down` belong to the fixture, not to whichever test triggered the
//! operation.

use crate::{
    context::StageContext,
    fixture::{Fixture, FixtureSet},
    helpers::ensure_out_dir,
    instance::DEFAULT_EXIT_GRACE,
    runner::stage::run_stage,
    state::{ErrorScope, FixtureState, FixtureTestState, OpaqueValue, RootState},
};
use camino::{Utf8Path, Utf8PathBuf};
use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicBool, Ordering},
};
use tracing::{debug, warn};

/// Owns fixture definitions and the live stack. One manager serves a whole
/// queue of tests; the stack is only ever mutated between tests.
#[derive(Debug)]
pub struct FixtureManager {
    set: FixtureSet,
    stack: Mutex<Vec<LiveFixture>>,
}

#[derive(Clone)]
struct LiveFixture {
    fixture: Arc<dyn Fixture>,
    value: OpaqueValue,
}

impl std::fmt::Debug for LiveFixture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveFixture")
            .field("name", &self.fixture.descriptor().name)
            .finish_non_exhaustive()
    }
}

/// What reconciliation achieved.
pub(crate) struct ReconcileStatus {
    /// Every fixture operation finished within its run window.
    pub(crate) in_time: bool,
    /// The live stack now equals the requested chain.
    pub(crate) ready: bool,
}

impl FixtureManager {
    /// Creates a manager over a set of registered fixtures, with an empty
    /// live stack.
    pub fn new(set: FixtureSet) -> Self {
        Self {
            set,
            stack: Mutex::new(Vec::new()),
        }
    }

    /// The registered fixtures.
    pub fn set(&self) -> &FixtureSet {
        &self.set
    }

    /// Names of the currently live fixtures, root first.
    pub fn live_names(&self) -> Vec<String> {
        self.lock_stack()
            .iter()
            .map(|live| live.fixture.descriptor().name.clone())
            .collect()
    }

    fn lock_stack(&self) -> std::sync::MutexGuard<'_, Vec<LiveFixture>> {
        self.stack.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Brings the live stack in line with `chain` (root first). Only called
    /// between tests; the engine runs one test at a time.
    pub(crate) async fn reconcile(
        &self,
        ctx: &StageContext,
        root: &RootState,
        chain: &[Arc<dyn Fixture>],
        fixture_out_root: Option<&Utf8Path>,
    ) -> ReconcileStatus {
        // Operate on a local copy; the stack is written back in one piece.
        let mut stack = std::mem::take(&mut *self.lock_stack());
        let mut in_time = true;

        let common = stack
            .iter()
            .zip(chain)
            .take_while(|(live, wanted)| {
                live.fixture.descriptor().name == wanted.descriptor().name
            })
            .count();

        // Tear down everything above the common prefix, leaf first.
        while stack.len() > common {
            in_time &= tear_down_top(ctx, root, &mut stack, fixture_out_root).await;
        }

        // Reset the survivors, root first. The first failure truncates.
        let mut reset_failed_at = None;
        for (index, live) in stack.iter().enumerate() {
            let (op_in_time, ok) = reset_one(ctx, root, &live.fixture).await;
            in_time &= op_in_time;
            if !ok {
                reset_failed_at = Some(index);
                break;
            }
        }
        if let Some(index) = reset_failed_at {
            warn!(
                fixture = %stack[index].fixture.descriptor().name,
                "reset failed, tearing down for fresh set-up"
            );
            while stack.len() > index {
                in_time &= tear_down_top(ctx, root, &mut stack, fixture_out_root).await;
            }
        }

        // Set up the missing suffix, root first.
        let mut ready = true;
        for wanted in &chain[stack.len()..] {
            let parent_value = stack.last().map(|live| live.value.clone());
            let (op_in_time, value) =
                set_up_one(ctx, root, wanted, parent_value, fixture_out_root).await;
            in_time &= op_in_time;
            match value {
                Some(value) => stack.push(LiveFixture {
                    fixture: wanted.clone(),
                    value,
                }),
                None => {
                    ready = false;
                    break;
                }
            }
        }

        debug!(
            live = ?stack.iter().map(|l| &l.fixture.descriptor().name).collect::<Vec<_>>(),
            ready,
            "fixture stack reconciled"
        );
        *self.lock_stack() = stack;
        ReconcileStatus { in_time, ready }
    }

    /// Runs `pre_test` for every element of the chain, root first. Returns
    /// the fixtures whose hook ran to completion, in that order -- exactly
    /// the set whose `post_test` must run afterwards.
    pub(crate) async fn run_pre_tests(
        &self,
        ctx: &StageContext,
        root: &RootState,
        chain: &[Arc<dyn Fixture>],
    ) -> (bool, Vec<Arc<dyn Fixture>>) {
        let mut in_time = true;
        let mut ran = Vec::with_capacity(chain.len());
        for fixture in chain {
            let timeout = fixture.timeouts().pre_test;
            let state = FixtureTestState::new(root.clone(), fixture.descriptor());
            let fx = fixture.clone();
            let completed = run_stage(
                ctx,
                root,
                "fixture pre_test",
                ErrorScope::Test,
                timeout,
                timeout + DEFAULT_EXIT_GRACE,
                move |sctx| async move { fx.pre_test(&sctx, &state).await },
            )
            .await;
            in_time &= completed;
            if completed {
                ran.push(fixture.clone());
            }
        }
        (in_time, ran)
    }

    /// Runs `post_test` for `ran` in reverse (leaf first).
    pub(crate) async fn run_post_tests(
        &self,
        ctx: &StageContext,
        root: &RootState,
        ran: &[Arc<dyn Fixture>],
    ) -> bool {
        let mut in_time = true;
        for fixture in ran.iter().rev() {
            let timeout = fixture.timeouts().post_test;
            let state = FixtureTestState::new(root.clone(), fixture.descriptor());
            let fx = fixture.clone();
            in_time &= run_stage(
                ctx,
                root,
                "fixture post_test",
                ErrorScope::Test,
                timeout,
                timeout + DEFAULT_EXIT_GRACE,
                move |sctx| async move { fx.post_test(&sctx, &state).await },
            )
            .await;
        }
        in_time
    }
}

fn fixture_out_dir(out_root: Option<&Utf8Path>, fixture: &Arc<dyn Fixture>) -> Option<Utf8PathBuf> {
    let dir = out_root?.join(&fixture.descriptor().name);
    match ensure_out_dir(&dir) {
        Ok(()) => Some(dir),
        Err(error) => {
            warn!(
                fixture = %fixture.descriptor().name,
                %error,
                "failed to create fixture out dir"
            );
            None
        }
    }
}

async fn set_up_one(
    ctx: &StageContext,
    root: &RootState,
    fixture: &Arc<dyn Fixture>,
    parent_value: Option<OpaqueValue>,
    out_root: Option<&Utf8Path>,
) -> (bool, Option<OpaqueValue>) {
    let timeout = fixture.timeouts().set_up;
    let errored = Arc::new(AtomicBool::new(false));
    let state = FixtureState::new(
        root.clone(),
        fixture.descriptor(),
        fixture_out_dir(out_root, fixture),
        parent_value,
        errored.clone(),
    );
    let value_slot: Arc<Mutex<Option<OpaqueValue>>> = Arc::new(Mutex::new(None));

    let fx = fixture.clone();
    let slot = value_slot.clone();
    let in_time = run_stage(
        ctx,
        root,
        "fixture set_up",
        ErrorScope::Scoped(errored.clone()),
        timeout,
        timeout + DEFAULT_EXIT_GRACE,
        move |sctx| async move {
            let value = fx.set_up(&sctx, &state).await;
            *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(value);
        },
    )
    .await;

    let value = value_slot
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    if !in_time || errored.load(Ordering::SeqCst) {
        // An abandoned or errored set-up is not live; whatever it built is
        // not safe to hand to descendants.
        return (in_time, None);
    }
    (in_time, value)
}

async fn tear_down_top(
    ctx: &StageContext,
    root: &RootState,
    stack: &mut Vec<LiveFixture>,
    out_root: Option<&Utf8Path>,
) -> bool {
    let Some(live) = stack.pop() else {
        return true;
    };
    let timeout = live.fixture.timeouts().tear_down;
    let errored = Arc::new(AtomicBool::new(false));
    let state = FixtureState::new(
        root.clone(),
        live.fixture.descriptor(),
        fixture_out_dir(out_root, &live.fixture),
        stack.last().map(|below| below.value.clone()),
        errored.clone(),
    );
    let fx = live.fixture.clone();
    run_stage(
        ctx,
        root,
        "fixture tear_down",
        ErrorScope::Scoped(errored),
        timeout,
        timeout + DEFAULT_EXIT_GRACE,
        move |sctx| async move { fx.tear_down(&sctx, &state).await },
    )
    .await
}

async fn reset_one(
    ctx: &StageContext,
    root: &RootState,
    fixture: &Arc<dyn Fixture>,
) -> (bool, bool) {
    let timeout = fixture.timeouts().reset;
    let outcome: Arc<Mutex<Option<Result<(), String>>>> = Arc::new(Mutex::new(None));

    let fx = fixture.clone();
    let slot = outcome.clone();
    let in_time = run_stage(
        ctx,
        root,
        "fixture reset",
        // Reset takes no state; a panic in it is attributed to the fixture.
        ErrorScope::Scoped(Arc::new(AtomicBool::new(false))),
        timeout,
        timeout + DEFAULT_EXIT_GRACE,
        move |sctx| async move {
            let result = fx.reset(&sctx).await.map_err(|e| e.to_string());
            *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(result);
        },
    )
    .await;

    let result = outcome
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    let ok = match result {
        Some(Ok(())) => in_time,
        Some(Err(error)) => {
            // Internal: surfaced only if the re-set-up it triggers fails.
            debug!(fixture = %fixture.descriptor().name, error, "fixture reset failed");
            false
        }
        // Abandoned or panicked before producing a verdict.
        None => false,
    };
    (in_time, ok)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fixture::FixtureDescriptor,
        instance::TestInstance,
        output::{OutputEvent, OutputSink},
    };
    use futures::future::BoxFuture;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use tokio::sync::mpsc;

    struct Scripted {
        descriptor: FixtureDescriptor,
        log: Arc<Mutex<Vec<String>>>,
        fail_reset: AtomicBool,
        fail_set_up: AtomicBool,
    }

    impl Scripted {
        fn arc(
            name: &str,
            parent: Option<&str>,
            log: &Arc<Mutex<Vec<String>>>,
        ) -> Arc<Scripted> {
            Arc::new(Self {
                descriptor: FixtureDescriptor {
                    name: name.to_owned(),
                    parent: parent.map(str::to_owned),
                    ..FixtureDescriptor::default()
                },
                log: log.clone(),
                fail_reset: AtomicBool::new(false),
                fail_set_up: AtomicBool::new(false),
            })
        }

        fn record(&self, op: &str) {
            self.log
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(format!("{op} {}", self.descriptor.name));
        }
    }

    impl Fixture for Scripted {
        fn descriptor(&self) -> &FixtureDescriptor {
            &self.descriptor
        }

        fn set_up<'a>(
            &'a self,
            _ctx: &'a StageContext,
            state: &'a FixtureState,
        ) -> BoxFuture<'a, OpaqueValue> {
            Box::pin(async move {
                self.record("set_up");
                if self.fail_set_up.load(Ordering::SeqCst) {
                    state.error("set-up refused");
                }
                Arc::new(self.descriptor.name.clone()) as OpaqueValue
            })
        }

        fn reset<'a>(
            &'a self,
            _ctx: &'a StageContext,
        ) -> BoxFuture<'a, Result<(), crate::errors::BoxError>> {
            Box::pin(async move {
                self.record("reset");
                if self.fail_reset.load(Ordering::SeqCst) {
                    Err("drifted out of calibration".into())
                } else {
                    Ok(())
                }
            })
        }

        fn tear_down<'a>(
            &'a self,
            _ctx: &'a StageContext,
            _state: &'a FixtureState,
        ) -> BoxFuture<'a, ()> {
            Box::pin(async move { self.record("tear_down") })
        }
    }

    struct Harness {
        root: RootState,
        // Kept alive so sink writes don't hit a closed channel.
        _rx: mpsc::Receiver<OutputEvent>,
    }

    fn harness() -> Harness {
        let (tx, rx) = mpsc::channel(256);
        let instance = TestInstance::new("stack.Probe", |_ctx, _s| {
            Box::pin(futures::future::ready(()))
        });
        Harness {
            root: RootState::new(
                Arc::new(instance),
                OutputSink::new(tx),
                None,
                None,
                BTreeMap::new(),
            ),
            _rx: rx,
        }
    }

    fn manager_with(fixtures: &[&Arc<Scripted>]) -> FixtureManager {
        let mut set = FixtureSet::new();
        for fixture in fixtures {
            set.register(Arc::clone(*fixture) as Arc<dyn Fixture>)
                .expect("registers");
        }
        FixtureManager::new(set)
    }

    fn chain(fixtures: &[&Arc<Scripted>]) -> Vec<Arc<dyn Fixture>> {
        fixtures
            .iter()
            .map(|f| Arc::clone(*f) as Arc<dyn Fixture>)
            .collect()
    }

    fn drain(log: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
        std::mem::take(&mut *log.lock().unwrap_or_else(PoisonError::into_inner))
    }

    #[tokio::test]
    async fn second_reconcile_only_resets() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let rig = Scripted::arc("rig", None, &log);
        let dut = Scripted::arc("dut", Some("rig"), &log);
        let manager = manager_with(&[&rig, &dut]);
        let harness = harness();
        let ctx = StageContext::new();
        let wanted = chain(&[&rig, &dut]);

        let status = manager.reconcile(&ctx, &harness.root, &wanted, None).await;
        assert!(status.in_time && status.ready);
        assert_eq!(drain(&log), ["set_up rig", "set_up dut"]);
        assert_eq!(manager.live_names(), ["rig", "dut"]);

        let status = manager.reconcile(&ctx, &harness.root, &wanted, None).await;
        assert!(status.in_time && status.ready);
        assert_eq!(drain(&log), ["reset rig", "reset dut"]);
        assert_eq!(manager.live_names(), ["rig", "dut"]);
    }

    #[tokio::test]
    async fn switching_leaves_tears_down_above_the_common_prefix() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let rig = Scripted::arc("rig", None, &log);
        let dut = Scripted::arc("dut", Some("rig"), &log);
        let cam = Scripted::arc("cam", Some("rig"), &log);
        let manager = manager_with(&[&rig, &dut, &cam]);
        let harness = harness();
        let ctx = StageContext::new();

        manager
            .reconcile(&ctx, &harness.root, &chain(&[&rig, &dut]), None)
            .await;
        drain(&log);

        let status = manager
            .reconcile(&ctx, &harness.root, &chain(&[&rig, &cam]), None)
            .await;
        assert!(status.ready);
        assert_eq!(drain(&log), ["tear_down dut", "reset rig", "set_up cam"]);
        assert_eq!(manager.live_names(), ["rig", "cam"]);
    }

    #[tokio::test]
    async fn reset_failure_rebuilds_from_the_failing_element() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let rig = Scripted::arc("rig", None, &log);
        let dut = Scripted::arc("dut", Some("rig"), &log);
        let manager = manager_with(&[&rig, &dut]);
        let harness = harness();
        let ctx = StageContext::new();
        let wanted = chain(&[&rig, &dut]);

        manager.reconcile(&ctx, &harness.root, &wanted, None).await;
        drain(&log);

        dut.fail_reset.store(true, Ordering::SeqCst);
        let status = manager.reconcile(&ctx, &harness.root, &wanted, None).await;
        assert!(status.ready, "a failed reset recovers via fresh set-up");
        assert_eq!(
            drain(&log),
            ["reset rig", "reset dut", "tear_down dut", "set_up dut"]
        );
        assert_eq!(manager.live_names(), ["rig", "dut"]);
        assert!(
            !harness.root.has_test_error(),
            "reset recovery is internal to the fixture layer"
        );
    }

    #[tokio::test]
    async fn root_reset_failure_rebuilds_everything() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let rig = Scripted::arc("rig", None, &log);
        let dut = Scripted::arc("dut", Some("rig"), &log);
        let manager = manager_with(&[&rig, &dut]);
        let harness = harness();
        let ctx = StageContext::new();
        let wanted = chain(&[&rig, &dut]);

        manager.reconcile(&ctx, &harness.root, &wanted, None).await;
        drain(&log);

        rig.fail_reset.store(true, Ordering::SeqCst);
        let status = manager.reconcile(&ctx, &harness.root, &wanted, None).await;
        assert!(status.ready);
        assert_eq!(
            drain(&log),
            [
                "reset rig",
                "tear_down dut",
                "tear_down rig",
                "set_up rig",
                "set_up dut"
            ]
        );
    }

    #[tokio::test]
    async fn failed_set_up_leaves_the_chain_not_ready() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let rig = Scripted::arc("rig", None, &log);
        let dut = Scripted::arc("dut", Some("rig"), &log);
        dut.fail_set_up.store(true, Ordering::SeqCst);
        let manager = manager_with(&[&rig, &dut]);
        let harness = harness();
        let ctx = StageContext::new();

        let status = manager
            .reconcile(&ctx, &harness.root, &chain(&[&rig, &dut]), None)
            .await;
        assert!(status.in_time);
        assert!(!status.ready);
        assert_eq!(drain(&log), ["set_up rig", "set_up dut"]);
        assert_eq!(
            manager.live_names(),
            ["rig"],
            "the errored fixture must not join the live stack"
        );
        assert!(
            !harness.root.has_test_error(),
            "set-up errors belong to the fixture, not the test"
        );
    }

    #[tokio::test]
    async fn set_up_sees_the_parent_value() {
        struct ParentCheck {
            descriptor: FixtureDescriptor,
            seen: Arc<Mutex<Option<String>>>,
        }
        impl Fixture for ParentCheck {
            fn descriptor(&self) -> &FixtureDescriptor {
                &self.descriptor
            }
            fn set_up<'a>(
                &'a self,
                _ctx: &'a StageContext,
                state: &'a FixtureState,
            ) -> BoxFuture<'a, OpaqueValue> {
                Box::pin(async move {
                    *self.seen.lock().unwrap_or_else(PoisonError::into_inner) = state
                        .parent_value()
                        .and_then(|v| v.downcast_ref::<String>().cloned());
                    Arc::new(()) as OpaqueValue
                })
            }
            fn tear_down<'a>(
                &'a self,
                _ctx: &'a StageContext,
                _state: &'a FixtureState,
            ) -> BoxFuture<'a, ()> {
                Box::pin(futures::future::ready(()))
            }
        }

        let log = Arc::new(Mutex::new(Vec::new()));
        let rig = Scripted::arc("rig", None, &log);
        let seen = Arc::new(Mutex::new(None));
        let child: Arc<dyn Fixture> = Arc::new(ParentCheck {
            descriptor: {
                let mut d = FixtureDescriptor::new("probe");
                d.parent = Some("rig".to_owned());
                d
            },
            seen: seen.clone(),
        });

        let mut set = FixtureSet::new();
        set.register(Arc::clone(&rig) as Arc<dyn Fixture>).expect("rig");
        set.register(child.clone()).expect("probe");
        let manager = FixtureManager::new(set);
        let harness = harness();

        let wanted = vec![Arc::clone(&rig) as Arc<dyn Fixture>, child];
        let status = manager
            .reconcile(&StageContext::new(), &harness.root, &wanted, None)
            .await;
        assert!(status.ready);
        assert_eq!(
            seen.lock().unwrap_or_else(PoisonError::into_inner).clone(),
            Some("rig".to_owned()),
            "child set-up observes the parent's opaque value"
        );
    }
}
