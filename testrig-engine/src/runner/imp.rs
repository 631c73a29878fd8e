// Copyright (c) The testrig Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The test orchestrator: assembles and runs the stage list for one test.
//!
//! For a test `T` with previous setup possibly still live and next item `N`
//! the orchestrator runs, in order:
//!
//! | stage      | what                                         | skipped when            |
//! |------------|----------------------------------------------|-------------------------|
//! | `fixtures` | reconcile the live stack, fixture pre_tests  | never                   |
//! | `setup`    | out dir, data files, remote, pre-test hook   | never                   |
//! | `prepare`  | precondition prepare                         | error flag, or no pre   |
//! | `run`      | the test function                            | error flag              |
//! | `close`    | precondition close + scope cancel            | no pre, or `N` shares it|
//! | `post_test`| fixture post_tests, leaf first               | per-fixture, see below  |
//! | `cleanup`  | post-test hook + saved pre-test post-hook    | never                   |
//!
//! The error flag is consulted exactly twice: entering `prepare` and
//! entering `run`. Later stages always run so cleanup is guaranteed, and a
//! `post_test` runs for exactly the fixtures whose `pre_test` ran.
//!
//! The output channel is closed here, after the last stage's run window, so
//! abandoned flows from any stage can keep writing until the very end of
//! the test and never observe a closed pipe mid-run.

use crate::{
    config::{PostHookFn, RunConfig},
    context::StageContext,
    fixture::Fixture,
    helpers::ensure_out_dir,
    instance::{DEFAULT_EXIT_GRACE, TestInstance},
    output::{OutputEvent, OutputSink, TimingMarker},
    runner::stage::run_stage,
    state::{ErrorScope, PreState, RootState, TestState},
};
use camino::Utf8Path;
use std::{
    fs,
    future::Future,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::sync::mpsc;
use tracing::debug;

/// Fixed budget for the setup stage (out dir, data files, remote, hook).
pub const SETUP_STAGE_TIMEOUT: Duration = Duration::from_secs(60);

/// Fixed budget for the cleanup stage.
pub const CLEANUP_STAGE_TIMEOUT: Duration = Duration::from_secs(60);

/// Runs a single test to completion.
///
/// Returns true iff every stage finished within its run window. A false
/// return means some flow was abandoned and the caller should report the
/// timeout (and may choose to abort the overall run); it does not by itself
/// mean the test failed -- failures travel as error events on `out_tx`.
///
/// The engine closes `out_tx`'s sink after the final stage: events from
/// abandoned flows are delivered until then and silently dropped after.
pub async fn run_test(
    ctx: &StageContext,
    test: &Arc<TestInstance>,
    out_tx: mpsc::Sender<OutputEvent>,
    cfg: &RunConfig,
) -> bool {
    let stopwatch = crate::time::stopwatch();
    let root = RootState::new(
        test.clone(),
        OutputSink::new(out_tx),
        cfg.out_dir.clone(),
        cfg.data_dir.clone(),
        cfg.vars.clone(),
    );
    debug!(test = %test.name, "test started");

    let mut in_time = true;

    // Fixture reconciliation. A missing or unresolvable chain is recorded
    // as a test error in the setup stage, which then gates prepare and run.
    let mut fixture_problem = None;
    let mut pre_tested: Vec<Arc<dyn Fixture>> = Vec::new();
    if let Some(manager) = &cfg.fixtures {
        root.emit_timing("fixtures", TimingMarker::Start);
        let chain = match &test.fixture {
            Some(leaf) => match manager.set().chain(leaf) {
                Ok(chain) => chain,
                Err(error) => {
                    fixture_problem = Some(format!("fixture chain unavailable: {error}"));
                    Vec::new()
                }
            },
            None => Vec::new(),
        };
        if fixture_problem.is_none() {
            let status = manager
                .reconcile(ctx, &root, &chain, cfg.fixture_out_root.as_deref())
                .await;
            in_time &= status.in_time;
            if !status.ready {
                let leaf = test.fixture.as_deref().unwrap_or_default();
                fixture_problem = Some(format!("required fixture {leaf} could not be set up"));
            } else if !chain.is_empty() {
                let (hooks_in_time, ran) = manager.run_pre_tests(ctx, &root, &chain).await;
                in_time &= hooks_in_time;
                pre_tested = ran;
            }
        }
        root.emit_timing("fixtures", TimingMarker::End);
    } else if let Some(leaf) = &test.fixture {
        fixture_problem = Some(format!(
            "test declares fixture {leaf} but no fixtures are configured"
        ));
    }

    // Setup: the saved post-hook crosses from here to the cleanup stage.
    let post_hook_slot: Arc<Mutex<Option<PostHookFn>>> = Arc::new(Mutex::new(None));
    {
        let state = TestState::new(root.clone());
        let out_dir = cfg.out_dir.clone();
        let data_dir = cfg.data_dir.clone();
        let data = test.data.clone();
        let remote = cfg.remote.clone();
        let pre_test_fn = cfg.pre_test_fn.clone();
        let slot = post_hook_slot.clone();
        in_time &= bracketed(
            ctx,
            &root,
            "setup",
            SETUP_STAGE_TIMEOUT,
            SETUP_STAGE_TIMEOUT + DEFAULT_EXIT_GRACE,
            move |sctx| async move {
                if let Some(problem) = fixture_problem {
                    state.error(problem);
                }
                if let Some(dir) = &out_dir {
                    if let Err(error) = ensure_out_dir(dir) {
                        state.error(format!("failed to create out dir {dir}: {error}"));
                    }
                }
                verify_data_files(&state, data_dir.as_deref(), &data);
                if let Some(remote) = &remote {
                    if let Err(error) = remote.ensure_connected(&sctx).await {
                        state.error(format!("remote target unavailable: {error}"));
                    }
                }
                if let Some(pre_test_fn) = pre_test_fn {
                    let hook = (pre_test_fn.0)(sctx, state).await;
                    *slot.lock().unwrap_or_else(PoisonError::into_inner) = hook;
                }
            },
        )
        .await;
    }

    // Prepare. Entering here is one of the two places the error flag gates.
    // A scope that already holds a prepared value means an earlier test of
    // this contiguous run paid for prepare; nothing to do but observe it.
    if let Some(pre) = &test.pre {
        if !root.has_test_error() {
            let scope = test.pre_scope_or_init();
            if scope.prepared_value().is_none() {
                let state = PreState::new(root.clone(), scope.clone());
                let run = pre.clone();
                let value_scope = scope.clone();
                in_time &= bracketed(
                    ctx,
                    &root,
                    "prepare",
                    pre.timeout(),
                    pre.timeout() + DEFAULT_EXIT_GRACE,
                    move |sctx| async move {
                        let value = run.prepare(&sctx, &state).await;
                        value_scope.set_value(value);
                    },
                )
                .await;
            } else {
                debug!(pre = pre.name(), "precondition already prepared, amortized");
            }
            root.set_pre_value(scope.prepared_value());
        }
    }

    // Run. The other error-flag gate.
    if !root.has_test_error() {
        let func = test.func.clone();
        let state = TestState::new(root.clone());
        in_time &= bracketed(
            ctx,
            &root,
            "run",
            test.timeout,
            test.timeout + test.exit_grace(),
            move |sctx| async move { (func)(sctx, state).await },
        )
        .await;
    }

    // Close, at the last contiguous test only. Runs regardless of the error
    // flag, including when prepare never did (close without prepare).
    if let Some(pre) = &test.pre {
        let shared_with_next = cfg
            .next_test
            .as_ref()
            .filter(|next| test.shares_pre_with(next));
        if let Some(next) = shared_with_next {
            if let Some(scope) = test.pre_scope() {
                next.share_pre_scope(scope);
            }
            debug!(pre = pre.name(), "precondition shared with next test, close deferred");
        } else {
            let scope = test.pre_scope_or_init();
            let state = PreState::new(root.clone(), scope.clone());
            let run = pre.clone();
            in_time &= bracketed(
                ctx,
                &root,
                "close",
                pre.timeout(),
                pre.timeout() + DEFAULT_EXIT_GRACE,
                move |sctx| async move { run.close(&sctx, &state).await },
            )
            .await;
            // The shared scope dies with the contiguous run: cancelled
            // exactly once, after close has had its chance.
            scope.finish();
            test.clear_pre_scope();
            root.set_pre_value(None);
        }
    }

    // Fixture post_tests, leaf first, for exactly the pre_tested fixtures.
    if let Some(manager) = &cfg.fixtures {
        if !pre_tested.is_empty() {
            root.emit_timing("post_test", TimingMarker::Start);
            in_time &= manager.run_post_tests(ctx, &root, &pre_tested).await;
            root.emit_timing("post_test", TimingMarker::End);
        }
    }

    // Cleanup. Unconditional: even a test that failed in setup gets its
    // hooks, and its End marker is the guaranteed terminal event.
    {
        let state = TestState::new(root.clone());
        let post_test_fn = cfg.post_test_fn.clone();
        let slot = post_hook_slot.clone();
        in_time &= bracketed(
            ctx,
            &root,
            "cleanup",
            CLEANUP_STAGE_TIMEOUT,
            CLEANUP_STAGE_TIMEOUT + DEFAULT_EXIT_GRACE,
            move |sctx| async move {
                if let Some(post_test_fn) = post_test_fn {
                    (post_test_fn.0)(sctx.clone(), state.clone()).await;
                }
                let hook = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
                if let Some(hook) = hook {
                    hook(sctx, state).await;
                }
            },
        )
        .await;
    }

    root.close_sink();
    debug!(
        test = %test.name,
        elapsed = ?stopwatch.snapshot().elapsed,
        in_time,
        "test finished"
    );
    in_time
}

/// Runs an ordered queue of tests against a shared base config.
///
/// Threads `next_test` through so preconditions amortize and fixtures
/// reconcile across consecutive items, and gives each test its own
/// directory under `cfg.out_dir`. The live fixture stack is left standing
/// after the last test, ready for a subsequent queue over the same manager.
///
/// Returns one in-time verdict per test, in queue order.
pub async fn run_queue(
    ctx: &StageContext,
    tests: &[Arc<TestInstance>],
    out_tx: mpsc::Sender<OutputEvent>,
    cfg: &RunConfig,
) -> Vec<bool> {
    let mut verdicts = Vec::with_capacity(tests.len());
    for (index, test) in tests.iter().enumerate() {
        let mut test_cfg = cfg.clone();
        test_cfg.next_test = tests.get(index + 1).cloned();
        if let Some(out_root) = &cfg.out_dir {
            test_cfg.out_dir = Some(out_root.join(&test.name));
        }
        verdicts.push(run_test(ctx, test, out_tx.clone(), &test_cfg).await);
    }
    verdicts
}

/// One stage, bracketed by timing markers. Timing events appear on the
/// output channel only for stages that actually execute.
async fn bracketed<F, Fut>(
    ctx: &StageContext,
    root: &RootState,
    name: &'static str,
    ctx_timeout: Duration,
    run_timeout: Duration,
    f: F,
) -> bool
where
    F: FnOnce(StageContext) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    root.emit_timing(name, TimingMarker::Start);
    let in_time = run_stage(ctx, root, name, ErrorScope::Test, ctx_timeout, run_timeout, f).await;
    root.emit_timing(name, TimingMarker::End);
    in_time
}

/// Checks each declared data file, consulting the `.external_error` sidecar
/// for a reason when the file itself is absent.
fn verify_data_files(state: &TestState, data_dir: Option<&Utf8Path>, data: &[String]) {
    if data.is_empty() {
        return;
    }
    let Some(dir) = data_dir else {
        state.error("test declares data files but no data directory is configured");
        return;
    };
    for name in data {
        if dir.join(name).exists() {
            continue;
        }
        match fs::read_to_string(dir.join(format!("{name}.external_error"))) {
            Ok(reason) => state.error(format!(
                "Required data file {name} missing: {}",
                reason.trim()
            )),
            Err(_) => state.error(format!("Required data file {name} missing")),
        }
    }
}
