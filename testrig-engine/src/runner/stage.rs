// Copyright (c) The testrig Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Running a single stage.
//!
//! A stage is one user function under two clocks: a deadline surfaced to the
//! code through its [`StageContext`], and a longer run window after which
//! the engine stops waiting. The gap between them is the exit grace -- the
//! time well-behaved code gets to notice cancellation and return.
//!
//! Runaway code is contained, never killed: when the run window elapses the
//! spawned flow is left running and the engine moves on. The output sink
//! stays open until the orchestrator closes the whole test, so an abandoned
//! flow's late writes are first still delivered, then silently dropped --
//! they can never panic the runner or leak into a later test.

use crate::{
    context::StageContext,
    state::{ErrorScope, FatalSentinel, RootState},
};
use futures::FutureExt;
use std::{
    any::Any,
    backtrace::Backtrace,
    future::Future,
    panic::{self, AssertUnwindSafe, Location},
    sync::Once,
    time::Duration,
};
use tracing::{debug, warn};

/// Runs one stage to completion or abandonment.
///
/// `f` is handed the derived stage scope (deadline `ctx_timeout`) and its
/// future is spawned as a separate flow. Returns true iff the flow finished
/// within `run_timeout`; on false the flow is abandoned, not aborted.
///
/// A [`FatalSentinel`] unwind ends the stage quietly (the error was already
/// recorded by `fatal`). Any other panic is recorded as a stack-tagged error
/// against `scope`.
pub(crate) async fn run_stage<F, Fut>(
    ctx: &StageContext,
    root: &RootState,
    name: &'static str,
    scope: ErrorScope,
    ctx_timeout: Duration,
    run_timeout: Duration,
    f: F,
) -> bool
where
    F: FnOnce(StageContext) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    silence_sentinel_panics();

    let stage_ctx = ctx.child(Some(ctx_timeout));
    let fut = f(stage_ctx);
    let recovery_root = root.clone();
    let flow = tokio::spawn(async move {
        if let Err(payload) = AssertUnwindSafe(fut).catch_unwind().await {
            recover_unwind(&recovery_root, &scope, name, payload);
        }
    });

    debug!(stage = name, ?ctx_timeout, ?run_timeout, "stage started");
    match tokio::time::timeout(run_timeout, flow).await {
        Ok(join) => {
            // The task neither panics (caught above) nor gets aborted, so a
            // join error here means the runtime is being torn down.
            if let Err(error) = join {
                warn!(stage = name, %error, "stage flow lost");
            }
            debug!(stage = name, "stage finished");
            true
        }
        Err(_) => {
            warn!(stage = name, "stage ignored its deadline, abandoning flow");
            false
        }
    }
}

/// Classifies an unwind out of user code.
#[track_caller]
fn recover_unwind(
    root: &RootState,
    scope: &ErrorScope,
    name: &'static str,
    payload: Box<dyn Any + Send>,
) {
    if payload.is::<FatalSentinel>() {
        // `fatal` recorded the error before unwinding; nothing left to do.
        debug!(stage = name, "stage ended by fatal");
        return;
    }
    let reason = panic_message(payload.as_ref());
    debug!(stage = name, reason, "stage panicked");
    root.record_error(
        scope,
        format!("panic: {reason}"),
        Location::caller(),
        Some(Backtrace::force_capture().to_string()),
    );
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "<non-string panic payload>"
    }
}

/// The default panic hook prints every unwind to stderr. Fatal is part of
/// the reporting contract, not a bug, so unwinds carrying the sentinel are
/// filtered out. Installed once per process, wrapping whatever hook is
/// already there.
fn silence_sentinel_panics() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if info.payload().downcast_ref::<FatalSentinel>().is_none() {
                previous(info);
            }
        }));
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        instance::TestInstance,
        output::{OutputEvent, OutputEventKind, OutputSink},
        state::TestState,
    };
    use std::{collections::BTreeMap, sync::Arc};
    use tokio::sync::mpsc;

    fn harness() -> (RootState, mpsc::Receiver<OutputEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let instance = TestInstance::new("stage.Probe", |_ctx, _s| {
            Box::pin(futures::future::ready(()))
        });
        let root = RootState::new(
            Arc::new(instance),
            OutputSink::new(tx),
            None,
            None,
            BTreeMap::new(),
        );
        (root, rx)
    }

    fn errors(rx: &mut mpsc::Receiver<OutputEvent>) -> Vec<String> {
        let mut reasons = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let OutputEventKind::Error { reason, .. } = event.kind {
                reasons.push(reason);
            }
        }
        reasons
    }

    #[tokio::test]
    async fn completes_within_window() {
        let (root, mut rx) = harness();
        let ctx = StageContext::new();
        let in_time = run_stage(
            &ctx,
            &root,
            "probe",
            ErrorScope::Test,
            Duration::from_secs(5),
            Duration::from_secs(10),
            |_sctx| futures::future::ready(()),
        )
        .await;
        assert!(in_time);
        assert!(errors(&mut rx).is_empty());
        assert!(!root.has_test_error());
    }

    #[tokio::test]
    async fn fatal_ends_stage_without_extra_error() {
        let (root, mut rx) = harness();
        let ctx = StageContext::new();
        let state = TestState::new(root.clone());
        let in_time = run_stage(
            &ctx,
            &root,
            "probe",
            ErrorScope::Test,
            Duration::from_secs(5),
            Duration::from_secs(10),
            move |_sctx| async move {
                state.fatal("gave up");
            },
        )
        .await;
        assert!(in_time, "fatal ends the stage in time");
        assert!(root.has_test_error());
        assert_eq!(errors(&mut rx), vec!["gave up".to_owned()]);
    }

    #[tokio::test]
    async fn foreign_panic_becomes_stack_tagged_error() {
        let (root, mut rx) = harness();
        let ctx = StageContext::new();
        let in_time = run_stage(
            &ctx,
            &root,
            "probe",
            ErrorScope::Test,
            Duration::from_secs(5),
            Duration::from_secs(10),
            |_sctx| async {
                panic!("boom");
            },
        )
        .await;
        assert!(in_time, "recovered panic still completes the stage");
        assert!(root.has_test_error());

        let mut found = false;
        while let Ok(event) = rx.try_recv() {
            if let OutputEventKind::Error { reason, stack, .. } = event.kind {
                assert!(reason.contains("boom"), "reason was {reason}");
                assert!(stack.is_some(), "panic errors carry a stack");
                found = true;
            }
        }
        assert!(found, "expected exactly one error event");
    }

    #[tokio::test]
    async fn deadline_is_visible_and_grace_is_usable() {
        let (root, mut rx) = harness();
        let ctx = StageContext::new();
        let state = TestState::new(root.clone());
        let in_time = run_stage(
            &ctx,
            &root,
            "probe",
            ErrorScope::Test,
            Duration::from_millis(1),
            Duration::from_secs(10),
            move |sctx| async move {
                sctx.cancelled().await;
                state.error("saw timeout");
            },
        )
        .await;
        assert!(in_time, "code that drains within grace is in time");
        assert_eq!(errors(&mut rx), vec!["saw timeout".to_owned()]);
    }

    #[tokio::test]
    async fn runaway_flow_is_abandoned_not_killed() {
        let (root, mut rx) = harness();
        let ctx = StageContext::new();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let state = TestState::new(root.clone());
        let in_time = run_stage(
            &ctx,
            &root,
            "probe",
            ErrorScope::Test,
            Duration::from_millis(1),
            Duration::from_millis(2),
            move |_sctx| async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                // Still alive after abandonment: the sink is open until the
                // orchestrator closes the test, so this write is accepted.
                state.log("late but alive");
                let _ = done_tx.send(());
            },
        )
        .await;
        assert!(!in_time, "runaway flow must report abandonment");

        done_rx.await.expect("abandoned flow still ran to completion");
        let mut saw_late = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(&event.kind, OutputEventKind::Log { message } if message == "late but alive")
            {
                saw_late = true;
            }
        }
        assert!(saw_late);
        assert!(!root.has_test_error());
    }
}
