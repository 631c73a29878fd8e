// Copyright (c) The testrig Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Preconditions: single-level shared setup with identity-based
//! amortization.
//!
//! A precondition is the legacy, flat analog of a fixture. Consecutive tests
//! in the queue that point at the same precondition instance share one
//! `prepare`/`close` pair and one cancellation scope, so expensive setup
//! (logging into a device, starting a daemon) is paid once per contiguous
//! run instead of once per test.

use crate::{context::StageContext, state::{OpaqueValue, PreState}};
use futures::future::BoxFuture;
use std::{
    fmt,
    sync::{Mutex, PoisonError},
    time::Duration,
};
use tokio_util::sync::CancellationToken;

/// Shared setup that amortizes across consecutive tests.
///
/// The engine guarantees that `prepare` is called before the first dependent
/// test of a contiguous run and `close` after the last one, and that `close`
/// may be called without a prior successful `prepare` -- implementations
/// must tolerate that.
pub trait Precondition: Send + Sync + 'static {
    /// The precondition's name, used in log output.
    fn name(&self) -> &str;

    /// The timeout budget applied to each of `prepare` and `close`.
    fn timeout(&self) -> Duration;

    /// Establishes the precondition and returns the opaque value dependent
    /// tests observe via [`TestState::pre_value`](crate::state::TestState::pre_value).
    ///
    /// Long-lived resources should be tied to [`PreState::pre_ctx`], which
    /// stays alive until after the final `close`.
    fn prepare<'a>(
        &'a self,
        ctx: &'a StageContext,
        state: &'a PreState,
    ) -> BoxFuture<'a, OpaqueValue>;

    /// Releases the precondition. Called exactly once per contiguous run.
    fn close<'a>(&'a self, ctx: &'a StageContext, state: &'a PreState) -> BoxFuture<'a, ()>;
}

/// The engine-managed scope shared by all tests of a contiguous
/// same-precondition run: the cancellation handle plus the prepared value.
///
/// Created lazily by the first stage that needs it, carried from test to
/// test through the items' shared slots, and cancelled exactly once after
/// the final `close` returns.
pub(crate) struct PreScope {
    token: CancellationToken,
    value: Mutex<Option<OpaqueValue>>,
}

impl PreScope {
    pub(crate) fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            value: Mutex::new(None),
        }
    }

    /// The shared cancellation scope, surfaced to user code as
    /// [`PreState::pre_ctx`].
    pub(crate) fn ctx(&self) -> StageContext {
        StageContext::from_token(self.token.clone())
    }

    pub(crate) fn prepared_value(&self) -> Option<OpaqueValue> {
        self.value
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_value(&self, value: OpaqueValue) {
        *self.value.lock().unwrap_or_else(PoisonError::into_inner) = Some(value);
    }

    /// Cancels the scope and drops the prepared value. Terminal.
    pub(crate) fn finish(&self) {
        self.token.cancel();
        self.value
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl fmt::Debug for PreScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreScope")
            .field("cancelled", &self.token.is_cancelled())
            .field("prepared", &self.prepared_value().is_some())
            .finish()
    }
}
