// Copyright (c) The testrig Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test items as consumed by the engine.
//!
//! The engine does not discover or index tests; it is handed fully formed
//! [`TestInstance`]s in queue order by the registry layer.

use crate::{
    context::StageContext,
    precondition::{PreScope, Precondition},
    state::TestState,
};
use futures::future::BoxFuture;
use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

/// The future returned by a test function.
pub type TestFuture = BoxFuture<'static, ()>;

/// A test function: receives the stage's cancellation scope and the test
/// state view, reports through the state, returns nothing.
pub type TestFn = Arc<dyn Fn(StageContext, TestState) -> TestFuture + Send + Sync>;

/// Timeout applied to a test function whose item does not set one.
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Grace window granted after a deadline for user code to observe
/// cancellation and return, when the item does not set its own.
pub const DEFAULT_EXIT_GRACE: Duration = Duration::from_secs(30);

/// One executable test case.
///
/// Immutable for the duration of an execution, except for the
/// precondition-scope slot the engine threads through consecutive items
/// sharing a precondition.
pub struct TestInstance {
    /// Unique name, e.g. `power.SuspendResume`.
    pub name: String,

    /// The test function.
    pub func: TestFn,

    /// Deadline for the test function, surfaced through the stage context.
    pub timeout: Duration,

    /// Extra time after `timeout` before the function's flow is abandoned.
    /// `None` or zero selects [`DEFAULT_EXIT_GRACE`].
    pub exit_timeout: Option<Duration>,

    /// Data files the test may resolve via
    /// [`TestState::data_path`](crate::state::TestState::data_path).
    pub data: Vec<String>,

    /// Shared setup amortized across consecutive items holding the same
    /// instance.
    pub pre: Option<Arc<dyn Precondition>>,

    /// Name of the leaf fixture this test runs under, if any.
    pub fixture: Option<String>,

    /// Declared software dependencies, carried as entity metadata.
    pub software_deps: Vec<String>,

    /// Declared service dependencies, carried as entity metadata.
    pub service_deps: Vec<String>,

    /// Runtime variables the test may read.
    pub vars: Vec<String>,

    // Engine-filled: the scope shared across a contiguous same-precondition
    // run. Lives from the first dependent test's prepare stage until the
    // final close stage clears it.
    pre_scope: Mutex<Option<Arc<PreScope>>>,
}

impl TestInstance {
    /// Creates an instance with default timeouts and no declarations.
    pub fn new(
        name: impl Into<String>,
        func: impl Fn(StageContext, TestState) -> TestFuture + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            func: Arc::new(func),
            timeout: DEFAULT_TEST_TIMEOUT,
            exit_timeout: None,
            data: Vec::new(),
            pre: None,
            fixture: None,
            software_deps: Vec::new(),
            service_deps: Vec::new(),
            vars: Vec::new(),
            pre_scope: Mutex::new(None),
        }
    }

    /// The effective exit grace for the test function's stage.
    pub fn exit_grace(&self) -> Duration {
        match self.exit_timeout {
            Some(grace) if !grace.is_zero() => grace,
            _ => DEFAULT_EXIT_GRACE,
        }
    }

    /// True iff `self` and `other` name the same precondition instance.
    /// Identity, not equality: two preconditions with equal names but
    /// separate instances do not share.
    pub(crate) fn shares_pre_with(&self, other: &TestInstance) -> bool {
        match (&self.pre, &other.pre) {
            (Some(a), Some(b)) => std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b)),
            _ => false,
        }
    }

    pub(crate) fn pre_scope(&self) -> Option<Arc<PreScope>> {
        self.pre_scope
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn pre_scope_or_init(&self) -> Arc<PreScope> {
        self.pre_scope
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert_with(|| Arc::new(PreScope::new()))
            .clone()
    }

    /// Hands the scope to the next item of a contiguous run.
    pub(crate) fn share_pre_scope(&self, scope: Arc<PreScope>) {
        *self
            .pre_scope
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(scope);
    }

    pub(crate) fn clear_pre_scope(&self) {
        self.pre_scope
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl fmt::Debug for TestInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestInstance")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("exit_timeout", &self.exit_timeout)
            .field("data", &self.data)
            .field("pre", &self.pre.as_ref().map(|p| p.name().to_owned()))
            .field("fixture", &self.fixture)
            .finish_non_exhaustive()
    }
}
