// Copyright (c) The testrig Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-run configuration handed to the orchestrator.
//!
//! The config describes everything around the test that the engine does not
//! own: where outputs and data files live, which runtime variables are set,
//! the registered fixtures, the optional remote target, and the bundle's
//! pre/post hooks. The same base config is typically reused for a whole
//! queue with only `next_test` (and per-test out dirs) changing.

use crate::{
    context::StageContext,
    errors::BoxError,
    fixture::FixtureManager,
    instance::TestInstance,
    state::TestState,
};
use camino::Utf8PathBuf;
use debug_ignore::DebugIgnore;
use futures::future::BoxFuture;
use std::{collections::BTreeMap, sync::Arc};

/// Hook invoked during the setup stage, before the precondition and the
/// test function. May return a one-shot hook to run during cleanup.
pub type PreTestFn =
    Arc<dyn Fn(StageContext, TestState) -> BoxFuture<'static, Option<PostHookFn>> + Send + Sync>;

/// One-shot hook returned by a [`PreTestFn`], invoked during cleanup after
/// the configured [`PostTestFn`].
pub type PostHookFn = Box<dyn FnOnce(StageContext, TestState) -> BoxFuture<'static, ()> + Send>;

/// Hook invoked unconditionally during the cleanup stage.
pub type PostTestFn = Arc<dyn Fn(StageContext, TestState) -> BoxFuture<'static, ()> + Send + Sync>;

/// A connection to the machine under test that the setup stage can
/// re-establish before user code runs.
pub trait RemoteTarget: Send + Sync + 'static {
    /// Ensures the connection is usable, reconnecting if needed.
    fn ensure_connected<'a>(&'a self, ctx: &'a StageContext) -> BoxFuture<'a, Result<(), BoxError>>;
}

/// Options recognized by [`run_test`](crate::runner::run_test).
#[derive(Clone, Debug, Default)]
pub struct RunConfig {
    /// The test's output directory. Created (mode 0777 + sticky) by the
    /// setup stage. Empty is allowed in unit tests: state views then report
    /// no out dir.
    pub out_dir: Option<Utf8PathBuf>,

    /// Directory holding data files and their `.external_error` sidecars.
    pub data_dir: Option<Utf8PathBuf>,

    /// Values for declared runtime variables.
    pub vars: BTreeMap<String, String>,

    /// The next item in the queue, used for precondition amortization and
    /// fixture reconciliation. `None` for the last test.
    pub next_test: Option<Arc<TestInstance>>,

    /// Registered fixtures plus the live stack carried between tests.
    pub fixtures: Option<Arc<FixtureManager>>,

    /// Root under which fixtures get their own output directories.
    pub fixture_out_root: Option<Utf8PathBuf>,

    /// The machine under test; when present, the setup stage ensures the
    /// connection is alive before anything else runs.
    pub remote: Option<DebugIgnore<Arc<dyn RemoteTarget>>>,

    /// Bundle hook run in the setup stage.
    pub pre_test_fn: Option<DebugIgnore<PreTestFn>>,

    /// Bundle hook run in the cleanup stage.
    pub post_test_fn: Option<DebugIgnore<PostTestFn>>,
}

impl RunConfig {
    /// A config with nothing set.
    pub fn new() -> Self {
        Self::default()
    }
}
