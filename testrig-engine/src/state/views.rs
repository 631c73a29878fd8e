// Copyright (c) The testrig Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The four restricted views over [`RootState`].

use super::{ErrorScope, FatalSentinel, OpaqueValue, RootState};
use crate::{context::StageContext, fixture::FixtureDescriptor, precondition::PreScope};
use camino::{Utf8Path, Utf8PathBuf};
use debug_ignore::DebugIgnore;
use std::{
    fmt,
    panic::{self, Location},
    sync::{Arc, atomic::{AtomicBool, Ordering}},
};

/// The operations shared by every view: logging, error recording, declared
/// data and variable resolution. Restrictions live in the views wrapping it.
#[derive(Clone, Debug)]
struct Surface {
    root: RootState,
    scope: ErrorScope,
    declared_data: Vec<String>,
    declared_vars: Vec<String>,
    out_dir: Option<Utf8PathBuf>,
}

impl Surface {
    fn log(&self, message: impl fmt::Display) {
        self.root.emit_log(message.to_string());
    }

    #[track_caller]
    fn error(&self, reason: impl fmt::Display) {
        self.root
            .record_error(&self.scope, reason.to_string(), Location::caller(), None);
    }

    #[track_caller]
    fn fatal(&self, reason: impl fmt::Display) -> ! {
        self.root
            .record_error(&self.scope, reason.to_string(), Location::caller(), None);
        panic::panic_any(FatalSentinel)
    }

    fn has_error(&self) -> bool {
        match &self.scope {
            ErrorScope::Test => self.root.has_test_error(),
            ErrorScope::Scoped(flag) => flag.load(Ordering::SeqCst),
        }
    }

    fn out_dir(&self) -> Option<&Utf8Path> {
        self.out_dir.as_deref()
    }

    #[track_caller]
    fn data_path(&self, name: &str) -> Utf8PathBuf {
        if !self.declared_data.iter().any(|d| d == name) {
            self.fatal(format_args!("data file {name} not declared"));
        }
        match self.root.data_dir() {
            Some(dir) => dir.join(name),
            None => self.fatal(format_args!(
                "data file {name} requested but no data directory is configured"
            )),
        }
    }

    #[track_caller]
    fn var(&self, name: &str) -> Option<&str> {
        if !self.declared_vars.iter().any(|v| v == name) {
            self.fatal(format_args!("runtime variable {name} not declared"));
        }
        self.root.var(name)
    }

    #[track_caller]
    fn required_var(&self, name: &str) -> &str {
        match self.var(name) {
            Some(value) => value,
            None => self.fatal(format_args!("runtime variable {name} has no value")),
        }
    }
}

macro_rules! surface_api {
    () => {
        /// Emits a log event.
        pub fn log(&self, message: impl fmt::Display) {
            self.surface.log(message);
        }

        /// Records an error: sets the error flag and emits an error event
        /// with the caller's file and line. Execution continues.
        #[track_caller]
        pub fn error(&self, reason: impl fmt::Display) {
            self.surface.error(reason);
        }

        /// As [`error`](Self::error), then unwinds the current stage.
        #[track_caller]
        pub fn fatal(&self, reason: impl fmt::Display) -> ! {
            self.surface.fatal(reason)
        }

        /// True iff an error or fatal has been recorded in this scope so far.
        pub fn has_error(&self) -> bool {
            self.surface.has_error()
        }

        /// This scope's output directory, if one is configured.
        pub fn out_dir(&self) -> Option<&Utf8Path> {
            self.surface.out_dir()
        }

        /// Resolves a declared data file against the data directory.
        /// Fatal if `name` was not declared.
        #[track_caller]
        pub fn data_path(&self, name: &str) -> Utf8PathBuf {
            self.surface.data_path(name)
        }

        /// The value of a declared runtime variable, or `None` if the runner
        /// was not given one. Fatal if `name` was not declared.
        #[track_caller]
        pub fn var(&self, name: &str) -> Option<&str> {
            self.surface.var(name)
        }

        /// As [`var`](Self::var), but fatal when no value is available.
        #[track_caller]
        pub fn required_var(&self, name: &str) -> &str {
            self.surface.required_var(name)
        }
    };
}

/// The view handed to the test function.
#[derive(Clone, Debug)]
pub struct TestState {
    surface: Surface,
}

impl TestState {
    pub(crate) fn new(root: RootState) -> Self {
        let test = root.test().clone();
        Self {
            surface: Surface {
                out_dir: root.out_dir().cloned(),
                scope: ErrorScope::Test,
                declared_data: test.data.clone(),
                declared_vars: test.vars.clone(),
                root,
            },
        }
    }

    surface_api!();

    /// The opaque value produced by the test's precondition, or `None` when
    /// the test has no precondition or its `prepare` did not complete.
    pub fn pre_value(&self) -> Option<OpaqueValue> {
        self.surface.root.pre_value()
    }

    /// Software dependencies declared by the test item.
    pub fn software_deps(&self) -> &[String] {
        &self.surface.root.test().software_deps
    }

    /// Service dependencies declared by the test item.
    pub fn service_deps(&self) -> &[String] {
        &self.surface.root.test().service_deps
    }
}

/// The view handed to precondition `prepare` and `close`.
pub struct PreState {
    surface: Surface,
    scope: Arc<PreScope>,
}

impl PreState {
    pub(crate) fn new(root: RootState, scope: Arc<PreScope>) -> Self {
        let test = root.test().clone();
        Self {
            surface: Surface {
                out_dir: root.out_dir().cloned(),
                scope: ErrorScope::Test,
                declared_data: test.data.clone(),
                declared_vars: test.vars.clone(),
                root,
            },
            scope,
        }
    }

    surface_api!();

    /// The cancellation scope shared by every test of the contiguous
    /// same-precondition run. Cancelled only after the final `close`
    /// returns, so resources attached to it outlive individual tests.
    pub fn pre_ctx(&self) -> StageContext {
        self.scope.ctx()
    }
}

impl fmt::Debug for PreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreState")
            .field("surface", &self.surface)
            .finish_non_exhaustive()
    }
}

/// The view handed to fixture `set_up` and `tear_down`.
///
/// Errors recorded here belong to the fixture entity, not to the test that
/// happened to trigger the operation.
#[derive(Clone, Debug)]
pub struct FixtureState {
    surface: Surface,
    parent_value: DebugIgnore<Option<OpaqueValue>>,
}

impl FixtureState {
    pub(crate) fn new(
        root: RootState,
        descriptor: &FixtureDescriptor,
        out_dir: Option<Utf8PathBuf>,
        parent_value: Option<OpaqueValue>,
        errored: Arc<AtomicBool>,
    ) -> Self {
        Self {
            surface: Surface {
                root,
                scope: ErrorScope::Scoped(errored),
                declared_data: descriptor.data.clone(),
                declared_vars: descriptor.vars.clone(),
                out_dir,
            },
            parent_value: DebugIgnore(parent_value),
        }
    }

    surface_api!();

    /// The opaque value returned by the parent fixture's `set_up`, or `None`
    /// for a root fixture.
    pub fn parent_value(&self) -> Option<OpaqueValue> {
        self.parent_value.0.clone()
    }
}

/// The view handed to fixture `pre_test` and `post_test`.
///
/// Its output directory is the *test's* directory -- per-test artifacts land
/// with the test -- while data and variables stay fixture-scoped. Errors
/// recorded here fail the test.
#[derive(Clone, Debug)]
pub struct FixtureTestState {
    surface: Surface,
}

impl FixtureTestState {
    pub(crate) fn new(root: RootState, descriptor: &FixtureDescriptor) -> Self {
        Self {
            surface: Surface {
                out_dir: root.out_dir().cloned(),
                scope: ErrorScope::Test,
                declared_data: descriptor.data.clone(),
                declared_vars: descriptor.vars.clone(),
                root,
            },
        }
    }

    surface_api!();
}
