// Copyright (c) The testrig Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The state surface user code interacts with.
//!
//! One [`RootState`] per test execution owns the output sink handle, the
//! error flag and the directories and variables resolved from config. User
//! code never sees the root; it sees one of four restricted views depending
//! on what is currently running:
//!
//! * [`TestState`] -- the test function itself.
//! * [`PreState`] -- precondition `prepare`/`close`.
//! * [`FixtureState`] -- fixture `set_up`/`tear_down`.
//! * [`FixtureTestState`] -- fixture `pre_test`/`post_test`.
//!
//! Which fields are legal to touch is decided by which methods a view has,
//! so an illegal access is a compile error rather than a runtime check.

mod views;

pub use views::{FixtureState, FixtureTestState, PreState, TestState};

use crate::{
    instance::TestInstance,
    output::{OutputEventKind, OutputSink, TimingMarker},
};
use camino::Utf8PathBuf;
use debug_ignore::DebugIgnore;
use std::{
    any::Any,
    collections::BTreeMap,
    panic::Location,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

/// The erased value returned by a precondition's `prepare` or a fixture's
/// `set_up`. Consumers downcast to the concrete type they expect; a failed
/// downcast is the runtime analog of a type error in the original's dynamic
/// contract.
pub type OpaqueValue = Arc<dyn Any + Send + Sync>;

/// Panic payload raised by `fatal` and recognized -- and swallowed -- by the
/// stage runner. Must stay private to the crate so no user payload can be
/// mistaken for it.
pub(crate) struct FatalSentinel;

/// Where a view's `error`/`fatal` calls land.
#[derive(Clone, Debug)]
pub(crate) enum ErrorScope {
    /// The test's own error flag: gates later stages.
    Test,
    /// A fixture-scoped flag: the error belongs to the fixture entity, not
    /// the test.
    Scoped(Arc<AtomicBool>),
}

/// Shared root behind every view. Cheap to clone.
#[derive(Clone, Debug)]
pub(crate) struct RootState {
    inner: Arc<RootInner>,
}

#[derive(Debug)]
struct RootInner {
    sink: OutputSink,
    test: Arc<TestInstance>,
    vars: BTreeMap<String, String>,
    out_dir: Option<Utf8PathBuf>,
    data_dir: Option<Utf8PathBuf>,
    has_error: AtomicBool,
    pre_value: DebugIgnore<Mutex<Option<OpaqueValue>>>,
}

impl RootState {
    pub(crate) fn new(
        test: Arc<TestInstance>,
        sink: OutputSink,
        out_dir: Option<Utf8PathBuf>,
        data_dir: Option<Utf8PathBuf>,
        vars: BTreeMap<String, String>,
    ) -> Self {
        Self {
            inner: Arc::new(RootInner {
                sink,
                test,
                vars,
                out_dir,
                data_dir,
                has_error: AtomicBool::new(false),
                pre_value: DebugIgnore(Mutex::new(None)),
            }),
        }
    }

    pub(crate) fn test(&self) -> &Arc<TestInstance> {
        &self.inner.test
    }

    pub(crate) fn out_dir(&self) -> Option<&Utf8PathBuf> {
        self.inner.out_dir.as_ref()
    }

    pub(crate) fn data_dir(&self) -> Option<&Utf8PathBuf> {
        self.inner.data_dir.as_ref()
    }

    pub(crate) fn var(&self, name: &str) -> Option<&str> {
        self.inner.vars.get(name).map(String::as_str)
    }

    pub(crate) fn has_test_error(&self) -> bool {
        self.inner.has_error.load(Ordering::SeqCst)
    }

    pub(crate) fn emit(&self, kind: OutputEventKind) {
        self.inner.sink.emit(kind);
    }

    pub(crate) fn emit_log(&self, message: String) {
        self.emit(OutputEventKind::Log { message });
    }

    pub(crate) fn emit_timing(&self, stage: &str, marker: TimingMarker) {
        self.emit(OutputEventKind::Timing {
            stage: stage.to_owned(),
            marker,
        });
    }

    /// Records an error against `scope`: sets the flag, emits the event.
    pub(crate) fn record_error(
        &self,
        scope: &ErrorScope,
        reason: String,
        location: &Location<'_>,
        stack: Option<String>,
    ) {
        match scope {
            ErrorScope::Test => self.inner.has_error.store(true, Ordering::SeqCst),
            ErrorScope::Scoped(flag) => flag.store(true, Ordering::SeqCst),
        }
        self.emit(OutputEventKind::Error {
            reason,
            file: location.file().to_owned(),
            line: location.line(),
            stack,
        });
    }

    pub(crate) fn set_pre_value(&self, value: Option<OpaqueValue>) {
        *self
            .inner
            .pre_value
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = value;
    }

    pub(crate) fn pre_value(&self) -> Option<OpaqueValue> {
        self.inner
            .pre_value
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Closes the output channel. Exactly once per test, by the orchestrator.
    pub(crate) fn close_sink(&self) {
        self.inner.sink.close();
    }
}
