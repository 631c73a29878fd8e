// Copyright (c) The testrig Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by the engine.
//!
//! Failures inside user code never surface as `Result`s -- they become
//! [`Error` events](crate::output::OutputEventKind::Error) on the output
//! channel. The types here cover the engine's own contracts: a fixture
//! forest that cannot be resolved is a caller bug, reported before any user
//! code runs.

use std::error;
use thiserror::Error;

/// Boxed error type accepted from user-provided callbacks (fixture resets,
/// remote reconnection).
pub type BoxError = Box<dyn error::Error + Send + Sync>;

/// An error in the shape of the fixture forest.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum FixtureGraphError {
    /// A fixture with this name is already registered.
    #[error("fixture `{0}` is already registered")]
    Duplicate(String),

    /// A test or fixture referenced a fixture that is not registered.
    #[error("fixture `{0}` not registered")]
    Unknown(String),

    /// A fixture names a parent that is not registered.
    #[error("fixture `{name}` names unknown parent `{parent}`")]
    UnknownParent {
        /// The fixture with the dangling reference.
        name: String,
        /// The missing parent.
        parent: String,
    },

    /// Following parent links from this fixture never reaches a root.
    #[error("parent chain of fixture `{0}` contains a cycle")]
    ParentCycle(String),
}
