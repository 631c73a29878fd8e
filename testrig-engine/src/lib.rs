// Copyright (c) The testrig Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core execution engine for the testrig integration-test framework.
//!
//! Given a queue of test items and their declared setup dependencies, the
//! engine runs each test as a strictly ordered sequence of timed stages:
//! fixture reconciliation, setup, precondition prepare, the test function,
//! precondition close, fixture post-test hooks, cleanup. Each stage gets a
//! deadline visible to user code plus a grace window to drain; code that
//! ignores both is abandoned, never killed. Everything a test produces
//! flows as ordered events through a single output channel that tolerates
//! writes from abandoned flows.
//!
//! The engine deliberately does not discover tests, parse attributes, run
//! tests in parallel, or persist results -- it consumes prepared
//! [`TestInstance`](instance::TestInstance)s and emits
//! [`OutputEvent`](output::OutputEvent)s, and everything else belongs to
//! the layers around it.

pub mod config;
pub mod context;
pub mod errors;
pub mod fixture;
mod helpers;
pub mod instance;
pub mod output;
pub mod precondition;
pub mod runner;
pub mod state;
mod time;
