// Copyright (c) The testrig Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The output channel between a running test and its reporter.
//!
//! Everything a test produces -- log lines, recorded errors, stage timing
//! markers -- flows through a single ordered stream of [`OutputEvent`]s. The
//! engine is the only producer-side owner; the consumer is whatever sits on
//! the other end of the channel (in production, the bundle that forwards
//! results to the controller process).

mod events;
mod sink;

pub use events::{OutputEvent, OutputEventKind, TimingMarker};
pub(crate) use sink::OutputSink;

/// Suggested capacity for the caller-provided output channel.
///
/// The engine accepts any bounded sender; this is the bound used by
/// [`run_queue`](crate::runner::run_queue) consumers that don't have a reason
/// to pick something else.
pub const OUTPUT_CHANNEL_CAPACITY: usize = 4096;
