// Copyright (c) The testrig Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The wire form of test output.
//!
//! Events are tagged variants with a fixed field set per variant. The
//! controller process deserializes them in FIFO order; the serde
//! representation is the compatibility contract.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

/// A single event produced during a test.
///
/// The timestamp is attached by the sink when it accepts the event, not by
/// the producer -- producers on abandoned flows may be arbitrarily delayed,
/// and acceptance order is the order the consumer observes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutputEvent {
    /// When the sink accepted this event.
    pub timestamp: DateTime<FixedOffset>,

    /// What happened.
    #[serde(flatten)]
    pub kind: OutputEventKind,
}

/// The kind of output event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum OutputEventKind {
    /// A log line from user code.
    Log {
        /// The message.
        message: String,
    },

    /// An error recorded during the test.
    Error {
        /// Why the error was recorded.
        reason: String,

        /// Source file of the call that recorded the error.
        file: String,

        /// Line within `file`.
        line: u32,

        /// A captured backtrace, present for uncaught failures.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
    },

    /// A stage boundary marker. Every test produces at least one terminal
    /// `End` marker, emitted by the unconditional cleanup stage.
    Timing {
        /// The stage name.
        stage: String,

        /// Whether the stage is starting or ending.
        marker: TimingMarker,
    },
}

impl OutputEventKind {
    /// Returns true for `Error` events.
    pub fn is_error(&self) -> bool {
        matches!(self, OutputEventKind::Error { .. })
    }
}

/// Which edge of a stage a [`OutputEventKind::Timing`] event marks.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TimingMarker {
    /// The stage began.
    Start,
    /// The stage ended.
    End,
}
