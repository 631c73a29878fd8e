// Copyright (c) The testrig Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The producer side of the output channel.
//!
//! User code may spawn background flows that outlive the test deadline;
//! those flows keep a handle to the sink and will keep writing after the
//! orchestrator has moved on. The one hard rule is that a write into a
//! closed sink is a silent no-op -- it never panics, never errors, and never
//! attributes output to a later test.

use crate::output::{OutputEvent, OutputEventKind};
use chrono::Local;
use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicU64, Ordering},
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Handle through which all state views emit events.
///
/// Cheap to clone; all clones share the close flag and counters.
#[derive(Clone, Debug)]
pub(crate) struct OutputSink {
    inner: Arc<SinkInner>,
}

#[derive(Debug)]
struct SinkInner {
    // `None` once the sink is closed. Dropping the sender is what terminates
    // the consumer's stream.
    tx: Mutex<Option<mpsc::Sender<OutputEvent>>>,
    // Events dropped because the channel was full.
    overflow: AtomicU64,
    // Events discarded because they arrived after close.
    late: AtomicU64,
}

impl OutputSink {
    pub(crate) fn new(tx: mpsc::Sender<OutputEvent>) -> Self {
        Self {
            inner: Arc::new(SinkInner {
                tx: Mutex::new(Some(tx)),
                overflow: AtomicU64::new(0),
                late: AtomicU64::new(0),
            }),
        }
    }

    /// Non-blocking append. The timestamp is attached here, on acceptance.
    pub(crate) fn emit(&self, kind: OutputEventKind) {
        // A poisoned lock means a writer panicked mid-section; the state is
        // still coherent (plain pointer-sized fields), so keep going rather
        // than let a background flow take the process down.
        let guard = self
            .inner
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = guard.as_ref() else {
            self.inner.late.fetch_add(1, Ordering::Relaxed);
            return;
        };
        let event = OutputEvent {
            timestamp: Local::now().fixed_offset(),
            kind,
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.inner.overflow.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(dropped, "output channel full, dropping event");
            }
            // The consumer went away. Nothing useful to do with the event.
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Closes the sink. Called exactly once per test, after the final stage's
    /// run window has elapsed. Subsequent emits are discarded and counted.
    pub(crate) fn close(&self) {
        let mut guard = self
            .inner
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = guard.take() {
            let dropped = self.inner.overflow.load(Ordering::Relaxed);
            if dropped > 0 {
                // Best effort: the channel may still be full, in which case
                // the counter is the only record.
                let _ = tx.try_send(OutputEvent {
                    timestamp: Local::now().fixed_offset(),
                    kind: OutputEventKind::Log {
                        message: format!("dropped {dropped} output events due to backpressure"),
                    },
                });
            }
            debug!(
                overflow = dropped,
                late = self.inner.late.load(Ordering::Relaxed),
                "output sink closed"
            );
        }
    }

    /// Number of events discarded because they arrived after close.
    #[cfg(test)]
    pub(crate) fn late_discarded(&self) -> u64 {
        self.inner.late.load(Ordering::Relaxed)
    }
}
