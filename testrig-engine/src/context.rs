// Copyright (c) The testrig Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cancellation scopes handed to user code.
//!
//! Every stage runs user code under a [`StageContext`]: a cancellation token
//! scoped to the stage plus the stage's deadline. Cancelling an outer context
//! cancels every context derived from it; the deadline is per-stage and is
//! never inherited upward. Compliance is voluntary -- the engine signals
//! through the context and then waits out the stage's drain window.

use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// The cancellation scope for one stage of a test.
///
/// User functions receive a `StageContext` and are expected to observe
/// [`cancelled`](Self::cancelled) (or poll [`is_cancelled`](Self::is_cancelled))
/// and return within the stage's exit grace once the deadline passes.
#[derive(Clone, Debug)]
pub struct StageContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl StageContext {
    /// Creates a root context with no deadline.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Wraps an existing token into a context with no deadline. Used for
    /// precondition-scoped contexts, which outlive any single stage.
    pub(crate) fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Derives a child scope. Cancellation flows parent to child; the child's
    /// deadline is the earlier of the parent's deadline and `now + timeout`.
    pub(crate) fn child(&self, timeout: Option<Duration>) -> Self {
        let deadline = match timeout {
            // checked_add: a very large timeout means "no sooner than the
            // parent deadline", not a panic.
            Some(timeout) => match Instant::now().checked_add(timeout) {
                Some(own) => Some(self.deadline.map_or(own, |parent| parent.min(own))),
                None => self.deadline,
            },
            None => self.deadline,
        };
        Self {
            token: self.token.child_token(),
            deadline,
        }
    }

    /// The deadline of this scope, if one is set.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// True once the scope has been cancelled or its deadline has passed.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Resolves when the scope is cancelled or the deadline passes, whichever
    /// comes first. Never resolves for an undated, uncancelled scope.
    pub async fn cancelled(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }

    /// Cancels this scope and every scope derived from it.
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

impl Default for StageContext {
    fn default() -> Self {
        Self::new()
    }
}
