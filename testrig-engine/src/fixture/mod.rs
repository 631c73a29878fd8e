// Copyright (c) The testrig Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Fixtures: named, nested environments amortized across tests.
//!
//! Fixtures form a forest through parent names. The path from a root to the
//! leaf fixture a test names is the test's fixture chain; the engine keeps a
//! stack of live (set-up) fixtures between tests and reconciles it against
//! the next test's chain instead of tearing the world down every time. See
//! [`stack`] for the reconciliation rules.

mod stack;

pub use stack::FixtureManager;

use crate::{
    context::StageContext,
    errors::{BoxError, FixtureGraphError},
    state::{FixtureState, FixtureTestState, OpaqueValue},
};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};

/// Static description of a fixture: its identity, position in the forest,
/// and declared metadata. Registering and enumerating a fixture round-trips
/// this value unchanged.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct FixtureDescriptor {
    /// Unique name within the set.
    pub name: String,

    /// Human-readable description.
    #[serde(default)]
    pub description: String,

    /// Parent fixture name; `None` for a root.
    #[serde(default)]
    pub parent: Option<String>,

    /// Owner contacts.
    #[serde(default)]
    pub contacts: Vec<String>,

    /// Data files the fixture may resolve.
    #[serde(default)]
    pub data: Vec<String>,

    /// Declared service dependencies.
    #[serde(default)]
    pub service_deps: Vec<String>,

    /// Runtime variables the fixture may read.
    #[serde(default)]
    pub vars: Vec<String>,
}

impl FixtureDescriptor {
    /// A descriptor with just a name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Per-operation timeout budgets. Budgets apply to one operation of one
/// fixture; they are never summed across a chain.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FixtureTimeouts {
    /// Budget for `set_up`.
    pub set_up: Duration,
    /// Budget for `tear_down`.
    pub tear_down: Duration,
    /// Budget for `reset`.
    pub reset: Duration,
    /// Budget for `pre_test`.
    pub pre_test: Duration,
    /// Budget for `post_test`.
    pub post_test: Duration,
}

impl Default for FixtureTimeouts {
    fn default() -> Self {
        Self {
            set_up: Duration::from_secs(300),
            tear_down: Duration::from_secs(300),
            reset: Duration::from_secs(30),
            pre_test: Duration::from_secs(60),
            post_test: Duration::from_secs(60),
        }
    }
}

/// A reusable test environment with nested setup.
///
/// Lifecycle per fixture: `set_up` once, then per test an optional `reset`
/// (between tests), `pre_test` and `post_test` (around each test), and
/// finally exactly one `tear_down` for every successful `set_up`. Ordering
/// across a chain is strict: `set_up`/`reset`/`pre_test` run root to leaf,
/// `tear_down`/`post_test` leaf to root.
pub trait Fixture: Send + Sync + 'static {
    /// The fixture's static description.
    fn descriptor(&self) -> &FixtureDescriptor;

    /// Per-operation budgets. The defaults are generous; heavy fixtures
    /// should declare their own.
    fn timeouts(&self) -> FixtureTimeouts {
        FixtureTimeouts::default()
    }

    /// Establishes the environment. The returned opaque value is visible to
    /// child fixtures via
    /// [`FixtureState::parent_value`](crate::state::FixtureState::parent_value).
    /// Record errors on `state` to mark the set-up failed.
    fn set_up<'a>(
        &'a self,
        ctx: &'a StageContext,
        state: &'a FixtureState,
    ) -> BoxFuture<'a, OpaqueValue>;

    /// Lightweight restoration between consecutive tests. An `Err` does not
    /// fail any test; it makes the engine tear this fixture (and everything
    /// above it) down and set it up afresh before the next test.
    fn reset<'a>(&'a self, _ctx: &'a StageContext) -> BoxFuture<'a, Result<(), BoxError>> {
        Box::pin(futures::future::ready(Ok(())))
    }

    /// Per-test hook, before the test function.
    fn pre_test<'a>(
        &'a self,
        _ctx: &'a StageContext,
        _state: &'a FixtureTestState,
    ) -> BoxFuture<'a, ()> {
        Box::pin(futures::future::ready(()))
    }

    /// Per-test hook, after the test function.
    fn post_test<'a>(
        &'a self,
        _ctx: &'a StageContext,
        _state: &'a FixtureTestState,
    ) -> BoxFuture<'a, ()> {
        Box::pin(futures::future::ready(()))
    }

    /// Releases the environment. Paired with a successful `set_up`.
    fn tear_down<'a>(
        &'a self,
        ctx: &'a StageContext,
        state: &'a FixtureState,
    ) -> BoxFuture<'a, ()>;
}

/// The registration surface for fixtures: a name-indexed forest.
#[derive(Default)]
pub struct FixtureSet {
    fixtures: BTreeMap<String, Arc<dyn Fixture>>,
}

impl FixtureSet {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fixture under its descriptor name.
    pub fn register(&mut self, fixture: Arc<dyn Fixture>) -> Result<(), FixtureGraphError> {
        let name = fixture.descriptor().name.clone();
        if self.fixtures.contains_key(&name) {
            return Err(FixtureGraphError::Duplicate(name));
        }
        self.fixtures.insert(name, fixture);
        Ok(())
    }

    /// Looks up a fixture by name.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Fixture>> {
        self.fixtures.get(name)
    }

    /// Enumerates registered descriptors in name order.
    pub fn descriptors(&self) -> impl Iterator<Item = &FixtureDescriptor> {
        self.fixtures.values().map(|f| f.descriptor())
    }

    /// Resolves the chain from a root to `leaf`, root first.
    ///
    /// Validates the forest along the way: every parent must be registered
    /// and parent links must not loop.
    pub fn chain(&self, leaf: &str) -> Result<Vec<Arc<dyn Fixture>>, FixtureGraphError> {
        let mut rev = Vec::new();
        let mut current = self
            .fixtures
            .get(leaf)
            .ok_or_else(|| FixtureGraphError::Unknown(leaf.to_owned()))?;
        loop {
            rev.push(current.clone());
            // A well-formed forest's chains are at most as long as the set.
            if rev.len() > self.fixtures.len() {
                return Err(FixtureGraphError::ParentCycle(leaf.to_owned()));
            }
            let descriptor = current.descriptor();
            match &descriptor.parent {
                None => break,
                Some(parent) => {
                    current = self.fixtures.get(parent).ok_or_else(|| {
                        FixtureGraphError::UnknownParent {
                            name: descriptor.name.clone(),
                            parent: parent.clone(),
                        }
                    })?;
                }
            }
        }
        rev.reverse();
        Ok(rev)
    }
}

impl fmt::Debug for FixtureSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.fixtures.keys()).finish()
    }
}
