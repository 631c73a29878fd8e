// Copyright (c) The testrig Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Time measurement for test execution.

mod stopwatch;

pub(crate) use stopwatch::stopwatch;
