// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker runners.
//!
//! - [`ProcessRunner`]: one child OS process per task
//! - [`MockRunner`]: scripted workers for tests

pub mod mock;
pub mod process;
pub mod traits;

pub use mock::{MockRunner, MockScript};
pub use process::ProcessRunner;
pub use traits::*;
