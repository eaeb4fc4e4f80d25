// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP routes, all mounted under `/api/v1`.

pub mod advice;
pub mod artifacts;
pub mod step_runs;
pub mod steps;
pub mod tasks;

use std::sync::Arc;

use axum::Router;

use crate::state::AppState;

pub fn api() -> Router<Arc<AppState>> {
    Router::new()
        .merge(steps::router())
        .merge(tasks::router())
        .merge(step_runs::router())
        .merge(advice::router())
        .merge(artifacts::router())
}
