// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Signed artifact downloads.

use std::sync::Arc;

use assay_core::model::mime_type_for;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tracing::debug;

use crate::error::ApiResult;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/artifacts/{hash}", get(download))
}

#[derive(Debug, Deserialize)]
struct SignedQuery {
    expires: i64,
    signature: String,
    /// Type tag of the artifact; only selects the content type.
    #[serde(default, rename = "type")]
    kind: Option<String>,
}

async fn download(
    State(state): State<Arc<AppState>>,
    Path(hash): Path<String>,
    query: Result<Query<SignedQuery>, QueryRejection>,
) -> ApiResult<impl IntoResponse> {
    let Query(query) = query?;
    state
        .store
        .verify_signature(&hash, query.expires, &query.signature)?;

    let bytes = state.store.get(&hash).await?;
    debug!(hash = %hash, size = bytes.len(), "Serving artifact");
    let content_type = mime_type_for(query.kind.as_deref().unwrap_or_default());
    Ok(([(header::CONTENT_TYPE, content_type)], bytes))
}
