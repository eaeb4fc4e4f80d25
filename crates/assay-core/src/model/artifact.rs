// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Content-addressed artifact references.

use serde::{Deserialize, Serialize};

/// Reference to a stored blob, linked to the step run that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Hex-encoded SHA-256 of the content.
    pub hash: String,
    /// Size in bytes.
    pub size: u64,
    /// Type tag declared by the runner ("h5ad", "png", ...).
    #[serde(rename = "type")]
    pub kind: String,
    /// Original file name inside the run directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ArtifactRef {
    pub fn mime_type(&self) -> &'static str {
        mime_type_for(&self.kind)
    }
}

/// MIME type for a runner type tag.
pub fn mime_type_for(kind: &str) -> &'static str {
    match kind.to_ascii_lowercase().as_str() {
        "h5ad" => "application/x-hdf5",
        "csv" => "text/csv",
        "png" => "image/png",
        "svg" => "image/svg+xml",
        "pdf" => "application/pdf",
        "json" => "application/json",
        "html" => "text/html",
        _ => "application/octet-stream",
    }
}
