// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Remote backend speaking a small JSON protocol.
//!
//! `POST {endpoint}/diagnose` with `{context, knowledge}` answers
//! `{findings}`; `POST {endpoint}/propose` with `{context, diagnostic}`
//! answers `{proposals}`. Whatever model sits behind the endpoint is the
//! service's business.

use std::time::Duration;

use assay_core::model::{Diagnostic, Finding};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{AdviceBackend, AdviceContext, Proposal};
use crate::error::{Error, Result};
use crate::knowledge::{KnowledgeBase, KnowledgeEntry};

#[derive(Serialize)]
struct DiagnoseRequest<'a> {
    context: &'a AdviceContext,
    knowledge: Vec<&'a KnowledgeEntry>,
}

#[derive(Deserialize)]
struct DiagnoseResponse {
    findings: Vec<Finding>,
}

#[derive(Serialize)]
struct ProposeRequest<'a> {
    context: &'a AdviceContext,
    diagnostic: &'a Diagnostic,
}

#[derive(Deserialize)]
struct ProposeResponse {
    proposals: Vec<Proposal>,
}

/// Backend delegating both stages to an HTTP service.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn call<B, R>(&self, path: &str, body: &B) -> Result<R>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let url = format!("{}/{}", self.endpoint, path);
        debug!(url = %url, "Calling advice backend");

        let response = self.client.post(&url).json(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Backend {
                backend: "http",
                reason: format!("{} returned {}: {}", url, status.as_u16(), text),
            });
        }

        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| Error::Backend {
            backend: "http",
            reason: format!("malformed response from {}: {}", url, e),
        })
    }
}

#[async_trait]
impl AdviceBackend for HttpBackend {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn diagnose(
        &self,
        context: &AdviceContext,
        knowledge: &KnowledgeBase,
    ) -> Result<Diagnostic> {
        let request = DiagnoseRequest {
            context,
            knowledge: knowledge.for_step(&context.step_run.step_ref),
        };
        let response: DiagnoseResponse = self.call("diagnose", &request).await?;

        Ok(Diagnostic {
            step_run_id: context.step_run.step_run_id.clone(),
            step_ref: context.step_run.step_ref.clone(),
            schema_version: context.step.version,
            findings: response.findings,
        })
    }

    async fn propose(
        &self,
        context: &AdviceContext,
        diagnostic: &Diagnostic,
    ) -> Result<Vec<Proposal>> {
        let request = ProposeRequest {
            context,
            diagnostic,
        };
        let response: ProposeResponse = self.call("propose", &request).await?;
        Ok(response.proposals)
    }
}
