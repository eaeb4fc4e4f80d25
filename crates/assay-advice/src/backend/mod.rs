// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Diagnose/propose backends.
//!
//! A backend implements both agent stages. The Data Agent stage
//! ([`AdviceBackend::diagnose`]) only observes; the Action Agent stage
//! ([`AdviceBackend::propose`]) turns findings into patches. Risk tiers are
//! not part of a proposal: the pipeline assigns them from the
//! [`RiskPolicy`](crate::policy::RiskPolicy).

mod http;
mod rules;

pub use http::HttpBackend;
pub use rules::RuleBackend;

use std::sync::Arc;
use std::time::Duration;

use assay_core::model::{AdviceType, Diagnostic, Patch, StepDefinition, StepRun};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::knowledge::KnowledgeBase;

/// What both stages see: the advised run and the step's current definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdviceContext {
    pub step_run: StepRun,
    pub step: StepDefinition,
}

/// Candidate patch from the Action Agent stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub advice_type: AdviceType,
    pub title: String,
    pub rationale: String,
    pub patch: Patch,
    /// Metrics of the findings this proposal addresses.
    #[serde(default)]
    pub metrics: Vec<String>,
}

/// Interchangeable diagnose/propose implementation.
#[async_trait]
pub trait AdviceBackend: Send + Sync {
    /// Backend name used in logs and audit entries.
    fn name(&self) -> &'static str;

    /// Observe the run's metrics. Must not produce patches.
    async fn diagnose(
        &self,
        context: &AdviceContext,
        knowledge: &KnowledgeBase,
    ) -> Result<Diagnostic>;

    /// Map actionable findings to candidate patches.
    async fn propose(
        &self,
        context: &AdviceContext,
        diagnostic: &Diagnostic,
    ) -> Result<Vec<Proposal>>;
}

/// Which backend the pipeline uses.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum BackendConfig {
    /// Built-in single-cell rules.
    #[default]
    Rules,
    /// Remote service speaking the diagnose/propose JSON protocol.
    Http {
        endpoint: String,
        timeout: Duration,
    },
}

impl BackendConfig {
    /// Parse a backend name as used in configuration ("rules" or "http").
    pub fn from_name(name: &str, endpoint: Option<&str>, timeout: Duration) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "rules" => Ok(Self::Rules),
            "http" => {
                let endpoint = endpoint
                    .filter(|e| !e.trim().is_empty())
                    .ok_or_else(|| Error::Config("http backend requires an endpoint".to_string()))?;
                Ok(Self::Http {
                    endpoint: endpoint.to_string(),
                    timeout,
                })
            }
            other => Err(Error::Config(format!("unknown advice backend '{}'", other))),
        }
    }
}

/// Instantiate the configured backend.
pub fn from_config(config: &BackendConfig) -> Result<Arc<dyn AdviceBackend>> {
    Ok(match config {
        BackendConfig::Rules => Arc::new(RuleBackend::new()),
        BackendConfig::Http { endpoint, timeout } => {
            Arc::new(HttpBackend::new(endpoint.clone(), *timeout)?)
        }
    })
}
