// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Assay Advice - evidence-backed patches for finished step runs
//!
//! The pipeline runs two stages against one step run and never lets a
//! model decide how risky a change is:
//!
//! ```text
//! ┌───────────────┐  metrics +   ┌──────────────┐  findings  ┌──────────────┐
//! │ StepRun       │─ knowledge ─►│ Data Agent   │──────────► │ Action Agent │
//! │ (ledger)      │              │ (diagnose)   │            │ (propose)    │
//! └───────────────┘              └──────────────┘            └──────┬───────┘
//!                                                                   │ patches
//!                 ┌──────────────┐   tier    ┌──────────────┐       │
//!                 │ Risk policy  │◄──────────│   Advice     │◄──────┘
//!                 └──────────────┘           │  (proposed)  │
//!                                            └──────┬───────┘
//!                             dry-run against the current schema
//!                                                   ▼
//!                         apply: low = auto, high = explicit confirm
//!                                                   ▼
//!                              new Task ─► new StepRun (parent = advised run)
//! ```
//!
//! # Backends
//!
//! | Backend | Selected by | Behavior |
//! |---------|-------------|----------|
//! | [`RuleBackend`] | `BackendConfig::Rules` | single-cell analyzers, one per step |
//! | [`HttpBackend`] | `BackendConfig::Http` | posts diagnose/propose requests to a service |
//!
//! # Rollback
//!
//! Rolling back creates a further task with the pre-patch parameters. The
//! applied step run stays in the ledger.

/// Diagnose/propose backends and their selection.
pub mod backend;

/// Error types.
pub mod error;

/// Healthy metric ranges and citations.
pub mod knowledge;

/// Generate, validate, apply and roll back advice.
pub mod pipeline;

/// Risk tier policy table.
pub mod policy;

/// Agent tool surface.
pub mod tools;

/// Dry-run patch validation.
pub mod validator;

pub use backend::{AdviceBackend, AdviceContext, BackendConfig, HttpBackend, Proposal, RuleBackend};
pub use error::{Error, Result};
pub use knowledge::KnowledgeBase;
pub use pipeline::{AdviceConfig, AdvicePipeline, ApplyReceipt, ApplyRequest};
pub use policy::{RiskAssessment, RiskPolicy};
pub use tools::{AdviceTools, PatchOutcome, PlotSpec, ThresholdSuggestion, suggest_threshold};
pub use validator::DryRunReport;
