// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Healthy metric ranges with literature citations.
//!
//! The Data Agent looks metrics up here; a value outside its range becomes
//! a finding with the entry's severity and citation.

use std::collections::BTreeMap;

use assay_core::model::{HealthyRange, Severity};
use serde::{Deserialize, Serialize};

/// Expected range of one metric of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub step_ref: String,
    pub metric: String,
    pub range: HealthyRange,
    /// Severity of a value outside `range`.
    pub severity: Severity,
    pub citation: String,
}

/// Lookup table keyed by `(step_ref, metric)`.
#[derive(Debug, Clone, Default)]
pub struct KnowledgeBase {
    entries: BTreeMap<(String, String), KnowledgeEntry>,
}

const LUECKEN_2019: &str = "Luecken & Theis, Mol Syst Biol 15:e8746 (2019)";
const HEUMOS_2023: &str = "Heumos et al., Nat Rev Genet 24:550-572 (2023)";
const MCGINNIS_2019: &str = "McGinnis et al., Cell Syst 8:329-337 (2019)";
const TRAAG_2019: &str = "Traag et al., Sci Rep 9:5233 (2019)";
const BECHT_2019: &str = "Becht et al., Nat Biotechnol 37:38-44 (2019)";

impl KnowledgeBase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an entry (builder style).
    pub fn with(
        mut self,
        step_ref: &str,
        metric: &str,
        range: HealthyRange,
        severity: Severity,
        citation: &str,
    ) -> Self {
        self.entries.insert(
            (step_ref.to_string(), metric.to_string()),
            KnowledgeEntry {
                step_ref: step_ref.to_string(),
                metric: metric.to_string(),
                range,
                severity,
                citation: citation.to_string(),
            },
        );
        self
    }

    /// Ranges used by the single-cell analyzers.
    pub fn single_cell() -> Self {
        Self::new()
            .with("qc", "high_mito", HealthyRange::at_most(0.15), Severity::Warning, LUECKEN_2019)
            .with(
                "qc",
                "doublet_rate",
                HealthyRange::at_most(0.05),
                Severity::Warning,
                MCGINNIS_2019,
            )
            .with(
                "qc",
                "n_cells_pass_filter",
                HealthyRange::at_least(1000.0),
                Severity::Critical,
                HEUMOS_2023,
            )
            .with(
                "hvg",
                "n_hvgs",
                HealthyRange::between(1000.0, 5000.0),
                Severity::Warning,
                LUECKEN_2019,
            )
            .with(
                "pca",
                "explained_variance_ratio_sum",
                HealthyRange::between(0.6, 0.85),
                Severity::Warning,
                HEUMOS_2023,
            )
            .with(
                "umap",
                "global_structure_preservation",
                HealthyRange::at_least(0.5),
                Severity::Warning,
                BECHT_2019,
            )
            .with(
                "umap",
                "local_structure_preservation",
                HealthyRange::at_least(0.6),
                Severity::Info,
                BECHT_2019,
            )
            .with(
                "clustering",
                "silhouette_score",
                HealthyRange::at_least(0.35),
                Severity::Warning,
                TRAAG_2019,
            )
            .with(
                "clustering",
                "n_clusters",
                HealthyRange::at_most(20.0),
                Severity::Info,
                TRAAG_2019,
            )
    }

    pub fn lookup(&self, step_ref: &str, metric: &str) -> Option<&KnowledgeEntry> {
        self.entries
            .get(&(step_ref.to_string(), metric.to_string()))
    }

    /// Every entry of a step, ordered by metric.
    pub fn for_step(&self, step_ref: &str) -> Vec<&KnowledgeEntry> {
        self.entries
            .values()
            .filter(|e| e.step_ref == step_ref)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
