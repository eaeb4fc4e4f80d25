// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Built-in rule backend for the single-cell pipeline.

use assay_core::model::{
    AdviceType, Diagnostic, Finding, HealthyRange, Metrics, ParamDelta, Params, Patch, Severity,
};
use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use super::{AdviceBackend, AdviceContext, Proposal};
use crate::error::Result;
use crate::knowledge::KnowledgeBase;

/// Silhouette below which the legacy louvain method is worth replacing.
const LOUVAIN_SILHOUETTE_FLOOR: f64 = 0.4;

/// Deterministic analyzers for `qc`, `hvg`, `pca`, `umap` and `clustering`.
#[derive(Debug, Clone, Default)]
pub struct RuleBackend;

impl RuleBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AdviceBackend for RuleBackend {
    fn name(&self) -> &'static str {
        "rules"
    }

    async fn diagnose(
        &self,
        context: &AdviceContext,
        knowledge: &KnowledgeBase,
    ) -> Result<Diagnostic> {
        let run = &context.step_run;
        let mut findings = Vec::new();

        for entry in knowledge.for_step(&run.step_ref) {
            let Some(observed) = metric(&run.metrics, &entry.metric) else {
                continue;
            };
            if !entry.range.contains(observed) {
                findings.push(Finding {
                    metric: entry.metric.clone(),
                    observed,
                    expected: entry.range,
                    severity: entry.severity,
                    message: out_of_range(&entry.metric, observed, &entry.range),
                    citation: Some(entry.citation.clone()),
                });
            }
        }

        findings.extend(legacy_method_findings(context, knowledge, &findings));

        debug!(
            step_run_id = %run.step_run_id,
            findings = findings.len(),
            "Rule diagnosis complete"
        );

        Ok(Diagnostic {
            step_run_id: run.step_run_id.clone(),
            step_ref: run.step_ref.clone(),
            schema_version: context.step.version,
            findings,
        })
    }

    async fn propose(
        &self,
        context: &AdviceContext,
        diagnostic: &Diagnostic,
    ) -> Result<Vec<Proposal>> {
        let params = &context.step_run.params;
        let mut proposals = Vec::new();

        for finding in &diagnostic.findings {
            let candidates = match diagnostic.step_ref.as_str() {
                "qc" => qc(finding, params),
                "hvg" => hvg(finding, params),
                "pca" => pca(finding, params),
                "umap" => umap(finding, params),
                "clustering" => clustering(finding, params),
                _ => Vec::new(),
            };

            for (advice_type, title, change, set) in candidates {
                let set: Params = set
                    .into_iter()
                    .filter(|(key, value)| params.get(key) != Some(value))
                    .collect();
                if set.is_empty() {
                    continue;
                }

                let mut rationale = format!("{}. {}", finding.message, change);
                if let Some(citation) = &finding.citation {
                    rationale.push_str(&format!(" See {}.", citation));
                }

                proposals.push(Proposal {
                    advice_type,
                    title: title.to_string(),
                    rationale,
                    patch: Patch::ParamDelta(ParamDelta {
                        set,
                        unset: Vec::new(),
                    }),
                    metrics: vec![finding.metric.clone()],
                });
            }
        }

        Ok(proposals)
    }
}

/// `(type, title, what the change does, parameters to set)`
type Candidate = (AdviceType, &'static str, String, Params);

fn metric(metrics: &Metrics, key: &str) -> Option<f64> {
    metrics.get(key).and_then(Value::as_f64)
}

fn param_f64(params: &Params, key: &str, default: f64) -> f64 {
    params.get(key).and_then(Value::as_f64).unwrap_or(default)
}

fn param_str<'a>(params: &'a Params, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str)
}

fn set(values: Value) -> Params {
    match values {
        Value::Object(map) => map.into_iter().collect(),
        _ => Params::new(),
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

fn out_of_range(metric: &str, observed: f64, range: &HealthyRange) -> String {
    match (range.min, range.max) {
        (Some(min), _) if observed < min => {
            format!("{} = {} is below the healthy minimum {}", metric, observed, min)
        }
        (_, Some(max)) if observed > max => {
            format!("{} = {} is above the healthy maximum {}", metric, observed, max)
        }
        _ => format!("{} = {} is outside the healthy range", metric, observed),
    }
}

/// Info findings for legacy methods whose metrics look acceptable.
fn legacy_method_findings(
    context: &AdviceContext,
    knowledge: &KnowledgeBase,
    existing: &[Finding],
) -> Vec<Finding> {
    let run = &context.step_run;
    let already = |metric: &str| existing.iter().any(|f| f.metric == metric);
    let citation = |metric: &str| {
        knowledge
            .lookup(&run.step_ref, metric)
            .map(|e| e.citation.clone())
    };

    match run.step_ref.as_str() {
        "hvg" if param_str(&run.params, "method") == Some("cell_ranger") => {
            match metric(&run.metrics, "n_hvgs") {
                Some(n) if n > 0.0 && !already("n_hvgs") => vec![Finding {
                    metric: "n_hvgs".into(),
                    observed: n,
                    expected: HealthyRange::between(1000.0, 5000.0),
                    severity: Severity::Info,
                    message: format!(
                        "n_hvgs = {} was selected with the legacy cell_ranger method",
                        n
                    ),
                    citation: citation("n_hvgs"),
                }],
                _ => Vec::new(),
            }
        }
        "clustering" if param_str(&run.params, "method") == Some("louvain") => {
            match metric(&run.metrics, "silhouette_score") {
                Some(s) if s < LOUVAIN_SILHOUETTE_FLOOR && !already("silhouette_score") => {
                    vec![Finding {
                        metric: "silhouette_score".into(),
                        observed: s,
                        expected: HealthyRange::at_least(LOUVAIN_SILHOUETTE_FLOOR),
                        severity: Severity::Info,
                        message: format!(
                            "silhouette_score = {} is marginal for the legacy louvain method",
                            s
                        ),
                        citation: citation("silhouette_score"),
                    }]
                }
                _ => Vec::new(),
            }
        }
        _ => Vec::new(),
    }
}

fn qc(finding: &Finding, params: &Params) -> Vec<Candidate> {
    let observed = finding.observed;
    match finding.metric.as_str() {
        "high_mito" => {
            let target = round3((observed * 0.8).max(0.05));
            vec![(
                AdviceType::ParameterOptimization,
                "Tighten the mitochondrial fraction filter",
                format!("Setting max_mito to {} removes more damaged cells.", target),
                set(json!({"max_mito": target})),
            )]
        }
        "doublet_rate" => vec![(
            AdviceType::QualityImprovement,
            "Enable doublet filtering",
            "Enabling the doublet filter at threshold 0.8 removes likely multiplets.".to_string(),
            set(json!({"enable_doublet_filter": true, "doublet_threshold": 0.8})),
        )],
        "n_cells_pass_filter" => {
            let min_genes = (param_f64(params, "min_genes", 200.0) - 50.0).max(100.0) as i64;
            let max_genes = param_f64(params, "max_genes", 5000.0) as i64 + 1000;
            vec![(
                AdviceType::ParameterOptimization,
                "Relax the gene count filters",
                format!(
                    "Widening the gene window to [{}, {}] retains more cells \
                         for downstream analysis.",
                    min_genes, max_genes
                ),
                set(json!({"min_genes": min_genes, "max_genes": max_genes})),
            )]
        }
        _ => Vec::new(),
    }
}

fn hvg(finding: &Finding, params: &Params) -> Vec<Candidate> {
    let n = finding.observed;
    match finding.severity {
        Severity::Info => vec![(
            AdviceType::MethodSuggestion,
            "Switch HVG selection to seurat_v3",
            "seurat_v3 selects variable genes more robustly on most datasets.".to_string(),
            set(json!({"method": "seurat_v3"})),
        )],
        _ if n < 1000.0 => {
            let target = (n * 2.0).clamp(1000.0, 3000.0) as i64;
            let mut values = set(json!({"n_top_genes": target}));
            if param_str(params, "method") != Some("seurat_v3") {
                values.insert("method".into(), json!("seurat_v3"));
            }
            vec![(
                AdviceType::ParameterOptimization,
                "Select more highly variable genes",
                format!("Raising n_top_genes to {} strengthens PCA and clustering.", target),
                values,
            )]
        }
        _ if n > 5000.0 => vec![(
            AdviceType::ParameterOptimization,
            "Select fewer highly variable genes",
            "Lowering n_top_genes to 2000 reduces noise from weakly variable genes.".to_string(),
            set(json!({"n_top_genes": 2000})),
        )],
        _ => Vec::new(),
    }
}

fn pca(finding: &Finding, params: &Params) -> Vec<Candidate> {
    if finding.metric != "explained_variance_ratio_sum" {
        return Vec::new();
    }
    let n = param_f64(params, "n_components", 30.0) as i64;
    if finding.observed < 0.6 {
        let target = (n + 10).min(50);
        vec![(
            AdviceType::ParameterOptimization,
            "Increase the number of principal components",
            format!("Using {} components captures more of the biological signal.", target),
            set(json!({"n_components": target})),
        )]
    } else if n > 40 {
        let target = (n * 7 / 10).max(20);
        vec![(
            AdviceType::ParameterOptimization,
            "Reduce the number of principal components",
            format!("{} components already explain most variance; {} lower the cost.", n, target),
            set(json!({"n_components": target})),
        )]
    } else {
        Vec::new()
    }
}

fn umap(finding: &Finding, params: &Params) -> Vec<Candidate> {
    match finding.metric.as_str() {
        "global_structure_preservation" => {
            let n = param_f64(params, "n_neighbors", 15.0) as i64;
            let target = (n + 10).clamp(20, 50);
            vec![(
                AdviceType::ParameterOptimization,
                "Increase n_neighbors to preserve global structure",
                format!("n_neighbors = {} weighs the global layout more.", target),
                set(json!({"n_neighbors": target})),
            )]
        }
        "local_structure_preservation" => {
            let target = round3((param_f64(params, "min_dist", 0.5) * 0.5).max(0.05));
            vec![(
                AdviceType::ParameterOptimization,
                "Decrease min_dist to preserve local structure",
                format!("min_dist = {} packs neighbouring cells tighter.", target),
                set(json!({"min_dist": target})),
            )]
        }
        _ => Vec::new(),
    }
}

fn clustering(finding: &Finding, params: &Params) -> Vec<Candidate> {
    let resolution = param_f64(params, "resolution", 0.8);
    let louvain = param_str(params, "method") == Some("louvain");
    let leiden = || {
        (
            AdviceType::MethodSuggestion,
            "Switch clustering to leiden",
            "Leiden guarantees well-connected communities where louvain may not.".to_string(),
            set(json!({"method": "leiden"})),
        )
    };

    match finding.metric.as_str() {
        "silhouette_score" if finding.severity == Severity::Info => {
            if louvain { vec![leiden()] } else { Vec::new() }
        }
        "silhouette_score" => {
            let target = round2(resolution + 0.2).min(1.5);
            let mut out = vec![(
                AdviceType::ParameterOptimization,
                "Increase clustering resolution",
                format!("resolution = {} separates poorly split clusters.", target),
                set(json!({"resolution": target})),
            )];
            if louvain {
                out.push(leiden());
            }
            out
        }
        "n_clusters" if resolution >= 0.8 => {
            let target = round2(resolution * 0.8).max(0.4);
            vec![(
                AdviceType::ParameterOptimization,
                "Decrease clustering resolution",
                format!("resolution = {} merges over-split clusters.", target),
                set(json!({"resolution": target})),
            )]
        }
        _ => Vec::new(),
    }
}
