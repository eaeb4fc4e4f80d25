// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Built-in step catalog for the single-cell analysis pipeline.

use chrono::Utc;

use super::step::{ParamKind, ParamSchema, ParamSpec, StepDefinition};

/// Factory for the built-in step definitions.
pub struct StepCatalog;

impl StepCatalog {
    /// Step references of the single-cell pipeline, in execution order.
    pub const SINGLE_CELL: [&'static str; 5] = ["qc", "hvg", "pca", "umap", "clustering"];

    /// Single-cell definitions sharing one runner program.
    ///
    /// The runner receives the step reference as its first argument.
    pub fn single_cell(runner_command: &str, code_identity: &str) -> Vec<StepDefinition> {
        Self::SINGLE_CELL
            .iter()
            .map(|step_ref| StepDefinition {
                step_ref: step_ref.to_string(),
                version: 0,
                command: vec![runner_command.to_string(), step_ref.to_string()],
                code_identity: code_identity.to_string(),
                allow_code_patches: false,
                metrics: declared_metrics(step_ref),
                schema: schema_for(step_ref),
                registered_at: Utc::now(),
            })
            .collect()
    }
}

fn declared_metrics(step_ref: &str) -> Vec<String> {
    let keys: &[&str] = match step_ref {
        "qc" => &["n_cells", "n_cells_pass_filter", "high_mito", "doublet_rate"],
        "hvg" => &["n_hvgs", "variance_ratio"],
        "pca" => &["explained_variance_ratio_sum"],
        "umap" => &[
            "global_structure_preservation",
            "local_structure_preservation",
        ],
        "clustering" => &["n_clusters", "silhouette_score"],
        _ => &[],
    };
    keys.iter().map(|k| k.to_string()).collect()
}

fn schema_for(step_ref: &str) -> ParamSchema {
    match step_ref {
        "qc" => ParamSchema::new()
            .with(
                "min_genes",
                ParamSpec::new(ParamKind::Integer)
                    .required()
                    .min(0.0)
                    .default_value(200)
                    .destructive(),
            )
            .with(
                "max_genes",
                ParamSpec::new(ParamKind::Integer)
                    .min(0.0)
                    .default_value(5000)
                    .destructive(),
            )
            .with(
                "max_mito",
                ParamSpec::new(ParamKind::Number)
                    .min(0.0)
                    .max(1.0)
                    .default_value(0.1)
                    .destructive(),
            )
            .with(
                "enable_doublet_filter",
                ParamSpec::new(ParamKind::Boolean)
                    .default_value(false)
                    .destructive(),
            )
            .with(
                "doublet_threshold",
                ParamSpec::new(ParamKind::Number)
                    .min(0.0)
                    .max(1.0)
                    .destructive(),
            ),
        "hvg" => ParamSchema::new()
            .with(
                "method",
                ParamSpec::new(ParamKind::Enum {
                    values: vec![
                        "seurat".into(),
                        "seurat_v3".into(),
                        "cell_ranger".into(),
                    ],
                })
                .default_value("seurat_v3"),
            )
            .with(
                "n_top_genes",
                ParamSpec::new(ParamKind::Integer)
                    .min(100.0)
                    .max(20000.0)
                    .default_value(2000),
            ),
        "pca" => ParamSchema::new().with(
            "n_components",
            ParamSpec::new(ParamKind::Integer)
                .min(2.0)
                .max(200.0)
                .default_value(30),
        ),
        "umap" => ParamSchema::new()
            .with(
                "n_neighbors",
                ParamSpec::new(ParamKind::Integer)
                    .min(2.0)
                    .max(200.0)
                    .default_value(15),
            )
            .with(
                "min_dist",
                ParamSpec::new(ParamKind::Number)
                    .min(0.0)
                    .max(1.0)
                    .default_value(0.5),
            ),
        "clustering" => ParamSchema::new()
            .with(
                "method",
                ParamSpec::new(ParamKind::Enum {
                    values: vec!["leiden".into(), "louvain".into()],
                })
                .default_value("leiden"),
            )
            .with(
                "resolution",
                ParamSpec::new(ParamKind::Number)
                    .min(0.05)
                    .max(5.0)
                    .default_value(0.8),
            ),
        _ => ParamSchema::new(),
    }
}
