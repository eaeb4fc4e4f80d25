// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Advice pipeline integration tests.

mod common;

use assay_advice::{AdviceConfig, ApplyRequest, Error, PatchOutcome, PlotSpec, suggest_threshold};
use assay_core::model::{
    ApplicationState, FailureKind, ParamDelta, ParamKind, ParamSpec, Patch, RiskTier, StepCatalog,
    TaskDraft, TaskFailure, TaskOrigin, TaskOutcome, TaskStatus, ValidationState,
};
use assay_core::{ArtifactStore, CoreError, LifecycleHook, Persistence};
use common::*;
use serde_json::json;

fn confirm(actor: &str) -> ApplyRequest {
    ApplyRequest {
        confirm: true,
        actor: actor.to_string(),
    }
}

/// qc run whose mitochondrial fraction is out of range.
async fn high_mito_run(h: &Harness) -> assay_core::model::StepRun {
    h.run(
        TaskDraft::new("qc", params(json!({"min_genes": 200}))),
        json!({
            "n_cells": 5000,
            "n_cells_pass_filter": 4200,
            "high_mito": 0.22,
            "doublet_rate": 0.02
        }),
    )
    .await
}

/// clustering run that only needs a bounded resolution nudge.
async fn low_silhouette_run(h: &Harness) -> assay_core::model::StepRun {
    h.run(
        TaskDraft::new("clustering", params(json!({"method": "leiden", "resolution": 0.8}))),
        json!({"silhouette_score": 0.2, "n_clusters": 8}),
    )
    .await
}

// ============================================================================
// Generation
// ============================================================================

#[tokio::test]
async fn test_generate_stores_validated_advice_with_evidence() {
    let h = harness().await;
    let run = high_mito_run(&h).await;
    let pipeline = h.manual_pipeline();

    let advice = pipeline.generate(&run.step_run_id, "dana").await.unwrap();
    assert_eq!(advice.len(), 1);
    let advice = &advice[0];

    assert_eq!(advice.step_run_id, run.step_run_id);
    assert_eq!(advice.application_state, ApplicationState::Proposed);
    assert_eq!(advice.risk_tier, RiskTier::High);
    assert_eq!(advice.validation.state, ValidationState::DryRunPassed);
    assert_eq!(advice.schema_version, 1);
    assert_eq!(advice.pre_patch_params, run.params);
    assert_eq!(advice.diagnostic.len(), 1);
    assert_eq!(advice.diagnostic[0].metric, "high_mito");
    assert_eq!(advice.evidence.metric_ids, vec!["high_mito"]);
    assert!(!advice.evidence.citations.is_empty());
    assert_eq!(
        advice.patch,
        Patch::ParamDelta(ParamDelta {
            set: params(json!({"max_mito": 0.176})),
            unset: vec![],
        })
    );

    assert_eq!(advice.evidence.plot_artifacts.len(), 1);
    assert!(h.store.exists(&advice.evidence.plot_artifacts[0]).await.unwrap());

    let stored = pipeline.get(&advice.advice_id).await.unwrap();
    assert_eq!(stored.patch, advice.patch);
    assert_eq!(stored.validation.state, ValidationState::DryRunPassed);
    assert_eq!(pipeline.list(&run.step_run_id).await.unwrap().len(), 1);

    let actions: Vec<String> = pipeline
        .audit_log(&advice.advice_id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.action)
        .collect();
    assert_eq!(actions, vec!["advice.generate", "advice.validate"]);
}

#[tokio::test]
async fn test_healthy_run_produces_no_advice() {
    let h = harness().await;
    let run = h
        .run(
            TaskDraft::new("qc", params(json!({"min_genes": 200}))),
            json!({"n_cells_pass_filter": 4200, "high_mito": 0.05, "doublet_rate": 0.01}),
        )
        .await;

    let advice = h.manual_pipeline().generate(&run.step_run_id, "dana").await.unwrap();
    assert!(advice.is_empty());
}

#[tokio::test]
async fn test_generate_for_unknown_step_run() {
    let h = harness().await;
    let err = h.manual_pipeline().generate("missing", "dana").await.unwrap_err();
    assert_eq!(err.error_code(), "NOT_FOUND");
}

// ============================================================================
// Dry-run
// ============================================================================

#[tokio::test]
async fn test_dry_run_is_side_effect_free() {
    let h = harness().await;
    let run = low_silhouette_run(&h).await;
    let pipeline = h.manual_pipeline();
    let advice = pipeline.generate(&run.step_run_id, "dana").await.unwrap().remove(0);

    for _ in 0..3 {
        let validated = pipeline.dry_run(&advice.advice_id, "dana").await.unwrap();
        assert_eq!(validated.validation.state, ValidationState::DryRunPassed);
        assert_eq!(validated.validation.schema_version, Some(1));
    }

    assert_eq!(h.tasks_with_status(TaskStatus::Pending).await, 0);
    let lineage = h.ledger.lineage_tree(&run.step_run_id).await.unwrap();
    assert_eq!(lineage.len(), 1);

    let stored = pipeline.get(&advice.advice_id).await.unwrap();
    assert_eq!(stored.application_state, ApplicationState::Proposed);
    assert_eq!(stored.apply_task_id, None);
    assert!(stored.validation.validated_at.is_some());
}

#[tokio::test]
async fn test_schema_change_rejects_apply() {
    let h = harness().await;
    let run = low_silhouette_run(&h).await;
    let pipeline = h.manual_pipeline();
    let advice = pipeline.generate(&run.step_run_id, "dana").await.unwrap().remove(0);
    assert_eq!(advice.risk_tier, RiskTier::Low);

    // New clustering contract caps resolution below the proposed 1.0.
    let mut clustering = StepCatalog::single_cell("/opt/assay/runner", "runner:1.0")
        .into_iter()
        .find(|s| s.step_ref == "clustering")
        .unwrap();
    clustering.schema = clustering.schema.with(
        "resolution",
        ParamSpec::new(ParamKind::Number).min(0.05).max(0.9).default_value(0.8),
    );
    let registered = h.persistence.register_step(&clustering).await.unwrap();
    assert_eq!(registered.version, 2);

    let err = pipeline
        .apply(&advice.advice_id, &ApplyRequest::default())
        .await
        .unwrap_err();
    assert!(
        matches!(
            err,
            Error::Core(CoreError::ValidationRejected { ref advice_id, .. })
                if *advice_id == advice.advice_id
        ),
        "{err:?}"
    );

    let stored = pipeline.get(&advice.advice_id).await.unwrap();
    assert_eq!(stored.validation.state, ValidationState::DryRunFailed);
    assert_eq!(stored.validation.schema_version, Some(2));
    assert!(stored.validation.reason.unwrap().contains("resolution"));
    assert_eq!(stored.application_state, ApplicationState::Proposed);
    assert_eq!(h.tasks_with_status(TaskStatus::Pending).await, 0);
}

#[tokio::test]
async fn test_schema_change_raising_risk_requires_confirmation() {
    let h = harness().await;
    let run = low_silhouette_run(&h).await;
    let pipeline = h.manual_pipeline();
    let advice = pipeline.generate(&run.step_run_id, "dana").await.unwrap().remove(0);
    assert_eq!(advice.risk_tier, RiskTier::Low);

    // Same valid range, but resolution is now flagged destructive.
    let mut clustering = StepCatalog::single_cell("/opt/assay/runner", "runner:1.0")
        .into_iter()
        .find(|s| s.step_ref == "clustering")
        .unwrap();
    clustering.schema = clustering.schema.with(
        "resolution",
        ParamSpec::new(ParamKind::Number)
            .min(0.05)
            .max(2.0)
            .default_value(0.8)
            .destructive(),
    );
    let registered = h.persistence.register_step(&clustering).await.unwrap();
    assert_eq!(registered.version, 2);

    let err = pipeline
        .apply(&advice.advice_id, &ApplyRequest::default())
        .await
        .unwrap_err();
    assert!(
        matches!(err, Error::ConfirmationRequired { ref subject } if *subject == advice.advice_id),
        "{err:?}"
    );
    assert_eq!(h.tasks_with_status(TaskStatus::Pending).await, 0);

    let stored = pipeline.get(&advice.advice_id).await.unwrap();
    assert_eq!(stored.risk_tier, RiskTier::High);
    assert_eq!(stored.validation.state, ValidationState::DryRunPassed);
    assert_eq!(stored.application_state, ApplicationState::Proposed);

    let audit = pipeline.audit_log(&advice.advice_id).await.unwrap();
    let reassess = audit
        .iter()
        .find(|e| e.action == "advice.reassess")
        .expect("reassess entry");
    assert_eq!(reassess.details["from"], json!("low"));
    assert_eq!(reassess.details["to"], json!("high"));

    let receipt = pipeline.apply(&advice.advice_id, &confirm("erin")).await.unwrap();
    assert_eq!(receipt.advice.confirmed_by.as_deref(), Some("erin"));
    assert_eq!(h.tasks_with_status(TaskStatus::Pending).await, 1);
}

// ============================================================================
// Apply
// ============================================================================

#[tokio::test]
async fn test_high_risk_requires_confirmation() {
    let h = harness().await;
    let run = high_mito_run(&h).await;
    let pipeline = h.manual_pipeline();
    let advice = pipeline.generate(&run.step_run_id, "dana").await.unwrap().remove(0);

    let err = pipeline
        .apply(&advice.advice_id, &ApplyRequest::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ConfirmationRequired { .. }), "{err:?}");
    assert_eq!(h.tasks_with_status(TaskStatus::Pending).await, 0);
    assert_eq!(
        pipeline.get(&advice.advice_id).await.unwrap().apply_task_id,
        None
    );

    let receipt = pipeline.apply(&advice.advice_id, &confirm("dana")).await.unwrap();
    assert_eq!(receipt.task.status, TaskStatus::Pending);
    assert_eq!(receipt.task.params["max_mito"], json!(0.176));
    assert_eq!(receipt.task.params["min_genes"], json!(200));
    assert_eq!(receipt.task.parent_step_run_id.as_deref(), Some(run.step_run_id.as_str()));
    assert_eq!(
        receipt.task.origin,
        TaskOrigin::AdviceApply {
            advice_id: advice.advice_id.clone()
        }
    );
    assert_eq!(receipt.advice.confirmed_by.as_deref(), Some("dana"));
    // Not applied until the task succeeds.
    assert_eq!(receipt.advice.application_state, ApplicationState::Proposed);

    let applied_run = h
        .finish_with_hook(
            &pipeline,
            &receipt.task.task_id,
            json!({"n_cells_pass_filter": 3900, "high_mito": 0.1}),
        )
        .await;
    assert_eq!(applied_run.parent_step_run_id.as_deref(), Some(run.step_run_id.as_str()));

    let stored = pipeline.get(&advice.advice_id).await.unwrap();
    assert_eq!(stored.application_state, ApplicationState::Applied);
    assert_eq!(stored.applied_step_run_id.as_deref(), Some(applied_run.step_run_id.as_str()));

    let actions: Vec<String> = pipeline
        .audit_log(&advice.advice_id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.action)
        .collect();
    assert!(actions.contains(&"advice.confirm".to_string()));
    assert!(actions.contains(&"advice.apply".to_string()));
    assert_eq!(actions.last().map(String::as_str), Some("advice.applied"));
}

#[tokio::test]
async fn test_low_risk_applies_without_confirmation() {
    let h = harness().await;
    let run = low_silhouette_run(&h).await;
    let pipeline = h.manual_pipeline();
    let advice = pipeline.generate(&run.step_run_id, "dana").await.unwrap().remove(0);

    let receipt = pipeline
        .apply(&advice.advice_id, &ApplyRequest::default())
        .await
        .unwrap();
    assert_eq!(receipt.task.params["resolution"], json!(1.0));
    assert_eq!(receipt.advice.confirmed_by, None);

    // A second apply while the first task is pending is refused.
    let err = pipeline
        .apply(&advice.advice_id, &ApplyRequest::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }), "{err:?}");
}

#[tokio::test]
async fn test_failed_apply_task_keeps_advice_proposed() {
    let h = harness().await;
    let run = low_silhouette_run(&h).await;
    let pipeline = h.manual_pipeline();
    let advice = pipeline.generate(&run.step_run_id, "dana").await.unwrap().remove(0);

    let receipt = pipeline
        .apply(&advice.advice_id, &ApplyRequest::default())
        .await
        .unwrap();
    h.machine.start(&receipt.task.task_id).await.unwrap();
    let failed = h
        .machine
        .complete(
            &receipt.task.task_id,
            TaskOutcome::Failed(TaskFailure::new(
                FailureKind::ExitCode,
                "runner exited with code 1",
            )),
        )
        .await
        .unwrap();
    pipeline.on_task_finished(&failed, None).await.unwrap();

    let stored = pipeline.get(&advice.advice_id).await.unwrap();
    assert_eq!(stored.application_state, ApplicationState::Proposed);
    let actions: Vec<String> = pipeline
        .audit_log(&advice.advice_id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.action)
        .collect();
    assert!(actions.contains(&"advice.apply_failed".to_string()));

    // Retrying spawns a fresh task.
    let retry = pipeline
        .apply(&advice.advice_id, &ApplyRequest::default())
        .await
        .unwrap();
    assert_ne!(retry.task.task_id, receipt.task.task_id);
}

// ============================================================================
// Rollback
// ============================================================================

#[tokio::test]
async fn test_rollback_is_forward_only() {
    let h = harness().await;
    let run = low_silhouette_run(&h).await;
    let pipeline = h.manual_pipeline();
    let advice = pipeline.generate(&run.step_run_id, "dana").await.unwrap().remove(0);

    let err = pipeline.rollback(&advice.advice_id, "dana").await.unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }), "{err:?}");

    let receipt = pipeline
        .apply(&advice.advice_id, &ApplyRequest::default())
        .await
        .unwrap();
    let applied = h
        .finish_with_hook(&pipeline, &receipt.task.task_id, json!({"silhouette_score": 0.41}))
        .await;

    let rollback = pipeline.rollback(&advice.advice_id, "dana").await.unwrap();
    assert_eq!(rollback.task.params, advice.pre_patch_params);
    assert_eq!(
        rollback.task.parent_step_run_id.as_deref(),
        Some(applied.step_run_id.as_str())
    );
    assert_eq!(
        rollback.task.origin,
        TaskOrigin::AdviceRollback {
            advice_id: advice.advice_id.clone()
        }
    );

    let reverted = h
        .finish_with_hook(&pipeline, &rollback.task.task_id, json!({"silhouette_score": 0.2}))
        .await;

    let stored = pipeline.get(&advice.advice_id).await.unwrap();
    assert_eq!(stored.application_state, ApplicationState::RolledBack);
    assert_eq!(stored.rollback_step_run_id.as_deref(), Some(reverted.step_run_id.as_str()));

    // History is intact: original, applied and reverted runs in order.
    let lineage = h.ledger.lineage(&reverted.step_run_id).await.unwrap();
    let ids: Vec<&str> = lineage.iter().map(|r| r.step_run_id.as_str()).collect();
    assert_eq!(ids, vec![
        run.step_run_id.as_str(),
        applied.step_run_id.as_str(),
        reverted.step_run_id.as_str()
    ]);
    let still_there = h.ledger.get(&applied.step_run_id).await.unwrap();
    assert_eq!(still_there.params["resolution"], json!(1.0));

    let err = pipeline
        .apply(&advice.advice_id, &ApplyRequest::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }), "{err:?}");
}

// ============================================================================
// Automation through the lifecycle hook
// ============================================================================

#[tokio::test]
async fn test_auto_advice_and_auto_apply_low_risk() {
    let h = harness().await;
    let pipeline = h.pipeline(AdviceConfig {
        auto_apply_low_risk: true,
        ..Default::default()
    });

    let task = h
        .machine
        .create(TaskDraft::new(
            "clustering",
            params(json!({"method": "leiden", "resolution": 0.8})),
        ))
        .await
        .unwrap();
    let run = h
        .finish_with_hook(
            &pipeline,
            &task.task_id,
            json!({"silhouette_score": 0.2, "n_clusters": 8}),
        )
        .await;

    let advice = pipeline.list(&run.step_run_id).await.unwrap();
    assert_eq!(advice.len(), 1);
    let apply_task_id = advice[0].apply_task_id.clone().expect("auto-applied");
    let apply_task = h.machine.get(&apply_task_id).await.unwrap();
    assert_eq!(apply_task.status, TaskStatus::Pending);

    // The patched run still underperforms; its advice is not auto-applied.
    let patched = h
        .finish_with_hook(
            &pipeline,
            &apply_task_id,
            json!({"silhouette_score": 0.25, "n_clusters": 9}),
        )
        .await;
    let follow_up = pipeline.list(&patched.step_run_id).await.unwrap();
    assert_eq!(follow_up.len(), 1);
    assert_eq!(follow_up[0].apply_task_id, None);
    assert_eq!(
        pipeline.get(&advice[0].advice_id).await.unwrap().application_state,
        ApplicationState::Applied
    );
}

#[tokio::test]
async fn test_auto_apply_skips_high_risk() {
    let h = harness().await;
    let pipeline = h.pipeline(AdviceConfig {
        auto_apply_low_risk: true,
        ..Default::default()
    });

    let task = h
        .machine
        .create(TaskDraft::new("qc", params(json!({"min_genes": 200}))))
        .await
        .unwrap();
    let run = h
        .finish_with_hook(
            &pipeline,
            &task.task_id,
            json!({"n_cells_pass_filter": 4200, "high_mito": 0.22}),
        )
        .await;

    let advice = pipeline.list(&run.step_run_id).await.unwrap();
    assert_eq!(advice.len(), 1);
    assert_eq!(advice[0].risk_tier, RiskTier::High);
    assert_eq!(advice[0].apply_task_id, None);
    assert_eq!(h.tasks_with_status(TaskStatus::Pending).await, 0);
}

// ============================================================================
// Tools
// ============================================================================

#[tokio::test]
async fn test_tools_surface() {
    let h = harness().await;
    let run = low_silhouette_run(&h).await;
    let tools = h.tools();

    let metrics = tools.get_metrics(&run.step_run_id).await.unwrap();
    assert_eq!(metrics["silhouette_score"], json!(0.2));

    let plot = tools
        .render_plot(&run.step_run_id, &PlotSpec::default())
        .await
        .unwrap();
    assert_eq!(plot.kind, "svg");
    let svg = String::from_utf8(h.store.get(&plot.hash).await.unwrap()).unwrap();
    assert!(svg.contains("silhouette_score"));
    assert!(svg.contains("n_clusters"));

    let missing = tools
        .render_plot(
            &run.step_run_id,
            &PlotSpec {
                metrics: vec!["nope".into()],
                title: None,
            },
        )
        .await;
    assert!(matches!(missing, Err(Error::InvalidInput(_))));

    let good = Patch::ParamDelta(ParamDelta {
        set: params(json!({"resolution": 1.1})),
        unset: vec![],
    });
    let bad = Patch::ParamDelta(ParamDelta {
        set: params(json!({"resolution": -1})),
        unset: vec![],
    });

    match tools.apply_patch(&run.step_run_id, &good, true, false).await.unwrap() {
        PatchOutcome::Validated { report, risk } => {
            assert_eq!(report.resolved_params["resolution"], json!(1.1));
            assert_eq!(report.schema_version, 1);
            assert_eq!(risk.tier, RiskTier::Low);
        }
        other => panic!("unexpected {other:?}"),
    }
    match tools.apply_patch(&run.step_run_id, &bad, true, false).await.unwrap() {
        PatchOutcome::Rejected { reason, .. } => assert!(reason.contains("below minimum")),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(h.tasks_with_status(TaskStatus::Pending).await, 0);

    let err = tools.apply_patch(&run.step_run_id, &bad, false, false).await.unwrap_err();
    assert_eq!(err.error_code(), "VALIDATION_REJECTED");

    match tools.apply_patch(&run.step_run_id, &good, false, false).await.unwrap() {
        PatchOutcome::Created { task } => {
            assert_eq!(task.params["resolution"], json!(1.1));
            assert_eq!(
                task.origin,
                TaskOrigin::Clone {
                    source_step_run_id: run.step_run_id.clone()
                }
            );
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(h.tasks_with_status(TaskStatus::Pending).await, 1);
}

#[tokio::test]
async fn test_tool_patch_over_risk_gate_needs_confirmation() {
    let h = harness().await;
    let run = low_silhouette_run(&h).await;
    let tools = h.tools();

    let jump = Patch::ParamDelta(ParamDelta {
        set: params(json!({"resolution": 3.0})),
        unset: vec![],
    });

    match tools.apply_patch(&run.step_run_id, &jump, true, false).await.unwrap() {
        PatchOutcome::Validated { risk, .. } => {
            assert_eq!(risk.tier, RiskTier::High);
            assert!(risk.reasons[0].starts_with("resolution"));
        }
        other => panic!("unexpected {other:?}"),
    }

    let err = tools
        .apply_patch(&run.step_run_id, &jump, false, false)
        .await
        .unwrap_err();
    assert!(
        matches!(err, Error::ConfirmationRequired { ref subject } if *subject == run.step_run_id),
        "{err:?}"
    );
    assert_eq!(err.error_code(), "CONFIRMATION_REQUIRED");
    assert_eq!(h.tasks_with_status(TaskStatus::Pending).await, 0);

    match tools.apply_patch(&run.step_run_id, &jump, false, true).await.unwrap() {
        PatchOutcome::Created { task } => assert_eq!(task.params["resolution"], json!(3.0)),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(h.tasks_with_status(TaskStatus::Pending).await, 1);
}

#[tokio::test]
async fn test_qc_scenario_then_threshold_suggestion() {
    let h = harness().await;
    let run = h
        .run(
            TaskDraft::new("qc", params(json!({"min_genes": 200}))),
            json!({"n_cells": 1000, "n_cells_pass_filter": 870}),
        )
        .await;
    assert_eq!(run.params["min_genes"], json!(200));
    assert!(run.metrics.contains_key("n_cells_pass_filter"));

    let genes_per_cell: Vec<f64> = (0..500).map(|i| 400.0 + ((i * 37) % 900) as f64).collect();
    let suggestion = suggest_threshold("min_genes", &genes_per_cell).unwrap();
    assert!(suggestion.value.is_finite());
    assert!((0.0..=1.0).contains(&suggestion.confidence));
}
