// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Step-run ledger behavior over a real state machine.

mod common;

use assay_core::ledger::diff_params;
use assay_core::model::{TaskDraft, TaskOrigin, TaskOutcome};
use common::{finalization, harness, params};
use serde_json::json;

// ============================================================================
// Finalization
// ============================================================================

#[tokio::test]
async fn test_second_finalize_fails_and_record_is_unchanged() {
    let h = harness().await;
    let run = h
        .run_to_success(
            TaskDraft::new("qc", params(json!({"min_genes": 200}))),
            json!({"n_cells_pass_filter": 4100}),
        )
        .await;

    let task = h.machine.get(&run.task_id).await.unwrap();
    let err = h
        .ledger
        .finalize(finalization(&task, json!({"n_cells_pass_filter": 1})))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "DUPLICATE_FINALIZATION");

    let stored = h.ledger.get(&run.step_run_id).await.unwrap();
    assert_eq!(stored, run);
    assert_eq!(stored.metrics["n_cells_pass_filter"], json!(4100));
}

#[tokio::test]
async fn test_finalize_requires_terminal_task() {
    let h = harness().await;
    let task = h
        .machine
        .create(TaskDraft::new("qc", params(json!({"min_genes": 200}))))
        .await
        .unwrap();
    h.machine.start(&task.task_id).await.unwrap();

    let err = h
        .ledger
        .finalize(finalization(&task, json!({})))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "ILLEGAL_TRANSITION");
    assert!(h.ledger.get_by_task(&task.task_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_failed_task_has_no_step_run_unless_finalized() {
    let h = harness().await;
    let task = h
        .machine
        .create(TaskDraft::new("qc", params(json!({"min_genes": 200}))))
        .await
        .unwrap();
    h.machine.start(&task.task_id).await.unwrap();
    h.machine
        .complete(
            &task.task_id,
            TaskOutcome::Failed(assay_core::model::TaskFailure::new(
                assay_core::model::FailureKind::ExitCode,
                "exit 2",
            )),
        )
        .await
        .unwrap();

    assert!(h.ledger.get_by_task(&task.task_id).await.unwrap().is_none());
}

// ============================================================================
// Clone and lineage
// ============================================================================

#[tokio::test]
async fn test_clone_with_no_overrides_reproduces_params() {
    let h = harness().await;
    let source = h
        .run_to_success(
            TaskDraft::new("qc", params(json!({"min_genes": 250, "max_mito": 0.2}))),
            json!({"n_cells": 5000}),
        )
        .await;

    let draft = h.ledger.clone_run(&source.step_run_id, &params(json!({}))).await.unwrap();
    assert_eq!(
        draft.origin,
        TaskOrigin::Clone {
            source_step_run_id: source.step_run_id.clone()
        }
    );
    let child = h.run_to_success(draft, json!({"n_cells": 5000})).await;

    assert_eq!(child.params, source.params);
    assert_eq!(child.parent_step_run_id.as_deref(), Some(source.step_run_id.as_str()));
    assert_eq!(child.lineage_root_id, source.step_run_id);
    assert_eq!(child.sequence, 2);
}

#[tokio::test]
async fn test_clone_overrides_only_change_overridden_keys() {
    let h = harness().await;
    let source = h
        .run_to_success(
            TaskDraft::new("qc", params(json!({"min_genes": 250}))),
            json!({}),
        )
        .await;

    let draft = h
        .ledger
        .clone_run(&source.step_run_id, &params(json!({"max_genes": 6000})))
        .await
        .unwrap();
    let child = h.run_to_success(draft, json!({})).await;

    let diff = diff_params(&source.params, &child.params);
    assert!(diff.added.is_empty());
    assert!(diff.removed.is_empty());
    assert_eq!(diff.changed.keys().collect::<Vec<_>>(), vec!["max_genes"]);
}

#[tokio::test]
async fn test_clone_does_not_create_anything() {
    let h = harness().await;
    let source = h
        .run_to_success(TaskDraft::new("pca", params(json!({}))), json!({}))
        .await;
    let depth = h.machine.persistence().queue_depth().await.unwrap();

    h.ledger.clone_run(&source.step_run_id, &params(json!({}))).await.unwrap();

    assert_eq!(h.machine.persistence().queue_depth().await.unwrap(), depth);
    assert!(h.ledger.children(&source.step_run_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_lineage_is_oldest_first() {
    let h = harness().await;
    let root = h
        .run_to_success(TaskDraft::new("umap", params(json!({}))), json!({}))
        .await;
    let mid = h
        .run_to_success(
            h.ledger
                .clone_run(&root.step_run_id, &params(json!({"min_dist": 0.3})))
                .await
                .unwrap(),
            json!({}),
        )
        .await;
    let leaf = h
        .run_to_success(
            h.ledger
                .clone_run(&mid.step_run_id, &params(json!({"min_dist": 0.2})))
                .await
                .unwrap(),
            json!({}),
        )
        .await;
    // A sibling of `mid` shares the root but is not an ancestor of `leaf`.
    h.run_to_success(
        h.ledger
            .clone_run(&root.step_run_id, &params(json!({"n_neighbors": 30})))
            .await
            .unwrap(),
        json!({}),
    )
    .await;

    let chain: Vec<String> = h
        .ledger
        .lineage(&leaf.step_run_id)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.step_run_id)
        .collect();
    assert_eq!(chain, vec![root.step_run_id.clone(), mid.step_run_id, leaf.step_run_id]);

    let tree = h.ledger.lineage_tree(&root.step_run_id).await.unwrap();
    assert_eq!(tree.len(), 4);
    assert_eq!(
        tree.iter().map(|r| r.sequence).collect::<Vec<_>>(),
        vec![1, 2, 3, 4]
    );
    assert_eq!(h.ledger.children(&root.step_run_id).await.unwrap().len(), 2);
}

// ============================================================================
// Compare and pin
// ============================================================================

#[tokio::test]
async fn test_compare_stored_runs() {
    let h = harness().await;
    let a = h
        .run_to_success(
            TaskDraft::new("clustering", params(json!({"resolution": 0.8}))),
            json!({"n_clusters": 12, "silhouette_score": 0.3}),
        )
        .await;
    let b = h
        .run_to_success(
            h.ledger
                .clone_run(&a.step_run_id, &params(json!({"resolution": 1.0})))
                .await
                .unwrap(),
            json!({"n_clusters": 15, "silhouette_score": 0.36}),
        )
        .await;

    let diff = h.ledger.compare(&a.step_run_id, &b.step_run_id).await.unwrap();
    assert_eq!(diff.params.changed["resolution"].b, json!(1.0));
    assert_eq!(diff.metrics["n_clusters"].delta, 3.0);

    assert_eq!(h.ledger.get(&a.step_run_id).await.unwrap(), a);
}

#[tokio::test]
async fn test_pin_and_unpin() {
    let h = harness().await;
    let run = h
        .run_to_success(TaskDraft::new("hvg", params(json!({}))), json!({}))
        .await;

    h.ledger.pin(&run.step_run_id, Some("baseline")).await.unwrap();
    let pins = h.ledger.list_pinned().await.unwrap();
    assert_eq!(pins.len(), 1);
    assert_eq!(pins[0].step_run_id, run.step_run_id);
    assert_eq!(h.ledger.get(&run.step_run_id).await.unwrap(), run);

    assert!(h.ledger.unpin(&run.step_run_id).await.unwrap());
    assert!(h.ledger.list_pinned().await.unwrap().is_empty());

    let err = h.ledger.pin("missing", None).await.unwrap_err();
    assert_eq!(err.error_code(), "NOT_FOUND");
}
