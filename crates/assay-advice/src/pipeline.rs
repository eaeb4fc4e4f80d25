// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Advice pipeline: generate, validate, apply and roll back.
//!
//! ```text
//! generate ──► proposed ──apply──► (task running) ──succeeded──► applied
//!                 │                      │                          │
//!              dry-run               failed/canceled            rollback
//!          (validation only)       (stays proposed)                │
//!                                                    (task) ──succeeded──► rolled-back
//! ```
//!
//! Application state only moves when the spawned task succeeds; the
//! pipeline observes that through its [`LifecycleHook`] implementation.

use std::sync::Arc;

use assay_core::model::{
    Advice, ApplicationState, Evidence, Finding, RiskTier, StepRun, Task, TaskOrigin, TaskStatus,
    Validation, ValidationState, new_id,
};
use assay_core::persistence::AuditEntry;
use assay_core::{CoreError, LifecycleHook, Persistence};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::backend::{self, AdviceBackend, AdviceContext, BackendConfig};
use crate::error::{Error, Result};
use crate::knowledge::KnowledgeBase;
use crate::policy::RiskPolicy;
use crate::tools::{AdviceTools, PatchOutcome, PlotSpec};

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct AdviceConfig {
    pub backend: BackendConfig,
    pub policy: RiskPolicy,
    /// Generate advice for every newly succeeded step run.
    pub auto_advice: bool,
    /// Apply dry-run-passed low-risk advice without confirmation.
    pub auto_apply_low_risk: bool,
    /// Attach a metrics plot to generated advice.
    pub render_plots: bool,
    /// Actor recorded for automatic actions.
    pub system_actor: String,
}

impl Default for AdviceConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::Rules,
            policy: RiskPolicy::default(),
            auto_advice: true,
            auto_apply_low_risk: false,
            render_plots: true,
            system_actor: "system".to_string(),
        }
    }
}

/// Body of an apply request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyRequest {
    /// Explicit confirmation; required for high-risk advice.
    #[serde(default)]
    pub confirm: bool,
    #[serde(default = "default_actor")]
    pub actor: String,
}

fn default_actor() -> String {
    "anonymous".to_string()
}

impl Default for ApplyRequest {
    fn default() -> Self {
        Self {
            confirm: false,
            actor: default_actor(),
        }
    }
}

/// Advice after an apply or rollback, with the task it spawned.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApplyReceipt {
    pub advice: Advice,
    pub task: Task,
}

const ENTITY: &str = "advice";

pub struct AdvicePipeline {
    tools: AdviceTools,
    backend: Arc<dyn AdviceBackend>,
    knowledge: KnowledgeBase,
    config: AdviceConfig,
}

impl AdvicePipeline {
    /// Pipeline using the backend named by `config`.
    pub fn new(tools: AdviceTools, config: AdviceConfig) -> Result<Self> {
        let backend = backend::from_config(&config.backend)?;
        Ok(Self::with_backend(tools, backend, config))
    }

    pub fn with_backend(
        tools: AdviceTools,
        backend: Arc<dyn AdviceBackend>,
        config: AdviceConfig,
    ) -> Self {
        Self {
            tools: tools.with_policy(config.policy.clone()),
            backend,
            knowledge: KnowledgeBase::single_cell(),
            config,
        }
    }

    pub fn with_knowledge(mut self, knowledge: KnowledgeBase) -> Self {
        self.knowledge = knowledge;
        self
    }

    pub fn tools(&self) -> &AdviceTools {
        &self.tools
    }

    pub fn config(&self) -> &AdviceConfig {
        &self.config
    }

    fn persistence(&self) -> &Arc<dyn Persistence> {
        self.tools.machine().persistence()
    }

    async fn audit(&self, actor: &str, action: &str, advice_id: &str, details: serde_json::Value) {
        let entry = AuditEntry::now(actor, action, ENTITY, advice_id, details);
        if let Err(e) = self.persistence().append_audit(&entry).await {
            warn!(
                advice_id = %advice_id,
                action = %action,
                error = %e,
                "Failed to append audit entry"
            );
        }
    }

    pub async fn get(&self, advice_id: &str) -> Result<Advice> {
        Ok(self
            .persistence()
            .get_advice(advice_id)
            .await?
            .ok_or_else(|| CoreError::not_found("advice", advice_id))?)
    }

    pub async fn list(&self, step_run_id: &str) -> Result<Vec<Advice>> {
        self.tools.ledger().get(step_run_id).await?;
        Ok(self.persistence().list_advice(step_run_id).await?)
    }

    pub async fn audit_log(&self, advice_id: &str) -> Result<Vec<AuditEntry>> {
        Ok(self.persistence().list_audit(ENTITY, advice_id).await?)
    }

    // ========================================================================
    // Generation
    // ========================================================================

    /// Run both agent stages against a step run and store the resulting
    /// advice, each already dry-run validated.
    pub async fn generate(&self, step_run_id: &str, actor: &str) -> Result<Vec<Advice>> {
        let run = self.tools.ledger().get(step_run_id).await?;
        let step = self
            .persistence()
            .get_step(&run.step_ref)
            .await?
            .ok_or_else(|| CoreError::not_found("step", &run.step_ref))?;
        let context = AdviceContext {
            step_run: run.clone(),
            step,
        };

        let diagnostic = self.backend.diagnose(&context, &self.knowledge).await?;
        if diagnostic.findings.is_empty() {
            debug!(step_run_id = %step_run_id, "No findings, no advice");
            return Ok(Vec::new());
        }

        let proposals = self.backend.propose(&context, &diagnostic).await?;
        if proposals.is_empty() {
            info!(
                step_run_id = %step_run_id,
                findings = diagnostic.findings.len(),
                "Findings without actionable proposals"
            );
            return Ok(Vec::new());
        }

        let plots = self.render_evidence_plot(&run, &diagnostic.findings).await;

        let mut generated = Vec::with_capacity(proposals.len());
        for proposal in proposals {
            let assessment =
                self.config
                    .policy
                    .assess(&proposal.patch, &context.step.schema, &run.params);

            let findings: Vec<Finding> = diagnostic
                .findings
                .iter()
                .filter(|f| proposal.metrics.is_empty() || proposal.metrics.contains(&f.metric))
                .cloned()
                .collect();
            let mut citations: Vec<String> =
                findings.iter().filter_map(|f| f.citation.clone()).collect();
            citations.dedup();

            let now = Utc::now();
            let advice = Advice {
                advice_id: new_id(),
                step_run_id: run.step_run_id.clone(),
                step_ref: run.step_ref.clone(),
                advice_type: proposal.advice_type,
                title: proposal.title,
                rationale: proposal.rationale,
                risk_tier: assessment.tier,
                evidence: Evidence {
                    metric_ids: findings.iter().map(|f| f.metric.clone()).collect(),
                    plot_artifacts: plots.clone(),
                    citations,
                },
                diagnostic: findings,
                patch: proposal.patch,
                schema_version: diagnostic.schema_version,
                validation: Validation::unvalidated(),
                application_state: ApplicationState::Proposed,
                pre_patch_params: run.params.clone(),
                apply_task_id: None,
                applied_step_run_id: None,
                rollback_task_id: None,
                rollback_step_run_id: None,
                confirmed_by: None,
                created_at: now,
                updated_at: now,
            };

            self.persistence().insert_advice(&advice).await?;
            self.audit(
                actor,
                "advice.generate",
                &advice.advice_id,
                json!({
                    "step_run_id": advice.step_run_id,
                    "backend": self.backend.name(),
                    "patch_kind": advice.patch.kind(),
                    "risk_tier": advice.risk_tier.as_str(),
                    "risk_reasons": assessment.reasons,
                }),
            )
            .await;

            let advice = self.validate(advice, actor).await?;
            generated.push(advice);
        }

        info!(
            step_run_id = %step_run_id,
            backend = self.backend.name(),
            advice = generated.len(),
            "Advice generated"
        );
        Ok(generated)
    }

    async fn render_evidence_plot(&self, run: &StepRun, findings: &[Finding]) -> Vec<String> {
        if !self.config.render_plots {
            return Vec::new();
        }
        let spec = PlotSpec {
            metrics: findings.iter().map(|f| f.metric.clone()).collect(),
            title: Some(format!("{} findings", run.step_ref)),
        };
        match self.tools.render_plot(&run.step_run_id, &spec).await {
            Ok(artifact) => vec![artifact.hash],
            Err(e) => {
                warn!(step_run_id = %run.step_run_id, error = %e, "Evidence plot not rendered");
                Vec::new()
            }
        }
    }

    // ========================================================================
    // Validation
    // ========================================================================

    /// Dry-run the advice's patch against the current schema. Only the
    /// validation field changes.
    pub async fn dry_run(&self, advice_id: &str, actor: &str) -> Result<Advice> {
        let advice = self.get(advice_id).await?;
        self.validate(advice, actor).await
    }

    async fn validate(&self, mut advice: Advice, actor: &str) -> Result<Advice> {
        let run = self.tools.ledger().get(&advice.step_run_id).await?;
        let (step, verdict) = self.tools.dry_run(&run, &advice.patch).await?;
        let schema_version = step.version;

        if schema_version != advice.schema_version {
            info!(
                advice_id = %advice.advice_id,
                diagnosed = advice.schema_version,
                current = schema_version,
                "Schema changed since diagnosis, validating against current version"
            );
        }

        let (state, reason) = match verdict {
            Ok(_) => (ValidationState::DryRunPassed, None),
            Err(reason) => (ValidationState::DryRunFailed, Some(reason)),
        };
        advice.validation = Validation {
            state,
            reason,
            schema_version: Some(schema_version),
            validated_at: Some(Utc::now()),
        };

        self.persistence()
            .update_advice_validation(&advice.advice_id, &advice.validation)
            .await?;
        self.audit(
            actor,
            "advice.validate",
            &advice.advice_id,
            json!({
                "state": advice.validation.state,
                "reason": advice.validation.reason,
                "schema_version": schema_version,
                "diagnosed_schema_version": advice.schema_version,
            }),
        )
        .await;
        Ok(advice)
    }

    // ========================================================================
    // Apply / rollback
    // ========================================================================

    /// Re-validate and spawn a task running the patched parameters.
    pub async fn apply(&self, advice_id: &str, request: &ApplyRequest) -> Result<ApplyReceipt> {
        let advice = self.get(advice_id).await?;
        match advice.application_state {
            ApplicationState::Proposed => {}
            state => {
                return Err(Error::InvalidState {
                    advice_id: advice_id.to_string(),
                    action: "applied",
                    reason: format!("advice is {}", state.as_str()),
                });
            }
        }
        if let Some(task_id) = &advice.apply_task_id {
            self.ensure_settled(advice_id, "applied", task_id).await?;
        }

        let advice = self.validate(advice, &request.actor).await?;
        if advice.validation.state != ValidationState::DryRunPassed {
            return Err(CoreError::ValidationRejected {
                advice_id: advice_id.to_string(),
                reason: advice.validation.reason.clone().unwrap_or_default(),
            }
            .into());
        }
        let advice = self.reassess(advice, &request.actor).await?;
        if advice.risk_tier == RiskTier::High && !request.confirm {
            return Err(Error::ConfirmationRequired {
                subject: advice_id.to_string(),
            });
        }

        let outcome = self
            .tools
            .apply_patch_as(
                advice_id,
                &advice.step_run_id,
                &advice.patch,
                false,
                request.confirm,
                TaskOrigin::AdviceApply {
                    advice_id: advice_id.to_string(),
                },
            )
            .await?;
        let PatchOutcome::Created { task } = outcome else {
            return Err(CoreError::internal("apply_patch did not create a task").into());
        };

        let mut updated = advice.clone();
        updated.apply_task_id = Some(task.task_id.clone());
        updated.confirmed_by = (advice.risk_tier == RiskTier::High).then(|| request.actor.clone());
        updated.updated_at = Utc::now();
        self.store_application(&updated, &advice, &task, "applied")
            .await?;

        if updated.confirmed_by.is_some() {
            self.audit(
                &request.actor,
                "advice.confirm",
                advice_id,
                json!({"risk_tier": advice.risk_tier.as_str()}),
            )
            .await;
        }
        self.audit(
            &request.actor,
            "advice.apply",
            advice_id,
            json!({
                "task_id": task.task_id,
                "step_run_id": advice.step_run_id,
                "risk_tier": advice.risk_tier.as_str(),
            }),
        )
        .await;

        info!(advice_id = %advice_id, task_id = %task.task_id, "Advice apply task created");
        Ok(ApplyReceipt {
            advice: updated,
            task: *task,
        })
    }

    /// Classify the patch again against the current schema. The stored tier
    /// only ever goes up.
    async fn reassess(&self, mut advice: Advice, actor: &str) -> Result<Advice> {
        let run = self.tools.ledger().get(&advice.step_run_id).await?;
        let assessment = self.tools.assess(&run, &advice.patch).await?;
        if assessment.tier != RiskTier::High || advice.risk_tier == RiskTier::High {
            return Ok(advice);
        }

        warn!(
            advice_id = %advice.advice_id,
            reasons = ?assessment.reasons,
            "Current schema raises advice to high risk"
        );
        self.persistence()
            .update_advice_risk_tier(&advice.advice_id, RiskTier::High)
            .await?;
        self.audit(
            actor,
            "advice.reassess",
            &advice.advice_id,
            json!({
                "from": advice.risk_tier.as_str(),
                "to": RiskTier::High.as_str(),
                "risk_reasons": assessment.reasons,
            }),
        )
        .await;
        advice.risk_tier = RiskTier::High;
        Ok(advice)
    }

    /// Spawn a task re-running the pre-patch parameters on top of the
    /// applied step run. Nothing is deleted or edited.
    pub async fn rollback(&self, advice_id: &str, actor: &str) -> Result<ApplyReceipt> {
        let advice = self.get(advice_id).await?;
        if advice.application_state != ApplicationState::Applied {
            return Err(Error::InvalidState {
                advice_id: advice_id.to_string(),
                action: "rolled back",
                reason: format!("advice is {}", advice.application_state.as_str()),
            });
        }
        if let Some(task_id) = &advice.rollback_task_id {
            self.ensure_settled(advice_id, "rolled back", task_id).await?;
        }
        let applied_run_id = advice.applied_step_run_id.clone().ok_or_else(|| {
            Error::InvalidState {
                advice_id: advice_id.to_string(),
                action: "rolled back",
                reason: "no applied step run recorded".to_string(),
            }
        })?;

        let original = self.tools.ledger().get(&advice.step_run_id).await?;
        let mut draft = self
            .tools
            .ledger()
            .clone_run(&applied_run_id, &Default::default())
            .await?;
        draft.params = advice.pre_patch_params.clone();
        draft.code_identity = Some(original.code_identity);
        draft.origin = TaskOrigin::AdviceRollback {
            advice_id: advice_id.to_string(),
        };
        let task = self.tools.machine().create(draft).await?;

        let mut updated = advice.clone();
        updated.rollback_task_id = Some(task.task_id.clone());
        updated.updated_at = Utc::now();
        self.store_application(&updated, &advice, &task, "rolled back")
            .await?;

        self.audit(
            actor,
            "advice.rollback",
            advice_id,
            json!({"task_id": task.task_id, "applied_step_run_id": applied_run_id}),
        )
        .await;

        info!(advice_id = %advice_id, task_id = %task.task_id, "Advice rollback task created");
        Ok(ApplyReceipt {
            advice: updated,
            task,
        })
    }

    /// Refuse a new apply/rollback while the previous task may still win.
    async fn ensure_settled(
        &self,
        advice_id: &str,
        action: &'static str,
        task_id: &str,
    ) -> Result<()> {
        let task = self.tools.machine().get(task_id).await?;
        if !task.status.is_terminal() || task.status == TaskStatus::Succeeded {
            return Err(Error::InvalidState {
                advice_id: advice_id.to_string(),
                action,
                reason: format!("task {} is {}", task_id, task.status),
            });
        }
        Ok(())
    }

    /// Persist `updated` unless another writer got there first, in which
    /// case the freshly created task is canceled.
    async fn store_application(
        &self,
        updated: &Advice,
        expected: &Advice,
        task: &Task,
        action: &'static str,
    ) -> Result<()> {
        if self
            .persistence()
            .update_advice_application(updated, expected)
            .await?
        {
            return Ok(());
        }

        warn!(
            advice_id = %updated.advice_id,
            task_id = %task.task_id,
            "Advice modified concurrently, canceling spawned task"
        );
        if let Err(e) = self.tools.machine().cancel(&task.task_id).await {
            warn!(task_id = %task.task_id, error = %e, "Failed to cancel orphaned task");
        }
        Err(Error::InvalidState {
            advice_id: updated.advice_id.clone(),
            action,
            reason: "advice was modified concurrently".to_string(),
        })
    }

    // ========================================================================
    // Task completion
    // ========================================================================

    async fn record_result(
        &self,
        advice_id: &str,
        task: &Task,
        step_run: Option<&StepRun>,
        rollback: bool,
    ) -> Result<()> {
        let advice = self.get(advice_id).await?;
        let owner = if rollback {
            &advice.rollback_task_id
        } else {
            &advice.apply_task_id
        };
        if owner.as_deref() != Some(task.task_id.as_str()) {
            warn!(
                advice_id = %advice_id,
                task_id = %task.task_id,
                "Task no longer owns the advice, ignoring result"
            );
            return Ok(());
        }

        let actor = self.config.system_actor.clone();
        let (Some(run), TaskStatus::Succeeded) = (step_run, task.status) else {
            let action = if rollback {
                "advice.rollback_failed"
            } else {
                "advice.apply_failed"
            };
            self.audit(
                &actor,
                action,
                advice_id,
                json!({"task_id": task.task_id, "status": task.status}),
            )
            .await;
            return Ok(());
        };

        let mut updated = advice.clone();
        updated.updated_at = Utc::now();
        let action = if rollback {
            updated.application_state = ApplicationState::RolledBack;
            updated.rollback_step_run_id = Some(run.step_run_id.clone());
            "advice.rolled_back"
        } else {
            updated.application_state = ApplicationState::Applied;
            updated.applied_step_run_id = Some(run.step_run_id.clone());
            "advice.applied"
        };

        if !self
            .persistence()
            .update_advice_application(&updated, &advice)
            .await?
        {
            warn!(advice_id = %advice_id, "Advice changed while recording task result");
            return Ok(());
        }
        self.audit(
            &actor,
            action,
            advice_id,
            json!({"task_id": task.task_id, "step_run_id": run.step_run_id}),
        )
        .await;
        info!(
            advice_id = %advice_id,
            state = updated.application_state.as_str(),
            step_run_id = %run.step_run_id,
            "Advice application state updated"
        );
        Ok(())
    }

    /// Auto-advice and auto-apply for a freshly succeeded step run.
    async fn advise_new_run(&self, task: &Task, run: &StepRun) -> Result<()> {
        let actor = self.config.system_actor.clone();
        let generated = self.generate(&run.step_run_id, &actor).await?;

        // Runs produced by advice are not auto-applied again.
        let from_advice = matches!(
            task.origin,
            TaskOrigin::AdviceApply { .. } | TaskOrigin::AdviceRollback { .. }
        );
        if !self.config.auto_apply_low_risk || from_advice {
            return Ok(());
        }

        for advice in generated.iter().filter(|a| {
            a.risk_tier == RiskTier::Low && a.validation.state == ValidationState::DryRunPassed
        }) {
            let request = ApplyRequest {
                confirm: false,
                actor: actor.clone(),
            };
            match self.apply(&advice.advice_id, &request).await {
                Ok(receipt) => info!(
                    advice_id = %advice.advice_id,
                    task_id = %receipt.task.task_id,
                    "Low-risk advice auto-applied"
                ),
                Err(e) => warn!(advice_id = %advice.advice_id, error = %e, "Auto-apply failed"),
            }
        }
        Ok(())
    }
}

fn into_core(error: Error) -> CoreError {
    match error {
        Error::Core(e) => e,
        other => CoreError::internal(other),
    }
}

#[async_trait]
impl LifecycleHook for AdvicePipeline {
    fn name(&self) -> &'static str {
        "advice"
    }

    async fn on_task_finished(
        &self,
        task: &Task,
        step_run: Option<&StepRun>,
    ) -> assay_core::Result<()> {
        match &task.origin {
            TaskOrigin::AdviceApply { advice_id } => self
                .record_result(advice_id, task, step_run, false)
                .await
                .map_err(into_core)?,
            TaskOrigin::AdviceRollback { advice_id } => self
                .record_result(advice_id, task, step_run, true)
                .await
                .map_err(into_core)?,
            _ => {}
        }

        if self.config.auto_advice
            && let Some(run) = step_run
        {
            self.advise_new_run(task, run).await.map_err(into_core)?;
        }
        Ok(())
    }
}
