// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tool surface shared by the agents and the HTTP API.
//!
//! | Tool | Effect |
//! |------|--------|
//! | [`get_metrics`](AdviceTools::get_metrics) | read-only |
//! | [`render_plot`](AdviceTools::render_plot) | stores one SVG artifact |
//! | [`suggest_threshold`] | pure |
//! | [`apply_patch`](AdviceTools::apply_patch) | dry run: none; otherwise creates one task |
//!
//! `apply_patch` goes through the same risk gate as applying advice: a
//! high-risk patch creates a task only with `confirm`.

use std::fmt::Write as _;
use std::sync::Arc;

use assay_core::model::{
    ArtifactRef, Metrics, Patch, RiskTier, StepDefinition, StepRun, Task, TaskOrigin,
};
use assay_core::{ArtifactStore, CoreError, StepRunLedger, TaskStateMachine};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::policy::{RiskAssessment, RiskPolicy};
use crate::validator::{self, DryRunReport};

/// What to plot.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PlotSpec {
    /// Metric keys to include; empty means every numeric metric.
    #[serde(default)]
    pub metrics: Vec<String>,
    #[serde(default)]
    pub title: Option<String>,
}

/// Which side of the distribution a threshold cuts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdDirection {
    /// Values below the threshold are filtered (`min_*` keys).
    Lower,
    /// Values above the threshold are filtered (`max_*` keys, fractions).
    Upper,
}

/// Robust threshold suggestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdSuggestion {
    pub metric_key: String,
    pub value: f64,
    /// In `[0, 1]`; grows with sample size and shrinks with dispersion.
    pub confidence: f64,
    pub direction: ThresholdDirection,
    pub median: f64,
    /// Scaled median absolute deviation.
    pub mad: f64,
    pub sample_size: usize,
}

/// Result of [`AdviceTools::apply_patch`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PatchOutcome {
    /// Dry run passed. `risk` tells whether applying needs confirmation.
    Validated {
        report: DryRunReport,
        risk: RiskAssessment,
    },
    /// Dry run failed.
    Rejected { reason: String, schema_version: i64 },
    /// Patch applied: a new PENDING task.
    Created { task: Box<Task> },
}

/// Number of scaled MADs between the median and a suggested cut.
const MAD_CUTOFF: f64 = 3.0;
/// Consistency constant making the MAD comparable to a standard deviation.
const MAD_SCALE: f64 = 1.4826;
/// Sample size at which size alone yields confidence 0.5.
const CONFIDENCE_HALF_SAMPLE: f64 = 20.0;

/// Suggest a filter threshold from an observed distribution using
/// median +/- 3 scaled MADs.
pub fn suggest_threshold(metric_key: &str, distribution: &[f64]) -> Result<ThresholdSuggestion> {
    let mut values: Vec<f64> = distribution.iter().copied().filter(|v| v.is_finite()).collect();
    if values.is_empty() {
        return Err(Error::InvalidInput(format!(
            "no finite values to suggest a threshold for '{}'",
            metric_key
        )));
    }

    let median = median_of(&mut values);
    let mut deviations: Vec<f64> = values.iter().map(|v| (v - median).abs()).collect();
    let mad = median_of(&mut deviations) * MAD_SCALE;

    let direction = direction_for(metric_key);
    let mut value = match direction {
        ThresholdDirection::Lower => (median - MAD_CUTOFF * mad).max(0.0),
        ThresholdDirection::Upper => median + MAD_CUTOFF * mad,
    };
    if values.iter().all(|v| v.fract() == 0.0) {
        value = value.round();
    }

    let n = values.len() as f64;
    let size_factor = n / (n + CONFIDENCE_HALF_SAMPLE);
    let spread = if median.abs() > f64::EPSILON {
        mad / median.abs()
    } else if mad > 0.0 {
        1.0
    } else {
        0.0
    };
    let confidence = (size_factor / (1.0 + spread)).clamp(0.0, 1.0);

    Ok(ThresholdSuggestion {
        metric_key: metric_key.to_string(),
        value,
        confidence,
        direction,
        median,
        mad,
        sample_size: values.len(),
    })
}

fn direction_for(metric_key: &str) -> ThresholdDirection {
    let key = metric_key.to_ascii_lowercase();
    if key.starts_with("max_") || key.contains("mito") || key.contains("doublet") {
        ThresholdDirection::Upper
    } else {
        ThresholdDirection::Lower
    }
}

fn median_of(values: &mut [f64]) -> f64 {
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

/// Agent tools bound to one state machine, ledger and store.
#[derive(Clone)]
pub struct AdviceTools {
    machine: TaskStateMachine,
    ledger: StepRunLedger,
    store: Arc<dyn ArtifactStore>,
    policy: RiskPolicy,
}

impl AdviceTools {
    pub fn new(
        machine: TaskStateMachine,
        ledger: StepRunLedger,
        store: Arc<dyn ArtifactStore>,
    ) -> Self {
        Self {
            machine,
            ledger,
            store,
            policy: RiskPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RiskPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &RiskPolicy {
        &self.policy
    }

    pub fn ledger(&self) -> &StepRunLedger {
        &self.ledger
    }

    pub fn machine(&self) -> &TaskStateMachine {
        &self.machine
    }

    pub async fn get_metrics(&self, step_run_id: &str) -> Result<Metrics> {
        Ok(self.ledger.get(step_run_id).await?.metrics)
    }

    /// Render a horizontal bar chart of numeric metrics as SVG and store it.
    pub async fn render_plot(&self, step_run_id: &str, spec: &PlotSpec) -> Result<ArtifactRef> {
        let run = self.ledger.get(step_run_id).await?;
        let bars: Vec<(String, f64)> = run
            .metrics
            .iter()
            .filter(|(key, _)| spec.metrics.is_empty() || spec.metrics.contains(key))
            .filter_map(|(key, value)| value.as_f64().map(|v| (key.clone(), v)))
            .collect();
        if bars.is_empty() {
            return Err(Error::InvalidInput(format!(
                "step run '{}' has no numeric metrics to plot",
                step_run_id
            )));
        }

        let title = spec
            .title
            .clone()
            .unwrap_or_else(|| format!("{} metrics ({})", run.step_ref, run.step_run_id));
        let svg = bar_chart_svg(&title, &bars);

        let mut artifact = self.store.put(svg.as_bytes(), "svg", None).await?;
        artifact.name = Some(format!("{}-metrics.svg", run.step_ref));
        info!(
            step_run_id = %step_run_id,
            hash = %artifact.hash,
            bars = bars.len(),
            "Rendered metrics plot"
        );
        Ok(artifact)
    }

    /// Validate `patch` against the step's current schema and, unless
    /// `dry_run`, create the patched task. High-risk patches need `confirm`.
    pub async fn apply_patch(
        &self,
        step_run_id: &str,
        patch: &Patch,
        dry_run: bool,
        confirm: bool,
    ) -> Result<PatchOutcome> {
        let origin = TaskOrigin::Clone {
            source_step_run_id: step_run_id.to_string(),
        };
        self.apply_patch_as(step_run_id, step_run_id, patch, dry_run, confirm, origin)
            .await
    }

    /// [`apply_patch`](Self::apply_patch) with a caller-chosen origin.
    /// `subject` names the refused entity in errors.
    pub(crate) async fn apply_patch_as(
        &self,
        subject: &str,
        step_run_id: &str,
        patch: &Patch,
        dry_run: bool,
        confirm: bool,
        origin: TaskOrigin,
    ) -> Result<PatchOutcome> {
        let run = self.ledger.get(step_run_id).await?;
        let (step, verdict) = self.dry_run(&run, patch).await?;
        let risk = self.policy.assess(patch, &step.schema, &run.params);

        let report = match verdict {
            Ok(report) if dry_run => return Ok(PatchOutcome::Validated { report, risk }),
            Ok(report) => report,
            Err(reason) if dry_run => {
                return Ok(PatchOutcome::Rejected {
                    reason,
                    schema_version: step.version,
                });
            }
            Err(reason) => {
                return Err(CoreError::ValidationRejected {
                    advice_id: subject.to_string(),
                    reason,
                }
                .into());
            }
        };

        if risk.tier == RiskTier::High && !confirm {
            info!(
                subject = %subject,
                reasons = ?risk.reasons,
                "High-risk patch refused without confirmation"
            );
            return Err(Error::ConfirmationRequired {
                subject: subject.to_string(),
            });
        }

        let mut draft = self.ledger.clone_run(step_run_id, &Default::default()).await?;
        draft.params = report.resolved_params;
        draft.code_identity = Some(report.code_identity);
        draft.origin = origin;

        let task = self.machine.create(draft).await?;
        Ok(PatchOutcome::Created {
            task: Box::new(task),
        })
    }

    /// Classify `patch` against the latest schema of the run's step.
    pub async fn assess(&self, run: &StepRun, patch: &Patch) -> Result<RiskAssessment> {
        let step = self.current_step(run).await?;
        Ok(self.policy.assess(patch, &step.schema, &run.params))
    }

    /// Resolve `patch` against the latest definition of the run's step.
    pub(crate) async fn dry_run(
        &self,
        run: &StepRun,
        patch: &Patch,
    ) -> Result<(StepDefinition, std::result::Result<DryRunReport, String>)> {
        let step = self.current_step(run).await?;
        let verdict = validator::validate(patch, &step, &run.params, &run.code_identity);
        Ok((step, verdict))
    }

    async fn current_step(&self, run: &StepRun) -> Result<StepDefinition> {
        Ok(self
            .machine
            .persistence()
            .get_step(&run.step_ref)
            .await?
            .ok_or_else(|| CoreError::not_found("step", &run.step_ref))?)
    }
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn bar_chart_svg(title: &str, bars: &[(String, f64)]) -> String {
    const WIDTH: f64 = 640.0;
    const LABEL: f64 = 220.0;
    const ROW: f64 = 28.0;
    const TOP: f64 = 40.0;

    let height = TOP + ROW * bars.len() as f64 + 10.0;
    let scale = bars
        .iter()
        .map(|(_, v)| v.abs())
        .fold(0.0_f64, f64::max)
        .max(f64::EPSILON);
    let plot_width = WIDTH - LABEL - 80.0;

    let mut svg = String::new();
    let _ = writeln!(
        svg,
        concat!(
            r#"<svg xmlns="http://www.w3.org/2000/svg" width="{w}" height="{h}" "#,
            r#"viewBox="0 0 {w} {h}">"#
        ),
        w = WIDTH,
        h = height
    );
    let _ = writeln!(
        svg,
        r#"<text x="10" y="24" font-family="sans-serif" font-size="16">{}</text>"#,
        xml_escape(title)
    );
    for (i, (label, value)) in bars.iter().enumerate() {
        let y = TOP + ROW * i as f64;
        let width = (value.abs() / scale * plot_width).max(1.0);
        let fill = if *value < 0.0 { "#c0504d" } else { "#4f81bd" };
        let _ = writeln!(
            svg,
            r#"<text x="10" y="{:.1}" font-family="sans-serif" font-size="12">{}</text>"#,
            y + 16.0,
            xml_escape(label)
        );
        let _ = writeln!(
            svg,
            r#"<rect x="{LABEL}" y="{:.1}" width="{:.1}" height="20" fill="{}"/>"#,
            y + 2.0,
            width,
            fill
        );
        let _ = writeln!(
            svg,
            r#"<text x="{:.1}" y="{:.1}" font-family="sans-serif" font-size="12">{}</text>"#,
            LABEL + width + 6.0,
            y + 16.0,
            format_value(*value)
        );
    }
    svg.push_str("</svg>\n");
    svg
}

fn format_value(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{:.3}", value)
    }
}
