// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dry-run validation of patches.
//!
//! Pure functions: nothing here launches a runner, creates a task or
//! touches the ledger.

use assay_core::model::{Params, Patch, StepDefinition};
use serde::{Deserialize, Serialize};

/// What applying a patch would launch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DryRunReport {
    /// Parameters after merging the patch and resolving the current schema.
    pub resolved_params: Params,
    /// Code identity the patched task would run.
    pub code_identity: String,
    /// Schema version the patch was resolved against.
    pub schema_version: i64,
}

/// Resolve `patch` against the current definition of the step.
///
/// `base_params` and `base_code_identity` describe the advised step run.
/// Returns every reason the patch is unusable, joined, on failure.
pub fn validate(
    patch: &Patch,
    step: &StepDefinition,
    base_params: &Params,
    base_code_identity: &str,
) -> Result<DryRunReport, String> {
    let (params, code_identity) = match patch {
        Patch::ParamDelta(delta) => {
            if delta.is_empty() {
                return Err("param_delta changes nothing".to_string());
            }
            if let Some(key) = delta.set.keys().find(|k| delta.unset.contains(k)) {
                return Err(format!("{}: both set and unset", key));
            }
            (delta.apply_to(base_params), base_code_identity.to_string())
        }
        Patch::CodeDelta(code) => {
            if !step.allow_code_patches {
                return Err(format!(
                    "step '{}' does not accept code patches",
                    step.step_ref
                ));
            }
            if code.code_identity.trim().is_empty() {
                return Err("code_delta has an empty code identity".to_string());
            }
            if code.code_identity == base_code_identity {
                return Err(format!(
                    "code_delta targets the current code identity '{}'",
                    base_code_identity
                ));
            }
            if code.diff.trim().is_empty() {
                return Err("code_delta has an empty diff".to_string());
            }
            (base_params.clone(), code.code_identity.clone())
        }
    };

    let resolved_params = step
        .schema
        .resolve(&params)
        .map_err(|violations| violations.join("; "))?;

    Ok(DryRunReport {
        resolved_params,
        code_identity,
        schema_version: step.version,
    })
}
