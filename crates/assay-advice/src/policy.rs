// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Declared risk policy.
//!
//! Risk tiers come from this table only, never from a backend:
//!
//! | Change | Tier |
//! |--------|------|
//! | code delta | high |
//! | sets or resets a destructive filter key | high |
//! | resets any key to its default | high |
//! | numeric change within `max_relative_nudge` | low |
//! | numeric change beyond `max_relative_nudge` | high |
//! | categorical/boolean change, or no baseline value | high |
//!
//! A patch is high-risk if any single change is.

use std::collections::BTreeSet;

use assay_core::model::{ParamSchema, Params, Patch, RiskTier};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskPolicy {
    /// Largest relative change of a numeric parameter that is still a nudge.
    pub max_relative_nudge: f64,
    /// Keys treated as destructive in addition to the schema's own flags.
    pub destructive_keys: BTreeSet<String>,
}

impl Default for RiskPolicy {
    fn default() -> Self {
        Self {
            max_relative_nudge: 0.5,
            destructive_keys: BTreeSet::new(),
        }
    }
}

/// Tier plus the rule hits that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub tier: RiskTier,
    pub reasons: Vec<String>,
}

impl RiskPolicy {
    fn is_destructive(&self, schema: &ParamSchema, key: &str) -> bool {
        self.destructive_keys.contains(key) || schema.get(key).is_some_and(|s| s.destructive)
    }

    /// Classify `patch` against the parameters it would modify.
    pub fn assess(&self, patch: &Patch, schema: &ParamSchema, current: &Params) -> RiskAssessment {
        let delta = match patch {
            Patch::CodeDelta(code) => {
                return RiskAssessment {
                    tier: RiskTier::High,
                    reasons: vec![format!("code change to '{}'", code.code_identity)],
                };
            }
            Patch::ParamDelta(delta) => delta,
        };

        let mut high = Vec::new();
        let mut low = Vec::new();

        for key in &delta.unset {
            high.push(format!("{}: reset to default", key));
        }

        for (key, new) in &delta.set {
            if self.is_destructive(schema, key) {
                high.push(format!("{}: destructive filter", key));
                continue;
            }

            let old = current
                .get(key)
                .or_else(|| schema.get(key).and_then(|s| s.default.as_ref()));

            match old {
                Some(old) if old == new => {}
                Some(old) => match (old.as_f64(), new.as_f64()) {
                    (Some(a), Some(b)) => {
                        let relative = relative_change(a, b);
                        if relative <= self.max_relative_nudge {
                            low.push(format!("{}: numeric nudge of {:.0}%", key, relative * 100.0));
                        } else {
                            high.push(format!(
                                "{}: numeric change of {:.0}% exceeds {:.0}%",
                                key,
                                relative * 100.0,
                                self.max_relative_nudge * 100.0
                            ));
                        }
                    }
                    _ => high.push(format!("{}: {} -> {}", key, display(old), display(new))),
                },
                None => high.push(format!("{}: no baseline value", key)),
            }
        }

        if high.is_empty() {
            RiskAssessment {
                tier: RiskTier::Low,
                reasons: low,
            }
        } else {
            RiskAssessment {
                tier: RiskTier::High,
                reasons: high,
            }
        }
    }
}

fn relative_change(old: f64, new: f64) -> f64 {
    if old == 0.0 {
        if new == 0.0 { 0.0 } else { f64::INFINITY }
    } else {
        ((new - old) / old).abs()
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
