// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Step definitions and their declared parameter schemas.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use super::Params;

/// Type constraint of a single parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParamKind {
    /// Whole number.
    Integer,
    /// Any finite number.
    Number,
    /// Free text.
    String,
    /// true/false.
    Boolean,
    /// One of a fixed set of strings.
    Enum {
        /// Allowed values.
        values: Vec<String>,
    },
}

impl ParamKind {
    fn name(&self) -> &'static str {
        match self {
            Self::Integer => "integer",
            Self::Number => "number",
            Self::String => "string",
            Self::Boolean => "boolean",
            Self::Enum { .. } => "enum",
        }
    }

    fn is_numeric(&self) -> bool {
        matches!(self, Self::Integer | Self::Number)
    }
}

/// Declared constraints of one parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    /// Type constraint.
    #[serde(flatten)]
    pub kind: ParamKind,
    /// Must be supplied when no default exists.
    #[serde(default)]
    pub required: bool,
    /// Inclusive lower bound (numeric kinds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    /// Inclusive upper bound (numeric kinds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
    /// Value used when the key is absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Changing it discards data (filters); drives the risk policy.
    #[serde(default)]
    pub destructive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ParamSpec {
    /// Spec of the given kind with no constraints.
    pub fn new(kind: ParamKind) -> Self {
        Self {
            kind,
            required: false,
            minimum: None,
            maximum: None,
            default: None,
            destructive: false,
            description: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn min(mut self, minimum: f64) -> Self {
        self.minimum = Some(minimum);
        self
    }

    pub fn max(mut self, maximum: f64) -> Self {
        self.maximum = Some(maximum);
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn destructive(mut self) -> Self {
        self.destructive = true;
        self
    }

    /// Coerce and check one value. Returns the normalized value.
    pub fn check(&self, name: &str, value: &Value) -> Result<Value, String> {
        let value = coerce(&self.kind, value);
        match (&self.kind, &value) {
            (ParamKind::Integer, Value::Number(n)) if n.is_i64() || n.is_u64() => {}
            (ParamKind::Integer, Value::Number(n)) => {
                return match n.as_f64() {
                    Some(f) if f.fract() == 0.0 && f.is_finite() => {
                        self.check(name, &Value::from(f as i64))
                    }
                    _ => Err(format!("{}: expected integer, got {}", name, value)),
                };
            }
            (ParamKind::Number, Value::Number(_)) => {}
            (ParamKind::String, Value::String(_)) => {}
            (ParamKind::Boolean, Value::Bool(_)) => {}
            (ParamKind::Enum { values }, Value::String(s)) => {
                if !values.iter().any(|v| v == s) {
                    return Err(format!(
                        "{}: '{}' is not one of [{}]",
                        name,
                        s,
                        values.join(", ")
                    ));
                }
            }
            _ => {
                return Err(format!(
                    "{}: expected {}, got {}",
                    name,
                    self.kind.name(),
                    value
                ));
            }
        }

        if self.kind.is_numeric()
            && let Some(n) = value.as_f64()
        {
            if let Some(min) = self.minimum
                && n < min
            {
                return Err(format!("{}: {} is below minimum {}", name, n, min));
            }
            if let Some(max) = self.maximum
                && n > max
            {
                return Err(format!("{}: {} is above maximum {}", name, n, max));
            }
        }

        Ok(value)
    }
}

/// String-encoded numbers and booleans are accepted for their typed kinds.
fn coerce(kind: &ParamKind, value: &Value) -> Value {
    let Value::String(s) = value else {
        return value.clone();
    };
    let trimmed = s.trim();
    match kind {
        ParamKind::Integer => trimmed
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| value.clone()),
        ParamKind::Number => trimmed
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| value.clone()),
        ParamKind::Boolean => match trimmed.to_ascii_lowercase().as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => value.clone(),
        },
        _ => value.clone(),
    }
}

/// Parameter schema declared by a step.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamSchema {
    pub params: BTreeMap<String, ParamSpec>,
}

impl ParamSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a parameter (builder style).
    pub fn with(mut self, name: impl Into<String>, spec: ParamSpec) -> Self {
        self.params.insert(name.into(), spec);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ParamSpec> {
        self.params.get(name)
    }

    /// Validate `params` and return the resolved set with defaults filled in.
    ///
    /// All violations are collected; unknown keys are rejected.
    pub fn resolve(&self, params: &Params) -> Result<Params, Vec<String>> {
        let mut violations = Vec::new();
        let mut resolved = Params::new();

        for key in params.keys() {
            if !self.params.contains_key(key) {
                violations.push(format!("{}: unknown parameter", key));
            }
        }

        for (name, spec) in &self.params {
            match params.get(name) {
                Some(Value::Null) | None => {
                    if let Some(default) = &spec.default {
                        resolved.insert(name.clone(), default.clone());
                    } else if spec.required {
                        violations.push(format!("{}: required", name));
                    }
                }
                Some(value) => match spec.check(name, value) {
                    Ok(v) => {
                        resolved.insert(name.clone(), v);
                    }
                    Err(e) => violations.push(e),
                },
            }
        }

        if violations.is_empty() {
            Ok(resolved)
        } else {
            Err(violations)
        }
    }
}

/// A registered analysis step: an opaque runner plus its declared contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Stable step reference ("qc", "pca", ...).
    pub step_ref: String,
    /// Schema version, bumped on every change of the definition.
    #[serde(default)]
    pub version: i64,
    /// Program and arguments launched for every task.
    pub command: Vec<String>,
    /// Content hash or version tag of the runner code.
    pub code_identity: String,
    /// Whether code-level patches may target this step.
    #[serde(default)]
    pub allow_code_patches: bool,
    /// Metric keys every successful run is expected to report.
    #[serde(default)]
    pub metrics: Vec<String>,
    /// Declared parameter schema.
    #[serde(default)]
    pub schema: ParamSchema,
    #[serde(default = "Utc::now")]
    pub registered_at: DateTime<Utc>,
}

impl StepDefinition {
    /// Whether two definitions describe the same contract (ignores version and timestamp).
    pub fn same_contract(&self, other: &StepDefinition) -> bool {
        self.command == other.command
            && self.code_identity == other.code_identity
            && self.allow_code_patches == other.allow_code_patches
            && self.metrics == other.metrics
            && self.schema == other.schema
    }
}
