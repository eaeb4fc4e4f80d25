// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for assay-server.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use assay_advice::{AdviceConfig, BackendConfig};
use assay_environment::{ArtifactGcConfig, ExecutorConfig, HeartbeatMonitorConfig};

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite URL of the task/ledger/advice database
    pub database_url: String,
    /// Root of the artifact store and run directories
    pub data_dir: PathBuf,
    /// HTTP listen address
    pub http_addr: SocketAddr,
    /// Base URL used in status, stream and signed download links
    pub public_url: String,
    /// HMAC key for signed artifact URLs
    pub signing_key: String,
    pub workers: usize,
    pub liveness_timeout: Duration,
    pub execution_timeout: Duration,
    pub cancel_grace: Duration,
    pub diagnostic_tail_lines: usize,
    pub subscriber_backlog: usize,
    pub advice_backend: BackendConfig,
    pub auto_advice: bool,
    pub auto_apply_low_risk: bool,
    pub signed_url_ttl: Duration,
    pub artifact_gc_enabled: bool,
    pub artifact_gc_interval: Duration,
    /// Minimum age of an unreferenced blob before GC deletes it
    pub artifact_retention: Duration,
    /// Runner registered for the built-in single-cell steps, if any
    pub runner_command: Option<String>,
    pub runner_code_identity: String,
}

impl Config {
    /// Load `.env` if present, then read the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_env()
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url =
            var("ASSAY_DATABASE_URL").unwrap_or_else(|| "sqlite://assay.db?mode=rwc".to_string());
        let data_dir = PathBuf::from(var("ASSAY_DATA_DIR").unwrap_or_else(|| ".data".to_string()));

        let port: u16 = parse("ASSAY_HTTP_PORT", 8080)?;
        let http_addr = SocketAddr::from(([0, 0, 0, 0], port));
        let public_url = var("ASSAY_PUBLIC_URL")
            .unwrap_or_else(|| format!("http://localhost:{}", port))
            .trim_end_matches('/')
            .to_string();

        let signing_key =
            var("ASSAY_SIGNING_KEY").ok_or(ConfigError::MissingEnvVar("ASSAY_SIGNING_KEY"))?;

        let workers: usize = parse("ASSAY_WORKERS", 2)?;
        if workers == 0 {
            return Err(ConfigError::Invalid {
                name: "ASSAY_WORKERS",
                reason: "must be at least 1".to_string(),
            });
        }

        let advice_timeout = secs("ASSAY_ADVICE_TIMEOUT_SECS", 30)?;
        let backend_name = var("ASSAY_ADVICE_BACKEND").unwrap_or_else(|| "rules".to_string());
        let advice_endpoint = var("ASSAY_ADVICE_ENDPOINT");
        if backend_name.trim().eq_ignore_ascii_case("http") && advice_endpoint.is_none() {
            return Err(ConfigError::MissingEnvVar("ASSAY_ADVICE_ENDPOINT"));
        }
        let advice_backend =
            BackendConfig::from_name(&backend_name, advice_endpoint.as_deref(), advice_timeout)
                .map_err(|e| ConfigError::Invalid {
                    name: "ASSAY_ADVICE_BACKEND",
                    reason: e.to_string(),
                })?;

        Ok(Self {
            database_url,
            data_dir,
            http_addr,
            public_url,
            signing_key,
            workers,
            liveness_timeout: secs("ASSAY_LIVENESS_TIMEOUT_SECS", 60)?,
            execution_timeout: secs("ASSAY_EXECUTION_TIMEOUT_SECS", 1800)?,
            cancel_grace: secs("ASSAY_CANCEL_GRACE_SECS", 10)?,
            diagnostic_tail_lines: parse("ASSAY_DIAGNOSTIC_TAIL_LINES", 50)?,
            subscriber_backlog: parse("ASSAY_SUBSCRIBER_BACKLOG", 256)?,
            advice_backend,
            auto_advice: flag("ASSAY_AUTO_ADVICE", true)?,
            auto_apply_low_risk: flag("ASSAY_AUTO_APPLY_LOW_RISK", false)?,
            signed_url_ttl: secs("ASSAY_SIGNED_URL_TTL_SECS", 3600)?,
            artifact_gc_enabled: flag("ASSAY_ARTIFACT_GC_ENABLED", false)?,
            artifact_gc_interval: secs("ASSAY_ARTIFACT_GC_INTERVAL_SECS", 6 * 3600)?,
            artifact_retention: secs("ASSAY_ARTIFACT_RETENTION_SECS", 7 * 24 * 3600)?,
            runner_command: var("ASSAY_RUNNER_COMMAND"),
            runner_code_identity: var("ASSAY_RUNNER_CODE_IDENTITY")
                .unwrap_or_else(|| "unversioned".to_string()),
        })
    }

    pub fn executor(&self) -> ExecutorConfig {
        ExecutorConfig {
            data_dir: self.data_dir.clone(),
            liveness_timeout: self.liveness_timeout,
            execution_timeout: self.execution_timeout,
            cancel_grace: self.cancel_grace,
            diagnostic_tail_lines: self.diagnostic_tail_lines,
            ..Default::default()
        }
    }

    pub fn heartbeat(&self) -> HeartbeatMonitorConfig {
        HeartbeatMonitorConfig {
            heartbeat_timeout: self.liveness_timeout,
            cancel_grace: self.cancel_grace,
            ..Default::default()
        }
    }

    pub fn artifact_gc(&self) -> ArtifactGcConfig {
        ArtifactGcConfig {
            enabled: self.artifact_gc_enabled,
            poll_interval: self.artifact_gc_interval,
            retention: self.artifact_retention,
        }
    }

    pub fn advice(&self) -> AdviceConfig {
        AdviceConfig {
            backend: self.advice_backend.clone(),
            auto_advice: self.auto_advice,
            auto_apply_low_risk: self.auto_apply_low_risk,
            ..Default::default()
        }
    }
}

/// Non-empty value of an environment variable.
fn var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match var(name) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
            name,
            reason: format!("cannot parse '{}'", raw),
        }),
    }
}

fn secs(name: &'static str, default: u64) -> Result<Duration, ConfigError> {
    parse(name, default).map(Duration::from_secs)
}

fn flag(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match var(name).map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) if v == "true" || v == "1" => Ok(true),
        Some(v) if v == "false" || v == "0" => Ok(false),
        Some(v) => Err(ConfigError::Invalid {
            name,
            reason: format!("expected true/false, got '{}'", v),
        }),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// A variable is set but unusable.
    #[error("Invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}
