// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runner contract files.
//!
//! Every task runs in its own directory:
//!
//! ```text
//! <data_dir>/runs/<task_id>/
//! ├── inputs.json    {artifact_refs: [uri], params: {...}, reference: {...}}
//! ├── params.json    flat key → value mapping
//! ├── outputs.json   written by the runner on exit
//! └── cancel         created when cancellation is requested
//! ```
//!
//! While running, the worker prints one JSON object per stdout line:
//! `{"phase": "...", "progress": 0.4, "message": "...", "ts": "..."}`.

use std::path::{Path, PathBuf};

use assay_core::model::{Metrics, Params};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncReadExt;

pub const INPUTS_FILE: &str = "inputs.json";
pub const PARAMS_FILE: &str = "params.json";
pub const OUTPUTS_FILE: &str = "outputs.json";
pub const CANCEL_FILE: &str = "cancel";

/// Contract violations by the worker.
#[derive(Debug, Error)]
pub enum ContractError {
    /// A progress line or outputs file did not match the contract.
    #[error("malformed {what}: {reason}")]
    Malformed { what: &'static str, reason: String },

    /// The runner exited successfully without writing `outputs.json`.
    #[error("missing {0}")]
    Missing(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Contents of `inputs.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputsFile {
    pub artifact_refs: Vec<String>,
    pub params: Params,
    pub reference: Value,
}

/// One structured stdout line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressLine {
    pub phase: String,
    pub progress: f64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub ts: Option<DateTime<Utc>>,
    /// Interim metrics, published as metric events.
    #[serde(default, skip_serializing_if = "Metrics::is_empty")]
    pub metrics: Metrics,
}

impl ProgressLine {
    pub fn parse(line: &str) -> Result<Self, ContractError> {
        let parsed: ProgressLine =
            serde_json::from_str(line.trim()).map_err(|e| ContractError::Malformed {
                what: "progress line",
                reason: e.to_string(),
            })?;

        if parsed.phase.trim().is_empty() {
            return Err(ContractError::Malformed {
                what: "progress line",
                reason: "empty phase".to_string(),
            });
        }
        if !parsed.progress.is_finite() || !(0.0..=1.0).contains(&parsed.progress) {
            return Err(ContractError::Malformed {
                what: "progress line",
                reason: format!("progress {} outside [0, 1]", parsed.progress),
            });
        }
        Ok(parsed)
    }
}

/// An artifact declared in `outputs.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeclaredArtifact {
    /// `file://` URI or a path relative to the run directory.
    pub uri: String,
    pub hash: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl DeclaredArtifact {
    pub fn resolve_path(&self, run_dir: &Path) -> PathBuf {
        let raw = self.uri.strip_prefix("file://").unwrap_or(&self.uri);
        let path = Path::new(raw);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            run_dir.join(path)
        }
    }
}

/// Contents of `outputs.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputsFile {
    #[serde(default)]
    pub artifacts: Vec<DeclaredArtifact>,
    #[serde(default)]
    pub metrics: Metrics,
    #[serde(default)]
    pub evidence: Value,
}

/// Write `inputs.json` and `params.json` into `run_dir`.
pub async fn write_inputs(run_dir: &Path, inputs: &InputsFile) -> Result<(), ContractError> {
    let inputs_json = serde_json::to_vec_pretty(inputs).map_err(|e| ContractError::Malformed {
        what: INPUTS_FILE,
        reason: e.to_string(),
    })?;
    let params_json =
        serde_json::to_vec_pretty(&inputs.params).map_err(|e| ContractError::Malformed {
            what: PARAMS_FILE,
            reason: e.to_string(),
        })?;

    tokio::fs::write(run_dir.join(INPUTS_FILE), inputs_json).await?;
    tokio::fs::write(run_dir.join(PARAMS_FILE), params_json).await?;
    Ok(())
}

/// Read `outputs.json` from `run_dir`.
pub async fn read_outputs(run_dir: &Path) -> Result<OutputsFile, ContractError> {
    let path = run_dir.join(OUTPUTS_FILE);
    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ContractError::Missing(path));
        }
        Err(e) => return Err(e.into()),
    };

    serde_json::from_slice(&bytes).map_err(|e| ContractError::Malformed {
        what: OUTPUTS_FILE,
        reason: e.to_string(),
    })
}

/// SHA-256 of a file, read in chunks.
pub async fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_progress_line() {
        let line = ProgressLine::parse(
            r#"{"phase":"filtering","progress":0.4,"message":"ok","ts":"2025-03-01T10:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(line.phase, "filtering");
        assert_eq!(line.progress, 0.4);
        assert!(line.ts.is_some());
        assert!(line.metrics.is_empty());
    }

    #[test]
    fn test_parse_progress_line_with_metrics() {
        let line =
            ProgressLine::parse(r#"{"phase":"qc","progress":1.0,"metrics":{"n_cells":1200}}"#)
                .unwrap();
        assert_eq!(line.metrics["n_cells"], json!(1200));
        assert_eq!(line.message, "");
    }

    #[test]
    fn test_reject_malformed_progress_lines() {
        for line in [
            "not json",
            "{}",
            r#"{"phase":"","progress":0.1}"#,
            r#"{"phase":"qc","progress":1.5}"#,
            r#"{"phase":"qc","progress":-0.1}"#,
            r#"{"phase":"qc","progress":"half"}"#,
        ] {
            assert!(ProgressLine::parse(line).is_err(), "accepted {line}");
        }
    }

    #[test]
    fn test_resolve_artifact_paths() {
        let run_dir = Path::new("/data/runs/t1");
        let relative = DeclaredArtifact {
            uri: "out/filtered.h5ad".into(),
            hash: "x".into(),
            kind: "h5ad".into(),
        };
        let uri = DeclaredArtifact {
            uri: "file:///tmp/plot.png".into(),
            ..relative.clone()
        };
        assert_eq!(
            relative.resolve_path(run_dir),
            PathBuf::from("/data/runs/t1/out/filtered.h5ad")
        );
        assert_eq!(uri.resolve_path(run_dir), PathBuf::from("/tmp/plot.png"));
    }

    #[tokio::test]
    async fn test_write_inputs_and_read_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let inputs = InputsFile {
            artifact_refs: vec!["file:///blobs/ab/abc".into()],
            params: serde_json::from_value(json!({"min_genes": 200})).unwrap(),
            reference: json!({"genome": "GRCh38"}),
        };
        write_inputs(dir.path(), &inputs).await.unwrap();

        let params: Value =
            serde_json::from_slice(&std::fs::read(dir.path().join(PARAMS_FILE)).unwrap()).unwrap();
        assert_eq!(params, json!({"min_genes": 200}));
        let read: InputsFile =
            serde_json::from_slice(&std::fs::read(dir.path().join(INPUTS_FILE)).unwrap()).unwrap();
        assert_eq!(read, inputs);

        assert!(matches!(
            read_outputs(dir.path()).await,
            Err(ContractError::Missing(_))
        ));

        std::fs::write(
            dir.path().join(OUTPUTS_FILE),
            r#"{"artifacts":[{"uri":"a.csv","hash":"h","type":"csv"}],"metrics":{"n_cells":10}}"#,
        )
        .unwrap();
        let outputs = read_outputs(dir.path()).await.unwrap();
        assert_eq!(outputs.artifacts[0].kind, "csv");
        assert_eq!(outputs.metrics["n_cells"], json!(10));
        assert_eq!(outputs.evidence, Value::Null);
    }

    #[tokio::test]
    async fn test_hash_file_matches_sha256() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"hello").unwrap();
        assert_eq!(
            hash_file(&path).await.unwrap(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }
}
