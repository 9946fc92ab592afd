//! Audit logging for parameter edits and builds
//!
//! Writes JSON lines to `~/.local/state/fretforge/audit.log`. Every line
//! carries the id of the run that wrote it, so interleaved runs can be told
//! apart.

use crate::config::{schema::Config, ConfigManager};
use crate::invalidate::ParamChange;
use crate::scheduler::BuildReport;
use chrono::Utc;
use std::path::PathBuf;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::warn;
use uuid::Uuid;

/// File-based audit logger that appends JSON lines
pub struct AuditLog {
    enabled: bool,
    path: PathBuf,
    run_id: Uuid,
}

impl AuditLog {
    /// Create a new audit logger from config
    pub fn new(config: &Config) -> Self {
        Self {
            enabled: config.general.audit_log,
            path: ConfigManager::audit_log_path(),
            run_id: Uuid::new_v4(),
        }
    }

    /// Id stamped on every line this logger writes
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Record an applied parameter batch
    pub async fn params_applied(&self, change: &ParamChange) {
        if change.is_noop() {
            return;
        }
        self.log(
            "params.applied",
            &serde_json::json!({
                "version": change.version,
                "changed": change.changed,
                "dirtied": change.dirtied,
            }),
        )
        .await;
    }

    /// Record the outcome of a build request
    pub async fn build_finished<S>(&self, report: &BuildReport<S>) {
        let fingerprint = report.result.as_ref().ok().map(|lease| lease.fingerprint());
        let error = report.result.as_ref().err().map(ToString::to_string);
        self.log(
            "build.finished",
            &serde_json::json!({
                "root": report.root,
                "ok": error.is_none(),
                "fingerprint": fingerprint,
                "error": error,
                "params_version": report.params_version,
                "passes": report.passes,
                "elapsed_ms": u64::try_from(report.elapsed.as_millis()).unwrap_or(u64::MAX),
                "nodes": report.nodes,
            }),
        )
        .await;
    }

    /// Log an audit event as a JSON line
    ///
    /// Drops events on IO failure; a broken log never fails a build.
    pub async fn log(&self, event: &str, data: &serde_json::Value) {
        if !self.enabled {
            return;
        }

        let entry = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "run": self.run_id,
            "event": event,
            "data": data,
        });

        let mut line = match serde_json::to_string(&entry) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to serialize audit event: {}", e);
                return;
            }
        };
        line.push('\n');

        if let Err(e) = self.append(&line).await {
            warn!("Failed to write audit log: {}", e);
        }
    }

    async fn append(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;

        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::ManifestKernel;
    use crate::pipeline::{Pipeline, PipelineOptions};
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn test_audit_log(dir: &TempDir, enabled: bool) -> AuditLog {
        AuditLog {
            enabled,
            path: dir.path().join("audit.log"),
            run_id: Uuid::new_v4(),
        }
    }

    async fn read_lines(audit: &AuditLog) -> Vec<serde_json::Value> {
        let content = tokio::fs::read_to_string(&audit.path).await.unwrap();
        content
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn writes_param_batch() {
        let dir = TempDir::new().unwrap();
        let audit = test_audit_log(&dir, true);

        audit
            .params_applied(&ParamChange {
                version: 4,
                changed: vec!["headStock.angle".to_string()],
                dirtied: BTreeSet::from(["headstock".to_string(), "assembly".to_string()]),
            })
            .await;

        let lines = read_lines(&audit).await;
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["event"], "params.applied");
        assert_eq!(lines[0]["data"]["version"], 4);
        assert_eq!(lines[0]["run"], audit.run_id().to_string());
        assert!(lines[0]["timestamp"].is_string());
    }

    #[tokio::test]
    async fn noop_batch_not_logged() {
        let dir = TempDir::new().unwrap();
        let audit = test_audit_log(&dir, true);

        audit.params_applied(&ParamChange::default()).await;
        assert!(!audit.path.exists());
    }

    #[tokio::test]
    async fn writes_build_outcome() {
        let dir = TempDir::new().unwrap();
        let audit = test_audit_log(&dir, true);
        let pipeline =
            Pipeline::for_instrument(ManifestKernel::new(), PipelineOptions::default()).unwrap();

        let report = pipeline.request_report("bridge").await.unwrap();
        audit.build_finished(&report).await;
        audit.log("event.two", &serde_json::json!({})).await;

        let lines = read_lines(&audit).await;
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "build.finished");
        assert_eq!(lines[0]["data"]["root"], "bridge");
        assert_eq!(lines[0]["data"]["ok"], true);
        assert_eq!(lines[0]["data"]["nodes"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn skips_when_disabled() {
        let dir = TempDir::new().unwrap();
        let audit = test_audit_log(&dir, false);

        audit.log("should.not.appear", &serde_json::json!({})).await;

        assert!(!audit.path.exists());
    }
}
