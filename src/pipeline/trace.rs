//! Per-invocation execution traces
//!
//! A small JSON file per run under `~/.sbkube/runs/`, separate from the
//! state store: it records which apps finished which stages so
//! `--retry-failed` and `--resume` can pick up an interrupted invocation.
//! A trace is only reusable while the normalized configuration hash matches.

use crate::config::model::UnifiedConfig;
use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    Success,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunTrace {
    pub run_id: String,
    pub workspace_root: String,
    pub group: String,
    pub config_hash: String,
    pub started_at: String,
    /// app -> stage -> outcome
    pub stages: BTreeMap<String, BTreeMap<String, TraceStatus>>,
}

impl RunTrace {
    pub fn new(workspace_root: &Path, group: &str, config_hash: &str) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            workspace_root: workspace_root.display().to_string(),
            group: group.to_string(),
            config_hash: config_hash.to_string(),
            started_at: Utc::now().to_rfc3339(),
            stages: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, app: &str, stage: &str, status: TraceStatus) {
        self.stages
            .entry(app.to_string())
            .or_default()
            .insert(stage.to_string(), status);
    }

    pub fn status_of(&self, app: &str, stage: &str) -> Option<TraceStatus> {
        self.stages.get(app).and_then(|s| s.get(stage)).copied()
    }

    /// Persist under the runs directory. Trace IO must never fail a
    /// deployment; callers log and continue on error.
    pub fn save(&self) -> Result<()> {
        let path = crate::utils::paths::runs_dir()?.join(format!("{}.json", self.run_id));
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json)
            .with_context(|| format!("failed to write run trace {}", path.display()))?;
        Ok(())
    }

    /// Most recent trace for this workspace/group whose config hash still
    /// matches. A changed configuration invalidates old traces.
    pub fn load_latest(workspace_root: &Path, group: &str, config_hash: &str) -> Option<RunTrace> {
        let dir = crate::utils::paths::runs_dir().ok()?;
        let root = workspace_root.display().to_string();
        let mut best: Option<RunTrace> = None;
        for entry in std::fs::read_dir(dir).ok()? {
            let entry = entry.ok()?;
            let Ok(content) = std::fs::read_to_string(entry.path()) else {
                continue;
            };
            let Ok(trace) = serde_json::from_str::<RunTrace>(&content) else {
                continue;
            };
            if trace.workspace_root != root || trace.group != group {
                continue;
            }
            if trace.config_hash != config_hash {
                continue;
            }
            if best
                .as_ref()
                .map_or(true, |b| trace.started_at > b.started_at)
            {
                best = Some(trace);
            }
        }
        best
    }
}

/// Stable hash of the normalized configuration.
pub fn config_hash(config: &UnifiedConfig) -> String {
    let json = serde_json::to_string(config).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::parse_unified;

    #[test]
    fn test_record_and_query() {
        let mut trace = RunTrace::new(Path::new("/ws"), "root", "abc");
        trace.record("redis", "deploy", TraceStatus::Failed);
        trace.record("web", "deploy", TraceStatus::Success);
        assert_eq!(trace.status_of("redis", "deploy"), Some(TraceStatus::Failed));
        assert_eq!(trace.status_of("web", "deploy"), Some(TraceStatus::Success));
        assert_eq!(trace.status_of("web", "prepare"), None);
        assert_eq!(trace.status_of("ghost", "deploy"), None);
    }

    #[test]
    fn test_config_hash_changes_with_content() {
        let a = parse_unified("apiVersion: sbkube/v1\napps:\n  a: {type: noop}\n").unwrap();
        let b = parse_unified("apiVersion: sbkube/v1\napps:\n  b: {type: noop}\n").unwrap();
        assert_ne!(config_hash(&a), config_hash(&b));
        assert_eq!(config_hash(&a), config_hash(&a));
    }

    #[test]
    fn test_trace_serialization_roundtrip() {
        let mut trace = RunTrace::new(Path::new("/ws"), "root", "abc");
        trace.record("redis", "prepare", TraceStatus::Success);
        let json = serde_json::to_string(&trace).unwrap();
        let back: RunTrace = serde_json::from_str(&json).unwrap();
        assert_eq!(back.run_id, trace.run_id);
        assert_eq!(back.status_of("redis", "prepare"), Some(TraceStatus::Success));
    }
}
