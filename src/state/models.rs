//! State store entities: one row type per table

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Terminal and in-flight states of a Deployment (and its apps).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    InProgress,
    Success,
    Failed,
    RolledBack,
    PartiallyFailed,
    /// App-level only: skipped because a dependency failed.
    Skipped,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::InProgress => "in_progress",
            DeploymentStatus::Success => "success",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::RolledBack => "rolled_back",
            DeploymentStatus::PartiallyFailed => "partially_failed",
            DeploymentStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeploymentStatus::Pending),
            "in_progress" => Ok(DeploymentStatus::InProgress),
            "success" => Ok(DeploymentStatus::Success),
            "failed" => Ok(DeploymentStatus::Failed),
            "rolled_back" => Ok(DeploymentStatus::RolledBack),
            "partially_failed" => Ok(DeploymentStatus::PartiallyFailed),
            "skipped" => Ok(DeploymentStatus::Skipped),
            other => Err(format!("unknown deployment status '{}'", other)),
        }
    }
}

/// How a resource was mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceAction {
    Create,
    Update,
    Delete,
    Apply,
    Rollback,
}

impl ResourceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceAction::Create => "create",
            ResourceAction::Update => "update",
            ResourceAction::Delete => "delete",
            ResourceAction::Apply => "apply",
            ResourceAction::Rollback => "rollback",
        }
    }
}

impl fmt::Display for ResourceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(ResourceAction::Create),
            "update" => Ok(ResourceAction::Update),
            "delete" => Ok(ResourceAction::Delete),
            "apply" => Ok(ResourceAction::Apply),
            "rollback" => Ok(ResourceAction::Rollback),
            other => Err(format!("unknown resource action '{}'", other)),
        }
    }
}

/// Root record of one command invocation.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentRecord {
    pub id: String,
    pub cluster: String,
    pub namespace: String,
    pub status: DeploymentStatus,
    /// Full normalized configuration at execution time (JSON).
    #[serde(skip_serializing)]
    pub config_snapshot: String,
    /// For rollback deployments: the deployment being reverted.
    pub rollback_of: Option<String>,
    pub created_at: String,
    pub completed_at: Option<String>,
}

/// One app touched within a Deployment.
#[derive(Debug, Clone, Serialize)]
pub struct AppDeploymentRecord {
    pub id: i64,
    pub deployment_id: String,
    pub app_name: String,
    pub app_type: String,
    pub app_group: String,
    pub status: DeploymentStatus,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub error: Option<String>,
}

/// One Kubernetes object mutated by an app deployment.
#[derive(Debug, Clone, Serialize)]
pub struct DeployedResourceRecord {
    pub id: i64,
    pub app_deployment_id: i64,
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: Option<String>,
    pub action: ResourceAction,
    /// The object before this action; null for creates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_state: Option<String>,
    /// The object after this action; null for deletes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_state: Option<String>,
    pub checksum: Option<String>,
}

/// The Helm release produced by a helm-type app.
#[derive(Debug, Clone, Serialize)]
pub struct HelmReleaseRecord {
    pub id: i64,
    pub app_deployment_id: i64,
    pub release_name: String,
    pub chart: String,
    pub chart_version: Option<String>,
    pub revision: Option<u64>,
    /// Fully merged values map (JSON).
    #[serde(skip_serializing)]
    pub values: String,
    pub status: DeploymentStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in [
            DeploymentStatus::Pending,
            DeploymentStatus::InProgress,
            DeploymentStatus::Success,
            DeploymentStatus::Failed,
            DeploymentStatus::RolledBack,
            DeploymentStatus::PartiallyFailed,
            DeploymentStatus::Skipped,
        ] {
            assert_eq!(status.as_str().parse::<DeploymentStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<DeploymentStatus>().is_err());
    }

    #[test]
    fn test_action_roundtrip() {
        for action in [
            ResourceAction::Create,
            ResourceAction::Update,
            ResourceAction::Delete,
            ResourceAction::Apply,
            ResourceAction::Rollback,
        ] {
            assert_eq!(action.as_str().parse::<ResourceAction>().unwrap(), action);
        }
    }
}
