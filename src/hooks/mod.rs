//! Hook definitions: lifecycle points, typed tasks, failure policies
//!
//! Hooks fire at two scopes (command-level in the root document, app-level
//! inside an app) around the prepare, build, and deploy stages. Simple hook
//! lists carry shell command lines; the deploy stage additionally carries
//! typed task lists (`pre_deploy_tasks` / `post_deploy_tasks`).

pub mod executor;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub use executor::{HookContext, HookExecutor};

/// Default per-task timeout in seconds.
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 300;

/// Stages that carry hook points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStage {
    Prepare,
    Build,
    Deploy,
}

/// Position of a hook relative to its stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPoint {
    Pre,
    Post,
    OnFailure,
}

/// Hook lists for one scope (the root document or a single app).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HookSet {
    pub pre_prepare: Vec<String>,
    pub post_prepare: Vec<String>,
    pub on_prepare_failure: Vec<String>,

    pub pre_build: Vec<String>,
    pub post_build: Vec<String>,
    pub on_build_failure: Vec<String>,

    pub pre_deploy: Vec<String>,
    pub post_deploy: Vec<String>,
    pub on_deploy_failure: Vec<String>,

    /// Typed tasks around deploy (manifests / inline / command).
    pub pre_deploy_tasks: Vec<HookTask>,
    pub post_deploy_tasks: Vec<HookTask>,
}

impl HookSet {
    pub fn is_empty(&self) -> bool {
        self.pre_prepare.is_empty()
            && self.post_prepare.is_empty()
            && self.on_prepare_failure.is_empty()
            && self.pre_build.is_empty()
            && self.post_build.is_empty()
            && self.on_build_failure.is_empty()
            && self.pre_deploy.is_empty()
            && self.post_deploy.is_empty()
            && self.on_deploy_failure.is_empty()
            && self.pre_deploy_tasks.is_empty()
            && self.post_deploy_tasks.is_empty()
    }

    /// Simple command lines for a stage/point pair.
    pub fn simple(&self, stage: HookStage, point: HookPoint) -> &[String] {
        match (stage, point) {
            (HookStage::Prepare, HookPoint::Pre) => &self.pre_prepare,
            (HookStage::Prepare, HookPoint::Post) => &self.post_prepare,
            (HookStage::Prepare, HookPoint::OnFailure) => &self.on_prepare_failure,
            (HookStage::Build, HookPoint::Pre) => &self.pre_build,
            (HookStage::Build, HookPoint::Post) => &self.post_build,
            (HookStage::Build, HookPoint::OnFailure) => &self.on_build_failure,
            (HookStage::Deploy, HookPoint::Pre) => &self.pre_deploy,
            (HookStage::Deploy, HookPoint::Post) => &self.post_deploy,
            (HookStage::Deploy, HookPoint::OnFailure) => &self.on_deploy_failure,
        }
    }
}

/// What to do when a task fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    /// Abort the remaining tasks (default).
    #[default]
    Stop,
    /// Keep going; the failure still fails the hook overall.
    Continue,
    /// Demote to a warning; the hook is considered successful.
    Warn,
    /// Reverse previously applied manifests/inline tasks, then abort.
    Rollback,
}

/// Fields shared by every task type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskCommon {
    /// Identifier other tasks may reference in `depends_on`.
    pub name: Option<String>,
    pub depends_on: Vec<String>,
    pub on_failure: OnFailure,
    pub validation: Option<TaskValidation>,
    /// Seconds; tasks default to `DEFAULT_TASK_TIMEOUT_SECS`.
    pub timeout: Option<u64>,
}

/// A typed hook task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HookTask {
    Command(CommandTask),
    Manifests(ManifestsTask),
    Inline(InlineTask),
}

impl HookTask {
    pub fn common(&self) -> &TaskCommon {
        match self {
            HookTask::Command(t) => &t.common,
            HookTask::Manifests(t) => &t.common,
            HookTask::Inline(t) => &t.common,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            HookTask::Command(_) => "command",
            HookTask::Manifests(_) => "manifests",
            HookTask::Inline(_) => "inline",
        }
    }

    /// Display label: the task name when given, else its type.
    pub fn label(&self) -> &str {
        self.common().name.as_deref().unwrap_or_else(|| self.type_name())
    }
}

/// Shell command task. Either a single `command` line or a `commands` list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandTask {
    #[serde(flatten)]
    pub common: TaskCommon,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

impl CommandTask {
    pub fn lines(&self) -> Vec<&str> {
        match &self.command {
            Some(line) => vec![line.as_str()],
            None => self.commands.iter().map(String::as_str).collect(),
        }
    }
}

/// Manifest-file task: each file is kubectl-applied (and reversed on
/// rollback).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestsTask {
    #[serde(flatten)]
    pub common: TaskCommon,
    pub files: Vec<PathBuf>,
}

/// Inline-YAML task: content is written to a temp file and applied like a
/// manifest task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InlineTask {
    #[serde(flatten)]
    pub common: TaskCommon,
    pub content: String,
}

/// Post-task checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskValidation {
    /// `kubectl wait --for=condition=<condition> <resource>`
    ResourceReady {
        resource: String,
        #[serde(default)]
        namespace: Option<String>,
        #[serde(default = "default_ready_condition")]
        condition: String,
        #[serde(default = "default_wait_timeout")]
        timeout: u64,
    },
    /// The resource must exist (no readiness requirement).
    ResourceExists {
        resource: String,
        #[serde(default)]
        namespace: Option<String>,
    },
    /// An arbitrary probe command must exit zero.
    CommandExitZero { command: String },
}

fn default_ready_condition() -> String {
    "ready".to_string()
}

fn default_wait_timeout() -> u64 {
    120
}

/// `${VAR}` expansion for hook command lines and inline YAML. Extra pairs
/// win over the process environment; unknown variables are left untouched.
pub fn expand_env(text: &str, extra: &[(String, String)]) -> String {
    let mut result = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let var = &after[..end];
                let value = extra
                    .iter()
                    .find(|(k, _)| k == var)
                    .map(|(_, v)| v.clone())
                    .or_else(|| std::env::var(var).ok());
                match value {
                    Some(value) => result.push_str(&value),
                    None => {
                        result.push_str("${");
                        result.push_str(var);
                        result.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                result.push_str("${");
                rest = after;
            }
        }
    }
    result.push_str(rest);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_task_union() {
        let yaml = r#"
- type: manifests
  name: crds
  files: [crds/widgets.yaml]
- type: command
  name: migrate
  depends_on: [crds]
  command: ./migrate.sh
  on_failure: rollback
  validation:
    type: resource_ready
    resource: deployment/db
    namespace: data
- type: inline
  content: |
    apiVersion: v1
    kind: ConfigMap
    metadata:
      name: seed
"#;
        let tasks: Vec<HookTask> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[0].label(), "crds");
        assert_eq!(tasks[1].common().depends_on, vec!["crds".to_string()]);
        assert_eq!(tasks[1].common().on_failure, OnFailure::Rollback);
        match &tasks[1] {
            HookTask::Command(cmd) => {
                assert_eq!(cmd.lines(), vec!["./migrate.sh"]);
                match cmd.common.validation.as_ref().unwrap() {
                    TaskValidation::ResourceReady {
                        resource,
                        condition,
                        timeout,
                        ..
                    } => {
                        assert_eq!(resource, "deployment/db");
                        assert_eq!(condition, "ready");
                        assert_eq!(*timeout, 120);
                    }
                    other => panic!("unexpected validation {:?}", other),
                }
            }
            other => panic!("unexpected task {:?}", other),
        }
        assert_eq!(tasks[2].type_name(), "inline");
    }

    #[test]
    fn test_hook_set_defaults_empty() {
        let set: HookSet = serde_yaml::from_str("{}").unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn test_hook_set_simple_lookup() {
        let set: HookSet = serde_yaml::from_str(
            "pre_deploy: [\"echo before\"]\non_deploy_failure: [\"echo failed\"]\n",
        )
        .unwrap();
        assert_eq!(
            set.simple(HookStage::Deploy, HookPoint::Pre),
            ["echo before".to_string()]
        );
        assert_eq!(
            set.simple(HookStage::Deploy, HookPoint::OnFailure),
            ["echo failed".to_string()]
        );
        assert!(set.simple(HookStage::Build, HookPoint::Post).is_empty());
    }

    #[test]
    fn test_expand_env_extra_wins() {
        std::env::set_var("SBKUBE_TEST_HOME", "/from-env");
        let extra = vec![("SBKUBE_TEST_HOME".to_string(), "/from-extra".to_string())];
        assert_eq!(expand_env("root=${SBKUBE_TEST_HOME}", &extra), "root=/from-extra");
        assert_eq!(expand_env("root=${SBKUBE_TEST_HOME}", &[]), "root=/from-env");
        std::env::remove_var("SBKUBE_TEST_HOME");
    }

    #[test]
    fn test_expand_env_unknown_untouched() {
        assert_eq!(
            expand_env("${SBKUBE_NO_SUCH_VAR_XYZ}/x", &[]),
            "${SBKUBE_NO_SUCH_VAR_XYZ}/x"
        );
        assert_eq!(expand_env("trailing ${unclosed", &[]), "trailing ${unclosed");
    }
}
