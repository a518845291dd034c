//! Hook execution: intra-list task DAG, validations, failure policies
//!
//! Tasks run as a DAG walk (names + `depends_on`), not a flat list, so a
//! hook author can express "wait for resource X before running command Y".
//! Manifest-applying tasks snapshot resource state exactly like deploy-stage
//! manifests; the caller persists the returned records.

use crate::hooks::{
    expand_env, CommandTask, HookTask, InlineTask, ManifestsTask, OnFailure, TaskValidation,
    DEFAULT_TASK_TIMEOUT_SECS,
};
use crate::manifest::{self, ResourceRef};
use crate::state::ResourceAction;
use crate::tools::{Kubectl, ToolInvocation};
use crate::utils::errors::{ErrorKind, SbkubeError};
use anyhow::{Context, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

/// Everything a hook needs to know about its surroundings.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub app_name: String,
    pub namespace: Option<String>,
    pub release_name: String,
    pub cluster: String,
    /// Base for relative manifest paths (the document directory).
    pub base_dir: PathBuf,
    pub dry_run: bool,
}

impl HookContext {
    /// Environment visible to hook commands and `${VAR}` expansion.
    pub fn env_pairs(&self) -> Vec<(String, String)> {
        vec![
            ("SBKUBE_APP_NAME".to_string(), self.app_name.clone()),
            (
                "SBKUBE_NAMESPACE".to_string(),
                self.namespace.clone().unwrap_or_default(),
            ),
            ("SBKUBE_RELEASE_NAME".to_string(), self.release_name.clone()),
            ("SBKUBE_CLUSTER".to_string(), self.cluster.clone()),
        ]
    }
}

/// A resource mutated by a manifests/inline task, in application order.
#[derive(Debug, Clone)]
pub struct AppliedHookResource {
    pub resource: ResourceRef,
    pub action: ResourceAction,
    pub previous_state: Option<String>,
    pub current_state: Option<String>,
}

/// Outcome of one task list.
#[derive(Debug, Default)]
pub struct HookReport {
    pub applied: Vec<AppliedHookResource>,
    pub warnings: Vec<String>,
}

pub struct HookExecutor<'a> {
    kubectl: &'a Kubectl,
}

impl<'a> HookExecutor<'a> {
    pub fn new(kubectl: &'a Kubectl) -> Self {
        Self { kubectl }
    }

    /// Run simple hook lines (shell commands) serially. First failure stops.
    pub fn run_simple(&self, lines: &[String], ctx: &HookContext) -> Result<()> {
        for line in lines {
            let expanded = expand_env(line, &ctx.env_pairs());
            if ctx.dry_run {
                crate::log_info!("[dry-run] hook command: {}", expanded);
                continue;
            }
            run_command_line(&expanded, None, DEFAULT_TASK_TIMEOUT_SECS, ctx)?;
        }
        Ok(())
    }

    /// Run a typed task list as a DAG walk.
    pub fn run_tasks(&self, tasks: &[HookTask], ctx: &HookContext) -> Result<HookReport> {
        let order = task_order(tasks)?;
        let mut report = HookReport::default();
        let mut failures: Vec<String> = Vec::new();

        for index in order {
            let task = &tasks[index];
            let result = self.run_one(task, ctx, &mut report);
            let result = match result {
                Ok(()) => self.run_validation(task, ctx),
                Err(err) => Err(err),
            };

            if let Err(err) = result {
                let label = task.label().to_string();
                match task.common().on_failure {
                    OnFailure::Warn => {
                        crate::log_warn!("hook task '{}' failed (warn): {}", label, err);
                        report.warnings.push(format!("{}: {}", label, err));
                    }
                    OnFailure::Continue => {
                        crate::log_error!("hook task '{}' failed, continuing: {}", label, err);
                        failures.push(format!("{}: {}", label, err));
                    }
                    OnFailure::Stop => {
                        return Err(err.context(format!("hook task '{}' failed", label)));
                    }
                    OnFailure::Rollback => {
                        crate::log_error!(
                            "hook task '{}' failed, rolling back applied tasks: {}",
                            label,
                            err
                        );
                        self.rollback_applied(&report.applied, ctx)?;
                        return Err(err.context(format!(
                            "hook task '{}' failed; prior tasks rolled back",
                            label
                        )));
                    }
                }
            }
        }

        if !failures.is_empty() {
            return Err(SbkubeError::new(
                ErrorKind::Hook,
                format!("{} hook task(s) failed", failures.len()),
            )
            .with_details(failures.join("\n"))
            .into());
        }
        Ok(report)
    }

    fn run_one(&self, task: &HookTask, ctx: &HookContext, report: &mut HookReport) -> Result<()> {
        match task {
            HookTask::Command(command) => self.run_command_task(command, ctx),
            HookTask::Manifests(manifests) => self.run_manifests_task(manifests, ctx, report),
            HookTask::Inline(inline) => self.run_inline_task(inline, ctx, report),
        }
    }

    fn run_command_task(&self, task: &CommandTask, ctx: &HookContext) -> Result<()> {
        let timeout = task.common.timeout.unwrap_or(DEFAULT_TASK_TIMEOUT_SECS);
        for line in task.lines() {
            let expanded = expand_env(line, &ctx.env_pairs());
            if ctx.dry_run {
                crate::log_info!("[dry-run] hook command: {}", expanded);
                continue;
            }
            run_command_line(&expanded, task.working_dir.as_deref(), timeout, ctx)?;
        }
        Ok(())
    }

    fn run_manifests_task(
        &self,
        task: &ManifestsTask,
        ctx: &HookContext,
        report: &mut HookReport,
    ) -> Result<()> {
        for file in &task.files {
            let path = crate::utils::paths::resolve_relative(&ctx.base_dir, file);
            let objects = manifest::load_file(&path, ctx.namespace.as_deref())?;
            self.apply_objects(objects, ctx, report)?;
        }
        Ok(())
    }

    fn run_inline_task(
        &self,
        task: &InlineTask,
        ctx: &HookContext,
        report: &mut HookReport,
    ) -> Result<()> {
        let content = expand_env(&task.content, &ctx.env_pairs());
        let objects = manifest::parse_documents(&content, ctx.namespace.as_deref())
            .context("inline task content")?;
        self.apply_objects(objects, ctx, report)
    }

    fn apply_objects(
        &self,
        objects: Vec<(ResourceRef, serde_yaml::Value)>,
        ctx: &HookContext,
        report: &mut HookReport,
    ) -> Result<()> {
        for (resource, value) in objects {
            if ctx.dry_run {
                crate::log_info!("[dry-run] would apply {}", resource);
                continue;
            }
            let previous = self.kubectl.get_yaml(&resource)?;
            let action = if previous.is_some() {
                ResourceAction::Update
            } else {
                ResourceAction::Create
            };
            let yaml = serde_yaml::to_string(&value).context("failed to reserialize manifest")?;
            // manifests without an inline namespace get the hook's
            let flag_namespace = match value.get("metadata").and_then(|m| m.get("namespace")) {
                Some(_) => None,
                None => resource.namespace.as_deref(),
            };
            self.kubectl.apply_stdin(&yaml, flag_namespace)?;
            let current = self.kubectl.get_yaml(&resource)?;
            report.applied.push(AppliedHookResource {
                resource,
                action,
                previous_state: previous,
                current_state: current,
            });
        }
        Ok(())
    }

    /// Reverse previously applied resources, newest first: creates are
    /// deleted, updates restored to their previous state. Escalates when the
    /// reversal itself fails; the caller marks the deployment failed.
    fn rollback_applied(&self, applied: &[AppliedHookResource], ctx: &HookContext) -> Result<()> {
        for entry in applied.iter().rev() {
            if ctx.dry_run {
                crate::log_info!("[dry-run] would revert {}", entry.resource);
                continue;
            }
            let result = match (&entry.action, &entry.previous_state) {
                (ResourceAction::Create, _) => {
                    self.kubectl.delete_resource(&entry.resource).map(|_| ())
                }
                (_, Some(previous)) => self
                    .kubectl
                    .apply_stdin(previous, None)
                    .map(|_| ()),
                (_, None) => Ok(()),
            };
            result.map_err(|err| {
                SbkubeError::new(
                    ErrorKind::Hook,
                    format!("hook rollback failed for {}", entry.resource),
                )
                .with_details(err.to_string())
            })?;
        }
        Ok(())
    }

    fn run_validation(&self, task: &HookTask, ctx: &HookContext) -> Result<()> {
        let Some(validation) = &task.common().validation else {
            return Ok(());
        };
        if ctx.dry_run {
            crate::log_info!("[dry-run] would validate {} task", task.type_name());
            return Ok(());
        }
        match validation {
            TaskValidation::ResourceReady {
                resource,
                namespace,
                condition,
                timeout,
            } => {
                let namespace = namespace.as_deref().or(ctx.namespace.as_deref());
                self.kubectl
                    .wait_for(resource, condition, namespace, Duration::from_secs(*timeout))
                    .map(|_| ())
                    .with_context(|| format!("resource {} did not become {}", resource, condition))
            }
            TaskValidation::ResourceExists { resource, namespace } => {
                let namespace = namespace.as_deref().or(ctx.namespace.as_deref());
                let (kind, name) = resource
                    .split_once('/')
                    .with_context(|| format!("validation resource '{}' is not kind/name", resource))?;
                let reference = ResourceRef {
                    api_version: String::new(),
                    kind: kind.to_string(),
                    name: name.to_string(),
                    namespace: namespace.map(str::to_string),
                };
                if self.kubectl.exists(&reference)? {
                    Ok(())
                } else {
                    Err(SbkubeError::new(
                        ErrorKind::Hook,
                        format!("resource {} does not exist", resource),
                    )
                    .into())
                }
            }
            TaskValidation::CommandExitZero { command } => {
                let expanded = expand_env(command, &ctx.env_pairs());
                run_command_line(&expanded, None, DEFAULT_TASK_TIMEOUT_SECS, ctx)
                    .with_context(|| format!("validation command failed: {}", command))
            }
        }
    }
}

fn run_command_line(
    line: &str,
    working_dir: Option<&std::path::Path>,
    timeout_secs: u64,
    ctx: &HookContext,
) -> Result<()> {
    let argv = shell_words::split(line)
        .with_context(|| format!("cannot parse hook command: {}", line))?;
    let Some((program, args)) = argv.split_first() else {
        return Ok(());
    };
    let mut invocation = ToolInvocation::new(program)
        .args(args.iter().cloned())
        .timeout(Duration::from_secs(timeout_secs));
    for (key, value) in ctx.env_pairs() {
        invocation = invocation.env(key, value);
    }
    if let Some(dir) = working_dir {
        invocation = invocation.current_dir(dir);
    }
    invocation
        .run()
        .map(|_| ())
        .with_context(|| format!("hook command failed: {}", line))
}

/// Stable topological order over the task list. Tasks without dependencies
/// keep their written order; a dependency cycle is an error naming the
/// tasks involved.
fn task_order(tasks: &[HookTask]) -> Result<Vec<usize>> {
    let mut by_name: BTreeMap<&str, usize> = BTreeMap::new();
    for (index, task) in tasks.iter().enumerate() {
        if let Some(name) = &task.common().name {
            by_name.insert(name.as_str(), index);
        }
    }

    let mut blocked_on: Vec<BTreeSet<usize>> = Vec::with_capacity(tasks.len());
    for task in tasks {
        let mut deps = BTreeSet::new();
        for dep in &task.common().depends_on {
            let dep_index = by_name.get(dep.as_str()).with_context(|| {
                format!("task '{}' depends on unknown task '{}'", task.label(), dep)
            })?;
            deps.insert(*dep_index);
        }
        blocked_on.push(deps);
    }

    let mut order = Vec::with_capacity(tasks.len());
    let mut emitted = vec![false; tasks.len()];
    while order.len() < tasks.len() {
        let next = (0..tasks.len())
            .find(|&i| !emitted[i] && blocked_on[i].iter().all(|&d| emitted[d]));
        match next {
            Some(index) => {
                emitted[index] = true;
                order.push(index);
            }
            None => {
                let stuck: Vec<String> = (0..tasks.len())
                    .filter(|&i| !emitted[i])
                    .map(|i| tasks[i].label().to_string())
                    .collect();
                return Err(SbkubeError::new(
                    ErrorKind::Config,
                    format!("hook task dependency cycle: {}", stuck.join(", ")),
                )
                .into());
            }
        }
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(yaml: &str) -> HookTask {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn ctx() -> HookContext {
        HookContext {
            app_name: "web".into(),
            namespace: Some("demo".into()),
            release_name: "web".into(),
            cluster: "prod".into(),
            base_dir: PathBuf::from("."),
            dry_run: false,
        }
    }

    #[test]
    fn test_task_order_respects_depends_on() {
        let tasks = vec![
            task("{type: command, name: second, depends_on: [first], command: echo 2}"),
            task("{type: command, name: first, command: echo 1}"),
            task("{type: command, command: echo 3}"),
        ];
        let order = task_order(&tasks).unwrap();
        let first_pos = order.iter().position(|&i| i == 1).unwrap();
        let second_pos = order.iter().position(|&i| i == 0).unwrap();
        assert!(first_pos < second_pos);
    }

    #[test]
    fn test_task_order_stable_without_deps() {
        let tasks = vec![
            task("{type: command, command: echo a}"),
            task("{type: command, command: echo b}"),
            task("{type: command, command: echo c}"),
        ];
        assert_eq!(task_order(&tasks).unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_task_order_cycle_rejected() {
        let tasks = vec![
            task("{type: command, name: a, depends_on: [b], command: echo}"),
            task("{type: command, name: b, depends_on: [a], command: echo}"),
        ];
        let err = task_order(&tasks).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_unknown_task_dependency_rejected() {
        let tasks = vec![task(
            "{type: command, name: a, depends_on: [ghost], command: echo}",
        )];
        assert!(task_order(&tasks).is_err());
    }

    #[test]
    fn test_run_command_task_success_and_failure() {
        let kubectl = Kubectl::default();
        let executor = HookExecutor::new(&kubectl);
        let ok = vec![task("{type: command, command: 'true'}")];
        assert!(executor.run_tasks(&ok, &ctx()).is_ok());

        let failing = vec![task("{type: command, command: 'false'}")];
        assert!(executor.run_tasks(&failing, &ctx()).is_err());
    }

    #[test]
    fn test_on_failure_warn_keeps_hook_successful() {
        let kubectl = Kubectl::default();
        let executor = HookExecutor::new(&kubectl);
        let tasks = vec![
            task("{type: command, command: 'false', on_failure: warn}"),
            task("{type: command, command: 'true'}"),
        ];
        let report = executor.run_tasks(&tasks, &ctx()).unwrap();
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn test_on_failure_continue_fails_at_end() {
        let kubectl = Kubectl::default();
        let executor = HookExecutor::new(&kubectl);
        let tasks = vec![
            task("{type: command, name: bad, command: 'false', on_failure: continue}"),
            task("{type: command, name: good, command: 'true'}"),
        ];
        let err = executor.run_tasks(&tasks, &ctx()).unwrap_err();
        let sb = err.downcast_ref::<SbkubeError>().unwrap();
        assert_eq!(sb.kind, ErrorKind::Hook);
        assert!(sb.details.as_deref().unwrap().contains("bad"));
    }

    #[test]
    fn test_dry_run_skips_execution() {
        let kubectl = Kubectl::default();
        let executor = HookExecutor::new(&kubectl);
        let mut context = ctx();
        context.dry_run = true;
        // a command that would fail loudly if actually run
        let tasks = vec![task("{type: command, command: 'false'}")];
        assert!(executor.run_tasks(&tasks, &context).is_ok());
    }

    #[test]
    fn test_env_pairs_exposed() {
        let pairs = ctx().env_pairs();
        let get = |key: &str| {
            pairs
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
                .unwrap()
        };
        assert_eq!(get("SBKUBE_APP_NAME"), "web");
        assert_eq!(get("SBKUBE_NAMESPACE"), "demo");
        assert_eq!(get("SBKUBE_RELEASE_NAME"), "web");
        assert_eq!(get("SBKUBE_CLUSTER"), "prod");
    }

    #[test]
    fn test_simple_lines_expand_env() {
        let kubectl = Kubectl::default();
        let executor = HookExecutor::new(&kubectl);
        // expansion happens before splitting, so the app name flows through
        let lines = vec!["test web = ${SBKUBE_APP_NAME}".to_string()];
        assert!(executor.run_simple(&lines, &ctx()).is_ok());
    }
}
