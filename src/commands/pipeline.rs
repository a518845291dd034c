//! Pipeline command handlers: prepare, build, template, deploy, apply

use crate::config::model::App;
use crate::config::phases::PhaseNode;
use crate::config::{load_workspace, resolve, validate};
use crate::pipeline::{GroupRunResult, Orchestrator, PipelineOptions, Stage};
use crate::state::StateStore;
use crate::utils::errors::SbkubeError;
use crate::utils::output::{emit, OutputFormat};
use crate::utils::{CommonPrereqs, Prerequisite};
use anyhow::Result;
use std::path::PathBuf;

/// How the user pointed at a workspace.
#[derive(Debug, Clone, Default)]
pub struct TargetArgs {
    pub target: Option<PathBuf>,
    pub file: Option<PathBuf>,
    /// `--phase NAME`; mutually exclusive with a positional target.
    pub phase: Option<String>,
}

/// Resolved invocation: the workspace tree narrowed to the requested scope.
pub struct Invocation {
    pub workspace_root: PathBuf,
    pub tree: PhaseNode,
    /// Index path from the root to the scope node (empty = root).
    scope_path: Vec<usize>,
}

impl Invocation {
    pub fn scope(&self) -> &PhaseNode {
        let mut node = &self.tree;
        for &index in &self.scope_path {
            node = &node.children[index];
        }
        node
    }
}

/// Resolve target/file/phase into a loaded workspace and scope node.
pub fn resolve_invocation(args: &TargetArgs) -> Result<Invocation> {
    let resolved = resolve(args.target.as_deref(), args.file.as_deref())?;
    let tree = load_workspace(&resolved.config_file)?;

    let scope_path = if let Some(phase) = &args.phase {
        find_phase(&tree, phase).ok_or_else(|| {
            SbkubeError::new(
                crate::utils::errors::ErrorKind::Config,
                format!("phase '{}' not found in this workspace", phase),
            )
            .with_hint("list phases with 'sbkube workspace graph'")
        })?
    } else if let Some(scope) = &resolved.scope {
        scope_node_path(&tree, &resolved.workspace_root, scope).unwrap_or_default()
    } else {
        Vec::new()
    };

    Ok(Invocation {
        workspace_root: resolved.workspace_root,
        tree,
        scope_path,
    })
}

fn find_phase(tree: &PhaseNode, phase: &str) -> Option<Vec<usize>> {
    fn search(node: &PhaseNode, phase: &str, path: &mut Vec<usize>) -> bool {
        for (index, child) in node.children.iter().enumerate() {
            path.push(index);
            if child.name == phase || child.group == phase {
                return true;
            }
            if search(child, phase, path) {
                return true;
            }
            path.pop();
        }
        false
    }
    let mut path = Vec::new();
    search(tree, phase, &mut path).then_some(path)
}

fn scope_node_path(
    tree: &PhaseNode,
    workspace_root: &std::path::Path,
    scope: &std::path::Path,
) -> Option<Vec<usize>> {
    let target = tree.select_scope(workspace_root, scope)?;
    fn locate(node: &PhaseNode, wanted: *const PhaseNode, path: &mut Vec<usize>) -> bool {
        if std::ptr::eq(node, wanted) {
            return true;
        }
        for (index, child) in node.children.iter().enumerate() {
            path.push(index);
            if locate(child, wanted, path) {
                return true;
            }
            path.pop();
        }
        false
    }
    let mut path = Vec::new();
    locate(tree, target as *const PhaseNode, &mut path).then_some(path)
}

/// Tools the selected stage window actually needs, given the app types in
/// scope. Missing tools fail before any work starts.
fn preflight(scope: &PhaseNode, stages: &[Stage]) -> Result<()> {
    let mut needs_helm = false;
    let mut needs_git = false;
    let mut needs_kubectl = stages.contains(&Stage::Deploy);
    for node in scope.walk() {
        for app in node.config.apps.values() {
            match app {
                App::Helm(_) => needs_helm = true,
                App::Git(_) => needs_git = true,
                App::Kustomize(_) => needs_kubectl = true,
                _ => {}
            }
        }
    }
    let helm = CommonPrereqs::helm();
    let kubectl = CommonPrereqs::kubectl();
    let git = CommonPrereqs::git();
    let mut required: Vec<&dyn Prerequisite> = Vec::new();
    if needs_helm {
        required.push(&helm);
    }
    if needs_kubectl {
        required.push(&kubectl);
    }
    if needs_git {
        required.push(&git);
    }
    for prereq in required {
        prereq.check()?;
    }
    Ok(())
}

/// Run a stage window over the resolved scope. Returns the process exit
/// code (0 clean, 1 when any app failed).
pub fn run_pipeline(
    args: &TargetArgs,
    options: &PipelineOptions,
    format: OutputFormat,
) -> Result<i32> {
    let invocation = resolve_invocation(args)?;
    let scope = invocation.scope();

    // configuration problems block before any stage runs
    let report = validate::validate_tree(scope);
    if !report.is_ok() {
        return Err(SbkubeError::config_validation(&report.errors).into());
    }
    for warning in &report.warnings {
        crate::log_warn!("{}", warning);
    }

    let stages = options.stage_window();
    preflight(scope, &stages)?;

    let needs_store = stages.contains(&Stage::Deploy) && !options.dry_run;
    let store = if needs_store {
        Some(StateStore::open_default()?)
    } else {
        None
    };
    // the lock spans every group's writes in this invocation
    let _lock = match &store {
        Some(store) => store.writer_lock()?,
        None => None,
    };

    let mut results: Vec<GroupRunResult> = Vec::new();
    for node in scope.walk() {
        if node.config.apps.is_empty() {
            continue;
        }
        crate::utils::logger::log_group(
            &node.group,
            format!("({} apps)", node.config.apps.len()),
        );
        let orchestrator =
            Orchestrator::new(node, invocation.workspace_root.clone(), options);
        let result = orchestrator.run(store.as_ref())?;
        results.push(result);
    }

    let any_failed = results.iter().any(GroupRunResult::any_failed);
    emit(format, &results, || {
        print_results_human(&results);
        Ok(())
    })?;

    Ok(if any_failed { 1 } else { 0 })
}

fn print_results_human(results: &[GroupRunResult]) {
    use crate::pipeline::OutcomeStatus;
    for result in results {
        println!("group {}:", result.group);
        for outcome in &result.outcomes {
            let mark = match outcome.status {
                OutcomeStatus::Success => "ok",
                OutcomeStatus::Failed => "FAILED",
                OutcomeStatus::Skipped => "skipped",
            };
            match &outcome.message {
                Some(message) => {
                    println!("  {:<10} {:<20} {}  ({})", outcome.stage, outcome.app, mark, message)
                }
                None => println!("  {:<10} {:<20} {}", outcome.stage, outcome.app, mark),
            }
        }
        if let (Some(id), Some(status)) = (&result.deployment_id, &result.deployment_status) {
            println!("  deployment {} -> {}", id, status);
        }
    }
}
