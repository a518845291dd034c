//! `sbkube delete` — uninstall the resources a workspace deployed

use crate::commands::pipeline::{resolve_invocation, TargetArgs};
use crate::config::model::{ActionKind, App};
use crate::manifest;
use crate::tools::{Helm, Kubectl};
use crate::utils::output::OutputFormat;
use anyhow::Result;
use std::path::PathBuf;

#[allow(clippy::too_many_arguments)]
pub fn run(
    args: &TargetArgs,
    app_filter: Option<&str>,
    namespace_override: Option<String>,
    kubeconfig: Option<PathBuf>,
    context: Option<String>,
    yes: bool,
    dry_run: bool,
    format: OutputFormat,
) -> Result<i32> {
    let invocation = resolve_invocation(args)?;
    let scope = invocation.scope();

    if !yes && !dry_run && !format.is_machine() {
        let what = match app_filter {
            Some(app) => format!("app '{}'", app),
            None => format!("every app under '{}'", scope.group),
        };
        let confirmed = dialoguer::Confirm::new()
            .with_prompt(format!("Delete {} from the cluster?", what))
            .default(false)
            .interact()
            .unwrap_or(false);
        if !confirmed {
            crate::log_info!("delete cancelled");
            return Ok(0);
        }
    }

    let mut failures = 0usize;
    for node in scope.walk() {
        let kubeconfig = kubeconfig
            .clone()
            .or_else(|| node.effective.kubeconfig_path());
        let context = context
            .clone()
            .or_else(|| node.effective.merged.kubeconfig_context.clone());
        let helm = Helm::new(kubeconfig.clone(), context.clone());
        let kubectl = Kubectl::new(kubeconfig, context);

        // reverse topological order: dependents go away before their deps
        let mut order = crate::deps::topo_order(&node.config)?;
        order.reverse();

        for app_name in order {
            if let Some(filter) = app_filter {
                if app_name != filter {
                    continue;
                }
            }
            let app = &node.config.apps[&app_name];
            let namespace = namespace_override
                .clone()
                .or_else(|| app.common().namespace.clone())
                .or_else(|| node.effective.merged.namespace.clone());

            let result = delete_app(&app_name, app, namespace.as_deref(), &node.dir, &helm, &kubectl, dry_run);
            match result {
                Ok(true) => crate::log_info!("deleted {}", app_name),
                Ok(false) => {}
                Err(err) => {
                    failures += 1;
                    crate::log_error!("delete {}: {}", app_name, err);
                }
            }
        }
    }

    Ok(if failures > 0 { 1 } else { 0 })
}

/// Returns Ok(true) when something was deleted, Ok(false) for app types
/// with nothing on the cluster.
fn delete_app(
    app_name: &str,
    app: &App,
    namespace: Option<&str>,
    doc_dir: &std::path::Path,
    helm: &Helm,
    kubectl: &Kubectl,
    dry_run: bool,
) -> Result<bool> {
    match app {
        App::Helm(helm_app) => {
            let release = helm_app.release_name_or(app_name);
            if dry_run {
                crate::log_info!("[dry-run] helm uninstall {}", release);
                return Ok(true);
            }
            helm.uninstall(release, namespace)?;
            Ok(true)
        }
        App::Yaml(yaml_app) => {
            for file in yaml_app.files.iter().rev() {
                let path = crate::utils::paths::resolve_relative(doc_dir, file);
                if dry_run {
                    crate::log_info!("[dry-run] kubectl delete -f {}", path.display());
                    continue;
                }
                kubectl.delete_path(&path, namespace)?;
            }
            Ok(true)
        }
        App::Action(action_app) => {
            // undo apply/create steps; delete steps have nothing to undo
            for step in action_app.actions.iter().rev() {
                if step.action == ActionKind::Delete {
                    continue;
                }
                let path = crate::utils::paths::resolve_relative(doc_dir, &step.path);
                if dry_run {
                    crate::log_info!("[dry-run] kubectl delete -f {}", path.display());
                    continue;
                }
                let objects = manifest::load_file(&path, namespace)?;
                for (resource, _) in objects.iter().rev() {
                    kubectl.delete_resource(resource)?;
                }
            }
            Ok(true)
        }
        App::Kustomize(kustomize_app) => {
            if dry_run {
                crate::log_info!(
                    "[dry-run] would delete kustomize output of {}",
                    kustomize_app.path.display()
                );
                return Ok(true);
            }
            let rendered = kubectl.kustomize_build(&crate::utils::paths::resolve_relative(
                doc_dir,
                &kustomize_app.path,
            ))?;
            let objects = manifest::parse_documents(&rendered, namespace)?;
            for (resource, _) in objects.iter().rev() {
                kubectl.delete_resource(resource)?;
            }
            Ok(true)
        }
        // nothing deployed to a cluster for these
        App::Git(_) | App::Http(_) | App::Exec(_) | App::Noop(_) | App::Hook(_) => Ok(false),
    }
}
