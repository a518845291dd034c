//! `sbkube upgrade` — in-place helm upgrade for deployed helm apps
//!
//! Runs the deploy stage over the scope with every non-helm app disabled;
//! chart artifacts are assumed prepared/built (run `apply` for the full
//! pipeline).

use crate::commands::pipeline::{resolve_invocation, TargetArgs};
use crate::config::model::App;
use crate::pipeline::{Orchestrator, PipelineOptions, Stage};
use crate::state::StateStore;
use crate::utils::output::{emit, OutputFormat};
use anyhow::Result;

pub fn run(
    args: &TargetArgs,
    mut options: PipelineOptions,
    format: OutputFormat,
) -> Result<i32> {
    options.only = Some(Stage::Deploy);
    let invocation = resolve_invocation(args)?;
    let scope = invocation.scope();

    let store = if options.dry_run {
        None
    } else {
        Some(StateStore::open_default()?)
    };
    let _lock = match &store {
        Some(store) => store.writer_lock()?,
        None => None,
    };

    let mut results = Vec::new();
    for node in scope.walk() {
        // disable everything that is not a helm app; the orchestrator then
        // sees an all-helm document and upgrades release by release
        let mut node = node.clone();
        let mut helm_count = 0usize;
        for app in node.config.apps.values_mut() {
            match app {
                App::Helm(helm_app) => {
                    if helm_app.common.enabled {
                        helm_count += 1;
                    }
                }
                other => {
                    set_disabled(other);
                }
            }
        }
        if helm_count == 0 {
            continue;
        }
        crate::utils::logger::log_group(
            &node.group,
            format!("upgrading {} helm app(s)", helm_count),
        );
        let orchestrator =
            Orchestrator::new(&node, invocation.workspace_root.clone(), &options);
        results.push(orchestrator.run(store.as_ref())?);
    }

    if results.is_empty() {
        crate::log_info!("no helm apps in scope");
        return Ok(0);
    }

    let any_failed = results
        .iter()
        .any(crate::pipeline::GroupRunResult::any_failed);
    emit(format, &results, || {
        for result in &results {
            for outcome in &result.outcomes {
                println!("{} {}: {:?}", result.group, outcome.app, outcome.status);
            }
        }
        Ok(())
    })?;
    Ok(if any_failed { 1 } else { 0 })
}

fn set_disabled(app: &mut App) {
    match app {
        App::Helm(a) => a.common.enabled = false,
        App::Yaml(a) => a.common.enabled = false,
        App::Kustomize(a) => a.common.enabled = false,
        App::Git(a) => a.common.enabled = false,
        App::Http(a) => a.common.enabled = false,
        App::Action(a) => a.common.enabled = false,
        App::Exec(a) => a.common.enabled = false,
        App::Noop(a) => a.common.enabled = false,
        App::Hook(a) => a.common.enabled = false,
    }
}
