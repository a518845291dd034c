//! `sbkube rollback` — restore a previous deployment from history

use crate::rollback::RollbackEngine;
use crate::state::{DeploymentStatus, StateStore};
use crate::tools::{Helm, Kubectl};
use crate::utils::output::{emit, OutputFormat};
use anyhow::Result;
use std::path::PathBuf;

#[allow(clippy::too_many_arguments)]
pub fn run(
    deployment_id: &str,
    app: Option<&str>,
    kubeconfig: Option<PathBuf>,
    context: Option<String>,
    yes: bool,
    dry_run: bool,
    format: OutputFormat,
) -> Result<i32> {
    let store = StateStore::open_default()?;
    let _lock = if dry_run { None } else { store.writer_lock()? };

    if !yes && !dry_run && !format.is_machine() {
        let prompt = match app {
            Some(app) => format!("Roll back app '{}' to its previous state?", app),
            None => format!("Roll back deployment {}?", deployment_id),
        };
        let confirmed = dialoguer::Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .interact()
            .unwrap_or(false);
        if !confirmed {
            crate::log_info!("rollback cancelled");
            return Ok(0);
        }
    }

    let helm = Helm::new(kubeconfig.clone(), context.clone());
    let kubectl = Kubectl::new(kubeconfig, context);
    let engine = RollbackEngine::new(&store, &helm, &kubectl, dry_run);

    let result = match (deployment_id, app) {
        ("latest", Some(app)) => engine.rollback_app_latest(app)?,
        (id, _) => engine.rollback_deployment(id)?,
    };

    emit(format, &result, || {
        println!(
            "rollback of {} -> {}",
            result.rolled_back_deployment, result.status
        );
        for app in &result.apps {
            match &app.message {
                Some(message) => println!("  {}: {} ({})", app.app_name, app.status, message),
                None => println!("  {}: {}", app.app_name, app.status),
            }
        }
        if let Some(id) = &result.rollback_deployment_id {
            println!("recorded as deployment {}", id);
        }
        Ok(())
    })?;

    Ok(match result.status {
        DeploymentStatus::RolledBack => 0,
        _ => 1,
    })
}
