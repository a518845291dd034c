//! `sbkube status` — current deployment state per app

use crate::state::StateStore;
use crate::utils::output::{emit, OutputFormat};
use anyhow::Result;
use colored::Colorize;

pub fn run(
    cluster: Option<&str>,
    namespace: Option<&str>,
    format: OutputFormat,
) -> Result<i32> {
    let store = StateStore::open_default()?;
    let current = store.current_app_statuses(cluster, namespace)?;

    emit(format, &current, || {
        if current.is_empty() {
            println!("no deployments on record");
            return Ok(());
        }
        println!(
            "{:<24} {:<12} {:<16} {:<18} {}",
            "APP", "TYPE", "GROUP", "STATUS", "COMPLETED"
        );
        for app in &current {
            let status = match app.status {
                crate::state::DeploymentStatus::Success => app.status.to_string().green(),
                crate::state::DeploymentStatus::Failed => app.status.to_string().red(),
                crate::state::DeploymentStatus::Skipped => app.status.to_string().yellow(),
                _ => app.status.to_string().normal(),
            };
            println!(
                "{:<24} {:<12} {:<16} {:<18} {}",
                app.app_name,
                app.app_type,
                app.app_group,
                status,
                app.completed_at.as_deref().unwrap_or("-")
            );
        }
        Ok(())
    })?;
    Ok(0)
}

#[cfg(test)]
mod tests {
    // status is a thin read-only view over StateStore::current_app_statuses,
    // which carries its own coverage in state::store.
}
