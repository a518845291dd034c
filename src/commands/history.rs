//! `sbkube history` — past deployments, newest first

use crate::state::StateStore;
use crate::utils::output::{emit, OutputFormat};
use anyhow::Result;
use serde::Serialize;

#[derive(Serialize)]
struct HistoryEntry {
    id: String,
    cluster: String,
    namespace: String,
    status: crate::state::DeploymentStatus,
    created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    completed_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rollback_of: Option<String>,
    apps: Vec<AppEntry>,
}

#[derive(Serialize)]
struct AppEntry {
    name: String,
    r#type: String,
    group: String,
    status: crate::state::DeploymentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

pub fn run(
    cluster: Option<&str>,
    namespace: Option<&str>,
    app: Option<&str>,
    limit: usize,
    format: OutputFormat,
) -> Result<i32> {
    let store = StateStore::open_default()?;
    let deployments = store.list_deployments(cluster, namespace, app, limit)?;

    let mut entries = Vec::new();
    for deployment in &deployments {
        let apps = store
            .apps_of(&deployment.id)?
            .into_iter()
            .map(|a| AppEntry {
                name: a.app_name,
                r#type: a.app_type,
                group: a.app_group,
                status: a.status,
                error: a.error,
            })
            .collect();
        entries.push(HistoryEntry {
            id: deployment.id.clone(),
            cluster: deployment.cluster.clone(),
            namespace: deployment.namespace.clone(),
            status: deployment.status,
            created_at: deployment.created_at.clone(),
            completed_at: deployment.completed_at.clone(),
            rollback_of: deployment.rollback_of.clone(),
            apps,
        });
    }

    emit(format, &entries, || {
        if entries.is_empty() {
            println!("no deployments on record");
            return Ok(());
        }
        for entry in &entries {
            let short_id = entry.id.split('-').next().unwrap_or(&entry.id);
            println!(
                "{}  {}  {}/{}  {}",
                short_id, entry.created_at, entry.cluster, entry.namespace, entry.status
            );
            if let Some(original) = &entry.rollback_of {
                println!("    rollback of {}", original);
            }
            for app in &entry.apps {
                match &app.error {
                    Some(error) => println!("    {} ({}): {} - {}", app.name, app.r#type, app.status, error),
                    None => println!("    {} ({}): {}", app.name, app.r#type, app.status),
                }
            }
        }
        Ok(())
    })?;
    Ok(0)
}
