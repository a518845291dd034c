//! The rollback engine
//!
//! Reads only the state store: walks a deployment's app records in reverse
//! order and undoes each one from its recorded snapshots. Helm releases
//! roll back to the previous revision (or uninstall when the deployment was
//! the initial install); raw resources are restored from `previous_state`.
//! The rollback itself is recorded as a new Deployment row.

use crate::manifest::ResourceRef;
use crate::state::{
    AppDeploymentRecord, DeploymentRecord, DeploymentStatus, ResourceAction, StateStore,
};
use crate::tools::{Helm, Kubectl};
use crate::utils::errors::{ErrorKind, SbkubeError};
use anyhow::{Context, Result};
use serde::Serialize;

/// Per-app rollback outcome.
#[derive(Debug, Clone, Serialize)]
pub struct AppRollback {
    pub app_name: String,
    pub status: DeploymentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Overall rollback result.
#[derive(Debug, Clone, Serialize)]
pub struct RollbackResult {
    pub rolled_back_deployment: String,
    pub rollback_deployment_id: Option<String>,
    pub status: DeploymentStatus,
    pub apps: Vec<AppRollback>,
}

pub struct RollbackEngine<'a> {
    store: &'a StateStore,
    helm: &'a Helm,
    kubectl: &'a Kubectl,
    dry_run: bool,
}

impl<'a> RollbackEngine<'a> {
    pub fn new(store: &'a StateStore, helm: &'a Helm, kubectl: &'a Kubectl, dry_run: bool) -> Self {
        Self {
            store,
            helm,
            kubectl,
            dry_run,
        }
    }

    /// Roll back a whole deployment by id (or id prefix).
    pub fn rollback_deployment(&self, deployment_id: &str) -> Result<RollbackResult> {
        let deployment = self
            .store
            .deployment_by_prefix(deployment_id)?
            .ok_or_else(|| {
                SbkubeError::new(
                    ErrorKind::State,
                    format!("no deployment found for id '{}'", deployment_id),
                )
                .with_hint("list deployments with 'sbkube history'")
            })?;
        let apps = self.store.apps_of(&deployment.id)?;
        self.rollback_apps(&deployment, apps)
    }

    /// Roll back the latest deployment touching a single app.
    pub fn rollback_app_latest(&self, app_name: &str) -> Result<RollbackResult> {
        let deployment = self.store.latest_for_app(app_name)?.ok_or_else(|| {
            SbkubeError::new(
                ErrorKind::State,
                format!("no deployment on record for app '{}'", app_name),
            )
        })?;
        let apps: Vec<AppDeploymentRecord> = self
            .store
            .apps_of(&deployment.id)?
            .into_iter()
            .filter(|app| app.app_name == app_name)
            .collect();
        self.rollback_apps(&deployment, apps)
    }

    fn rollback_apps(
        &self,
        deployment: &DeploymentRecord,
        mut apps: Vec<AppDeploymentRecord>,
    ) -> Result<RollbackResult> {
        // reverse topological order: app rows were inserted in deploy order
        apps.reverse();

        let mut results = Vec::new();
        let mut failures = 0usize;

        for app in &apps {
            if app.status == DeploymentStatus::Skipped {
                continue;
            }
            let outcome = self.rollback_one(app);
            match outcome {
                Ok(message) => results.push(AppRollback {
                    app_name: app.app_name.clone(),
                    status: DeploymentStatus::Success,
                    message,
                }),
                Err(err) => {
                    failures += 1;
                    crate::log_error!("rollback {}: {}", app.app_name, err);
                    results.push(AppRollback {
                        app_name: app.app_name.clone(),
                        status: DeploymentStatus::Failed,
                        message: Some(err.to_string()),
                    });
                }
            }
        }

        let status = if failures == 0 {
            DeploymentStatus::RolledBack
        } else if failures == results.len() {
            DeploymentStatus::Failed
        } else {
            DeploymentStatus::PartiallyFailed
        };

        // record the rollback as its own deployment row referencing the
        // original
        let rollback_id = if self.dry_run {
            None
        } else {
            let record = self.store.create_deployment(
                &deployment.cluster,
                &deployment.namespace,
                &deployment.config_snapshot,
                Some(&deployment.id),
            )?;
            self.store
                .set_deployment_status(&record.id, status, true)?;
            let undone = apps
                .iter()
                .filter(|app| app.status != DeploymentStatus::Skipped);
            for (app, result) in undone.zip(results.iter()) {
                let app_id = self.store.begin_app(
                    &record.id,
                    &app.app_name,
                    &app.app_type,
                    &app.app_group,
                )?;
                self.store
                    .finish_app(app_id, result.status, result.message.as_deref())?;
            }
            Some(record.id)
        };

        Ok(RollbackResult {
            rolled_back_deployment: deployment.id.clone(),
            rollback_deployment_id: rollback_id,
            status,
            apps: results,
        })
    }

    fn rollback_one(&self, app: &AppDeploymentRecord) -> Result<Option<String>> {
        // helm releases first: one per helm app
        if let Some(release) = self.store.helm_release_of(app.id)? {
            let namespace = Some(app_namespace(app, &release.release_name, self.store)?);
            let namespace = namespace.as_deref();
            let message = match release.revision {
                Some(revision) if revision > 1 => {
                    let previous = revision - 1;
                    if self.dry_run {
                        format!("[dry-run] helm rollback {} {}", release.release_name, previous)
                    } else {
                        self.helm
                            .rollback(&release.release_name, previous, namespace)
                            .map_err(|err| helm_error(&release.release_name, err))?;
                        format!("rolled back release to revision {}", previous)
                    }
                }
                _ => {
                    // initial install: nothing to roll back to
                    if self.dry_run {
                        format!("[dry-run] helm uninstall {}", release.release_name)
                    } else {
                        self.helm
                            .uninstall(&release.release_name, namespace)
                            .map_err(|err| helm_error(&release.release_name, err))?;
                        "uninstalled release (was the initial install)".to_string()
                    }
                }
            };
            return Ok(Some(message));
        }

        // raw resources: undo in reverse application order
        let mut resources = self.store.resources_of(app.id)?;
        if resources.is_empty() {
            return Ok(None);
        }
        resources.reverse();
        let mut reverted = 0usize;
        for resource in &resources {
            let reference = ResourceRef {
                api_version: resource.api_version.clone(),
                kind: resource.kind.clone(),
                name: resource.name.clone(),
                namespace: resource.namespace.clone(),
            };
            if self.dry_run {
                crate::log_info!("[dry-run] would revert {} ({})", reference, resource.action);
                continue;
            }
            match (resource.action, resource.previous_state.as_deref()) {
                // created by the deployment: delete it
                (ResourceAction::Create, _) => {
                    self.kubectl
                        .delete_resource(&reference)
                        .map_err(|err| resource_error(&reference, err))?;
                }
                // updated or deleted: restore the previous object
                (ResourceAction::Update, Some(previous))
                | (ResourceAction::Apply, Some(previous))
                | (ResourceAction::Delete, Some(previous)) => {
                    self.kubectl
                        .apply_stdin(previous, None)
                        .map_err(|err| resource_error(&reference, err))?;
                }
                (action, None) => {
                    return Err(SbkubeError::new(
                        ErrorKind::State,
                        format!(
                            "resource {} has action '{}' but no previous state on record",
                            reference, action
                        ),
                    )
                    .into());
                }
                (ResourceAction::Rollback, Some(previous)) => {
                    self.kubectl
                        .apply_stdin(previous, None)
                        .map_err(|err| resource_error(&reference, err))?;
                }
            }
            reverted += 1;
        }
        Ok(Some(format!("reverted {} resource(s)", reverted)))
    }
}

/// Namespace for a helm rollback: the deployment row's namespace.
fn app_namespace(
    app: &AppDeploymentRecord,
    _release: &str,
    store: &StateStore,
) -> Result<String> {
    let deployment = store
        .deployment(&app.deployment_id)?
        .context("app record references a missing deployment")?;
    Ok(deployment.namespace)
}

fn helm_error(release: &str, err: crate::tools::ToolError) -> anyhow::Error {
    SbkubeError::new(
        ErrorKind::Helm,
        format!("helm rollback failed for release '{}'", release),
    )
    .with_details(format!("{}\n{}", err, err.stderr()))
    .into()
}

fn resource_error(resource: &ResourceRef, err: crate::tools::ToolError) -> anyhow::Error {
    SbkubeError::new(
        ErrorKind::Kubernetes,
        format!("failed to revert {}", resource),
    )
    .with_details(format!("{}\n{}", err, err.stderr()))
    .into()
}
