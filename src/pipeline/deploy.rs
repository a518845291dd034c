//! The deploy stage: type-specific execution with state write-through
//!
//! Every mutated Kubernetes object is snapshotted before and after the
//! mutation so the rollback engine can restore it later. Helm releases
//! record their post-install revision and fully merged values.

use crate::config::model::{ActionKind, App, ExecApp, HelmApp, YamlApp};
use crate::config::settings::{merged_values, EffectiveSettings};
use crate::hooks::executor::{AppliedHookResource, HookContext, HookExecutor};
use crate::manifest::{self, ResourceRef};
use crate::state::{DeploymentStatus, ResourceAction, StateStore};
use crate::tools::helm::UpgradeParams;
use crate::tools::{Helm, Kubectl, ToolInvocation};
use crate::utils::errors::{ErrorKind, SbkubeError};
use anyhow::{Context, Result};
use std::path::Path;
use std::time::Duration;

/// Everything deploy execution needs beyond the app itself.
pub struct DeployEnv<'a> {
    pub doc_dir: &'a Path,
    pub caches_root: &'a Path,
    pub effective: &'a EffectiveSettings,
    pub helm: &'a Helm,
    pub kubectl: &'a Kubectl,
    pub store: Option<&'a StateStore>,
    pub app_deployment_id: Option<i64>,
    pub dry_run: bool,
}

impl DeployEnv<'_> {
    fn record_resource(
        &self,
        resource: &ResourceRef,
        action: ResourceAction,
        previous: Option<&str>,
        current: Option<&str>,
    ) -> Result<()> {
        if let (Some(store), Some(app_id)) = (self.store, self.app_deployment_id) {
            store.record_resource(app_id, resource, action, previous, current)?;
        }
        Ok(())
    }

    pub(crate) fn record_applied(&self, applied: &[AppliedHookResource]) -> Result<()> {
        for entry in applied {
            self.record_resource(
                &entry.resource,
                entry.action,
                entry.previous_state.as_deref(),
                entry.current_state.as_deref(),
            )?;
        }
        Ok(())
    }
}

/// Deploy one app. The caller owns hook sequencing and status bookkeeping.
pub fn deploy_app(
    app_name: &str,
    app: &App,
    namespace: Option<&str>,
    env: &DeployEnv<'_>,
) -> Result<()> {
    match app {
        App::Helm(helm_app) => deploy_helm(app_name, helm_app, namespace, env),
        App::Yaml(yaml_app) => deploy_yaml(app_name, yaml_app, namespace, env),
        App::Kustomize(kustomize_app) => {
            let rendered =
                super::template::render_kustomize(app_name, kustomize_app, env.doc_dir, env.kubectl)?;
            let objects = manifest::parse_documents(&rendered, namespace)
                .with_context(|| format!("kustomize output for '{}'", app_name))?;
            apply_objects(objects, namespace, env)
        }
        App::Action(action_app) => {
            for step in &action_app.actions {
                let path = crate::utils::paths::resolve_relative(env.doc_dir, &step.path);
                let objects = manifest::load_file(&path, namespace)?;
                match step.action {
                    ActionKind::Apply => apply_objects(objects, namespace, env)?,
                    ActionKind::Create => create_objects(objects, namespace, env)?,
                    ActionKind::Delete => delete_objects(objects, env)?,
                }
            }
            Ok(())
        }
        App::Exec(exec_app) => deploy_exec(app_name, exec_app, env),
        App::Hook(hook_app) => {
            let executor = HookExecutor::new(env.kubectl);
            let ctx = hook_context(app_name, app, namespace, env);
            let report = executor.run_tasks(&hook_app.tasks, &ctx)?;
            env.record_applied(&report.applied)
        }
        // materialized during prepare; deploy has nothing left to do
        App::Git(_) | App::Http(_) | App::Noop(_) => Ok(()),
    }
}

/// Hook context for an app's own hooks (shared by the orchestrator).
pub fn hook_context(
    app_name: &str,
    app: &App,
    namespace: Option<&str>,
    env: &DeployEnv<'_>,
) -> HookContext {
    let release_name = match app {
        App::Helm(helm_app) => helm_app.release_name_or(app_name).to_string(),
        _ => app_name.to_string(),
    };
    HookContext {
        app_name: app_name.to_string(),
        namespace: namespace.map(str::to_string),
        release_name,
        cluster: env.effective.cluster_label(),
        base_dir: env.doc_dir.to_path_buf(),
        dry_run: env.dry_run,
    }
}

fn deploy_helm(
    app_name: &str,
    app: &HelmApp,
    namespace: Option<&str>,
    env: &DeployEnv<'_>,
) -> Result<()> {
    let chart_dir =
        super::build::effective_chart_dir(app_name, app, env.doc_dir, env.caches_root);
    if !env.dry_run && !chart_dir.is_dir() {
        return Err(SbkubeError::new(
            ErrorKind::Filesystem,
            format!(
                "chart directory {} not found for app '{}'",
                chart_dir.display(),
                app_name
            ),
        )
        .with_hint("run 'sbkube prepare' first, or 'sbkube apply' for the full pipeline")
        .into());
    }

    let values = super::template::values_args(env.effective, app, env.doc_dir)?;
    let release = app.release_name_or(app_name).to_string();
    let params = UpgradeParams {
        release: release.clone(),
        chart_path: chart_dir.clone(),
        namespace: namespace.map(str::to_string),
        create_namespace: app.create_namespace,
        values_files: values.files.clone(),
        set_values: app.set_values.clone(),
        wait: app.wait,
        timeout: app.timeout.clone(),
        atomic: app.atomic,
    };

    if env.dry_run {
        crate::log_info!(
            "[dry-run] helm upgrade --install {} {} --namespace {}",
            release,
            chart_dir.display(),
            namespace.unwrap_or("<default>")
        );
        return Ok(());
    }

    env.helm.upgrade_install(&params).map_err(|err| {
        SbkubeError::new(ErrorKind::Helm, format!("helm upgrade failed for '{}'", app_name))
            .with_details(format!("{}\n{}", err, err.stderr()))
    })?;

    // record the release with its post-install revision and merged values
    let revision = env.helm.release_revision(&release, namespace).unwrap_or(None);
    let chart_version = super::template::chart_yaml_version(&chart_dir)
        .or_else(|| app.version.clone());
    let full_values = merged_values(env.effective, &resolved_values_paths(app, env.doc_dir), &app.set_values)
        .unwrap_or(serde_json::Value::Null);
    if let (Some(store), Some(app_id)) = (env.store, env.app_deployment_id) {
        store.record_helm_release(
            app_id,
            &release,
            &app.chart,
            chart_version.as_deref(),
            revision,
            &serde_json::to_string(&full_values)?,
            DeploymentStatus::Success,
        )?;
    }
    Ok(())
}

fn resolved_values_paths(app: &HelmApp, doc_dir: &Path) -> Vec<std::path::PathBuf> {
    app.values
        .iter()
        .map(|f| crate::utils::paths::resolve_relative(doc_dir, f))
        .collect()
}

fn deploy_yaml(
    _app_name: &str,
    app: &YamlApp,
    namespace: Option<&str>,
    env: &DeployEnv<'_>,
) -> Result<()> {
    for file in &app.files {
        let path = crate::utils::paths::resolve_relative(env.doc_dir, file);
        let objects = manifest::load_file(&path, namespace)?;
        apply_objects(objects, namespace, env)?;
    }
    Ok(())
}

/// Apply objects one at a time, snapshotting state around each mutation.
fn apply_objects(
    objects: Vec<(ResourceRef, serde_yaml::Value)>,
    namespace: Option<&str>,
    env: &DeployEnv<'_>,
) -> Result<()> {
    for (resource, value) in objects {
        if env.dry_run {
            crate::log_info!("[dry-run] kubectl apply {}", resource);
            continue;
        }
        let previous = env.kubectl.get_yaml(&resource)?;
        let action = if previous.is_some() {
            ResourceAction::Update
        } else {
            ResourceAction::Create
        };
        let yaml = serde_yaml::to_string(&value).context("failed to reserialize manifest")?;
        let flag_namespace = namespace_flag(&value, &resource, namespace);
        env.kubectl
            .apply_stdin(&yaml, flag_namespace)
            .map_err(kubernetes_error)?;
        let current = env.kubectl.get_yaml(&resource)?;
        env.record_resource(&resource, action, previous.as_deref(), current.as_deref())?;
    }
    Ok(())
}

fn create_objects(
    objects: Vec<(ResourceRef, serde_yaml::Value)>,
    namespace: Option<&str>,
    env: &DeployEnv<'_>,
) -> Result<()> {
    for (resource, value) in objects {
        if env.dry_run {
            crate::log_info!("[dry-run] kubectl create {}", resource);
            continue;
        }
        // create semantics: the object must not exist yet
        if env.kubectl.exists(&resource)? {
            return Err(SbkubeError::new(
                ErrorKind::Kubernetes,
                format!("{} already exists", resource),
            )
            .with_hint("use an 'apply' action for idempotent updates")
            .into());
        }
        let yaml = serde_yaml::to_string(&value).context("failed to reserialize manifest")?;
        let flag_namespace = namespace_flag(&value, &resource, namespace);
        env.kubectl
            .apply_stdin(&yaml, flag_namespace)
            .map_err(kubernetes_error)?;
        let current = env.kubectl.get_yaml(&resource)?;
        env.record_resource(&resource, ResourceAction::Create, None, current.as_deref())?;
    }
    Ok(())
}

fn delete_objects(
    objects: Vec<(ResourceRef, serde_yaml::Value)>,
    env: &DeployEnv<'_>,
) -> Result<()> {
    for (resource, _value) in objects {
        if env.dry_run {
            crate::log_info!("[dry-run] kubectl delete {}", resource);
            continue;
        }
        let previous = env.kubectl.get_yaml(&resource)?;
        env.kubectl.delete_resource(&resource).map_err(kubernetes_error)?;
        // deletes must keep previous_state for rollback
        env.record_resource(&resource, ResourceAction::Delete, previous.as_deref(), None)?;
    }
    Ok(())
}

fn namespace_flag<'a>(
    value: &serde_yaml::Value,
    resource: &'a ResourceRef,
    _namespace: Option<&str>,
) -> Option<&'a str> {
    match value.get("metadata").and_then(|m| m.get("namespace")) {
        Some(_) => None,
        None => resource.namespace.as_deref(),
    }
}

fn kubernetes_error(err: crate::tools::ToolError) -> anyhow::Error {
    SbkubeError::new(ErrorKind::Kubernetes, "kubectl operation failed")
        .with_details(format!("{}\n{}", err, err.stderr()))
        .into()
}

fn deploy_exec(app_name: &str, app: &ExecApp, env: &DeployEnv<'_>) -> Result<()> {
    for command in &app.commands {
        if env.dry_run {
            crate::log_info!("[dry-run] exec: {}", command);
            continue;
        }
        // exec apps are explicitly arbitrary shell lines
        ToolInvocation::new("sh")
            .args(["-c", command])
            .current_dir(env.doc_dir)
            .timeout(Duration::from_secs(crate::hooks::DEFAULT_TASK_TIMEOUT_SECS))
            .run()
            .map_err(|err| {
                SbkubeError::new(
                    ErrorKind::Hook,
                    format!("exec command failed for '{}'", app_name),
                )
                .with_details(format!("{}\ncommand: {}", err, command))
            })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::parse_unified;
    use crate::config::settings::Settings;

    fn env<'a>(
        doc_dir: &'a Path,
        effective: &'a EffectiveSettings,
        helm: &'a Helm,
        kubectl: &'a Kubectl,
        store: Option<&'a StateStore>,
        dry_run: bool,
    ) -> DeployEnv<'a> {
        DeployEnv {
            doc_dir,
            caches_root: doc_dir,
            effective,
            helm,
            kubectl,
            store,
            app_deployment_id: None,
            dry_run,
        }
    }

    #[test]
    fn test_noop_and_prepared_types_succeed() {
        let config = parse_unified(
            "apiVersion: sbkube/v1\nsettings:\n  git_repos:\n    src: {url: 'https://example.com/repo.git'}\napps:\n  ph:\n    type: noop\n  src:\n    type: git\n    repo: src\n",
        )
        .unwrap();
        let effective = EffectiveSettings::root(&config.settings, Path::new("/ws"));
        let helm = Helm::default();
        let kubectl = Kubectl::default();
        let deploy_env = env(Path::new("/ws"), &effective, &helm, &kubectl, None, false);
        assert!(deploy_app("ph", &config.apps["ph"], None, &deploy_env).is_ok());
        assert!(deploy_app("src", &config.apps["src"], None, &deploy_env).is_ok());
    }

    #[test]
    fn test_exec_stops_on_first_failure() {
        let dir = tempfile::tempdir().unwrap();
        let config = parse_unified(
            "apiVersion: sbkube/v1\napps:\n  run:\n    type: exec\n    commands:\n      - 'true'\n      - 'false'\n      - touch should-not-exist\n",
        )
        .unwrap();
        let effective = EffectiveSettings::root(&Settings::default(), dir.path());
        let helm = Helm::default();
        let kubectl = Kubectl::default();
        let deploy_env = env(dir.path(), &effective, &helm, &kubectl, None, false);
        let err = deploy_app("run", &config.apps["run"], None, &deploy_env).unwrap_err();
        let sb = err.downcast_ref::<SbkubeError>().unwrap();
        assert!(sb.message.contains("exec command failed"));
        assert!(!dir.path().join("should-not-exist").exists());
    }

    #[test]
    fn test_exec_runs_in_doc_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = parse_unified(
            "apiVersion: sbkube/v1\napps:\n  run:\n    type: exec\n    commands: [touch marker]\n",
        )
        .unwrap();
        let effective = EffectiveSettings::root(&Settings::default(), dir.path());
        let helm = Helm::default();
        let kubectl = Kubectl::default();
        let deploy_env = env(dir.path(), &effective, &helm, &kubectl, None, false);
        deploy_app("run", &config.apps["run"], None, &deploy_env).unwrap();
        assert!(dir.path().join("marker").exists());
    }

    #[test]
    fn test_dry_run_never_touches_cluster_or_store() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("app.yaml"),
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm\n",
        )
        .unwrap();
        let config = parse_unified(
            "apiVersion: sbkube/v1\napps:\n  web:\n    type: yaml\n    files: [app.yaml]\n",
        )
        .unwrap();
        let effective = EffectiveSettings::root(&Settings::default(), dir.path());
        let helm = Helm::default();
        let kubectl = Kubectl::default();
        let store = StateStore::open_in_memory().unwrap();
        let deploy_env = env(dir.path(), &effective, &helm, &kubectl, Some(&store), true);
        deploy_app("web", &config.apps["web"], Some("demo"), &deploy_env).unwrap();
        // nothing recorded under dry-run (no app record was even created)
        assert!(store.list_deployments(None, None, None, 10).unwrap().is_empty());
    }

    #[test]
    fn test_hook_context_release_name() {
        let config = parse_unified(
            "apiVersion: sbkube/v1\nsettings:\n  helm_repos:\n    r: https://r\napps:\n  cache:\n    type: helm\n    chart: r/redis\n    release_name: custom\n",
        )
        .unwrap();
        let effective = EffectiveSettings::root(&config.settings, Path::new("/ws"));
        let helm = Helm::default();
        let kubectl = Kubectl::default();
        let deploy_env = env(Path::new("/ws"), &effective, &helm, &kubectl, None, false);
        let ctx = hook_context("cache", &config.apps["cache"], Some("demo"), &deploy_env);
        assert_eq!(ctx.release_name, "custom");
        assert_eq!(ctx.namespace.as_deref(), Some("demo"));
    }
}
