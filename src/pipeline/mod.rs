//! The pipeline orchestrator: prepare → build → template → deploy
//!
//! Stages run over one document (app group) at a time in dependency order.
//! Prepare may fan independent apps out over a worker pool; deploy runs
//! sequentially so state writes stay single-writer. A failed app never
//! aborts its stage — its transitive dependents are skipped at deploy time
//! and everything else continues (partial-failure semantics).

pub mod build;
pub mod deploy;
pub mod prepare;
pub mod template;
pub mod trace;

use crate::config::phases::PhaseNode;
use crate::deps;
use crate::hooks::{HookExecutor, HookPoint, HookStage};
use crate::state::{DeploymentStatus, StateStore};
use crate::tools::{Git, Helm, Kubectl};
use crate::utils::errors::{ErrorKind, SbkubeError};
use crate::utils::interrupt;
use anyhow::{Context, Result};
use clap::ValueEnum;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::mpsc;
use threadpool::ThreadPool;
use trace::{RunTrace, TraceStatus};

/// The four pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
#[value(rename_all = "lowercase")]
pub enum Stage {
    Prepare,
    Build,
    Template,
    Deploy,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Prepare, Stage::Build, Stage::Template, Stage::Deploy];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Prepare => "prepare",
            Stage::Build => "build",
            Stage::Template => "template",
            Stage::Deploy => "deploy",
        }
    }
}

/// Options common to the pipeline commands.
#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    /// Restrict to one app and its transitive dependencies.
    pub app: Option<String>,
    pub from_step: Option<Stage>,
    pub to_step: Option<Stage>,
    pub only: Option<Stage>,
    pub force: bool,
    pub dry_run: bool,
    pub output_dir: Option<PathBuf>,
    pub retry_failed: bool,
    pub resume: bool,
    pub namespace: Option<String>,
    pub kubeconfig: Option<PathBuf>,
    pub context: Option<String>,
}

impl PipelineOptions {
    /// The stage window selected by `--from-step`/`--to-step`/`--only`.
    pub fn stage_window(&self) -> Vec<Stage> {
        if let Some(only) = self.only {
            return vec![only];
        }
        let from = self.from_step.unwrap_or(Stage::Prepare);
        let to = self.to_step.unwrap_or(Stage::Deploy);
        Stage::ALL
            .into_iter()
            .filter(|stage| *stage >= from && *stage <= to)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    Failed,
    Skipped,
}

/// One app's result in one stage.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StageOutcome {
    pub app: String,
    pub stage: String,
    pub status: OutcomeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// The result of running a stage window over one group.
#[derive(Debug, Clone, serde::Serialize)]
pub struct GroupRunResult {
    pub group: String,
    pub outcomes: Vec<StageOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment_status: Option<DeploymentStatus>,
}

impl GroupRunResult {
    pub fn any_failed(&self) -> bool {
        self.outcomes
            .iter()
            .any(|o| o.status == OutcomeStatus::Failed)
    }
}

/// Drives one group (document) through the selected stages.
pub struct Orchestrator<'a> {
    node: &'a PhaseNode,
    caches_root: PathBuf,
    options: &'a PipelineOptions,
    helm: Helm,
    kubectl: Kubectl,
    git: Git,
}

impl<'a> Orchestrator<'a> {
    pub fn new(node: &'a PhaseNode, caches_root: PathBuf, options: &'a PipelineOptions) -> Self {
        let kubeconfig = options
            .kubeconfig
            .clone()
            .or_else(|| node.effective.kubeconfig_path());
        let context = options
            .context
            .clone()
            .or_else(|| node.effective.merged.kubeconfig_context.clone());
        Self {
            node,
            caches_root,
            options,
            helm: Helm::new(kubeconfig.clone(), context.clone()),
            kubectl: Kubectl::new(kubeconfig, context),
            git: Git::new(),
        }
    }

    fn namespace_for(&self, app: &crate::config::model::App) -> Option<String> {
        self.options
            .namespace
            .clone()
            .or_else(|| app.common().namespace.clone())
            .or_else(|| self.node.effective.merged.namespace.clone())
    }

    /// Apps to process, in topological order, honoring `--app` and the
    /// resume/retry filters.
    fn selection(&self, previous_trace: Option<&RunTrace>) -> Result<Vec<String>> {
        let order = deps::topo_order(&self.node.config)?;
        let mut selected: Vec<String> = match &self.options.app {
            Some(target) => {
                if !self.node.config.apps.contains_key(target) {
                    return Err(SbkubeError::new(
                        ErrorKind::Config,
                        format!("--app '{}' is not defined in this document", target),
                    )
                    .into());
                }
                let wanted = self.closure_with_dependencies(target);
                order.into_iter().filter(|app| wanted.contains(app)).collect()
            }
            None => order,
        };

        if let Some(previous) = previous_trace {
            if self.options.retry_failed {
                selected.retain(|app| {
                    previous.status_of(app, Stage::Deploy.as_str()) == Some(TraceStatus::Failed)
                });
            } else if self.options.resume {
                selected.retain(|app| {
                    previous.status_of(app, Stage::Deploy.as_str()) != Some(TraceStatus::Success)
                });
            }
        }
        Ok(selected)
    }

    /// The target app plus everything it transitively depends on.
    fn closure_with_dependencies(&self, target: &str) -> BTreeSet<String> {
        let mut wanted = BTreeSet::new();
        let mut frontier = vec![target.to_string()];
        while let Some(current) = frontier.pop() {
            if !wanted.insert(current.clone()) {
                continue;
            }
            if let Some(app) = self.node.config.apps.get(&current) {
                frontier.extend(app.common().depends_on.iter().cloned());
            }
        }
        wanted
    }

    /// Run the configured stage window. `store` is absent in dry-run.
    pub fn run(&self, store: Option<&StateStore>) -> Result<GroupRunResult> {
        let stages = self.options.stage_window();
        let config_hash = trace::config_hash(&self.node.config);

        let previous_trace = if self.options.retry_failed || self.options.resume {
            let found =
                RunTrace::load_latest(&self.caches_root, &self.node.group, &config_hash);
            if found.is_none() {
                crate::log_warn!(
                    "no reusable execution trace found (configuration changed or first run); processing all apps"
                );
            }
            found
        } else {
            None
        };

        let selection = self.selection(previous_trace.as_ref())?;
        let mut run_trace = RunTrace::new(&self.caches_root, &self.node.group, &config_hash);
        let mut outcomes: Vec<StageOutcome> = Vec::new();
        let mut failed: BTreeSet<String> = BTreeSet::new();
        let mut deployment_id = None;
        let mut deployment_status = None;

        for stage in stages {
            match stage {
                Stage::Prepare => self.run_prepare(&selection, &mut outcomes, &mut failed, &mut run_trace)?,
                Stage::Build => self.run_build(&selection, &mut outcomes, &mut failed, &mut run_trace)?,
                Stage::Template => self.run_template(&selection, &mut outcomes, &mut failed, &mut run_trace)?,
                Stage::Deploy => {
                    let (id, status) = self.run_deploy(
                        &selection,
                        store,
                        &mut outcomes,
                        &mut failed,
                        &mut run_trace,
                    )?;
                    deployment_id = id;
                    deployment_status = status;
                }
            }
        }

        if let Err(err) = run_trace.save() {
            crate::log_warn!("failed to save execution trace: {}", err);
        }

        Ok(GroupRunResult {
            group: self.node.group.clone(),
            outcomes,
            deployment_id,
            deployment_status,
        })
    }

    fn doc_hooks(&self) -> &crate::hooks::HookSet {
        &self.node.config.hooks
    }

    fn group_hook_ctx(&self) -> crate::hooks::executor::HookContext {
        crate::hooks::executor::HookContext {
            app_name: self.node.group.clone(),
            namespace: self
                .options
                .namespace
                .clone()
                .or_else(|| self.node.effective.merged.namespace.clone()),
            release_name: self.node.group.clone(),
            cluster: self.node.effective.cluster_label(),
            base_dir: self.node.dir.clone(),
            dry_run: self.options.dry_run,
        }
    }

    fn run_prepare(
        &self,
        selection: &[String],
        outcomes: &mut Vec<StageOutcome>,
        failed: &mut BTreeSet<String>,
        run_trace: &mut RunTrace,
    ) -> Result<()> {
        let executor = HookExecutor::new(&self.kubectl);
        executor
            .run_simple(
                self.doc_hooks().simple(HookStage::Prepare, HookPoint::Pre),
                &self.group_hook_ctx(),
            )
            .context("command-level pre_prepare hook failed")?;

        let waves = self.dependency_waves(selection);
        let pool_size = self.node.effective.worker_pool();
        let mut stage_failed = false;

        for wave in waves {
            let results = if pool_size > 1 && wave.len() > 1 {
                self.prepare_wave_parallel(&wave, pool_size)
            } else {
                wave.iter()
                    .map(|app| {
                        let result = crate::utils::progress::with_stage_spinner(
                            Stage::Prepare.as_str(),
                            app,
                            || self.prepare_one(app),
                        );
                        (app.clone(), result)
                    })
                    .collect()
            };
            for (app, result) in results {
                match result {
                    Ok(message) => {
                        crate::log_info!("prepare {}: {}", app, message);
                        run_trace.record(&app, Stage::Prepare.as_str(), TraceStatus::Success);
                        outcomes.push(StageOutcome {
                            app,
                            stage: Stage::Prepare.as_str().to_string(),
                            status: OutcomeStatus::Success,
                            message: Some(message),
                        });
                    }
                    Err(err) => {
                        crate::log_error!("prepare {}: {}", app, err);
                        stage_failed = true;
                        failed.insert(app.clone());
                        run_trace.record(&app, Stage::Prepare.as_str(), TraceStatus::Failed);
                        outcomes.push(StageOutcome {
                            app,
                            stage: Stage::Prepare.as_str().to_string(),
                            status: OutcomeStatus::Failed,
                            message: Some(err.to_string()),
                        });
                    }
                }
            }
        }

        let point = if stage_failed { HookPoint::OnFailure } else { HookPoint::Post };
        if let Err(err) = executor.run_simple(
            self.doc_hooks().simple(HookStage::Prepare, point),
            &self.group_hook_ctx(),
        ) {
            crate::log_warn!("command-level prepare hook failed: {}", err);
        }
        Ok(())
    }

    /// Waves of apps whose dependencies all sit in earlier waves; items in
    /// one wave are mutually independent and may run in parallel.
    fn dependency_waves(&self, selection: &[String]) -> Vec<Vec<String>> {
        let selected: BTreeSet<&str> = selection.iter().map(String::as_str).collect();
        let mut level: BTreeMap<&str, usize> = BTreeMap::new();
        // selection is already topologically ordered
        for app in selection {
            let deps_level = self.node.config.apps[app]
                .common()
                .depends_on
                .iter()
                .filter(|dep| selected.contains(dep.as_str()))
                .filter_map(|dep| level.get(dep.as_str()))
                .max()
                .copied();
            level.insert(app.as_str(), deps_level.map_or(0, |l| l + 1));
        }
        let mut waves: Vec<Vec<String>> = Vec::new();
        for app in selection {
            let wave = level[app.as_str()];
            while waves.len() <= wave {
                waves.push(Vec::new());
            }
            waves[wave].push(app.clone());
        }
        waves
    }

    fn prepare_one(&self, app_name: &str) -> Result<String> {
        let app = &self.node.config.apps[app_name];
        let executor = HookExecutor::new(&self.kubectl);
        let ctx = deploy::hook_context(
            app_name,
            app,
            self.namespace_for(app).as_deref(),
            &self.deploy_env(None, None),
        );
        executor.run_simple(app.common().hooks.simple(HookStage::Prepare, HookPoint::Pre), &ctx)?;
        let result = prepare::prepare_app(
            app_name,
            app,
            &self.node.dir,
            &self.caches_root,
            &self.node.effective,
            &self.helm,
            &self.git,
            self.options.force,
            self.options.dry_run,
        );
        let point = if result.is_ok() { HookPoint::Post } else { HookPoint::OnFailure };
        if let Err(err) =
            executor.run_simple(app.common().hooks.simple(HookStage::Prepare, point), &ctx)
        {
            crate::log_warn!("prepare hook for '{}' failed: {}", app_name, err);
        }
        result
    }

    fn prepare_wave_parallel(
        &self,
        wave: &[String],
        pool_size: usize,
    ) -> Vec<(String, Result<String>)> {
        let pool = ThreadPool::new(pool_size.min(wave.len()));
        let (tx, rx) = mpsc::channel();
        for app_name in wave {
            let tx = tx.clone();
            let app_name = app_name.clone();
            let app = self.node.config.apps[&app_name].clone();
            let doc_dir = self.node.dir.clone();
            let caches_root = self.caches_root.clone();
            let effective = self.node.effective.clone();
            let helm = self.helm.clone();
            let git = Clone::clone(&self.git);
            let kubectl = self.kubectl.clone();
            let namespace = self.namespace_for(&app);
            let cluster = self.node.effective.cluster_label();
            let force = self.options.force;
            let dry_run = self.options.dry_run;
            pool.execute(move || {
                let executor = HookExecutor::new(&kubectl);
                let ctx = crate::hooks::executor::HookContext {
                    app_name: app_name.clone(),
                    namespace,
                    release_name: app_name.clone(),
                    cluster,
                    base_dir: doc_dir.clone(),
                    dry_run,
                };
                let result = executor
                    .run_simple(app.common().hooks.simple(HookStage::Prepare, HookPoint::Pre), &ctx)
                    .and_then(|_| {
                        prepare::prepare_app(
                            &app_name, &app, &doc_dir, &caches_root, &effective, &helm, &git,
                            force, dry_run,
                        )
                    });
                let point = if result.is_ok() { HookPoint::Post } else { HookPoint::OnFailure };
                if let Err(err) =
                    executor.run_simple(app.common().hooks.simple(HookStage::Prepare, point), &ctx)
                {
                    crate::log_warn!("prepare hook for '{}' failed: {}", app_name, err);
                }
                let _ = tx.send((app_name, result));
            });
        }
        drop(tx);
        let mut results: Vec<(String, Result<String>)> = rx.iter().collect();
        // deterministic reporting order regardless of completion order
        results.sort_by(|a, b| a.0.cmp(&b.0));
        results
    }

    fn run_build(
        &self,
        selection: &[String],
        outcomes: &mut Vec<StageOutcome>,
        failed: &mut BTreeSet<String>,
        run_trace: &mut RunTrace,
    ) -> Result<()> {
        let executor = HookExecutor::new(&self.kubectl);
        executor
            .run_simple(
                self.doc_hooks().simple(HookStage::Build, HookPoint::Pre),
                &self.group_hook_ctx(),
            )
            .context("command-level pre_build hook failed")?;

        let mut stage_failed = false;
        for app_name in selection {
            if failed.contains(app_name) {
                outcomes.push(StageOutcome {
                    app: app_name.clone(),
                    stage: Stage::Build.as_str().to_string(),
                    status: OutcomeStatus::Skipped,
                    message: Some("earlier stage failed".to_string()),
                });
                continue;
            }
            let app = &self.node.config.apps[app_name];
            let crate::config::model::App::Helm(helm_app) = app else {
                continue;
            };
            let ctx = deploy::hook_context(
                app_name,
                app,
                self.namespace_for(app).as_deref(),
                &self.deploy_env(None, None),
            );
            let result = executor
                .run_simple(app.common().hooks.simple(HookStage::Build, HookPoint::Pre), &ctx)
                .and_then(|_| {
                    build::build_app(
                        app_name,
                        helm_app,
                        &self.node.dir,
                        &self.caches_root,
                        &self.node.effective,
                        self.options.dry_run,
                    )
                });
            let point = if result.is_ok() { HookPoint::Post } else { HookPoint::OnFailure };
            if let Err(err) =
                executor.run_simple(app.common().hooks.simple(HookStage::Build, point), &ctx)
            {
                crate::log_warn!("build hook for '{}' failed: {}", app_name, err);
            }
            match result {
                Ok(staged) => {
                    let message = match staged {
                        Some(dir) => format!("staged into {}", dir.display()),
                        None => "local chart, no build output needed".to_string(),
                    };
                    crate::log_info!("build {}: {}", app_name, message);
                    run_trace.record(app_name, Stage::Build.as_str(), TraceStatus::Success);
                    outcomes.push(StageOutcome {
                        app: app_name.clone(),
                        stage: Stage::Build.as_str().to_string(),
                        status: OutcomeStatus::Success,
                        message: Some(message),
                    });
                }
                Err(err) => {
                    crate::log_error!("build {}: {}", app_name, err);
                    stage_failed = true;
                    failed.insert(app_name.clone());
                    run_trace.record(app_name, Stage::Build.as_str(), TraceStatus::Failed);
                    outcomes.push(StageOutcome {
                        app: app_name.clone(),
                        stage: Stage::Build.as_str().to_string(),
                        status: OutcomeStatus::Failed,
                        message: Some(err.to_string()),
                    });
                }
            }
        }

        let point = if stage_failed { HookPoint::OnFailure } else { HookPoint::Post };
        if let Err(err) = executor.run_simple(
            self.doc_hooks().simple(HookStage::Build, point),
            &self.group_hook_ctx(),
        ) {
            crate::log_warn!("command-level build hook failed: {}", err);
        }
        Ok(())
    }

    fn run_template(
        &self,
        selection: &[String],
        outcomes: &mut Vec<StageOutcome>,
        failed: &mut BTreeSet<String>,
        run_trace: &mut RunTrace,
    ) -> Result<()> {
        for app_name in selection {
            if failed.contains(app_name) {
                outcomes.push(StageOutcome {
                    app: app_name.clone(),
                    stage: Stage::Template.as_str().to_string(),
                    status: OutcomeStatus::Skipped,
                    message: Some("earlier stage failed".to_string()),
                });
                continue;
            }
            let app = &self.node.config.apps[app_name];
            let result = template::template_app(
                app_name,
                app,
                &self.node.dir,
                &self.caches_root,
                &self.node.effective,
                self.namespace_for(app).as_deref(),
                &self.helm,
                &self.kubectl,
                self.options.output_dir.as_deref(),
                self.options.dry_run,
            );
            match result {
                Ok(_) => {
                    run_trace.record(app_name, Stage::Template.as_str(), TraceStatus::Success);
                    outcomes.push(StageOutcome {
                        app: app_name.clone(),
                        stage: Stage::Template.as_str().to_string(),
                        status: OutcomeStatus::Success,
                        message: None,
                    });
                }
                Err(err) => {
                    crate::log_error!("template {}: {}", app_name, err);
                    failed.insert(app_name.clone());
                    run_trace.record(app_name, Stage::Template.as_str(), TraceStatus::Failed);
                    outcomes.push(StageOutcome {
                        app: app_name.clone(),
                        stage: Stage::Template.as_str().to_string(),
                        status: OutcomeStatus::Failed,
                        message: Some(err.to_string()),
                    });
                }
            }
        }
        Ok(())
    }

    fn deploy_env<'b>(
        &'b self,
        store: Option<&'b StateStore>,
        app_deployment_id: Option<i64>,
    ) -> deploy::DeployEnv<'b> {
        deploy::DeployEnv {
            doc_dir: &self.node.dir,
            caches_root: &self.caches_root,
            effective: &self.node.effective,
            helm: &self.helm,
            kubectl: &self.kubectl,
            store,
            app_deployment_id,
            dry_run: self.options.dry_run,
        }
    }

    #[allow(clippy::type_complexity)]
    fn run_deploy(
        &self,
        selection: &[String],
        store: Option<&StateStore>,
        outcomes: &mut Vec<StageOutcome>,
        failed: &mut BTreeSet<String>,
        run_trace: &mut RunTrace,
    ) -> Result<(Option<String>, Option<DeploymentStatus>)> {
        // cross-document requirements resolve against history only
        if let Some(store) = store {
            let missing = deps::check_group_deps(&self.node.config, |group| {
                store
                    .latest_success_namespace_for_group(group)
                    .unwrap_or(None)
            });
            if let Some(first) = missing.first() {
                return Err(SbkubeError::group_not_deployed(&first.group, &first.app).into());
            }
        }

        // context must exist before anything mutates
        if let Some(problem) = crate::config::validate::check_kubeconfig_context(&self.node.effective)
        {
            return Err(SbkubeError::new(ErrorKind::Kubernetes, problem)
                .with_hint("check 'kubectl config get-contexts'")
                .into());
        }

        let namespace = self
            .options
            .namespace
            .clone()
            .or_else(|| self.node.effective.merged.namespace.clone())
            .unwrap_or_else(|| "default".to_string());

        let deployment = match store {
            Some(store) => {
                let snapshot = serde_json::to_string(&self.node.config)
                    .context("failed to snapshot configuration")?;
                let record = store.create_deployment(
                    &self.node.effective.cluster_label(),
                    &namespace,
                    &snapshot,
                    None,
                )?;
                store.set_deployment_status(&record.id, DeploymentStatus::InProgress, false)?;
                Some(record)
            }
            None => None,
        };
        let deployment_id = deployment.as_ref().map(|d| d.id.clone());

        let executor = HookExecutor::new(&self.kubectl);
        let group_ctx = self.group_hook_ctx();
        executor
            .run_simple(
                self.doc_hooks().simple(HookStage::Deploy, HookPoint::Pre),
                &group_ctx,
            )
            .context("command-level pre_deploy hook failed")?;
        executor
            .run_tasks(&self.doc_hooks().pre_deploy_tasks, &group_ctx)
            .context("command-level pre_deploy task failed")?;

        let mut succeeded = 0usize;
        let mut interrupted = false;

        for app_name in selection {
            if interrupt::is_interrupted() {
                interrupted = true;
                break;
            }

            let app = &self.node.config.apps[app_name];
            let skip_reason = if failed.contains(app_name) {
                Some("an earlier stage failed".to_string())
            } else {
                let blockers: Vec<&String> = app
                    .common()
                    .depends_on
                    .iter()
                    .filter(|dep| failed.contains(*dep) || skipped_dependency(outcomes, dep))
                    .collect();
                (!blockers.is_empty()).then(|| {
                    format!(
                        "dependency failed: {}",
                        blockers
                            .iter()
                            .map(|s| s.as_str())
                            .collect::<Vec<_>>()
                            .join(", ")
                    )
                })
            };

            if let Some(reason) = skip_reason {
                crate::log_warn!("deploy {}: skipped ({})", app_name, reason);
                if let (Some(store), Some(deployment)) = (store, deployment.as_ref()) {
                    store.record_skipped_app(
                        &deployment.id,
                        app_name,
                        app.type_name(),
                        &self.node.group,
                        &reason,
                    )?;
                }
                run_trace.record(app_name, Stage::Deploy.as_str(), TraceStatus::Skipped);
                outcomes.push(StageOutcome {
                    app: app_name.clone(),
                    stage: Stage::Deploy.as_str().to_string(),
                    status: OutcomeStatus::Skipped,
                    message: Some(reason),
                });
                continue;
            }

            let app_deployment_id = match (store, deployment.as_ref()) {
                (Some(store), Some(deployment)) => Some(store.begin_app(
                    &deployment.id,
                    app_name,
                    app.type_name(),
                    &self.node.group,
                )?),
                _ => None,
            };

            let result = self.deploy_one(app_name, app, store, app_deployment_id);

            match result {
                Ok(()) => {
                    succeeded += 1;
                    crate::log_info!("deploy {}: success", app_name);
                    if let (Some(store), Some(app_id)) = (store, app_deployment_id) {
                        store.finish_app(app_id, DeploymentStatus::Success, None)?;
                    }
                    run_trace.record(app_name, Stage::Deploy.as_str(), TraceStatus::Success);
                    outcomes.push(StageOutcome {
                        app: app_name.clone(),
                        stage: Stage::Deploy.as_str().to_string(),
                        status: OutcomeStatus::Success,
                        message: None,
                    });
                }
                Err(err) => {
                    crate::log_error!("deploy {}: {}", app_name, err);
                    failed.insert(app_name.clone());
                    if let (Some(store), Some(app_id)) = (store, app_deployment_id) {
                        store.finish_app(app_id, DeploymentStatus::Failed, Some(&err.to_string()))?;
                    }
                    run_trace.record(app_name, Stage::Deploy.as_str(), TraceStatus::Failed);
                    outcomes.push(StageOutcome {
                        app: app_name.clone(),
                        stage: Stage::Deploy.as_str().to_string(),
                        status: OutcomeStatus::Failed,
                        message: Some(err.to_string()),
                    });
                }
            }
        }

        // command-level post hooks mirror the overall outcome
        let overall_ok = failed.is_empty() && !interrupted;
        let point = if overall_ok { HookPoint::Post } else { HookPoint::OnFailure };
        if !interrupted {
            if let Err(err) = executor.run_simple(
                self.doc_hooks().simple(HookStage::Deploy, point),
                &group_ctx,
            ) {
                crate::log_warn!("command-level deploy hook failed: {}", err);
            }
            if overall_ok {
                if let Err(err) = executor.run_tasks(&self.doc_hooks().post_deploy_tasks, &group_ctx)
                {
                    crate::log_warn!("command-level post_deploy task failed: {}", err);
                }
            }
        }

        let deployed_count = selection.len();
        let terminal = if interrupted {
            DeploymentStatus::Failed
        } else if failed.is_empty() && succeeded == deployed_count {
            DeploymentStatus::Success
        } else if succeeded == 0 {
            DeploymentStatus::Failed
        } else {
            DeploymentStatus::PartiallyFailed
        };

        if let (Some(store), Some(deployment)) = (store, deployment.as_ref()) {
            store.set_deployment_status(&deployment.id, terminal, true)?;
        }

        if interrupted {
            return Err(SbkubeError::new(
                ErrorKind::Kubernetes,
                "deployment interrupted by user",
            )
            .into());
        }

        Ok((deployment_id, Some(terminal)))
    }

    fn deploy_one(
        &self,
        app_name: &str,
        app: &crate::config::model::App,
        store: Option<&StateStore>,
        app_deployment_id: Option<i64>,
    ) -> Result<()> {
        let namespace = self.namespace_for(app);
        let env = self.deploy_env(store, app_deployment_id);
        let executor = HookExecutor::new(&self.kubectl);
        let ctx = deploy::hook_context(app_name, app, namespace.as_deref(), &env);

        executor.run_simple(
            app.common().hooks.simple(HookStage::Deploy, HookPoint::Pre),
            &ctx,
        )?;
        let pre_report = executor.run_tasks(&app.common().hooks.pre_deploy_tasks, &ctx)?;
        env.record_applied(&pre_report.applied)?;

        let result = deploy::deploy_app(app_name, app, namespace.as_deref(), &env);

        match &result {
            Ok(()) => {
                executor.run_simple(
                    app.common().hooks.simple(HookStage::Deploy, HookPoint::Post),
                    &ctx,
                )?;
                let post_report = executor.run_tasks(&app.common().hooks.post_deploy_tasks, &ctx)?;
                env.record_applied(&post_report.applied)?;
            }
            Err(_) => {
                if let Err(hook_err) = executor.run_simple(
                    app.common().hooks.simple(HookStage::Deploy, HookPoint::OnFailure),
                    &ctx,
                ) {
                    crate::log_warn!("on_deploy_failure hook for '{}' failed: {}", app_name, hook_err);
                }
            }
        }
        result
    }
}

fn skipped_dependency(outcomes: &[StageOutcome], dep: &str) -> bool {
    outcomes
        .iter()
        .any(|o| o.app == dep && o.stage == "deploy" && o.status == OutcomeStatus::Skipped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::phases::load_workspace;

    fn workspace(yaml: &str) -> (tempfile::TempDir, PhaseNode) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("sbkube.yaml"), yaml).unwrap();
        let node = load_workspace(&dir.path().join("sbkube.yaml")).unwrap();
        (dir, node)
    }

    #[test]
    fn test_stage_window_variants() {
        let mut options = PipelineOptions::default();
        assert_eq!(options.stage_window(), Stage::ALL.to_vec());

        options.from_step = Some(Stage::Build);
        assert_eq!(
            options.stage_window(),
            vec![Stage::Build, Stage::Template, Stage::Deploy]
        );

        options.to_step = Some(Stage::Template);
        assert_eq!(options.stage_window(), vec![Stage::Build, Stage::Template]);

        options.only = Some(Stage::Deploy);
        assert_eq!(options.stage_window(), vec![Stage::Deploy]);
    }

    #[test]
    fn test_dependency_waves() {
        let (_dir, node) = workspace(
            r#"
apiVersion: sbkube/v1
apps:
  postgres: {type: noop}
  cache: {type: noop}
  backend:
    type: noop
    depends_on: [postgres, cache]
"#,
        );
        let options = PipelineOptions::default();
        let orchestrator = Orchestrator::new(&node, node.dir.clone(), &options);
        let selection = orchestrator.selection(None).unwrap();
        let waves = orchestrator.dependency_waves(&selection);
        assert_eq!(waves.len(), 2);
        assert_eq!(waves[0].len(), 2);
        assert_eq!(waves[1], vec!["backend".to_string()]);
    }

    #[test]
    fn test_app_filter_includes_dependencies() {
        let (_dir, node) = workspace(
            r#"
apiVersion: sbkube/v1
apps:
  postgres: {type: noop}
  cache: {type: noop}
  backend:
    type: noop
    depends_on: [postgres]
  unrelated: {type: noop}
"#,
        );
        let options = PipelineOptions {
            app: Some("backend".to_string()),
            ..Default::default()
        };
        let orchestrator = Orchestrator::new(&node, node.dir.clone(), &options);
        let selection = orchestrator.selection(None).unwrap();
        assert!(selection.contains(&"backend".to_string()));
        assert!(selection.contains(&"postgres".to_string()));
        assert!(!selection.contains(&"unrelated".to_string()));
        assert!(!selection.contains(&"cache".to_string()));
    }

    #[test]
    fn test_unknown_app_filter_rejected() {
        let (_dir, node) = workspace("apiVersion: sbkube/v1\napps:\n  a: {type: noop}\n");
        let options = PipelineOptions {
            app: Some("ghost".to_string()),
            ..Default::default()
        };
        let orchestrator = Orchestrator::new(&node, node.dir.clone(), &options);
        assert!(orchestrator.selection(None).is_err());
    }

    #[test]
    fn test_deploy_noop_records_success() {
        let (_dir, node) = workspace(
            "apiVersion: sbkube/v1\nsettings:\n  cluster: test\n  namespace: demo\napps:\n  ph: {type: noop}\n",
        );
        let options = PipelineOptions {
            only: Some(Stage::Deploy),
            ..Default::default()
        };
        let orchestrator = Orchestrator::new(&node, node.dir.clone(), &options);
        let store = StateStore::open_in_memory().unwrap();
        let result = orchestrator.run(Some(&store)).unwrap();
        assert_eq!(result.deployment_status, Some(DeploymentStatus::Success));
        let deployments = store.list_deployments(None, None, None, 10).unwrap();
        assert_eq!(deployments.len(), 1);
        assert_eq!(deployments[0].cluster, "test");
        assert_eq!(deployments[0].namespace, "demo");
        let apps = store.apps_of(&deployments[0].id).unwrap();
        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0].status, DeploymentStatus::Success);
        // snapshot round-trips through the config model
        let snapshot: crate::config::model::UnifiedConfig =
            serde_json::from_str(&deployments[0].config_snapshot).unwrap();
        assert!(snapshot.apps.contains_key("ph"));
    }

    #[test]
    fn test_partial_failure_skips_dependents_and_continues_independents() {
        let (_dir, node) = workspace(
            r#"
apiVersion: sbkube/v1
settings: {cluster: test, namespace: demo}
apps:
  breaks:
    type: exec
    commands: ['false']
  dependent:
    type: noop
    depends_on: [breaks]
  independent: {type: noop}
"#,
        );
        let options = PipelineOptions {
            only: Some(Stage::Deploy),
            ..Default::default()
        };
        let orchestrator = Orchestrator::new(&node, node.dir.clone(), &options);
        let store = StateStore::open_in_memory().unwrap();
        let result = orchestrator.run(Some(&store)).unwrap();

        assert_eq!(
            result.deployment_status,
            Some(DeploymentStatus::PartiallyFailed)
        );
        let by_app: BTreeMap<String, OutcomeStatus> = result
            .outcomes
            .iter()
            .map(|o| (o.app.clone(), o.status))
            .collect();
        assert_eq!(by_app["breaks"], OutcomeStatus::Failed);
        assert_eq!(by_app["dependent"], OutcomeStatus::Skipped);
        assert_eq!(by_app["independent"], OutcomeStatus::Success);
    }

    #[test]
    fn test_all_failed_is_failed() {
        let (_dir, node) = workspace(
            "apiVersion: sbkube/v1\nsettings: {cluster: test}\napps:\n  breaks:\n    type: exec\n    commands: ['false']\n",
        );
        let options = PipelineOptions {
            only: Some(Stage::Deploy),
            ..Default::default()
        };
        let orchestrator = Orchestrator::new(&node, node.dir.clone(), &options);
        let store = StateStore::open_in_memory().unwrap();
        let result = orchestrator.run(Some(&store)).unwrap();
        assert_eq!(result.deployment_status, Some(DeploymentStatus::Failed));
    }

    #[test]
    fn test_group_deps_block_deploy() {
        let (_dir, node) = workspace(
            "apiVersion: sbkube/v1\napps:\n  pg:\n    type: noop\n    deps: [a000_infra]\n",
        );
        let options = PipelineOptions {
            only: Some(Stage::Deploy),
            ..Default::default()
        };
        let orchestrator = Orchestrator::new(&node, node.dir.clone(), &options);
        let store = StateStore::open_in_memory().unwrap();
        let err = orchestrator.run(Some(&store)).unwrap_err();
        let sb = err.downcast_ref::<SbkubeError>().unwrap();
        assert!(sb.message.contains("a000_infra"));
    }

    #[test]
    fn test_dry_run_no_store_writes() {
        let (_dir, node) = workspace(
            "apiVersion: sbkube/v1\napps:\n  ph: {type: noop}\n",
        );
        let options = PipelineOptions {
            only: Some(Stage::Deploy),
            dry_run: true,
            ..Default::default()
        };
        let orchestrator = Orchestrator::new(&node, node.dir.clone(), &options);
        // dry-run passes no store at all
        let result = orchestrator.run(None).unwrap();
        assert_eq!(result.deployment_id, None);
    }

    #[test]
    fn test_on_deploy_failure_hook_runs() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("failure-hook-ran");
        let yaml = format!(
            r#"
apiVersion: sbkube/v1
apps:
  breaks:
    type: exec
    commands: ['false']
    hooks:
      on_deploy_failure: ['touch {}']
"#,
            marker.display()
        );
        std::fs::write(dir.path().join("sbkube.yaml"), yaml).unwrap();
        let node = load_workspace(&dir.path().join("sbkube.yaml")).unwrap();
        let options = PipelineOptions {
            only: Some(Stage::Deploy),
            ..Default::default()
        };
        let orchestrator = Orchestrator::new(&node, node.dir.clone(), &options);
        let result = orchestrator.run(None).unwrap();
        assert!(result.any_failed());
        assert!(marker.exists(), "on_deploy_failure hook should have run");
    }
}
