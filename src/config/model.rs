//! The unified configuration model (`sbkube.yaml`, apiVersion `sbkube/v1`)
//!
//! Parsing is two-layered: a raw-value pass enforces the strict schema
//! (unknown fields anywhere are collected with their full paths), then serde
//! produces the typed structure. The two layers exist because flattened
//! common fields rule out `deny_unknown_fields` on the variant structs.

use crate::config::settings::Settings;
use crate::hooks::{HookSet, HookTask};
use crate::utils::errors::SbkubeError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const API_VERSION: &str = "sbkube/v1";

/// One `sbkube.yaml` document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UnifiedConfig {
    pub api_version: String,
    #[serde(rename = "metadata")]
    pub metadata: BTreeMap<String, String>,
    #[serde(rename = "settings")]
    pub settings: Settings,
    #[serde(rename = "apps")]
    pub apps: BTreeMap<String, App>,
    #[serde(rename = "phases")]
    pub phases: BTreeMap<String, PhaseRef>,
    /// Command-level hooks firing around the whole invocation.
    #[serde(rename = "hooks")]
    pub hooks: HookSet,
}

/// A phase entry: a reference to another document, or an inline
/// sub-workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PhaseRef {
    Path(PhasePathRef),
    Inline(Box<UnifiedConfig>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhasePathRef {
    pub path: PathBuf,
}

/// Fields carried by every application regardless of type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppCommon {
    pub enabled: bool,
    pub namespace: Option<String>,
    /// Intra-document ordering.
    pub depends_on: Vec<String>,
    /// Cross-document app-group requirements, checked against the state
    /// store.
    pub deps: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub hooks: HookSet,
}

impl Default for AppCommon {
    fn default() -> Self {
        Self {
            enabled: true,
            namespace: None,
            depends_on: Vec::new(),
            deps: Vec::new(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            hooks: HookSet::default(),
        }
    }
}

/// The application union, discriminated on `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum App {
    Helm(HelmApp),
    Yaml(YamlApp),
    Kustomize(KustomizeApp),
    Git(GitApp),
    Http(HttpApp),
    Action(ActionApp),
    Exec(ExecApp),
    Noop(NoopApp),
    Hook(HookApp),
}

impl App {
    pub fn common(&self) -> &AppCommon {
        match self {
            App::Helm(a) => &a.common,
            App::Yaml(a) => &a.common,
            App::Kustomize(a) => &a.common,
            App::Git(a) => &a.common,
            App::Http(a) => &a.common,
            App::Action(a) => &a.common,
            App::Exec(a) => &a.common,
            App::Noop(a) => &a.common,
            App::Hook(a) => &a.common,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            App::Helm(_) => "helm",
            App::Yaml(_) => "yaml",
            App::Kustomize(_) => "kustomize",
            App::Git(_) => "git",
            App::Http(_) => "http",
            App::Action(_) => "action",
            App::Exec(_) => "exec",
            App::Noop(_) => "noop",
            App::Hook(_) => "hook",
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.common().enabled
    }
}

/// Install/upgrade a Helm release.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HelmApp {
    #[serde(flatten)]
    pub common: AppCommon,
    /// `repo/name` against a registered repo/OCI registry, or a local path.
    pub chart: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub values: Vec<PathBuf>,
    /// Files replacing chart contents during build.
    #[serde(default)]
    pub overrides: Vec<PathBuf>,
    /// Chart-root-relative paths deleted during build.
    #[serde(default)]
    pub removes: Vec<PathBuf>,
    #[serde(default)]
    pub set_values: Vec<String>,
    #[serde(default)]
    pub release_name: Option<String>,
    #[serde(default)]
    pub create_namespace: bool,
    #[serde(default)]
    pub wait: bool,
    #[serde(default)]
    pub timeout: Option<String>,
    #[serde(default)]
    pub atomic: bool,
}

/// Where a helm app's chart comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum ChartSource<'a> {
    /// `repo/name` — resolved against `helm_repos` or `oci_registries`.
    Remote { repo: &'a str, name: &'a str },
    /// Filesystem path, relative to the app's document directory.
    Local(&'a Path),
}

impl HelmApp {
    pub fn chart_source(&self) -> ChartSource<'_> {
        let chart = self.chart.as_str();
        if chart.starts_with("./") || chart.starts_with("../") || chart.starts_with('/') {
            return ChartSource::Local(Path::new(chart));
        }
        match chart.split_once('/') {
            Some((repo, name)) if !repo.is_empty() && !name.is_empty() && !name.contains('/') => {
                ChartSource::Remote { repo, name }
            }
            _ => ChartSource::Local(Path::new(chart)),
        }
    }

    /// Release name defaults to the app name; releases are namespace-scoped.
    pub fn release_name_or<'a>(&'a self, app_name: &'a str) -> &'a str {
        self.release_name.as_deref().unwrap_or(app_name)
    }
}

/// Apply a list of raw manifest files, in order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct YamlApp {
    #[serde(flatten)]
    pub common: AppCommon,
    pub files: Vec<PathBuf>,
}

/// Run Kustomize on a directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KustomizeApp {
    #[serde(flatten)]
    pub common: AppCommon,
    pub path: PathBuf,
}

/// Clone a Git source into the workspace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GitApp {
    #[serde(flatten)]
    pub common: AppCommon,
    /// Name of a `git_repos` settings entry.
    pub repo: String,
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Branch/tag override; falls back to the `git_repos` entry's ref.
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default, rename = "ref")]
    pub reference: Option<String>,
}

impl GitApp {
    pub fn requested_ref<'a>(&'a self, source_ref: Option<&'a str>) -> Option<&'a str> {
        self.reference
            .as_deref()
            .or(self.branch.as_deref())
            .or(source_ref)
    }
}

/// Download a file over HTTP.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpApp {
    #[serde(flatten)]
    pub common: AppCommon,
    pub url: String,
    pub dest: PathBuf,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// A sequence of kubectl actions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionApp {
    #[serde(flatten)]
    pub common: AppCommon,
    pub actions: Vec<ActionStep>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionStep {
    #[serde(rename = "type")]
    pub action: ActionKind,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Apply,
    Create,
    Delete,
}

/// Run arbitrary shell commands.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecApp {
    #[serde(flatten)]
    pub common: AppCommon,
    pub commands: Vec<String>,
}

/// Placeholder for manually managed dependencies.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NoopApp {
    #[serde(flatten)]
    pub common: AppCommon,
}

/// First-class hook application: deploys by evaluating its tasks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HookApp {
    #[serde(flatten)]
    pub common: AppCommon,
    pub tasks: Vec<HookTask>,
}

/// Parse a unified document, enforcing the strict schema. All problems are
/// aggregated into one `SbkubeError` naming each offending path.
pub fn parse_unified(content: &str) -> Result<UnifiedConfig> {
    let raw: serde_yaml::Value =
        serde_yaml::from_str(content).context("configuration is not valid YAML")?;
    parse_unified_value(raw)
}

/// Strict-check and deserialize an already-parsed document value. The
/// legacy normalizer assembles a unified value and funnels it through here
/// so both entry paths share one schema gate.
pub fn parse_unified_value(raw: serde_yaml::Value) -> Result<UnifiedConfig> {
    let problems = schema::check_document(&raw, "");
    if !problems.is_empty() {
        return Err(SbkubeError::config_validation(&problems).into());
    }
    let config: UnifiedConfig = serde_yaml::from_value(raw)
        .map_err(|err| SbkubeError::config_validation(&[err.to_string()]))?;
    Ok(config)
}

/// Read and parse a unified document from disk.
pub fn load_unified(path: &Path) -> Result<UnifiedConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    parse_unified(&content).with_context(|| format!("in {}", path.display()))
}

/// Strict-schema checking over the raw YAML value.
mod schema {
    use super::*;

    const ROOT_KEYS: &[&str] = &["apiVersion", "metadata", "settings", "apps", "phases", "hooks"];
    const SETTINGS_KEYS: &[&str] = &[
        "kubeconfig",
        "kubeconfig_context",
        "cluster",
        "namespace",
        "helm_repos",
        "oci_registries",
        "git_repos",
        "cluster_values_file",
        "global_values",
        "app_dirs",
        "worker_pool",
    ];
    const COMMON_KEYS: &[&str] = &[
        "type",
        "enabled",
        "namespace",
        "depends_on",
        "deps",
        "labels",
        "annotations",
        "hooks",
    ];
    const HELM_KEYS: &[&str] = &[
        "chart",
        "version",
        "values",
        "overrides",
        "removes",
        "set_values",
        "release_name",
        "create_namespace",
        "wait",
        "timeout",
        "atomic",
    ];
    const YAML_KEYS: &[&str] = &["files"];
    const KUSTOMIZE_KEYS: &[&str] = &["path"];
    const GIT_KEYS: &[&str] = &["repo", "path", "branch", "ref"];
    const HTTP_KEYS: &[&str] = &["url", "dest", "headers"];
    const ACTION_KEYS: &[&str] = &["actions"];
    const EXEC_KEYS: &[&str] = &["commands"];
    const NOOP_KEYS: &[&str] = &[];
    const HOOK_APP_KEYS: &[&str] = &["tasks"];
    const HOOKSET_KEYS: &[&str] = &[
        "pre_prepare",
        "post_prepare",
        "on_prepare_failure",
        "pre_build",
        "post_build",
        "on_build_failure",
        "pre_deploy",
        "post_deploy",
        "on_deploy_failure",
        "pre_deploy_tasks",
        "post_deploy_tasks",
    ];
    const TASK_COMMON_KEYS: &[&str] = &["type", "name", "depends_on", "on_failure", "validation", "timeout"];
    const TASK_COMMAND_KEYS: &[&str] = &["command", "commands", "working_dir"];
    const TASK_MANIFESTS_KEYS: &[&str] = &["files"];
    const TASK_INLINE_KEYS: &[&str] = &["content"];
    pub const APP_TYPES: &[&str] = &[
        "helm",
        "yaml",
        "kustomize",
        "git",
        "http",
        "action",
        "exec",
        "noop",
        "hook",
    ];

    fn keys_of(value: &serde_yaml::Value) -> Vec<String> {
        value
            .as_mapping()
            .map(|m| {
                m.keys()
                    .filter_map(|k| k.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn unknown_in(
        value: &serde_yaml::Value,
        allowed: &[&[&str]],
        prefix: &str,
        problems: &mut Vec<String>,
    ) {
        for key in keys_of(value) {
            if !allowed.iter().any(|set| set.contains(&key.as_str())) {
                problems.push(format!("{}{}: unknown field", prefix, key));
            }
        }
    }

    /// Check one document (and its inline phases, recursively). `prefix` is
    /// the path context for nested documents.
    pub fn check_document(doc: &serde_yaml::Value, prefix: &str) -> Vec<String> {
        let mut problems = Vec::new();
        if !doc.is_mapping() {
            problems.push(format!("{}document is not a mapping", prefix));
            return problems;
        }
        unknown_in(doc, &[ROOT_KEYS], prefix, &mut problems);

        if let Some(settings) = doc.get("settings") {
            unknown_in(settings, &[SETTINGS_KEYS], &format!("{}settings.", prefix), &mut problems);
        }

        if let Some(apps) = doc.get("apps").and_then(|a| a.as_mapping()) {
            for (name, app) in apps {
                let Some(name) = name.as_str() else {
                    problems.push(format!("{}apps: non-string app name", prefix));
                    continue;
                };
                check_app(app, &format!("{}apps.{}.", prefix, name), &mut problems);
            }
        } else if doc.get("apps").map(|a| !a.is_null()).unwrap_or(false) && doc.get("apps").map(|a| !a.is_mapping()).unwrap_or(false) {
            problems.push(format!("{}apps: expected a mapping of app name to definition", prefix));
        }

        if let Some(hooks) = doc.get("hooks") {
            check_hookset(hooks, &format!("{}hooks.", prefix), &mut problems);
        }

        if let Some(phases) = doc.get("phases").and_then(|p| p.as_mapping()) {
            for (name, phase) in phases {
                let Some(name) = name.as_str() else {
                    problems.push(format!("{}phases: non-string phase name", prefix));
                    continue;
                };
                let phase_prefix = format!("{}phases.{}.", prefix, name);
                let keys = keys_of(phase);
                if keys == vec!["path".to_string()] {
                    continue;
                }
                // inline sub-workspace
                let nested = check_document(phase, &phase_prefix);
                problems.extend(nested);
            }
        }

        problems
    }

    fn check_app(app: &serde_yaml::Value, prefix: &str, problems: &mut Vec<String>) {
        if !app.is_mapping() {
            problems.push(format!("{}: app definition is not a mapping", prefix.trim_end_matches('.')));
            return;
        }
        let app_type = app.get("type").and_then(|t| t.as_str());
        let Some(app_type) = app_type else {
            problems.push(format!("{}type: missing required field", prefix));
            return;
        };
        let specific: &[&str] = match app_type {
            "helm" => HELM_KEYS,
            "yaml" => YAML_KEYS,
            "kustomize" => KUSTOMIZE_KEYS,
            "git" => GIT_KEYS,
            "http" => HTTP_KEYS,
            "action" => ACTION_KEYS,
            "exec" => EXEC_KEYS,
            "noop" => NOOP_KEYS,
            "hook" => HOOK_APP_KEYS,
            other => {
                problems.push(format!(
                    "{}type: '{}' is not one of {}",
                    prefix,
                    other,
                    APP_TYPES.join(", ")
                ));
                return;
            }
        };
        unknown_in(app, &[COMMON_KEYS, specific], prefix, problems);

        if let Some(hooks) = app.get("hooks") {
            check_hookset(hooks, &format!("{}hooks.", prefix), problems);
        }
        if app_type == "hook" {
            if let Some(tasks) = app.get("tasks").and_then(|t| t.as_sequence()) {
                for (index, task) in tasks.iter().enumerate() {
                    check_task(task, &format!("{}tasks[{}].", prefix, index), problems);
                }
            }
        }
    }

    fn check_hookset(hooks: &serde_yaml::Value, prefix: &str, problems: &mut Vec<String>) {
        if !hooks.is_mapping() {
            problems.push(format!("{}: hooks is not a mapping", prefix.trim_end_matches('.')));
            return;
        }
        unknown_in(hooks, &[HOOKSET_KEYS], prefix, problems);
        for list in ["pre_deploy_tasks", "post_deploy_tasks"] {
            if let Some(tasks) = hooks.get(list).and_then(|t| t.as_sequence()) {
                for (index, task) in tasks.iter().enumerate() {
                    check_task(task, &format!("{}{}[{}].", prefix, list, index), problems);
                }
            }
        }
    }

    fn check_task(task: &serde_yaml::Value, prefix: &str, problems: &mut Vec<String>) {
        let task_type = task.get("type").and_then(|t| t.as_str());
        let specific: &[&str] = match task_type {
            Some("command") => TASK_COMMAND_KEYS,
            Some("manifests") => TASK_MANIFESTS_KEYS,
            Some("inline") => TASK_INLINE_KEYS,
            Some(other) => {
                problems.push(format!(
                    "{}type: '{}' is not one of command, manifests, inline",
                    prefix, other
                ));
                return;
            }
            None => {
                problems.push(format!("{}type: missing required field", prefix));
                return;
            }
        };
        unknown_in(task, &[TASK_COMMON_KEYS, specific], prefix, problems);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASIC: &str = r#"
apiVersion: sbkube/v1
settings:
  namespace: demo
  helm_repos:
    bitnami: https://charts.bitnami.com/bitnami
apps:
  redis:
    type: helm
    chart: bitnami/redis
    version: "17.13.2"
  backend:
    type: helm
    chart: ./charts/backend
    depends_on: [redis]
  manifests:
    type: yaml
    files: [manifests/app.yaml]
"#;

    #[test]
    fn test_parse_basic_document() {
        let config = parse_unified(BASIC).unwrap();
        assert_eq!(config.api_version, "sbkube/v1");
        assert_eq!(config.apps.len(), 3);
        let App::Helm(redis) = &config.apps["redis"] else {
            panic!("redis should be a helm app");
        };
        assert_eq!(redis.version.as_deref(), Some("17.13.2"));
        assert!(redis.common.enabled);
        assert_eq!(config.apps["backend"].common().depends_on, vec!["redis"]);
    }

    #[test]
    fn test_chart_source_discrimination() {
        let remote = HelmApp {
            chart: "bitnami/redis".into(),
            ..Default::default()
        };
        assert_eq!(
            remote.chart_source(),
            ChartSource::Remote {
                repo: "bitnami",
                name: "redis"
            }
        );
        let local = HelmApp {
            chart: "./charts/backend".into(),
            ..Default::default()
        };
        assert!(matches!(local.chart_source(), ChartSource::Local(_)));
        let bare = HelmApp {
            chart: "mychart".into(),
            ..Default::default()
        };
        assert!(matches!(bare.chart_source(), ChartSource::Local(_)));
    }

    #[test]
    fn test_unknown_fields_aggregated_with_paths() {
        let bad = r#"
apiVersion: sbkube/v1
settings:
  namespase: demo
apps:
  redis:
    type: helm
    chart: bitnami/redis
    versoin: "1"
  web:
    type: yaml
    files: []
    chart: oops
"#;
        let err = parse_unified(bad).unwrap_err();
        let sb = err.downcast_ref::<SbkubeError>().unwrap();
        let details = sb.details.as_deref().unwrap();
        assert!(details.contains("settings.namespase"));
        assert!(details.contains("apps.redis.versoin"));
        assert!(details.contains("apps.web.chart"));
    }

    #[test]
    fn test_unknown_app_type_rejected() {
        let bad = r#"
apiVersion: sbkube/v1
apps:
  thing:
    type: terraform
"#;
        let err = parse_unified(bad).unwrap_err();
        let sb = err.downcast_ref::<SbkubeError>().unwrap();
        assert!(sb
            .details
            .as_deref()
            .unwrap_or(&sb.message)
            .contains("apps.thing.type"));
    }

    #[test]
    fn test_missing_type_rejected() {
        let bad = "apiVersion: sbkube/v1\napps:\n  thing:\n    chart: a/b\n";
        assert!(parse_unified(bad).is_err());
    }

    #[test]
    fn test_release_name_defaults_to_app_name() {
        let app = HelmApp::default();
        assert_eq!(app.release_name_or("redis"), "redis");
        let named = HelmApp {
            release_name: Some("cache".into()),
            ..Default::default()
        };
        assert_eq!(named.release_name_or("redis"), "cache");
    }

    #[test]
    fn test_phase_ref_forms() {
        let doc = r#"
apiVersion: sbkube/v1
phases:
  infra:
    path: ../a000_infra/sbkube.yaml
  inline-extras:
    apps:
      marker:
        type: noop
"#;
        let config = parse_unified(doc).unwrap();
        assert!(matches!(config.phases["infra"], PhaseRef::Path(_)));
        match &config.phases["inline-extras"] {
            PhaseRef::Inline(inner) => {
                assert!(matches!(inner.apps["marker"], App::Noop(_)));
            }
            other => panic!("expected inline phase, got {:?}", other),
        }
    }

    #[test]
    fn test_action_steps_parse() {
        let doc = r#"
apiVersion: sbkube/v1
apps:
  bootstrap:
    type: action
    actions:
      - type: apply
        path: ns.yaml
      - type: delete
        path: old.yaml
"#;
        let config = parse_unified(doc).unwrap();
        let App::Action(action) = &config.apps["bootstrap"] else {
            panic!("expected action app");
        };
        assert_eq!(action.actions.len(), 2);
        assert_eq!(action.actions[0].action, ActionKind::Apply);
        assert_eq!(action.actions[1].action, ActionKind::Delete);
    }

    #[test]
    fn test_hook_task_schema_checked_in_apps() {
        let bad = r#"
apiVersion: sbkube/v1
apps:
  seed:
    type: hook
    tasks:
      - type: command
        command: echo hi
        retries: 3
"#;
        let err = parse_unified(bad).unwrap_err();
        let sb = err.downcast_ref::<SbkubeError>().unwrap();
        assert!(sb
            .details
            .as_deref()
            .unwrap_or(&sb.message)
            .contains("tasks[0].retries"));
    }

    #[test]
    fn test_config_roundtrip_preserves_graph() {
        // config_snapshot round-trip: serialize, re-parse, compare
        let config = parse_unified(BASIC).unwrap();
        let json = serde_json::to_string(&config).unwrap();
        let back: UnifiedConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
    }
}
