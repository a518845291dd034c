//! Cluster settings and their top-down inheritance through the phase tree

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Default worker pool size for the prepare stage.
pub const DEFAULT_WORKER_POOL: usize = 4;

/// The `settings` block of a document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub kubeconfig: Option<PathBuf>,
    /// Exact kubectl context name; case-sensitive.
    pub kubeconfig_context: Option<String>,
    /// Free-form human label recorded with every deployment.
    pub cluster: Option<String>,
    pub namespace: Option<String>,

    pub helm_repos: BTreeMap<String, String>,
    pub oci_registries: BTreeMap<String, OciRegistry>,
    pub git_repos: BTreeMap<String, GitSource>,

    /// YAML fragment merged into every Helm app's values at lowest priority.
    pub cluster_values_file: Option<PathBuf>,
    /// Inline map at the same priority tier as `cluster_values_file`.
    pub global_values: serde_yaml::Mapping,

    /// Explicit inclusion list restricting automatic discovery.
    pub app_dirs: Option<Vec<String>>,

    /// Prepare-stage worker pool size.
    pub worker_pool: Option<usize>,
}

/// OCI registry coordinates. Credentials are an env-var name, never a value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OciRegistry {
    pub url: String,
    pub username: Option<String>,
    /// Environment variable holding the password/token.
    pub password_env: Option<String>,
}

/// A named git source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GitSource {
    pub url: String,
    #[serde(rename = "ref")]
    pub reference: Option<String>,
}

/// Settings as seen by one node of the phase tree: the parent chain's
/// settings shallow-merged with the node's own, plus the accumulated
/// bottom-tier values (root-to-leaf order). Produced functionally; parents
/// are never mutated.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EffectiveSettings {
    pub merged: Settings,
    /// Accumulated `cluster_values_file` entries, resolved to absolute
    /// paths, root first.
    pub cluster_values_files: Vec<PathBuf>,
    /// Accumulated `global_values` maps, root first.
    pub global_values: Vec<serde_yaml::Mapping>,
}

impl EffectiveSettings {
    /// Effective settings of a tree root.
    pub fn root(settings: &Settings, dir: &Path) -> Self {
        Self::default().child(settings, dir)
    }

    /// Effective settings of a child node given its own settings block.
    pub fn child(&self, settings: &Settings, dir: &Path) -> Self {
        let mut merged = self.merged.clone();

        // scalar keys: child overrides parent
        if settings.kubeconfig.is_some() {
            merged.kubeconfig = settings.kubeconfig.clone();
        }
        if settings.kubeconfig_context.is_some() {
            merged.kubeconfig_context = settings.kubeconfig_context.clone();
        }
        if settings.cluster.is_some() {
            merged.cluster = settings.cluster.clone();
        }
        if settings.namespace.is_some() {
            merged.namespace = settings.namespace.clone();
        }
        if settings.app_dirs.is_some() {
            merged.app_dirs = settings.app_dirs.clone();
        }
        if settings.worker_pool.is_some() {
            merged.worker_pool = settings.worker_pool;
        }

        // repo maps: keyed union, child entry replaces same-name parent entry
        for (name, url) in &settings.helm_repos {
            merged.helm_repos.insert(name.clone(), url.clone());
        }
        for (name, registry) in &settings.oci_registries {
            merged.oci_registries.insert(name.clone(), registry.clone());
        }
        for (name, source) in &settings.git_repos {
            merged.git_repos.insert(name.clone(), source.clone());
        }

        // bottom-tier values: accumulate root-to-leaf
        let mut cluster_values_files = self.cluster_values_files.clone();
        if let Some(file) = &settings.cluster_values_file {
            cluster_values_files.push(crate::utils::paths::resolve_relative(dir, file));
        }
        let mut global_values = self.global_values.clone();
        if !settings.global_values.is_empty() {
            global_values.push(settings.global_values.clone());
        }

        merged.cluster_values_file = settings.cluster_values_file.clone();
        merged.global_values = settings.global_values.clone();

        Self {
            merged,
            cluster_values_files,
            global_values,
        }
    }

    /// Cluster label recorded in the state store.
    pub fn cluster_label(&self) -> String {
        self.merged
            .cluster
            .clone()
            .or_else(|| self.merged.kubeconfig_context.clone())
            .unwrap_or_else(|| "default".to_string())
    }

    /// Kubeconfig path, falling back to $KUBECONFIG.
    pub fn kubeconfig_path(&self) -> Option<PathBuf> {
        self.merged
            .kubeconfig
            .clone()
            .or_else(|| std::env::var_os("KUBECONFIG").map(PathBuf::from))
    }

    pub fn worker_pool(&self) -> usize {
        self.merged.worker_pool.unwrap_or(DEFAULT_WORKER_POOL).max(1)
    }
}

/// Compute the fully merged values map for a Helm release, for recording in
/// the state store. Priority, lowest first: accumulated cluster values files
/// → accumulated global values → app values files in order → app
/// `set_values`. The helm invocation passes the same layers as ordered
/// `--values`/`--set` arguments, so helm and the recorded map agree.
pub fn merged_values(
    effective: &EffectiveSettings,
    app_values_files: &[PathBuf],
    set_values: &[String],
) -> Result<serde_json::Value> {
    let mut merged = serde_json::Value::Object(serde_json::Map::new());

    for file in &effective.cluster_values_files {
        let layer = read_values_file(file)?;
        deep_merge(&mut merged, layer);
    }
    for mapping in &effective.global_values {
        let layer: serde_json::Value = serde_yaml::from_value(serde_yaml::Value::Mapping(
            mapping.clone(),
        ))
        .context("global_values is not a valid values map")?;
        deep_merge(&mut merged, layer);
    }
    for file in app_values_files {
        let layer = read_values_file(file)?;
        deep_merge(&mut merged, layer);
    }
    for set in set_values {
        apply_set_value(&mut merged, set)?;
    }
    Ok(merged)
}

fn read_values_file(path: &Path) -> Result<serde_json::Value> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read values file {}", path.display()))?;
    if content.trim().is_empty() {
        return Ok(serde_json::Value::Object(serde_json::Map::new()));
    }
    serde_yaml::from_str(&content)
        .with_context(|| format!("values file {} is not valid YAML", path.display()))
}

/// Map-on-map merges recurse; anything else overrides.
pub fn deep_merge(base: &mut serde_json::Value, overlay: serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base_slot, overlay_value) => *base_slot = overlay_value,
    }
}

/// Apply one `a.b.c=value` override. Covers the dotted-path scalar subset of
/// helm's `--set` grammar, which is what the recorded map needs; helm itself
/// receives the raw string.
fn apply_set_value(root: &mut serde_json::Value, set: &str) -> Result<()> {
    let (path, raw) = set
        .split_once('=')
        .with_context(|| format!("set_values entry '{}' is not key=value", set))?;
    let segments: Vec<&str> = path.split('.').collect();
    apply_set_segments(root, &segments, path, raw)
}

fn apply_set_segments(
    cursor: &mut serde_json::Value,
    segments: &[&str],
    path: &str,
    raw: &str,
) -> Result<()> {
    let map = cursor
        .as_object_mut()
        .with_context(|| format!("set_values path '{}' crosses a non-map value", path))?;
    if segments.len() == 1 {
        map.insert(segments[0].to_string(), parse_scalar(raw));
        Ok(())
    } else {
        let next = map
            .entry(segments[0].to_string())
            .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
        apply_set_segments(next, &segments[1..], path, raw)
    }
}

fn parse_scalar(raw: &str) -> serde_json::Value {
    match raw {
        "true" => return serde_json::Value::Bool(true),
        "false" => return serde_json::Value::Bool(false),
        "null" => return serde_json::Value::Null,
        _ => {}
    }
    if let Ok(int) = raw.parse::<i64>() {
        return serde_json::Value::Number(int.into());
    }
    if let Ok(float) = raw.parse::<f64>() {
        if let Some(number) = serde_json::Number::from_f64(float) {
            return serde_json::Value::Number(number);
        }
    }
    serde_json::Value::String(raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn yaml_settings(yaml: &str) -> Settings {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_scalar_override_child_wins() {
        let parent = yaml_settings("namespace: infra\ncluster: prod\n");
        let child = yaml_settings("namespace: app\n");
        let root = EffectiveSettings::root(&parent, Path::new("/ws"));
        let effective = root.child(&child, Path::new("/ws/phase"));
        assert_eq!(effective.merged.namespace.as_deref(), Some("app"));
        // untouched scalar inherited
        assert_eq!(effective.merged.cluster.as_deref(), Some("prod"));
    }

    #[test]
    fn test_repo_maps_keyed_union_child_wins() {
        let parent = yaml_settings(
            "helm_repos:\n  bitnami: https://charts.bitnami.com/bitnami\n  internal: https://old.example.com\n",
        );
        let child = yaml_settings(
            "helm_repos:\n  internal: https://new.example.com\n  extra: https://extra.example.com\n",
        );
        let root = EffectiveSettings::root(&parent, Path::new("/ws"));
        let effective = root.child(&child, Path::new("/ws/phase"));
        assert_eq!(effective.merged.helm_repos.len(), 3);
        assert_eq!(
            effective.merged.helm_repos["internal"],
            "https://new.example.com"
        );
        assert_eq!(
            effective.merged.helm_repos["bitnami"],
            "https://charts.bitnami.com/bitnami"
        );
    }

    #[test]
    fn test_values_accumulate_root_to_leaf() {
        let parent = yaml_settings("cluster_values_file: cluster.yaml\nglobal_values:\n  tier: root\n");
        let child = yaml_settings("cluster_values_file: phase.yaml\nglobal_values:\n  tier: leaf\n");
        let root = EffectiveSettings::root(&parent, Path::new("/ws"));
        let effective = root.child(&child, Path::new("/ws/phase"));
        assert_eq!(
            effective.cluster_values_files,
            vec![
                PathBuf::from("/ws/cluster.yaml"),
                PathBuf::from("/ws/phase/phase.yaml")
            ]
        );
        assert_eq!(effective.global_values.len(), 2);
    }

    #[test]
    fn test_merge_determinism() {
        let parent = yaml_settings("helm_repos:\n  b: https://b\n  a: https://a\n");
        let root1 = EffectiveSettings::root(&parent, Path::new("/ws"));
        let root2 = EffectiveSettings::root(&parent, Path::new("/ws"));
        assert_eq!(root1, root2);
    }

    #[test]
    fn test_merged_values_priority() {
        let dir = tempfile::tempdir().unwrap();
        let cluster_file = dir.path().join("cluster.yaml");
        let mut f = std::fs::File::create(&cluster_file).unwrap();
        writeln!(f, "replicas: 1\nimage:\n  tag: cluster\n  pullPolicy: IfNotPresent").unwrap();
        let app_file = dir.path().join("app.yaml");
        let mut f = std::fs::File::create(&app_file).unwrap();
        writeln!(f, "image:\n  tag: app").unwrap();

        let settings = yaml_settings("global_values:\n  image:\n    tag: global\n  extra: true\n");
        let mut effective = EffectiveSettings::root(&settings, dir.path());
        effective.cluster_values_files = vec![cluster_file];

        let merged = merged_values(
            &effective,
            &[app_file],
            &["replicas=5".to_string(), "image.digest=sha".to_string()],
        )
        .unwrap();

        // set_values beats everything
        assert_eq!(merged["replicas"], 5);
        // app values beat global values beat cluster file
        assert_eq!(merged["image"]["tag"], "app");
        // untouched keys survive from lower tiers
        assert_eq!(merged["image"]["pullPolicy"], "IfNotPresent");
        assert_eq!(merged["image"]["digest"], "sha");
        assert_eq!(merged["extra"], true);
    }

    #[test]
    fn test_set_value_scalar_typing() {
        assert_eq!(parse_scalar("5"), serde_json::json!(5));
        assert_eq!(parse_scalar("true"), serde_json::json!(true));
        assert_eq!(parse_scalar("1.5"), serde_json::json!(1.5));
        assert_eq!(parse_scalar("7.0.1"), serde_json::json!("7.0.1"));
    }

    #[test]
    fn test_bad_set_value_rejected() {
        let settings = Settings::default();
        let effective = EffectiveSettings::root(&settings, Path::new("/ws"));
        assert!(merged_values(&effective, &[], &["no-equals-sign".to_string()]).is_err());
    }

    #[test]
    fn test_worker_pool_default() {
        let effective = EffectiveSettings::root(&Settings::default(), Path::new("/ws"));
        assert_eq!(effective.worker_pool(), DEFAULT_WORKER_POOL);
        let sized = yaml_settings("worker_pool: 8\n");
        assert_eq!(EffectiveSettings::root(&sized, Path::new("/ws")).worker_pool(), 8);
    }
}
