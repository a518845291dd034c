//! Legacy configuration support (`config.yaml` + `sources.yaml`)
//!
//! The previous generation split one workspace across two files: app
//! definitions (with type-specific fields nested under `specs`) in
//! `config.yaml`, and cluster/source coordinates in `sources.yaml`. Both are
//! normalized into the unified model here; nothing downstream knows legacy
//! documents exist.

use crate::config::model::{self, UnifiedConfig};
use crate::utils::errors::SbkubeError;
use anyhow::{Context, Result};
use serde_yaml::{Mapping, Value};
use std::path::Path;

/// Legacy app `type` values and their unified equivalents.
const TYPE_ALIASES: &[(&str, &str)] = &[
    ("install-helm", "helm"),
    ("install-yaml", "yaml"),
    ("install-kustomize", "kustomize"),
    ("install-action", "action"),
    ("pull-git", "git"),
    ("pull-http", "http"),
    ("exec", "exec"),
    ("helm", "helm"),
    ("yaml", "yaml"),
    ("kustomize", "kustomize"),
    ("git", "git"),
    ("http", "http"),
    ("action", "action"),
    ("noop", "noop"),
    ("hook", "hook"),
];

/// Does this parsed document look like a legacy `config.yaml`? The legacy
/// marker is `apps` as a sequence of named entries (the unified form keys
/// apps by name) and no `apiVersion`.
pub fn is_legacy(doc: &Value) -> bool {
    if doc.get("apiVersion").is_some() {
        return false;
    }
    matches!(doc.get("apps"), Some(Value::Sequence(_)))
}

/// Normalize a legacy pair into a unified document. `sources` is the parsed
/// `sources.yaml` when present next to the config.
pub fn normalize(config: &Value, sources: Option<&Value>) -> Result<UnifiedConfig> {
    let mut root = Mapping::new();
    root.insert(
        Value::from("apiVersion"),
        Value::from(model::API_VERSION),
    );

    // settings: sources.yaml wholesale, plus config.yaml's namespace
    let mut settings = match sources {
        Some(Value::Mapping(map)) => map.clone(),
        _ => Mapping::new(),
    };
    if let Some(namespace) = config.get("namespace") {
        settings.insert(Value::from("namespace"), namespace.clone());
    }
    if !settings.is_empty() {
        root.insert(Value::from("settings"), Value::Mapping(settings));
    }

    // apps: sequence of {name, type, specs, ...} to a keyed mapping with
    // specs folded into the entry
    let mut apps = Mapping::new();
    if let Some(Value::Sequence(entries)) = config.get("apps") {
        for (index, entry) in entries.iter().enumerate() {
            let name = entry
                .get("name")
                .and_then(Value::as_str)
                .with_context(|| format!("legacy apps[{}] has no name", index))?
                .to_string();
            apps.insert(Value::from(name.clone()), normalize_app(entry, &name)?);
        }
    }
    root.insert(Value::from("apps"), Value::Mapping(apps));

    model::parse_unified_value(Value::Mapping(root))
}

fn normalize_app(entry: &Value, name: &str) -> Result<Value> {
    let legacy_type = entry
        .get("type")
        .and_then(Value::as_str)
        .with_context(|| format!("legacy app '{}' has no type", name))?;
    let unified_type = TYPE_ALIASES
        .iter()
        .find(|(legacy, _)| *legacy == legacy_type)
        .map(|(_, unified)| *unified)
        .ok_or_else(|| {
            SbkubeError::new(
                crate::utils::errors::ErrorKind::Config,
                format!("legacy app '{}' has unknown type '{}'", name, legacy_type),
            )
        })?;

    let mut app = Mapping::new();
    app.insert(Value::from("type"), Value::from(unified_type));

    // top-level fields other than the legacy bookkeeping carry over
    if let Value::Mapping(fields) = entry {
        for (key, value) in fields {
            let Some(key) = key.as_str() else { continue };
            if matches!(key, "name" | "type" | "specs") {
                continue;
            }
            app.insert(Value::from(key), value.clone());
        }
    }

    // specs-nested fields fold into the app entry; top-level wins on clash
    if let Some(Value::Mapping(specs)) = entry.get("specs") {
        for (key, value) in specs {
            if !app.contains_key(key) {
                app.insert(key.clone(), value.clone());
            }
        }
    }

    // the legacy helm form split chart into repo + chart
    if unified_type == "helm" {
        let repo = app.get("repo").and_then(Value::as_str).map(str::to_string);
        let chart = app.get("chart").and_then(Value::as_str).map(str::to_string);
        if let (Some(repo), Some(chart)) = (repo, chart) {
            if !chart.contains('/') && !chart.starts_with('.') {
                app.insert(Value::from("chart"), Value::from(format!("{}/{}", repo, chart)));
            }
        }
        app.remove("repo");
    }

    Ok(Value::Mapping(app))
}

/// Load a legacy workspace from its directory.
pub fn load_legacy(config_path: &Path) -> Result<UnifiedConfig> {
    let content = std::fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let config: Value = serde_yaml::from_str(&content)
        .with_context(|| format!("{} is not valid YAML", config_path.display()))?;

    let sources_path = config_path
        .parent()
        .map(|dir| dir.join(crate::utils::paths::LEGACY_SOURCES_FILE));
    let sources = match sources_path {
        Some(path) if path.is_file() => {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            Some(
                serde_yaml::from_str::<Value>(&content)
                    .with_context(|| format!("{} is not valid YAML", path.display()))?,
            )
        }
        _ => None,
    };

    crate::log_warn!(
        "{} uses the deprecated two-file layout; migrate to sbkube.yaml (apiVersion {})",
        config_path.display(),
        model::API_VERSION
    );
    normalize(&config, sources.as_ref())
}
