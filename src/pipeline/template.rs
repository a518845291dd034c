//! The template stage: render charts and kustomizations to YAML
//!
//! Rendering is also the deploy stage's dry material: when no output
//! directory is requested the result is regenerated on the fly during
//! deploy, so this module owns the values-layer assembly both paths share.

use crate::config::model::{App, HelmApp, KustomizeApp};
use crate::config::settings::EffectiveSettings;
use crate::tools::{Helm, Kubectl};
use crate::utils::errors::{ErrorKind, SbkubeError};
use anyhow::{Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Ordered `--values` arguments for a helm invocation. Temp files carry the
/// accumulated inline `global_values`; they live as long as this struct.
#[derive(Debug)]
pub struct ValuesArgs {
    pub files: Vec<PathBuf>,
    _temp: Vec<NamedTempFile>,
}

/// Assemble the values chain, lowest priority first: accumulated cluster
/// values files, accumulated global values (as temp files), then the app's
/// own values files in listed order. `set_values` ride separately as
/// `--set` arguments.
pub fn values_args(
    effective: &EffectiveSettings,
    app: &HelmApp,
    doc_dir: &Path,
) -> Result<ValuesArgs> {
    let mut files = Vec::new();
    let mut temp = Vec::new();

    for file in &effective.cluster_values_files {
        if file.is_file() {
            files.push(file.clone());
        } else {
            crate::log_warn!("cluster values file {} not found, skipping", file.display());
        }
    }

    for mapping in &effective.global_values {
        let yaml = serde_yaml::to_string(&serde_yaml::Value::Mapping(mapping.clone()))
            .context("failed to serialize global_values")?;
        let mut file = NamedTempFile::new().context("failed to create temp values file")?;
        file.write_all(yaml.as_bytes())
            .context("failed to write temp values file")?;
        files.push(file.path().to_path_buf());
        temp.push(file);
    }

    for file in &app.values {
        let resolved = crate::utils::paths::resolve_relative(doc_dir, file);
        if !resolved.is_file() {
            return Err(SbkubeError::new(
                ErrorKind::Filesystem,
                format!("values file {} not found", resolved.display()),
            )
            .into());
        }
        files.push(resolved);
    }

    Ok(ValuesArgs { files, _temp: temp })
}

/// Render one app. Returns the rendered YAML when the app type renders, and
/// writes it under `{output_dir}/{app}/` when an output directory was
/// requested.
pub fn template_app(
    app_name: &str,
    app: &App,
    doc_dir: &Path,
    caches_root: &Path,
    effective: &EffectiveSettings,
    namespace: Option<&str>,
    helm: &Helm,
    kubectl: &Kubectl,
    output_dir: Option<&Path>,
    dry_run: bool,
) -> Result<Option<String>> {
    let rendered = match app {
        App::Helm(helm_app) => {
            let chart_dir =
                super::build::effective_chart_dir(app_name, helm_app, doc_dir, caches_root);
            if !chart_dir.is_dir() {
                return Err(SbkubeError::new(
                    ErrorKind::Filesystem,
                    format!(
                        "chart directory {} not found for app '{}'",
                        chart_dir.display(),
                        app_name
                    ),
                )
                .with_hint("run 'sbkube prepare' (and 'sbkube build') first")
                .into());
            }
            if dry_run {
                crate::log_info!("[dry-run] would template {} from {}", app_name, chart_dir.display());
                return Ok(None);
            }
            let values = values_args(effective, helm_app, doc_dir)?;
            let release = helm_app.release_name_or(app_name);
            Some(
                helm.template(release, &chart_dir, namespace, &values.files, &helm_app.set_values)
                    .map_err(|err| {
                        SbkubeError::new(
                            ErrorKind::Helm,
                            format!("helm template failed for '{}'", app_name),
                        )
                        .with_details(err.to_string())
                    })?,
            )
        }
        App::Kustomize(kustomize_app) => {
            if dry_run {
                crate::log_info!("[dry-run] would run kustomize for {}", app_name);
                return Ok(None);
            }
            Some(render_kustomize(app_name, kustomize_app, doc_dir, kubectl)?)
        }
        App::Yaml(yaml_app) => {
            // identity: concatenate the listed manifests
            let mut combined = String::new();
            for file in &yaml_app.files {
                let path = crate::utils::paths::resolve_relative(doc_dir, file);
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read manifest {}", path.display()))?;
                if !combined.is_empty() {
                    combined.push_str("---\n");
                }
                combined.push_str(&content);
                if !content.ends_with('\n') {
                    combined.push('\n');
                }
            }
            Some(combined)
        }
        // other types have nothing to render
        _ => None,
    };

    if let (Some(rendered), Some(output_dir)) = (rendered.as_deref(), output_dir) {
        let app_dir = output_dir.join(app_name);
        std::fs::create_dir_all(&app_dir)
            .with_context(|| format!("failed to create {}", app_dir.display()))?;
        let out = app_dir.join("manifests.yaml");
        std::fs::write(&out, rendered)
            .with_context(|| format!("failed to write {}", out.display()))?;
        crate::log_info!("rendered {} -> {}", app_name, out.display());
    }

    Ok(rendered)
}

pub fn render_kustomize(
    app_name: &str,
    app: &KustomizeApp,
    doc_dir: &Path,
    kubectl: &Kubectl,
) -> Result<String> {
    let dir = crate::utils::paths::resolve_relative(doc_dir, &app.path);
    if !dir.is_dir() {
        return Err(SbkubeError::new(
            ErrorKind::Filesystem,
            format!(
                "kustomize directory {} not found for app '{}'",
                dir.display(),
                app_name
            ),
        )
        .into());
    }
    kubectl.kustomize_build(&dir).map_err(|err| {
        SbkubeError::new(
            ErrorKind::Kubernetes,
            format!("kustomize build failed for '{}'", app_name),
        )
        .with_details(err.to_string())
        .into()
    })
}

/// Chart version from a chart directory's Chart.yaml.
pub fn chart_yaml_version(chart_dir: &Path) -> Option<String> {
    let content = std::fs::read_to_string(chart_dir.join("Chart.yaml")).ok()?;
    let doc: serde_yaml::Value = serde_yaml::from_str(&content).ok()?;
    doc.get("version").and_then(|v| v.as_str()).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::parse_unified;
    use crate::config::settings::Settings;

    #[test]
    fn test_values_args_ordering() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = dir.path().join("cluster.yaml");
        std::fs::write(&cluster, "a: 1\n").unwrap();
        let app_values = dir.path().join("app.yaml");
        std::fs::write(&app_values, "b: 2\n").unwrap();

        let settings: Settings =
            serde_yaml::from_str("global_values:\n  c: 3\n").unwrap();
        let mut effective = EffectiveSettings::root(&settings, dir.path());
        effective.cluster_values_files = vec![cluster.clone()];

        let app: HelmApp = serde_yaml::from_str("chart: x/y\nvalues: [app.yaml]\n").unwrap();
        let args = values_args(&effective, &app, dir.path()).unwrap();

        // cluster file first, inline globals second, app values last
        assert_eq!(args.files.len(), 3);
        assert_eq!(args.files[0], cluster);
        assert_eq!(args.files[2], app_values);
        let global = std::fs::read_to_string(&args.files[1]).unwrap();
        assert!(global.contains("c: 3"));
    }

    #[test]
    fn test_missing_app_values_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let effective = EffectiveSettings::root(&Settings::default(), dir.path());
        let app: HelmApp = serde_yaml::from_str("chart: x/y\nvalues: [absent.yaml]\n").unwrap();
        let err = values_args(&effective, &app, dir.path()).unwrap_err();
        let sb = err.downcast_ref::<SbkubeError>().unwrap();
        assert_eq!(sb.kind, ErrorKind::Filesystem);
    }

    #[test]
    fn test_yaml_identity_concatenation() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("one.yaml"), "kind: A\n").unwrap();
        std::fs::write(dir.path().join("two.yaml"), "kind: B\n").unwrap();
        let config = parse_unified(
            "apiVersion: sbkube/v1\napps:\n  stack:\n    type: yaml\n    files: [one.yaml, two.yaml]\n",
        )
        .unwrap();
        let effective = EffectiveSettings::root(&Settings::default(), dir.path());
        let rendered = template_app(
            "stack",
            &config.apps["stack"],
            dir.path(),
            dir.path(),
            &effective,
            None,
            &Helm::default(),
            &Kubectl::default(),
            None,
            false,
        )
        .unwrap()
        .unwrap();
        assert!(rendered.contains("kind: A"));
        assert!(rendered.contains("---"));
        assert!(rendered.contains("kind: B"));
    }

    #[test]
    fn test_output_dir_receives_rendered_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("one.yaml"), "kind: A\n").unwrap();
        let config = parse_unified(
            "apiVersion: sbkube/v1\napps:\n  stack:\n    type: yaml\n    files: [one.yaml]\n",
        )
        .unwrap();
        let effective = EffectiveSettings::root(&Settings::default(), dir.path());
        let out = dir.path().join("rendered");
        template_app(
            "stack",
            &config.apps["stack"],
            dir.path(),
            dir.path(),
            &effective,
            None,
            &Helm::default(),
            &Kubectl::default(),
            Some(&out),
            false,
        )
        .unwrap();
        let written = std::fs::read_to_string(out.join("stack/manifests.yaml")).unwrap();
        assert_eq!(written, "kind: A\n");
    }

    #[test]
    fn test_chart_yaml_version() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("Chart.yaml"),
            "apiVersion: v2\nname: redis\nversion: 17.13.2\n",
        )
        .unwrap();
        assert_eq!(chart_yaml_version(dir.path()).as_deref(), Some("17.13.2"));
        assert_eq!(chart_yaml_version(Path::new("/nonexistent")), None);
    }

    #[test]
    fn test_noop_types_render_nothing() {
        let config = parse_unified("apiVersion: sbkube/v1\napps:\n  ph:\n    type: noop\n").unwrap();
        let effective = EffectiveSettings::root(&Settings::default(), Path::new("/ws"));
        let rendered = template_app(
            "ph",
            &config.apps["ph"],
            Path::new("/ws"),
            Path::new("/ws"),
            &effective,
            None,
            &Helm::default(),
            &Kubectl::default(),
            None,
            false,
        )
        .unwrap();
        assert!(rendered.is_none());
    }
}
