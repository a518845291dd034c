//! Semantic validation over a loaded document
//!
//! The strict schema pass (config::model) already rejected unknown fields;
//! this layer checks the rules that need the whole document or the
//! filesystem: name shape, reference resolution, chart addressing, and the
//! kubeconfig context.

use crate::config::model::{App, ChartSource, UnifiedConfig};
use crate::config::phases::PhaseNode;
use crate::config::settings::EffectiveSettings;
use crate::tools::kubectl;
use regex::Regex;
use std::path::Path;

/// Accumulated findings: errors block `apply`, warnings do not.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

fn dns1123_label() -> Regex {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("static regex")
}

/// Validate one document against its effective settings.
pub fn validate_document(
    config: &UnifiedConfig,
    effective: &EffectiveSettings,
    doc_dir: &Path,
    prefix: &str,
) -> ValidationReport {
    let mut report = ValidationReport::default();
    let label = dns1123_label();

    for (name, app) in &config.apps {
        let path = format!("{}apps.{}", prefix, name);

        if name.len() > 63 || !label.is_match(name) {
            report.errors.push(format!(
                "{}: app name is not a valid DNS-1123 label",
                path
            ));
        }

        if app.common().depends_on.iter().any(|dep| dep == name) {
            report
                .errors
                .push(format!("{}: app depends on itself", path));
        }

        match app {
            App::Helm(helm) => {
                if helm.chart.starts_with("oci://") {
                    report.errors.push(format!(
                        "{}.chart: raw oci:// URLs are not accepted; register the registry \
                         under settings.oci_registries and reference it as <name>/<chart>",
                        path
                    ));
                } else {
                    match helm.chart_source() {
                        ChartSource::Remote { repo, .. } => {
                            let known = effective.merged.helm_repos.contains_key(repo)
                                || effective.merged.oci_registries.contains_key(repo);
                            if !known {
                                report.errors.push(format!(
                                    "{}.chart: repo '{}' is not declared in settings.helm_repos \
                                     or settings.oci_registries",
                                    path, repo
                                ));
                            }
                        }
                        ChartSource::Local(chart_path) => {
                            let resolved =
                                crate::utils::paths::resolve_relative(doc_dir, chart_path);
                            if !resolved.is_dir() {
                                report.warnings.push(format!(
                                    "{}.chart: local chart directory {} not found",
                                    path,
                                    resolved.display()
                                ));
                            }
                        }
                    }
                }
                for values in &helm.values {
                    let resolved = crate::utils::paths::resolve_relative(doc_dir, values);
                    if !resolved.is_file() {
                        report.warnings.push(format!(
                            "{}.values: {} not found",
                            path,
                            resolved.display()
                        ));
                    }
                }
            }
            App::Yaml(yaml) => {
                if yaml.files.is_empty() {
                    report
                        .warnings
                        .push(format!("{}.files: empty manifest list", path));
                }
            }
            App::Git(git) => {
                if !effective.merged.git_repos.contains_key(&git.repo) {
                    report.errors.push(format!(
                        "{}.repo: '{}' is not declared in settings.git_repos",
                        path, git.repo
                    ));
                }
            }
            App::Action(action) => {
                if action.actions.is_empty() {
                    report
                        .warnings
                        .push(format!("{}.actions: empty action list", path));
                }
            }
            App::Exec(exec) => {
                if exec.commands.is_empty() {
                    report
                        .warnings
                        .push(format!("{}.commands: empty command list", path));
                }
            }
            App::Hook(hook) => {
                report.merge(validate_task_names(&hook.tasks, &format!("{}.tasks", path)));
            }
            _ => {}
        }

        report.merge(validate_task_names(
            &app.common().hooks.pre_deploy_tasks,
            &format!("{}.hooks.pre_deploy_tasks", path),
        ));
        report.merge(validate_task_names(
            &app.common().hooks.post_deploy_tasks,
            &format!("{}.hooks.post_deploy_tasks", path),
        ));
    }

    // ordering problems (unknown references, cycles) surface as errors too
    if let Err(err) = crate::deps::topo_order(config) {
        if let Some(sb) = err.downcast_ref::<crate::utils::errors::SbkubeError>() {
            match &sb.details {
                Some(details) => report
                    .errors
                    .extend(details.lines().map(|l| format!("{}{}", prefix, l))),
                None => report.errors.push(format!("{}{}", prefix, sb.message)),
            }
        } else {
            report.errors.push(format!("{}{}", prefix, err));
        }
    }

    report
}

/// Intra-list task references must resolve; duplicate names are ambiguous.
fn validate_task_names(tasks: &[crate::hooks::HookTask], prefix: &str) -> ValidationReport {
    let mut report = ValidationReport::default();
    let mut names = std::collections::BTreeSet::new();
    for task in tasks {
        if let Some(name) = &task.common().name {
            if !names.insert(name.clone()) {
                report
                    .errors
                    .push(format!("{}: duplicate task name '{}'", prefix, name));
            }
        }
    }
    for (index, task) in tasks.iter().enumerate() {
        for dep in &task.common().depends_on {
            if !names.contains(dep) {
                report.errors.push(format!(
                    "{}[{}].depends_on: no task named '{}'",
                    prefix, index, dep
                ));
            }
        }
    }
    report
}

/// Validate the whole workspace tree.
pub fn validate_tree(root: &PhaseNode) -> ValidationReport {
    let mut report = ValidationReport::default();
    for node in root.walk() {
        let prefix = if node.config_file == root.config_file && node.name == root.name {
            String::new()
        } else {
            format!("{}: ", node.group)
        };
        report.merge(validate_document(
            &node.config,
            &node.effective,
            &node.dir,
            &prefix,
        ));
    }
    report
}

/// Execution-time check: the configured kubectl context must exist in the
/// kubeconfig file. Skipped silently when no context is configured.
pub fn check_kubeconfig_context(effective: &EffectiveSettings) -> Option<String> {
    let context = effective.merged.kubeconfig_context.as_deref()?;
    let Some(kubeconfig) = effective.kubeconfig_path() else {
        return Some(format!(
            "kubeconfig_context '{}' is set but no kubeconfig file is configured",
            context
        ));
    };
    match kubectl::kubeconfig_contexts(&kubeconfig) {
        Ok(contexts) => {
            // exact, case-sensitive match
            if contexts.iter().any(|c| c == context) {
                None
            } else {
                Some(format!(
                    "context '{}' not found in {} (available: {})",
                    context,
                    kubeconfig.display(),
                    contexts.join(", ")
                ))
            }
        }
        Err(err) => Some(format!(
            "cannot read kubeconfig {}: {}",
            kubeconfig.display(),
            err
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::parse_unified;

    fn validate(yaml: &str) -> ValidationReport {
        let config = parse_unified(yaml).unwrap();
        let effective = EffectiveSettings::root(&config.settings, Path::new("/nonexistent"));
        validate_document(&config, &effective, Path::new("/nonexistent"), "")
    }

    #[test]
    fn test_dns1123_names_enforced() {
        let report = validate(
            "apiVersion: sbkube/v1\napps:\n  Bad_Name:\n    type: noop\n  good-name:\n    type: noop\n",
        );
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("Bad_Name"));
        assert!(report.errors[0].contains("DNS-1123"));
    }

    #[test]
    fn test_oci_url_in_chart_rejected_with_pointer() {
        let report = validate(
            "apiVersion: sbkube/v1\napps:\n  svc:\n    type: helm\n    chart: oci://registry.example.com/svc\n",
        );
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("oci_registries"));
    }

    #[test]
    fn test_unregistered_repo_rejected() {
        let report = validate(
            "apiVersion: sbkube/v1\napps:\n  redis:\n    type: helm\n    chart: bitnami/redis\n",
        );
        assert!(report
            .errors
            .iter()
            .any(|e| e.contains("'bitnami'") && e.contains("helm_repos")));
    }

    #[test]
    fn test_registered_repo_accepted() {
        let report = validate(
            "apiVersion: sbkube/v1\nsettings:\n  helm_repos:\n    bitnami: https://charts.bitnami.com/bitnami\napps:\n  redis:\n    type: helm\n    chart: bitnami/redis\n",
        );
        assert!(report.is_ok(), "errors: {:?}", report.errors);
    }

    #[test]
    fn test_oci_registry_reference_accepted() {
        let report = validate(
            "apiVersion: sbkube/v1\nsettings:\n  oci_registries:\n    internal:\n      url: registry.example.com/charts\napps:\n  svc:\n    type: helm\n    chart: internal/svc\n",
        );
        assert!(report.is_ok(), "errors: {:?}", report.errors);
    }

    #[test]
    fn test_unregistered_git_repo_rejected() {
        let report = validate(
            "apiVersion: sbkube/v1\napps:\n  src:\n    type: git\n    repo: missing\n",
        );
        assert!(report.errors.iter().any(|e| e.contains("git_repos")));
    }

    #[test]
    fn test_self_dependency_rejected() {
        let report = validate(
            "apiVersion: sbkube/v1\napps:\n  a:\n    type: noop\n    depends_on: [a]\n",
        );
        assert!(report.errors.iter().any(|e| e.contains("depends on itself")));
    }

    #[test]
    fn test_task_dependency_names_checked() {
        let report = validate(
            r#"
apiVersion: sbkube/v1
apps:
  seed:
    type: hook
    tasks:
      - type: command
        name: one
        command: echo one
      - type: command
        depends_on: [missing]
        command: echo two
"#,
        );
        assert!(report
            .errors
            .iter()
            .any(|e| e.contains("no task named 'missing'")));
    }

    #[test]
    fn test_empty_lists_warn_not_error() {
        let report = validate(
            "apiVersion: sbkube/v1\napps:\n  empty:\n    type: yaml\n    files: []\n",
        );
        assert!(report.is_ok());
        assert_eq!(report.warnings.len(), 1);
    }
}
