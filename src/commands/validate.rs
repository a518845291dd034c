//! `sbkube validate` — configuration and dependency checks
//!
//! Exit codes: 0 clean, 2 when only warnings were found, 1 on errors.
//! The same dependency information that blocks `apply` is reported here as
//! a warning, so operators can see what must be deployed first.

use crate::commands::pipeline::{resolve_invocation, TargetArgs};
use crate::config::validate::{check_kubeconfig_context, validate_tree};
use crate::state::StateStore;
use crate::tools::Kubectl;
use crate::utils::output::{emit, OutputFormat};
use anyhow::Result;
use colored::Colorize;
use serde::Serialize;

#[derive(Serialize)]
struct ValidateReport {
    errors: Vec<String>,
    warnings: Vec<String>,
}

pub fn run(
    args: &TargetArgs,
    skip_storage_check: bool,
    strict_storage_check: bool,
    format: OutputFormat,
) -> Result<i32> {
    let invocation = resolve_invocation(args)?;
    let scope = invocation.scope();

    let mut report = validate_tree(scope);

    // kubeconfig context existence (warning here; deploy blocks on it)
    for node in scope.walk() {
        if let Some(problem) = check_kubeconfig_context(&node.effective) {
            report.warnings.push(format!("{}: {}", node.group, problem));
        }
    }

    // cross-document deps: validate warns, apply blocks
    if let Ok(store) = StateStore::open_default() {
        for node in scope.walk() {
            let missing = crate::deps::check_group_deps(&node.config, |group| {
                store
                    .latest_success_namespace_for_group(group)
                    .unwrap_or(None)
            });
            for entry in missing {
                report.warnings.push(format!(
                    "{}: app '{}' requires group '{}' which has never been deployed successfully",
                    node.group, entry.app, entry.group
                ));
            }
        }
    }

    if !skip_storage_check {
        let storage_findings = storage_check(scope);
        if strict_storage_check {
            report.errors.extend(storage_findings);
        } else {
            report.warnings.extend(storage_findings);
        }
    }

    let payload = ValidateReport {
        errors: report.errors.clone(),
        warnings: report.warnings.clone(),
    };
    emit(format, &payload, || {
        for error in &report.errors {
            println!("{} {}", "error:".red().bold(), error);
        }
        for warning in &report.warnings {
            println!("{} {}", "warning:".yellow(), warning);
        }
        if report.errors.is_empty() && report.warnings.is_empty() {
            println!("{}", "configuration is valid".green());
        } else {
            println!(
                "{} error(s), {} warning(s)",
                report.errors.len(),
                report.warnings.len()
            );
        }
        Ok(())
    })?;

    Ok(if !report.errors.is_empty() {
        1
    } else if !report.warnings.is_empty() {
        2
    } else {
        0
    })
}

/// PV/PVC sanity: a `no-provisioner` StorageClass with zero PersistentVolumes
/// cannot bind any claim. Needs cluster access; unreachable clusters just
/// skip the check.
fn storage_check(scope: &crate::config::phases::PhaseNode) -> Vec<String> {
    let mut findings = Vec::new();
    let effective = &scope.effective;
    let kubectl = Kubectl::new(
        effective.kubeconfig_path(),
        effective.merged.kubeconfig_context.clone(),
    );
    let Ok(classes) = kubectl.get_json(&["storageclasses"]) else {
        return findings;
    };
    let Some(items) = classes.get("items").and_then(|i| i.as_array()) else {
        return findings;
    };
    for class in items {
        let provisioner = class
            .get("provisioner")
            .and_then(|p| p.as_str())
            .unwrap_or_default();
        if provisioner != "kubernetes.io/no-provisioner" {
            continue;
        }
        let name = class
            .get("metadata")
            .and_then(|m| m.get("name"))
            .and_then(|n| n.as_str())
            .unwrap_or("?");
        let pv_count = kubectl
            .get_json(&["persistentvolumes"])
            .ok()
            .and_then(|pvs| pvs.get("items").and_then(|i| i.as_array()).map(|a| a.len()))
            .unwrap_or(0);
        if pv_count == 0 {
            findings.push(format!(
                "StorageClass '{}' uses no-provisioner but the cluster has no PersistentVolumes",
                name
            ));
        }
    }
    findings
}
