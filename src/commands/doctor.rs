//! `sbkube doctor` — environment diagnostics

use crate::commands::pipeline::{resolve_invocation, TargetArgs};
use crate::state::StateStore;
use crate::tools::Kubectl;
use crate::utils::{CommonPrereqs, Prerequisite};
use anyhow::Result;
use colored::Colorize;

enum Check {
    Pass(String),
    Warn(String),
    Fail(String),
}

impl Check {
    fn display(&self) {
        match self {
            Check::Pass(msg) => println!("  {} {}", "✓".green(), msg),
            Check::Warn(msg) => println!("  {} {}", "⚠".yellow(), msg),
            Check::Fail(msg) => println!("  {} {}", "✗".red(), msg),
        }
    }
}

pub fn run(args: &TargetArgs) -> Result<i32> {
    let mut checks: Vec<Check> = Vec::new();

    // external tools with minimum versions
    for prereq in [CommonPrereqs::helm(), CommonPrereqs::kubectl(), CommonPrereqs::git()] {
        match prereq.check() {
            Ok(()) => {
                let version = prereq
                    .installed_version()
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "unknown version".to_string());
                checks.push(Check::Pass(format!("{} {}", prereq.name, version)));
            }
            Err(err) => checks.push(Check::Fail(format!(
                "{} - {}",
                prereq.name,
                err.hint.as_deref().unwrap_or(&err.message)
            ))),
        }
    }

    // workspace (optional: doctor also works outside one)
    match resolve_invocation(args) {
        Ok(invocation) => {
            let scope = invocation.scope();
            checks.push(Check::Pass(format!(
                "workspace at {} ({} group(s))",
                invocation.workspace_root.display(),
                scope.walk().len()
            )));

            let effective = &scope.effective;
            match effective.kubeconfig_path() {
                Some(kubeconfig) if kubeconfig.is_file() => {
                    checks.push(Check::Pass(format!("kubeconfig {}", kubeconfig.display())));
                    if let Some(problem) =
                        crate::config::validate::check_kubeconfig_context(effective)
                    {
                        checks.push(Check::Fail(problem));
                    } else if let Some(context) = &effective.merged.kubeconfig_context {
                        checks.push(Check::Pass(format!("context {}", context)));
                    }
                }
                Some(kubeconfig) => {
                    checks.push(Check::Fail(format!(
                        "kubeconfig {} does not exist",
                        kubeconfig.display()
                    )));
                }
                None => checks.push(Check::Warn(
                    "no kubeconfig configured (set settings.kubeconfig or $KUBECONFIG)".to_string(),
                )),
            }

            let kubectl = Kubectl::new(
                effective.kubeconfig_path(),
                effective.merged.kubeconfig_context.clone(),
            );
            match kubectl.cluster_info() {
                Ok(_) => checks.push(Check::Pass("cluster reachable".to_string())),
                Err(err) => checks.push(Check::Warn(format!("cluster unreachable: {}", err))),
            }
        }
        Err(_) => checks.push(Check::Warn(
            "no sbkube.yaml found from here (run inside a workspace for config checks)".to_string(),
        )),
    }

    // state store health
    match StateStore::open_default() {
        Ok(store) => match store.list_deployments(None, None, None, 1) {
            Ok(_) => checks.push(Check::Pass("state store readable".to_string())),
            Err(err) => checks.push(Check::Fail(format!("state store corrupt: {}", err))),
        },
        Err(err) => checks.push(Check::Fail(format!("state store unavailable: {}", err))),
    }

    println!("sbkube environment diagnostics");
    println!();
    let mut failures = 0usize;
    for check in &checks {
        check.display();
        if matches!(check, Check::Fail(_)) {
            failures += 1;
        }
    }
    println!();
    if failures == 0 {
        println!("{}", "environment looks healthy".green());
        Ok(0)
    } else {
        println!("{} problem(s) found", failures);
        Ok(1)
    }
}
