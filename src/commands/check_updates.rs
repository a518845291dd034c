//! `sbkube check-updates` — compare pinned chart versions against repos

use crate::commands::pipeline::{resolve_invocation, TargetArgs};
use crate::config::model::{App, ChartSource};
use crate::tools::helm::latest_index_version;
use crate::utils::output::{emit, OutputFormat};
use anyhow::Result;
use colored::Colorize;
use serde::Serialize;

#[derive(Serialize)]
struct UpdateReport {
    app: String,
    chart: String,
    pinned: Option<String>,
    latest: Option<String>,
    update_available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    note: Option<String>,
}

pub fn run(args: &TargetArgs, format: OutputFormat) -> Result<i32> {
    let invocation = resolve_invocation(args)?;
    let scope = invocation.scope();

    let mut reports = Vec::new();
    for node in scope.walk() {
        for (app_name, app) in &node.config.apps {
            let App::Helm(helm_app) = app else { continue };
            let ChartSource::Remote { repo, name } = helm_app.chart_source() else {
                continue;
            };
            let Some(repo_url) = node.effective.merged.helm_repos.get(repo) else {
                // OCI registries have no index.yaml to consult
                reports.push(UpdateReport {
                    app: app_name.clone(),
                    chart: helm_app.chart.clone(),
                    pinned: helm_app.version.clone(),
                    latest: None,
                    update_available: false,
                    note: Some("OCI registry; version check not supported".to_string()),
                });
                continue;
            };

            match latest_index_version(repo_url, name) {
                Ok(Some(latest)) => {
                    let pinned = helm_app
                        .version
                        .as_deref()
                        .and_then(|v| semver::Version::parse(v.trim_start_matches('v')).ok());
                    let update_available = match &pinned {
                        Some(pinned) => &latest > pinned,
                        // unpinned charts float to latest at prepare time
                        None => false,
                    };
                    reports.push(UpdateReport {
                        app: app_name.clone(),
                        chart: helm_app.chart.clone(),
                        pinned: helm_app.version.clone(),
                        latest: Some(latest.to_string()),
                        update_available,
                        note: None,
                    });
                }
                Ok(None) => reports.push(UpdateReport {
                    app: app_name.clone(),
                    chart: helm_app.chart.clone(),
                    pinned: helm_app.version.clone(),
                    latest: None,
                    update_available: false,
                    note: Some("no stable versions listed in repo index".to_string()),
                }),
                Err(err) => reports.push(UpdateReport {
                    app: app_name.clone(),
                    chart: helm_app.chart.clone(),
                    pinned: helm_app.version.clone(),
                    latest: None,
                    update_available: false,
                    note: Some(format!("index fetch failed: {}", err)),
                }),
            }
        }
    }

    emit(format, &reports, || {
        if reports.is_empty() {
            println!("no remote helm charts in scope");
            return Ok(());
        }
        for report in &reports {
            let pinned = report.pinned.as_deref().unwrap_or("(latest)");
            match (&report.latest, report.update_available) {
                (Some(latest), true) => println!(
                    "{:<24} {:<32} {} -> {}",
                    report.app,
                    report.chart,
                    pinned,
                    latest.green().bold()
                ),
                (Some(latest), false) => {
                    println!("{:<24} {:<32} {} (latest {})", report.app, report.chart, pinned, latest)
                }
                (None, _) => println!(
                    "{:<24} {:<32} {} [{}]",
                    report.app,
                    report.chart,
                    pinned,
                    report.note.as_deref().unwrap_or("unknown")
                ),
            }
        }
        Ok(())
    })?;
    Ok(0)
}
