//! The build stage: stage charts with overrides and removes applied
//!
//! Only helm apps produce build output. A local chart with nothing to
//! override or remove skips the copy entirely; downstream stages read the
//! chart source directly.

use crate::config::model::{ChartSource, HelmApp};
use crate::config::settings::EffectiveSettings;
use crate::utils::errors::{ErrorKind, SbkubeError};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Resolve where the app's chart currently lives (pulled cache or local
/// directory).
pub fn chart_source_dir(
    app: &HelmApp,
    doc_dir: &Path,
    caches_root: &Path,
) -> PathBuf {
    match app.chart_source() {
        ChartSource::Remote { repo, name } => crate::utils::paths::chart_version_dir(
            caches_root,
            repo,
            name,
            app.version.as_deref(),
        ),
        ChartSource::Local(path) => crate::utils::paths::resolve_relative(doc_dir, path),
    }
}

/// The chart directory downstream stages should consume: the build output
/// when one exists, else the source.
pub fn effective_chart_dir(
    app_name: &str,
    app: &HelmApp,
    doc_dir: &Path,
    caches_root: &Path,
) -> PathBuf {
    let built = crate::utils::paths::build_dir(caches_root).join(app_name);
    if built.is_dir() {
        built
    } else {
        chart_source_dir(app, doc_dir, caches_root)
    }
}

/// Build one helm app. `Ok(None)` means the skip rule applied (local chart,
/// no overrides, no removes); `Ok(Some(dir))` is the staged chart.
pub fn build_app(
    app_name: &str,
    app: &HelmApp,
    doc_dir: &Path,
    caches_root: &Path,
    _effective: &EffectiveSettings,
    dry_run: bool,
) -> Result<Option<PathBuf>> {
    let source = chart_source_dir(app, doc_dir, caches_root);
    let is_local = matches!(app.chart_source(), ChartSource::Local(_));

    if is_local && app.overrides.is_empty() && app.removes.is_empty() {
        return Ok(None);
    }

    if !source.is_dir() {
        return Err(SbkubeError::new(
            ErrorKind::Filesystem,
            format!(
                "chart directory {} not found for app '{}'",
                source.display(),
                app_name
            ),
        )
        .with_hint("run 'sbkube prepare' first")
        .into());
    }

    let dest = crate::utils::paths::build_dir(caches_root).join(app_name);
    if dry_run {
        crate::log_info!(
            "[dry-run] would stage {} -> {} ({} overrides, {} removes)",
            source.display(),
            dest.display(),
            app.overrides.len(),
            app.removes.len()
        );
        return Ok(Some(dest));
    }

    // fresh staging every build; the output is rebuildable by definition
    if dest.exists() {
        std::fs::remove_dir_all(&dest)
            .with_context(|| format!("failed to clear {}", dest.display()))?;
    }
    copy_tree(&source, &dest)?;

    apply_overrides(app_name, app, caches_root, &dest)?;
    apply_removes(app_name, app, &dest)?;

    Ok(Some(dest))
}

fn copy_tree(source: &Path, dest: &Path) -> Result<()> {
    for entry in WalkDir::new(source) {
        let entry = entry.with_context(|| format!("failed to walk {}", source.display()))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .expect("walkdir yields children of its root");
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)
                .with_context(|| format!("failed to create {}", target.display()))?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)
                .with_context(|| format!("failed to copy to {}", target.display()))?;
        }
    }
    Ok(())
}

/// Each override path replaces the matching chart-root-relative file from
/// `overrides/{app-name}/`. A missing override source is a hard error; the
/// user listed it on purpose.
fn apply_overrides(app_name: &str, app: &HelmApp, caches_root: &Path, dest: &Path) -> Result<()> {
    let overrides_root = crate::utils::paths::overrides_dir(caches_root).join(app_name);
    for relative in &app.overrides {
        let source = overrides_root.join(relative);
        if !source.is_file() {
            return Err(SbkubeError::new(
                ErrorKind::Filesystem,
                format!(
                    "override file {} not found for app '{}'",
                    source.display(),
                    app_name
                ),
            )
            .with_hint(format!(
                "create it under overrides/{}/ or drop the entry",
                app_name
            ))
            .into());
        }
        let target = dest.join(relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&source, &target)
            .with_context(|| format!("failed to apply override {}", relative.display()))?;
    }
    Ok(())
}

fn apply_removes(app_name: &str, app: &HelmApp, dest: &Path) -> Result<()> {
    for relative in &app.removes {
        let target = dest.join(relative);
        if target.is_dir() {
            std::fs::remove_dir_all(&target)
                .with_context(|| format!("failed to remove {}", target.display()))?;
        } else if target.is_file() {
            std::fs::remove_file(&target)
                .with_context(|| format!("failed to remove {}", target.display()))?;
        } else {
            crate::log_warn!(
                "remove entry {} not present in chart for app '{}'",
                relative.display(),
                app_name
            );
        }
    }
    Ok(())
}
