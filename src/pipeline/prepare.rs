//! The prepare stage: materialize external sources under the workspace
//!
//! Fully idempotent: sources already present at the right version are left
//! alone (zero network calls) unless `--force`. Chart pulls are atomic —
//! a uniquely-suffixed temp directory is renamed into place — so concurrent
//! prepares of a shared workspace never corrupt each other.

use crate::config::model::{App, ChartSource, GitApp, HelmApp, HttpApp};
use crate::config::settings::EffectiveSettings;
use crate::tools::{Git, Helm};
use crate::utils::errors::{ErrorKind, SbkubeError};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Prepare one app. Returns a short human message describing what happened.
pub fn prepare_app(
    app_name: &str,
    app: &App,
    doc_dir: &Path,
    caches_root: &Path,
    effective: &EffectiveSettings,
    helm: &Helm,
    git: &Git,
    force: bool,
    dry_run: bool,
) -> Result<String> {
    match app {
        App::Helm(helm_app) => prepare_helm(app_name, helm_app, caches_root, effective, helm, force, dry_run),
        App::Git(git_app) => prepare_git(app_name, git_app, caches_root, effective, git, force, dry_run),
        App::Http(http_app) => prepare_http(app_name, http_app, doc_dir, force, dry_run),
        _ => Ok("nothing to prepare".to_string()),
    }
}

fn prepare_helm(
    app_name: &str,
    app: &HelmApp,
    caches_root: &Path,
    effective: &EffectiveSettings,
    helm: &Helm,
    force: bool,
    dry_run: bool,
) -> Result<String> {
    let ChartSource::Remote { repo, name } = app.chart_source() else {
        return Ok("local chart, nothing to pull".to_string());
    };

    let dest = crate::utils::paths::chart_version_dir(
        caches_root,
        repo,
        name,
        app.version.as_deref(),
    );
    if dest.is_dir() && !force {
        return Ok(format!("chart already present at {}", dest.display()));
    }

    if dry_run {
        return Ok(format!("[dry-run] would pull {} into {}", app.chart, dest.display()));
    }

    let repo_dir = dest.parent().context("chart path has no parent")?;
    std::fs::create_dir_all(repo_dir)
        .with_context(|| format!("failed to create {}", repo_dir.display()))?;

    // atomic materialization: pull into a unique temp dir, then rename
    let temp_dir = repo_dir.join(format!("_temp_{}_{}", name, Uuid::new_v4().simple()));
    std::fs::create_dir_all(&temp_dir)?;
    let pulled = pull_chart(app, repo, name, effective, helm, &temp_dir);
    let result = pulled.and_then(|chart_dir| {
        if dest.exists() {
            // another prepare won the race (or --force): replace
            std::fs::remove_dir_all(&dest)
                .with_context(|| format!("failed to clear {}", dest.display()))?;
        }
        std::fs::rename(&chart_dir, &dest)
            .with_context(|| format!("failed to move chart into {}", dest.display()))?;
        Ok(format!("pulled {} -> {}", app.chart, dest.display()))
    });
    let _ = std::fs::remove_dir_all(&temp_dir);
    result.map_err(|err| {
        SbkubeError::new(ErrorKind::Helm, format!("failed to pull chart for '{}'", app_name))
            .with_details(err.to_string())
            .with_hint("check the repo URL and chart name with 'helm search repo'")
            .into()
    })
}

fn pull_chart(
    app: &HelmApp,
    repo: &str,
    name: &str,
    effective: &EffectiveSettings,
    helm: &Helm,
    temp_dir: &Path,
) -> Result<PathBuf> {
    if let Some(registry) = effective.merged.oci_registries.get(repo) {
        if let (Some(username), Some(password_env)) =
            (registry.username.as_deref(), registry.password_env.as_deref())
        {
            if let Ok(password) = std::env::var(password_env) {
                helm.registry_login(&registry.url, username, &password)
                    .context("OCI registry login failed")?;
            }
        }
        let chart_dir = helm
            .pull_from_oci(&registry.url, name, app.version.as_deref(), temp_dir)
            .context("helm pull (oci) failed")?;
        return Ok(chart_dir);
    }
    let url = effective
        .merged
        .helm_repos
        .get(repo)
        .with_context(|| format!("repo '{}' is not declared in settings.helm_repos", repo))?;
    let chart_dir = helm
        .pull_from_repo(url, name, app.version.as_deref(), temp_dir)
        .context("helm pull failed")?;
    Ok(chart_dir)
}

fn prepare_git(
    app_name: &str,
    app: &GitApp,
    caches_root: &Path,
    effective: &EffectiveSettings,
    git: &Git,
    force: bool,
    dry_run: bool,
) -> Result<String> {
    let source = effective
        .merged
        .git_repos
        .get(&app.repo)
        .ok_or_else(|| {
            SbkubeError::new(
                ErrorKind::Config,
                format!("apps.{}.repo: '{}' is not declared in settings.git_repos", app_name, app.repo),
            )
        })?;
    let wanted_ref = app.requested_ref(source.reference.as_deref());
    let dest = crate::utils::paths::repos_dir(caches_root).join(&app.repo);

    if dest.join(".git").is_dir() {
        if !force {
            if let Some(wanted) = wanted_ref {
                if git.is_at_ref(&dest, wanted) {
                    return Ok(format!("repo already at {}", wanted));
                }
            } else {
                return Ok("repo already cloned".to_string());
            }
        }
        if dry_run {
            return Ok(format!(
                "[dry-run] would fetch and checkout {} in {}",
                wanted_ref.unwrap_or("HEAD"),
                dest.display()
            ));
        }
        if let Some(wanted) = wanted_ref {
            git.fetch_checkout(&dest, wanted).map_err(|err| {
                git_error(app_name, &source.url, err)
            })?;
            return Ok(format!("checked out {}", wanted));
        }
        return Ok("repo already cloned".to_string());
    }

    if dry_run {
        return Ok(format!("[dry-run] would clone {} into {}", source.url, dest.display()));
    }
    std::fs::create_dir_all(dest.parent().context("repos dir has no parent")?)?;
    git.clone(&source.url, wanted_ref, &dest)
        .map_err(|err| git_error(app_name, &source.url, err))?;
    Ok(format!("cloned {}", source.url))
}

fn git_error(app_name: &str, url: &str, err: crate::tools::ToolError) -> anyhow::Error {
    SbkubeError::new(ErrorKind::Git, format!("git operation failed for '{}'", app_name))
        .with_details(format!("{}\nurl: {}", err, url))
        .with_hint("check the repository URL, ref, and your credentials")
        .into()
}

fn prepare_http(
    app_name: &str,
    app: &HttpApp,
    doc_dir: &Path,
    force: bool,
    dry_run: bool,
) -> Result<String> {
    let dest = crate::utils::paths::resolve_relative(doc_dir, &app.dest);

    if dest.is_file() && !force {
        // HEAD short-circuit: same content length means no re-download
        if let Some(remote_len) = head_content_length(&app.url, app) {
            let local_len = std::fs::metadata(&dest).map(|m| m.len()).unwrap_or(0);
            if local_len == remote_len {
                return Ok("file already downloaded".to_string());
            }
        } else {
            return Ok("file already present (server reports no length)".to_string());
        }
    }

    if dry_run {
        return Ok(format!("[dry-run] would download {} to {}", app.url, dest.display()));
    }

    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let client = reqwest::blocking::Client::new();
    let mut request = client.get(&app.url);
    for (key, value) in &app.headers {
        request = request.header(key.as_str(), value.as_str());
    }
    let response = request
        .send()
        .and_then(|r| r.error_for_status())
        .map_err(|err| {
            SbkubeError::new(ErrorKind::Tool, format!("download failed for '{}'", app_name))
                .with_details(format!("{}\nurl: {}", err, app.url))
        })?;
    let bytes = response.bytes().context("failed to read response body")?;
    std::fs::write(&dest, &bytes)
        .with_context(|| format!("failed to write {}", dest.display()))?;
    Ok(format!("downloaded {} bytes to {}", bytes.len(), dest.display()))
}

fn head_content_length(url: &str, app: &HttpApp) -> Option<u64> {
    let client = reqwest::blocking::Client::new();
    let mut request = client.head(url);
    for (key, value) in &app.headers {
        request = request.header(key.as_str(), value.as_str());
    }
    let response = request.send().ok()?;
    if !response.status().is_success() {
        return None;
    }
    response
        .headers()
        .get(reqwest::header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::parse_unified;
    use crate::config::settings::Settings;

    #[test]
    fn test_local_chart_is_noop() {
        let config = parse_unified(
            "apiVersion: sbkube/v1\napps:\n  backend:\n    type: helm\n    chart: ./charts/backend\n",
        )
        .unwrap();
        let effective = EffectiveSettings::root(&Settings::default(), Path::new("/ws"));
        let message = prepare_app(
            "backend",
            &config.apps["backend"],
            Path::new("/ws"),
            Path::new("/ws"),
            &effective,
            &Helm::default(),
            &Git::new(),
            false,
            false,
        )
        .unwrap();
        assert!(message.contains("local chart"));
    }

    #[test]
    fn test_existing_chart_dir_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let chart_dir = crate::utils::paths::chart_version_dir(
            dir.path(),
            "bitnami",
            "redis",
            Some("17.13.2"),
        );
        std::fs::create_dir_all(&chart_dir).unwrap();

        let config = parse_unified(
            "apiVersion: sbkube/v1\nsettings:\n  helm_repos:\n    bitnami: https://charts.bitnami.com/bitnami\napps:\n  redis:\n    type: helm\n    chart: bitnami/redis\n    version: \"17.13.2\"\n",
        )
        .unwrap();
        let effective = EffectiveSettings::root(&config.settings, dir.path());
        // no helm binary call happens: the versioned dir exists
        let message = prepare_app(
            "redis",
            &config.apps["redis"],
            dir.path(),
            dir.path(),
            &effective,
            &Helm::default(),
            &Git::new(),
            false,
            false,
        )
        .unwrap();
        assert!(message.contains("already present"));
    }

    #[test]
    fn test_dry_run_reports_without_pulling() {
        let dir = tempfile::tempdir().unwrap();
        let config = parse_unified(
            "apiVersion: sbkube/v1\nsettings:\n  helm_repos:\n    bitnami: https://charts.bitnami.com/bitnami\napps:\n  redis:\n    type: helm\n    chart: bitnami/redis\n",
        )
        .unwrap();
        let effective = EffectiveSettings::root(&config.settings, dir.path());
        let message = prepare_app(
            "redis",
            &config.apps["redis"],
            dir.path(),
            dir.path(),
            &effective,
            &Helm::default(),
            &Git::new(),
            false,
            true,
        )
        .unwrap();
        assert!(message.contains("[dry-run]"));
        // versioned path uses the -latest suffix when no version is pinned
        assert!(message.contains("redis-latest"));
    }

    #[test]
    fn test_unregistered_git_repo_is_config_error() {
        let config = parse_unified(
            "apiVersion: sbkube/v1\napps:\n  src:\n    type: git\n    repo: nowhere\n",
        )
        .unwrap();
        let effective = EffectiveSettings::root(&Settings::default(), Path::new("/ws"));
        let err = prepare_app(
            "src",
            &config.apps["src"],
            Path::new("/ws"),
            Path::new("/ws"),
            &effective,
            &Helm::default(),
            &Git::new(),
            false,
            false,
        )
        .unwrap_err();
        let sb = err.downcast_ref::<SbkubeError>().unwrap();
        assert_eq!(sb.kind, ErrorKind::Config);
    }

    #[test]
    fn test_existing_http_file_without_head_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("file.bin");
        std::fs::write(&dest, b"cached").unwrap();
        let config = parse_unified(
            "apiVersion: sbkube/v1\napps:\n  blob:\n    type: http\n    url: http://127.0.0.1:1/nothing\n    dest: file.bin\n",
        )
        .unwrap();
        let effective = EffectiveSettings::root(&Settings::default(), dir.path());
        // HEAD against a dead port fails; the cached file is kept as-is
        let message = prepare_app(
            "blob",
            &config.apps["blob"],
            dir.path(),
            dir.path(),
            &effective,
            &Helm::default(),
            &Git::new(),
            false,
            false,
        )
        .unwrap();
        assert!(message.contains("already present"));
    }
}
