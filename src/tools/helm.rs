//! helm command contracts

use crate::tools::runner::{RetryPolicy, ToolError, ToolInvocation, ToolOutput};
use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default ceiling for a helm install/upgrade when the app sets none.
pub const DEFAULT_HELM_TIMEOUT: Duration = Duration::from_secs(600);

/// helm handle carrying cluster coordinates.
#[derive(Debug, Clone, Default)]
pub struct Helm {
    pub kubeconfig: Option<PathBuf>,
    pub context: Option<String>,
    retry: RetryPolicy,
}

/// Everything `helm upgrade --install` needs for one release.
#[derive(Debug, Clone)]
pub struct UpgradeParams {
    pub release: String,
    pub chart_path: PathBuf,
    pub namespace: Option<String>,
    pub create_namespace: bool,
    pub values_files: Vec<PathBuf>,
    pub set_values: Vec<String>,
    pub wait: bool,
    pub timeout: Option<String>,
    pub atomic: bool,
}

impl Helm {
    pub fn new(kubeconfig: Option<PathBuf>, context: Option<String>) -> Self {
        Self {
            kubeconfig,
            context,
            retry: RetryPolicy::default(),
        }
    }

    fn base(&self) -> ToolInvocation {
        let mut invocation = ToolInvocation::new("helm");
        if let Some(kubeconfig) = &self.kubeconfig {
            invocation = invocation.env("KUBECONFIG", kubeconfig.display().to_string());
        }
        if let Some(context) = &self.context {
            invocation = invocation.args(["--kube-context", context]);
        }
        invocation
    }

    /// `helm pull <chart> --repo <url> --untar` into `untar_dir`. The chart
    /// lands at `untar_dir/<chart>`. Network-class failures retry.
    pub fn pull_from_repo(
        &self,
        repo_url: &str,
        chart: &str,
        version: Option<&str>,
        untar_dir: &Path,
    ) -> Result<PathBuf, ToolError> {
        let mut invocation = self
            .base()
            .arg("pull")
            .arg(chart)
            .args(["--repo", repo_url])
            .arg("--untar")
            .arg("--untardir")
            .arg(untar_dir.display().to_string());
        if let Some(version) = version {
            invocation = invocation.args(["--version", version]);
        }
        invocation.run_retrying(&self.retry)?;
        Ok(untar_dir.join(chart))
    }

    /// `helm pull oci://<registry>/<chart> --untar` with the same contract.
    pub fn pull_from_oci(
        &self,
        registry_url: &str,
        chart: &str,
        version: Option<&str>,
        untar_dir: &Path,
    ) -> Result<PathBuf, ToolError> {
        let registry = registry_url
            .trim_start_matches("oci://")
            .trim_end_matches('/');
        let mut invocation = self
            .base()
            .arg("pull")
            .arg(format!("oci://{}/{}", registry, chart))
            .arg("--untar")
            .arg("--untardir")
            .arg(untar_dir.display().to_string());
        if let Some(version) = version {
            invocation = invocation.args(["--version", version]);
        }
        invocation.run_retrying(&self.retry)?;
        Ok(untar_dir.join(chart))
    }

    /// `helm registry login` with the password on stdin, never in argv.
    pub fn registry_login(
        &self,
        registry_url: &str,
        username: &str,
        password: &str,
    ) -> Result<ToolOutput, ToolError> {
        let registry = registry_url
            .trim_start_matches("oci://")
            .trim_end_matches('/');
        self.base()
            .args(["registry", "login", registry])
            .args(["--username", username])
            .arg("--password-stdin")
            .stdin(password)
            .run_retrying(&self.retry)
    }

    /// `helm template` with the full merged values chain. Returns rendered
    /// YAML on stdout.
    pub fn template(
        &self,
        release: &str,
        chart_path: &Path,
        namespace: Option<&str>,
        values_files: &[PathBuf],
        set_values: &[String],
    ) -> Result<String, ToolError> {
        let mut invocation = self
            .base()
            .arg("template")
            .arg(release)
            .arg(chart_path.display().to_string());
        if let Some(ns) = namespace {
            invocation = invocation.args(["--namespace", ns]);
        }
        for file in values_files {
            invocation = invocation.arg("--values").arg(file.display().to_string());
        }
        for set in set_values {
            invocation = invocation.args(["--set", set]);
        }
        let output = invocation.run_retrying(&RetryPolicy::none())?;
        Ok(output.stdout)
    }

    /// `helm upgrade --install` per the release parameters.
    pub fn upgrade_install(&self, params: &UpgradeParams) -> Result<ToolOutput, ToolError> {
        let mut invocation = self
            .base()
            .args(["upgrade", "--install"])
            .arg(&params.release)
            .arg(params.chart_path.display().to_string());
        if let Some(ns) = &params.namespace {
            invocation = invocation.args(["--namespace", ns]);
        }
        if params.create_namespace {
            invocation = invocation.arg("--create-namespace");
        }
        for file in &params.values_files {
            invocation = invocation.arg("--values").arg(file.display().to_string());
        }
        for set in &params.set_values {
            invocation = invocation.args(["--set", set]);
        }
        if params.wait {
            invocation = invocation.arg("--wait");
        }
        if params.atomic {
            invocation = invocation.arg("--atomic");
        }
        let timeout = params
            .timeout
            .as_deref()
            .and_then(parse_go_duration)
            .unwrap_or(DEFAULT_HELM_TIMEOUT);
        invocation = invocation
            .arg("--timeout")
            .arg(format!("{}s", timeout.as_secs()));
        invocation
            // subprocess ceiling sits above helm's own --timeout
            .timeout(timeout + Duration::from_secs(60))
            .run_retrying(&RetryPolicy::none())
    }

    /// Current revision of a release, `None` when it is not installed.
    pub fn release_revision(&self, release: &str, namespace: Option<&str>) -> Result<Option<u64>> {
        let mut invocation = self.base().args(["status", release, "-o", "json"]);
        if let Some(ns) = namespace {
            invocation = invocation.args(["--namespace", ns]);
        }
        match invocation.run_retrying(&self.retry) {
            Ok(output) => {
                let doc: serde_json::Value = serde_json::from_str(&output.stdout)
                    .context("helm status returned unparseable JSON")?;
                Ok(doc.get("version").and_then(|v| v.as_u64()))
            }
            Err(err) if err.stderr().to_lowercase().contains("not found") => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// `helm rollback <release> <revision>`
    pub fn rollback(
        &self,
        release: &str,
        revision: u64,
        namespace: Option<&str>,
    ) -> Result<ToolOutput, ToolError> {
        let mut invocation = self
            .base()
            .arg("rollback")
            .arg(release)
            .arg(revision.to_string());
        if let Some(ns) = namespace {
            invocation = invocation.args(["--namespace", ns]);
        }
        invocation.run_retrying(&RetryPolicy::none())
    }

    /// `helm uninstall <release>`
    pub fn uninstall(&self, release: &str, namespace: Option<&str>) -> Result<ToolOutput, ToolError> {
        let mut invocation = self.base().arg("uninstall").arg(release);
        if let Some(ns) = namespace {
            invocation = invocation.args(["--namespace", ns]);
        }
        invocation.run_retrying(&RetryPolicy::none())
    }
}

/// Latest chart version listed in a repo's `index.yaml`.
///
/// check-updates goes to the index directly instead of requiring a
/// `helm repo add` for every configured repo.
pub fn latest_index_version(repo_url: &str, chart: &str) -> Result<Option<semver::Version>> {
    let url = format!("{}/index.yaml", repo_url.trim_end_matches('/'));
    let body = reqwest::blocking::get(&url)
        .with_context(|| format!("failed to fetch {}", url))?
        .error_for_status()
        .with_context(|| format!("repo index request rejected: {}", url))?
        .text()
        .context("failed to read repo index body")?;
    let doc: serde_yaml::Value = serde_yaml::from_str(&body).context("repo index is not valid YAML")?;
    let entries = doc
        .get("entries")
        .and_then(|e| e.get(chart))
        .and_then(|c| c.as_sequence())
        .ok_or_else(|| anyhow!("chart '{}' not present in {}", chart, url))?;
    let mut best: Option<semver::Version> = None;
    for entry in entries {
        let Some(raw) = entry.get("version").and_then(|v| v.as_str()) else {
            continue;
        };
        if let Ok(version) = semver::Version::parse(raw.trim_start_matches('v')) {
            // skip prereleases; "newer" means a stable release
            if !version.pre.is_empty() {
                continue;
            }
            if best.as_ref().map_or(true, |b| &version > b) {
                best = Some(version);
            }
        }
    }
    Ok(best)
}

/// Parse helm-style duration literals: `600s`, `10m`, `1h`, bare seconds.
pub fn parse_go_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let (number, unit) = raw.split_at(raw.len() - 1);
    let value: u64 = number.parse().ok()?;
    match unit {
        "s" => Some(Duration::from_secs(value)),
        "m" => Some(Duration::from_secs(value * 60)),
        "h" => Some(Duration::from_secs(value * 3600)),
        _ => None,
    }
}
