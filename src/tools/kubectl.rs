//! kubectl command contracts

use crate::manifest::ResourceRef;
use crate::tools::runner::{RetryPolicy, ToolError, ToolInvocation, ToolOutput};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// kubectl handle carrying the cluster coordinates for one invocation scope.
#[derive(Debug, Clone, Default)]
pub struct Kubectl {
    pub kubeconfig: Option<PathBuf>,
    pub context: Option<String>,
    retry: RetryPolicy,
}

impl Kubectl {
    pub fn new(kubeconfig: Option<PathBuf>, context: Option<String>) -> Self {
        Self {
            kubeconfig,
            context,
            retry: RetryPolicy::default(),
        }
    }

    fn base(&self) -> ToolInvocation {
        let mut invocation = ToolInvocation::new("kubectl");
        if let Some(kubeconfig) = &self.kubeconfig {
            invocation = invocation.env("KUBECONFIG", kubeconfig.display().to_string());
        }
        if let Some(context) = &self.context {
            invocation = invocation.args(["--context", context]);
        }
        invocation
    }

    fn namespaced(&self, invocation: ToolInvocation, namespace: Option<&str>) -> ToolInvocation {
        match namespace {
            Some(ns) => invocation.args(["--namespace", ns]),
            None => invocation,
        }
    }

    /// `kubectl apply -f <path>`
    pub fn apply_path(&self, path: &Path, namespace: Option<&str>) -> Result<ToolOutput, ToolError> {
        let invocation = self
            .base()
            .args(["apply", "-f"])
            .arg(path.display().to_string());
        self.namespaced(invocation, namespace).run_retrying(&self.retry)
    }

    /// `kubectl apply -f -` with the manifest on stdin.
    pub fn apply_stdin(&self, yaml: &str, namespace: Option<&str>) -> Result<ToolOutput, ToolError> {
        let invocation = self.base().args(["apply", "-f", "-"]).stdin(yaml);
        self.namespaced(invocation, namespace).run_retrying(&self.retry)
    }

    /// `kubectl create -f <path>`
    pub fn create_path(&self, path: &Path, namespace: Option<&str>) -> Result<ToolOutput, ToolError> {
        let invocation = self
            .base()
            .args(["create", "-f"])
            .arg(path.display().to_string());
        self.namespaced(invocation, namespace).run_retrying(&self.retry)
    }

    /// `kubectl delete -f <path> --ignore-not-found`
    pub fn delete_path(&self, path: &Path, namespace: Option<&str>) -> Result<ToolOutput, ToolError> {
        let invocation = self
            .base()
            .args(["delete", "-f"])
            .arg(path.display().to_string())
            .arg("--ignore-not-found");
        self.namespaced(invocation, namespace).run_retrying(&self.retry)
    }

    /// `kubectl delete <type> <name> --ignore-not-found`
    pub fn delete_resource(&self, resource: &ResourceRef) -> Result<ToolOutput, ToolError> {
        let invocation = self
            .base()
            .arg("delete")
            .arg(resource.kubectl_type())
            .arg(&resource.name)
            .arg("--ignore-not-found");
        self.namespaced(invocation, resource.namespace.as_deref())
            .run_retrying(&self.retry)
    }

    /// Fetch an object's live state as YAML. `None` when the object does not
    /// exist (`--ignore-not-found` keeps that case on exit 0 with empty
    /// output, so absence never looks like a failure).
    pub fn get_yaml(&self, resource: &ResourceRef) -> Result<Option<String>, ToolError> {
        let invocation = self
            .base()
            .arg("get")
            .arg(resource.kubectl_type())
            .arg(&resource.name)
            .args(["--ignore-not-found", "-o", "yaml"]);
        let output = self
            .namespaced(invocation, resource.namespace.as_deref())
            .run_retrying(&self.retry)?;
        if output.stdout.trim().is_empty() {
            Ok(None)
        } else {
            Ok(Some(output.stdout))
        }
    }

    /// True when the object exists on the cluster.
    pub fn exists(&self, resource: &ResourceRef) -> Result<bool, ToolError> {
        Ok(self.get_yaml(resource)?.is_some())
    }

    /// `kubectl wait --for=condition=<cond> <resource> --timeout=<t>`
    pub fn wait_for(
        &self,
        resource: &str,
        condition: &str,
        namespace: Option<&str>,
        timeout: Duration,
    ) -> Result<ToolOutput, ToolError> {
        let invocation = self
            .base()
            .arg("wait")
            .arg(resource)
            .arg(format!("--for=condition={}", condition))
            .arg(format!("--timeout={}s", timeout.as_secs()));
        self.namespaced(invocation, namespace)
            // wait already has its own timeout; give the subprocess headroom
            .timeout(timeout + Duration::from_secs(30))
            .run_retrying(&RetryPolicy::none())
    }

    /// `kubectl kustomize <dir>` — render a kustomization to YAML.
    pub fn kustomize_build(&self, dir: &Path) -> Result<String, ToolError> {
        let output = self
            .base()
            .arg("kustomize")
            .arg(dir.display().to_string())
            .run_retrying(&self.retry)?;
        Ok(output.stdout)
    }

    /// `kubectl cluster-info` — reachability probe for doctor/validate.
    pub fn cluster_info(&self) -> Result<ToolOutput, ToolError> {
        self.base()
            .arg("cluster-info")
            .timeout(Duration::from_secs(20))
            .run()
    }

    /// `kubectl get <what> -o json` parsed into a JSON value.
    pub fn get_json(&self, what: &[&str]) -> Result<serde_json::Value> {
        let invocation = self.base().arg("get").args(what.iter().copied()).args(["-o", "json"]);
        let output = invocation.run_retrying(&self.retry)?;
        serde_json::from_str(&output.stdout).context("kubectl returned unparseable JSON")
    }
}

/// Contexts defined in a kubeconfig file. Read directly; validating a
/// context name must not require cluster connectivity.
pub fn kubeconfig_contexts(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read kubeconfig {}", path.display()))?;
    let doc: serde_yaml::Value =
        serde_yaml::from_str(&content).context("kubeconfig is not valid YAML")?;
    let mut names = Vec::new();
    if let Some(contexts) = doc.get("contexts").and_then(|c| c.as_sequence()) {
        for ctx in contexts {
            if let Some(name) = ctx.get("name").and_then(|n| n.as_str()) {
                names.push(name.to_string());
            }
        }
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_kubeconfig_contexts_parsing() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "apiVersion: v1\nkind: Config\ncontexts:\n- name: k3s-prod\n  context:\n    cluster: prod\n- name: Dev\n  context:\n    cluster: dev\n"
        )
        .unwrap();
        let contexts = kubeconfig_contexts(file.path()).unwrap();
        // names are case-sensitive and preserved verbatim
        assert_eq!(contexts, vec!["k3s-prod".to_string(), "Dev".to_string()]);
    }

    #[test]
    fn test_kubeconfig_without_contexts() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "apiVersion: v1\nkind: Config\n").unwrap();
        assert!(kubeconfig_contexts(file.path()).unwrap().is_empty());
    }
}
