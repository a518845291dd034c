//! `sbkube init` — scaffold a new workspace

use crate::utils::errors::{ErrorKind, SbkubeError};
use anyhow::{Context, Result};
use std::path::Path;

const STARTER: &str = r#"# sbkube workspace configuration
# docs: run `sbkube validate` after editing
apiVersion: sbkube/v1

metadata:
  project: my-project

settings:
  # kubeconfig: ~/.kube/config
  # kubeconfig_context: my-cluster
  cluster: local
  namespace: default
  helm_repos:
    bitnami: https://charts.bitnami.com/bitnami
  # oci_registries:
  #   internal:
  #     url: registry.example.com/charts
  #     username: deploy
  #     password_env: REGISTRY_TOKEN
  # git_repos:
  #   configs:
  #     url: https://github.com/example/configs.git
  #     ref: main

apps:
  redis:
    type: helm
    chart: bitnami/redis
    version: "17.13.2"
    values: []
    # set_values: ["auth.enabled=false"]

  # manifests:
  #   type: yaml
  #   files: [manifests/app.yaml]
  #   depends_on: [redis]

# phases:
#   data:
#     path: a101_data/sbkube.yaml
"#;

pub fn run(target: Option<&Path>, force: bool) -> Result<i32> {
    let dir = match target {
        Some(dir) => dir.to_path_buf(),
        None => std::env::current_dir().context("cannot determine current directory")?,
    };
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;

    let config = dir.join(crate::utils::paths::CONFIG_FILE);
    if config.exists() && !force {
        return Err(SbkubeError::new(
            ErrorKind::Config,
            format!("{} already exists", config.display()),
        )
        .with_hint("pass --force to overwrite")
        .into());
    }
    std::fs::write(&config, STARTER)
        .with_context(|| format!("failed to write {}", config.display()))?;

    for sub in ["values", "manifests", "overrides"] {
        std::fs::create_dir_all(dir.join(sub))?;
    }

    crate::log_info!("created {}", config.display());
    crate::log_info!("next: edit the config, then run 'sbkube validate'");
    Ok(0)
}
