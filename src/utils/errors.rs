//! Error taxonomy with remediation hints
//!
//! Every user-facing failure is classified into a fixed set of kinds. A kind
//! decides whether the failure may be retried, how it renders on the
//! terminal, and what the machine-readable error object looks like.

use serde::Serialize;
use std::path::Path;
use thiserror::Error;

/// Classification of a failure. Fixed taxonomy; see the retry policy in
/// `tools::runner` for which kinds are ever retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    Tool,
    Kubernetes,
    Helm,
    Git,
    Filesystem,
    State,
    Validation,
    Hook,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Config => "config",
            ErrorKind::Tool => "tool",
            ErrorKind::Kubernetes => "kubernetes",
            ErrorKind::Helm => "helm",
            ErrorKind::Git => "git",
            ErrorKind::Filesystem => "filesystem",
            ErrorKind::State => "state",
            ErrorKind::Validation => "validation",
            ErrorKind::Hook => "hook",
        }
    }
}

/// A classified sbkube error: one-sentence symptom, optional detail block,
/// optional one-line remediation hint.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct SbkubeError {
    pub kind: ErrorKind,
    pub message: String,
    pub details: Option<String>,
    pub hint: Option<String>,
}

impl SbkubeError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
            hint: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Render to stderr: kind-tagged one-line summary, hint, and the detail
    /// block only in verbose mode.
    pub fn display(&self, verbose: bool) {
        crate::utils::logger::log_failure(
            self.kind,
            &self.message,
            self.details.as_deref(),
            self.hint.as_deref(),
            verbose,
        );
    }

    /// Machine-readable error object for `--format json|yaml`.
    pub fn to_object(&self) -> ErrorObject {
        ErrorObject {
            kind: self.kind,
            message: self.message.clone(),
            details: self.details.clone(),
            hint: self.hint.clone(),
        }
    }

    // Common constructors

    /// No `sbkube.yaml` found by upward search from the target.
    pub fn config_file_not_found(start: &Path) -> Self {
        Self::new(
            ErrorKind::Config,
            format!(
                "no sbkube.yaml found in {} or any parent directory",
                start.display()
            ),
        )
        .with_hint("run 'sbkube init' to scaffold a workspace, or pass -f <file>")
    }

    /// A required external tool is missing from PATH.
    pub fn cli_tool_not_found(tool: &str, install_hint: &str) -> Self {
        Self::new(ErrorKind::Tool, format!("required tool '{}' not found", tool))
            .with_hint(format!("install with: {}", install_hint))
    }

    /// Aggregated configuration validation failure.
    pub fn config_validation(problems: &[String]) -> Self {
        let message = match problems.len() {
            1 => problems[0].clone(),
            n => format!("{} configuration errors", n),
        };
        Self::new(ErrorKind::Config, message)
            .with_details(problems.join("\n"))
            .with_hint("run 'sbkube validate' for the full report")
    }

    /// Circular `depends_on` chain, naming every node on the cycle.
    pub fn dependency_cycle(cycle: &[String]) -> Self {
        Self::new(
            ErrorKind::Config,
            format!("circular depends_on chain: {}", cycle.join(" -> ")),
        )
        .with_hint("break the cycle by removing one of the depends_on entries")
    }

    /// Cross-document `deps` entry with no successful deployment on record.
    pub fn group_not_deployed(group: &str, wanted_by: &str) -> Self {
        Self::new(
            ErrorKind::Validation,
            format!(
                "app '{}' requires group '{}' which has never been deployed successfully",
                wanted_by, group
            ),
        )
        .with_hint(format!("deploy '{}' first: sbkube apply <path-to-{}>", group, group))
    }

    /// Another process holds the state store lock.
    pub fn state_locked(path: &Path) -> Self {
        Self::new(
            ErrorKind::State,
            format!("state store is locked by another process: {}", path.display()),
        )
        .with_hint("wait for the other sbkube invocation to finish, or remove a stale lock file")
    }
}

/// Serializable error shape for machine formats.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorObject {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

/// Classify an untyped error chain into the taxonomy.
///
/// Handlers mostly bubble `anyhow::Error`; at the boundary we either find a
/// typed `SbkubeError` in the chain or classify from the failing tool's
/// context.
pub fn classify(err: &anyhow::Error) -> ErrorObject {
    if let Some(sb) = err.downcast_ref::<SbkubeError>() {
        return sb.to_object();
    }
    let message = err.to_string();
    let details = {
        let chain: Vec<String> = err.chain().skip(1).map(|c| c.to_string()).collect();
        if chain.is_empty() {
            None
        } else {
            Some(chain.join("\n"))
        }
    };
    ErrorObject {
        kind: ErrorKind::Tool,
        message,
        details,
        hint: None,
    }
}

/// Render any error chain to stderr the way `SbkubeError::display` does.
pub fn display_error(err: &anyhow::Error, verbose: bool) {
    if let Some(sb) = err.downcast_ref::<SbkubeError>() {
        sb.display(verbose);
        return;
    }
    crate::log_error!("{}", err);
    if verbose {
        for cause in err.chain().skip(1) {
            eprintln!("    caused by: {}", cause);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_config_file_not_found_hint() {
        let err = SbkubeError::config_file_not_found(&PathBuf::from("/tmp/ws"));
        assert_eq!(err.kind, ErrorKind::Config);
        assert!(err.message.contains("/tmp/ws"));
        assert!(err.hint.as_deref().unwrap().contains("sbkube init"));
    }

    #[test]
    fn test_aggregated_validation_error() {
        let problems = vec![
            "apps.redis.chartt: unknown field".to_string(),
            "apps.Redis_Cache: name is not a DNS-1123 label".to_string(),
        ];
        let err = SbkubeError::config_validation(&problems);
        assert!(err.message.contains("2 configuration errors"));
        let details = err.details.unwrap();
        assert!(details.contains("apps.redis.chartt"));
        assert!(details.contains("DNS-1123"));
    }

    #[test]
    fn test_cycle_names_every_node() {
        let err =
            SbkubeError::dependency_cycle(&["a".into(), "b".into(), "c".into(), "a".into()]);
        assert!(err.message.contains("a -> b -> c -> a"));
    }

    #[test]
    fn test_error_object_shape() {
        let obj = SbkubeError::cli_tool_not_found("helm", "https://helm.sh/docs/intro/install/")
            .to_object();
        let json = serde_json::to_value(&obj).unwrap();
        assert_eq!(json["kind"], "tool");
        assert!(json["message"].as_str().unwrap().contains("helm"));
        assert!(json["hint"].as_str().unwrap().contains("helm.sh"));
    }

    #[test]
    fn test_classify_finds_typed_error() {
        let err: anyhow::Error =
            SbkubeError::new(ErrorKind::Git, "clone failed").with_hint("check the URL").into();
        let obj = classify(&err);
        assert_eq!(obj.kind, ErrorKind::Git);
        assert_eq!(obj.hint.as_deref(), Some("check the URL"));
    }
}
