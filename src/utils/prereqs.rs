//! Prerequisite checking for the external tools sbkube drives

use crate::utils::errors::SbkubeError;
use anyhow::Result;
use regex::Regex;
use semver::Version;
use std::process::Command;

/// Trait for checking prerequisites
pub trait Prerequisite {
    /// Name of the prerequisite tool
    fn name(&self) -> &str;

    /// Check availability (and minimum version when one applies)
    fn check(&self) -> Result<(), SbkubeError>;

    /// Installation hint for the user
    fn install_hint(&self) -> &str;
}

/// A tool looked up on PATH, optionally gated on a minimum version.
pub struct ToolPrereq {
    pub name: String,
    pub hint: String,
    pub min_version: Option<Version>,
    /// argv run to print the version, e.g. `["version", "--short"]`
    pub version_args: Vec<String>,
}

impl ToolPrereq {
    pub fn new(name: impl Into<String>, hint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hint: hint.into(),
            min_version: None,
            version_args: vec!["--version".to_string()],
        }
    }

    pub fn min_version(mut self, version: &str, args: &[&str]) -> Self {
        self.min_version = Some(Version::parse(version).expect("static version literal"));
        self.version_args = args.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Query the installed version by running the tool and scraping the
    /// first semver-looking token from its output.
    pub fn installed_version(&self) -> Option<Version> {
        let output = Command::new(&self.name).args(&self.version_args).output().ok()?;
        let text = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        parse_version(&text)
    }
}

/// Extract the first `major.minor.patch` token from tool output.
pub fn parse_version(text: &str) -> Option<Version> {
    let re = Regex::new(r"v?(\d+)\.(\d+)\.(\d+)").expect("static regex");
    let caps = re.captures(text)?;
    Version::parse(&format!("{}.{}.{}", &caps[1], &caps[2], &caps[3])).ok()
}

impl Prerequisite for ToolPrereq {
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self) -> Result<(), SbkubeError> {
        if which::which(&self.name).is_err() {
            return Err(SbkubeError::cli_tool_not_found(&self.name, &self.hint));
        }
        if let Some(min) = &self.min_version {
            match self.installed_version() {
                Some(found) if &found < min => {
                    return Err(SbkubeError::new(
                        crate::utils::errors::ErrorKind::Tool,
                        format!("{} {} is older than the required {}", self.name, found, min),
                    )
                    .with_hint(format!("upgrade {}: {}", self.name, self.hint)));
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn install_hint(&self) -> &str {
        &self.hint
    }
}

/// The tools sbkube shells out to.
pub struct CommonPrereqs;

impl CommonPrereqs {
    /// helm >= 3.8 (first release with stable OCI support)
    pub fn helm() -> ToolPrereq {
        ToolPrereq::new("helm", "https://helm.sh/docs/intro/install/")
            .min_version("3.8.0", &["version", "--short"])
    }

    /// kubectl >= 1.24
    pub fn kubectl() -> ToolPrereq {
        ToolPrereq::new("kubectl", "https://kubernetes.io/docs/tasks/tools/")
            .min_version("1.24.0", &["version", "--client", "--output=yaml"])
    }

    /// git >= 2.30
    pub fn git() -> ToolPrereq {
        ToolPrereq::new("git", "https://git-scm.com/downloads").min_version("2.30.0", &["--version"])
    }

    /// Check a set of prerequisites, returning (found, missing-with-hints).
    pub fn check_all(prereqs: &[&dyn Prerequisite]) -> (Vec<String>, Vec<(String, String)>) {
        let mut found = Vec::new();
        let mut missing = Vec::new();
        for prereq in prereqs {
            match prereq.check() {
                Ok(()) => found.push(prereq.name().to_string()),
                Err(err) => missing.push((prereq.name().to_string(), err.message)),
            }
        }
        (found, missing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version_plain() {
        assert_eq!(parse_version("git version 2.43.0"), Version::parse("2.43.0").ok());
    }

    #[test]
    fn test_parse_version_prefixed() {
        assert_eq!(parse_version("v3.14.2+gc309b6f"), Version::parse("3.14.2").ok());
    }

    #[test]
    fn test_parse_version_kubectl_yaml() {
        let out = "clientVersion:\n  gitVersion: v1.29.1\n  major: \"1\"\n";
        assert_eq!(parse_version(out), Version::parse("1.29.1").ok());
    }

    #[test]
    fn test_parse_version_none() {
        assert!(parse_version("no numbers here").is_none());
    }

    #[test]
    fn test_missing_tool_yields_taxonomy_error() {
        let prereq = ToolPrereq::new("sbkube-nonexistent-tool-xyz", "https://example.invalid");
        let err = prereq.check().unwrap_err();
        assert_eq!(err.kind, crate::utils::errors::ErrorKind::Tool);
        assert!(err.hint.unwrap().contains("example.invalid"));
    }
}
