//! git command contracts

use crate::tools::runner::{RetryPolicy, ToolError, ToolInvocation};
use anyhow::Result;
use std::path::Path;

/// git wrapper. Repositories live under the workspace `repos/` cache; all
/// operations are argv-assembled, credentials come from the user's normal
/// git credential machinery (never from sbkube's command lines).
#[derive(Debug, Clone, Default)]
pub struct Git {
    retry: RetryPolicy,
}

impl Git {
    pub fn new() -> Self {
        Self::default()
    }

    /// `git clone <url> <dest>`, optionally at a branch/tag.
    pub fn clone(&self, url: &str, reference: Option<&str>, dest: &Path) -> Result<(), ToolError> {
        let mut invocation = ToolInvocation::new("git")
            .arg("clone")
            .arg(url)
            .arg(dest.display().to_string());
        if let Some(reference) = reference {
            invocation = invocation.args(["--branch", reference]);
        }
        invocation.run_retrying(&self.retry)?;
        Ok(())
    }

    /// `git fetch` + `git checkout <ref>` for a repository that exists but
    /// sits at the wrong ref.
    pub fn fetch_checkout(&self, repo_dir: &Path, reference: &str) -> Result<(), ToolError> {
        ToolInvocation::new("git")
            .current_dir(repo_dir)
            .args(["fetch", "--tags", "origin"])
            .run_retrying(&self.retry)?;
        ToolInvocation::new("git")
            .current_dir(repo_dir)
            .args(["checkout", reference])
            .run_retrying(&RetryPolicy::none())?;
        // A branch checkout may still trail origin; fast-forward it.
        let _ = ToolInvocation::new("git")
            .current_dir(repo_dir)
            .args(["merge", "--ff-only"])
            .arg(format!("origin/{}", reference))
            .run();
        Ok(())
    }

    /// Symbolic ref (branch), tag, or commit the working tree sits at.
    pub fn current_ref(&self, repo_dir: &Path) -> Result<String, ToolError> {
        // branch name when on a branch
        let head = ToolInvocation::new("git")
            .current_dir(repo_dir)
            .args(["rev-parse", "--abbrev-ref", "HEAD"])
            .run_retrying(&RetryPolicy::none())?;
        let name = head.stdout.trim().to_string();
        if name != "HEAD" {
            return Ok(name);
        }
        // detached: prefer an exact tag, fall back to the commit
        if let Ok(tag) = ToolInvocation::new("git")
            .current_dir(repo_dir)
            .args(["describe", "--tags", "--exact-match"])
            .run()
        {
            return Ok(tag.stdout.trim().to_string());
        }
        let commit = ToolInvocation::new("git")
            .current_dir(repo_dir)
            .args(["rev-parse", "HEAD"])
            .run_retrying(&RetryPolicy::none())?;
        Ok(commit.stdout.trim().to_string())
    }

    /// True when the working tree is already at the requested ref (by branch
    /// name, tag name, or commit prefix).
    pub fn is_at_ref(&self, repo_dir: &Path, reference: &str) -> bool {
        match self.current_ref(repo_dir) {
            Ok(current) => {
                current == reference
                    || current.starts_with(reference)
                    || reference.starts_with(&current)
            }
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn git_available() -> bool {
        which::which("git").is_ok()
    }

    fn init_repo(dir: &Path) {
        let run = |args: &[&str]| {
            ToolInvocation::new("git")
                .current_dir(dir)
                .args(args.iter().copied())
                .run()
                .unwrap()
        };
        run(&["init", "--initial-branch", "main"]);
        run(&["config", "user.email", "test@example.com"]);
        run(&["config", "user.name", "Test"]);
        std::fs::write(dir.join("file.txt"), "content").unwrap();
        run(&["add", "."]);
        run(&["commit", "-m", "initial"]);
    }

    #[test]
    fn test_current_ref_on_branch() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let git = Git::new();
        assert_eq!(git.current_ref(dir.path()).unwrap(), "main");
        assert!(git.is_at_ref(dir.path(), "main"));
        assert!(!git.is_at_ref(dir.path(), "v1.0.0"));
    }

    #[test]
    fn test_current_ref_on_tag() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        ToolInvocation::new("git")
            .current_dir(dir.path())
            .args(["tag", "v1.2.3"])
            .run()
            .unwrap();
        ToolInvocation::new("git")
            .current_dir(dir.path())
            .args(["checkout", "--detach", "v1.2.3"])
            .run()
            .unwrap();
        let git = Git::new();
        assert_eq!(git.current_ref(dir.path()).unwrap(), "v1.2.3");
    }
}
