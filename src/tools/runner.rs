//! Subprocess driver shared by the helm/kubectl/git wrappers
//!
//! Commands are assembled as argv lists, never through a shell. Secrets go in
//! via environment variables or stdin. Proxy variables (HTTP_PROXY et al.)
//! reach the tools because the child inherits the parent environment.

use crate::utils::interrupt;
use retry::delay::{jitter, Exponential};
use retry::OperationResult;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use tracing::debug;

/// Grace period between a deadline/interrupt and the hard kill.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Poll interval while waiting on a child.
const WAIT_TICK: Duration = Duration::from_millis(100);

/// One external tool invocation: program + argv + env deltas.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    cwd: Option<PathBuf>,
    stdin: Option<String>,
    timeout: Option<Duration>,
}

impl ToolInvocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            cwd: None,
            stdin: None,
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Content piped to the child's stdin (used for `kubectl apply -f -`
    /// and `helm registry login --password-stdin`).
    pub fn stdin(mut self, content: impl Into<String>) -> Self {
        self.stdin = Some(content.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Loggable command line. Env deltas are shown by key only; values may
    /// hold credentials.
    pub fn command_line(&self) -> String {
        let mut line = String::new();
        for (key, _) in &self.envs {
            line.push_str(key);
            line.push_str("=... ");
        }
        line.push_str(&self.program);
        for arg in &self.args {
            line.push(' ');
            if arg.contains(' ') {
                line.push('\'');
                line.push_str(arg);
                line.push('\'');
            } else {
                line.push_str(arg);
            }
        }
        line
    }

    /// Run to completion, streaming output into the result.
    pub fn run(&self) -> Result<ToolOutput, ToolError> {
        debug!("exec: {}", self.command_line());
        let started = Instant::now();

        let mut command = Command::new(&self.program);
        command.args(&self.args);
        for (key, value) in &self.envs {
            command.env(key, value);
        }
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        command
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|source| ToolError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        if let Some(content) = &self.stdin {
            if let Some(mut pipe) = child.stdin.take() {
                use std::io::Write;
                // A child that exits early closes the pipe; that is its error
                // to report, not ours.
                let _ = pipe.write_all(content.as_bytes());
            }
        }

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let stdout_handle = std::thread::spawn(move || read_to_string(stdout_pipe));
        let stderr_handle = std::thread::spawn(move || read_to_string(stderr_pipe));

        let deadline = self.timeout.map(|t| started + t);
        let mut abort: Option<ToolError> = None;

        let code = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status.code().unwrap_or(-1),
                Ok(None) => {}
                Err(source) => {
                    let _ = child.kill();
                    return Err(ToolError::Spawn {
                        program: self.program.clone(),
                        source,
                    });
                }
            }

            if abort.is_none() {
                if interrupt::is_interrupted() {
                    // The terminal already sent SIGINT to the process group;
                    // give the child the grace window to exit on its own.
                    abort = Some(ToolError::Interrupted {
                        command: self.command_line(),
                    });
                } else if let Some(deadline) = deadline {
                    if Instant::now() >= deadline {
                        abort = Some(ToolError::Timeout {
                            command: self.command_line(),
                            elapsed: started.elapsed(),
                        });
                    }
                }
                if abort.is_some() {
                    let grace_end = Instant::now() + KILL_GRACE;
                    while Instant::now() < grace_end {
                        if let Ok(Some(_)) = child.try_wait() {
                            break;
                        }
                        std::thread::sleep(WAIT_TICK);
                    }
                    let _ = child.kill();
                    let _ = child.wait();
                    let _ = stdout_handle.join();
                    let _ = stderr_handle.join();
                    return Err(abort.take().expect("abort reason set above"));
                }
            }

            std::thread::sleep(WAIT_TICK);
        };

        let stdout = stdout_handle.join().unwrap_or_default();
        let stderr = stderr_handle.join().unwrap_or_default();
        let output = ToolOutput {
            stdout,
            stderr,
            code,
            duration: started.elapsed(),
        };

        if code != 0 {
            return Err(ToolError::Failed {
                program: self.program.clone(),
                command: self.command_line(),
                output,
            });
        }
        Ok(output)
    }

    /// Run with the given retry policy; only transient failures retry.
    pub fn run_retrying(&self, policy: &RetryPolicy) -> Result<ToolOutput, ToolError> {
        let delays = Exponential::from_millis_with_factor(policy.base.as_millis() as u64, 2.0)
            .map(|d| d.min(policy.cap))
            .map(jitter)
            .take(policy.attempts.saturating_sub(1));

        let result = retry::retry(delays, || match self.run() {
            Ok(output) => OperationResult::Ok(output),
            Err(err) if err.retry_class() == RetryClass::Transient => {
                crate::log_warn!("transient failure, retrying: {}", err);
                OperationResult::Retry(err)
            }
            Err(err) => OperationResult::Err(err),
        });
        result.map_err(|err| err.error)
    }
}

fn read_to_string(pipe: Option<impl Read>) -> String {
    let mut buf = String::new();
    if let Some(mut pipe) = pipe {
        let mut bytes = Vec::new();
        let _ = pipe.read_to_end(&mut bytes);
        buf = String::from_utf8_lossy(&bytes).into_owned();
    }
    buf
}

/// Captured result of a completed invocation.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
    pub code: i32,
    pub duration: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("command failed (exit {}): {command}", .output.code)]
    Failed {
        program: String,
        command: String,
        output: ToolOutput,
    },

    #[error("command timed out after {elapsed:?}: {command}")]
    Timeout { command: String, elapsed: Duration },

    #[error("command interrupted: {command}")]
    Interrupted { command: String },
}

impl ToolError {
    pub fn stderr(&self) -> &str {
        match self {
            ToolError::Failed { output, .. } => &output.stderr,
            _ => "",
        }
    }

    pub fn retry_class(&self) -> RetryClass {
        match self {
            ToolError::Failed { program, output, .. } => {
                classify_output(program, output.code, &output.stderr, &output.stdout)
            }
            // A spawn failure means the binary is broken or missing; a
            // timeout already consumed its full window; an interrupt is the
            // user's decision. None of these retry.
            ToolError::Spawn { .. } | ToolError::Timeout { .. } | ToolError::Interrupted { .. } => {
                RetryClass::Fatal
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    Transient,
    Fatal,
}

/// Failure conditions that never retry, regardless of other markers. The
/// terminal table is consulted first so "release not found ... connection"
/// style messages stay fatal.
const TERMINAL_MARKERS: &[&str] = &[
    "forbidden",
    "unauthorized",
    "not found",
    "no matches for kind",
    "error validating",
    "unknown flag",
    "unknown command",
    "invalid value",
    "already exists",
    "unmarshal",
    "parse error",
];

/// Network-class conditions worth a backoff-and-retry.
const TRANSIENT_MARKERS: &[&str] = &[
    "connection refused",
    "connection reset",
    "could not resolve host",
    "no such host",
    "temporary failure in name resolution",
    "tls handshake",
    "i/o timeout",
    "request canceled",
    "unexpected eof",
    "502 bad gateway",
    "503 service unavailable",
    "504 gateway timeout",
    "too many requests",
];

/// Classify a failed invocation. The exit code is the primary
/// discriminator; the marker tables only break ties for codes a tool
/// genuinely overloads.
///
/// Documented semantics per tool:
/// - git: 129 is usage, 1 is a local operation failure (checkout, merge);
///   neither is ever network-class. 128 covers transport AND object errors
///   alike, so only there do the markers decide.
/// - kubectl/helm: flag and usage errors exit 2; runtime failures collapse
///   to exit 1, which stays ambiguous.
/// - any tool: 126/127 (not executable / not found) and signal deaths
///   (negative in our capture) never recover by retrying.
pub fn classify_output(program: &str, code: i32, stderr: &str, stdout: &str) -> RetryClass {
    if code < 0 {
        // killed by a signal: not network-class
        return RetryClass::Fatal;
    }
    match (program, code) {
        (_, 126) | (_, 127) => return RetryClass::Fatal,
        ("git", 1) | ("git", 129) => return RetryClass::Fatal,
        ("git", 128) => {}
        ("kubectl", 2) | ("helm", 2) => return RetryClass::Fatal,
        ("kubectl", 1) | ("helm", 1) => {}
        // unknown tool or unlisted code: nothing decisive, ask the markers
        _ => {}
    }

    let haystack = format!("{}\n{}", stderr, stdout).to_lowercase();
    if TERMINAL_MARKERS.iter().any(|m| haystack.contains(m)) {
        return RetryClass::Fatal;
    }
    if TRANSIENT_MARKERS.iter().any(|m| haystack.contains(m)) {
        return RetryClass::Transient;
    }
    RetryClass::Fatal
}

/// Backoff schedule for transient failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base: Duration::from_millis(1500),
            cap: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Policy for operations that must not retry (mutating applies).
    pub fn none() -> Self {
        Self {
            attempts: 1,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_captures_stdout() {
        let out = ToolInvocation::new("echo").arg("hello").run().unwrap();
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.code, 0);
    }

    #[test]
    fn test_nonzero_exit_is_failed() {
        let err = ToolInvocation::new("false").run().unwrap_err();
        match err {
            ToolError::Failed { output, .. } => assert_ne!(output.code, 0),
            other => panic!("expected Failed, got {:?}", other),
        }
    }

    #[test]
    fn test_stdin_piping() {
        let out = ToolInvocation::new("cat").stdin("piped content").run().unwrap();
        assert_eq!(out.stdout, "piped content");
    }

    #[test]
    fn test_timeout_kills_child() {
        let err = ToolInvocation::new("sleep")
            .arg("30")
            .timeout(Duration::from_millis(200))
            .run()
            .unwrap_err();
        assert!(matches!(err, ToolError::Timeout { .. }));
    }

    #[test]
    fn test_missing_binary_is_spawn_error() {
        let err = ToolInvocation::new("sbkube-no-such-binary-xyz").run().unwrap_err();
        assert!(matches!(err, ToolError::Spawn { .. }));
    }

    #[test]
    fn test_classify_network_errors_transient() {
        assert_eq!(
            classify_output("helm", 1, "Error: could not resolve host charts.example.com", ""),
            RetryClass::Transient
        );
        assert_eq!(
            classify_output("kubectl", 1, "dial tcp 10.0.0.1:443: connection refused", ""),
            RetryClass::Transient
        );
        assert_eq!(
            classify_output("helm", 1, "", "upstream returned 503 Service Unavailable"),
            RetryClass::Transient
        );
    }

    #[test]
    fn test_classify_exit_code_is_primary() {
        // git exit 1 is a local operation failure; a network-looking marker
        // in the output cannot make it retryable
        assert_eq!(
            classify_output("git", 1, "connection refused while doing nothing", ""),
            RetryClass::Fatal
        );
        // git 128 overloads transport and object errors; markers break the tie
        assert_eq!(
            classify_output("git", 128, "fatal: Could not resolve host github.com", ""),
            RetryClass::Transient
        );
        assert_eq!(
            classify_output("git", 128, "fatal: bad object HEAD", ""),
            RetryClass::Fatal
        );
        // usage/flag errors are decided by code alone
        assert_eq!(
            classify_output("git", 129, "usage: git clone ...", ""),
            RetryClass::Fatal
        );
        assert_eq!(
            classify_output("kubectl", 2, "unknown shorthand flag", ""),
            RetryClass::Fatal
        );
        // missing binary / not executable and signal deaths never retry
        assert_eq!(classify_output("helm", 127, "", ""), RetryClass::Fatal);
        assert_eq!(
            classify_output("helm", -1, "i/o timeout", ""),
            RetryClass::Fatal
        );
    }

    #[test]
    fn test_classify_terminal_wins_over_transient() {
        // "not found" anywhere keeps the failure fatal even next to a
        // network-looking marker
        assert_eq!(
            classify_output("helm", 1, "chart \"nope\" not found after connection reset", ""),
            RetryClass::Fatal
        );
    }

    #[test]
    fn test_classify_rbac_and_validation_fatal() {
        assert_eq!(
            classify_output("kubectl", 1, "Error from server (Forbidden): pods is forbidden", ""),
            RetryClass::Fatal
        );
        assert_eq!(
            classify_output("kubectl", 1, "error validating \"deploy.yaml\"", ""),
            RetryClass::Fatal
        );
    }

    #[test]
    fn test_command_line_masks_env_values() {
        let line = ToolInvocation::new("helm")
            .env("HELM_PASSWORD", "s3cret")
            .arg("registry")
            .arg("login")
            .command_line();
        assert!(line.contains("HELM_PASSWORD=..."));
        assert!(!line.contains("s3cret"));
    }

    #[test]
    fn test_retry_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.attempts, 3);
        assert!(policy.base >= Duration::from_secs(1) && policy.base <= Duration::from_secs(2));
        assert!(policy.cap <= Duration::from_secs(30));
    }
}
