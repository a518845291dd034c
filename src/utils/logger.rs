//! User-facing stderr output
//!
//! Every line the CLI prints about its own progress goes through here so
//! the rendering stays uniform: lowercase level prefixes, group banners for
//! the orchestrator, and the classified-failure form (kind tag, optional
//! detail block, remediation hint) that the error taxonomy renders with.

use crate::utils::errors::ErrorKind;
use colored::Colorize;
use std::fmt::Display;

pub fn log_info<T: Display>(msg: T) {
    eprintln!("{} {}", "info:".green().bold(), msg);
}

pub fn log_warn<T: Display>(msg: T) {
    eprintln!("{} {}", "warning:".yellow().bold(), msg);
}

pub fn log_error<T: Display>(msg: T) {
    eprintln!("{} {}", "error:".red().bold(), msg);
}

/// Banner opening one app group's stage run.
pub fn log_group<T: Display>(group: &str, detail: T) {
    eprintln!("{} {} {}", "==>".cyan().bold(), group.bold(), detail);
}

/// A classified failure: one-line symptom tagged with its taxonomy kind,
/// the detail block in verbose mode only, then the remediation hint.
pub fn log_failure(
    kind: ErrorKind,
    message: &str,
    details: Option<&str>,
    hint: Option<&str>,
    verbose: bool,
) {
    eprintln!(
        "{} {} {}",
        "error:".red().bold(),
        format!("[{}]", kind.as_str()).red(),
        message
    );
    if verbose {
        if let Some(details) = details {
            for line in details.lines() {
                eprintln!("    {}", line);
            }
        }
    }
    if let Some(hint) = hint {
        eprintln!("  {} {}", "hint:".cyan(), hint);
    }
}

/// Deprecation notice naming the replacement.
pub fn log_deprecated(old: &str, replacement: &str) {
    eprintln!(
        "{} {} is deprecated, use {} instead",
        "warning:".yellow().bold(),
        old,
        replacement
    );
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::utils::logger::log_info(format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::utils::logger::log_warn(format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::utils::logger::log_error(format!($($arg)*))
    };
}
