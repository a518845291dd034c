//! Spinners for the pipeline's long-running steps
//!
//! The API is stage-shaped: a spinner belongs to one (stage, app) pair and
//! shows elapsed wall time, since chart pulls and clones are the operations
//! users actually wait on. Spinners are suppressed when stderr is not a
//! terminal (CI logs, pipes), so callers use the helpers unconditionally.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::IsTerminal;
use std::time::Duration;

/// Spinner for one pipeline step, e.g. `prepare redis ... 3s`.
pub fn stage_spinner(stage: &str, subject: &str) -> ProgressBar {
    let pb = if std::io::stderr().is_terminal() {
        ProgressBar::new_spinner()
    } else {
        ProgressBar::with_draw_target(None, ProgressDrawTarget::hidden())
    };
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {prefix:.bold} {msg} {elapsed:.dim}")
            .expect("static spinner template")
            .tick_strings(&["◐", "◓", "◑", "◒"]),
    );
    pb.set_prefix(stage.to_string());
    pb.set_message(subject.to_string());
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

/// Run one step under a stage spinner. The spinner clears itself either
/// way; outcome lines come from the orchestrator's own logging so parallel
/// app output stays readable.
pub fn with_stage_spinner<F, T, E>(stage: &str, subject: &str, f: F) -> Result<T, E>
where
    F: FnOnce() -> Result<T, E>,
{
    let pb = stage_spinner(stage, subject);
    let result = f();
    pb.finish_and_clear();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_spinner_labels() {
        let pb = stage_spinner("prepare", "redis");
        assert_eq!(pb.prefix(), "prepare");
        assert_eq!(pb.message(), "redis");
        pb.finish_and_clear();
    }

    #[test]
    fn test_with_stage_spinner_passes_results_through() {
        let ok: Result<u32, String> = with_stage_spinner("build", "nginx", || Ok(42));
        assert_eq!(ok.unwrap(), 42);
        let err: Result<u32, String> =
            with_stage_spinner("deploy", "nginx", || Err("boom".to_string()));
        assert_eq!(err.unwrap_err(), "boom");
    }
}
