//! Output format contract for read-only commands and error objects

use anyhow::Result;
use clap::ValueEnum;
use serde::Serialize;

/// `--format` values. `llm` is a plain, label-dense text rendering intended
/// for piping into other tooling without ANSI noise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
#[value(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Human,
    Json,
    Yaml,
    Llm,
}

impl OutputFormat {
    pub fn is_machine(&self) -> bool {
        matches!(self, OutputFormat::Json | OutputFormat::Yaml)
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OutputFormat::Human => "human",
            OutputFormat::Json => "json",
            OutputFormat::Yaml => "yaml",
            OutputFormat::Llm => "llm",
        };
        f.write_str(name)
    }
}

/// Print a serializable payload in the requested machine format; the caller
/// supplies the human/llm rendering as a closure since those are layout-,
/// not data-driven.
pub fn emit<T, F>(format: OutputFormat, payload: &T, human: F) -> Result<()>
where
    T: Serialize,
    F: FnOnce() -> Result<()>,
{
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(payload)?);
            Ok(())
        }
        OutputFormat::Yaml => {
            print!("{}", serde_yaml::to_string(payload)?);
            Ok(())
        }
        OutputFormat::Human | OutputFormat::Llm => human(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Sample {
        name: &'static str,
        count: u32,
    }

    #[test]
    fn test_emit_json_does_not_call_human() {
        let mut called = false;
        emit(OutputFormat::Json, &Sample { name: "x", count: 1 }, || {
            called = true;
            Ok(())
        })
        .unwrap();
        assert!(!called);
    }

    #[test]
    fn test_emit_human_calls_closure() {
        let mut called = false;
        emit(OutputFormat::Human, &Sample { name: "x", count: 1 }, || {
            called = true;
            Ok(())
        })
        .unwrap();
        assert!(called);
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!(
            OutputFormat::from_str("json", true).unwrap(),
            OutputFormat::Json
        );
        assert_eq!(
            OutputFormat::from_str("llm", true).unwrap(),
            OutputFormat::Llm
        );
    }
}
