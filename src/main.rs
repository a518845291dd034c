//! sbkube CLI - declarative deployment orchestrator for Kubernetes clusters

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use sbkube::commands;
use sbkube::commands::pipeline::TargetArgs;
use sbkube::pipeline::{PipelineOptions, Stage};
use sbkube::utils::interrupt;
use sbkube::utils::logger::log_deprecated;
use sbkube::utils::output::OutputFormat;
use std::io;
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "sbkube")]
#[command(version, about = "Declarative deployment orchestrator for Kubernetes clusters", long_about = None)]
struct Cli {
    /// Verbose output (-v: debug, -vv: trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Path to kubeconfig file
    #[arg(long, global = true, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// kubectl context name (case-sensitive)
    #[arg(long, global = true)]
    context: Option<String>,

    /// Namespace override for this invocation
    #[arg(short = 'n', long, global = true)]
    namespace: Option<String>,

    /// Construct and log external commands without executing them
    #[arg(long, global = true)]
    dry_run: bool,

    /// Output format
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Human)]
    format: OutputFormat,

    /// Explicit configuration file (instead of a positional TARGET)
    #[arg(short = 'f', long = "file", global = true)]
    file: Option<PathBuf>,

    // Previous-generation options, accepted for backward compatibility.
    #[arg(long, global = true, hide = true)]
    base_dir: Option<PathBuf>,
    #[arg(long, global = true, hide = true)]
    app_dir: Option<PathBuf>,
    #[arg(long, global = true, hide = true)]
    config_file: Option<PathBuf>,
    #[arg(long, global = true, hide = true)]
    source: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Materialize external sources (charts, git repos, downloads)
    Prepare {
        /// Workspace or phase directory
        target: Option<PathBuf>,

        /// Re-download sources that are already present
        #[arg(long)]
        force: bool,

        /// Restrict to one app and its dependencies
        #[arg(long)]
        app: Option<String>,
    },

    /// Stage charts with overrides and removes applied
    Build {
        target: Option<PathBuf>,

        #[arg(long)]
        force: bool,

        #[arg(long)]
        app: Option<String>,
    },

    /// Render charts and kustomizations to YAML
    Template {
        target: Option<PathBuf>,

        #[arg(long)]
        app: Option<String>,

        /// Write rendered manifests under this directory
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },

    /// Deploy the resolved scope to the cluster
    Deploy {
        target: Option<PathBuf>,

        #[arg(long)]
        app: Option<String>,

        /// Start at this stage (assumes earlier artifacts are present)
        #[arg(long, value_enum)]
        from_step: Option<Stage>,

        /// Stop after this stage
        #[arg(long, value_enum)]
        to_step: Option<Stage>,

        /// Run exactly one stage
        #[arg(long, value_enum, conflicts_with_all = ["from_step", "to_step"])]
        only: Option<Stage>,

        /// Re-attempt only the apps that failed in the last run
        #[arg(long)]
        retry_failed: bool,

        /// Continue an interrupted run
        #[arg(long, conflicts_with = "retry_failed")]
        resume: bool,
    },

    /// Run prepare, build, template, and deploy as one command
    Apply {
        target: Option<PathBuf>,

        /// Phase name (alternative to a positional scope)
        #[arg(long, conflicts_with = "target")]
        phase: Option<String>,

        #[arg(long)]
        app: Option<String>,

        #[arg(long, value_enum)]
        from_step: Option<Stage>,

        #[arg(long, value_enum)]
        to_step: Option<Stage>,

        #[arg(long, value_enum, conflicts_with_all = ["from_step", "to_step"])]
        only: Option<Stage>,

        #[arg(long)]
        retry_failed: bool,

        #[arg(long, conflicts_with = "retry_failed")]
        resume: bool,

        #[arg(long)]
        force: bool,
    },

    /// Show current deployment state per app
    Status {
        /// Filter by cluster label
        #[arg(long)]
        cluster: Option<String>,
    },

    /// List past deployments
    History {
        #[arg(long)]
        cluster: Option<String>,

        /// Filter by app name
        #[arg(long)]
        app: Option<String>,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Restore a previous deployment from history
    Rollback {
        /// Deployment id (prefix accepted), or 'latest' with --app
        deployment_id: String,

        /// Roll back a single app's latest deployment
        #[arg(long)]
        app: Option<String>,

        /// Skip the confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// In-place helm upgrade for deployed helm apps
    Upgrade {
        target: Option<PathBuf>,

        #[arg(long)]
        app: Option<String>,
    },

    /// Uninstall the resources a workspace deployed
    Delete {
        target: Option<PathBuf>,

        /// Scope deletion to one app
        #[arg(long)]
        app: Option<String>,

        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// Check helm repos for newer chart versions
    CheckUpdates {
        target: Option<PathBuf>,
    },

    /// Scaffold a new workspace
    Init {
        target: Option<PathBuf>,

        /// Overwrite an existing sbkube.yaml
        #[arg(long)]
        force: bool,
    },

    /// Validate configuration and dependencies
    Validate {
        target: Option<PathBuf>,

        /// Skip PV/PVC validation
        #[arg(long)]
        skip_storage_check: bool,

        /// Treat storage findings as errors
        #[arg(long, conflicts_with = "skip_storage_check")]
        strict_storage_check: bool,
    },

    /// Environment diagnostics
    Doctor {
        target: Option<PathBuf>,
    },

    /// Show version information
    Version,

    /// Multi-phase workspace operations
    Workspace {
        #[command(subcommand)]
        command: WorkspaceCommands,
    },

    /// Generate shell completion scripts
    Completion {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum WorkspaceCommands {
    /// Print the phase tree and app dependency graph
    Graph {
        target: Option<PathBuf>,

        /// Emit Graphviz dot instead of the tree view
        #[arg(long)]
        dot: bool,
    },

    /// Validate the whole workspace tree
    Validate {
        target: Option<PathBuf>,
    },

    /// Last-deployment summary per app group
    Status {
        target: Option<PathBuf>,
    },

    /// Deprecated alias of `sbkube apply`
    #[command(hide = true)]
    Deploy {
        target: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(false)
                .with_level(true)
                .without_time()
                .with_writer(std::io::stderr),
        )
        .with(env_filter)
        .init();

    interrupt::install_handler();

    let verbose = cli.verbose > 0;
    let format = cli.format;
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            if format.is_machine() {
                let object = sbkube::utils::errors::classify(&err);
                match format {
                    OutputFormat::Yaml => {
                        if let Ok(rendered) = serde_yaml::to_string(&object) {
                            print!("{}", rendered);
                        }
                    }
                    _ => {
                        if let Ok(rendered) = serde_json::to_string_pretty(&object) {
                            println!("{}", rendered);
                        }
                    }
                }
            } else {
                sbkube::utils::errors::display_error(&err, verbose);
            }
            1
        }
    };
    if interrupt::is_interrupted() {
        std::process::exit(interrupt::INTERRUPT_EXIT_CODE);
    }
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    // deprecated option mapping, with a warning naming the replacement
    let mut file = cli.file.clone();
    if let Some(config_file) = &cli.config_file {
        log_deprecated("--config-file", "-f/--file");
        file.get_or_insert_with(|| config_file.clone());
    }
    if cli.source.is_some() {
        log_deprecated("--source", "settings in sbkube.yaml (sources.yaml is auto-discovered)");
    }
    let deprecated_target = cli
        .base_dir
        .clone()
        .inspect(|_| log_deprecated("--base-dir", "a positional TARGET"))
        .or_else(|| {
            cli.app_dir
                .clone()
                .inspect(|_| log_deprecated("--app-dir", "a positional TARGET"))
        });

    let targs = |target: &Option<PathBuf>, phase: Option<String>| TargetArgs {
        target: target.clone().or_else(|| deprecated_target.clone()),
        file: file.clone(),
        phase,
    };
    let base_options = || PipelineOptions {
        dry_run: cli.dry_run,
        namespace: cli.namespace.clone(),
        kubeconfig: cli.kubeconfig.clone(),
        context: cli.context.clone(),
        ..Default::default()
    };

    match cli.command {
        Commands::Prepare { ref target, force, ref app } => {
            let options = PipelineOptions {
                only: Some(Stage::Prepare),
                force,
                app: app.clone(),
                ..base_options()
            };
            commands::pipeline::run_pipeline(&targs(target, None), &options, cli.format)
        }
        Commands::Build { ref target, force, ref app } => {
            let options = PipelineOptions {
                only: Some(Stage::Build),
                force,
                app: app.clone(),
                ..base_options()
            };
            commands::pipeline::run_pipeline(&targs(target, None), &options, cli.format)
        }
        Commands::Template { ref target, ref app, ref output_dir } => {
            let options = PipelineOptions {
                only: Some(Stage::Template),
                app: app.clone(),
                output_dir: output_dir.clone(),
                ..base_options()
            };
            commands::pipeline::run_pipeline(&targs(target, None), &options, cli.format)
        }
        Commands::Deploy {
            ref target,
            ref app,
            from_step,
            to_step,
            only,
            retry_failed,
            resume,
        } => {
            let options = PipelineOptions {
                // bare `deploy` runs just its own stage; the window options
                // widen it for users who want deploy to drive earlier steps
                only: only.or(match (from_step, to_step) {
                    (None, None) => Some(Stage::Deploy),
                    _ => None,
                }),
                from_step,
                to_step,
                app: app.clone(),
                retry_failed,
                resume,
                ..base_options()
            };
            commands::pipeline::run_pipeline(&targs(target, None), &options, cli.format)
        }
        Commands::Apply {
            ref target,
            ref phase,
            ref app,
            from_step,
            to_step,
            only,
            retry_failed,
            resume,
            force,
        } => {
            let options = PipelineOptions {
                from_step,
                to_step,
                only,
                app: app.clone(),
                retry_failed,
                resume,
                force,
                ..base_options()
            };
            commands::pipeline::run_pipeline(&targs(target, phase.clone()), &options, cli.format)
        }
        Commands::Status { ref cluster } => {
            commands::status::run(cluster.as_deref(), cli.namespace.as_deref(), cli.format)
        }
        Commands::History { ref cluster, ref app, limit } => commands::history::run(
            cluster.as_deref(),
            cli.namespace.as_deref(),
            app.as_deref(),
            limit,
            cli.format,
        ),
        Commands::Rollback { ref deployment_id, ref app, yes } => commands::rollback::run(
            deployment_id,
            app.as_deref(),
            cli.kubeconfig.clone(),
            cli.context.clone(),
            yes,
            cli.dry_run,
            cli.format,
        ),
        Commands::Upgrade { ref target, ref app } => {
            let options = PipelineOptions {
                app: app.clone(),
                ..base_options()
            };
            commands::upgrade::run(&targs(target, None), options, cli.format)
        }
        Commands::Delete { ref target, ref app, yes } => commands::delete::run(
            &targs(target, None),
            app.as_deref(),
            cli.namespace.clone(),
            cli.kubeconfig.clone(),
            cli.context.clone(),
            yes,
            cli.dry_run,
            cli.format,
        ),
        Commands::CheckUpdates { ref target } => {
            commands::check_updates::run(&targs(target, None), cli.format)
        }
        Commands::Init { ref target, force } => commands::init::run(target.as_deref(), force),
        Commands::Validate {
            ref target,
            skip_storage_check,
            strict_storage_check,
        } => commands::validate::run(
            &targs(target, None),
            skip_storage_check,
            strict_storage_check,
            cli.format,
        ),
        Commands::Doctor { ref target } => commands::doctor::run(&targs(target, None)),
        Commands::Version => {
            println!("sbkube {}", env!("CARGO_PKG_VERSION"));
            Ok(0)
        }
        Commands::Workspace { ref command } => match command {
            WorkspaceCommands::Graph { target, dot } => {
                commands::workspace::graph(&targs(target, None), *dot)
            }
            WorkspaceCommands::Validate { target } => {
                commands::workspace::validate(&targs(target, None), cli.format)
            }
            WorkspaceCommands::Status { target } => {
                commands::workspace::status(&targs(target, None), cli.format)
            }
            WorkspaceCommands::Deploy { target } => {
                log_deprecated("workspace deploy", "sbkube apply");
                let options = base_options();
                commands::pipeline::run_pipeline(&targs(target, None), &options, cli.format)
            }
        },
        Commands::Completion { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "sbkube", &mut io::stdout());
            Ok(0)
        }
    }
}
