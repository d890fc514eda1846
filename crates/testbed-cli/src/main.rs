use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use testbed_cli::commands;
use testbed_cli::commands::detect::DetectOptions;
use testbed_cli::commands::run::RunOptions;
use testbed_core::{ProcessRunner, TestbedConfig};

#[derive(Parser)]
#[command(
    name = "testbed",
    about = "Ephemeral per-change virtual-cluster environments",
    version,
    propagate_version = true
)]
struct Cli {
    /// Configuration file. Missing file means defaults.
    #[arg(short, long, global = true, default_value = "testbed.toml", env = "TESTBED_CONFIG")]
    config: PathBuf,

    /// Raise log verbosity (-v debug, -vv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Clone)]
struct DetectArgs {
    /// Branch the change will merge into (default from config).
    #[arg(long)]
    target_ref: Option<String>,
    /// Revision under test.
    #[arg(long, default_value = "HEAD")]
    revision: String,
    /// Repository to inspect (default: current directory).
    #[arg(long)]
    repo: Option<PathBuf>,
}

impl From<DetectArgs> for DetectOptions {
    fn from(args: DetectArgs) -> Self {
        DetectOptions {
            target_ref: args.target_ref,
            revision: args.revision,
            repo: args.repo,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Print the units affected by the current change
    Detect {
        #[command(flatten)]
        detect: DetectArgs,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    /// Provision the environment for a change
    Provision {
        #[arg(long, env = "TESTBED_CHANGE_ID")]
        change_id: String,
        /// Append `TESTBED_KUBECONFIG=<path>` to this file (e.g. $GITHUB_ENV).
        #[arg(long)]
        env_file: Option<PathBuf>,
    },
    /// Apply affected units into a provisioned environment and wait for rollouts
    Deploy {
        #[arg(long, env = "TESTBED_CHANGE_ID")]
        change_id: String,
        /// Credential of the environment (default: the derived path).
        #[arg(long, env = "TESTBED_KUBECONFIG")]
        kubeconfig: Option<PathBuf>,
        /// Comma-separated units; skips detection.
        #[arg(long)]
        units: Option<String>,
        #[command(flatten)]
        detect: DetectArgs,
    },
    /// Detect, provision, deploy and verify in one go
    Run {
        #[arg(long, env = "TESTBED_CHANGE_ID")]
        change_id: String,
        /// Comma-separated units; skips detection.
        #[arg(long)]
        units: Option<String>,
        #[arg(long)]
        env_file: Option<PathBuf>,
        #[command(flatten)]
        detect: DetectArgs,
    },
    /// Delete the environment of a change
    Teardown {
        #[arg(long, env = "TESTBED_CHANGE_ID")]
        change_id: String,
    },
}

/// `RUST_LOG` (default `warn,testbed=info`) with `-v`/`-vv` raising the
/// testbed crates on top of it.
fn log_filter(verbose: u8, rust_log: Option<&str>) -> anyhow::Result<EnvFilter> {
    let filter = match rust_log {
        Some(directives) if !directives.trim().is_empty() => EnvFilter::try_new(directives)
            .with_context(|| format!("invalid RUST_LOG `{directives}`"))?,
        _ => EnvFilter::new("warn,testbed=info"),
    };
    Ok(match verbose {
        0 => filter,
        1 => filter.add_directive("testbed=debug".parse()?),
        _ => filter.add_directive("testbed=trace".parse()?),
    })
}

fn init_tracing(verbose: u8, json: bool) -> anyhow::Result<()> {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let builder = tracing_subscriber::fmt()
        .with_env_filter(log_filter(verbose, rust_log.as_deref())?)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_tracing(cli.verbose, cli.log_json) {
        eprintln!("error: {e:#}");
        return ExitCode::FAILURE;
    }

    match dispatch(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let config = TestbedConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let runner = ProcessRunner;

    match cli.command {
        Commands::Detect { detect, format } => {
            let detection = commands::detect::detect(&runner, &config, &detect.into()).await?;
            print!("{}", commands::detect::render(&detection, &format)?);
        }
        Commands::Provision { change_id, env_file } => {
            let change = commands::change_id(&change_id, &config)?;
            let report =
                commands::provision::provision(&runner, &config, &change, env_file.as_deref()).await?;
            println!("{}", commands::provision::handoff_line(&report));
        }
        Commands::Deploy {
            change_id,
            kubeconfig,
            units,
            detect,
        } => {
            let change = commands::change_id(&change_id, &config)?;
            let units = match units {
                Some(raw) => commands::parse_units(&raw),
                None => commands::detect::detect(&runner, &config, &detect.into()).await?.units,
            };
            let credential = commands::deploy::credential_for(&change, kubeconfig.as_deref());
            let report = commands::deploy::deploy(&runner, &config, &credential, &units).await?;
            for unit in &report.verified {
                println!("{unit}");
            }
        }
        Commands::Run {
            change_id,
            units,
            env_file,
            detect,
        } => {
            let change = commands::change_id(&change_id, &config)?;
            let opts = RunOptions {
                units: units.as_deref().map(commands::parse_units),
                detect: detect.into(),
            };
            let summary = commands::run::run(&runner, &config, &change, &opts).await?;
            if let Some(path) = &env_file {
                commands::provision::append_env(path, &summary.provision)?;
            }
            println!("{}", commands::provision::handoff_line(&summary.provision));
        }
        Commands::Teardown { change_id } => {
            let change = commands::change_id(&change_id, &config)?;
            commands::teardown::teardown(&runner, &config, &change).await?;
        }
    }
    Ok(())
}
