//! Dormant CLI - hibernate and resume CloudNativePG database clusters

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use dormant_core::ClusterRef;

mod commands;
mod display;
mod error;
mod exit_codes;
mod util;

use commands::hibernate::ConfigOverrides;
use display::OutputFormat;
use error::Result;

#[derive(Parser)]
#[command(name = "dormant")]
#[command(author = "Dormant Contributors")]
#[command(version)]
#[command(about = "Hibernate and resume CloudNativePG database clusters", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (default: ~/.config/dormant/config.yaml)
    #[arg(long, global = true, env = "DORMANT_CONFIG")]
    config: Option<PathBuf>,

    /// Log protocol steps to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable debug output
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Hibernate, resume or inspect a database cluster
    Hibernate {
        #[command(subcommand)]
        action: HibernateAction,
    },
}

#[derive(Subcommand)]
enum HibernateAction {
    /// Fence the cluster, keep its primary's volumes and delete everything else
    On {
        #[command(flatten)]
        target: TargetArgs,

        /// Bound for confirming that deleted objects are gone (e.g. 3m)
        #[arg(long, value_parser = util::parse_duration)]
        teardown_timeout: Option<Duration>,
    },

    /// Recreate a hibernated cluster from its volumes and wait until it is ready
    Off {
        #[command(flatten)]
        target: TargetArgs,

        /// Bound for the resumed cluster to become ready (e.g. 10m)
        #[arg(long, value_parser = util::parse_duration)]
        readiness_timeout: Option<Duration>,
    },

    /// Show the hibernation status of a cluster
    Status {
        #[command(flatten)]
        target: TargetArgs,
    },
}

#[derive(Args)]
struct TargetArgs {
    /// Cluster name
    cluster: String,

    /// Namespace of the cluster
    #[arg(short, long, default_value = "default", env = "DORMANT_NAMESPACE")]
    namespace: String,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    output: OutputFormat,
}

impl TargetArgs {
    fn cluster_ref(&self) -> ClusterRef {
        ClusterRef::new(&self.namespace, &self.cluster)
    }
}

fn init_tracing(verbose: bool, debug: bool) {
    let default_level = if debug {
        "debug"
    } else if verbose {
        "info"
    } else {
        "warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(filter)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let mut overrides = ConfigOverrides {
        config: cli.config,
        ..Default::default()
    };

    match cli.command {
        Commands::Hibernate { action } => match action {
            HibernateAction::On {
                target,
                teardown_timeout,
            } => {
                overrides.teardown_timeout = teardown_timeout;
                commands::hibernate::on(&target.cluster_ref(), &overrides, target.output).await
            }
            HibernateAction::Off {
                target,
                readiness_timeout,
            } => {
                overrides.readiness_timeout = readiness_timeout;
                commands::hibernate::off(&target.cluster_ref(), &overrides, target.output).await
            }
            HibernateAction::Status { target } => {
                commands::hibernate::status(&target.cluster_ref(), &overrides, target.output).await
            }
        },
    }
}

#[tokio::main]
async fn main() {
    // Setup miette for nice error display
    miette::set_panic_hook();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = if err.use_stderr() {
                exit_codes::USAGE_ERROR
            } else {
                exit_codes::SUCCESS
            };
            let _ = err.print();
            std::process::exit(code);
        }
    };

    if cli.debug {
        // SAFETY: no other thread reads the environment yet
        unsafe { std::env::set_var("RUST_BACKTRACE", "1") };
    }
    init_tracing(cli.verbose, cli.debug);

    if let Err(err) = run(cli).await {
        let code = err.exit_code();
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}
