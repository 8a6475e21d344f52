//! ec2-runner-deploy - provision an EC2 runner and install the server on it

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{Level, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use ec2_runner_deploy::config::{DeployConfig, Overrides, load_config};
use ec2_runner_deploy::stack::Stack;

#[derive(Parser)]
#[command(name = "ec2-runner-deploy")]
#[command(author, version, about = "Provision an EC2 runner and install the server on it", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Config file (defaults to ./deploy.yaml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Stack name
    #[arg(long, env = "DEPLOY_STACK", global = true)]
    stack: Option<String>,

    /// AWS region
    #[arg(long, env = "AWS_REGION", global = true)]
    region: Option<String>,

    /// AWS CLI profile
    #[arg(long, env = "AWS_PROFILE", global = true)]
    profile: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or reuse the runner and install the server (default)
    Up {
        /// Print the private key instead of masking it
        #[arg(long)]
        show_secrets: bool,

        /// Print outputs as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show which steps would be created, reused or run
    Preview,
    /// Print the step order and dependencies
    Graph,
}

fn init_logging(verbosity: u8) -> anyhow::Result<()> {
    let level = match verbosity {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")
}

async fn up(config: &DeployConfig, show_secrets: bool, json: bool) -> anyhow::Result<()> {
    let report = ec2_runner_deploy::deploy(config).await?;

    if json {
        let rendered = serde_json::to_string_pretty(&report.outputs.to_json(show_secrets))?;
        println!("{rendered}");
    } else {
        print!("{}", report.outputs.render_table(show_secrets));
    }
    Ok(())
}

async fn preview(config: &DeployConfig) -> anyhow::Result<()> {
    for step in ec2_runner_deploy::preview(config).await? {
        println!("{:<8} {:<20} {}", step.action, step.name, step.kind);
    }
    Ok(())
}

fn graph(config: &DeployConfig) -> anyhow::Result<()> {
    let stack = Stack::declare(config);
    let graph = stack.graph()?;
    for name in graph.topological_order()? {
        let deps = graph
            .dependencies(&name)
            .map(|d| d.into_iter().collect::<Vec<_>>().join(", "))
            .unwrap_or_default();
        let ancestors = graph.ancestors(&name).map(|a| a.len()).unwrap_or_default();
        if deps.is_empty() {
            println!("{name}");
        } else {
            println!("{name} <- {deps} ({ancestors} upstream)");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    let overrides = Overrides {
        stack: cli.stack,
        region: cli.region,
        profile: cli.profile,
    };
    let config = load_config(cli.config.as_deref(), &overrides)
        .await
        .context("Failed to load deploy configuration")?;

    match cli.command {
        Some(Commands::Up { show_secrets, json }) => up(&config, show_secrets, json).await,
        Some(Commands::Preview) => {
            info!("Previewing stack {}", config.stack);
            preview(&config).await
        }
        Some(Commands::Graph) => graph(&config),
        None => up(&config, false, false).await,
    }
}
