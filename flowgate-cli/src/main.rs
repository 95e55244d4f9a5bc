mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand};
use cli::handlers;
use cli::workflow::WorkflowCommands;
use cli::workflow_handlers::{self, CliContext};
use flowgate_core::models::{Configuration, Decision};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "flowgate")]
#[command(version = "0.1.0")]
#[command(about = "Workflow orchestration with approval gates, escalation and SLA tracking")]
#[command(
    help_template = "{name} - {version}\n{about}\n\n{usage-heading}\n  {usage}\n\n{all-args}{options}\n"
)]
struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, default_value = "~/.config/flowgate/config.toml")]
    config: String,

    /// Run store file (overrides the configured store)
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the decision API server
    ///
    /// Exposes run inspection, approval decisions, event injection and a
    /// manual scheduler tick over HTTP. A background tick wakes due runs,
    /// applies timeouts and evaluates SLAs.
    ///
    /// Examples:
    ///   flowgate serve
    ///   flowgate serve --port 9090 --tick-interval 0
    Serve {
        /// Host address to bind to (defaults to configuration)
        #[arg(long)]
        host: Option<String>,

        /// Server port number (defaults to configuration)
        #[arg(short, long)]
        port: Option<u16>,

        /// Seconds between scheduler ticks (0 disables the background tick)
        #[arg(long, default_value = "5")]
        tick_interval: u64,
    },

    /// Configure flowgate settings interactively
    Config {
        /// Start interactive configuration setup
        #[arg(long)]
        init: bool,

        /// Path to configuration file
        #[arg(long, default_value = "~/.config/flowgate/config.toml")]
        config_file: String,
    },

    #[command(flatten)]
    Workflow(WorkflowCommands),
}

fn load_configuration(config_file: &str) -> Result<Configuration> {
    let path = handlers::resolve_config_path(config_file)?;
    let config = Configuration::load_from_file(&path)
        .map_err(|e| anyhow::anyhow!("Failed to load {}: {}", path.display(), e))?;
    if let Err(errors) = config.validate() {
        anyhow::bail!("Invalid configuration in {}: {}", path.display(), errors.join("; "));
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Config { init, config_file } = &cli.command {
        if *init {
            handlers::handle_config_init(config_file.clone()).await?;
        } else {
            println!("Config command requires --init flag");
            println!("Usage: flowgate config --init [--config-file PATH]");
        }
        return Ok(());
    }

    let config = load_configuration(&cli.config)?;
    if let Err(e) = flowgate_core::services::init_logging(config.log_level) {
        eprintln!("Warning: failed to initialize logging: {}", e);
    }
    let ctx = CliContext::new(config, cli.store);

    match cli.command {
        Commands::Config { .. } => {}
        Commands::Serve {
            host,
            port,
            tick_interval,
        } => {
            handlers::handle_serve(&ctx, host, port, tick_interval).await?;
        }
        Commands::Workflow(command) => match command {
            WorkflowCommands::Validate { file, json } => {
                workflow_handlers::handle_validate(file, json).await?;
            }
            WorkflowCommands::Render { file, format } => {
                workflow_handlers::handle_render(file, format).await?;
            }
            WorkflowCommands::Publish { path, name, json } => {
                workflow_handlers::handle_publish(&ctx, path, name, json).await?;
            }
            WorkflowCommands::Definitions { json } => {
                workflow_handlers::handle_definitions(&ctx, json).await?;
            }
            WorkflowCommands::Start {
                definition,
                input,
                initiator,
                deadline_seconds,
                json,
            } => {
                workflow_handlers::handle_start(
                    &ctx,
                    definition,
                    input,
                    initiator,
                    deadline_seconds,
                    json,
                )
                .await?;
            }
            WorkflowCommands::Status { run_id, json } => {
                workflow_handlers::handle_status(&ctx, run_id, json).await?;
            }
            WorkflowCommands::Runs { active, json } => {
                workflow_handlers::handle_runs(&ctx, active, json).await?;
            }
            WorkflowCommands::Approve {
                run_id,
                state_id,
                actor,
                comment,
                server,
                json,
            } => {
                workflow_handlers::handle_decision(
                    &ctx,
                    run_id,
                    state_id,
                    Decision::Approved,
                    actor,
                    comment,
                    server,
                    json,
                )
                .await?;
            }
            WorkflowCommands::Reject {
                run_id,
                state_id,
                actor,
                comment,
                server,
                json,
            } => {
                workflow_handlers::handle_decision(
                    &ctx,
                    run_id,
                    state_id,
                    Decision::Rejected,
                    actor,
                    comment,
                    server,
                    json,
                )
                .await?;
            }
            WorkflowCommands::Notify {
                run_id,
                event_type,
                payload,
                server,
                json,
            } => {
                workflow_handlers::handle_notify(&ctx, run_id, event_type, payload, server, json)
                    .await?;
            }
            WorkflowCommands::Approvals { run, json } => {
                workflow_handlers::handle_approvals(&ctx, run, json).await?;
            }
            WorkflowCommands::Audit { run_id, json } => {
                workflow_handlers::handle_audit(&ctx, run_id, json).await?;
            }
            WorkflowCommands::Tick { server, json } => {
                workflow_handlers::handle_tick(&ctx, server, json).await?;
            }
            WorkflowCommands::Cancel {
                run_id,
                actor,
                reason,
                json,
            } => {
                workflow_handlers::handle_cancel(&ctx, run_id, actor, reason, json).await?;
            }
        },
    }

    Ok(())
}
