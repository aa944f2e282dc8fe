//! Gauntlet CI CLI entrypoint.

use clap::Parser;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod handlers;

use commands::{CacheCommands, Commands, ConfigCommands};
use config::{CliConfig, LogFormat};

#[derive(Parser)]
#[command(name = "gauntlet")]
#[command(author, version, about = "Gauntlet CI command-line interface", long_about = None)]
struct Cli {
    /// Log output format; overrides the configured one
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = CliConfig::load().unwrap_or_default();
    init_tracing(cli.log_format.unwrap_or(config.log_format));

    match cli.command {
        Commands::Validate { path } => handlers::validate(&path)?,
        Commands::Trigger { file, event } => handlers::trigger(&file, &event)?,
        Commands::Matrix { file } => handlers::matrix(&file)?,
        Commands::Run {
            file,
            event,
            repo,
            max_parallel,
            timeout_minutes,
            no_cache,
            keep_workspaces,
            json,
        } => {
            let options = handlers::RunOptions {
                file,
                event,
                repo,
                max_parallel,
                timeout_minutes,
                no_cache,
                keep_workspaces,
                json,
            };
            handlers::run(&config, options).await?
        }
        Commands::Cache { command } => match command {
            CacheCommands::List { prefix } => handlers::list_cache(&config, &prefix).await?,
            CacheCommands::Clear { prefix } => handlers::clear_cache(&config, prefix).await?,
        },
        Commands::Config { command } => match command {
            ConfigCommands::Show => handlers::show_config(&config)?,
            ConfigCommands::Set { key, value } => handlers::set_config(&key, &value)?,
        },
    }

    Ok(())
}
