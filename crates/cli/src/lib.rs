pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use keystone_core::config::{AppConfig, LoadOptions, LogFormat};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "keystone",
    about = "Keystone approval engine operator CLI",
    long_about = "Apply migrations, inspect configuration, import approval policies, and run \
                  escalation passes against the approval database.",
    after_help = "Examples:\n  keystone migrate\n  keystone policy import policies.toml\n  \
                  keystone escalate --at 2026-03-01T09:00:00Z"
)]
pub struct Cli {
    #[arg(long, global = true, help = "Path to a keystone.toml config file")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Run one escalation pass over overdue approval requests")]
    Escalate {
        #[arg(long, help = "Evaluate SLAs as of this RFC 3339 instant instead of now")]
        at: Option<DateTime<Utc>>,
    },
    #[command(subcommand, about = "Manage approval policies")]
    Policy(PolicyCommand),
}

#[derive(Debug, Subcommand)]
enum PolicyCommand {
    #[command(about = "Upsert policies and org members from a TOML file")]
    Import { file: PathBuf },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    let options = LoadOptions {
        require_file: cli.config.is_some(),
        config_path: cli.config,
        ..LoadOptions::default()
    };
    init_logging(&options);

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(&options),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run(&options) }
        }
        Command::Escalate { at } => commands::escalate::run(&options, at),
        Command::Policy(PolicyCommand::Import { file }) => {
            commands::policy::import(&options, &file)
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}

/// Logs go to stderr so stdout stays a single JSON outcome. A broken config falls back to
/// warn-level compact output; the command itself reports the config error.
fn init_logging(options: &LoadOptions) {
    let (level, format) = match AppConfig::load(options.clone()) {
        Ok(config) => (config.logging.level, config.logging.format),
        Err(_) => ("warn".to_string(), LogFormat::Compact),
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let _ = match format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}
