pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "crewflow",
    about = "Crewflow operator CLI",
    long_about = "Apply migrations, inspect effective configuration, and run reminder sweeps outside the server.",
    after_help = "Examples:\n  crewflow migrate\n  crewflow config\n  crewflow sweep-reminders --limit 10"
)]
pub struct Cli {
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
    #[command(about = "Run one reminder sweep over projects whose check date has passed")]
    SweepReminders {
        #[arg(long, help = "Override the configured sweep batch size")]
        limit: Option<u32>,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::SweepReminders { limit } => commands::sweep::run(limit),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
