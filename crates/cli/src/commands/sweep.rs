use chrono::Utc;
use crewflow_agent::runtime::{AgentRuntime, Collaborators};
use crewflow_core::config::{AppConfig, LoadOptions};
use crewflow_db::{connect_from_config, migrations};

use crate::commands::CommandResult;

pub fn run(limit: Option<u32>) -> CommandResult {
    let mut config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "sweep-reminders",
                "config_validation",
                format!("configuration issue: {error}"),
                2,
            );
        }
    };
    if let Some(limit) = limit {
        config.reminders.batch_size = limit.max(1);
    }
    init_logging(&config);

    let collaborators = match Collaborators::from_config(&config) {
        Ok(collaborators) => collaborators,
        Err(error) => {
            return CommandResult::failure(
                "sweep-reminders",
                "collaborator_init",
                format!("failed to build integrations: {error}"),
                2,
            );
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandResult::failure(
                "sweep-reminders",
                "runtime_init",
                format!("failed to initialize async runtime: {error}"),
                3,
            );
        }
    };

    let result = runtime.block_on(async {
        let pool = connect_from_config(&config.database)
            .await
            .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;
        migrations::run_pending(&pool)
            .await
            .map_err(|error| ("migration", error.to_string(), 5u8))?;

        let agent = AgentRuntime::new(pool.clone(), &config, collaborators);
        let report = agent
            .sweep()
            .run(Utc::now())
            .await
            .map_err(|error| ("reminder_sweep", error.to_string(), 6u8));
        pool.close().await;
        report
    });

    match result {
        Ok(report) => {
            let message = format!(
                "swept {} due project(s); {} action(s) created, {} executed, {} failed",
                report.due, report.actions_created, report.actions_executed, report.failed
            );
            match serde_json::to_value(&report) {
                Ok(details) => CommandResult::success_with_details("sweep-reminders", message, details),
                Err(_) => CommandResult::success("sweep-reminders", message),
            }
        }
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("sweep-reminders", error_class, message, exit_code)
        }
    }
}

/// Logs go to stderr so stdout stays a single JSON document.
fn init_logging(config: &AppConfig) {
    use crewflow_core::config::LogFormat::*;
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);
    let builder = tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(log_level)
        .with_writer(std::io::stderr);

    let _ = match config.logging.format {
        Compact => builder.compact().try_init(),
        Pretty => builder.pretty().try_init(),
        Json => builder.json().try_init(),
    };
}
