mod completion;
mod config;
mod dispatch;
mod render;

use std::path::PathBuf;
use std::process::ExitCode;

use addonkit_core::{LogType, VersionId};
use addonkit_store::DEFAULT_LOG_LIMIT;
use clap::{Parser, Subcommand};

use crate::completion::CliCompletionShell;

#[derive(Parser, Debug)]
#[command(name = "addonkit")]
#[command(about = "Install, version and activate host application addons", long_about = None)]
struct Cli {
    /// Base directory for staging, content, aliases and state.
    #[arg(long, global = true, env = "ADDONKIT_ROOT")]
    root: Option<PathBuf>,
    #[arg(long, global = true, env = "ADDONKIT_CONFIG")]
    config: Option<PathBuf>,
    /// Disable badges, spinners and section headers.
    #[arg(long, global = true)]
    plain: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Installed addons and their active version.
    List,
    /// Install the archive staged as <name> and wait for its dependencies.
    Install { name: String, version: String },
    /// Register the archive staged as <name> as another version.
    AddVersion { name: String, version: String },
    Versions { name: String },
    /// Activate one of the addon's versions by id.
    Switch { name: String, version_id: VersionId },
    Logs {
        name: String,
        #[arg(long = "type", value_parser = parse_log_type)]
        log_type: Option<LogType>,
        #[arg(long, default_value_t = DEFAULT_LOG_LIMIT)]
        limit: usize,
    },
    /// Re-run the addon's dependency install and wait for it.
    Deps { name: String },
    /// Compare recorded versions with aliases and content on disk.
    Doctor,
    Completions {
        #[arg(value_enum)]
        shell: CliCompletionShell,
    },
}

fn parse_log_type(value: &str) -> Result<LogType, String> {
    LogType::parse(value).map_err(|err| err.to_string())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match dispatch::run_cli(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests;
