use std::process::ExitCode;
use std::sync::Arc;

use addonkit_core::{AddonError, LogType, OperationOutcome};
use addonkit_lifecycle::{AddonLocks, AddonManager, ManifestDependencyInstaller, TaskWorker};
use addonkit_store::Store;
use anyhow::Result;
use tracing::debug;

use crate::completion::write_completions_script;
use crate::config::{init_tracing, resolve_config};
use crate::render::{
    format_addon_lines, format_consistency_lines, format_log_lines, format_version_lines,
    TerminalRenderer,
};
use crate::{Cli, Commands};

pub(crate) async fn run_cli(cli: Cli) -> Result<ExitCode> {
    let renderer = TerminalRenderer::from_flag(cli.plain);

    if let Commands::Completions { shell } = cli.command {
        let mut stdout = std::io::stdout();
        write_completions_script(shell, &mut stdout)?;
        return Ok(ExitCode::SUCCESS);
    }

    let resolved = resolve_config(cli.root.as_deref(), cli.config.as_deref())?;
    init_tracing(&resolved.config);
    debug!(
        root = %resolved.root.display(),
        config = ?resolved.source,
        "resolved addonkit configuration"
    );

    let layout = resolved.layout();
    layout.ensure_base_dirs()?;
    let store = Store::new(resolved.database_path(&layout));
    let locks = AddonLocks::new();
    let worker = TaskWorker::spawn(
        store.clone(),
        locks.clone(),
        Arc::new(ManifestDependencyInstaller),
        resolved.config.worker_options(),
    );
    let manager = AddonManager::new(layout, Arc::new(worker.queue()))
        .with_store(store)
        .with_locks(locks);

    let completed = run_command(&manager, renderer, cli.command).await;
    let follow = completed
        .as_ref()
        .ok()
        .and_then(|completed| completed.follow_dependencies.clone());
    match follow {
        Some(name) => {
            let waiting = renderer.start_spinner("dependencies");
            worker.shutdown().await;
            waiting.finish();
            print_dependency_outcome(&manager, renderer, name).await?;
        }
        None => worker.shutdown().await,
    }

    Ok(completed?.code)
}

struct Completed {
    code: ExitCode,
    /// Addon whose queued dependency install should be awaited and shown.
    follow_dependencies: Option<String>,
}

impl From<ExitCode> for Completed {
    fn from(code: ExitCode) -> Self {
        Self {
            code,
            follow_dependencies: None,
        }
    }
}

async fn print_dependency_outcome(
    manager: &AddonManager,
    renderer: TerminalRenderer,
    name: String,
) -> Result<()> {
    let manager = manager.clone();
    let logs =
        blocking(move || manager.list_logs(&name, Some(LogType::DependencyInstall), 1)).await?;
    match logs {
        Ok(logs) => renderer.print_lines(&format_log_lines(renderer.style(), &logs)),
        Err(err) => {
            report_failure(renderer, &err);
        }
    }
    Ok(())
}

async fn run_command(
    manager: &AddonManager,
    renderer: TerminalRenderer,
    command: Commands,
) -> Result<Completed> {
    match command {
        Commands::List => {
            let manager = manager.clone();
            let entries = blocking(move || {
                let mut entries = Vec::new();
                for addon in manager.list_addons()? {
                    let current = match addon.current_version_id {
                        Some(version_id) => manager
                            .list_versions(addon.id)?
                            .into_iter()
                            .find(|version| version.id == version_id),
                        None => None,
                    };
                    entries.push((addon, current));
                }
                Ok(entries)
            })
            .await?;
            match entries {
                Ok(entries) => {
                    renderer.print_lines(&format_addon_lines(&entries));
                    Ok(ExitCode::SUCCESS.into())
                }
                Err(err) => Ok(report_failure(renderer, &err).into()),
            }
        }
        Commands::Install { name, version } => {
            let spinner = renderer.start_spinner("install");
            let manager = manager.clone();
            let result = blocking(move || manager.install(&name, &version)).await?;
            spinner.finish();
            let follow_dependencies = match &result {
                Ok(installed) if installed.dependency_task_submitted => {
                    Some(installed.addon.name.clone())
                }
                _ => None,
            };
            let code = report(renderer, &result, |installed| {
                let mut message = format!(
                    "installed {} {} (version_id={})",
                    installed.addon.name, installed.version.version, installed.version.id
                );
                if !installed.dependency_task_submitted {
                    message.push_str("; dependency install was not submitted");
                }
                message
            });
            Ok(Completed {
                code,
                follow_dependencies,
            })
        }
        Commands::AddVersion { name, version } => {
            let spinner = renderer.start_spinner("install");
            let manager = manager.clone();
            let result = blocking(move || {
                let addon = manager.find_addon(&name)?;
                manager.add_version(addon.id, &version)
            })
            .await?;
            spinner.finish();
            Ok(report(renderer, &result, |added| {
                format!("added version {} (version_id={})", added.version, added.id)
            })
            .into())
        }
        Commands::Versions { name } => {
            let manager = manager.clone();
            let result = blocking(move || {
                let addon = manager.find_addon(&name)?;
                let versions = manager.list_versions(addon.id)?;
                Ok((addon, versions))
            })
            .await?;
            match result {
                Ok((addon, versions)) => {
                    renderer.print_section(&format!("{} versions", addon.name));
                    renderer.print_lines(&format_version_lines(&addon, &versions));
                    Ok(ExitCode::SUCCESS.into())
                }
                Err(err) => Ok(report_failure(renderer, &err).into()),
            }
        }
        Commands::Switch { name, version_id } => {
            let manager = manager.clone();
            let result = blocking(move || {
                let addon = manager.find_addon(&name)?;
                manager.switch_version(addon.id, version_id)
            })
            .await?;
            Ok(report(renderer, &result, |switched| {
                format!(
                    "switched {} to {} (version_id={})",
                    switched.addon.name, switched.version.version, switched.version.id
                )
            })
            .into())
        }
        Commands::Logs {
            name,
            log_type,
            limit,
        } => {
            let manager = manager.clone();
            let result =
                blocking(move || manager.list_logs(&name, log_type, limit)).await?;
            match result {
                Ok(logs) => {
                    renderer.print_lines(&format_log_lines(renderer.style(), &logs));
                    Ok(ExitCode::SUCCESS.into())
                }
                Err(err) => Ok(report_failure(renderer, &err).into()),
            }
        }
        Commands::Deps { name } => {
            let manager = manager.clone();
            let result = blocking(move || {
                let addon = manager.find_addon(&name)?;
                manager.submit_dependency_install(addon.id)?;
                Ok(addon.name)
            })
            .await?;
            let follow_dependencies = result.as_ref().ok().cloned();
            let code = report(renderer, &result, |name| {
                format!("submitted dependency install for {name}")
            });
            Ok(Completed {
                code,
                follow_dependencies,
            })
        }
        Commands::Doctor => {
            let manager = manager.clone();
            let result = blocking(move || manager.check_consistency()).await?;
            match result {
                Ok(report) => {
                    renderer.print_section("consistency");
                    renderer.print_lines(&format_consistency_lines(renderer.style(), &report));
                    let code = if report.is_clean() {
                        ExitCode::SUCCESS
                    } else {
                        ExitCode::FAILURE
                    };
                    Ok(code.into())
                }
                Err(err) => Ok(report_failure(renderer, &err).into()),
            }
        }
        Commands::Completions { shell } => {
            let mut stdout = std::io::stdout();
            write_completions_script(shell, &mut stdout)?;
            Ok(ExitCode::SUCCESS.into())
        }
    }
}

/// Lifecycle calls touch SQLite and the filesystem; keep them off the
/// runtime's worker threads.
async fn blocking<T, F>(operation: F) -> Result<Result<T, AddonError>>
where
    F: FnOnce() -> Result<T, AddonError> + Send + 'static,
    T: Send + 'static,
{
    Ok(tokio::task::spawn_blocking(operation).await?)
}

fn report<T>(
    renderer: TerminalRenderer,
    result: &Result<T, AddonError>,
    success_message: impl FnOnce(&T) -> String,
) -> ExitCode {
    let outcome = match result {
        Ok(value) => OperationOutcome::success(success_message(value)),
        Err(err) => OperationOutcome::failure(err),
    };
    renderer.print_outcome(&outcome);
    if outcome.ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn report_failure(renderer: TerminalRenderer, err: &AddonError) -> ExitCode {
    renderer.print_outcome(&OperationOutcome::failure(err));
    ExitCode::FAILURE
}
