use std::path::Path;
use std::process::Command;

use addonkit_core::{AddonError, AddonId, AddonManifest, LogStatus, LogType};
use addonkit_store::{now_unix, NewLogEntry, Store};
use anyhow::{anyhow, Context, Result};
use tracing::{debug, info};

use crate::locks::{hold, AddonLocks};

/// Longest stretch of captured process output kept in an audit message.
const MAX_CAPTURED_OUTPUT: usize = 2000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyInstallTask {
    pub addon_id: AddonId,
    pub addon_name: String,
    pub log_type: LogType,
}

impl DependencyInstallTask {
    pub fn new(addon_id: AddonId, addon_name: impl Into<String>) -> Self {
        Self {
            addon_id,
            addon_name: addon_name.into(),
            log_type: LogType::DependencyInstall,
        }
    }
}

/// Hand-off point for background dependency installs. Returning `Ok` only
/// means the task was accepted.
pub trait TaskQueue: Send + Sync {
    fn enqueue(&self, task: DependencyInstallTask) -> Result<()>;
}

/// Runs an addon's own dependency procedure against its active content and
/// returns whatever output is worth keeping.
pub trait DependencyInstaller: Send + Sync {
    fn install(&self, addon_name: &str, addon_root: &Path) -> Result<String>;
}

/// Runs the `[dependencies] command` declared in the addon's `addon.toml`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManifestDependencyInstaller;

impl DependencyInstaller for ManifestDependencyInstaller {
    fn install(&self, addon_name: &str, addon_root: &Path) -> Result<String> {
        let Some(manifest) = AddonManifest::read_from_dir(addon_root)? else {
            return Ok("no addon manifest; nothing to install".to_string());
        };
        let Some(spec) = manifest.dependency_command() else {
            return Ok("no dependency command declared; nothing to install".to_string());
        };
        let Some((program, args)) = spec.command.split_first() else {
            return Ok("no dependency command declared; nothing to install".to_string());
        };

        let working_dir = spec.resolve_working_dir(addon_root);
        debug!(
            addon = %addon_name,
            %program,
            working_dir = %working_dir.display(),
            "running dependency command"
        );
        let output = Command::new(program)
            .args(args)
            .current_dir(&working_dir)
            .envs(&spec.env)
            .output()
            .with_context(|| {
                format!(
                    "failed to run dependency command '{program}' in {}",
                    working_dir.display()
                )
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(anyhow!(
                "dependency command '{program}' exited with {}: {}",
                output.status,
                tail(stderr.trim(), MAX_CAPTURED_OUTPUT)
            ));
        }

        let stdout = stdout.trim();
        if stdout.is_empty() {
            Ok(format!("dependency command '{program}' completed"))
        } else {
            Ok(tail(stdout, MAX_CAPTURED_OUTPUT).to_string())
        }
    }
}

/// One attempt at a dependency install. Runs for the same addon are
/// serialized through `locks`, so a resubmitted task waits for the one in
/// flight instead of racing it.
pub fn run_dependency_task(
    store: &Store,
    locks: &AddonLocks,
    installer: &dyn DependencyInstaller,
    task: &DependencyInstallTask,
) -> Result<String, AddonError> {
    let lock = locks.lock_for(&task.addon_name);
    let _held = hold(&lock);

    let addon = store
        .open()?
        .addons()
        .get(task.addon_id)?
        .ok_or_else(|| AddonError::AddonNotFound(task.addon_name.clone()))?;
    if !addon.path.exists() {
        return Err(AddonError::TaskExecutionFailure(format!(
            "active content for addon '{}' not found at {}",
            addon.name,
            addon.path.display()
        )));
    }

    installer
        .install(&addon.name, &addon.path)
        .map_err(|err| AddonError::TaskExecutionFailure(format!("{err:#}")))
}

/// Appends the single audit entry a finished task produces.
pub fn record_task_outcome(
    store: &Store,
    task: &DependencyInstallTask,
    outcome: &Result<String, AddonError>,
) -> Result<i64> {
    let (status, message) = match outcome {
        Ok(output) => (LogStatus::Success, output.clone()),
        Err(err) => (LogStatus::Failure, err.to_string()),
    };
    let db = store.open()?;
    // The addon may have been removed while the task was queued.
    let addon_id = db.addons().get(task.addon_id)?.map(|addon| addon.id);
    let id = db.logs().append(
        NewLogEntry {
            addon_id,
            addon_name: &task.addon_name,
            log_type: task.log_type,
            status,
            message: &message,
        },
        now_unix()?,
    )?;
    info!(
        addon = %task.addon_name,
        status = status.as_str(),
        "recorded dependency install outcome"
    );
    Ok(id)
}

fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
