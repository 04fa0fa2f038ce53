//! The addon lifecycle: install, add-version and switch as transactions
//! over the version store and activation alias, plus the background
//! dependency install worker.

mod consistency;
mod locks;
mod manager;
mod tasks;
mod worker;

pub use consistency::{ConsistencyIssue, ConsistencyProblem, ConsistencyReport};
pub use locks::AddonLocks;
pub use manager::{AddonManager, InstalledAddon, SwitchedVersion};
pub use tasks::{
    record_task_outcome, run_dependency_task, DependencyInstallTask, DependencyInstaller,
    ManifestDependencyInstaller, TaskQueue,
};
pub use worker::{TaskWorker, WorkerOptions, WorkerQueue};

#[cfg(test)]
mod tests;
