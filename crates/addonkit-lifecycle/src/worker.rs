use std::sync::Arc;
use std::time::Duration;

use addonkit_core::AddonError;
use addonkit_store::Store;
use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::locks::AddonLocks;
use crate::tasks::{
    record_task_outcome, run_dependency_task, DependencyInstallTask, DependencyInstaller,
    TaskQueue,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerOptions {
    pub concurrency: usize,
    pub max_attempts: u32,
    pub retry_backoff: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            concurrency: 2,
            max_attempts: 3,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

/// Sending half of the worker's queue. Cheap to clone; every clone feeds the
/// same worker.
#[derive(Debug, Clone)]
pub struct WorkerQueue {
    sender: mpsc::UnboundedSender<DependencyInstallTask>,
}

impl TaskQueue for WorkerQueue {
    fn enqueue(&self, task: DependencyInstallTask) -> Result<()> {
        let addon = task.addon_name.clone();
        self.sender
            .send(task)
            .map_err(|_| anyhow!("dependency task queue is closed; dropped task for '{addon}'"))?;
        debug!(%addon, "queued dependency install task");
        Ok(())
    }
}

struct WorkerContext {
    store: Store,
    locks: AddonLocks,
    installer: Arc<dyn DependencyInstaller>,
    options: WorkerOptions,
}

/// Background executor for dependency install tasks. Must be spawned from
/// inside a tokio runtime.
pub struct TaskWorker {
    queue: WorkerQueue,
    shutdown: oneshot::Sender<()>,
    dispatcher: JoinHandle<()>,
}

impl TaskWorker {
    pub fn spawn(
        store: Store,
        locks: AddonLocks,
        installer: Arc<dyn DependencyInstaller>,
        options: WorkerOptions,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = oneshot::channel();
        let context = Arc::new(WorkerContext {
            store,
            locks,
            installer,
            options,
        });
        let dispatcher = tokio::spawn(dispatch(receiver, shutdown_rx, context));
        Self {
            queue: WorkerQueue { sender },
            shutdown,
            dispatcher,
        }
    }

    pub fn queue(&self) -> WorkerQueue {
        self.queue.clone()
    }

    /// Stops accepting tasks, runs everything already queued and waits for
    /// in-flight tasks to record their outcome.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(err) = self.dispatcher.await {
            error!(error = %err, "dependency task dispatcher failed");
        }
    }
}

async fn dispatch(
    mut receiver: mpsc::UnboundedReceiver<DependencyInstallTask>,
    mut shutdown: oneshot::Receiver<()>,
    context: Arc<WorkerContext>,
) {
    let permits = Arc::new(Semaphore::new(context.options.concurrency.max(1)));
    let mut in_flight = JoinSet::new();

    loop {
        tokio::select! {
            next = receiver.recv() => match next {
                Some(task) => {
                    in_flight.spawn(run_task(Arc::clone(&context), Arc::clone(&permits), task));
                }
                None => break,
            },
            _ = &mut shutdown => {
                receiver.close();
                while let Some(task) = receiver.recv().await {
                    in_flight.spawn(run_task(Arc::clone(&context), Arc::clone(&permits), task));
                }
                break;
            }
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                report_join(joined);
            }
        }
    }

    while let Some(joined) = in_flight.join_next().await {
        report_join(joined);
    }
    debug!("dependency task dispatcher stopped");
}

fn report_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(err) = joined {
        error!(error = %err, "dependency task aborted");
    }
}

async fn run_task(
    context: Arc<WorkerContext>,
    permits: Arc<Semaphore>,
    task: DependencyInstallTask,
) {
    let Ok(_permit) = permits.acquire_owned().await else {
        return;
    };

    let max_attempts = context.options.max_attempts.max(1);
    let mut attempt = 1;
    let outcome = loop {
        let outcome = attempt_task(&context, &task).await;
        match outcome {
            Err(err) if attempt < max_attempts && is_retryable(&err) => {
                let backoff = context.options.retry_backoff * attempt;
                warn!(
                    addon = %task.addon_name,
                    attempt,
                    max_attempts,
                    error = %err,
                    "dependency install attempt failed; retrying"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            outcome => break outcome,
        }
    };

    match &outcome {
        Ok(_) => info!(addon = %task.addon_name, attempt, "dependency install succeeded"),
        Err(err) => warn!(
            addon = %task.addon_name,
            attempt,
            error = %err,
            "dependency install failed"
        ),
    }

    let store = context.store.clone();
    let recorded =
        tokio::task::spawn_blocking(move || record_task_outcome(&store, &task, &outcome)).await;
    match recorded {
        Ok(Ok(_)) => {}
        Ok(Err(err)) => error!(
            error = %format!("{err:#}"),
            "failed to record dependency install outcome"
        ),
        Err(err) => error!(error = %err, "dependency outcome recorder aborted"),
    }
}

async fn attempt_task(
    context: &Arc<WorkerContext>,
    task: &DependencyInstallTask,
) -> Result<String, AddonError> {
    let context = Arc::clone(context);
    let task = task.clone();
    tokio::task::spawn_blocking(move || {
        run_dependency_task(
            &context.store,
            &context.locks,
            context.installer.as_ref(),
            &task,
        )
    })
    .await
    .unwrap_or_else(|err| {
        Err(AddonError::TaskExecutionFailure(format!(
            "dependency task panicked: {err}"
        )))
    })
}

// An addon that no longer exists will not reappear on retry.
fn is_retryable(err: &AddonError) -> bool {
    !matches!(err, AddonError::AddonNotFound(_))
}
