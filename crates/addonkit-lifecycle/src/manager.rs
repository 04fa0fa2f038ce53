use std::path::{Path, PathBuf};
use std::sync::Arc;

use addonkit_core::{
    Addon, AddonError, AddonId, AddonLog, AddonManifest, AddonVersion, LifecycleState, LogStatus,
    LogType, NewAddon, VersionId, DEFAULT_AUTHOR,
};
use addonkit_installer::{
    validate_component, ActivationSwitch, AddonFs, AddonsLayout, ArchiveInstaller, ArchiveStore,
    ExtractedVersion, LocalFs, OperationJournal,
};
use addonkit_store::{
    is_constraint_violation, now_unix, AddonRepository, NewLogEntry, NewVersion, Store,
    VersionRepository,
};
use anyhow::Context;
use rusqlite::Transaction;
use tracing::{debug, error, info, warn};

use crate::locks::{hold, AddonLocks};
use crate::tasks::{DependencyInstallTask, TaskQueue};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledAddon {
    pub addon: Addon,
    pub version: AddonVersion,
    pub dependency_task_submitted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchedVersion {
    pub addon: Addon,
    pub version: AddonVersion,
    pub previous_version_id: Option<VersionId>,
}

/// Orchestrates install, add-version and switch as all-or-nothing operations
/// over the version store and the activation alias.
#[derive(Clone)]
pub struct AddonManager {
    layout: AddonsLayout,
    store: Store,
    fs: Arc<dyn AddonFs>,
    installer: ArchiveInstaller,
    switch: ActivationSwitch,
    queue: Arc<dyn TaskQueue>,
    locks: AddonLocks,
}

impl AddonManager {
    /// Uses the local filesystem for content and aliases, and the layout's
    /// database path.
    pub fn new(layout: AddonsLayout, queue: Arc<dyn TaskQueue>) -> Self {
        let local = Arc::new(LocalFs::new(layout.tmp_state_dir()));
        let store = Store::new(layout.database_path());
        Self::with_parts(layout, store, local.clone(), local, queue, AddonLocks::new())
    }

    pub fn with_parts(
        layout: AddonsLayout,
        store: Store,
        fs: Arc<dyn AddonFs>,
        archives: Arc<dyn ArchiveStore>,
        queue: Arc<dyn TaskQueue>,
        locks: AddonLocks,
    ) -> Self {
        let installer = ArchiveInstaller::new(layout.clone(), archives);
        let switch = ActivationSwitch::new(Arc::clone(&fs));
        Self {
            layout,
            store,
            fs,
            installer,
            switch,
            queue,
            locks,
        }
    }

    pub fn with_store(mut self, store: Store) -> Self {
        self.store = store;
        self
    }

    pub fn with_locks(mut self, locks: AddonLocks) -> Self {
        self.locks = locks;
        self
    }

    pub fn layout(&self) -> &AddonsLayout {
        &self.layout
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn locks(&self) -> &AddonLocks {
        &self.locks
    }

    pub fn install(&self, name: &str, version: &str) -> Result<InstalledAddon, AddonError> {
        let lock = self.locks.lock_for(name);
        let _held = hold(&lock);
        let mut trail = OperationTrail::begin(&self.layout, "install", name);

        let result = self.install_locked(name, version, &mut trail);
        let mut installed = match result {
            Ok(installed) => installed,
            Err(err) => {
                trail.enter(LifecycleState::RolledBack, Some(&err.to_string()));
                warn!(addon = %name, %version, error = %err, "addon install rolled back");
                let addon_id = self.existing_addon_id(name);
                self.record(addon_id, name, LogType::Install, Err(&err));
                return Err(err);
            }
        };
        trail.enter(LifecycleState::Committed, None);

        let mut message = format!("installed {name} version {version}");
        match self.queue.enqueue(DependencyInstallTask::new(installed.addon.id, name)) {
            Ok(()) => installed.dependency_task_submitted = true,
            Err(err) => {
                warn!(
                    addon = %name,
                    error = %format!("{err:#}"),
                    "failed to submit dependency install"
                );
                message.push_str("; dependency install was not submitted");
            }
        }
        info!(addon = %name, %version, addon_id = installed.addon.id, "addon installed");
        self.record(Some(installed.addon.id), name, LogType::Install, Ok(message.as_str()));
        Ok(installed)
    }

    fn install_locked(
        &self,
        name: &str,
        version: &str,
        trail: &mut OperationTrail,
    ) -> Result<InstalledAddon, AddonError> {
        trail.enter(LifecycleState::Validating, None);
        let staged = self.installer.find_staged(name)?;
        validate_component("version label", version)?;

        let mut db = self.store.open()?;
        if db.addons().exists(name)? {
            return Err(AddonError::AlreadyInstalled(name.to_string()));
        }

        // Extraction happens outside the write transaction so installs of
        // other addons are not held up behind the database lock.
        trail.enter(
            LifecycleState::Extracting,
            Some(&staged.path.display().to_string()),
        );
        let extracted = self.installer.extract(name, version, &staged)?;
        let alias = self.layout.alias_path(name);

        let tx = match db.begin() {
            Ok(tx) => tx,
            Err(err) => {
                self.remove_content(&extracted.path);
                return Err(err.into());
            }
        };
        let installed = match self.persist_new_addon(&tx, &extracted, &alias, trail) {
            Ok(installed) => installed,
            // Another process committed this name first; its alias and
            // content are not ours to remove.
            Err(err @ AddonError::AlreadyInstalled(_)) => return Err(err),
            Err(err) => {
                drop(tx);
                self.compensate_install(&alias, Some(&extracted.path));
                return Err(err);
            }
        };

        if let Err(err) = tx.commit() {
            self.compensate_install(&alias, Some(&extracted.path));
            return Err(AddonError::TransactionFailure(format!(
                "failed to commit install of '{name}': {err}"
            )));
        }
        Ok(installed)
    }

    fn persist_new_addon(
        &self,
        tx: &Transaction<'_>,
        extracted: &ExtractedVersion,
        alias: &Path,
        trail: &mut OperationTrail,
    ) -> Result<InstalledAddon, AddonError> {
        trail.enter(LifecycleState::Persisting, None);
        // Another process may have committed between the check before
        // extraction and acquiring the write lock.
        if AddonRepository::new(tx).exists(&extracted.name)? {
            return Err(AddonError::AlreadyInstalled(extracted.name.clone()));
        }
        let manifest = AddonManifest::read_from_dir(&extracted.path)
            .map_err(|err| AddonError::ExtractionFailed(format!("{err:#}")))?
            .unwrap_or_default();
        let new_addon = NewAddon {
            name: extracted.name.clone(),
            thumb: manifest.thumb.unwrap_or_default(),
            author: manifest
                .author
                .unwrap_or_else(|| DEFAULT_AUTHOR.to_string()),
            path: alias.to_path_buf(),
            real_path: extracted.path.clone(),
        };

        let now = now_unix()?;
        let addons = AddonRepository::new(tx);
        let addon_id = addons.insert(&new_addon, now).map_err(|err| {
            if is_constraint_violation(&err) {
                AddonError::AlreadyInstalled(extracted.name.clone())
            } else {
                err.into()
            }
        })?;
        let version_id = VersionRepository::new(tx).insert(
            NewVersion {
                addon_id,
                version: &extracted.version,
                path: &extracted.path,
                archive_sha256: Some(&extracted.archive_sha256),
            },
            now,
        )?;
        addons.set_version_pointers(addon_id, Some(version_id), None, &extracted.path, now)?;

        trail.enter(
            LifecycleState::Activating,
            Some(&extracted.path.display().to_string()),
        );
        self.switch.activate(alias, &extracted.path)?;

        Ok(InstalledAddon {
            addon: Addon {
                id: addon_id,
                name: new_addon.name,
                thumb: new_addon.thumb,
                author: new_addon.author,
                path: new_addon.path,
                real_path: new_addon.real_path,
                current_version_id: Some(version_id),
                prev_version_id: None,
                created_at_unix: now,
                updated_at_unix: now,
            },
            version: AddonVersion {
                id: version_id,
                addon_id,
                version: extracted.version.clone(),
                path: extracted.path.clone(),
                archive_sha256: Some(extracted.archive_sha256.clone()),
                created_at_unix: now,
            },
            dependency_task_submitted: false,
        })
    }

    /// No addon row survived, so no alias may either. The extracted
    /// directory is removed too when one was created by this operation.
    fn compensate_install(&self, alias: &Path, content: Option<&Path>) {
        if let Err(err) = self.switch.deactivate(alias) {
            error!(
                alias = %alias.display(),
                error = %err,
                "failed to remove alias after rollback"
            );
        }
        if let Some(content) = content {
            self.remove_content(content);
        }
    }

    fn remove_content(&self, content: &Path) {
        match self.fs.remove_tree(content) {
            Ok(()) => debug!(path = %content.display(), "removed extracted content after rollback"),
            Err(err) => warn!(
                path = %content.display(),
                error = %format!("{err:#}"),
                "failed to remove extracted content after rollback"
            ),
        }
    }

    /// Extracts a newly staged package for an existing addon and registers
    /// it as a switchable version. The active version is left alone.
    pub fn add_version(
        &self,
        addon_id: AddonId,
        version: &str,
    ) -> Result<AddonVersion, AddonError> {
        let name = self.get_addon(addon_id)?.name;
        let lock = self.locks.lock_for(&name);
        let _held = hold(&lock);
        let mut trail = OperationTrail::begin(&self.layout, "add_version", &name);

        match self.add_version_locked(addon_id, &name, version, &mut trail) {
            Ok(added) => {
                trail.enter(LifecycleState::Committed, None);
                info!(addon = %name, %version, version_id = added.id, "addon version added");
                let message = format!("added {name} version {version}");
                self.record(Some(addon_id), &name, LogType::Install, Ok(message.as_str()));
                Ok(added)
            }
            Err(err) => {
                trail.enter(LifecycleState::RolledBack, Some(&err.to_string()));
                warn!(addon = %name, %version, error = %err, "adding addon version rolled back");
                self.record(Some(addon_id), &name, LogType::Install, Err(&err));
                Err(err)
            }
        }
    }

    fn add_version_locked(
        &self,
        addon_id: AddonId,
        name: &str,
        version: &str,
        trail: &mut OperationTrail,
    ) -> Result<AddonVersion, AddonError> {
        trail.enter(LifecycleState::Validating, None);
        let staged = self.installer.find_staged(name)?;
        validate_component("version label", version)?;

        let mut db = self.store.open()?;
        if db.versions().find_by_label(addon_id, version)?.is_some() {
            return Err(AddonError::AlreadyInstalled(format!("{name}@{version}")));
        }

        trail.enter(
            LifecycleState::Extracting,
            Some(&staged.path.display().to_string()),
        );
        let extracted = self.installer.extract(name, version, &staged)?;

        trail.enter(LifecycleState::Persisting, None);
        let now = now_unix()?;
        let persisted = db.begin().and_then(|tx| {
            if VersionRepository::new(&tx)
                .find_by_label(addon_id, version)?
                .is_some()
            {
                return Ok(None);
            }
            let version_id = VersionRepository::new(&tx).insert(
                NewVersion {
                    addon_id,
                    version,
                    path: &extracted.path,
                    archive_sha256: Some(&extracted.archive_sha256),
                },
                now,
            )?;
            tx.commit()
                .with_context(|| format!("failed to commit new version of '{name}'"))?;
            Ok(Some(version_id))
        });
        let version_id = match persisted {
            Ok(Some(version_id)) => version_id,
            Ok(None) => return Err(AddonError::AlreadyInstalled(format!("{name}@{version}"))),
            Err(err) => {
                self.remove_content(&extracted.path);
                return Err(err.into());
            }
        };

        Ok(AddonVersion {
            id: version_id,
            addon_id,
            version: version.to_string(),
            path: extracted.path,
            archive_sha256: Some(extracted.archive_sha256),
            created_at_unix: now,
        })
    }

    /// Makes `version_id` the active version of `addon_id`, keeping the
    /// previously active one as `prev_version_id`.
    pub fn switch_version(
        &self,
        addon_id: AddonId,
        version_id: VersionId,
    ) -> Result<SwitchedVersion, AddonError> {
        let name = self.get_addon(addon_id)?.name;
        let lock = self.locks.lock_for(&name);
        let _held = hold(&lock);
        let mut trail = OperationTrail::begin(&self.layout, "switch", &name);

        match self.switch_locked(addon_id, version_id, &mut trail) {
            Ok(switched) => {
                trail.enter(LifecycleState::Committed, None);
                info!(
                    addon = %name,
                    version_id,
                    previous_version_id = ?switched.previous_version_id,
                    "switched addon version"
                );
                let message = format!(
                    "switched {name} to version {} (id {version_id})",
                    switched.version.version
                );
                self.record(Some(addon_id), &name, LogType::Switch, Ok(message.as_str()));
                Ok(switched)
            }
            Err(err) => {
                trail.enter(LifecycleState::RolledBack, Some(&err.to_string()));
                warn!(addon = %name, version_id, error = %err, "version switch rolled back");
                self.record(Some(addon_id), &name, LogType::Switch, Err(&err));
                Err(err)
            }
        }
    }

    fn switch_locked(
        &self,
        addon_id: AddonId,
        version_id: VersionId,
        trail: &mut OperationTrail,
    ) -> Result<SwitchedVersion, AddonError> {
        trail.enter(LifecycleState::Validating, None);
        let mut db = self.store.open()?;
        let tx = db.begin()?;
        let addons = AddonRepository::new(&tx);
        let mut addon = addons
            .get(addon_id)?
            .ok_or_else(|| AddonError::AddonNotFound(addon_id.to_string()))?;
        if addon.is_current(version_id) {
            return Err(AddonError::NoOpSwitch(version_id));
        }
        let target = VersionRepository::new(&tx)
            .get_for_addon(addon_id, version_id)?
            .ok_or(AddonError::VersionNotFound {
                addon_id,
                version_id,
            })?;
        if !self.switch.content_exists(&target.path) {
            return Err(AddonError::VersionContentMissing(target.path));
        }

        let now = now_unix()?;
        let previous_version_id = addon.current_version_id;
        addons.set_version_pointers(
            addon_id,
            Some(version_id),
            previous_version_id,
            &target.path,
            now,
        )?;

        trail.enter(
            LifecycleState::Activating,
            Some(&target.path.display().to_string()),
        );
        let previous_target = self.switch.current_target(&addon.path).unwrap_or_else(|err| {
            warn!(alias = %addon.path.display(), error = %err, "could not read current alias");
            None
        });
        if let Err(err) = self.switch.activate(&addon.path, &target.path) {
            drop(tx);
            self.restore_alias(&addon.path, previous_target.as_deref());
            return Err(err);
        }
        if let Err(err) = tx.commit() {
            self.restore_alias(&addon.path, previous_target.as_deref());
            return Err(AddonError::TransactionFailure(format!(
                "failed to commit switch of '{}': {err}",
                addon.name
            )));
        }

        addon.prev_version_id = previous_version_id;
        addon.current_version_id = Some(version_id);
        addon.real_path = target.path.clone();
        addon.updated_at_unix = now;
        Ok(SwitchedVersion {
            addon,
            version: target,
            previous_version_id,
        })
    }

    /// Puts the alias back the way the switch found it; an alias that did
    /// not exist before is removed again.
    fn restore_alias(&self, alias: &Path, previous_target: Option<&Path>) {
        let Some(previous_target) = previous_target else {
            match self.switch.deactivate(alias) {
                Ok(()) => debug!(alias = %alias.display(), "removed alias after rollback"),
                Err(err) => error!(
                    alias = %alias.display(),
                    error = %err,
                    "failed to remove alias after rollback"
                ),
            }
            return;
        };
        match self.switch.activate(alias, previous_target) {
            Ok(()) => debug!(alias = %alias.display(), "restored previous alias after rollback"),
            Err(err) => error!(
                alias = %alias.display(),
                target = %previous_target.display(),
                error = %err,
                "failed to restore alias after rollback"
            ),
        }
    }

    /// Queues a dependency install for the addon's active version. Returns
    /// once the task is accepted; the outcome lands in the audit log.
    pub fn submit_dependency_install(&self, addon_id: AddonId) -> Result<(), AddonError> {
        let addon = self.get_addon(addon_id)?;
        self.queue
            .enqueue(DependencyInstallTask::new(addon.id, &addon.name))
            .map_err(|err| {
                AddonError::TaskExecutionFailure(format!(
                    "failed to submit dependency install for '{}': {err:#}",
                    addon.name
                ))
            })?;
        info!(addon = %addon.name, "submitted dependency install");
        Ok(())
    }

    pub fn list_addons(&self) -> Result<Vec<Addon>, AddonError> {
        Ok(self.store.open()?.addons().list()?)
    }

    pub fn get_addon(&self, addon_id: AddonId) -> Result<Addon, AddonError> {
        self.store
            .open()?
            .addons()
            .get(addon_id)?
            .ok_or_else(|| AddonError::AddonNotFound(addon_id.to_string()))
    }

    pub fn find_addon(&self, name: &str) -> Result<Addon, AddonError> {
        self.store
            .open()?
            .addons()
            .find_by_name(name)?
            .ok_or_else(|| AddonError::AddonNotFound(name.to_string()))
    }

    /// Newest first.
    pub fn list_versions(&self, addon_id: AddonId) -> Result<Vec<AddonVersion>, AddonError> {
        let db = self.store.open()?;
        if db.addons().get(addon_id)?.is_none() {
            return Err(AddonError::AddonNotFound(addon_id.to_string()));
        }
        Ok(db.versions().list_for_addon(addon_id)?)
    }

    /// Newest first; a zero `limit` uses the default page size.
    pub fn list_logs(
        &self,
        addon_name: &str,
        log_type: Option<LogType>,
        limit: usize,
    ) -> Result<Vec<AddonLog>, AddonError> {
        Ok(self
            .store
            .open()?
            .logs()
            .list_recent(addon_name, log_type, limit)?)
    }

    pub(crate) fn alias_target(&self, alias: &Path) -> Result<Option<PathBuf>, AddonError> {
        self.switch.current_target(alias)
    }

    pub(crate) fn content_exists(&self, path: &Path) -> bool {
        self.switch.content_exists(path)
    }

    fn existing_addon_id(&self, name: &str) -> Option<AddonId> {
        self.store
            .open()
            .and_then(|db| db.addons().find_by_name(name))
            .ok()
            .flatten()
            .map(|addon| addon.id)
    }

    /// Audit entries record outcomes; a failure to write one is reported
    /// through tracing and never changes the operation's result.
    fn record(
        &self,
        addon_id: Option<AddonId>,
        addon_name: &str,
        log_type: LogType,
        outcome: Result<&str, &AddonError>,
    ) {
        let (status, message) = match outcome {
            Ok(message) => (LogStatus::Success, message.to_string()),
            Err(err) => (LogStatus::Failure, err.to_string()),
        };
        let appended = self.store.open().and_then(|db| {
            db.logs().append(
                NewLogEntry {
                    addon_id,
                    addon_name,
                    log_type,
                    status,
                    message: &message,
                },
                now_unix()?,
            )
        });
        if let Err(err) = appended {
            error!(
                addon = %addon_name,
                log_type = log_type.as_str(),
                error = %format!("{err:#}"),
                "failed to append audit log entry"
            );
        }
    }
}

/// Journal of one operation's state transitions. Journal write failures are
/// reported and otherwise ignored; the database stays the source of truth.
struct OperationTrail {
    journal: Option<OperationJournal>,
    addon: String,
}

impl OperationTrail {
    fn begin(layout: &AddonsLayout, operation: &str, addon: &str) -> Self {
        let journal = match OperationJournal::begin(layout, operation, addon) {
            Ok(journal) => Some(journal),
            Err(err) => {
                warn!(
                    addon = %addon,
                    %operation,
                    error = %format!("{err:#}"),
                    "failed to start operation journal"
                );
                None
            }
        };
        Self {
            journal,
            addon: addon.to_string(),
        }
    }

    fn enter(&mut self, state: LifecycleState, detail: Option<&str>) {
        let Some(journal) = self.journal.as_mut() else {
            debug!(addon = %self.addon, state = state.as_str(), "lifecycle transition");
            return;
        };
        debug!(
            addon = %self.addon,
            txid = %journal.txid(),
            state = state.as_str(),
            "lifecycle transition"
        );
        if let Err(err) = journal.transition(state, detail) {
            warn!(
                addon = %self.addon,
                txid = %journal.txid(),
                error = %format!("{err:#}"),
                "failed to journal lifecycle transition"
            );
        }
    }
}
