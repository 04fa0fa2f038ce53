use super::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use addonkit_core::{AddonError, ArchiveType, LogStatus, LogType, DEFAULT_AUTHOR};
use addonkit_installer::{
    list_unfinished_operations, read_operation_record, AddonFs, AddonsLayout, ArchiveStore,
    LocalFs,
};
use addonkit_store::Store;
use anyhow::{anyhow, bail};

static TEST_LAYOUT_COUNTER: AtomicU64 = AtomicU64::new(0);
static FIXTURE_COUNTER: AtomicU64 = AtomicU64::new(0);

fn test_layout() -> AddonsLayout {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    let sequence = TEST_LAYOUT_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut path = std::env::temp_dir();
    path.push(format!(
        "addonkit-lifecycle-tests-{}-{}-{}",
        std::process::id(),
        nanos,
        sequence
    ));
    let layout = AddonsLayout::new(path);
    layout.ensure_base_dirs().expect("must create layout");
    layout
}

/// Stages `<name>.tar.gz` whose single top-level directory holds `files`.
fn stage(layout: &AddonsLayout, name: &str, files: &[(&str, &str)]) {
    let fixture_root = layout
        .root()
        .join("fixtures")
        .join(FIXTURE_COUNTER.fetch_add(1, Ordering::Relaxed).to_string());
    let src = fixture_root.join(name);
    for (rel, contents) in files {
        let path = src.join(rel);
        fs::create_dir_all(path.parent().expect("parent")).expect("must create fixture dir");
        fs::write(path, contents).expect("must write fixture file");
    }
    let archive = layout.staged_archive_path(name, ArchiveType::TarGz);
    let status = Command::new("tar")
        .arg("-czf")
        .arg(&archive)
        .arg("-C")
        .arg(&fixture_root)
        .arg(name)
        .status()
        .expect("tar must run");
    assert!(status.success(), "tar must build fixture archive");
}

fn stage_version(layout: &AddonsLayout, name: &str, label: &str) {
    stage(layout, name, &[("VERSION", label)]);
}

#[derive(Default)]
struct RecordingQueue {
    tasks: Mutex<Vec<DependencyInstallTask>>,
}

impl RecordingQueue {
    fn tasks(&self) -> Vec<DependencyInstallTask> {
        self.tasks.lock().expect("queue lock").clone()
    }
}

impl TaskQueue for RecordingQueue {
    fn enqueue(&self, task: DependencyInstallTask) -> anyhow::Result<()> {
        self.tasks.lock().expect("queue lock").push(task);
        Ok(())
    }
}

struct ClosedQueue;

impl TaskQueue for ClosedQueue {
    fn enqueue(&self, _task: DependencyInstallTask) -> anyhow::Result<()> {
        Err(anyhow!("queue is closed"))
    }
}

/// Local filesystem whose next `alias_failures` alias creations fail.
struct FlakyAliasFs {
    inner: LocalFs,
    alias_failures: AtomicUsize,
}

impl FlakyAliasFs {
    fn new(layout: &AddonsLayout) -> Self {
        Self {
            inner: LocalFs::new(layout.tmp_state_dir()),
            alias_failures: AtomicUsize::new(0),
        }
    }

    fn fail_next_alias(&self) {
        self.alias_failures.store(1, Ordering::SeqCst);
    }
}

impl AddonFs for FlakyAliasFs {
    fn exists(&self, path: &Path) -> bool {
        AddonFs::exists(&self.inner, path)
    }

    fn alias_exists(&self, path: &Path) -> bool {
        self.inner.alias_exists(path)
    }

    fn create_dir_all(&self, path: &Path) -> anyhow::Result<()> {
        self.inner.create_dir_all(path)
    }

    fn remove_tree(&self, path: &Path) -> anyhow::Result<()> {
        self.inner.remove_tree(path)
    }

    fn create_alias(&self, target: &Path, link: &Path) -> anyhow::Result<()> {
        let pending = self.alias_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.alias_failures.store(pending - 1, Ordering::SeqCst);
            bail!("simulated alias failure for {}", link.display());
        }
        self.inner.create_alias(target, link)
    }

    fn read_alias(&self, link: &Path) -> anyhow::Result<Option<PathBuf>> {
        self.inner.read_alias(link)
    }
}

/// Local archives whose extraction for `gated` reports that it started and
/// then waits to be released.
struct GatedArchives {
    inner: LocalFs,
    gated: String,
    started: Mutex<mpsc::Sender<()>>,
    release: Mutex<mpsc::Receiver<()>>,
}

impl ArchiveStore for GatedArchives {
    fn exists(&self, archive_path: &Path) -> bool {
        ArchiveStore::exists(&self.inner, archive_path)
    }

    fn checksum_sha256(&self, archive_path: &Path) -> anyhow::Result<String> {
        self.inner.checksum_sha256(archive_path)
    }

    fn extract(
        &self,
        archive_path: &Path,
        archive_type: ArchiveType,
        dest_dir: &Path,
    ) -> anyhow::Result<()> {
        let gated = dest_dir
            .parent()
            .map(|parent| parent.ends_with(&self.gated))
            .unwrap_or(false);
        if gated {
            let _ = self.started.lock().expect("started lock").send(());
            let _ = self
                .release
                .lock()
                .expect("release lock")
                .recv_timeout(Duration::from_secs(30));
        }
        self.inner.extract(archive_path, archive_type, dest_dir)
    }
}

/// Makes every commit that moved `current_version_id` fail on a deferred
/// foreign key, after the alias has already been swapped.
fn fail_pointer_commits(manager: &AddonManager) {
    let db = manager.store().open().expect("must open db");
    db.conn()
        .execute_batch(
            "CREATE TRIGGER fail_pointer_commit
             AFTER UPDATE OF current_version_id ON addons
             BEGIN
                 UPDATE addons SET prev_version_id = -1 WHERE id = NEW.id;
             END;",
        )
        .expect("must create trigger");
}

fn manager(layout: &AddonsLayout, queue: Arc<dyn TaskQueue>) -> AddonManager {
    AddonManager::new(layout.clone(), queue)
}

fn flaky_manager(layout: &AddonsLayout, fs: Arc<FlakyAliasFs>) -> AddonManager {
    AddonManager::with_parts(
        layout.clone(),
        Store::new(layout.database_path()),
        fs,
        Arc::new(LocalFs::new(layout.tmp_state_dir())),
        Arc::new(RecordingQueue::default()),
        AddonLocks::new(),
    )
}

fn install_demo(manager: &AddonManager, layout: &AddonsLayout) -> InstalledAddon {
    stage_version(layout, "demo", "1.0.0");
    manager.install("demo", "1.0.0").expect("install must succeed")
}

#[test]
fn install_activates_version_records_audit_and_submits_task() {
    let layout = test_layout();
    let queue = Arc::new(RecordingQueue::default());
    let manager = manager(&layout, queue.clone());
    stage(
        &layout,
        "demo",
        &[("VERSION", "1.0.0"), ("addon.toml", "name = \"demo\"\n")],
    );

    let installed = manager.install("demo", "1.0.0").expect("install must succeed");

    let addon = manager.find_addon("demo").expect("addon row exists");
    assert_eq!(addon, installed.addon);
    let versions = manager.list_versions(addon.id).expect("must list versions");
    assert_eq!(versions.len(), 1);
    let version = &versions[0];
    assert_eq!(addon.current_version_id, Some(version.id));
    assert_eq!(addon.prev_version_id, None);
    assert_eq!(version.version, "1.0.0");
    assert_eq!(version.path, layout.version_content_dir("demo", "1.0.0"));
    assert_eq!(addon.real_path, version.path);
    assert_eq!(addon.path, layout.alias_path("demo"));
    assert_eq!(fs::read_link(&addon.path).expect("alias"), version.path);
    assert_eq!(addon.author, DEFAULT_AUTHOR);

    let logs = manager.list_logs("demo", None, 0).expect("must list logs");
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].log_type, LogType::Install);
    assert_eq!(logs[0].status, LogStatus::Success);
    assert_eq!(logs[0].addon_id, Some(addon.id));

    assert!(installed.dependency_task_submitted);
    assert_eq!(
        queue.tasks(),
        vec![DependencyInstallTask {
            addon_id: addon.id,
            addon_name: "demo".to_string(),
            log_type: LogType::DependencyInstall,
        }]
    );

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn install_takes_author_and_thumb_from_manifest() {
    let layout = test_layout();
    let manager = manager(&layout, Arc::new(RecordingQueue::default()));
    stage(
        &layout,
        "demo",
        &[(
            "addon.toml",
            "name = \"demo\"\nauthor = \"Ada\"\nthumb = \"thumb.png\"\n",
        )],
    );

    let installed = manager.install("demo", "1.0.0").expect("install must succeed");
    assert_eq!(installed.addon.author, "Ada");
    assert_eq!(installed.addon.thumb, "thumb.png");

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn install_rejects_existing_name_regardless_of_label() {
    let layout = test_layout();
    let queue = Arc::new(RecordingQueue::default());
    let manager = manager(&layout, queue.clone());
    let first = install_demo(&manager, &layout);

    stage_version(&layout, "demo", "2.0.0");
    let err = manager
        .install("demo", "2.0.0")
        .expect_err("second install must fail");
    assert!(matches!(err, AddonError::AlreadyInstalled(ref name) if name == "demo"));

    let versions = manager.list_versions(first.addon.id).expect("versions");
    assert_eq!(versions.len(), 1);
    assert!(!layout.version_content_dir("demo", "2.0.0").exists());
    assert_eq!(manager.find_addon("demo").expect("addon"), first.addon);
    assert_eq!(queue.tasks().len(), 1);

    let logs = manager.list_logs("demo", Some(LogType::Install), 0).expect("logs");
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[0].status, LogStatus::Failure);
    assert!(logs[0].message.contains("already installed"));
    assert_eq!(logs[0].addon_id, Some(first.addon.id));

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn install_without_staged_archive_is_rejected_and_audited() {
    let layout = test_layout();
    let queue = Arc::new(RecordingQueue::default());
    let manager = manager(&layout, queue.clone());

    let err = manager.install("demo", "1.0.0").expect_err("must fail");
    assert!(matches!(err, AddonError::ArchiveMissing { .. }), "{err}");
    assert!(matches!(
        manager.find_addon("demo"),
        Err(AddonError::AddonNotFound(_))
    ));
    assert!(queue.tasks().is_empty());

    let logs = manager.list_logs("demo", None, 0).expect("logs");
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, LogStatus::Failure);
    assert_eq!(logs[0].addon_id, None);

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn concurrent_installs_of_same_name_leave_one_addon() {
    let layout = test_layout();
    let manager = manager(&layout, Arc::new(RecordingQueue::default()));
    stage_version(&layout, "demo", "1.0.0");

    let handles = (0..2)
        .map(|_| {
            let manager = manager.clone();
            std::thread::spawn(move || manager.install("demo", "1.0.0"))
        })
        .collect::<Vec<_>>();
    let results = handles
        .into_iter()
        .map(|handle| handle.join().expect("install thread"))
        .collect::<Vec<_>>();

    assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
    let loser = results
        .iter()
        .find_map(|result| result.as_ref().err())
        .expect("one install must lose");
    assert!(matches!(loser, AddonError::AlreadyInstalled(_)), "{loser}");
    assert_eq!(manager.list_addons().expect("list").len(), 1);

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn failed_activation_rolls_back_install_and_removes_alias() {
    let layout = test_layout();
    let fs_double = Arc::new(FlakyAliasFs::new(&layout));
    let manager = flaky_manager(&layout, fs_double.clone());
    stage_version(&layout, "demo", "1.0.0");
    fs_double.fail_next_alias();

    let err = manager.install("demo", "1.0.0").expect_err("must fail");
    assert!(matches!(err, AddonError::TransactionFailure(_)), "{err}");
    assert!(manager.list_addons().expect("list").is_empty());
    assert!(fs::symlink_metadata(layout.alias_path("demo")).is_err());
    assert!(!layout.version_content_dir("demo", "1.0.0").exists());

    let logs = manager.list_logs("demo", None, 0).expect("logs");
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, LogStatus::Failure);

    manager
        .install("demo", "1.0.0")
        .expect("retry after rollback must succeed");

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn switch_is_reversible_and_tracks_previous_version() {
    let layout = test_layout();
    let manager = manager(&layout, Arc::new(RecordingQueue::default()));
    let installed = install_demo(&manager, &layout);
    let v1 = installed.version.id;
    stage_version(&layout, "demo", "2.0.0");
    let v2 = manager
        .add_version(installed.addon.id, "2.0.0")
        .expect("add version")
        .id;

    let alias = layout.alias_path("demo");
    assert_eq!(
        fs::read_link(&alias).expect("alias"),
        layout.version_content_dir("demo", "1.0.0"),
        "adding a version leaves the active one alone"
    );

    let switched = manager
        .switch_version(installed.addon.id, v2)
        .expect("switch to v2");
    assert_eq!(switched.previous_version_id, Some(v1));
    let addon = manager.get_addon(installed.addon.id).expect("addon");
    assert_eq!(addon.current_version_id, Some(v2));
    assert_eq!(addon.prev_version_id, Some(v1));
    assert_eq!(addon, switched.addon);
    assert_eq!(
        fs::read_link(&alias).expect("alias"),
        layout.version_content_dir("demo", "2.0.0")
    );
    assert_eq!(fs::read_to_string(alias.join("VERSION")).expect("read"), "2.0.0");

    manager
        .switch_version(installed.addon.id, v1)
        .expect("switch back to v1");
    let addon = manager.get_addon(installed.addon.id).expect("addon");
    assert_eq!(addon.current_version_id, Some(v1));
    assert_eq!(addon.prev_version_id, Some(v2));
    assert_eq!(fs::read_to_string(alias.join("VERSION")).expect("read"), "1.0.0");

    let switches = manager
        .list_logs("demo", Some(LogType::Switch), 0)
        .expect("logs");
    assert_eq!(switches.len(), 2);
    assert!(switches
        .iter()
        .all(|entry| entry.status == LogStatus::Success));

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn switch_to_current_version_is_rejected_without_changes() {
    let layout = test_layout();
    let manager = manager(&layout, Arc::new(RecordingQueue::default()));
    let installed = install_demo(&manager, &layout);

    let err = manager
        .switch_version(installed.addon.id, installed.version.id)
        .expect_err("must be a no-op");
    assert!(matches!(err, AddonError::NoOpSwitch(id) if id == installed.version.id));
    assert_eq!(
        manager.get_addon(installed.addon.id).expect("addon"),
        installed.addon
    );

    let switches = manager
        .list_logs("demo", Some(LogType::Switch), 0)
        .expect("logs");
    assert_eq!(switches.len(), 1);
    assert_eq!(switches[0].status, LogStatus::Failure);

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn switch_to_deleted_content_is_rejected_without_changes() {
    let layout = test_layout();
    let manager = manager(&layout, Arc::new(RecordingQueue::default()));
    let installed = install_demo(&manager, &layout);
    stage_version(&layout, "demo", "2.0.0");
    let v2 = manager
        .add_version(installed.addon.id, "2.0.0")
        .expect("add version");
    fs::remove_dir_all(&v2.path).expect("delete content out of band");

    let err = manager
        .switch_version(installed.addon.id, v2.id)
        .expect_err("must fail");
    assert!(matches!(err, AddonError::VersionContentMissing(ref path) if path == &v2.path));
    assert_eq!(
        manager.get_addon(installed.addon.id).expect("addon"),
        installed.addon
    );
    assert_eq!(
        fs::read_link(layout.alias_path("demo")).expect("alias"),
        installed.version.path
    );

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn switch_to_version_of_another_addon_is_not_found() {
    let layout = test_layout();
    let manager = manager(&layout, Arc::new(RecordingQueue::default()));
    let demo = install_demo(&manager, &layout);
    stage_version(&layout, "other", "1.0.0");
    let other = manager.install("other", "1.0.0").expect("install other");

    let err = manager
        .switch_version(demo.addon.id, other.version.id)
        .expect_err("must be scoped to the addon");
    assert!(matches!(
        err,
        AddonError::VersionNotFound { addon_id, version_id }
            if addon_id == demo.addon.id && version_id == other.version.id
    ));
    assert_eq!(manager.get_addon(demo.addon.id).expect("addon"), demo.addon);

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn failed_alias_swap_restores_previous_alias() {
    let layout = test_layout();
    let fs_double = Arc::new(FlakyAliasFs::new(&layout));
    let manager = flaky_manager(&layout, fs_double.clone());
    let installed = install_demo(&manager, &layout);
    stage_version(&layout, "demo", "2.0.0");
    let v2 = manager
        .add_version(installed.addon.id, "2.0.0")
        .expect("add version");
    fs_double.fail_next_alias();

    let err = manager
        .switch_version(installed.addon.id, v2.id)
        .expect_err("alias swap must fail");
    assert!(matches!(err, AddonError::TransactionFailure(_)), "{err}");
    assert_eq!(
        manager.get_addon(installed.addon.id).expect("addon"),
        installed.addon
    );
    assert_eq!(
        fs::read_link(layout.alias_path("demo")).expect("alias restored"),
        installed.version.path
    );

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn slow_extraction_does_not_block_installs_of_other_addons() {
    let layout = test_layout();
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let archives = Arc::new(GatedArchives {
        inner: LocalFs::new(layout.tmp_state_dir()),
        gated: "alpha".to_string(),
        started: Mutex::new(started_tx),
        release: Mutex::new(release_rx),
    });
    let manager = AddonManager::with_parts(
        layout.clone(),
        Store::new(layout.database_path()),
        Arc::new(LocalFs::new(layout.tmp_state_dir())),
        archives,
        Arc::new(RecordingQueue::default()),
        AddonLocks::new(),
    );
    stage_version(&layout, "alpha", "1.0.0");
    stage_version(&layout, "beta", "1.0.0");

    let alpha = {
        let manager = manager.clone();
        std::thread::spawn(move || manager.install("alpha", "1.0.0"))
    };
    started_rx
        .recv_timeout(Duration::from_secs(30))
        .expect("alpha extraction must start");

    let started = Instant::now();
    let beta = manager.install("beta", "1.0.0");
    let beta_elapsed = started.elapsed();
    release_tx.send(()).expect("must release alpha");

    beta.expect("beta must install while alpha is extracting");
    assert!(beta_elapsed < Duration::from_secs(5), "{beta_elapsed:?}");
    alpha
        .join()
        .expect("alpha thread")
        .expect("alpha must install");
    assert_eq!(manager.list_addons().expect("list").len(), 2);

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn failed_install_commit_removes_new_alias_and_content() {
    let layout = test_layout();
    let queue = Arc::new(RecordingQueue::default());
    let manager = manager(&layout, queue.clone());
    fail_pointer_commits(&manager);
    stage_version(&layout, "demo", "1.0.0");

    let err = manager.install("demo", "1.0.0").expect_err("commit must fail");
    assert!(matches!(err, AddonError::TransactionFailure(_)), "{err}");
    assert!(manager.list_addons().expect("list").is_empty());
    assert!(fs::symlink_metadata(layout.alias_path("demo")).is_err());
    assert!(!layout.version_content_dir("demo", "1.0.0").exists());
    assert!(queue.tasks().is_empty());

    let logs = manager.list_logs("demo", None, 0).expect("logs");
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, LogStatus::Failure);
    assert_eq!(logs[0].addon_id, None);

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn failed_switch_commit_restores_previous_alias() {
    let layout = test_layout();
    let manager = manager(&layout, Arc::new(RecordingQueue::default()));
    let installed = install_demo(&manager, &layout);
    stage_version(&layout, "demo", "2.0.0");
    let v2 = manager
        .add_version(installed.addon.id, "2.0.0")
        .expect("add version");
    fail_pointer_commits(&manager);

    let err = manager
        .switch_version(installed.addon.id, v2.id)
        .expect_err("commit must fail");
    assert!(matches!(err, AddonError::TransactionFailure(_)), "{err}");
    assert_eq!(
        manager.get_addon(installed.addon.id).expect("addon"),
        installed.addon
    );
    assert_eq!(
        fs::read_link(layout.alias_path("demo")).expect("alias restored"),
        installed.version.path
    );

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn failed_switch_commit_removes_alias_that_was_absent() {
    let layout = test_layout();
    let manager = manager(&layout, Arc::new(RecordingQueue::default()));
    let installed = install_demo(&manager, &layout);
    stage_version(&layout, "demo", "2.0.0");
    let v2 = manager
        .add_version(installed.addon.id, "2.0.0")
        .expect("add version");
    fs::remove_file(layout.alias_path("demo")).expect("remove alias out of band");
    fail_pointer_commits(&manager);

    let err = manager
        .switch_version(installed.addon.id, v2.id)
        .expect_err("commit must fail");
    assert!(matches!(err, AddonError::TransactionFailure(_)), "{err}");
    assert_eq!(
        manager.get_addon(installed.addon.id).expect("addon"),
        installed.addon
    );
    assert!(fs::symlink_metadata(layout.alias_path("demo")).is_err());

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn add_version_rejects_duplicate_label() {
    let layout = test_layout();
    let manager = manager(&layout, Arc::new(RecordingQueue::default()));
    let installed = install_demo(&manager, &layout);
    stage_version(&layout, "demo", "other content");

    let err = manager
        .add_version(installed.addon.id, "1.0.0")
        .expect_err("duplicate label");
    assert!(matches!(err, AddonError::AlreadyInstalled(_)), "{err}");
    assert_eq!(
        fs::read_to_string(installed.version.path.join("VERSION")).expect("read"),
        "1.0.0",
        "existing content is untouched"
    );

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn every_terminal_outcome_writes_exactly_one_audit_entry() {
    let layout = test_layout();
    let manager = manager(&layout, Arc::new(RecordingQueue::default()));
    let installed = install_demo(&manager, &layout);
    let count = || manager.list_logs("demo", None, 100).expect("logs").len();
    assert_eq!(count(), 1);

    let _ = manager.switch_version(installed.addon.id, installed.version.id);
    assert_eq!(count(), 2);
    let _ = manager.switch_version(installed.addon.id, 9_999);
    assert_eq!(count(), 3);
    let _ = manager.install("demo", "1.0.0");
    assert_eq!(count(), 4);

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn install_succeeds_when_dependency_submission_fails() {
    let layout = test_layout();
    let manager = manager(&layout, Arc::new(ClosedQueue));
    stage_version(&layout, "demo", "1.0.0");

    let installed = manager.install("demo", "1.0.0").expect("install");
    assert!(!installed.dependency_task_submitted);
    let logs = manager.list_logs("demo", None, 0).expect("logs");
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, LogStatus::Success);
    assert!(logs[0].message.contains("not submitted"));

    let err = manager
        .submit_dependency_install(installed.addon.id)
        .expect_err("closed queue");
    assert!(matches!(err, AddonError::TaskExecutionFailure(_)), "{err}");

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn submit_dependency_install_requires_known_addon() {
    let layout = test_layout();
    let queue = Arc::new(RecordingQueue::default());
    let manager = manager(&layout, queue.clone());
    let installed = install_demo(&manager, &layout);

    manager
        .submit_dependency_install(installed.addon.id)
        .expect("submit");
    manager
        .submit_dependency_install(installed.addon.id)
        .expect("resubmission is allowed");
    assert_eq!(queue.tasks().len(), 3);

    let err = manager
        .submit_dependency_install(installed.addon.id + 100)
        .expect_err("unknown addon");
    assert!(matches!(err, AddonError::AddonNotFound(_)), "{err}");

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn operations_leave_committed_journals() {
    let layout = test_layout();
    let manager = manager(&layout, Arc::new(RecordingQueue::default()));
    install_demo(&manager, &layout);
    let _ = manager.install("missing", "1.0.0");

    let mut states = Vec::new();
    for entry in fs::read_dir(layout.operations_dir()).expect("operations dir") {
        let path = entry.expect("entry").path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            continue;
        }
        let txid = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .expect("txid")
            .to_string();
        let record = read_operation_record(&layout, &txid)
            .expect("read")
            .expect("record");
        states.push((record.addon, record.state));
    }
    states.sort();
    assert_eq!(
        states,
        vec![
            ("demo".to_string(), "committed".to_string()),
            ("missing".to_string(), "rolled_back".to_string()),
        ]
    );
    assert!(list_unfinished_operations(&layout).expect("list").is_empty());

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn consistency_check_reports_drift() {
    let layout = test_layout();
    let manager = manager(&layout, Arc::new(RecordingQueue::default()));
    let installed = install_demo(&manager, &layout);
    stage_version(&layout, "other", "1.0.0");
    let other = manager.install("other", "1.0.0").expect("install other");

    let report = manager.check_consistency().expect("check");
    assert_eq!(report.checked_addons, 2);
    assert!(report.is_clean(), "{report:?}");

    fs::remove_file(&installed.addon.path).expect("remove alias out of band");
    fs::remove_dir_all(&other.version.path).expect("remove content out of band");

    let report = manager.check_consistency().expect("check");
    assert_eq!(
        report.issues,
        vec![
            ConsistencyIssue {
                addon: "demo".to_string(),
                problem: ConsistencyProblem::AliasMissing {
                    alias: installed.addon.path.clone(),
                },
            },
            ConsistencyIssue {
                addon: "other".to_string(),
                problem: ConsistencyProblem::ContentMissing {
                    path: other.version.path.clone(),
                },
            },
        ]
    );

    let _ = fs::remove_dir_all(layout.root());
}

#[cfg(unix)]
#[test]
fn manifest_installer_runs_declared_command_in_addon_root() {
    let layout = test_layout();
    let root = layout.root().join("addon");
    fs::create_dir_all(&root).expect("root");
    fs::write(
        root.join("addon.toml"),
        r#"
name = "demo"

[dependencies]
command = ["sh", "-c", "echo \"$GREETING\" > deps.marker && echo installed"]
env = { GREETING = "hello" }
"#,
    )
    .expect("manifest");

    let output = ManifestDependencyInstaller
        .install("demo", &root)
        .expect("command must succeed");
    assert_eq!(output, "installed");
    assert_eq!(
        fs::read_to_string(root.join("deps.marker")).expect("marker"),
        "hello\n"
    );

    let _ = fs::remove_dir_all(layout.root());
}

#[cfg(unix)]
#[test]
fn manifest_installer_reports_failing_command() {
    let layout = test_layout();
    let root = layout.root().join("addon");
    fs::create_dir_all(&root).expect("root");
    fs::write(
        root.join("addon.toml"),
        "[dependencies]\ncommand = [\"sh\", \"-c\", \"echo broken >&2; exit 3\"]\n",
    )
    .expect("manifest");

    let err = ManifestDependencyInstaller
        .install("demo", &root)
        .expect_err("command must fail");
    let message = format!("{err:#}");
    assert!(message.contains("exited with"), "{message}");
    assert!(message.contains("broken"), "{message}");

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn manifest_installer_without_manifest_has_nothing_to_do() {
    let layout = test_layout();
    let output = ManifestDependencyInstaller
        .install("demo", layout.root())
        .expect("nothing to install");
    assert!(output.contains("nothing to install"));

    let _ = fs::remove_dir_all(layout.root());
}

/// Fails the first `fail_first` calls, then succeeds.
struct ScriptedInstaller {
    fail_first: u32,
    calls: AtomicU32,
}

impl ScriptedInstaller {
    fn new(fail_first: u32) -> Self {
        Self {
            fail_first,
            calls: AtomicU32::new(0),
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl DependencyInstaller for ScriptedInstaller {
    fn install(&self, _addon_name: &str, _addon_root: &Path) -> anyhow::Result<String> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.fail_first {
            bail!("attempt {call} failed");
        }
        Ok("dependencies installed".to_string())
    }
}

fn fast_retries(max_attempts: u32) -> WorkerOptions {
    WorkerOptions {
        concurrency: 2,
        max_attempts,
        retry_backoff: Duration::from_millis(1),
    }
}

#[tokio::test]
async fn worker_retries_then_records_single_success() {
    let layout = test_layout();
    let manager = manager(&layout, Arc::new(RecordingQueue::default()));
    let installed = install_demo(&manager, &layout);
    let installer = Arc::new(ScriptedInstaller::new(2));
    let worker = TaskWorker::spawn(
        manager.store().clone(),
        manager.locks().clone(),
        installer.clone(),
        fast_retries(3),
    );

    worker
        .queue()
        .enqueue(DependencyInstallTask::new(installed.addon.id, "demo"))
        .expect("enqueue");
    worker.shutdown().await;

    assert_eq!(installer.calls(), 3);
    let logs = manager
        .list_logs("demo", Some(LogType::DependencyInstall), 0)
        .expect("logs");
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, LogStatus::Success);
    assert_eq!(logs[0].message, "dependencies installed");

    let _ = fs::remove_dir_all(layout.root());
}

#[tokio::test]
async fn worker_records_single_failure_after_exhausting_attempts() {
    let layout = test_layout();
    let manager = manager(&layout, Arc::new(RecordingQueue::default()));
    let installed = install_demo(&manager, &layout);
    let installer = Arc::new(ScriptedInstaller::new(u32::MAX));
    let worker = TaskWorker::spawn(
        manager.store().clone(),
        manager.locks().clone(),
        installer.clone(),
        fast_retries(2),
    );

    worker
        .queue()
        .enqueue(DependencyInstallTask::new(installed.addon.id, "demo"))
        .expect("enqueue");
    worker.shutdown().await;

    assert_eq!(installer.calls(), 2);
    let logs = manager
        .list_logs("demo", Some(LogType::DependencyInstall), 0)
        .expect("logs");
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, LogStatus::Failure);
    assert!(logs[0].message.contains("attempt 2 failed"), "{}", logs[0].message);

    let _ = fs::remove_dir_all(layout.root());
}

#[tokio::test]
async fn worker_tolerates_resubmission_and_unknown_addons() {
    let layout = test_layout();
    let manager = manager(&layout, Arc::new(RecordingQueue::default()));
    let installed = install_demo(&manager, &layout);
    let installer = Arc::new(ScriptedInstaller::new(0));
    let worker = TaskWorker::spawn(
        manager.store().clone(),
        manager.locks().clone(),
        installer.clone(),
        fast_retries(3),
    );
    let queue = worker.queue();

    queue
        .enqueue(DependencyInstallTask::new(installed.addon.id, "demo"))
        .expect("enqueue");
    queue
        .enqueue(DependencyInstallTask::new(installed.addon.id, "demo"))
        .expect("resubmit");
    queue
        .enqueue(DependencyInstallTask::new(installed.addon.id + 50, "ghost"))
        .expect("enqueue unknown");
    worker.shutdown().await;

    assert_eq!(installer.calls(), 2, "unknown addons are not retried");
    let demo_logs = manager
        .list_logs("demo", Some(LogType::DependencyInstall), 0)
        .expect("logs");
    assert_eq!(demo_logs.len(), 2);
    let ghost_logs = manager.list_logs("ghost", None, 0).expect("logs");
    assert_eq!(ghost_logs.len(), 1);
    assert_eq!(ghost_logs[0].status, LogStatus::Failure);
    assert_eq!(ghost_logs[0].addon_id, None);

    assert!(queue
        .enqueue(DependencyInstallTask::new(installed.addon.id, "demo"))
        .is_err());

    let _ = fs::remove_dir_all(layout.root());
}
