//! SQLite persistence for addons, their versions and the audit log.
//!
//! Every repository borrows a plain [`rusqlite::Connection`], so the same
//! calls work against the bare connection and inside a
//! [`rusqlite::Transaction`] (which derefs to a connection).

mod addons;
mod logs;
mod migrations;
mod versions;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use rusqlite::{Connection, ErrorCode, Transaction, TransactionBehavior};
use tracing::debug;

pub use addons::AddonRepository;
pub use logs::{AuditLog, NewLogEntry, DEFAULT_LOG_LIMIT};
pub use migrations::SCHEMA_VERSION;
pub use versions::{NewVersion, VersionRepository};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Cheap, cloneable handle naming the database file; every operation
/// opens its own connection so callers on different threads never share one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Store {
    path: PathBuf,
}

impl Store {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn open(&self) -> Result<Db> {
        Db::open(&self.path)
    }
}

pub struct Db {
    conn: Connection,
}

impl Db {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open addon database: {}", path.display()))?;
        Self::configure(conn, path)
    }

    fn configure(mut conn: Connection, path: &Path) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)
            .context("failed to set busy timeout")?;
        let journal_mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .context("failed to enable WAL journal")?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .context("failed to enable foreign keys")?;
        debug!(db = %path.display(), %journal_mode, "opened addon database");

        migrations::migrate(&mut conn)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Starts a write transaction. The returned guard rolls back when dropped
    /// without `commit`, including while unwinding from a panic.
    pub fn begin(&mut self) -> Result<Transaction<'_>> {
        self.conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to begin transaction")
    }

    pub fn addons(&self) -> AddonRepository<'_> {
        AddonRepository::new(&self.conn)
    }

    pub fn versions(&self) -> VersionRepository<'_> {
        VersionRepository::new(&self.conn)
    }

    pub fn logs(&self) -> AuditLog<'_> {
        AuditLog::new(&self.conn)
    }
}

pub fn now_unix() -> Result<u64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system time is before unix epoch")?
        .as_secs())
}

/// True when any error in the chain is a SQLite constraint violation.
pub fn is_constraint_violation(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<rusqlite::Error>(),
            Some(rusqlite::Error::SqliteFailure(failure, _))
                if failure.code == ErrorCode::ConstraintViolation
        )
    })
}

pub(crate) fn path_to_sql(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

pub(crate) fn unix_from_sql(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

pub(crate) fn unix_to_sql(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
