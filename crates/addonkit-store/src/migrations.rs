use anyhow::{Context, Result};
use rusqlite::{Connection, TransactionBehavior};
use tracing::{debug, info};

pub const SCHEMA_VERSION: i64 = 1;

/// Brings the schema up to [`SCHEMA_VERSION`]. An up-to-date schema is
/// detected without taking the write lock; otherwise the version is read
/// again under an immediate transaction so two processes opening a fresh
/// file cannot both apply v1.
pub(crate) fn migrate(conn: &mut Connection) -> Result<()> {
    let current = schema_version(conn)?;
    if current >= SCHEMA_VERSION {
        debug!(schema_version = current, "addon schema up to date");
        return Ok(());
    }

    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .context("failed to begin migration transaction")?;
    let current = schema_version(&tx)?;
    if current >= SCHEMA_VERSION {
        debug!(schema_version = current, "addon schema migrated concurrently");
        return Ok(());
    }

    if current < 1 {
        migrate_v1(&tx)?;
    }

    tx.pragma_update(None, "user_version", SCHEMA_VERSION)
        .context("failed to record schema version")?;
    tx.commit().context("failed to commit schema migration")?;
    info!(schema_version = SCHEMA_VERSION, "migrated addon schema");
    Ok(())
}

fn schema_version(conn: &Connection) -> Result<i64> {
    conn.query_row("PRAGMA user_version", [], |row| row.get(0))
        .context("failed to read schema version")
}

/// Initial schema.
///
/// - addons: one row per installed addon, unique by name
/// - addons_versions: immutable extracted copies owned by an addon
/// - addons_logs: append-only lifecycle audit trail
///
/// The composite keys on `addons` make the version pointers reference a
/// version of the *same* addon; they are deferred so an addon and its first
/// version can be written in one transaction.
fn migrate_v1(conn: &Connection) -> Result<()> {
    debug!("creating addon schema version 1");

    conn.execute_batch(
        "
        CREATE TABLE addons (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            thumb TEXT NOT NULL DEFAULT '',
            author TEXT NOT NULL DEFAULT '',
            path TEXT NOT NULL,
            real_path TEXT NOT NULL,
            current_version_id INTEGER,
            prev_version_id INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            FOREIGN KEY (id, current_version_id)
                REFERENCES addons_versions(addon_id, id)
                DEFERRABLE INITIALLY DEFERRED,
            FOREIGN KEY (id, prev_version_id)
                REFERENCES addons_versions(addon_id, id)
                DEFERRABLE INITIALLY DEFERRED
        );

        CREATE TABLE addons_versions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            addon_id INTEGER NOT NULL REFERENCES addons(id) ON DELETE CASCADE,
            version TEXT NOT NULL,
            path TEXT NOT NULL,
            archive_sha256 TEXT,
            created_at INTEGER NOT NULL,
            UNIQUE (addon_id, id),
            UNIQUE (addon_id, version)
        );

        CREATE TABLE addons_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            addon_id INTEGER REFERENCES addons(id) ON DELETE CASCADE,
            addon_name TEXT NOT NULL,
            type TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('success', 'failure')),
            message TEXT NOT NULL DEFAULT '',
            created_at INTEGER NOT NULL
        );

        CREATE INDEX idx_addons_versions_addon ON addons_versions(addon_id, created_at);
        CREATE INDEX idx_addons_logs_addon_name ON addons_logs(addon_name, created_at);
        ",
    )
    .context("failed to create addon schema v1")?;

    Ok(())
}
