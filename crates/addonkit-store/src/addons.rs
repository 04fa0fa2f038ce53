use std::path::{Path, PathBuf};

use addonkit_core::{Addon, AddonId, NewAddon, VersionId};
use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::{path_to_sql, unix_from_sql, unix_to_sql};

const ADDON_COLUMNS: &str = "id, name, thumb, author, path, real_path, current_version_id, \
                             prev_version_id, created_at, updated_at";

fn scan_addon_row(row: &Row<'_>) -> rusqlite::Result<Addon> {
    let path: String = row.get(4)?;
    let real_path: String = row.get(5)?;
    Ok(Addon {
        id: row.get(0)?,
        name: row.get(1)?,
        thumb: row.get(2)?,
        author: row.get(3)?,
        path: PathBuf::from(path),
        real_path: PathBuf::from(real_path),
        current_version_id: row.get(6)?,
        prev_version_id: row.get(7)?,
        created_at_unix: unix_from_sql(row.get(8)?),
        updated_at_unix: unix_from_sql(row.get(9)?),
    })
}

pub struct AddonRepository<'a> {
    conn: &'a Connection,
}

impl<'a> AddonRepository<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Inserts the addon row with no version pointers; a second insert for
    /// the same name fails on the `UNIQUE(name)` constraint.
    pub fn insert(&self, addon: &NewAddon, now_unix: u64) -> Result<AddonId> {
        self.conn
            .execute(
                "INSERT INTO addons (
                    name, thumb, author, path, real_path,
                    current_version_id, prev_version_id, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, NULL, NULL, ?6, ?6)",
                params![
                    addon.name,
                    addon.thumb,
                    addon.author,
                    path_to_sql(&addon.path),
                    path_to_sql(&addon.real_path),
                    unix_to_sql(now_unix),
                ],
            )
            .with_context(|| format!("failed to insert addon '{}'", addon.name))?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get(&self, id: AddonId) -> Result<Option<Addon>> {
        self.conn
            .query_row(
                &format!("SELECT {ADDON_COLUMNS} FROM addons WHERE id = ?1"),
                params![id],
                scan_addon_row,
            )
            .optional()
            .with_context(|| format!("failed to load addon {id}"))
    }

    pub fn find_by_name(&self, name: &str) -> Result<Option<Addon>> {
        self.conn
            .query_row(
                &format!("SELECT {ADDON_COLUMNS} FROM addons WHERE name = ?1"),
                params![name],
                scan_addon_row,
            )
            .optional()
            .with_context(|| format!("failed to load addon '{name}'"))
    }

    pub fn exists(&self, name: &str) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM addons WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to check addon '{name}'"))?;
        Ok(found.is_some())
    }

    pub fn list(&self) -> Result<Vec<Addon>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {ADDON_COLUMNS} FROM addons ORDER BY name"))
            .context("failed to prepare addon listing")?;
        let rows = stmt
            .query_map([], scan_addon_row)
            .context("failed to list addons")?;
        let mut addons = Vec::new();
        for row in rows {
            addons.push(row.context("failed to read addon row")?);
        }
        Ok(addons)
    }

    /// Repoints both version pointers and the recorded real path in one write.
    pub fn set_version_pointers(
        &self,
        id: AddonId,
        current: Option<VersionId>,
        prev: Option<VersionId>,
        real_path: &Path,
        now_unix: u64,
    ) -> Result<()> {
        let updated = self
            .conn
            .execute(
                "UPDATE addons
                 SET current_version_id = ?2, prev_version_id = ?3, real_path = ?4, updated_at = ?5
                 WHERE id = ?1",
                params![
                    id,
                    current,
                    prev,
                    path_to_sql(real_path),
                    unix_to_sql(now_unix)
                ],
            )
            .with_context(|| format!("failed to update version pointers of addon {id}"))?;
        if updated != 1 {
            anyhow::bail!("addon {id} disappeared while updating version pointers");
        }
        Ok(())
    }
}
