use std::path::{Path, PathBuf};

use addonkit_core::{AddonId, AddonVersion, VersionId};
use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::{path_to_sql, unix_from_sql, unix_to_sql};

const VERSION_COLUMNS: &str = "id, addon_id, version, path, archive_sha256, created_at";

#[derive(Debug, Clone, Copy)]
pub struct NewVersion<'a> {
    pub addon_id: AddonId,
    pub version: &'a str,
    pub path: &'a Path,
    pub archive_sha256: Option<&'a str>,
}

fn scan_version_row(row: &Row<'_>) -> rusqlite::Result<AddonVersion> {
    let path: String = row.get(3)?;
    Ok(AddonVersion {
        id: row.get(0)?,
        addon_id: row.get(1)?,
        version: row.get(2)?,
        path: PathBuf::from(path),
        archive_sha256: row.get(4)?,
        created_at_unix: unix_from_sql(row.get(5)?),
    })
}

pub struct VersionRepository<'a> {
    conn: &'a Connection,
}

impl<'a> VersionRepository<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn insert(&self, version: NewVersion<'_>, now_unix: u64) -> Result<VersionId> {
        self.conn
            .execute(
                "INSERT INTO addons_versions (addon_id, version, path, archive_sha256, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    version.addon_id,
                    version.version,
                    path_to_sql(version.path),
                    version.archive_sha256,
                    unix_to_sql(now_unix),
                ],
            )
            .with_context(|| {
                format!(
                    "failed to insert version '{}' for addon {}",
                    version.version, version.addon_id
                )
            })?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Looks a version up *within* one addon; an id owned by another addon
    /// is reported as absent.
    pub fn get_for_addon(
        &self,
        addon_id: AddonId,
        version_id: VersionId,
    ) -> Result<Option<AddonVersion>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {VERSION_COLUMNS} FROM addons_versions WHERE addon_id = ?1 AND id = ?2"
                ),
                params![addon_id, version_id],
                scan_version_row,
            )
            .optional()
            .with_context(|| format!("failed to load version {version_id} of addon {addon_id}"))
    }

    pub fn find_by_label(&self, addon_id: AddonId, label: &str) -> Result<Option<AddonVersion>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {VERSION_COLUMNS} FROM addons_versions WHERE addon_id = ?1 AND version = ?2"
                ),
                params![addon_id, label],
                scan_version_row,
            )
            .optional()
            .with_context(|| format!("failed to load version '{label}' of addon {addon_id}"))
    }

    /// Newest first.
    pub fn list_for_addon(&self, addon_id: AddonId) -> Result<Vec<AddonVersion>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {VERSION_COLUMNS} FROM addons_versions
                 WHERE addon_id = ?1
                 ORDER BY created_at DESC, id DESC"
            ))
            .context("failed to prepare version listing")?;
        let rows = stmt
            .query_map(params![addon_id], scan_version_row)
            .with_context(|| format!("failed to list versions of addon {addon_id}"))?;
        let mut versions = Vec::new();
        for row in rows {
            versions.push(row.context("failed to read version row")?);
        }
        Ok(versions)
    }
}
