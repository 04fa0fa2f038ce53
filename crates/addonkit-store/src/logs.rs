use addonkit_core::{AddonId, AddonLog, LogStatus, LogType};
use anyhow::{Context, Result};
use rusqlite::{params, params_from_iter, types::Value, Connection, Row};

use crate::{unix_from_sql, unix_to_sql};

/// Page size used when a caller does not ask for a specific limit.
pub const DEFAULT_LOG_LIMIT: usize = 20;

#[derive(Debug, Clone, Copy)]
pub struct NewLogEntry<'a> {
    pub addon_id: Option<AddonId>,
    pub addon_name: &'a str,
    pub log_type: LogType,
    pub status: LogStatus,
    pub message: &'a str,
}

fn scan_log_row(row: &Row<'_>) -> rusqlite::Result<AddonLog> {
    let log_type: String = row.get(3)?;
    let status: String = row.get(4)?;
    Ok(AddonLog {
        id: row.get(0)?,
        addon_id: row.get(1)?,
        addon_name: row.get(2)?,
        log_type: LogType::parse(&log_type).map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, err.into())
        })?,
        status: LogStatus::parse(&status).map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, err.into())
        })?,
        message: row.get(5)?,
        created_at_unix: unix_from_sql(row.get(6)?),
    })
}

/// Append-only record of lifecycle outcomes. Entries are never updated or
/// deleted here; storage failures surface as plain errors.
pub struct AuditLog<'a> {
    conn: &'a Connection,
}

impl<'a> AuditLog<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn append(&self, entry: NewLogEntry<'_>, now_unix: u64) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO addons_logs (addon_id, addon_name, type, status, message, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    entry.addon_id,
                    entry.addon_name,
                    entry.log_type.as_str(),
                    entry.status.as_str(),
                    entry.message,
                    unix_to_sql(now_unix),
                ],
            )
            .with_context(|| {
                format!(
                    "failed to append {} log for addon '{}'",
                    entry.log_type.as_str(),
                    entry.addon_name
                )
            })?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Newest first, optionally narrowed to one event type. A zero limit
    /// falls back to [`DEFAULT_LOG_LIMIT`].
    pub fn list_recent(
        &self,
        addon_name: &str,
        log_type: Option<LogType>,
        limit: usize,
    ) -> Result<Vec<AddonLog>> {
        let limit = if limit == 0 { DEFAULT_LOG_LIMIT } else { limit };
        let mut query = String::from(
            "SELECT id, addon_id, addon_name, type, status, message, created_at
             FROM addons_logs
             WHERE addon_name = ?",
        );
        let mut args: Vec<Value> = vec![Value::from(addon_name.to_string())];
        if let Some(log_type) = log_type {
            query.push_str(" AND type = ?");
            args.push(Value::from(log_type.as_str().to_string()));
        }
        query.push_str(" ORDER BY created_at DESC, id DESC LIMIT ?");
        args.push(Value::from(i64::try_from(limit).unwrap_or(i64::MAX)));

        let mut stmt = self
            .conn
            .prepare(&query)
            .context("failed to prepare log listing")?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), scan_log_row)
            .with_context(|| format!("failed to list logs for addon '{addon_name}'"))?;
        let mut logs = Vec::new();
        for row in rows {
            logs.push(row.context("failed to read log row")?);
        }
        Ok(logs)
    }
}
