use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use addonkit_core::LifecycleState;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::AddonsLayout;

const RECORD_FORMAT_VERSION: u32 = 1;

static TXID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Snapshot of one lifecycle operation, rewritten on every transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub version: u32,
    pub txid: String,
    pub operation: String,
    pub addon: String,
    pub state: String,
    pub started_at_unix: u64,
    pub updated_at_unix: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub seq: u64,
    pub state: String,
    pub at_unix: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Per-operation state trail under `state/operations`. There is no global
/// active marker: operations on different addons journal independently.
#[derive(Debug)]
pub struct OperationJournal {
    layout: AddonsLayout,
    record: OperationRecord,
    seq: u64,
}

impl OperationJournal {
    pub fn begin(layout: &AddonsLayout, operation: &str, addon: &str) -> Result<Self> {
        let started_at_unix = current_unix_timestamp()?;
        let txid = format!(
            "op-{started_at_unix}-{}-{}",
            std::process::id(),
            TXID_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let mut journal = Self {
            layout: layout.clone(),
            record: OperationRecord {
                version: RECORD_FORMAT_VERSION,
                txid,
                operation: operation.to_string(),
                addon: addon.to_string(),
                state: LifecycleState::Idle.as_str().to_string(),
                started_at_unix,
                updated_at_unix: started_at_unix,
                error: None,
            },
            seq: 0,
        };
        journal.write_record()?;
        Ok(journal)
    }

    pub fn txid(&self) -> &str {
        &self.record.txid
    }

    pub fn state(&self) -> &str {
        &self.record.state
    }

    pub fn transition(&mut self, state: LifecycleState, detail: Option<&str>) -> Result<()> {
        let now = current_unix_timestamp()?;
        self.seq += 1;
        self.record.state = state.as_str().to_string();
        self.record.updated_at_unix = now;
        if state == LifecycleState::RolledBack {
            self.record.error = detail.map(str::to_string);
        }
        self.append_entry(&JournalEntry {
            seq: self.seq,
            state: state.as_str().to_string(),
            at_unix: now,
            detail: detail.map(str::to_string),
        })?;
        self.write_record()
    }

    fn write_record(&self) -> Result<()> {
        let path = self.layout.operation_metadata_path(&self.record.txid);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let payload = serde_json::to_vec_pretty(&self.record)
            .context("failed to serialize operation record")?;
        fs::write(&path, payload)
            .with_context(|| format!("failed to write operation record: {}", path.display()))
    }

    fn append_entry(&self, entry: &JournalEntry) -> Result<PathBuf> {
        let path = self.layout.operation_journal_path(&self.record.txid);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let mut line =
            serde_json::to_string(entry).context("failed to serialize journal entry")?;
        line.push('\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open operation journal: {}", path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("failed to append operation journal: {}", path.display()))?;
        file.flush()
            .with_context(|| format!("failed to flush operation journal: {}", path.display()))?;
        Ok(path)
    }
}

pub fn read_operation_record(
    layout: &AddonsLayout,
    txid: &str,
) -> Result<Option<OperationRecord>> {
    let path = layout.operation_metadata_path(txid);
    let raw = match fs::read(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| {
                format!("failed to read operation record: {}", path.display())
            });
        }
    };
    let record = serde_json::from_slice(&raw)
        .with_context(|| format!("failed parsing operation record: {}", path.display()))?;
    Ok(Some(record))
}

/// Records whose last state is not terminal: the process stopped mid-way and
/// the filesystem may disagree with the database.
pub fn list_unfinished_operations(layout: &AddonsLayout) -> Result<Vec<OperationRecord>> {
    let dir = layout.operations_dir();
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut unfinished = Vec::new();
    for entry in fs::read_dir(&dir)
        .with_context(|| format!("failed to read operations directory: {}", dir.display()))?
    {
        let path = entry?.path();
        if path.extension().and_then(|value| value.to_str()) != Some("json") {
            continue;
        }
        let Some(txid) = path.file_stem().and_then(|value| value.to_str()) else {
            continue;
        };
        let Some(record) = read_operation_record(layout, txid)? else {
            continue;
        };
        let terminal = LifecycleState::parse(&record.state)
            .map(LifecycleState::is_terminal)
            .unwrap_or(false);
        if !terminal {
            unfinished.push(record);
        }
    }

    unfinished.sort_by(|a, b| a.txid.cmp(&b.txid));
    Ok(unfinished)
}

fn current_unix_timestamp() -> Result<u64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system time is before unix epoch")?
        .as_secs())
}
