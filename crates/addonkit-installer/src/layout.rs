use std::fs;
use std::path::{Path, PathBuf};

use addonkit_core::ArchiveType;
use anyhow::{Context, Result};

/// Every path the lifecycle touches, derived from one root unless a
/// directory is overridden explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddonsLayout {
    root: PathBuf,
    staging_dir: PathBuf,
    content_dir: PathBuf,
    alias_dir: PathBuf,
}

impl AddonsLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            staging_dir: root.join("staging"),
            content_dir: root.join("content"),
            alias_dir: root.join("addons"),
            root,
        }
    }

    pub fn with_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = dir.into();
        self
    }

    pub fn with_content_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.content_dir = dir.into();
        self
    }

    pub fn with_alias_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.alias_dir = dir.into();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    pub fn content_dir(&self) -> &Path {
        &self.content_dir
    }

    pub fn alias_dir(&self) -> &Path {
        &self.alias_dir
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn tmp_state_dir(&self) -> PathBuf {
        self.state_dir().join("tmp")
    }

    pub fn operations_dir(&self) -> PathBuf {
        self.state_dir().join("operations")
    }

    pub fn database_path(&self) -> PathBuf {
        self.state_dir().join("addons.sqlite3")
    }

    pub fn staged_archive_path(&self, name: &str, archive_type: ArchiveType) -> PathBuf {
        self.staging_dir
            .join(format!("{name}.{}", archive_type.file_extension()))
    }

    pub fn version_content_dir(&self, name: &str, version: &str) -> PathBuf {
        self.content_dir.join(name).join(version)
    }

    pub fn alias_path(&self, name: &str) -> PathBuf {
        self.alias_dir.join(name)
    }

    pub fn operation_metadata_path(&self, txid: &str) -> PathBuf {
        self.operations_dir().join(format!("{txid}.json"))
    }

    pub fn operation_journal_path(&self, txid: &str) -> PathBuf {
        self.operations_dir().join(format!("{txid}.journal"))
    }

    pub fn ensure_base_dirs(&self) -> Result<()> {
        for dir in [
            self.staging_dir.clone(),
            self.content_dir.clone(),
            self.alias_dir.clone(),
            self.state_dir(),
            self.tmp_state_dir(),
            self.operations_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

pub fn default_root() -> Result<PathBuf> {
    if cfg!(windows) {
        let app_data = std::env::var("LOCALAPPDATA")
            .context("LOCALAPPDATA is not set; cannot resolve Windows addon root")?;
        return Ok(PathBuf::from(app_data).join("addonkit"));
    }

    let home = std::env::var("HOME").context("HOME is not set; cannot resolve addon root")?;
    Ok(PathBuf::from(home).join(".addonkit"))
}
