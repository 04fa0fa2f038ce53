use std::path::PathBuf;

use anyhow::{anyhow, Result};

pub type AddonId = i64;
pub type VersionId = i64;

/// Author recorded for addons installed from a local upload.
pub const DEFAULT_AUTHOR: &str = "local install";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Addon {
    pub id: AddonId,
    pub name: String,
    pub thumb: String,
    pub author: String,
    /// Activation alias; always a symlink to the active version's content.
    pub path: PathBuf,
    /// Content path of the active version at the time of the last write.
    pub real_path: PathBuf,
    pub current_version_id: Option<VersionId>,
    pub prev_version_id: Option<VersionId>,
    pub created_at_unix: u64,
    pub updated_at_unix: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAddon {
    pub name: String,
    pub thumb: String,
    pub author: String,
    pub path: PathBuf,
    pub real_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddonVersion {
    pub id: VersionId,
    pub addon_id: AddonId,
    /// Opaque release label; never parsed or compared as semver.
    pub version: String,
    pub path: PathBuf,
    pub archive_sha256: Option<String>,
    pub created_at_unix: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddonLog {
    pub id: i64,
    pub addon_id: Option<AddonId>,
    pub addon_name: String,
    pub log_type: LogType,
    pub status: LogStatus,
    pub message: String,
    pub created_at_unix: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogType {
    Install,
    Switch,
    DependencyInstall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogStatus {
    Success,
    Failure,
}

impl LogType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Switch => "switch",
            Self::DependencyInstall => "dependency_install",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "install" => Ok(Self::Install),
            "switch" => Ok(Self::Switch),
            "dependency_install" | "dependency-install" | "deps" => Ok(Self::DependencyInstall),
            _ => Err(anyhow!("invalid addon log type: {value}")),
        }
    }
}

impl LogStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            _ => Err(anyhow!("invalid addon log status: {value}")),
        }
    }

    pub fn from_ok(ok: bool) -> Self {
        if ok {
            Self::Success
        } else {
            Self::Failure
        }
    }
}

impl Addon {
    pub fn is_current(&self, version_id: VersionId) -> bool {
        self.current_version_id == Some(version_id)
    }
}

/// Stages a lifecycle operation moves through. `Committed` and `RolledBack`
/// are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Idle,
    Validating,
    Extracting,
    Persisting,
    Activating,
    Committed,
    RolledBack,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Validating => "validating",
            Self::Extracting => "extracting",
            Self::Persisting => "persisting",
            Self::Activating => "activating",
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "idle" => Ok(Self::Idle),
            "validating" => Ok(Self::Validating),
            "extracting" => Ok(Self::Extracting),
            "persisting" => Ok(Self::Persisting),
            "activating" => Ok(Self::Activating),
            "committed" => Ok(Self::Committed),
            "rolled_back" => Ok(Self::RolledBack),
            _ => Err(anyhow!("invalid lifecycle state: {value}")),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }
}
