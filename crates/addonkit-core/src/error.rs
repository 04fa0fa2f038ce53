use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::model::{AddonId, VersionId};

#[derive(Debug, Error)]
pub enum AddonError {
    #[error("package archive for addon '{name}' not found in staging: {}", path.display())]
    ArchiveMissing { name: String, path: PathBuf },
    #[error("addon '{0}' is already installed")]
    AlreadyInstalled(String),
    #[error("failed to extract addon package: {0}")]
    ExtractionFailed(String),
    #[error("version content is missing on disk: {}", .0.display())]
    VersionContentMissing(PathBuf),
    #[error("version {version_id} not found for addon {addon_id}")]
    VersionNotFound {
        addon_id: AddonId,
        version_id: VersionId,
    },
    #[error("addon '{0}' not found")]
    AddonNotFound(String),
    #[error("version {0} is already the active version")]
    NoOpSwitch(VersionId),
    #[error("transaction failed: {0}")]
    TransactionFailure(String),
    #[error("dependency install failed: {0}")]
    TaskExecutionFailure(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ArchiveMissing,
    AlreadyInstalled,
    ExtractionFailed,
    VersionContentMissing,
    VersionNotFound,
    AddonNotFound,
    NoOpSwitch,
    TransactionFailure,
    TaskExecutionFailure,
}

impl AddonError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ArchiveMissing { .. } => ErrorKind::ArchiveMissing,
            Self::AlreadyInstalled(_) => ErrorKind::AlreadyInstalled,
            Self::ExtractionFailed(_) => ErrorKind::ExtractionFailed,
            Self::VersionContentMissing(_) => ErrorKind::VersionContentMissing,
            Self::VersionNotFound { .. } => ErrorKind::VersionNotFound,
            Self::AddonNotFound(_) => ErrorKind::AddonNotFound,
            Self::NoOpSwitch(_) => ErrorKind::NoOpSwitch,
            Self::TransactionFailure(_) => ErrorKind::TransactionFailure,
            Self::TaskExecutionFailure(_) => ErrorKind::TaskExecutionFailure,
        }
    }
}

// Lower-level failures never cross the lifecycle boundary raw.
impl From<anyhow::Error> for AddonError {
    fn from(err: anyhow::Error) -> Self {
        Self::TransactionFailure(format!("{err:#}"))
    }
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ArchiveMissing => "archive_missing",
            Self::AlreadyInstalled => "already_installed",
            Self::ExtractionFailed => "extraction_failed",
            Self::VersionContentMissing => "version_content_missing",
            Self::VersionNotFound => "version_not_found",
            Self::AddonNotFound => "addon_not_found",
            Self::NoOpSwitch => "noop_switch",
            Self::TransactionFailure => "transaction_failure",
            Self::TaskExecutionFailure => "task_execution_failure",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a presentation layer needs to render the result of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationOutcome {
    pub ok: bool,
    pub error_kind: Option<ErrorKind>,
    pub message: String,
}

impl OperationOutcome {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            error_kind: None,
            message: message.into(),
        }
    }

    pub fn failure(err: &AddonError) -> Self {
        Self {
            ok: false,
            error_kind: Some(err.kind()),
            message: err.to_string(),
        }
    }
}
