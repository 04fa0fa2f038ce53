use std::path::{Path, PathBuf};
use std::sync::Arc;

use addonkit_core::{AddonError, ArchiveType};
use tracing::{debug, info};

use crate::{AddonsLayout, ArchiveStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedArchive {
    pub path: PathBuf,
    pub archive_type: ArchiveType,
}

/// A version whose content now sits in its versioned content directory.
/// Nothing has been recorded in the database yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedVersion {
    pub name: String,
    pub version: String,
    pub path: PathBuf,
    pub archive_path: PathBuf,
    pub archive_sha256: String,
}

/// Validates and unpacks uploaded packages into `<content>/<name>/<version>`.
#[derive(Clone)]
pub struct ArchiveInstaller {
    layout: AddonsLayout,
    archives: Arc<dyn ArchiveStore>,
}

impl ArchiveInstaller {
    pub fn new(layout: AddonsLayout, archives: Arc<dyn ArchiveStore>) -> Self {
        Self { layout, archives }
    }

    /// Finds the staged upload for `name`, probing each supported archive
    /// extension in [`ArchiveType::STAGING_ORDER`].
    pub fn find_staged(&self, name: &str) -> Result<StagedArchive, AddonError> {
        validate_component("addon name", name)?;
        for archive_type in ArchiveType::STAGING_ORDER {
            let path = self.layout.staged_archive_path(name, archive_type);
            if self.archives.exists(&path) {
                return Ok(StagedArchive { path, archive_type });
            }
        }
        Err(AddonError::ArchiveMissing {
            name: name.to_string(),
            path: self.layout.staged_archive_path(name, ArchiveType::Zip),
        })
    }

    /// Extracts the staged upload for `name` as `version`. Re-running with
    /// the same pair replaces the previous extraction.
    pub fn install(&self, name: &str, version: &str) -> Result<ExtractedVersion, AddonError> {
        validate_component("version label", version)?;
        let staged = self.find_staged(name)?;
        self.extract(name, version, &staged)
    }

    pub fn extract(
        &self,
        name: &str,
        version: &str,
        staged: &StagedArchive,
    ) -> Result<ExtractedVersion, AddonError> {
        validate_component("addon name", name)?;
        validate_component("version label", version)?;

        if !self.archives.exists(&staged.path) {
            return Err(AddonError::ArchiveMissing {
                name: name.to_string(),
                path: staged.path.clone(),
            });
        }

        let archive_sha256 = self
            .archives
            .checksum_sha256(&staged.path)
            .map_err(|err| AddonError::ExtractionFailed(format!("{err:#}")))?;

        let dest = self.layout.version_content_dir(name, version);
        debug!(
            addon = %name,
            %version,
            archive = %staged.path.display(),
            dest = %dest.display(),
            "extracting addon package"
        );
        self.archives
            .extract(&staged.path, staged.archive_type, &dest)
            .map_err(|err| AddonError::ExtractionFailed(format!("{err:#}")))?;

        info!(addon = %name, %version, sha256 = %archive_sha256, "extracted addon package");
        Ok(ExtractedVersion {
            name: name.to_string(),
            version: version.to_string(),
            path: dest,
            archive_path: staged.path.clone(),
            archive_sha256,
        })
    }
}

/// Names and version labels become single path components; reject anything
/// that could escape or hide inside the content tree.
pub fn validate_component(what: &str, value: &str) -> Result<(), AddonError> {
    let trimmed = value.trim();
    let problem = if trimmed.is_empty() {
        Some("must not be empty")
    } else if trimmed != value {
        Some("must not have surrounding whitespace")
    } else if value.starts_with('.') {
        Some("must not start with '.'")
    } else if value.contains(['/', '\\', '\0']) {
        Some("must not contain path separators")
    } else if Path::new(value).components().count() != 1 {
        Some("must be a single path component")
    } else {
        None
    };

    match problem {
        Some(problem) => Err(AddonError::ExtractionFailed(format!(
            "{what} '{value}' {problem}"
        ))),
        None => Ok(()),
    }
}
