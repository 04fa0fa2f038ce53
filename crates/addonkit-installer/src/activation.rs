use std::path::{Path, PathBuf};
use std::sync::Arc;

use addonkit_core::AddonError;
use anyhow::Context;
use tracing::{debug, info};

use crate::AddonFs;

/// Repoints an addon's activation alias. Touches the filesystem only; the
/// caller owns the matching database update.
#[derive(Clone)]
pub struct ActivationSwitch {
    fs: Arc<dyn AddonFs>,
}

impl ActivationSwitch {
    pub fn new(fs: Arc<dyn AddonFs>) -> Self {
        Self { fs }
    }

    /// Makes `alias` resolve to `target`, replacing whatever alias (or
    /// directory) was there. Activating the current target again is a no-op
    /// in effect.
    pub fn activate(&self, alias: &Path, target: &Path) -> Result<(), AddonError> {
        if !self.fs.exists(target) {
            return Err(AddonError::VersionContentMissing(target.to_path_buf()));
        }

        if let Some(parent) = alias.parent() {
            self.fs.create_dir_all(parent)?;
        }
        if self.fs.alias_exists(alias) {
            debug!(alias = %alias.display(), "removing previous activation alias");
            self.fs
                .remove_tree(alias)
                .with_context(|| format!("failed to clear alias {}", alias.display()))?;
        }
        self.fs.create_alias(target, alias)?;

        info!(alias = %alias.display(), target = %target.display(), "activated addon version");
        Ok(())
    }

    pub fn deactivate(&self, alias: &Path) -> Result<(), AddonError> {
        if self.fs.alias_exists(alias) {
            self.fs
                .remove_tree(alias)
                .with_context(|| format!("failed to remove alias {}", alias.display()))?;
            info!(alias = %alias.display(), "removed activation alias");
        }
        Ok(())
    }

    pub fn current_target(&self, alias: &Path) -> Result<Option<PathBuf>, AddonError> {
        if !self.fs.alias_exists(alias) {
            return Ok(None);
        }
        Ok(self.fs.read_alias(alias)?)
    }

    pub fn content_exists(&self, path: &Path) -> bool {
        self.fs.exists(path)
    }
}
