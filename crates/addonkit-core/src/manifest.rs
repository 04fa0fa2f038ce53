use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};

/// File an addon may ship at its content root to describe itself.
pub const ADDON_MANIFEST_FILE: &str = "addon.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddonManifest {
    pub name: Option<String>,
    pub author: Option<String>,
    pub thumb: Option<String>,
    pub dependencies: Option<DependencySpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DependencySpec {
    #[serde(default)]
    pub command: Vec<String>,
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl AddonManifest {
    pub fn from_toml_str(input: &str) -> anyhow::Result<Self> {
        let manifest: Self = toml::from_str(input).context("failed to parse addon manifest")?;
        if let Some(name) = &manifest.name {
            if name.trim().is_empty() {
                return Err(anyhow!("addon manifest name must not be empty"));
            }
        }
        if let Some(dependencies) = &manifest.dependencies {
            if let Some(program) = dependencies.command.first() {
                if program.trim().is_empty() {
                    return Err(anyhow!("dependency command program must not be empty"));
                }
            }
            if let Some(dir) = &dependencies.working_dir {
                validate_relative_dir(dir)
                    .with_context(|| format!("invalid dependency working_dir '{dir}'"))?;
            }
        }
        Ok(manifest)
    }

    /// Reads `addon.toml` below `root`; a missing file is not an error.
    pub fn read_from_dir(root: &Path) -> anyhow::Result<Option<Self>> {
        let path = root.join(ADDON_MANIFEST_FILE);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read addon manifest: {}", path.display()))
            }
        };
        let manifest = Self::from_toml_str(&raw)
            .with_context(|| format!("failed to load addon manifest: {}", path.display()))?;
        Ok(Some(manifest))
    }

    pub fn dependency_command(&self) -> Option<&DependencySpec> {
        self.dependencies
            .as_ref()
            .filter(|spec| !spec.command.is_empty())
    }
}

impl DependencySpec {
    pub fn resolve_working_dir(&self, addon_root: &Path) -> PathBuf {
        match &self.working_dir {
            Some(dir) => addon_root.join(dir),
            None => addon_root.to_path_buf(),
        }
    }
}

fn validate_relative_dir(dir: &str) -> anyhow::Result<()> {
    let path = Path::new(dir);
    if path.is_absolute() {
        return Err(anyhow!("working_dir must be relative"));
    }
    if path
        .components()
        .any(|component| matches!(component, Component::ParentDir | Component::Prefix(_)))
    {
        return Err(anyhow!("working_dir must stay inside the addon root"));
    }
    Ok(())
}
