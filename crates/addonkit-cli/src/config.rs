use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use addonkit_installer::{default_root, AddonsLayout};
use addonkit_lifecycle::WorkerOptions;
use anyhow::{Context, Result};
use serde::Deserialize;

pub(crate) const CONFIG_FILE_NAME: &str = "addonkit.toml";
pub(crate) const LOG_FILTER_ENV: &str = "ADDONKIT_LOG";
const DEFAULT_LOG_FILTER: &str = "info";

/// `addonkit.toml`. Relative paths are resolved against the root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct AddonsConfig {
    pub(crate) root: Option<PathBuf>,
    pub(crate) database: Option<PathBuf>,
    pub(crate) staging_dir: Option<PathBuf>,
    pub(crate) content_dir: Option<PathBuf>,
    pub(crate) alias_dir: Option<PathBuf>,
    pub(crate) log_filter: Option<String>,
    #[serde(default)]
    pub(crate) worker: WorkerConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct WorkerConfig {
    pub(crate) concurrency: usize,
    pub(crate) max_attempts: u32,
    pub(crate) retry_backoff_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let defaults = WorkerOptions::default();
        Self {
            concurrency: defaults.concurrency,
            max_attempts: defaults.max_attempts,
            retry_backoff_ms: u64::try_from(defaults.retry_backoff.as_millis()).unwrap_or(500),
        }
    }
}

impl AddonsConfig {
    pub(crate) fn from_toml_str(input: &str) -> Result<Self> {
        toml::from_str(input).context("failed to parse addonkit config")
    }

    pub(crate) fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        Self::from_toml_str(&raw)
            .with_context(|| format!("failed to load config: {}", path.display()))
    }

    pub(crate) fn log_filter(&self) -> &str {
        self.log_filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER)
    }

    pub(crate) fn worker_options(&self) -> WorkerOptions {
        WorkerOptions {
            concurrency: self.worker.concurrency.max(1),
            max_attempts: self.worker.max_attempts.max(1),
            retry_backoff: Duration::from_millis(self.worker.retry_backoff_ms),
        }
    }
}

/// Root directory plus the config that applies to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ResolvedConfig {
    pub(crate) root: PathBuf,
    pub(crate) source: Option<PathBuf>,
    pub(crate) config: AddonsConfig,
}

impl ResolvedConfig {
    pub(crate) fn layout(&self) -> AddonsLayout {
        let mut layout = AddonsLayout::new(&self.root);
        if let Some(dir) = &self.config.staging_dir {
            layout = layout.with_staging_dir(self.resolve(dir));
        }
        if let Some(dir) = &self.config.content_dir {
            layout = layout.with_content_dir(self.resolve(dir));
        }
        if let Some(dir) = &self.config.alias_dir {
            layout = layout.with_alias_dir(self.resolve(dir));
        }
        layout
    }

    pub(crate) fn database_path(&self, layout: &AddonsLayout) -> PathBuf {
        match &self.config.database {
            Some(path) => self.resolve(path),
            None => layout.database_path(),
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

/// `root` and `config` arrive from flags or their environment variables.
/// An explicit config may name the root; otherwise `<root>/addonkit.toml`
/// is read when present.
pub(crate) fn resolve_config(root: Option<&Path>, config: Option<&Path>) -> Result<ResolvedConfig> {
    if let Some(path) = config {
        let loaded = AddonsConfig::load(path)?;
        let root = match (root, &loaded.root) {
            (Some(root), _) => root.to_path_buf(),
            (None, Some(root)) => root.clone(),
            (None, None) => default_root()?,
        };
        return Ok(ResolvedConfig {
            root,
            source: Some(path.to_path_buf()),
            config: loaded,
        });
    }

    let root = match root {
        Some(root) => root.to_path_buf(),
        None => default_root()?,
    };
    let candidate = root.join(CONFIG_FILE_NAME);
    if candidate.is_file() {
        let loaded = AddonsConfig::load(&candidate)?;
        return Ok(ResolvedConfig {
            root,
            source: Some(candidate),
            config: loaded,
        });
    }

    Ok(ResolvedConfig {
        root,
        source: None,
        config: AddonsConfig::default(),
    })
}

/// `ADDONKIT_LOG` wins over the config file's `log_filter`.
pub(crate) fn init_tracing(config: &AddonsConfig) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_env(LOG_FILTER_ENV)
        .or_else(|_| EnvFilter::try_new(config.log_filter()))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
