use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};

use addonkit_core::ArchiveType;
use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha256};

/// Filesystem primitives the lifecycle needs for activation aliases and
/// content directories. Injected so failures can be simulated in tests.
pub trait AddonFs: Send + Sync {
    /// Follows links; a dangling alias reports `false`.
    fn exists(&self, path: &Path) -> bool;

    /// Does not follow links; a dangling alias reports `true`.
    fn alias_exists(&self, path: &Path) -> bool;

    fn create_dir_all(&self, path: &Path) -> Result<()>;

    /// Removes a link, file or directory tree at `path`. Links are removed
    /// themselves, never their targets. Missing paths are not an error.
    fn remove_tree(&self, path: &Path) -> Result<()>;

    fn create_alias(&self, target: &Path, link: &Path) -> Result<()>;

    fn read_alias(&self, link: &Path) -> Result<Option<PathBuf>>;
}

/// Access to staged package archives.
pub trait ArchiveStore: Send + Sync {
    fn exists(&self, archive_path: &Path) -> bool;

    fn checksum_sha256(&self, archive_path: &Path) -> Result<String>;

    /// Unpacks `archive_path` so that `dest_dir` holds the package contents.
    /// An existing `dest_dir` is replaced.
    fn extract(&self, archive_path: &Path, archive_type: ArchiveType, dest_dir: &Path)
        -> Result<()>;
}

/// The real filesystem. Extraction shells out to `unzip`/`tar` and stages
/// into `scratch_dir` before moving the result into place.
#[derive(Debug, Clone)]
pub struct LocalFs {
    scratch_dir: PathBuf,
}

static SCRATCH_COUNTER: AtomicU64 = AtomicU64::new(0);

impl LocalFs {
    pub fn new(scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            scratch_dir: scratch_dir.into(),
        }
    }

    fn make_scratch_dir(&self, prefix: &str) -> Result<PathBuf> {
        let mut dir = self.scratch_dir.clone();
        dir.push(format!(
            "{}-{}-{}",
            prefix,
            std::process::id(),
            SCRATCH_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .with_context(|| format!("failed to clear scratch dir: {}", dir.display()))?;
        }
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed creating scratch dir: {}", dir.display()))?;
        Ok(dir)
    }
}

impl AddonFs for LocalFs {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn alias_exists(&self, path: &Path) -> bool {
        fs::symlink_metadata(path).is_ok()
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path).with_context(|| format!("failed to create {}", path.display()))
    }

    fn remove_tree(&self, path: &Path) -> Result<()> {
        let metadata = match fs::symlink_metadata(path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to stat {}", path.display()))
            }
        };

        if metadata.file_type().is_symlink() {
            return remove_link(path);
        }
        if metadata.is_dir() {
            return fs::remove_dir_all(path)
                .with_context(|| format!("failed to remove directory {}", path.display()));
        }
        fs::remove_file(path).with_context(|| format!("failed to remove {}", path.display()))
    }

    fn create_alias(&self, target: &Path, link: &Path) -> Result<()> {
        create_link(target, link)
    }

    fn read_alias(&self, link: &Path) -> Result<Option<PathBuf>> {
        match fs::read_link(link) {
            Ok(target) => Ok(Some(target)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) if err.kind() == io::ErrorKind::InvalidInput => Err(anyhow!(
                "alias path exists but is not a link: {}",
                link.display()
            )),
            Err(err) => {
                Err(err).with_context(|| format!("failed to read alias {}", link.display()))
            }
        }
    }
}

impl ArchiveStore for LocalFs {
    fn exists(&self, archive_path: &Path) -> bool {
        archive_path.is_file()
    }

    fn checksum_sha256(&self, archive_path: &Path) -> Result<String> {
        let mut file = fs::File::open(archive_path)
            .with_context(|| format!("failed to open archive {}", archive_path.display()))?;
        let mut hasher = Sha256::new();
        io::copy(&mut file, &mut hasher)
            .with_context(|| format!("failed to hash archive {}", archive_path.display()))?;
        Ok(hex::encode(hasher.finalize()))
    }

    fn extract(
        &self,
        archive_path: &Path,
        archive_type: ArchiveType,
        dest_dir: &Path,
    ) -> Result<()> {
        let scratch = self.make_scratch_dir("extract")?;
        let result = (|| -> Result<()> {
            let raw_dir = scratch.join("raw");
            fs::create_dir_all(&raw_dir)
                .with_context(|| format!("failed to create {}", raw_dir.display()))?;

            match archive_type {
                ArchiveType::Zip => extract_zip(archive_path, &raw_dir)?,
                ArchiveType::TarGz => extract_tar(archive_path, &raw_dir, true)?,
                ArchiveType::Tar => extract_tar(archive_path, &raw_dir, false)?,
            }

            let payload_root = single_directory_root(&raw_dir)?.unwrap_or(raw_dir);
            if is_dir_empty(&payload_root)? {
                return Err(anyhow!(
                    "archive {} contains no files",
                    archive_path.display()
                ));
            }

            if dest_dir.exists() {
                fs::remove_dir_all(dest_dir).with_context(|| {
                    format!("failed to remove existing content dir: {}", dest_dir.display())
                })?;
            }
            move_dir_or_copy(&payload_root, dest_dir)
        })();

        let _ = fs::remove_dir_all(&scratch);
        result
    }
}

fn remove_link(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        // Windows directory symlinks are removed as directories.
        Err(_) if cfg!(windows) => fs::remove_dir(path)
            .with_context(|| format!("failed to remove alias {}", path.display())),
        Err(err) => Err(err).with_context(|| format!("failed to remove alias {}", path.display())),
    }
}

fn create_link(target: &Path, link: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(target, link).with_context(|| {
            format!(
                "failed to create alias {} -> {}",
                link.display(),
                target.display()
            )
        })
    }

    #[cfg(windows)]
    {
        std::os::windows::fs::symlink_dir(target, link).with_context(|| {
            format!(
                "failed to create alias {} -> {}",
                link.display(),
                target.display()
            )
        })
    }
}

fn single_directory_root(dir: &Path) -> Result<Option<PathBuf>> {
    let mut entries = fs::read_dir(dir)
        .with_context(|| format!("failed to read {}", dir.display()))?
        .collect::<io::Result<Vec<_>>>()
        .with_context(|| format!("failed to read {}", dir.display()))?;
    if entries.len() != 1 {
        return Ok(None);
    }
    let Some(entry) = entries.pop() else {
        return Ok(None);
    };
    if entry.file_type()?.is_dir() {
        return Ok(Some(entry.path()));
    }
    Ok(None)
}

fn is_dir_empty(dir: &Path) -> Result<bool> {
    Ok(fs::read_dir(dir)
        .with_context(|| format!("failed to read {}", dir.display()))?
        .next()
        .is_none())
}

fn extract_tar(archive_path: &Path, dst: &Path, gzip: bool) -> Result<()> {
    let flags = if gzip { "-xzf" } else { "-xf" };
    let mut tar = Command::new("tar");
    tar.arg(flags).arg(archive_path).arg("-C").arg(dst);
    run_extractor(&mut tar, "tar")
}

/// Tries each zip extractor available on the host in turn and reports the
/// last failure when none succeeds.
fn extract_zip(archive_path: &Path, dst: &Path) -> Result<()> {
    let mut attempts: Vec<(&str, Command)> = Vec::new();
    if cfg!(windows) {
        let mut expand = Command::new("powershell");
        expand.arg("-NoProfile").arg("-Command").arg(format!(
            "Expand-Archive -LiteralPath '{}' -DestinationPath '{}' -Force",
            ps_quote(archive_path),
            ps_quote(dst)
        ));
        attempts.push(("powershell Expand-Archive", expand));
    }
    let mut unzip = Command::new("unzip");
    unzip.arg("-q").arg("-o").arg(archive_path).arg("-d").arg(dst);
    attempts.push(("unzip", unzip));
    let mut tar = Command::new("tar");
    tar.arg("-xf").arg(archive_path).arg("-C").arg(dst);
    attempts.push(("tar", tar));

    let mut last_error = anyhow!("no zip extractor available");
    for (tool, mut command) in attempts {
        match run_extractor(&mut command, tool) {
            Ok(()) => return Ok(()),
            Err(err) => last_error = err,
        }
    }
    Err(last_error)
}

fn run_extractor(command: &mut Command, tool: &str) -> Result<()> {
    let output = command
        .output()
        .with_context(|| format!("could not start {tool}"))?;
    if output.status.success() {
        return Ok(());
    }
    Err(anyhow!(
        "{tool} exited with {}: {}",
        output.status,
        String::from_utf8_lossy(&output.stderr).trim()
    ))
}

/// Moves the finished extraction into place; falls back to copying when the
/// scratch dir sits on another filesystem.
fn move_dir_or_copy(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create content parent: {}", parent.display()))?;
    }
    if fs::rename(src, dst).is_ok() {
        return Ok(());
    }

    copy_tree(src, dst)?;
    fs::remove_dir_all(src)
        .with_context(|| format!("failed to clean up scratch dir: {}", src.display()))
}

fn copy_tree(src_root: &Path, dst_root: &Path) -> Result<()> {
    let mut pending = vec![(src_root.to_path_buf(), dst_root.to_path_buf())];
    while let Some((src, dst)) = pending.pop() {
        fs::create_dir_all(&dst)
            .with_context(|| format!("failed to create content dir {}", dst.display()))?;
        let entries = fs::read_dir(&src)
            .with_context(|| format!("failed to list extracted dir {}", src.display()))?;
        for entry in entries {
            let entry = entry?;
            let from = entry.path();
            let to = dst.join(entry.file_name());
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                pending.push((from, to));
            } else if file_type.is_symlink() {
                let target = fs::read_link(&from)
                    .with_context(|| format!("failed to read link {}", from.display()))?;
                create_link(&target, &to)?;
            } else {
                fs::copy(&from, &to).with_context(|| {
                    format!("failed to copy {} into {}", from.display(), to.display())
                })?;
            }
        }
    }
    Ok(())
}

fn ps_quote(path: &Path) -> String {
    path.display().to_string().replace('\'', "''")
}
