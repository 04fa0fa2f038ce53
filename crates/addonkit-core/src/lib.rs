mod archive;
mod error;
mod manifest;
mod model;

pub use archive::ArchiveType;
pub use error::{AddonError, ErrorKind, OperationOutcome};
pub use manifest::{AddonManifest, DependencySpec, ADDON_MANIFEST_FILE};
pub use model::{
    Addon, AddonId, AddonLog, AddonVersion, LifecycleState, LogStatus, LogType, NewAddon,
    VersionId, DEFAULT_AUTHOR,
};
