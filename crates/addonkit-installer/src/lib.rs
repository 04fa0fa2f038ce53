mod activation;
mod archive;
mod fs;
mod journal;
mod layout;

pub use activation::ActivationSwitch;
pub use archive::{validate_component, ArchiveInstaller, ExtractedVersion, StagedArchive};
pub use fs::{AddonFs, ArchiveStore, LocalFs};
pub use journal::{
    list_unfinished_operations, read_operation_record, JournalEntry, OperationJournal,
    OperationRecord,
};
pub use layout::{default_root, AddonsLayout};
