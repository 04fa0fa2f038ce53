use std::fmt;
use std::path::PathBuf;

use addonkit_core::AddonError;
use addonkit_installer::{list_unfinished_operations, OperationRecord};
use tracing::warn;

use crate::AddonManager;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsistencyProblem {
    /// The database records an active version but no alias exists.
    AliasMissing { alias: PathBuf },
    /// The alias resolves somewhere other than the active version's content.
    AliasMismatch {
        alias: PathBuf,
        expected: PathBuf,
        actual: PathBuf,
    },
    /// The active version's content directory is gone.
    ContentMissing { path: PathBuf },
    /// `current_version_id` is unset or names no stored version.
    NoActiveVersion,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsistencyIssue {
    pub addon: String,
    pub problem: ConsistencyProblem,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsistencyReport {
    pub checked_addons: usize,
    pub issues: Vec<ConsistencyIssue>,
    pub unfinished_operations: Vec<OperationRecord>,
}

impl ConsistencyReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty() && self.unfinished_operations.is_empty()
    }
}

impl fmt::Display for ConsistencyProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AliasMissing { alias } => write!(f, "alias {} is missing", alias.display()),
            Self::AliasMismatch {
                alias,
                expected,
                actual,
            } => write!(
                f,
                "alias {} points to {} instead of {}",
                alias.display(),
                actual.display(),
                expected.display()
            ),
            Self::ContentMissing { path } => {
                write!(f, "active content {} is missing", path.display())
            }
            Self::NoActiveVersion => f.write_str("no active version recorded"),
        }
    }
}

impl AddonManager {
    /// Compares every addon's recorded active version with what is on disk.
    /// Read-only: nothing is repaired.
    pub fn check_consistency(&self) -> Result<ConsistencyReport, AddonError> {
        let db = self.store().open()?;
        let addons = db.addons().list()?;
        let mut report = ConsistencyReport {
            checked_addons: addons.len(),
            ..ConsistencyReport::default()
        };

        for addon in addons {
            let current = match addon.current_version_id {
                Some(version_id) => db.versions().get_for_addon(addon.id, version_id)?,
                None => None,
            };
            let mut problems = Vec::new();
            match current {
                None => problems.push(ConsistencyProblem::NoActiveVersion),
                Some(version) => {
                    if !self.content_exists(&version.path) {
                        problems.push(ConsistencyProblem::ContentMissing {
                            path: version.path.clone(),
                        });
                    }
                    match self.alias_target(&addon.path) {
                        Ok(None) => problems.push(ConsistencyProblem::AliasMissing {
                            alias: addon.path.clone(),
                        }),
                        Ok(Some(actual)) if actual != version.path => {
                            problems.push(ConsistencyProblem::AliasMismatch {
                                alias: addon.path.clone(),
                                expected: version.path,
                                actual,
                            });
                        }
                        Ok(Some(_)) => {}
                        Err(err) => {
                            warn!(addon = %addon.name, error = %err, "could not read alias");
                            problems.push(ConsistencyProblem::AliasMismatch {
                                alias: addon.path.clone(),
                                expected: version.path,
                                actual: addon.path.clone(),
                            });
                        }
                    }
                }
            }
            for problem in problems {
                warn!(addon = %addon.name, %problem, "addon state is inconsistent");
                report.issues.push(ConsistencyIssue {
                    addon: addon.name.clone(),
                    problem,
                });
            }
        }

        report.unfinished_operations = list_unfinished_operations(self.layout())?;
        Ok(report)
    }
}
