//! Decides whether a recipe is already materialized in a prefix.
//!
//! A recipe counts as installed only when both signals agree: the package
//! manager lists it and its storage directory holds files.

use serde::Serialize;
use tracing::debug;

use crate::domain::{InstallTarget, InstalledRecord, PackageRecord};
use crate::error::GgdError;
use crate::package_manager::PackageManager;
use crate::store::Store;
use crate::sync::storage_belongs_to;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum InstallState {
    NotInstalled,
    InstalledExactVersion(InstalledRecord),
    InstalledDifferentVersion {
        installed_version: String,
    },
    Inconsistent {
        directory_present: bool,
        record_present: bool,
        detail: String,
    },
}

/// Read-only. The store was opened on the target prefix, which validates it.
pub fn inspect<P: PackageManager + ?Sized>(
    store: &Store,
    package_manager: &P,
    target: &InstallTarget,
) -> Result<InstallState, GgdError> {
    let recipe = &target.recipe;
    let storage_name = target.storage_name();
    let versions = store.version_dirs(&recipe.species, &recipe.genome_build, &storage_name)?;
    let record = find_record(
        package_manager.list_installed(store.prefix())?,
        target.package_name(),
    );
    debug!(
        recipe = %storage_name,
        versions = ?versions,
        record = ?record.as_ref().map(|record| &record.version),
        "inspected prefix"
    );

    let state = match record {
        Some(record) if versions.contains(&record.version) => {
            if target.requested_version.matches(&record.version) {
                let directory_path = store.version_dir(
                    &recipe.species,
                    &recipe.genome_build,
                    &storage_name,
                    &record.version,
                );
                let files = Store::list_files(&directory_path)?;
                InstallState::InstalledExactVersion(InstalledRecord {
                    directory_path,
                    files,
                    package_record: record,
                })
            } else {
                InstallState::InstalledDifferentVersion {
                    installed_version: record.version,
                }
            }
        }
        Some(record)
            if recipe.is_meta_recipe()
                && versions.is_empty()
                && other_instance_holds(store, target, &record.version)? =>
        {
            debug!(recipe = %storage_name, "package record belongs to another instance");
            InstallState::NotInstalled
        }
        Some(record) => InstallState::Inconsistent {
            directory_present: !versions.is_empty(),
            record_present: true,
            detail: format!(
                "package manager lists version {} but its data directory is missing or empty",
                record.version
            ),
        },
        None if !versions.is_empty() => InstallState::Inconsistent {
            directory_present: true,
            record_present: false,
            detail: format!(
                "data directory present for version(s) {} but the package manager has no record",
                versions.join(", ")
            ),
        },
        None => InstallState::NotInstalled,
    };
    Ok(state)
}

/// Meta-recipe instances share one package record. Another instance with
/// data for the recorded version means the record is accounted for.
fn other_instance_holds(
    store: &Store,
    target: &InstallTarget,
    version: &str,
) -> Result<bool, GgdError> {
    let storage_name = target.storage_name();
    Ok(store.stored_recipes()?.iter().any(|stored| {
        stored.name != storage_name
            && storage_belongs_to(&stored.name, target.package_name())
            && stored.versions.iter().any(|held| held == version)
    }))
}

pub fn find_record(records: Vec<PackageRecord>, name: &str) -> Option<PackageRecord> {
    records.into_iter().find(|record| record.name == name)
}
