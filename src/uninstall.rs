//! Uninstall as an explicit sequence of states.
//!
//! `Requested -> CatalogResolved -> ExternalRecordRemoved -> ResidueCleaned
//! -> MetadataSynced -> Done`. Only a package manager removal error stops
//! the sequence; everything after it is best effort.

use serde::Serialize;
use tracing::{info, warn};

use crate::catalog::Catalog;
use crate::cleanup::{CleanupReport, CleanupScope, CleanupTarget, cleanup};
use crate::domain::{RecipeDescriptor, RecipeName};
use crate::error::GgdError;
use crate::package_manager::{PackageManager, RemoveOutcome};
use crate::store::Store;
use crate::sync::{SyncChange, apply_env_changes, rebuild_mirror, storage_belongs_to};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UninstallState {
    Requested,
    CatalogResolved,
    ExternalRecordRemoved,
    ResidueCleaned,
    MetadataSynced,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UninstallStatus {
    Removed,
    /// Nothing of the recipe was found in the prefix.
    NotInstalled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UninstallOutcome {
    pub name: String,
    pub status: UninstallStatus,
    pub in_catalog: bool,
    pub package_record: RemoveOutcome,
    pub cleanup: CleanupReport,
    pub states: Vec<UninstallState>,
}

pub struct Uninstaller<'a, P: PackageManager + ?Sized> {
    package_manager: &'a P,
    store: &'a Store,
    states: Vec<UninstallState>,
}

impl<'a, P: PackageManager + ?Sized> Uninstaller<'a, P> {
    pub fn new(package_manager: &'a P, store: &'a Store) -> Self {
        Self {
            package_manager,
            store,
            states: Vec::new(),
        }
    }

    /// `catalog` is `None` when it could not be fetched; the uninstall then
    /// relies on the package manager record and the storage tree.
    pub fn uninstall(
        mut self,
        name: &RecipeName,
        catalog: Option<&Catalog>,
    ) -> Result<UninstallOutcome, GgdError> {
        self.transition(name, UninstallState::Requested);

        let descriptor = catalog.and_then(|catalog| catalog.get(name.as_str()));
        if descriptor.is_none() {
            warn!(recipe = %name, "recipe not in catalog; uninstalling from local state");
        }
        self.transition(name, UninstallState::CatalogResolved);

        let package_record = self
            .package_manager
            .uninstall(name.as_str(), self.store.prefix())
            .map_err(|err| GgdError::UninstallFailed {
                name: name.to_string(),
                cause: match err {
                    GgdError::PackageManager(cause) => cause,
                    other => other.to_string(),
                },
            })?;
        if package_record == RemoveOutcome::NotInstalled {
            info!(recipe = %name, "package manager has no record; skipping removal");
        }
        self.transition(name, UninstallState::ExternalRecordRemoved);

        let targets = self.cleanup_targets(name, descriptor);
        let mut report = CleanupReport::default();
        for target in &targets {
            let step = cleanup(self.store, target, &CleanupScope::AllVersions);
            report.removed_paths.extend(step.removed_paths);
            report.removed_env_vars.extend(step.removed_env_vars);
            report.warnings.extend(step.warnings);
        }
        self.transition(name, UninstallState::ResidueCleaned);

        let storage_names = targets
            .iter()
            .map(|target| target.storage_name.clone())
            .collect();
        if let Err(err) = apply_env_changes(self.store, &SyncChange::Removed(storage_names)) {
            report.warn(format!("could not update environment variable files: {err}"));
        }
        if let Err(err) = rebuild_mirror(self.store, self.package_manager, catalog) {
            warn!(recipe = %name, error = %err, "failed to refresh local metadata");
        }
        self.transition(name, UninstallState::MetadataSynced);

        let status = if package_record == RemoveOutcome::Removed || report.removed_anything() {
            UninstallStatus::Removed
        } else {
            UninstallStatus::NotInstalled
        };
        self.transition(name, UninstallState::Done);

        Ok(UninstallOutcome {
            name: name.to_string(),
            status,
            in_catalog: descriptor.is_some(),
            package_record,
            cleanup: report,
            states: self.states,
        })
    }

    /// The catalog location when known, plus every stored directory that
    /// belongs to the package (meta-recipe instances included).
    fn cleanup_targets(
        &self,
        name: &RecipeName,
        descriptor: Option<&RecipeDescriptor>,
    ) -> Vec<CleanupTarget> {
        let mut targets = Vec::new();
        if let Some(recipe) = descriptor.filter(|recipe| !recipe.is_meta_recipe()) {
            targets.push(CleanupTarget {
                package_name: name.to_string(),
                storage_name: name.to_string(),
                location: Some((recipe.species.clone(), recipe.genome_build.clone())),
            });
        }
        let stored_recipes = self.store.stored_recipes().unwrap_or_else(|err| {
            warn!(recipe = %name, error = %err, "could not scan stored recipes");
            Vec::new()
        });
        for stored in stored_recipes {
            if !storage_belongs_to(&stored.name, name.as_str()) {
                continue;
            }
            let target = CleanupTarget {
                package_name: name.to_string(),
                storage_name: stored.name,
                location: Some((stored.species, stored.genome_build)),
            };
            if !targets.contains(&target) {
                targets.push(target);
            }
        }
        if targets.is_empty() {
            targets.push(CleanupTarget {
                package_name: name.to_string(),
                storage_name: name.to_string(),
                location: None,
            });
        }
        targets
    }

    fn transition(&mut self, name: &RecipeName, state: UninstallState) {
        info!(recipe = %name, state = ?state, "uninstall");
        self.states.push(state);
    }
}
