//! Removal of everything an install leaves on disk, short of the package
//! manager's own record.
//!
//! Cleanup never fails. Each step that cannot complete is logged and
//! recorded in the report, and running it twice is harmless.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::{debug, warn};

use crate::domain::InstallTarget;
use crate::env_vars::{EnvVarKind, EnvVarStore, env_var_name};
use crate::package_manager::PkgCacheEntry;
use crate::store::{Store, path_within};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupScope {
    /// One version directory; used when rolling back an install.
    Version(String),
    /// The whole recipe directory; used by uninstall.
    AllVersions,
}

impl CleanupScope {
    fn version(&self) -> Option<&str> {
        match self {
            CleanupScope::Version(version) => Some(version),
            CleanupScope::AllVersions => None,
        }
    }
}

/// What to clean: the package name as the package manager knows it and
/// where the recipe's files live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupTarget {
    pub package_name: String,
    pub storage_name: String,
    /// Species and genome build, when known. Without them every stored
    /// recipe directory named `storage_name` is removed.
    pub location: Option<(String, String)>,
}

impl From<&InstallTarget> for CleanupTarget {
    fn from(target: &InstallTarget) -> Self {
        Self {
            package_name: target.package_name().to_string(),
            storage_name: target.storage_name(),
            location: Some((
                target.recipe.species.clone(),
                target.recipe.genome_build.clone(),
            )),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub removed_paths: Vec<Utf8PathBuf>,
    pub removed_env_vars: Vec<String>,
    pub warnings: Vec<String>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }

    pub fn removed_anything(&self) -> bool {
        !self.removed_paths.is_empty() || !self.removed_env_vars.is_empty()
    }

    pub(crate) fn warn(&mut self, message: String) {
        warn!("{message}");
        self.warnings.push(message);
    }
}

pub fn cleanup(store: &Store, target: &CleanupTarget, scope: &CleanupScope) -> CleanupReport {
    cleanup_preserving(store, target, scope, &[])
}

/// Same as [`cleanup`], but nothing listed in `preserved` is removed.
/// Rollback passes what existed before the failed attempt.
pub fn cleanup_preserving(
    store: &Store,
    target: &CleanupTarget,
    scope: &CleanupScope,
    preserved: &[Utf8PathBuf],
) -> CleanupReport {
    let mut report = CleanupReport::default();
    let storage_dirs = remove_storage(store, target, scope, preserved, &mut report);
    remove_pkg_cache_entries(store, target, scope, preserved, &mut report);
    remove_env_vars(store, target, scope, &storage_dirs, &mut report);
    prune_bookkeeping_dirs(store, preserved, &mut report);
    debug!(
        package = %target.package_name,
        removed = report.removed_paths.len(),
        warnings = report.warnings.len(),
        "cleanup finished"
    );
    report
}

/// Deletes the storage directories and returns the ones that were targeted.
fn remove_storage(
    store: &Store,
    target: &CleanupTarget,
    scope: &CleanupScope,
    preserved: &[Utf8PathBuf],
    report: &mut CleanupReport,
) -> Vec<Utf8PathBuf> {
    let recipe_dirs = match &target.location {
        Some((species, build)) => vec![store.recipe_dir(species, build, &target.storage_name)],
        None => match store.stored_recipes() {
            Ok(stored) => stored
                .into_iter()
                .filter(|recipe| recipe.name == target.storage_name)
                .map(|recipe| store.recipe_dir(&recipe.species, &recipe.genome_build, &recipe.name))
                .collect(),
            Err(err) => {
                report.warn(format!("could not scan stored recipes: {err}"));
                Vec::new()
            }
        },
    };

    let namespace_root = store.namespace_root();
    let mut targeted = Vec::new();
    for recipe_dir in recipe_dirs {
        let dir = match scope.version() {
            Some(version) => recipe_dir.join(version),
            None => recipe_dir,
        };
        if preserved.contains(&dir) {
            debug!(path = %dir, "keeping directory that predates this install");
            continue;
        }
        if !path_within(&namespace_root, &dir) || dir == namespace_root {
            report.warn(format!("refusing to remove {dir}: outside {namespace_root}"));
            continue;
        }
        match Store::remove_path(&dir) {
            Ok(true) => report.removed_paths.push(dir.clone()),
            Ok(false) => {}
            Err(err) => report.warn(format!("could not remove {dir}: {err}")),
        }
        if let Some(parent) = dir.parent() {
            if let Err(err) = Store::prune_empty_ancestors(parent, &namespace_root) {
                report.warn(format!("could not prune empty directories above {dir}: {err}"));
            }
        }
        targeted.push(dir);
    }
    targeted
}

fn remove_pkg_cache_entries(
    store: &Store,
    target: &CleanupTarget,
    scope: &CleanupScope,
    preserved: &[Utf8PathBuf],
    report: &mut CleanupReport,
) {
    let pkgs_dir = store.pkgs_dir();
    let entries = match fs::read_dir(pkgs_dir.as_std_path()) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return,
        Err(err) => {
            report.warn(format!("could not read {pkgs_dir}: {err}"));
            return;
        }
    };
    for entry in entries.flatten() {
        let Some(file_name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        let matched = PkgCacheEntry::parse(&file_name)
            .is_some_and(|parsed| parsed.matches(&target.package_name, scope.version()));
        if !matched {
            continue;
        }
        let path = pkgs_dir.join(&file_name);
        if preserved.contains(&path) {
            continue;
        }
        if !store.contains(&path) {
            report.warn(format!("refusing to remove {path}: resolves outside {}", store.prefix()));
            continue;
        }
        match Store::remove_path(&path) {
            Ok(true) => report.removed_paths.push(path),
            Ok(false) => {}
            Err(err) => report.warn(format!("could not remove {path}: {err}")),
        }
    }
}

/// A version-scoped cleanup only drops variables that point into the
/// removed version, so a side-by-side install keeps its exports.
fn remove_env_vars(
    store: &Store,
    target: &CleanupTarget,
    scope: &CleanupScope,
    storage_dirs: &[Utf8PathBuf],
    report: &mut CleanupReport,
) {
    let vars = EnvVarStore::new(store);
    let current = match vars.entries() {
        Ok(entries) => entries,
        Err(err) => {
            report.warn(format!("could not read environment variables: {err}"));
            return;
        }
    };
    for kind in [EnvVarKind::Dir, EnvVarKind::File] {
        let name = env_var_name(&target.storage_name, kind);
        if let CleanupScope::Version(_) = scope {
            let points_into_removed = current.get(&name).is_some_and(|value| {
                storage_dirs
                    .iter()
                    .any(|dir| path_within(dir, Utf8Path::new(value)))
            });
            if !points_into_removed {
                continue;
            }
        }
        match vars.remove(&name) {
            Ok(true) => report.removed_env_vars.push(name),
            Ok(false) => {}
            Err(err) => report.warn(format!("could not remove {name}: {err}")),
        }
    }
}

/// Empty bookkeeping directories go, so a fresh prefix is left as it was found.
fn prune_bookkeeping_dirs(store: &Store, preserved: &[Utf8PathBuf], report: &mut CleanupReport) {
    for dir in store.bookkeeping_dirs() {
        if preserved.contains(&dir) {
            continue;
        }
        match Store::remove_dir_if_empty(&dir) {
            Ok(true) => debug!(path = %dir, "pruned empty directory"),
            Ok(false) => {}
            Err(err) => report.warn(format!("could not prune {dir}: {err}")),
        }
    }
}
