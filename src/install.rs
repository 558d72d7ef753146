//! Materializes a recipe through the package manager and undoes partial
//! work when that fails.

use std::fs;

use camino::Utf8PathBuf;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cleanup::{CleanupReport, CleanupScope, CleanupTarget, cleanup_preserving};
use crate::config::ResolvedConfig;
use crate::domain::{InstallTarget, InstalledRecord};
use crate::env_vars::{EnvVarEntry, EnvVarStore, entries_for_files};
use crate::error::GgdError;
use crate::inspect::find_record;
use crate::package_manager::{EnvironmentInfo, InstallRequest, PackageManager, PkgCacheEntry};
use crate::shutdown;
use crate::store::{Store, path_within};
use crate::strategy::{CachedArtifact, Strategy};
use crate::sync::{InstalledRecipe, SyncChange, apply_env_changes};

pub const METARECIPE_ID_ENV: &str = "GGD_METARECIPE_ID";
pub const METARECIPE_NAME_ENV: &str = "GGD_METARECIPE_NAME";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallOutcome {
    pub record: InstalledRecord,
    pub strategy: Strategy,
    pub env_vars: Vec<EnvVarEntry>,
    /// Package cache entries copied into a non-active prefix.
    pub copied_artifacts: Vec<Utf8PathBuf>,
}

pub struct Installer<'a, P: PackageManager + ?Sized> {
    package_manager: &'a P,
    store: &'a Store,
    config: &'a ResolvedConfig,
    environment: &'a EnvironmentInfo,
    interrupted: fn() -> bool,
}

impl<'a, P: PackageManager + ?Sized> Installer<'a, P> {
    pub fn new(
        package_manager: &'a P,
        store: &'a Store,
        config: &'a ResolvedConfig,
        environment: &'a EnvironmentInfo,
    ) -> Self {
        Self {
            package_manager,
            store,
            config,
            environment,
            interrupted: shutdown::is_shutdown_requested,
        }
    }

    pub fn with_interrupt_check(mut self, interrupted: fn() -> bool) -> Self {
        self.interrupted = interrupted;
        self
    }

    /// Run the strategy; on any failure roll back and return the cause.
    pub fn install(
        &self,
        target: &InstallTarget,
        strategy: &Strategy,
    ) -> Result<InstallOutcome, GgdError> {
        let name = target.package_name();
        let record_before = find_record(
            self.package_manager.list_installed(self.store.prefix())?,
            name,
        );
        let preexisting = self.preexisting_paths(target)?;
        info!(
            recipe = %name,
            version = %target.requested_version,
            strategy = strategy.label(),
            prefix = %self.store.prefix(),
            "installing"
        );

        match self.materialize(target, strategy) {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                let err = match err {
                    _ if (self.interrupted)() => GgdError::Interrupted,
                    GgdError::PackageManager(cause) => GgdError::InstallFailed {
                        name: name.to_string(),
                        cause,
                    },
                    other => other,
                };
                warn!(recipe = %name, error = %err, "install failed; rolling back");
                let report = self.roll_back(target, record_before.is_some(), &preexisting);
                if !report.is_clean() {
                    warn!(recipe = %name, warnings = ?report.warnings, "rollback incomplete");
                }
                Err(err)
            }
        }
    }

    fn materialize(
        &self,
        target: &InstallTarget,
        strategy: &Strategy,
    ) -> Result<InstallOutcome, GgdError> {
        self.check_interrupt()?;
        let request = self.request_for(target, strategy);
        debug!(?request, "package manager request");
        match strategy {
            Strategy::CachedReplay(_) => self.package_manager.install_bypassing_solver(&request)?,
            Strategy::SolverBased => self.package_manager.install(&request)?,
        }
        self.check_interrupt()?;

        let record = self.verify(target, strategy)?;
        let file_names = reported_file_names(strategy, &record);
        let env_vars = entries_for_files(
            &target.storage_name(),
            &record.directory_path,
            &file_names,
        );
        info!(path = %record.directory_path, "recipe files installed");

        let copied_artifacts =
            self.copy_cached_artifacts(target.package_name(), &record.package_record.version);
        self.check_interrupt()?;

        self.export_env_vars(target, &env_vars)?;

        Ok(InstallOutcome {
            record,
            strategy: strategy.clone(),
            env_vars,
            copied_artifacts,
        })
    }

    fn request_for(&self, target: &InstallTarget, strategy: &Strategy) -> InstallRequest {
        let channel = &target.recipe.channel;
        let channels = match strategy {
            Strategy::CachedReplay(_) => vec![format!("ggd-{channel}")],
            Strategy::SolverBased => self.config.conda_channels(channel),
        };
        let mut env = Vec::new();
        if let (Some(id), true) = (&target.meta_recipe_id, target.recipe.is_meta_recipe()) {
            env.push((METARECIPE_ID_ENV.to_string(), id.clone()));
            env.push((METARECIPE_NAME_ENV.to_string(), target.storage_name()));
        }
        InstallRequest {
            packages: vec![target.package_spec()],
            prefix: self.store.prefix().to_path_buf(),
            channels,
            env,
        }
    }

    /// Both signals must hold after the package manager reports success.
    fn verify(
        &self,
        target: &InstallTarget,
        strategy: &Strategy,
    ) -> Result<InstalledRecord, GgdError> {
        let name = target.package_name();
        let package_record = find_record(
            self.package_manager.list_installed(self.store.prefix())?,
            name,
        )
        .ok_or_else(|| GgdError::InstallFailed {
            name: name.to_string(),
            cause: "package manager reported success but lists no record".to_string(),
        })?;

        let recipe = &target.recipe;
        let directory_path = self.store.version_dir(
            &recipe.species,
            &recipe.genome_build,
            &target.storage_name(),
            &package_record.version,
        );
        let files = Store::list_files(&directory_path)?;
        let directory_has_entries = fs::read_dir(directory_path.as_std_path())
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false);
        if !directory_has_entries {
            return Err(GgdError::InstallFailed {
                name: name.to_string(),
                cause: format!("no files were written to {directory_path}"),
            });
        }

        if let Strategy::CachedReplay(CachedArtifact { final_files }) = strategy {
            let missing: Vec<String> = final_files
                .iter()
                .filter(|file| !directory_path.join(file).as_std_path().exists())
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(GgdError::FileIntegrity {
                    name: name.to_string(),
                    missing,
                });
            }
        }

        Ok(InstalledRecord {
            directory_path,
            files,
            package_record,
        })
    }

    /// Entries from the root package cache, copied when installing into a
    /// prefix other than the active one. Failures only warn.
    fn copy_cached_artifacts(&self, name: &str, version: &str) -> Vec<Utf8PathBuf> {
        let source_dir = self.environment.root_pkgs_dir();
        let dest_dir = self.store.pkgs_dir();
        let active = self.environment.default_prefix();
        if path_within(active, self.store.prefix()) && path_within(self.store.prefix(), active) {
            return Vec::new();
        }
        if path_within(&source_dir, &dest_dir) {
            return Vec::new();
        }
        let entries = match fs::read_dir(source_dir.as_std_path()) {
            Ok(entries) => entries,
            Err(err) => {
                debug!(error = %err, path = %source_dir, "no root package cache to copy from");
                return Vec::new();
            }
        };

        let mut copied = Vec::new();
        for entry in entries.flatten() {
            let Some(file_name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let matched = PkgCacheEntry::parse(&file_name)
                .is_some_and(|parsed| parsed.matches(name, Some(version)));
            if !matched {
                continue;
            }
            let source = source_dir.join(&file_name);
            let dest = dest_dir.join(&file_name);
            let result = if source.as_std_path().is_dir() {
                Store::copy_dir_recursive(&source, &dest)
            } else {
                Store::copy_file_atomic(&source, &dest)
            };
            match result {
                Ok(()) => copied.push(dest),
                Err(err) => warn!(error = %err, path = %source, "failed to copy package artifact"),
            }
        }
        copied
    }

    /// Storage directories, package cache entries and bookkeeping
    /// directories that are already present. Rollback leaves them alone.
    fn preexisting_paths(&self, target: &InstallTarget) -> Result<Vec<Utf8PathBuf>, GgdError> {
        let recipe = &target.recipe;
        let storage_name = target.storage_name();
        let mut paths: Vec<Utf8PathBuf> = self
            .store
            .version_dirs(&recipe.species, &recipe.genome_build, &storage_name)?
            .iter()
            .map(|version| {
                self.store
                    .version_dir(&recipe.species, &recipe.genome_build, &storage_name, version)
            })
            .collect();

        let pkgs_dir = self.store.pkgs_dir();
        if let Ok(entries) = fs::read_dir(pkgs_dir.as_std_path()) {
            for entry in entries.flatten() {
                let Some(file_name) = entry.file_name().to_str().map(str::to_string) else {
                    continue;
                };
                if PkgCacheEntry::parse(&file_name)
                    .is_some_and(|parsed| parsed.matches(target.package_name(), None))
                {
                    paths.push(pkgs_dir.join(file_name));
                }
            }
        }

        paths.extend(
            self.store
                .bookkeeping_dirs()
                .into_iter()
                .filter(|dir| dir.as_std_path().is_dir()),
        );
        Ok(paths)
    }

    /// Side-file failures fail the install. Variables this step replaced
    /// get their old values back before the error is returned.
    fn export_env_vars(
        &self,
        target: &InstallTarget,
        env_vars: &[EnvVarEntry],
    ) -> Result<(), GgdError> {
        let name = target.package_name();
        let failed = |err: GgdError| GgdError::InstallFailed {
            name: name.to_string(),
            cause: format!("could not write environment variables: {err}"),
        };
        let vars = EnvVarStore::new(self.store);
        let previous = vars.entries().map_err(failed)?;
        let change = SyncChange::Added(vec![InstalledRecipe {
            storage_name: target.storage_name(),
            env_vars: env_vars.to_vec(),
        }]);
        if let Err(err) = apply_env_changes(self.store, &change) {
            for entry in env_vars {
                let restored = match previous.get(&entry.name) {
                    Some(value) => vars.add(&EnvVarEntry {
                        name: entry.name.clone(),
                        value: value.clone(),
                    }),
                    None => vars.remove(&entry.name).map(|_| ()),
                };
                if let Err(restore_err) = restored {
                    warn!(name = %entry.name, error = %restore_err, "could not restore variable");
                }
            }
            return Err(failed(err));
        }
        Ok(())
    }

    fn roll_back(
        &self,
        target: &InstallTarget,
        record_existed: bool,
        preexisting: &[Utf8PathBuf],
    ) -> CleanupReport {
        let name = target.package_name();
        let mut version = target.resolved_version().to_string();
        if !record_existed {
            match self.package_manager.list_installed(self.store.prefix()) {
                Ok(records) => {
                    if let Some(orphan) = find_record(records, name) {
                        version = orphan.version;
                        if let Err(err) =
                            self.package_manager.uninstall(name, self.store.prefix())
                        {
                            warn!(recipe = %name, error = %err, "could not remove orphaned record");
                        }
                    }
                }
                Err(err) => {
                    warn!(recipe = %name, error = %err, "could not list packages during rollback")
                }
            }
        }
        let report = cleanup_preserving(
            self.store,
            &CleanupTarget::from(target),
            &CleanupScope::Version(version),
            preexisting,
        );
        info!(
            recipe = %name,
            removed = report.removed_paths.len(),
            "rolled back partial install"
        );
        report
    }

    fn check_interrupt(&self) -> Result<(), GgdError> {
        if (self.interrupted)() {
            Err(GgdError::Interrupted)
        } else {
            Ok(())
        }
    }
}

/// Catalog-declared files for a replayed artifact, otherwise what landed on disk.
fn reported_file_names(strategy: &Strategy, record: &InstalledRecord) -> Vec<String> {
    match strategy {
        Strategy::CachedReplay(artifact) if !artifact.final_files.is_empty() => {
            artifact.final_files.clone()
        }
        _ => record
            .files
            .iter()
            .filter_map(|file| file.path.file_name().map(str::to_string))
            .collect(),
    }
}
