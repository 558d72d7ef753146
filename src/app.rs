use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use serde::Serialize;
use tracing::{info, warn};

use crate::catalog::{Catalog, CatalogClient};
use crate::config::ResolvedConfig;
use crate::domain::{InstallTarget, RecipeName, RequestedVersion, validate_channel};
use crate::env_vars::EnvVarEntry;
use crate::error::GgdError;
use crate::inspect::{InstallState, inspect};
use crate::install::Installer;
use crate::package_manager::{PackageManager, RemoveOutcome};
use crate::store::Store;
use crate::strategy::select_strategy;
use crate::sync::{MirrorEntry, read_mirror, rebuild_mirror};
use crate::uninstall::{UninstallState, UninstallStatus, Uninstaller};

#[derive(Debug, Clone)]
pub struct InstallOptions {
    pub name: RecipeName,
    pub version: RequestedVersion,
    pub prefix: Option<Utf8PathBuf>,
    pub channel: Option<String>,
    pub meta_recipe_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UninstallOptions {
    pub name: RecipeName,
    pub prefix: Option<Utf8PathBuf>,
    pub channel: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstallResult {
    pub name: String,
    pub storage_name: String,
    pub version: String,
    pub channel: String,
    pub prefix: String,
    pub strategy: String,
    pub directory: String,
    pub files: Vec<String>,
    pub env_vars: Vec<EnvVarEntry>,
    pub copied_artifacts: Vec<String>,
    /// Another version that stays installed next to this one.
    pub kept_version: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UninstallResult {
    pub name: String,
    pub prefix: String,
    pub status: UninstallStatus,
    pub in_catalog: bool,
    pub package_record: RemoveOutcome,
    pub removed_paths: Vec<String>,
    pub removed_env_vars: Vec<String>,
    pub warnings: Vec<String>,
    pub states: Vec<UninstallState>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListResult {
    pub prefix: String,
    pub generated_at: Option<String>,
    pub packages: Vec<MirrorEntry>,
    pub env_vars: Vec<EnvVarEntry>,
}

impl ListResult {
    pub fn inconsistent(&self) -> impl Iterator<Item = &MirrorEntry> {
        self.packages
            .iter()
            .filter(|entry| !entry.status.is_consistent())
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ProgressSinkKind {
    Install,
    Uninstall,
    List,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

fn phase(sink: &dyn ProgressSink, phase: &str, message: impl Into<String>) {
    sink.event(ProgressEvent {
        message: format!("phase={phase}; {}", message.into()),
        elapsed: None,
    });
}

#[derive(Clone)]
pub struct App<C: CatalogClient, P: PackageManager> {
    config: ResolvedConfig,
    catalog: C,
    package_manager: P,
    interrupted: fn() -> bool,
}

impl<C: CatalogClient, P: PackageManager> App<C, P> {
    pub fn new(config: ResolvedConfig, catalog: C, package_manager: P) -> Self {
        Self {
            config,
            catalog,
            package_manager,
            interrupted: crate::shutdown::is_shutdown_requested,
        }
    }

    pub fn with_interrupt_check(mut self, interrupted: fn() -> bool) -> Self {
        self.interrupted = interrupted;
        self
    }

    pub fn install(
        &self,
        options: InstallOptions,
        sink: &dyn ProgressSink,
    ) -> Result<InstallResult, GgdError> {
        let channel = self.channel(options.channel.as_deref())?;
        phase(sink, "Resolve", format!("fetching {channel} catalog"));
        let start = Instant::now();
        let catalog = self.catalog.fetch_catalog(&channel)?;
        sink.event(ProgressEvent {
            message: format!("catalog.response recipes={}", catalog.len()),
            elapsed: Some(start.elapsed()),
        });
        let recipe = catalog.require(&options.name)?.clone();

        let environment = self.package_manager.environment()?;
        let prefix = options
            .prefix
            .clone()
            .unwrap_or_else(|| environment.default_prefix().to_path_buf());
        let store = Store::open(&prefix, &self.config.namespace)?;
        let target = InstallTarget::new(
            recipe,
            options.version,
            store.prefix().to_path_buf(),
            options.meta_recipe_id,
        )?;

        phase(sink, "Inspect", format!("checking {}", store.prefix()));
        let kept_version = match inspect(&store, &self.package_manager, &target)? {
            InstallState::NotInstalled => None,
            InstallState::InstalledExactVersion(record) => {
                info!(recipe = %target.package_name(), "already installed");
                return Err(GgdError::AlreadyInstalled {
                    name: target.storage_name(),
                    version: record.package_record.version,
                    prefix: store.prefix().to_string(),
                });
            }
            InstallState::InstalledDifferentVersion { installed_version } => {
                phase(
                    sink,
                    "Inspect",
                    format!("version {installed_version} stays installed alongside"),
                );
                Some(installed_version)
            }
            InstallState::Inconsistent { detail, .. } => {
                return Err(GgdError::InconsistentState {
                    name: target.storage_name(),
                    prefix: store.prefix().to_string(),
                    detail,
                });
            }
        };

        let strategy = select_strategy(&target.recipe);
        phase(
            sink,
            "Install",
            format!("{} via {} install", target.package_spec(), strategy.label()),
        );
        let start = Instant::now();
        let outcome = Installer::new(&self.package_manager, &store, &self.config, &environment)
            .with_interrupt_check(self.interrupted)
            .install(&target, &strategy)?;
        sink.event(ProgressEvent {
            message: format!("install.complete files={}", outcome.record.files.len()),
            elapsed: Some(start.elapsed()),
        });

        phase(sink, "Sync", "updating local metadata");
        if let Err(err) = rebuild_mirror(&store, &self.package_manager, Some(&catalog)) {
            warn!(error = %err, "failed to refresh local metadata");
        }

        Ok(InstallResult {
            name: target.package_name().to_string(),
            storage_name: target.storage_name(),
            version: outcome.record.package_record.version.clone(),
            channel,
            prefix: store.prefix().to_string(),
            strategy: outcome.strategy.label().to_string(),
            directory: outcome.record.directory_path.to_string(),
            files: outcome
                .record
                .files
                .iter()
                .map(|file| file.path.to_string())
                .collect(),
            env_vars: outcome.env_vars,
            copied_artifacts: outcome
                .copied_artifacts
                .iter()
                .map(ToString::to_string)
                .collect(),
            kept_version,
        })
    }

    pub fn uninstall(
        &self,
        options: UninstallOptions,
        sink: &dyn ProgressSink,
    ) -> Result<UninstallResult, GgdError> {
        let channel = self.channel(options.channel.as_deref())?;
        let store = self.open_store(options.prefix)?;

        phase(sink, "Resolve", format!("fetching {channel} catalog"));
        let catalog = match self.catalog.fetch_catalog(&channel) {
            Ok(catalog) => Some(catalog),
            Err(err @ GgdError::CatalogParse { .. }) => return Err(err),
            Err(err) => {
                warn!(error = %err, "continuing uninstall without catalog");
                None
            }
        };

        phase(sink, "Cleanup", format!("removing {}", options.name));
        let outcome = Uninstaller::new(&self.package_manager, &store)
            .uninstall(&options.name, catalog.as_ref())?;
        phase(sink, "Sync", "metadata refreshed");

        Ok(UninstallResult {
            name: outcome.name,
            prefix: store.prefix().to_string(),
            status: outcome.status,
            in_catalog: outcome.in_catalog,
            package_record: outcome.package_record,
            removed_paths: outcome
                .cleanup
                .removed_paths
                .iter()
                .map(ToString::to_string)
                .collect(),
            removed_env_vars: outcome.cleanup.removed_env_vars,
            warnings: outcome.cleanup.warnings,
            states: outcome.states,
        })
    }

    pub fn list(
        &self,
        prefix: Option<Utf8PathBuf>,
        sink: &dyn ProgressSink,
    ) -> Result<ListResult, GgdError> {
        let store = self.open_store(prefix)?;
        phase(sink, "Resolve", format!("reading {}", store.mirror_path()));
        let result = match read_mirror(&store)? {
            Some(mirror) => ListResult {
                prefix: store.prefix().to_string(),
                generated_at: Some(mirror.generated_at),
                packages: mirror.packages.into_values().collect(),
                env_vars: mirror
                    .env_vars
                    .into_iter()
                    .map(|(name, value)| EnvVarEntry { name, value })
                    .collect(),
            },
            None => ListResult {
                prefix: store.prefix().to_string(),
                generated_at: None,
                packages: Vec::new(),
                env_vars: Vec::new(),
            },
        };
        for entry in result.inconsistent() {
            warn!(recipe = %entry.name, status = ?entry.status, "inconsistent install");
        }
        Ok(result)
    }

    /// Rebuild the prefix mirror from current state, then list it.
    /// Environment variables are left as they are.
    pub fn refresh_and_list(
        &self,
        prefix: Option<Utf8PathBuf>,
        channel: Option<&str>,
        sink: &dyn ProgressSink,
    ) -> Result<ListResult, GgdError> {
        let channel = self.channel(channel)?;
        let store = self.open_store(prefix.clone())?;
        phase(sink, "Resolve", format!("fetching {channel} catalog"));
        let catalog: Option<Catalog> = match self.catalog.fetch_catalog(&channel) {
            Ok(catalog) => Some(catalog),
            Err(err) => {
                warn!(error = %err, "rebuilding metadata without catalog");
                None
            }
        };
        phase(sink, "Sync", format!("rebuilding {}", store.mirror_path()));
        rebuild_mirror(&store, &self.package_manager, catalog.as_ref())?;
        self.list(prefix, sink)
    }

    fn channel(&self, requested: Option<&str>) -> Result<String, GgdError> {
        let channel = requested.unwrap_or(&self.config.default_channel);
        validate_channel(channel).map(str::to_string)
    }

    fn open_store(&self, prefix: Option<Utf8PathBuf>) -> Result<Store, GgdError> {
        let prefix = match prefix {
            Some(prefix) => prefix,
            None => self
                .package_manager
                .environment()?
                .default_prefix()
                .to_path_buf(),
        };
        Store::open(&prefix, &self.config.namespace)
    }
}
