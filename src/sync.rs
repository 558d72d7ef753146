//! Keeps the prefix's side files and local metadata mirror in step with
//! what is actually installed.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::domain::{PackageRecord, RecipeTags};
use crate::env_vars::{EnvVarEntry, EnvVarKind, EnvVarStore, env_var_name};
use crate::error::GgdError;
use crate::package_manager::PackageManager;
use crate::store::{Store, StoredRecipe};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledRecipe {
    pub storage_name: String,
    pub env_vars: Vec<EnvVarEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncChange {
    Added(Vec<InstalledRecipe>),
    /// Storage names whose variables should go.
    Removed(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MirrorStatus {
    Installed,
    /// Installed from a ggd channel but no longer listed by its catalog.
    NotInCatalog,
    /// The package manager lists it but no data directory holds files.
    MissingStorage,
    /// Data on disk with no package manager record.
    OrphanedStorage,
}

impl MirrorStatus {
    pub fn is_consistent(self) -> bool {
        matches!(self, MirrorStatus::Installed | MirrorStatus::NotInCatalog)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorEntry {
    pub name: String,
    pub status: MirrorStatus,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub species: Option<String>,
    #[serde(default)]
    pub genome_build: Option<String>,
    #[serde(default)]
    pub storage_versions: Vec<String>,
    #[serde(default)]
    pub tags: Option<RecipeTags>,
}

/// `<prefix>/share/<ns>_info/channeldata.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataMirror {
    pub generated_at: String,
    pub packages: BTreeMap<String, MirrorEntry>,
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
}

impl MetadataMirror {
    pub fn inconsistent(&self) -> impl Iterator<Item = &MirrorEntry> {
        self.packages
            .values()
            .filter(|entry| !entry.status.is_consistent())
    }
}

/// Write or drop exports in the activation and deactivation files.
pub fn apply_env_changes(store: &Store, change: &SyncChange) -> Result<(), GgdError> {
    let vars = EnvVarStore::new(store);
    match change {
        SyncChange::Added(recipes) => {
            for recipe in recipes {
                for entry in &recipe.env_vars {
                    vars.add(entry)?;
                }
            }
        }
        SyncChange::Removed(names) => {
            for name in names {
                for kind in [EnvVarKind::Dir, EnvVarKind::File] {
                    vars.remove(&env_var_name(name, kind))?;
                }
            }
        }
    }
    let dangling = vars.dangling()?;
    if !dangling.is_empty() {
        warn!(names = ?dangling, "activation and deactivation files disagree");
    }
    Ok(())
}

/// Rebuild the mirror from the package manager, the catalog and the
/// storage tree. A mirror with nothing to record is deleted instead.
pub fn rebuild_mirror<P: PackageManager + ?Sized>(
    store: &Store,
    package_manager: &P,
    catalog: Option<&Catalog>,
) -> Result<MetadataMirror, GgdError> {
    let records: Vec<PackageRecord> = package_manager
        .list_installed(store.prefix())?
        .into_iter()
        .filter(PackageRecord::is_ggd_package)
        .collect();
    let stored = store.stored_recipes()?;
    let mut mirror = build_mirror(&records, catalog, &stored);
    mirror.env_vars = EnvVarStore::new(store)
        .entries()?
        .into_iter()
        .filter(|(name, _)| name.starts_with("ggd_"))
        .collect();

    let path = store.mirror_path();
    if mirror.packages.is_empty() && mirror.env_vars.is_empty() {
        let removed = Store::remove_path(&path)
            .map_err(|err| GgdError::Filesystem(format!("remove {path}: {err}")))?;
        if let Some(parent) = path.parent() {
            Store::prune_empty_ancestors(parent, store.prefix())
                .map_err(|err| GgdError::Filesystem(format!("prune {parent}: {err}")))?;
        }
        if removed {
            info!(path = %path, "metadata mirror emptied and removed");
        }
        return Ok(mirror);
    }

    let bytes = serde_json::to_vec_pretty(&mirror)
        .map_err(|err| GgdError::Filesystem(err.to_string()))?;
    Store::write_bytes_atomic(&path, &bytes)?;
    info!(
        packages = mirror.packages.len(),
        path = %path,
        "metadata mirror rebuilt"
    );
    Ok(mirror)
}

pub fn read_mirror(store: &Store) -> Result<Option<MetadataMirror>, GgdError> {
    let path = store.mirror_path();
    let content = match fs::read(path.as_std_path()) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(GgdError::Filesystem(format!("read {path}: {err}"))),
    };
    serde_json::from_slice(&content)
        .map(Some)
        .map_err(|err| GgdError::Filesystem(format!("corrupt metadata mirror {path}: {err}")))
}

fn build_mirror(
    records: &[PackageRecord],
    catalog: Option<&Catalog>,
    stored: &[StoredRecipe],
) -> MetadataMirror {
    let mut packages = BTreeMap::new();
    let mut claimed = BTreeSet::new();
    let catalog_channel = catalog.map(|catalog| format!("ggd-{}", catalog.channel()));

    for record in records {
        let matches: Vec<&StoredRecipe> = stored
            .iter()
            .filter(|recipe| storage_belongs_to(&recipe.name, &record.name))
            .collect();
        for recipe in &matches {
            claimed.insert(recipe.name.clone());
        }

        let catalog_entry = catalog.and_then(|catalog| catalog.get(&record.name).cloned());
        let on_catalog_channel = catalog_channel
            .as_deref()
            .is_some_and(|channel| record.channel.rsplit('/').next() == Some(channel));
        let has_storage = matches
            .iter()
            .any(|recipe| recipe.versions.contains(&record.version));

        let status = if !has_storage {
            MirrorStatus::MissingStorage
        } else if on_catalog_channel && catalog_entry.is_none() {
            MirrorStatus::NotInCatalog
        } else {
            MirrorStatus::Installed
        };
        let first = matches.first();
        packages.insert(
            record.name.clone(),
            MirrorEntry {
                name: record.name.clone(),
                status,
                version: Some(record.version.clone()),
                channel: Some(record.channel.clone()),
                species: catalog_entry
                    .as_ref()
                    .map(|entry| entry.species.clone())
                    .or_else(|| first.map(|recipe| recipe.species.clone())),
                genome_build: catalog_entry
                    .as_ref()
                    .map(|entry| entry.genome_build.clone())
                    .or_else(|| first.map(|recipe| recipe.genome_build.clone())),
                storage_versions: matches
                    .iter()
                    .flat_map(|recipe| recipe.versions.iter().cloned())
                    .collect(),
                tags: catalog_entry.map(|entry| entry.tags),
            },
        );
    }

    for recipe in stored {
        if claimed.contains(&recipe.name) {
            continue;
        }
        debug!(recipe = %recipe.name, "storage without package record");
        packages.insert(
            recipe.name.clone(),
            MirrorEntry {
                name: recipe.name.clone(),
                status: MirrorStatus::OrphanedStorage,
                version: None,
                channel: None,
                species: Some(recipe.species.clone()),
                genome_build: Some(recipe.genome_build.clone()),
                storage_versions: recipe.versions.clone(),
                tags: None,
            },
        );
    }

    MetadataMirror {
        generated_at: Utc::now().to_rfc3339(),
        packages,
        env_vars: BTreeMap::new(),
    }
}

/// Meta-recipe instances are stored as `<id>-<name without "meta-recipe-">`.
pub fn storage_belongs_to(storage_name: &str, package_name: &str) -> bool {
    if storage_name == package_name {
        return true;
    }
    match package_name.strip_prefix("meta-recipe-") {
        Some(base) => storage_name
            .strip_suffix(base)
            .is_some_and(|head| head.len() > 1 && head.ends_with('-')),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, version: &str, channel: &str) -> PackageRecord {
        PackageRecord {
            name: name.to_string(),
            version: version.to_string(),
            build_number: 0,
            channel: channel.to_string(),
        }
    }

    fn stored(name: &str, versions: &[&str]) -> StoredRecipe {
        StoredRecipe {
            species: "Homo_sapiens".to_string(),
            genome_build: "hg19".to_string(),
            name: name.to_string(),
            versions: versions.iter().map(|version| version.to_string()).collect(),
        }
    }

    #[test]
    fn statuses_cover_every_mismatch() {
        let catalog = Catalog::from_json(
            "genomics",
            br#"{"packages": {
                "listed": {"version": "1", "identifiers": {"species": "Homo_sapiens", "genome-build": "hg19"}},
                "no-data": {"version": "1", "identifiers": {"species": "Homo_sapiens", "genome-build": "hg19"}}
            }}"#,
        )
        .unwrap();
        let records = vec![
            record("listed", "1", "ggd-genomics"),
            record("dropped", "1", "https://conda.anaconda.org/ggd-genomics"),
            record("no-data", "1", "ggd-genomics"),
            record("elsewhere", "3", "ggd-proteomics"),
        ];
        let on_disk = vec![
            stored("listed", &["1"]),
            stored("dropped", &["1"]),
            stored("elsewhere", &["3"]),
            stored("leftover", &["2"]),
        ];
        let mirror = build_mirror(&records, Some(&catalog), &on_disk);

        let status = |name: &str| mirror.packages[name].status;
        assert_eq!(status("listed"), MirrorStatus::Installed);
        assert_eq!(status("dropped"), MirrorStatus::NotInCatalog);
        assert_eq!(status("no-data"), MirrorStatus::MissingStorage);
        assert_eq!(status("elsewhere"), MirrorStatus::Installed);
        assert_eq!(status("leftover"), MirrorStatus::OrphanedStorage);
        assert_eq!(mirror.inconsistent().count(), 2);
        assert!(mirror.packages["listed"].tags.is_some());
    }

    #[test]
    fn meta_recipe_instances_match_their_package() {
        assert!(storage_belongs_to(
            "gse123-geo-accession-geo-v1",
            "meta-recipe-geo-accession-geo-v1"
        ));
        assert!(!storage_belongs_to(
            "geo-accession-geo-v1",
            "meta-recipe-geo-accession-geo-v1"
        ));
        assert!(!storage_belongs_to("hg19-gaps-v1", "hg19-gaps"));
    }
}
