#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use camino::{Utf8Path, Utf8PathBuf};

use ggd_manager::app::{App, ProgressEvent, ProgressSink};
use ggd_manager::catalog::{Catalog, CatalogClient};
use ggd_manager::config::{Config, ConfigLoader, ResolvedConfig};
use ggd_manager::domain::PackageRecord;
use ggd_manager::error::GgdError;
use ggd_manager::install::METARECIPE_NAME_ENV;
use ggd_manager::package_manager::{
    EnvironmentInfo, InstallRequest, PackageManager, RemoveOutcome,
};

pub const CHANNEL: &str = "genomics";
pub const GAPS: &str = "hg19-gaps-ucsc-v1";
pub const REFERENCE: &str = "grch38-reference-genome-ensembl-v1";
pub const MAPPING: &str = "hg38-chrom-mapping-v1";
pub const META: &str = "meta-recipe-geo-accession-geo-v1";

pub const CATALOG_JSON: &str = r#"{
  "packages": {
    "hg19-gaps-ucsc-v1": {
      "identifiers": {"species": "Homo_sapiens", "genome-build": "hg19"},
      "version": "1",
      "tags": {
        "cached": [],
        "final-files": ["hg19-gaps-ucsc-v1.bed.gz", "hg19-gaps-ucsc-v1.bed.gz.tbi"],
        "ggd-channel": "genomics"
      }
    },
    "grch38-reference-genome-ensembl-v1": {
      "identifiers": {"species": "Homo_sapiens", "genome-build": "GRCh38"},
      "version": "1",
      "tags": {
        "cached": ["uploaded_to_aws"],
        "final-files": ["grch38.fa", "grch38.fa.fai", "grch38.fa.gzi"],
        "final-file-sizes": {"grch38.fa": "3.1G"},
        "ggd-channel": "genomics"
      }
    },
    "hg38-chrom-mapping-v1": {
      "identifiers": {"species": "Homo_sapiens", "genome-build": "hg38"},
      "version": "2",
      "tags": {"final-files": ["hg38-chrom-mapping-v1.txt"], "ggd-channel": "genomics"}
    },
    "meta-recipe-geo-accession-geo-v1": {
      "identifiers": {"species": "meta-recipe", "genome-build": "meta-recipe"},
      "version": "1",
      "tags": {"ggd-channel": "genomics"}
    }
  }
}"#;

pub fn catalog() -> Catalog {
    Catalog::from_json(CHANNEL, CATALOG_JSON.as_bytes()).unwrap()
}

/// Serves a fixed catalog, or reports it unavailable.
#[derive(Clone)]
pub struct StaticCatalog(pub Option<Catalog>);

impl StaticCatalog {
    pub fn full() -> Self {
        Self(Some(catalog()))
    }
}

impl CatalogClient for StaticCatalog {
    fn fetch_catalog(&self, channel: &str) -> Result<Catalog, GgdError> {
        self.0
            .clone()
            .ok_or_else(|| GgdError::CatalogUnavailable {
                channel: channel.to_string(),
            })
    }
}

/// What the fake package manager writes when it installs a package.
#[derive(Debug, Clone)]
pub struct FakePackage {
    pub species: String,
    pub genome_build: String,
    pub version: String,
    pub files: Vec<String>,
}

#[derive(Debug, Default, Clone)]
pub struct Behavior {
    /// Write one file and a record, then fail with this message.
    pub fail_after_partial: Option<String>,
    /// Files to leave out of an otherwise successful install.
    pub omit_files: Vec<String>,
    /// Raise the interrupt flag once the files are on disk.
    pub interrupt_during_install: bool,
}

pub static INTERRUPT: AtomicBool = AtomicBool::new(false);

pub fn interrupt_requested() -> bool {
    INTERRUPT.load(Ordering::SeqCst)
}

pub fn never_interrupted() -> bool {
    false
}

#[derive(Default)]
struct FakeState {
    records: BTreeMap<Utf8PathBuf, Vec<PackageRecord>>,
    requests: Vec<(bool, InstallRequest)>,
    behavior: Behavior,
}

/// In-memory stand-in for conda: keeps records per prefix and writes
/// recipe files the way a post-link script would.
#[derive(Clone)]
pub struct FakeConda {
    root_prefix: Utf8PathBuf,
    packages: Arc<BTreeMap<String, FakePackage>>,
    state: Arc<Mutex<FakeState>>,
}

impl FakeConda {
    pub fn new(root_prefix: &Utf8Path) -> Self {
        let package = |species: &str, build: &str, version: &str, files: &[&str]| FakePackage {
            species: species.to_string(),
            genome_build: build.to_string(),
            version: version.to_string(),
            files: files.iter().map(|file| file.to_string()).collect(),
        };
        let mut packages = BTreeMap::new();
        packages.insert(
            GAPS.to_string(),
            package(
                "Homo_sapiens",
                "hg19",
                "1",
                &["hg19-gaps-ucsc-v1.bed.gz", "hg19-gaps-ucsc-v1.bed.gz.tbi"],
            ),
        );
        packages.insert(
            REFERENCE.to_string(),
            package(
                "Homo_sapiens",
                "GRCh38",
                "1",
                &["grch38.fa", "grch38.fa.fai", "grch38.fa.gzi"],
            ),
        );
        packages.insert(
            MAPPING.to_string(),
            package("Homo_sapiens", "hg38", "2", &["hg38-chrom-mapping-v1.txt"]),
        );
        packages.insert(
            META.to_string(),
            package("meta-recipe", "meta-recipe", "1", &["samples.csv.gz"]),
        );
        Self {
            root_prefix: root_prefix.to_path_buf(),
            packages: Arc::new(packages),
            state: Arc::new(Mutex::new(FakeState::default())),
        }
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        self.state.lock().unwrap().behavior = behavior;
    }

    pub fn records(&self, prefix: &Utf8Path) -> Vec<PackageRecord> {
        self.state
            .lock()
            .unwrap()
            .records
            .get(prefix)
            .cloned()
            .unwrap_or_default()
    }

    pub fn add_record(&self, prefix: &Utf8Path, name: &str, version: &str) {
        let mut state = self.state.lock().unwrap();
        put_record(&mut state, prefix, name, version);
    }

    /// `(bypassed_solver, request)` for every install call.
    pub fn requests(&self) -> Vec<(bool, InstallRequest)> {
        self.state.lock().unwrap().requests.clone()
    }

    fn run_install(&self, request: &InstallRequest, bypass_solver: bool) -> Result<(), GgdError> {
        let mut state = self.state.lock().unwrap();
        state.requests.push((bypass_solver, request.clone()));
        let behavior = state.behavior.clone();

        let spec = request
            .packages
            .first()
            .ok_or_else(|| GgdError::PackageManager("no package given".to_string()))?;
        let (name, pinned) = match spec.split_once('=') {
            Some((name, version)) => (name, Some(version)),
            None => (spec.as_str(), None),
        };
        let package = self.packages.get(name).ok_or_else(|| {
            GgdError::PackageManager(format!("PackagesNotFoundError: {name}"))
        })?;
        let version = pinned.unwrap_or(&package.version);
        let storage_name = request
            .env
            .iter()
            .find(|(key, _)| key == METARECIPE_NAME_ENV)
            .map(|(_, value)| value.as_str())
            .unwrap_or(name);
        let dir = request
            .prefix
            .join("share")
            .join("ggd")
            .join(&package.species)
            .join(&package.genome_build)
            .join(storage_name)
            .join(version);
        fs::create_dir_all(dir.as_std_path()).unwrap();

        if let Some(cause) = behavior.fail_after_partial {
            fs::write(dir.join(&package.files[0]).as_std_path(), b"partial").unwrap();
            put_record(&mut state, &request.prefix, name, version);
            return Err(GgdError::PackageManager(cause));
        }

        for file in &package.files {
            if behavior.omit_files.contains(file) {
                continue;
            }
            let content = format!("{name} {version} {file}\n");
            fs::write(dir.join(file).as_std_path(), content).unwrap();
        }

        let pkgs = self.root_prefix.join("pkgs");
        let unpacked = pkgs.join(format!("{name}-{version}-0"));
        fs::create_dir_all(unpacked.join("info").as_std_path()).unwrap();
        fs::write(unpacked.join("info").join("index.json").as_std_path(), b"{}").unwrap();
        fs::write(
            pkgs.join(format!("{name}-{version}-0.tar.bz2")).as_std_path(),
            b"archive",
        )
        .unwrap();

        put_record(&mut state, &request.prefix, name, version);
        if behavior.interrupt_during_install {
            INTERRUPT.store(true, Ordering::SeqCst);
        }
        Ok(())
    }
}

fn put_record(state: &mut FakeState, prefix: &Utf8Path, name: &str, version: &str) {
    let records = state.records.entry(prefix.to_path_buf()).or_default();
    records.retain(|record| record.name != name);
    records.push(PackageRecord {
        name: name.to_string(),
        version: version.to_string(),
        build_number: 0,
        channel: format!("ggd-{CHANNEL}"),
    });
}

impl PackageManager for FakeConda {
    fn install(&self, request: &InstallRequest) -> Result<(), GgdError> {
        self.run_install(request, false)
    }

    fn install_bypassing_solver(&self, request: &InstallRequest) -> Result<(), GgdError> {
        self.run_install(request, true)
    }

    fn uninstall(&self, name: &str, prefix: &Utf8Path) -> Result<RemoveOutcome, GgdError> {
        let mut state = self.state.lock().unwrap();
        let records = state.records.entry(prefix.to_path_buf()).or_default();
        let before = records.len();
        records.retain(|record| record.name != name);
        if records.len() == before {
            Ok(RemoveOutcome::NotInstalled)
        } else {
            Ok(RemoveOutcome::Removed)
        }
    }

    fn list_installed(&self, prefix: &Utf8Path) -> Result<Vec<PackageRecord>, GgdError> {
        Ok(self.records(prefix))
    }

    fn environment(&self) -> Result<EnvironmentInfo, GgdError> {
        Ok(EnvironmentInfo {
            root_prefix: self.root_prefix.clone(),
            active_prefix: Some(self.root_prefix.clone()),
        })
    }

    fn build(&self, recipe_dir: &Utf8Path) -> Result<Utf8PathBuf, GgdError> {
        Err(GgdError::PackageManager(format!("cannot build {recipe_dir}")))
    }

    fn install_local_artifact(
        &self,
        artifact: &Utf8Path,
        _prefix: &Utf8Path,
    ) -> Result<(), GgdError> {
        Err(GgdError::PackageManager(format!("cannot install {artifact}")))
    }
}

/// Records the phase messages an operation emits.
#[derive(Default)]
pub struct RecordingSink(pub Mutex<Vec<String>>);

impl RecordingSink {
    pub fn messages(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

impl ProgressSink for RecordingSink {
    fn event(&self, event: ProgressEvent) {
        self.0.lock().unwrap().push(event.message);
    }
}

/// A root environment with two named environments whose paths share a prefix.
pub struct Fixture {
    _temp: tempfile::TempDir,
    pub root: Utf8PathBuf,
    pub env_a: Utf8PathBuf,
    pub env_ab: Utf8PathBuf,
    pub config: ResolvedConfig,
    pub conda: FakeConda,
}

impl Fixture {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().unwrap();
        let canonical = fs::canonicalize(temp.path()).unwrap();
        let base = Utf8PathBuf::from_path_buf(canonical).unwrap();
        let root = base.join("miniconda3");
        let env_a = root.join("envs").join("a");
        let env_ab = root.join("envs").join("ab");
        for prefix in [&root, &env_a, &env_ab] {
            fs::create_dir_all(prefix.join("conda-meta").as_std_path()).unwrap();
        }
        let config = ConfigLoader::resolve_config(Config {
            cache_dir: Some(base.join("cache").to_string()),
            ..Config::default()
        })
        .unwrap();
        let conda = FakeConda::new(&root);
        Self {
            _temp: temp,
            root,
            env_a,
            env_ab,
            config,
            conda,
        }
    }

    pub fn app(&self) -> App<StaticCatalog, FakeConda> {
        self.app_with(StaticCatalog::full())
    }

    pub fn app_with(&self, catalog: StaticCatalog) -> App<StaticCatalog, FakeConda> {
        App::new(self.config.clone(), catalog, self.conda.clone())
            .with_interrupt_check(never_interrupted)
    }

    pub fn storage_dir(
        &self,
        prefix: &Utf8Path,
        species: &str,
        build: &str,
        name: &str,
    ) -> Utf8PathBuf {
        prefix
            .join("share")
            .join("ggd")
            .join(species)
            .join(build)
            .join(name)
    }
}

/// Every entry under `root`. Files map to their bytes; directories are
/// keyed with a trailing `/` so an empty directory left behind shows up.
pub fn snapshot(root: &Utf8Path) -> BTreeMap<String, Vec<u8>> {
    let mut entries = BTreeMap::new();
    collect(root.as_std_path(), root.as_std_path(), &mut entries);
    entries
}

fn collect(root: &Path, dir: &Path, entries: &mut BTreeMap<String, Vec<u8>>) {
    let Ok(children) = fs::read_dir(dir) else {
        return;
    };
    for child in children.flatten() {
        let path = child.path();
        let relative = path.strip_prefix(root).unwrap().to_string_lossy().to_string();
        if path.is_dir() {
            entries.insert(format!("{relative}/"), Vec::new());
            collect(root, &path, entries);
        } else {
            entries.insert(relative, fs::read(&path).unwrap());
        }
    }
}
