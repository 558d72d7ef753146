use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use tempfile::Builder;

use crate::domain::InstalledFile;
use crate::error::GgdError;

pub const DEFAULT_NAMESPACE: &str = "ggd";

/// Layout of one conda environment prefix as ggd sees it.
#[derive(Debug, Clone)]
pub struct Store {
    prefix: Utf8PathBuf,
    namespace: String,
}

/// A recipe storage directory found on disk: `share/<ns>/<species>/<build>/<name>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecipe {
    pub species: String,
    pub genome_build: String,
    pub name: String,
    pub versions: Vec<String>,
}

impl Store {
    /// Open a prefix, failing fast when it is not a real environment.
    pub fn open(prefix: &Utf8Path, namespace: &str) -> Result<Self, GgdError> {
        let std_path = prefix.as_std_path();
        if !std_path.is_dir() {
            return Err(GgdError::InvalidPrefix(format!(
                "{prefix} does not exist or is not a directory"
            )));
        }
        if !std_path.join("conda-meta").is_dir() {
            return Err(GgdError::InvalidPrefix(format!(
                "{prefix} is not a conda environment (no conda-meta directory)"
            )));
        }
        let canonical = fs::canonicalize(std_path)
            .map_err(|err| GgdError::InvalidPrefix(format!("{prefix}: {err}")))?;
        let prefix = Utf8PathBuf::from_path_buf(canonical)
            .map_err(|_| GgdError::InvalidPrefix(format!("{prefix} is not valid UTF-8")))?;
        Ok(Self {
            prefix,
            namespace: namespace.to_string(),
        })
    }

    pub fn prefix(&self) -> &Utf8Path {
        &self.prefix
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn namespace_root(&self) -> Utf8PathBuf {
        self.prefix.join("share").join(&self.namespace)
    }

    pub fn recipe_dir(&self, species: &str, genome_build: &str, name: &str) -> Utf8PathBuf {
        self.namespace_root()
            .join(species)
            .join(genome_build)
            .join(name)
    }

    pub fn version_dir(
        &self,
        species: &str,
        genome_build: &str,
        name: &str,
        version: &str,
    ) -> Utf8PathBuf {
        self.recipe_dir(species, genome_build, name).join(version)
    }

    pub fn pkgs_dir(&self) -> Utf8PathBuf {
        self.prefix.join("pkgs")
    }

    pub fn activate_script(&self) -> Utf8PathBuf {
        self.prefix
            .join("etc")
            .join("conda")
            .join("activate.d")
            .join("env_vars.sh")
    }

    pub fn deactivate_script(&self) -> Utf8PathBuf {
        self.prefix
            .join("etc")
            .join("conda")
            .join("deactivate.d")
            .join("env_vars.sh")
    }

    pub fn mirror_path(&self) -> Utf8PathBuf {
        self.prefix
            .join("share")
            .join(format!("{}_info", self.namespace))
            .join("channeldata.json")
    }

    /// Directories ggd creates on demand, deepest first, with their
    /// ancestors inside the prefix.
    pub fn bookkeeping_dirs(&self) -> Vec<Utf8PathBuf> {
        let scripts = [self.activate_script(), self.deactivate_script()];
        let leaves = [Some(self.namespace_root()), Some(self.pkgs_dir())]
            .into_iter()
            .chain(scripts.iter().map(|script| script.parent().map(Utf8Path::to_path_buf)));
        let mut dirs: Vec<Utf8PathBuf> = Vec::new();
        for leaf in leaves {
            let mut current = leaf;
            while let Some(dir) = current {
                if dir == self.prefix || !dir.starts_with(&self.prefix) {
                    break;
                }
                current = dir.parent().map(Utf8Path::to_path_buf);
                if !dirs.contains(&dir) {
                    dirs.push(dir);
                }
            }
        }
        dirs.sort_by_key(|dir| std::cmp::Reverse(dir.components().count()));
        dirs
    }

    /// Remove `dir` when it exists and is empty.
    pub fn remove_dir_if_empty(dir: &Utf8Path) -> io::Result<bool> {
        if !dir.as_std_path().is_dir() {
            return Ok(false);
        }
        match fs::read_dir(dir.as_std_path()) {
            Ok(mut entries) => {
                if entries.next().is_some() {
                    return Ok(false);
                }
                fs::remove_dir(dir.as_std_path()).map(|_| true)
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Whether `path` lies inside this prefix, compared component by component.
    pub fn contains(&self, path: &Utf8Path) -> bool {
        path_within(&self.prefix, path)
    }

    /// Version directories under a recipe directory that hold at least one entry.
    pub fn version_dirs(
        &self,
        species: &str,
        genome_build: &str,
        name: &str,
    ) -> Result<Vec<String>, GgdError> {
        let recipe_dir = self.recipe_dir(species, genome_build, name);
        list_non_empty_subdirs(&recipe_dir)
    }

    /// Every recipe directory present under the namespace root.
    pub fn stored_recipes(&self) -> Result<Vec<StoredRecipe>, GgdError> {
        let mut recipes = Vec::new();
        for species in list_subdirs(&self.namespace_root())? {
            let species_dir = self.namespace_root().join(&species);
            for build in list_subdirs(&species_dir)? {
                let build_dir = species_dir.join(&build);
                for name in list_subdirs(&build_dir)? {
                    let versions = list_non_empty_subdirs(&build_dir.join(&name))?;
                    if versions.is_empty() {
                        continue;
                    }
                    recipes.push(StoredRecipe {
                        species: species.clone(),
                        genome_build: build.clone(),
                        name,
                        versions,
                    });
                }
            }
        }
        recipes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(recipes)
    }

    /// Regular files directly inside `dir`, sorted by name.
    pub fn list_files(dir: &Utf8Path) -> Result<Vec<InstalledFile>, GgdError> {
        if !dir.as_std_path().is_dir() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        let entries = fs::read_dir(dir.as_std_path())
            .map_err(|err| GgdError::Filesystem(format!("read {dir}: {err}")))?;
        for entry in entries {
            let entry = entry.map_err(|err| GgdError::Filesystem(err.to_string()))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|meta| meta.modified())
                .ok()
                .map(|time| chrono::DateTime::<chrono::Utc>::from(time).to_rfc3339());
            let path = Utf8PathBuf::from_path_buf(path)
                .map_err(|_| GgdError::Filesystem("non-utf8 file path in recipe".to_string()))?;
            files.push(InstalledFile { path, modified });
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), GgdError> {
        let parent = path
            .parent()
            .ok_or_else(|| GgdError::Filesystem(format!("invalid destination path {path}")))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| GgdError::Filesystem(err.to_string()))?;
        let temp = Builder::new()
            .prefix(".ggd-write")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| GgdError::Filesystem(err.to_string()))?;
        fs::write(temp.path(), content).map_err(|err| GgdError::Filesystem(err.to_string()))?;
        temp.persist(path.as_std_path())
            .map_err(|err| GgdError::Filesystem(err.to_string()))?;
        Ok(())
    }

    pub fn copy_dir_recursive(source: &Utf8Path, dest: &Utf8Path) -> Result<(), GgdError> {
        fs::create_dir_all(dest.as_std_path())
            .map_err(|err| GgdError::Filesystem(err.to_string()))?;
        for entry in walk_dir(source.as_std_path())? {
            let relative = entry
                .strip_prefix(source.as_std_path())
                .map_err(|err| GgdError::Filesystem(err.to_string()))?;
            let target = dest.as_std_path().join(relative);
            if entry.is_dir() {
                fs::create_dir_all(&target)
                    .map_err(|err| GgdError::Filesystem(err.to_string()))?;
            } else {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)
                        .map_err(|err| GgdError::Filesystem(err.to_string()))?;
                }
                fs::copy(&entry, &target).map_err(|err| GgdError::Filesystem(err.to_string()))?;
            }
        }
        Ok(())
    }

    pub fn copy_file_atomic(source: &Utf8Path, dest: &Utf8Path) -> Result<(), GgdError> {
        let parent = dest
            .parent()
            .ok_or_else(|| GgdError::Filesystem("invalid destination path".to_string()))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| GgdError::Filesystem(err.to_string()))?;
        let temp = Builder::new()
            .prefix(".ggd-file")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| GgdError::Filesystem(err.to_string()))?;
        fs::copy(source.as_std_path(), temp.path())
            .map_err(|err| GgdError::Filesystem(err.to_string()))?;
        temp.persist(dest.as_std_path())
            .map_err(|err| GgdError::Filesystem(err.to_string()))?;
        Ok(())
    }

    /// Remove a file or directory tree; a missing path is not an error.
    pub fn remove_path(path: &Utf8Path) -> io::Result<bool> {
        let std_path = path.as_std_path();
        match fs::symlink_metadata(std_path) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(std_path).map(|_| true),
            Ok(_) => fs::remove_file(std_path).map(|_| true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Remove empty directories from `start` upward, stopping before `stop`.
    pub fn prune_empty_ancestors(start: &Utf8Path, stop: &Utf8Path) -> io::Result<()> {
        let mut current = Some(start);
        while let Some(dir) = current {
            if dir == stop || !dir.starts_with(stop) {
                break;
            }
            match fs::read_dir(dir.as_std_path()) {
                Ok(mut entries) => {
                    if entries.next().is_some() {
                        break;
                    }
                    fs::remove_dir(dir.as_std_path())?;
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err),
            }
            current = dir.parent();
        }
        Ok(())
    }
}

/// Component-wise containment: `/envs/ab` is not inside `/envs/a`.
pub fn path_within(root: &Utf8Path, candidate: &Utf8Path) -> bool {
    let root = normalize(root);
    let candidate = normalize(candidate);
    candidate.starts_with(&root)
}

fn normalize(path: &Utf8Path) -> Utf8PathBuf {
    if let Ok(canonical) = fs::canonicalize(path.as_std_path()) {
        if let Ok(utf8) = Utf8PathBuf::from_path_buf(canonical) {
            return utf8;
        }
    }
    let mut out = Utf8PathBuf::new();
    for component in path.components() {
        match component {
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_str()),
        }
    }
    out
}

fn list_subdirs(dir: &Utf8Path) -> Result<Vec<String>, GgdError> {
    if !dir.as_std_path().is_dir() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    let entries = fs::read_dir(dir.as_std_path())
        .map_err(|err| GgdError::Filesystem(format!("read {dir}: {err}")))?;
    for entry in entries {
        let entry = entry.map_err(|err| GgdError::Filesystem(err.to_string()))?;
        if entry.path().is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

fn list_non_empty_subdirs(dir: &Utf8Path) -> Result<Vec<String>, GgdError> {
    let mut out = Vec::new();
    for name in list_subdirs(dir)? {
        let has_entries = fs::read_dir(dir.join(&name).as_std_path())
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false);
        if has_entries {
            out.push(name);
        }
    }
    Ok(out)
}

fn walk_dir(root: &Path) -> Result<Vec<PathBuf>, GgdError> {
    let mut items = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let entries = fs::read_dir(&path).map_err(|err| GgdError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| GgdError::Filesystem(err.to_string()))?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path.clone());
            }
            items.push(path);
        }
    }
    Ok(items)
}
