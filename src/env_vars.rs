//! Activation/deactivation side files exposing recipe locations to shells.
//!
//! The two files are treated as one key-value store: every `add` or
//! `remove` rewrites both, and entries are matched by exact variable name.

use std::collections::BTreeMap;
use std::fs;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::error::GgdError;
use crate::store::Store;

/// Suffixes recognised as an index next to a data file.
pub const INDEX_SUFFIXES: &[&str] = &[".tbi", ".csi", ".fai", ".bai", ".crai", ".gzi"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvVarEntry {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvVarKind {
    Dir,
    File,
}

/// `ggd_<name>_dir` / `ggd_<name>_file` with `-` and `.` replaced by `_`.
pub fn env_var_name(recipe_name: &str, kind: EnvVarKind) -> String {
    let normalized = recipe_name.replace(['-', '.'], "_");
    match kind {
        EnvVarKind::Dir => format!("ggd_{normalized}_dir"),
        EnvVarKind::File => format!("ggd_{normalized}_file"),
    }
}

/// Variables for a freshly installed recipe directory.
///
/// One file, or one file plus its index, also gets a `_file` variable
/// pointing at the data file; anything else only gets `_dir`.
pub fn entries_for_files(
    recipe_name: &str,
    directory: &Utf8Path,
    file_names: &[String],
) -> Vec<EnvVarEntry> {
    let mut entries = vec![EnvVarEntry {
        name: env_var_name(recipe_name, EnvVarKind::Dir),
        value: directory.to_string(),
    }];
    if let Some(main) = primary_file(file_names) {
        entries.push(EnvVarEntry {
            name: env_var_name(recipe_name, EnvVarKind::File),
            value: directory.join(main).to_string(),
        });
    }
    entries
}

fn primary_file(file_names: &[String]) -> Option<&str> {
    match file_names {
        [single] => Some(single.as_str()),
        [a, b] => match (is_index(a), is_index(b)) {
            (true, false) => Some(b.as_str()),
            (false, true) => Some(a.as_str()),
            _ => None,
        },
        _ => None,
    }
}

fn is_index(file_name: &str) -> bool {
    INDEX_SUFFIXES
        .iter()
        .any(|suffix| file_name.ends_with(suffix))
}

#[derive(Debug, Clone)]
pub struct EnvVarStore {
    activate: Utf8PathBuf,
    deactivate: Utf8PathBuf,
}

impl EnvVarStore {
    pub fn new(store: &Store) -> Self {
        Self {
            activate: store.activate_script(),
            deactivate: store.deactivate_script(),
        }
    }

    /// Add or replace an entry in both files.
    pub fn add(&self, entry: &EnvVarEntry) -> Result<(), GgdError> {
        let mut activate = read_lines(&self.activate)?;
        let mut deactivate = read_lines(&self.deactivate)?;

        let export_line = format!("export {}={}", entry.name, entry.value);
        let unset_line = format!("unset {}", entry.name);

        match activate
            .iter()
            .position(|line| exported_name(line) == Some(entry.name.as_str()))
        {
            Some(index) => activate[index] = export_line,
            None => activate.push(export_line),
        }
        if !deactivate
            .iter()
            .any(|line| unset_name(line) == Some(entry.name.as_str()))
        {
            deactivate.push(unset_line);
        }

        write_lines(&self.activate, &activate)?;
        write_lines(&self.deactivate, &deactivate)
    }

    /// Remove an entry from both files; returns whether anything was removed.
    pub fn remove(&self, name: &str) -> Result<bool, GgdError> {
        let activate = read_lines(&self.activate)?;
        let deactivate = read_lines(&self.deactivate)?;

        let kept_activate: Vec<String> = activate
            .iter()
            .filter(|line| exported_name(line) != Some(name))
            .cloned()
            .collect();
        let kept_deactivate: Vec<String> = deactivate
            .iter()
            .filter(|line| unset_name(line) != Some(name))
            .cloned()
            .collect();

        let removed =
            kept_activate.len() != activate.len() || kept_deactivate.len() != deactivate.len();
        if removed {
            write_lines(&self.activate, &kept_activate)?;
            write_lines(&self.deactivate, &kept_deactivate)?;
        }
        Ok(removed)
    }

    /// Exported variables keyed by name.
    pub fn entries(&self) -> Result<BTreeMap<String, String>, GgdError> {
        let mut map = BTreeMap::new();
        for line in read_lines(&self.activate)? {
            let parsed = line
                .trim()
                .strip_prefix("export ")
                .and_then(|rest| rest.split_once('='));
            if let Some((name, value)) = parsed {
                map.insert(name.trim().to_string(), value.to_string());
            }
        }
        Ok(map)
    }

    /// Names exported without a matching unset, or unset without an export.
    pub fn dangling(&self) -> Result<Vec<String>, GgdError> {
        let exported: Vec<String> = read_lines(&self.activate)?
            .iter()
            .filter_map(|line| exported_name(line).map(str::to_string))
            .collect();
        let unset: Vec<String> = read_lines(&self.deactivate)?
            .iter()
            .filter_map(|line| unset_name(line).map(str::to_string))
            .collect();
        let mut out: Vec<String> = exported
            .iter()
            .filter(|name| !unset.contains(name))
            .chain(unset.iter().filter(|name| !exported.contains(name)))
            .cloned()
            .collect();
        out.sort();
        out.dedup();
        Ok(out)
    }
}

fn exported_name(line: &str) -> Option<&str> {
    line.trim()
        .strip_prefix("export ")
        .and_then(|rest| rest.split_once('='))
        .map(|(name, _)| name.trim())
}

fn unset_name(line: &str) -> Option<&str> {
    line.trim().strip_prefix("unset ").map(str::trim)
}

fn read_lines(path: &Utf8Path) -> Result<Vec<String>, GgdError> {
    match fs::read_to_string(path.as_std_path()) {
        Ok(content) => Ok(content.lines().map(str::to_string).collect()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => Err(GgdError::Filesystem(format!("read {path}: {err}"))),
    }
}

fn write_lines(path: &Utf8Path, lines: &[String]) -> Result<(), GgdError> {
    if lines.iter().all(|line| line.trim().is_empty()) {
        return Store::remove_path(path)
            .map(|_| ())
            .map_err(|err| GgdError::Filesystem(format!("remove {path}: {err}")));
    }
    let mut content = lines.join("\n");
    content.push('\n');
    Store::write_bytes_atomic(path, content.as_bytes())
}
