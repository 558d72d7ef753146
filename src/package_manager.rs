//! Narrow contract to the external package manager.
//!
//! Everything that parses the tool's output lives here; the install and
//! uninstall state machines only see typed results.

use std::path::PathBuf;
use std::process::Command;
use std::sync::OnceLock;

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::PackageRecord;
use crate::error::GgdError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallRequest {
    /// Package specs, `name` or `name=version`.
    pub packages: Vec<String>,
    pub prefix: Utf8PathBuf,
    /// Channels in priority order.
    pub channels: Vec<String>,
    /// Extra environment passed to the package manager process.
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvironmentInfo {
    pub root_prefix: Utf8PathBuf,
    pub active_prefix: Option<Utf8PathBuf>,
}

impl EnvironmentInfo {
    /// Package cache the package manager downloads into.
    pub fn root_pkgs_dir(&self) -> Utf8PathBuf {
        self.root_prefix.join("pkgs")
    }

    /// Environment commands act on when no prefix is given.
    pub fn default_prefix(&self) -> &Utf8Path {
        self.active_prefix.as_deref().unwrap_or(&self.root_prefix)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoveOutcome {
    Removed,
    NotInstalled,
}

pub trait PackageManager: Send + Sync {
    /// Install with full dependency resolution.
    fn install(&self, request: &InstallRequest) -> Result<(), GgdError>;
    /// Install a pre-staged artifact, skipping dependency resolution.
    fn install_bypassing_solver(&self, request: &InstallRequest) -> Result<(), GgdError>;
    fn uninstall(&self, name: &str, prefix: &Utf8Path) -> Result<RemoveOutcome, GgdError>;
    fn list_installed(&self, prefix: &Utf8Path) -> Result<Vec<PackageRecord>, GgdError>;
    fn environment(&self) -> Result<EnvironmentInfo, GgdError>;
    /// Build a recipe directory into an installable artifact.
    fn build(&self, recipe_dir: &Utf8Path) -> Result<Utf8PathBuf, GgdError>;
    fn install_local_artifact(&self, artifact: &Utf8Path, prefix: &Utf8Path)
    -> Result<(), GgdError>;
}

/// `conda` driven through its `--json` command line.
#[derive(Debug, Clone)]
pub struct CondaCli {
    executable: PathBuf,
}

impl CondaCli {
    pub fn new(program: &str) -> Result<Self, GgdError> {
        let executable = if program.contains(std::path::MAIN_SEPARATOR) {
            Some(PathBuf::from(program))
        } else {
            find_in_path(program).or_else(|| std::env::var_os("CONDA_EXE").map(PathBuf::from))
        };
        let executable = executable
            .filter(|path| path.exists())
            .ok_or_else(|| GgdError::MissingTool(program.to_string()))?;
        Ok(Self { executable })
    }

    fn run(&self, args: &[String], env: &[(String, String)]) -> Result<String, GgdError> {
        debug!(program = %self.executable.display(), ?args, "running package manager");
        let mut cmd = Command::new(&self.executable);
        cmd.args(args);
        for (key, value) in env {
            cmd.env(key, value);
        }
        let output = cmd
            .output()
            .map_err(|err| GgdError::PackageManager(err.to_string()))?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if output.status.success() {
            return Ok(stdout);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(GgdError::PackageManager(failure_message(
            &stdout,
            &stderr,
            output.status.code(),
        )))
    }

    fn install_args(request: &InstallRequest, bypass_solver: bool) -> Vec<String> {
        let mut args = vec![
            "install".to_string(),
            "--yes".to_string(),
            "--json".to_string(),
            "--prefix".to_string(),
            request.prefix.to_string(),
        ];
        for channel in &request.channels {
            args.push("--channel".to_string());
            args.push(channel.clone());
        }
        if bypass_solver {
            args.push("--no-deps".to_string());
        }
        args.extend(request.packages.iter().cloned());
        args
    }
}

impl PackageManager for CondaCli {
    fn install(&self, request: &InstallRequest) -> Result<(), GgdError> {
        self.run(&Self::install_args(request, false), &request.env)
            .map(|_| ())
    }

    fn install_bypassing_solver(&self, request: &InstallRequest) -> Result<(), GgdError> {
        self.run(&Self::install_args(request, true), &request.env)
            .map(|_| ())
    }

    fn uninstall(&self, name: &str, prefix: &Utf8Path) -> Result<RemoveOutcome, GgdError> {
        let installed = self.list_installed(prefix)?;
        if !installed.iter().any(|record| record.name == name) {
            return Ok(RemoveOutcome::NotInstalled);
        }
        let args = vec![
            "remove".to_string(),
            "--yes".to_string(),
            "--json".to_string(),
            "--prefix".to_string(),
            prefix.to_string(),
            name.to_string(),
        ];
        self.run(&args, &[])?;
        Ok(RemoveOutcome::Removed)
    }

    fn list_installed(&self, prefix: &Utf8Path) -> Result<Vec<PackageRecord>, GgdError> {
        let args = vec![
            "list".to_string(),
            "--json".to_string(),
            "--prefix".to_string(),
            prefix.to_string(),
        ];
        parse_list_output(&self.run(&args, &[])?)
    }

    fn environment(&self) -> Result<EnvironmentInfo, GgdError> {
        let args = vec!["info".to_string(), "--json".to_string()];
        parse_info_output(&self.run(&args, &[])?)
    }

    fn build(&self, recipe_dir: &Utf8Path) -> Result<Utf8PathBuf, GgdError> {
        let dir = recipe_dir.to_string();
        self.run(&["build".to_string(), dir.clone()], &[])?;
        let output = self.run(&["build".to_string(), dir, "--output".to_string()], &[])?;
        output
            .lines()
            .map(str::trim)
            .rfind(|line| !line.is_empty())
            .map(Utf8PathBuf::from)
            .ok_or_else(|| GgdError::PackageManager("build reported no artifact".to_string()))
    }

    fn install_local_artifact(
        &self,
        artifact: &Utf8Path,
        prefix: &Utf8Path,
    ) -> Result<(), GgdError> {
        let args = vec![
            "install".to_string(),
            "--yes".to_string(),
            "--json".to_string(),
            "--use-local".to_string(),
            "--prefix".to_string(),
            prefix.to_string(),
            artifact.to_string(),
        ];
        self.run(&args, &[]).map(|_| ())
    }
}

#[derive(Debug, Deserialize)]
struct ListedPackage {
    name: String,
    version: String,
    #[serde(default)]
    build_number: u64,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    base_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InfoOutput {
    root_prefix: String,
    #[serde(default)]
    active_prefix: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JsonFailure {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

pub fn parse_list_output(stdout: &str) -> Result<Vec<PackageRecord>, GgdError> {
    let listed: Vec<ListedPackage> = serde_json::from_str(stdout)
        .map_err(|err| GgdError::PackageManager(format!("unreadable package list: {err}")))?;
    Ok(listed
        .into_iter()
        .map(|package| PackageRecord {
            name: package.name,
            version: package.version,
            build_number: package.build_number,
            channel: package.channel.or(package.base_url).unwrap_or_default(),
        })
        .collect())
}

pub fn parse_info_output(stdout: &str) -> Result<EnvironmentInfo, GgdError> {
    let info: InfoOutput = serde_json::from_str(stdout)
        .map_err(|err| GgdError::PackageManager(format!("unreadable environment info: {err}")))?;
    Ok(EnvironmentInfo {
        root_prefix: Utf8PathBuf::from(info.root_prefix),
        active_prefix: info.active_prefix.map(Utf8PathBuf::from),
    })
}

/// A package cache entry, archive or unpacked directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkgCacheEntry {
    pub name: String,
    pub version: String,
    pub build: String,
}

impl PkgCacheEntry {
    /// Parse `name-version-build[.tar.bz2|.conda]`; names may contain `-`.
    pub fn parse(file_name: &str) -> Option<Self> {
        static PATTERN: OnceLock<Regex> = OnceLock::new();
        let pattern = PATTERN.get_or_init(|| {
            Regex::new(r"^(?P<name>.+)-(?P<version>[^-]+)-(?P<build>[^-]+?)(?:\.tar\.bz2|\.conda)?$")
                .expect("package cache pattern is valid")
        });
        let captures = pattern.captures(file_name)?;
        Some(Self {
            name: captures["name"].to_string(),
            version: captures["version"].to_string(),
            build: captures["build"].to_string(),
        })
    }

    pub fn matches(&self, name: &str, version: Option<&str>) -> bool {
        self.name == name && version.is_none_or(|version| self.version == version)
    }
}

/// The tool's own failure text, kept verbatim where it gave one.
fn failure_message(stdout: &str, stderr: &str, code: Option<i32>) -> String {
    if let Ok(failure) = serde_json::from_str::<JsonFailure>(stdout) {
        if let Some(message) = failure.message.or(failure.error) {
            return message.trim().to_string();
        }
    }
    let stderr = stderr.trim();
    if !stderr.is_empty() {
        return stderr.to_string();
    }
    let stdout = stdout.trim();
    if !stdout.is_empty() {
        return stdout.to_string();
    }
    match code {
        Some(code) => format!("package manager exited with status {code}"),
        None => "package manager terminated by signal".to_string(),
    }
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.exists() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.exists() {
            return Some(plain);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_list_prefers_channel_name() {
        let stdout = r#"[
            {"name": "hg19-gaps-ucsc-v1", "version": "1", "build_number": 2,
             "channel": "ggd-genomics", "base_url": "https://conda.anaconda.org/ggd-genomics"},
            {"name": "zlib", "version": "1.3", "base_url": "https://conda.anaconda.org/conda-forge"}
        ]"#;
        let records = parse_list_output(stdout).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].channel, "ggd-genomics");
        assert_eq!(records[0].build_number, 2);
        assert!(records[1].channel.ends_with("conda-forge"));
        assert!(records[0].is_ggd_package());
        assert!(!records[1].is_ggd_package());
    }

    #[test]
    fn parse_info_reads_prefixes() {
        let info = parse_info_output(
            r#"{"root_prefix": "/opt/conda", "active_prefix": null, "pkgs_dirs": ["/opt/conda/pkgs"]}"#,
        )
        .unwrap();
        assert_eq!(info.root_prefix, Utf8PathBuf::from("/opt/conda"));
        assert_eq!(info.default_prefix(), Utf8Path::new("/opt/conda"));
        assert_eq!(info.root_pkgs_dir(), Utf8PathBuf::from("/opt/conda/pkgs"));
    }

    #[test]
    fn failure_message_is_verbatim() {
        let stdout = r#"{"exception_name": "PackagesNotFoundError", "message": "PackagesNotFoundError: x"}"#;
        assert_eq!(
            failure_message(stdout, "", Some(1)),
            "PackagesNotFoundError: x"
        );
        assert_eq!(failure_message("", "  boom \n", Some(1)), "boom");
        assert_eq!(
            failure_message("", "", Some(2)),
            "package manager exited with status 2"
        );
    }

    #[test]
    fn pkg_cache_names_split_from_the_right() {
        let entry = PkgCacheEntry::parse("hg19-gaps-ucsc-v1-1-3.tar.bz2").unwrap();
        assert_eq!(entry.name, "hg19-gaps-ucsc-v1");
        assert_eq!(entry.version, "1");
        assert_eq!(entry.build, "3");
        assert!(entry.matches("hg19-gaps-ucsc-v1", Some("1")));
        assert!(!entry.matches("hg19-gaps-ucsc", None));

        let unpacked = PkgCacheEntry::parse("hg19-gaps-ucsc-v1-1-3").unwrap();
        assert_eq!(unpacked, entry);
        let conda = PkgCacheEntry::parse("zlib-1.3-h4ab18f5_1.conda").unwrap();
        assert_eq!(conda.name, "zlib");
        assert_eq!(conda.build, "h4ab18f5_1");
        assert!(PkgCacheEntry::parse("urls.txt").is_none());
    }

    #[test]
    fn install_args_embed_prefix_channels_and_spec() {
        let request = InstallRequest {
            packages: vec!["hg19-gaps-ucsc-v1=1".to_string()],
            prefix: Utf8PathBuf::from("/envs/a"),
            channels: vec!["ggd-genomics".to_string(), "bioconda".to_string()],
            env: Vec::new(),
        };
        let args = CondaCli::install_args(&request, true);
        assert_eq!(
            args,
            vec![
                "install",
                "--yes",
                "--json",
                "--prefix",
                "/envs/a",
                "--channel",
                "ggd-genomics",
                "--channel",
                "bioconda",
                "--no-deps",
                "hg19-gaps-ucsc-v1=1"
            ]
        );
    }
}
