use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::domain::{is_plain_identifier, validate_channel};
use crate::error::GgdError;
use crate::store::DEFAULT_NAMESPACE;

pub const DEFAULT_CHANNEL: &str = "genomics";
pub const DEFAULT_CATALOG_URL: &str = "https://raw.githubusercontent.com/gogetdata/ggd-metadata/master/channeldata/{channel}/channeldata.json";
pub const CONFIG_ENV: &str = "GGD_CONFIG";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub default_channel: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub catalog_url: Option<String>,
    #[serde(default)]
    pub cache_dir: Option<String>,
    #[serde(default)]
    pub catalog_timeout_secs: Option<u64>,
    #[serde(default)]
    pub package_manager: Option<String>,
    #[serde(default)]
    pub extra_channels: Option<Vec<String>>,
    #[serde(default)]
    pub channels: Vec<ChannelEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ChannelEntry {
    Shorthand(String),
    Detailed(ChannelEntryObject),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ChannelEntryObject {
    pub name: String,
    #[serde(default)]
    pub catalog_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSettings {
    pub name: String,
    pub catalog_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub default_channel: String,
    pub namespace: String,
    pub catalog_url: String,
    pub cache_dir: Utf8PathBuf,
    pub catalog_timeout: Option<Duration>,
    pub package_manager: String,
    pub extra_channels: Vec<String>,
    pub channels: Vec<ChannelSettings>,
}

impl ResolvedConfig {
    /// Catalog URL for a channel: a per-channel override, else the template.
    pub fn catalog_url_for(&self, channel: &str) -> String {
        self.channels
            .iter()
            .find(|settings| settings.name == channel)
            .and_then(|settings| settings.catalog_url.clone())
            .unwrap_or_else(|| self.catalog_url.replace("{channel}", channel))
    }

    /// Conda channels searched for a ggd channel, ggd's own first.
    pub fn conda_channels(&self, channel: &str) -> Vec<String> {
        let mut channels = vec![format!("ggd-{channel}")];
        channels.extend(self.extra_channels.iter().cloned());
        channels
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, GgdError> {
        let explicit = path
            .map(PathBuf::from)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));

        let config_path = match explicit {
            Some(path) => path,
            None => match default_config_path() {
                Some(path) if path.exists() => path,
                _ => return Self::resolve_config(Config::default()),
            },
        };

        let content = fs::read_to_string(&config_path)
            .map_err(|_| GgdError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| GgdError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, GgdError> {
        let schema_version = config.schema_version.unwrap_or(1);

        let cache_dir = match config.cache_dir {
            Some(dir) => Utf8PathBuf::from(dir),
            None => default_cache_dir()?,
        };

        let channels = config
            .channels
            .into_iter()
            .map(|entry| match entry {
                ChannelEntry::Shorthand(name) => ChannelSettings {
                    name,
                    catalog_url: None,
                },
                ChannelEntry::Detailed(obj) => ChannelSettings {
                    name: obj.name,
                    catalog_url: obj.catalog_url,
                },
            })
            .collect();

        let default_channel = config
            .default_channel
            .unwrap_or_else(|| DEFAULT_CHANNEL.to_string());
        validate_channel(&default_channel)?;
        let namespace = config
            .namespace
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
        if !is_plain_identifier(&namespace) {
            return Err(GgdError::ConfigParse(format!(
                "namespace '{namespace}' must be a single directory name"
            )));
        }

        Ok(ResolvedConfig {
            schema_version,
            default_channel,
            namespace,
            catalog_url: config
                .catalog_url
                .unwrap_or_else(|| DEFAULT_CATALOG_URL.to_string()),
            cache_dir,
            catalog_timeout: config.catalog_timeout_secs.map(Duration::from_secs),
            package_manager: config
                .package_manager
                .unwrap_or_else(|| "conda".to_string()),
            extra_channels: config.extra_channels.unwrap_or_else(default_extra_channels),
            channels,
        })
    }
}

pub fn default_extra_channels() -> Vec<String> {
    vec!["bioconda".to_string(), "conda-forge".to_string()]
}

fn default_config_path() -> Option<PathBuf> {
    BaseDirs::new().map(|dirs| dirs.config_dir().join("ggd").join("config.json"))
}

fn default_cache_dir() -> Result<Utf8PathBuf, GgdError> {
    BaseDirs::new()
        .and_then(|dirs| Utf8PathBuf::from_path_buf(dirs.home_dir().join(".cache").join("ggd")).ok())
        .ok_or_else(|| GgdError::Filesystem("unable to resolve cache directory".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let resolved = ConfigLoader::resolve_config(Config {
            cache_dir: Some("/tmp/ggd-cache".to_string()),
            ..Config::default()
        })
        .unwrap();
        assert_eq!(resolved.schema_version, 1);
        assert_eq!(resolved.default_channel, "genomics");
        assert_eq!(resolved.namespace, "ggd");
        assert_eq!(resolved.package_manager, "conda");
        assert!(resolved.catalog_timeout.is_none());
        assert_eq!(
            resolved.conda_channels("genomics"),
            vec!["ggd-genomics", "bioconda", "conda-forge"]
        );
    }

    #[test]
    fn channel_override_wins_over_template() {
        let config: Config = serde_json::from_str(
            r#"{
                "cache_dir": "/tmp/c",
                "catalog_timeout_secs": 15,
                "channels": [
                    "genomics",
                    {"name": "proteomics", "catalog_url": "file:///srv/proteomics.json"}
                ]
            }"#,
        )
        .unwrap();
        let resolved = ConfigLoader::resolve_config(config).unwrap();
        assert_eq!(resolved.catalog_timeout, Some(Duration::from_secs(15)));
        assert_eq!(
            resolved.catalog_url_for("proteomics"),
            "file:///srv/proteomics.json"
        );
        assert!(
            resolved
                .catalog_url_for("genomics")
                .ends_with("channeldata/genomics/channeldata.json")
        );
    }
}
