use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use camino::Utf8PathBuf;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GgdError;

/// Genome build value marking a recipe whose identity is supplied at install time.
pub const META_RECIPE_BUILD: &str = "meta-recipe";

/// Tag value under `cached` telling us the artifact was pre-staged for direct retrieval.
pub const CACHED_MARKER: &str = "uploaded_to_aws";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecipeName(String);

impl RecipeName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecipeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RecipeName {
    type Err = GgdError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        static PATTERN: OnceLock<Regex> = OnceLock::new();
        let pattern = PATTERN.get_or_init(|| {
            Regex::new(r"^[a-z0-9][a-z0-9._-]*$").expect("recipe name pattern is valid")
        });
        let normalized = value.trim().to_lowercase();
        if !pattern.is_match(&normalized) {
            return Err(GgdError::InvalidRecipeName(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

/// A single path component with no separators and no leading dot.
pub fn is_plain_identifier(value: &str) -> bool {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").expect("identifier pattern is valid")
    });
    pattern.is_match(value)
}

/// Channel names end up in cache paths and package manager arguments.
pub fn validate_channel(channel: &str) -> Result<&str, GgdError> {
    if is_plain_identifier(channel) {
        Ok(channel)
    } else {
        Err(GgdError::InvalidChannel(channel.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RequestedVersion {
    #[default]
    Latest,
    Exact(String),
}

impl RequestedVersion {
    pub fn matches(&self, version: &str) -> bool {
        match self {
            RequestedVersion::Latest => true,
            RequestedVersion::Exact(wanted) => wanted == version,
        }
    }

    pub fn pinned(&self) -> Option<&str> {
        match self {
            RequestedVersion::Latest => None,
            RequestedVersion::Exact(version) => Some(version),
        }
    }
}

impl fmt::Display for RequestedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestedVersion::Latest => write!(f, "latest"),
            RequestedVersion::Exact(version) => write!(f, "{version}"),
        }
    }
}

impl FromStr for RequestedVersion {
    type Err = GgdError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        match trimmed {
            "" | "-1" | "latest" => Ok(RequestedVersion::Latest),
            other => Ok(RequestedVersion::Exact(other.to_string())),
        }
    }
}

/// Typed view over a catalog entry's `tags` mapping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecipeTags {
    #[serde(default)]
    pub cached: Vec<String>,
    #[serde(default, rename = "final-files")]
    pub final_files: Vec<String>,
    #[serde(default, rename = "final-file-sizes")]
    pub final_file_sizes: BTreeMap<String, String>,
    #[serde(default, rename = "data-version")]
    pub data_version: Option<String>,
    #[serde(default, rename = "ggd-channel")]
    pub ggd_channel: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl RecipeTags {
    pub fn is_cached(&self) -> bool {
        self.cached.iter().any(|value| value == CACHED_MARKER)
    }

    /// Lenient reading of a catalog `tags` value. Numbers are accepted where
    /// strings are expected, a lone string counts as a one-item list, and
    /// values of any other shape are dropped.
    pub fn from_value(value: Value) -> Self {
        let Value::Object(mut map) = value else {
            return Self::default();
        };
        let mut take = |key: &str| map.remove(key);
        let cached = scalar_list(take("cached"));
        let final_files = scalar_list(take("final-files"));
        let final_file_sizes = match take("final-file-sizes") {
            Some(Value::Object(sizes)) => sizes
                .into_iter()
                .filter_map(|(file, size)| scalar(size).map(|size| (file, size)))
                .collect(),
            _ => BTreeMap::new(),
        };
        let data_version = take("data-version").and_then(scalar);
        let ggd_channel = take("ggd-channel").and_then(scalar);
        Self {
            cached,
            final_files,
            final_file_sizes,
            data_version,
            ggd_channel,
            extra: map.into_iter().collect(),
        }
    }
}

/// A string, number or boolean as text.
pub(crate) fn scalar(value: Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

fn scalar_list(value: Option<Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items.into_iter().filter_map(scalar).collect(),
        Some(other) => scalar(other).into_iter().collect(),
        None => Vec::new(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecipeDescriptor {
    pub name: RecipeName,
    pub species: String,
    pub genome_build: String,
    pub version: String,
    pub channel: String,
    pub tags: RecipeTags,
}

impl RecipeDescriptor {
    pub fn is_meta_recipe(&self) -> bool {
        self.genome_build == META_RECIPE_BUILD
    }
}

#[derive(Debug, Clone)]
pub struct InstallTarget {
    pub recipe: RecipeDescriptor,
    pub requested_version: RequestedVersion,
    pub prefix: Utf8PathBuf,
    pub meta_recipe_id: Option<String>,
}

impl InstallTarget {
    pub fn new(
        recipe: RecipeDescriptor,
        requested_version: RequestedVersion,
        prefix: Utf8PathBuf,
        meta_recipe_id: Option<String>,
    ) -> Result<Self, GgdError> {
        let meta_recipe_id = meta_recipe_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty());
        if recipe.is_meta_recipe() && meta_recipe_id.is_none() {
            return Err(GgdError::MissingMetaRecipeId(recipe.name.to_string()));
        }
        if let (Some(id), true) = (&meta_recipe_id, recipe.is_meta_recipe()) {
            if !is_plain_identifier(id) {
                return Err(GgdError::InvalidMetaRecipeId(id.clone()));
            }
        }
        Ok(Self {
            recipe,
            requested_version,
            prefix,
            meta_recipe_id,
        })
    }

    /// Name the package manager tracks the recipe under.
    pub fn package_name(&self) -> &str {
        self.recipe.name.as_str()
    }

    /// Name used for the storage directory and environment variables.
    pub fn storage_name(&self) -> String {
        match &self.meta_recipe_id {
            Some(id) if self.recipe.is_meta_recipe() => {
                let base = self
                    .recipe
                    .name
                    .as_str()
                    .strip_prefix("meta-recipe-")
                    .unwrap_or(self.recipe.name.as_str());
                format!("{}-{base}", id.to_lowercase())
            }
            _ => self.recipe.name.as_str().to_string(),
        }
    }

    /// Version that will land on disk: the pinned one, or the catalog's current one.
    pub fn resolved_version(&self) -> &str {
        self.requested_version
            .pinned()
            .unwrap_or(self.recipe.version.as_str())
    }

    /// Package spec handed to the package manager, `name` or `name=version`.
    pub fn package_spec(&self) -> String {
        match self.requested_version.pinned() {
            Some(version) => format!("{}={version}", self.package_name()),
            None => self.package_name().to_string(),
        }
    }
}

/// One package as reported by the external package manager's list operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRecord {
    pub name: String,
    pub version: String,
    pub build_number: u64,
    pub channel: String,
}

impl PackageRecord {
    /// Records that live on one of ggd's own conda channels.
    pub fn is_ggd_package(&self) -> bool {
        self.channel
            .rsplit('/')
            .next()
            .map(|channel| channel.starts_with("ggd-"))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstalledFile {
    pub path: Utf8PathBuf,
    pub modified: Option<String>,
}

/// On-disk evidence that a recipe is materialized in a prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstalledRecord {
    pub directory_path: Utf8PathBuf,
    pub files: Vec<InstalledFile>,
    pub package_record: PackageRecord,
}
