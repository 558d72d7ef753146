use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum GgdError {
    #[error("invalid recipe name: {0}")]
    InvalidRecipeName(String),

    #[error("catalog for channel '{channel}' is unavailable: no network and no cached copy")]
    #[diagnostic(help("check your network connection and retry once the catalog can be fetched"))]
    CatalogUnavailable { channel: String },

    #[error("catalog request failed: {0}")]
    CatalogHttp(String),

    #[error("catalog returned status {status}: {message}")]
    CatalogStatus { status: u16, message: String },

    #[error("failed to parse catalog for channel '{channel}': {message}")]
    CatalogParse { channel: String, message: String },

    #[error("recipe '{name}' was not found in the '{channel}' channel")]
    RecipeNotFound {
        name: String,
        channel: String,
        #[help]
        hint: Option<String>,
    },

    #[error("recipe '{name}' version {version} is already installed in {prefix}")]
    AlreadyInstalled {
        name: String,
        version: String,
        prefix: String,
    },

    #[error("failed to install '{name}': {cause}")]
    #[diagnostic(help("the partial install was rolled back; fix the cause above and retry"))]
    InstallFailed { name: String, cause: String },

    #[error("failed to uninstall '{name}': {cause}")]
    UninstallFailed { name: String, cause: String },

    #[error("file integrity check failed for '{name}': missing {missing:?}")]
    #[diagnostic(help("the partial install was rolled back; retry the install"))]
    FileIntegrity { name: String, missing: Vec<String> },

    #[error("'{name}' is in an inconsistent state in {prefix}: {detail}")]
    #[diagnostic(help("run `ggd uninstall` for this recipe and prefix to clean up, then install again"))]
    InconsistentState {
        name: String,
        prefix: String,
        detail: String,
    },

    #[error("invalid environment prefix: {0}")]
    #[diagnostic(help("pass the path of an existing conda environment with --prefix"))]
    InvalidPrefix(String),

    #[error("'{0}' is a meta-recipe and needs an identifier")]
    #[diagnostic(help("pass the identifier with --id"))]
    MissingMetaRecipeId(String),

    #[error("invalid meta-recipe identifier: {0}")]
    #[diagnostic(help("identifiers use letters, digits, '.', '_' and '-', such as GSE123"))]
    InvalidMetaRecipeId(String),

    #[error("invalid channel name: {0}")]
    InvalidChannel(String),

    #[error("package manager error: {0}")]
    PackageManager(String),

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("interrupted; the in-flight operation was rolled back")]
    Interrupted,
}

impl GgdError {
    /// Outcomes that mean "already in the desired state" rather than failure.
    pub fn is_informational(&self) -> bool {
        matches!(self, GgdError::AlreadyInstalled { .. })
    }
}
