use std::collections::BTreeMap;
use std::fs;
use std::thread;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::ResolvedConfig;
use crate::domain::{RecipeDescriptor, RecipeName, RecipeTags, scalar, validate_channel};
use crate::error::GgdError;
use crate::store::Store;

/// Recipes known to one channel, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    channel: String,
    packages: BTreeMap<String, RecipeDescriptor>,
}

#[derive(Debug, Deserialize)]
struct RawCatalog {
    #[serde(default)]
    packages: Option<BTreeMap<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct RawPackage {
    #[serde(default)]
    identifiers: Option<RawIdentifiers>,
    #[serde(default)]
    version: Option<Value>,
    #[serde(default)]
    tags: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RawIdentifiers {
    #[serde(default)]
    species: Option<String>,
    #[serde(default, rename = "genome-build")]
    genome_build: Option<String>,
}

impl Catalog {
    pub fn empty(channel: &str) -> Self {
        Self {
            channel: channel.to_string(),
            packages: BTreeMap::new(),
        }
    }

    /// Parse a channeldata document. An empty body or a missing `packages`
    /// mapping is an empty catalog; entries that cannot be placed on disk
    /// (no species, build or version) are skipped.
    pub fn from_json(channel: &str, bytes: &[u8]) -> Result<Self, GgdError> {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::empty(channel));
        }
        let raw: Option<RawCatalog> =
            serde_json::from_slice(bytes).map_err(|err| GgdError::CatalogParse {
                channel: channel.to_string(),
                message: err.to_string(),
            })?;

        let mut packages = BTreeMap::new();
        for (name, entry) in raw.and_then(|raw| raw.packages).unwrap_or_default() {
            let Ok(recipe_name) = name.parse::<RecipeName>() else {
                debug!(%name, "skipping catalog entry with invalid name");
                continue;
            };
            let package = match serde_json::from_value::<RawPackage>(entry) {
                Ok(package) => package,
                Err(err) => {
                    warn!(%name, error = %err, "skipping malformed catalog entry");
                    continue;
                }
            };
            let identifiers = package.identifiers;
            let species = identifiers.as_ref().and_then(|ids| ids.species.clone());
            let genome_build = identifiers.and_then(|ids| ids.genome_build);
            let version = package.version.and_then(scalar);
            let (Some(species), Some(genome_build), Some(version)) =
                (species, genome_build, version)
            else {
                debug!(%name, "skipping catalog entry without identifiers or version");
                continue;
            };
            let tags = package.tags.map(RecipeTags::from_value).unwrap_or_default();
            let recipe_channel = match tags.ggd_channel.as_deref() {
                Some(own) if validate_channel(own).is_ok() => own.to_string(),
                Some(own) => {
                    debug!(%name, channel = own, "ignoring unusable ggd-channel tag");
                    channel.to_string()
                }
                None => channel.to_string(),
            };
            packages.insert(
                recipe_name.as_str().to_string(),
                RecipeDescriptor {
                    name: recipe_name,
                    species,
                    genome_build,
                    version,
                    channel: recipe_channel,
                    tags,
                },
            );
        }

        Ok(Self {
            channel: channel.to_string(),
            packages,
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&RecipeDescriptor> {
        self.packages.get(name)
    }

    pub fn require(&self, name: &RecipeName) -> Result<&RecipeDescriptor, GgdError> {
        self.get(name.as_str())
            .ok_or_else(|| GgdError::RecipeNotFound {
                name: name.to_string(),
                channel: self.channel.clone(),
                hint: self.suggestion(name.as_str()),
            })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.packages.keys().map(String::as_str)
    }

    fn suggestion(&self, name: &str) -> Option<String> {
        let stem = name.split('-').next().unwrap_or(name);
        let similar: Vec<&str> = self
            .names()
            .filter(|candidate| candidate.contains(name) || candidate.starts_with(stem))
            .take(5)
            .collect();
        if similar.is_empty() {
            None
        } else {
            Some(format!("did you mean one of: {}", similar.join(", ")))
        }
    }
}

pub trait CatalogClient: Send + Sync {
    fn fetch_catalog(&self, channel: &str) -> Result<Catalog, GgdError>;
}

#[derive(Clone)]
pub struct CatalogHttpClient {
    client: Client,
    config: ResolvedConfig,
}

impl CatalogHttpClient {
    pub fn new(config: &ResolvedConfig) -> Result<Self, GgdError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("ggd/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| GgdError::CatalogHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(config.catalog_timeout)
            .build()
            .map_err(|err| GgdError::CatalogHttp(err.to_string()))?;
        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    pub fn cache_path(&self, channel: &str) -> Utf8PathBuf {
        cache_path(&self.config.cache_dir, channel)
    }

    fn fetch_remote(&self, url: &str) -> Result<Vec<u8>, GgdError> {
        if let Some(path) = url.strip_prefix("file://") {
            return fs::read(path).map_err(|err| GgdError::CatalogHttp(format!("{path}: {err}")));
        }
        let response = self.send_with_retries(|| self.client.get(url))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "catalog request failed".to_string());
            return Err(GgdError::CatalogStatus { status, message });
        }
        let bytes = response
            .bytes()
            .map_err(|err| GgdError::CatalogHttp(err.to_string()))?;
        Ok(bytes.to_vec())
    }

    fn send_with_retries<F>(
        &self,
        mut make_req: F,
    ) -> Result<reqwest::blocking::Response, GgdError>
    where
        F: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            match make_req().send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        debug!(status, attempt, "retrying catalog request");
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        debug!(error = %err, attempt, "retrying catalog request");
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return Err(GgdError::CatalogHttp(err.to_string()));
                }
            }
        }
    }
}

impl CatalogClient for CatalogHttpClient {
    fn fetch_catalog(&self, channel: &str) -> Result<Catalog, GgdError> {
        let channel = validate_channel(channel)?;
        let url = self.config.catalog_url_for(channel);
        let cache = self.cache_path(channel);

        match self.fetch_remote(&url) {
            Ok(bytes) => {
                let catalog = Catalog::from_json(channel, &bytes)?;
                info!(channel, recipes = catalog.len(), "fetched catalog");
                if let Err(err) = Store::write_bytes_atomic(&cache, &bytes) {
                    warn!(error = %err, path = %cache, "failed to cache catalog");
                }
                Ok(catalog)
            }
            Err(err) => {
                warn!(error = %err, channel, "catalog fetch failed; trying cached copy");
                load_cached(channel, &cache, err)
            }
        }
    }
}

pub fn cache_path(cache_dir: &Utf8Path, channel: &str) -> Utf8PathBuf {
    cache_dir
        .join("channeldata")
        .join(channel)
        .join("channeldata.json")
}

fn load_cached(channel: &str, cache: &Utf8Path, cause: GgdError) -> Result<Catalog, GgdError> {
    match fs::read(cache.as_std_path()) {
        Ok(bytes) => {
            info!(channel, path = %cache, "using cached catalog");
            Catalog::from_json(channel, &bytes)
        }
        Err(_) => match cause {
            GgdError::CatalogStatus { .. } => Err(cause),
            _ => Err(GgdError::CatalogUnavailable {
                channel: channel.to_string(),
            }),
        },
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}
