use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use url::Url;

use super::{KeyPair, UrlPattern, parse_key_list};
use crate::config::resolve_install_path;
use crate::http::{HttpError, HttpOptions, RoutedClient};
use crate::proxy::{ProxyPolicy, RequestKind};

#[derive(Debug, thiserror::Error)]
pub enum KeyDatabaseError {
    #[error("failed to read key database {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to fetch key database {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: HttpError,
    },

    #[error("malformed key database: {0}")]
    Malformed(String),
}

/// Where the key database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseLocation {
    File(PathBuf),
    Remote(Url),
}

impl DatabaseLocation {
    /// `http(s)` URLs are remote; anything else is a path, with relative
    /// paths resolved against `install_dir`.
    pub fn parse(source: &str, install_dir: &Path) -> Self {
        let source = source.trim();
        if source.starts_with("http://") || source.starts_with("https://") {
            if let Ok(url) = Url::parse(source) {
                return Self::Remote(url);
            }
        }

        Self::File(resolve_install_path(install_dir, Path::new(source)))
    }
}

/// A single pattern and the keys it maps to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEntry {
    pub pattern: UrlPattern,
    pub keys: Vec<KeyPair>,
}

/// Ordered, read-only key database.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyDatabase {
    entries: Vec<KeyEntry>,
}

impl KeyDatabase {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[KeyEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parse a JSON object of `pattern -> "key[,kid:key...]"`, keeping
    /// document order. Entries whose value is not a string are skipped.
    pub fn from_json(document: &str) -> Result<Self, KeyDatabaseError> {
        let object: Map<String, Value> = serde_json::from_str(document)
            .map_err(|e| KeyDatabaseError::Malformed(e.to_string()))?;

        let mut entries = Vec::with_capacity(object.len());
        for (pattern, value) in object {
            let Some(keys) = value.as_str() else {
                warn!(pattern = %pattern, "Skipping key database entry with non-string value");
                continue;
            };
            let keys = parse_key_list(keys);
            if keys.is_empty() {
                warn!(pattern = %pattern, "Skipping key database entry without keys");
                continue;
            }
            entries.push(KeyEntry {
                pattern: UrlPattern::new(pattern),
                keys,
            });
        }

        Ok(Self { entries })
    }

    pub fn first_match(&self, clean_url: &str) -> Option<&KeyEntry> {
        self.entries
            .iter()
            .find(|entry| entry.pattern.matches(clean_url))
    }

    /// Load the database. Remote documents are always fetched directly,
    /// never through the configured proxy.
    pub async fn load(
        location: &DatabaseLocation,
        http: &HttpOptions,
    ) -> Result<Self, KeyDatabaseError> {
        let document = match location {
            DatabaseLocation::File(path) => {
                tokio::fs::read_to_string(path)
                    .await
                    .map_err(|source| KeyDatabaseError::Read {
                        path: path.clone(),
                        source,
                    })?
            }
            DatabaseLocation::Remote(url) => {
                fetch_document(url, http)
                    .await
                    .map_err(|source| KeyDatabaseError::Fetch {
                        url: url.to_string(),
                        source,
                    })?
            }
        };

        let database = Self::from_json(&document)?;
        info!(
            entries = database.entries.len(),
            source = ?location,
            "Loaded key database"
        );
        Ok(database)
    }

    /// Like [`KeyDatabase::load`], but any failure degrades to an empty
    /// database and is only logged.
    pub async fn load_or_empty(location: &DatabaseLocation, http: &HttpOptions) -> Self {
        match Self::load(location, http).await {
            Ok(database) => database,
            Err(e) => {
                warn!(error = %e, "Key database unavailable, continuing without external keys");
                Self::empty()
            }
        }
    }
}

async fn fetch_document(url: &Url, http: &HttpOptions) -> Result<String, HttpError> {
    debug!(url = %url, "Fetching remote key database without proxy");
    let client = RoutedClient::new(http, ProxyPolicy::direct())?;
    let response = client.fetch(RequestKind::KeyDatabase, url, None).await?;
    Ok(response.text().await?)
}
