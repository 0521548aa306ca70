//! Pre-cache manifest
//!
//! Names the current cache generation and lists what gets fetched on
//! install. The generation name must change whenever the resource set does;
//! the worker never inspects content to detect staleness.
//!
//! ```json
//! { "cacheName": "jspsych-offline-v2",
//!   "localUrls": ["./", "index.html"],
//!   "remoteUrls": ["https://unpkg.com/jspsych@8"] }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use url::Url;

/// Generation name shipped with the experiment.
pub const DEFAULT_CACHE_NAME: &str = "jspsych-offline-v1";

const DEFAULT_LOCAL_URLS: &[&str] = &[
    "./",
    "index.html",
    "admin/",
    "admin/index.html",
    "manifest.json",
    "experiment.js",
    "admin/admin.js",
];

const DEFAULT_REMOTE_URLS: &[&str] = &[
    "https://unpkg.com/jspsych@8",
    "https://unpkg.com/@jspsych/plugin-html-button-response@2",
    "https://unpkg.com/@jspsych/plugin-html-keyboard-response@2",
    "https://unpkg.com/@jspsych/plugin-preload@2",
    "https://unpkg.com/@jspsych/offline-storage@0.4.0",
];

/// Manifest loading errors.
#[derive(Debug)]
pub enum ManifestError {
    /// Manifest file could not be read.
    Io(std::io::Error),
    /// Manifest is not valid JSON for this schema.
    Parse(serde_json::Error),
    /// Cache name is empty.
    EmptyCacheName,
}

impl core::fmt::Display for ManifestError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ManifestError::Io(e) => write!(f, "cannot read manifest: {}", e),
            ManifestError::Parse(e) => write!(f, "invalid manifest: {}", e),
            ManifestError::EmptyCacheName => write!(f, "manifest cache name is empty"),
        }
    }
}

impl std::error::Error for ManifestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ManifestError::Io(e) => Some(e),
            ManifestError::Parse(e) => Some(e),
            ManifestError::EmptyCacheName => None,
        }
    }
}

impl From<std::io::Error> for ManifestError {
    fn from(e: std::io::Error) -> Self {
        ManifestError::Io(e)
    }
}

impl From<serde_json::Error> for ManifestError {
    fn from(e: serde_json::Error) -> Self {
        ManifestError::Parse(e)
    }
}

/// Static pre-cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrecacheManifest {
    /// Name of the current cache generation.
    pub cache_name: String,
    /// Same-origin paths, relative to the worker location.
    #[serde(default)]
    pub local_urls: Vec<String>,
    /// Cross-origin absolute URLs.
    #[serde(default)]
    pub remote_urls: Vec<String>,
}

impl Default for PrecacheManifest {
    fn default() -> Self {
        Self {
            cache_name: DEFAULT_CACHE_NAME.to_string(),
            local_urls: DEFAULT_LOCAL_URLS.iter().map(|s| s.to_string()).collect(),
            remote_urls: DEFAULT_REMOTE_URLS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl PrecacheManifest {
    /// Manifest with a cache name and no resources.
    pub fn new(cache_name: impl Into<String>) -> Self {
        Self {
            cache_name: cache_name.into(),
            local_urls: Vec::new(),
            remote_urls: Vec::new(),
        }
    }

    pub fn with_local(mut self, path: impl Into<String>) -> Self {
        self.local_urls.push(path.into());
        self
    }

    pub fn with_remote(mut self, url: impl Into<String>) -> Self {
        self.remote_urls.push(url.into());
        self
    }

    /// Parse and validate a JSON manifest.
    pub fn from_json(json: &str) -> Result<Self, ManifestError> {
        let manifest: Self = serde_json::from_str(json)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Read and validate a JSON manifest file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.cache_name.trim().is_empty() {
            return Err(ManifestError::EmptyCacheName);
        }
        Ok(())
    }

    /// Resolve local paths against the worker's own URL, in list order.
    ///
    /// Uses WHATWG join semantics, so `./` under
    /// `https://host/study/sw.js` becomes `https://host/study/`.
    pub fn resolve_local(&self, location: &Url) -> Vec<(String, Result<Url, url::ParseError>)> {
        self.local_urls
            .iter()
            .map(|path| (path.clone(), location.join(path)))
            .collect()
    }

    /// Parse remote URLs, in list order.
    pub fn resolve_remote(&self) -> Vec<(String, Result<Url, url::ParseError>)> {
        self.remote_urls
            .iter()
            .map(|raw| (raw.clone(), Url::parse(raw)))
            .collect()
    }
}
