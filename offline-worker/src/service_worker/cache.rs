//! Cache API Implementation
//!
//! Named cache generations and the storage abstraction the worker's lifecycle
//! handlers share.

use std::collections::BTreeMap;

use async_trait::async_trait;
use spin::RwLock;

use super::fetch::{Request, RequestMethod, Response};

/// Cache error types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Cache not found
    NotFound,
    /// Only GET requests can be stored
    InvalidRequest(String),
    /// Cache name cannot be used by this storage
    InvalidName(String),
    /// Backing storage failed
    StorageError(String),
}

impl core::fmt::Display for CacheError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            CacheError::NotFound => write!(f, "cache not found"),
            CacheError::InvalidRequest(s) => write!(f, "invalid request: {}", s),
            CacheError::InvalidName(s) => write!(f, "invalid cache name: {:?}", s),
            CacheError::StorageError(s) => write!(f, "storage error: {}", s),
        }
    }
}

impl std::error::Error for CacheError {}

/// Cache match options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheMatchOptions {
    /// Ignore search (query string)
    pub ignore_search: bool,
    /// Ignore method
    pub ignore_method: bool,
}

impl CacheMatchOptions {
    fn is_exact(&self) -> bool {
        !self.ignore_search && !self.ignore_method
    }

    /// Whether a stored request answers `query` under these options.
    pub fn matches(&self, stored: &Request, query: &Request) -> bool {
        if !self.ignore_method && stored.method != query.method {
            return false;
        }
        if self.ignore_search {
            stored.url_without_search() == query.url_without_search()
        } else {
            stored.url == query.url
        }
    }
}

/// Make a cache key from a request
pub fn cache_key(request: &Request) -> String {
    format!("{}:{}", request.method.as_str(), request.url)
}

/// A cached request-response pair
#[derive(Debug, Clone)]
struct CacheEntry {
    request: Request,
    response: Response,
    size: usize,
}

impl CacheEntry {
    fn new(request: Request, response: Response) -> Self {
        let size = response.body.len();
        Self {
            request,
            response,
            size,
        }
    }
}

/// One cache generation.
#[derive(Debug, Clone)]
pub struct Cache {
    /// Cache name
    name: String,
    /// Cached entries (key -> entry)
    entries: BTreeMap<String, CacheEntry>,
    /// Total body size in bytes
    total_size: usize,
}

impl Cache {
    /// Create a new cache
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: BTreeMap::new(),
            total_size: 0,
        }
    }

    /// Get cache name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Match a request
    pub fn match_request(&self, request: &Request, options: &CacheMatchOptions) -> Option<&Response> {
        if options.is_exact() {
            return self.entries.get(&cache_key(request)).map(|e| &e.response);
        }
        self.entries
            .values()
            .find(|e| options.matches(&e.request, request))
            .map(|e| &e.response)
    }

    /// Store a request/response pair, replacing any entry with the same key.
    pub fn put(&mut self, request: Request, response: Response) -> Result<(), CacheError> {
        if request.method != RequestMethod::Get {
            return Err(CacheError::InvalidRequest(format!(
                "{} {} is not cacheable",
                request.method.as_str(),
                request.url
            )));
        }

        let key = cache_key(&request);
        let entry = CacheEntry::new(request, response);
        let size = entry.size;

        if let Some(old) = self.entries.remove(&key) {
            self.total_size = self.total_size.saturating_sub(old.size);
        }

        self.entries.insert(key, entry);
        self.total_size += size;

        Ok(())
    }

    /// Delete every entry matching the request
    pub fn delete(&mut self, request: &Request, options: &CacheMatchOptions) -> bool {
        let doomed: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| options.matches(&e.request, request))
            .map(|(k, _)| k.clone())
            .collect();

        for key in &doomed {
            if let Some(entry) = self.entries.remove(key) {
                self.total_size = self.total_size.saturating_sub(entry.size);
            }
        }

        !doomed.is_empty()
    }

    /// Get all cached request keys
    pub fn keys(&self) -> Vec<Request> {
        self.entries.values().map(|e| e.request.clone()).collect()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Get total size
    pub fn size(&self) -> usize {
        self.total_size
    }
}

/// Key-value store of cache generations.
///
/// Every handler of one worker receives the same storage by reference. All
/// writes are upserts keyed by request identity, so concurrent writers of the
/// same key converge on the last write.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Open a generation, creating it if absent.
    async fn open(&self, name: &str) -> Result<(), CacheError>;

    /// Check if a generation exists.
    async fn has(&self, name: &str) -> Result<bool, CacheError>;

    /// Names of all generations, sorted.
    async fn keys(&self) -> Result<Vec<String>, CacheError>;

    /// Delete a generation. Returns whether it existed.
    async fn delete(&self, name: &str) -> Result<bool, CacheError>;

    /// Match across all generations, first hit in name order.
    async fn match_request(
        &self,
        request: &Request,
        options: &CacheMatchOptions,
    ) -> Result<Option<Response>, CacheError>;

    /// Match inside one generation.
    async fn match_in(
        &self,
        name: &str,
        request: &Request,
        options: &CacheMatchOptions,
    ) -> Result<Option<Response>, CacheError>;

    /// Upsert an entry into a generation, creating the generation if absent.
    async fn put(&self, name: &str, request: &Request, response: Response) -> Result<(), CacheError>;

    /// Stored request keys of one generation.
    async fn requests(&self, name: &str) -> Result<Vec<Request>, CacheError>;
}

/// In-memory cache storage.
pub struct MemoryCacheStorage {
    /// Caches by name
    caches: RwLock<BTreeMap<String, Cache>>,
}

impl MemoryCacheStorage {
    /// Create new cache storage
    pub fn new() -> Self {
        Self {
            caches: RwLock::new(BTreeMap::new()),
        }
    }

    /// Total body bytes across all generations.
    pub fn usage(&self) -> usize {
        self.caches.read().values().map(|c| c.size()).sum()
    }

    /// Number of entries in one generation.
    pub fn len_of(&self, name: &str) -> Option<usize> {
        self.caches.read().get(name).map(|c| c.len())
    }
}

impl Default for MemoryCacheStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn open(&self, name: &str) -> Result<(), CacheError> {
        let mut caches = self.caches.write();
        if !caches.contains_key(name) {
            caches.insert(name.to_string(), Cache::new(name));
        }
        Ok(())
    }

    async fn has(&self, name: &str) -> Result<bool, CacheError> {
        Ok(self.caches.read().contains_key(name))
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        Ok(self.caches.read().keys().cloned().collect())
    }

    async fn delete(&self, name: &str) -> Result<bool, CacheError> {
        Ok(self.caches.write().remove(name).is_some())
    }

    async fn match_request(
        &self,
        request: &Request,
        options: &CacheMatchOptions,
    ) -> Result<Option<Response>, CacheError> {
        let caches = self.caches.read();
        Ok(caches
            .values()
            .find_map(|cache| cache.match_request(request, options))
            .cloned())
    }

    async fn match_in(
        &self,
        name: &str,
        request: &Request,
        options: &CacheMatchOptions,
    ) -> Result<Option<Response>, CacheError> {
        let caches = self.caches.read();
        Ok(caches
            .get(name)
            .and_then(|cache| cache.match_request(request, options))
            .cloned())
    }

    async fn put(&self, name: &str, request: &Request, response: Response) -> Result<(), CacheError> {
        let mut caches = self.caches.write();
        caches
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name))
            .put(request.clone(), response)
    }

    async fn requests(&self, name: &str) -> Result<Vec<Request>, CacheError> {
        self.caches
            .read()
            .get(name)
            .map(|cache| cache.keys())
            .ok_or(CacheError::NotFound)
    }
}
