//! Fetch Event Handling
//!
//! Request/response model and the cache-first interception used for every
//! request coming from a controlled page.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::cache::{CacheMatchOptions, CacheStorage};
use crate::network::{Network, NetworkError};

/// The only status that is written back into the cache at runtime.
pub const SUCCESS_STATUS: u16 = 200;

/// HTTP request method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

impl Default for RequestMethod {
    fn default() -> Self {
        Self::Get
    }
}

impl RequestMethod {
    /// Convert to string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Patch => "PATCH",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
        }
    }
}

/// Request mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
    /// Same-origin only
    SameOrigin,
    /// No CORS
    NoCors,
    /// CORS
    Cors,
    /// Top-level navigation
    Navigate,
}

impl Default for RequestMode {
    fn default() -> Self {
        Self::Cors
    }
}

/// Request cache mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestCache {
    /// Default browser behavior
    Default,
    /// No store
    NoStore,
    /// Reload
    Reload,
    /// Revalidate with the origin before using any intermediate copy
    NoCache,
    /// Force cache
    ForceCache,
    /// Only if cached
    OnlyIfCached,
}

impl Default for RequestCache {
    fn default() -> Self {
        Self::Default
    }
}

impl RequestCache {
    /// Whether intermediate HTTP caches must be bypassed.
    pub fn bypasses_http_cache(&self) -> bool {
        matches!(self, Self::NoStore | Self::Reload | Self::NoCache)
    }
}

/// Fetch request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Absolute request URL
    pub url: String,
    /// HTTP method
    pub method: RequestMethod,
    /// Request headers
    pub headers: BTreeMap<String, String>,
    /// Request body (if any)
    pub body: Option<Vec<u8>>,
    /// Request mode
    pub mode: RequestMode,
    /// Cache mode
    pub cache: RequestCache,
}

impl Request {
    /// Create a GET request
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: RequestMethod::Get,
            headers: BTreeMap::new(),
            body: None,
            mode: RequestMode::Cors,
            cache: RequestCache::Default,
        }
    }

    /// Create a top-level navigation request
    pub fn navigate(url: impl Into<String>) -> Self {
        Self::new(url).with_mode(RequestMode::Navigate)
    }

    pub fn with_method(mut self, method: RequestMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_cache(mut self, cache: RequestCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Request URL without its query string.
    pub fn url_without_search(&self) -> &str {
        match self.url.find('?') {
            Some(pos) => &self.url[..pos],
            None => &self.url,
        }
    }
}

/// Response type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResponseType {
    /// Basic
    Basic,
    /// CORS
    Cors,
    /// Default
    Default,
    /// Error
    Error,
    /// Opaque
    Opaque,
    /// Opaque redirect
    OpaqueRedirect,
}

impl Default for ResponseType {
    fn default() -> Self {
        Self::Default
    }
}

/// Fetch response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Response type
    pub response_type: ResponseType,
    /// Final URL after redirects
    pub url: String,
    /// Redirected
    pub redirected: bool,
    /// Status code
    pub status: u16,
    /// Status text
    pub status_text: String,
    /// Response headers
    pub headers: BTreeMap<String, String>,
    /// Response body
    pub body: Vec<u8>,
}

impl Response {
    /// Create a new response with an empty body
    pub fn new(status: u16) -> Self {
        Self {
            response_type: ResponseType::Default,
            url: String::new(),
            redirected: false,
            status,
            status_text: status_text_for(status).to_string(),
            headers: BTreeMap::new(),
            body: Vec::new(),
        }
    }

    /// Create error response
    pub fn error() -> Self {
        Self {
            response_type: ResponseType::Error,
            url: String::new(),
            redirected: false,
            status: 0,
            status_text: String::new(),
            headers: BTreeMap::new(),
            body: Vec::new(),
        }
    }

    /// Create redirect response
    pub fn redirect(url: impl Into<String>, status: u16) -> Self {
        Self::new(status).with_header("Location", url)
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Check if response is OK
    pub fn ok(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    /// Whether this response may be written back into the cache.
    pub fn is_cacheable(&self) -> bool {
        self.response_type != ResponseType::Error && self.status == SUCCESS_STATUS
    }
}

/// Get status text for status code
pub(crate) fn status_text_for(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

/// Where a fetch response originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchSource {
    /// From cache storage.
    Cache,
    /// From the network.
    Network,
}

/// Response handed back to the page for one intercepted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
    pub response: Response,
    pub source: FetchSource,
}

/// Answer one intercepted request, cache first.
///
/// A hit in any generation short-circuits the network. On a miss the request
/// goes to the network; an exactly-200 response to a GET is written into
/// `cache_name` before it is returned. Anything else is returned untouched.
/// Network failures are handed back to the caller as-is.
pub async fn respond(
    storage: &dyn CacheStorage,
    network: &dyn Network,
    cache_name: &str,
    request: Request,
) -> Result<FetchOutcome, NetworkError> {
    match storage
        .match_request(&request, &CacheMatchOptions::default())
        .await
    {
        Ok(Some(response)) => {
            log::debug!("[ServiceWorker] cache hit {} {}", request.method.as_str(), request.url);
            return Ok(FetchOutcome {
                response,
                source: FetchSource::Cache,
            });
        }
        Ok(None) => {}
        Err(e) => {
            log::warn!("[ServiceWorker] cache lookup failed for {}: {}", request.url, e);
        }
    }

    log::debug!("[ServiceWorker] cache miss {} {}", request.method.as_str(), request.url);
    let response = network.fetch(request.clone()).await?;

    if !response.is_cacheable() || request.method != RequestMethod::Get {
        return Ok(FetchOutcome {
            response,
            source: FetchSource::Network,
        });
    }

    if let Err(e) = storage.put(cache_name, &request, response.clone()).await {
        log::warn!("[ServiceWorker] failed to cache {}: {}", request.url, e);
    }

    Ok(FetchOutcome {
        response,
        source: FetchSource::Network,
    })
}
