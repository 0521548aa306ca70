//! Persistent cache storage.
//!
//! Each generation is a directory under the storage root. Each entry is one
//! file, `{hash}.entry`: the request key and response head as a single line
//! of JSON, a newline, then the raw response body.
//!
//! `hash` is the hex SHA-256 of the cache key. There is no shared index
//! file, so two writers of different keys never touch the same file. A put
//! publishes head and body with one rename, so two writers of the same key
//! leave exactly one of their responses, whole.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;

use crate::service_worker::{
    cache_key, CacheError, CacheMatchOptions, CacheStorage, Request, RequestMethod, Response,
    ResponseType,
};

const ENTRY_EXT: &str = "entry";

/// Suffix counter for temporary files.
static NEXT_TMP: AtomicU64 = AtomicU64::new(0);

/// Response head as written on the first line of `{hash}.entry`.
#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    method: RequestMethod,
    request_url: String,
    response_type: ResponseType,
    url: String,
    redirected: bool,
    status: u16,
    status_text: String,
    headers: BTreeMap<String, String>,
}

impl StoredEntry {
    fn new(request: &Request, response: &Response) -> Self {
        Self {
            method: request.method,
            request_url: request.url.clone(),
            response_type: response.response_type,
            url: response.url.clone(),
            redirected: response.redirected,
            status: response.status,
            status_text: response.status_text.clone(),
            headers: response.headers.clone(),
        }
    }

    /// Head line, separator and body.
    fn encode(&self, body: &[u8]) -> Result<Vec<u8>, CacheError> {
        // Compact JSON escapes newlines inside strings.
        let mut bytes =
            serde_json::to_vec(self).map_err(|e| CacheError::StorageError(e.to_string()))?;
        bytes.push(b'\n');
        bytes.extend_from_slice(body);
        Ok(bytes)
    }

    fn decode(raw: &[u8]) -> Result<(Self, Vec<u8>), String> {
        let split = raw
            .iter()
            .position(|b| *b == b'\n')
            .ok_or_else(|| String::from("missing head separator"))?;
        let head = serde_json::from_slice(&raw[..split]).map_err(|e| e.to_string())?;
        Ok((head, raw[split + 1..].to_vec()))
    }

    fn request(&self) -> Request {
        Request::new(self.request_url.clone()).with_method(self.method)
    }

    fn into_response(self, body: Vec<u8>) -> Response {
        Response {
            response_type: self.response_type,
            url: self.url,
            redirected: self.redirected,
            status: self.status,
            status_text: self.status_text,
            headers: self.headers,
            body,
        }
    }
}

fn storage_error(context: &str, path: &Path, e: impl core::fmt::Display) -> CacheError {
    CacheError::StorageError(format!("{} {}: {}", context, path.display(), e))
}

fn key_hash(request: &Request) -> String {
    format!("{:x}", Sha256::digest(cache_key(request).as_bytes()))
}

/// Cache storage rooted at a directory.
pub struct DiskCacheStorage {
    root: PathBuf,
}

impl DiskCacheStorage {
    /// Use `root` as the storage directory, creating it if needed.
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .map_err(|e| storage_error("cannot create", &root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn cache_dir(&self, name: &str) -> Result<PathBuf, CacheError> {
        if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\']) {
            return Err(CacheError::InvalidName(name.to_string()));
        }
        Ok(self.root.join(name))
    }

    async fn dir_exists(path: &Path) -> Result<bool, CacheError> {
        match fs::metadata(path).await {
            Ok(meta) => Ok(meta.is_dir()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(storage_error("cannot stat", path, e)),
        }
    }

    /// Write `bytes` to `path` through a temporary file and a rename.
    async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
        let tmp = path.with_extension(format!(
            "tmp-{}-{}",
            std::process::id(),
            NEXT_TMP.fetch_add(1, Ordering::Relaxed)
        ));
        fs::write(&tmp, bytes)
            .await
            .map_err(|e| storage_error("cannot write", &tmp, e))?;
        fs::rename(&tmp, path)
            .await
            .map_err(|e| storage_error("cannot rename", &tmp, e))
    }

    async fn read_entry(
        dir: &Path,
        hash: &str,
    ) -> Result<Option<(StoredEntry, Vec<u8>)>, CacheError> {
        let path = dir.join(format!("{}.{}", hash, ENTRY_EXT));
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(storage_error("cannot read", &path, e)),
        };
        StoredEntry::decode(&raw)
            .map(Some)
            .map_err(|e| storage_error("corrupt entry", &path, e))
    }

    /// Hashes of every entry in a generation directory.
    async fn entry_hashes(dir: &Path) -> Result<Vec<String>, CacheError> {
        let mut hashes = Vec::new();
        let mut read_dir = match fs::read_dir(dir).await {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(hashes),
            Err(e) => return Err(storage_error("cannot list", dir, e)),
        };
        while let Some(item) = read_dir
            .next_entry()
            .await
            .map_err(|e| storage_error("cannot list", dir, e))?
        {
            let path = item.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(ENTRY_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                hashes.push(stem.to_string());
            }
        }
        hashes.sort();
        Ok(hashes)
    }

    async fn match_dir(
        dir: &Path,
        request: &Request,
        options: &CacheMatchOptions,
    ) -> Result<Option<Response>, CacheError> {
        if *options == CacheMatchOptions::default() {
            let hash = key_hash(request);
            return Ok(Self::read_entry(dir, &hash)
                .await?
                .map(|(entry, body)| entry.into_response(body)));
        }

        for hash in Self::entry_hashes(dir).await? {
            if let Some((entry, body)) = Self::read_entry(dir, &hash).await? {
                if options.matches(&entry.request(), request) {
                    return Ok(Some(entry.into_response(body)));
                }
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl CacheStorage for DiskCacheStorage {
    async fn open(&self, name: &str) -> Result<(), CacheError> {
        let dir = self.cache_dir(name)?;
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| storage_error("cannot create", &dir, e))
    }

    async fn has(&self, name: &str) -> Result<bool, CacheError> {
        Self::dir_exists(&self.cache_dir(name)?).await
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        let mut names = Vec::new();
        let mut read_dir = fs::read_dir(&self.root)
            .await
            .map_err(|e| storage_error("cannot list", &self.root, e))?;
        while let Some(item) = read_dir
            .next_entry()
            .await
            .map_err(|e| storage_error("cannot list", &self.root, e))?
        {
            let is_dir = item
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            if let (true, Some(name)) = (is_dir, item.file_name().to_str()) {
                if !name.starts_with('.') {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    async fn delete(&self, name: &str) -> Result<bool, CacheError> {
        let dir = self.cache_dir(name)?;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {
                log::debug!("[CacheStorage] deleted {}", dir.display());
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(storage_error("cannot delete", &dir, e)),
        }
    }

    async fn match_request(
        &self,
        request: &Request,
        options: &CacheMatchOptions,
    ) -> Result<Option<Response>, CacheError> {
        for name in self.keys().await? {
            let dir = self.cache_dir(&name)?;
            if let Some(response) = Self::match_dir(&dir, request, options).await? {
                return Ok(Some(response));
            }
        }
        Ok(None)
    }

    async fn match_in(
        &self,
        name: &str,
        request: &Request,
        options: &CacheMatchOptions,
    ) -> Result<Option<Response>, CacheError> {
        let dir = self.cache_dir(name)?;
        Self::match_dir(&dir, request, options).await
    }

    async fn put(&self, name: &str, request: &Request, response: Response) -> Result<(), CacheError> {
        if request.method != RequestMethod::Get {
            return Err(CacheError::InvalidRequest(format!(
                "{} {} is not cacheable",
                request.method.as_str(),
                request.url
            )));
        }

        let dir = self.cache_dir(name)?;
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| storage_error("cannot create", &dir, e))?;

        let hash = key_hash(request);
        let bytes = StoredEntry::new(request, &response).encode(&response.body)?;
        Self::write_atomic(&dir.join(format!("{}.{}", hash, ENTRY_EXT)), &bytes).await
    }

    async fn requests(&self, name: &str) -> Result<Vec<Request>, CacheError> {
        let dir = self.cache_dir(name)?;
        if !Self::dir_exists(&dir).await? {
            return Err(CacheError::NotFound);
        }
        let mut requests = Vec::new();
        for hash in Self::entry_hashes(&dir).await? {
            if let Some((entry, _)) = Self::read_entry(&dir, &hash).await? {
                requests.push(entry.request());
            }
        }
        Ok(requests)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn make_storage() -> (TempDir, DiskCacheStorage) {
        let tmp = TempDir::new().expect("Failed to create temp directory");
        let storage = DiskCacheStorage::new(tmp.path().join("caches")).await.unwrap();
        (tmp, storage)
    }

    #[tokio::test]
    async fn put_and_match_survives_reopen() {
        let (tmp, storage) = make_storage().await;
        let req = Request::new("https://lab.example.org/data.json");
        let resp = Response::new(200)
            .with_url("https://lab.example.org/data.json")
            .with_header("content-type", "application/json")
            .with_body(br#"{"a":1}"#.to_vec());
        storage.put("v1", &req, resp.clone()).await.unwrap();

        let reopened = DiskCacheStorage::new(tmp.path().join("caches")).await.unwrap();
        let found = reopened
            .match_request(&req, &CacheMatchOptions::default())
            .await
            .unwrap();
        assert_eq!(found, Some(resp));
    }

    #[tokio::test]
    async fn overwrite_keeps_one_entry() {
        let (_tmp, storage) = make_storage().await;
        let req = Request::new("https://lab.example.org/a");
        storage.put("v1", &req, Response::new(200).with_body(b"1".to_vec())).await.unwrap();
        storage.put("v1", &req, Response::new(200).with_body(b"2".to_vec())).await.unwrap();

        assert_eq!(storage.requests("v1").await.unwrap(), vec![req.clone()]);
        let found = storage
            .match_in("v1", &req, &CacheMatchOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.body, b"2");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_puts_never_mix_head_and_body() {
        let (_tmp, storage) = make_storage().await;
        let storage = std::sync::Arc::new(storage);
        let req = Request::new("https://lab.example.org/trials.json");

        let writers: Vec<_> = (0..16u8)
            .map(|i| {
                let storage = storage.clone();
                let req = req.clone();
                tokio::spawn(async move {
                    let resp = Response::new(200)
                        .with_header("x-writer", i.to_string())
                        .with_body(vec![i; 4096]);
                    storage.put("v1", &req, resp).await.unwrap();
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap();
        }

        let found = storage
            .match_in("v1", &req, &CacheMatchOptions::default())
            .await
            .unwrap()
            .unwrap();
        let writer: u8 = found.headers["x-writer"].parse().unwrap();
        assert_eq!(found.body, vec![writer; 4096]);

        let names: Vec<_> = std::fs::read_dir(storage.root().join("v1"))
            .unwrap()
            .map(|item| item.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names.len(), 1, "{:?}", names);
        assert!(names[0].ends_with(".entry"));
    }

    #[tokio::test]
    async fn body_with_newlines_round_trips() {
        let (_tmp, storage) = make_storage().await;
        let req = Request::new("https://lab.example.org/index.html");
        let resp = Response::new(200)
            .with_header("x-note", "line one\nline two")
            .with_body(b"<html>\n<body>\n</body>\n</html>\n".to_vec());
        storage.put("v1", &req, resp.clone()).await.unwrap();

        let found = storage.match_in("v1", &req, &CacheMatchOptions::default()).await.unwrap();
        assert_eq!(found, Some(resp));
    }

    #[tokio::test]
    async fn rejects_non_get_and_bad_names() {
        let (_tmp, storage) = make_storage().await;
        let post = Request::new("https://lab.example.org/a").with_method(RequestMethod::Post);
        assert!(matches!(
            storage.put("v1", &post, Response::new(200)).await,
            Err(CacheError::InvalidRequest(_))
        ));
        assert!(matches!(storage.open("../escape").await, Err(CacheError::InvalidName(_))));
        assert!(matches!(storage.open("").await, Err(CacheError::InvalidName(_))));
    }

    #[tokio::test]
    async fn keys_and_delete() {
        let (_tmp, storage) = make_storage().await;
        storage.open("jspsych-offline-v2").await.unwrap();
        storage.open("jspsych-offline-v1").await.unwrap();
        assert_eq!(
            storage.keys().await.unwrap(),
            vec!["jspsych-offline-v1", "jspsych-offline-v2"]
        );

        assert!(storage.delete("jspsych-offline-v1").await.unwrap());
        assert!(!storage.delete("jspsych-offline-v1").await.unwrap());
        assert!(!storage.has("jspsych-offline-v1").await.unwrap());
        assert!(storage.has("jspsych-offline-v2").await.unwrap());
    }

    #[tokio::test]
    async fn ignore_search_scans_entries() {
        let (_tmp, storage) = make_storage().await;
        storage
            .put(
                "v1",
                &Request::new("https://lab.example.org/data.json?v=1"),
                Response::new(200).with_body(b"1".to_vec()),
            )
            .await
            .unwrap();

        let query = Request::new("https://lab.example.org/data.json");
        let exact = storage
            .match_in("v1", &query, &CacheMatchOptions::default())
            .await
            .unwrap();
        assert!(exact.is_none());

        let options = CacheMatchOptions {
            ignore_search: true,
            ..Default::default()
        };
        let loose = storage.match_in("v1", &query, &options).await.unwrap();
        assert_eq!(loose.unwrap().body, b"1");
    }

    #[tokio::test]
    async fn requests_of_missing_generation() {
        let (_tmp, storage) = make_storage().await;
        assert_eq!(storage.requests("nope").await, Err(CacheError::NotFound));
    }
}
