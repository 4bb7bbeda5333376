//! # Satchel Store
//!
//! Persistent, version-scoped response stores.
//!
//! ## Architecture
//!
//! ```text
//! CacheStorage
//!     ├── site-static-v1.0.2   (superseded, purged on activation)
//!     └── site-static-v1.0.3   (current)
//!             └── RequestKey (GET + URL) → CacheEntry (status, headers, body)
//! ```
//!
//! Two backends implement [`CacheStorage`]: [`MemoryCacheStorage`] for tests
//! and short-lived processes, and [`SqliteCacheStorage`] for storage that
//! survives restarts. Every operation is atomic at single-entry granularity.

use std::fmt;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use satchel_common::SatchelError;
use satchel_core::StoreName;
use satchel_net::{Request, Response, ResponseSource};
use thiserror::Error;
use url::Url;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryCacheStorage;
pub use sqlite::SqliteCacheStorage;

// ==================== Errors ====================

/// Errors raised by store backends.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Header encoding error: {0}")]
    Headers(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid entry: {0}")]
    InvalidEntry(String),

    #[error("Store lock poisoned")]
    Poisoned,
}

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for SatchelError {
    fn from(err: StoreError) -> Self {
        SatchelError::store_with_source("cache store failure", err)
    }
}

// ==================== Keys & Entries ====================

/// Canonical request identity: upper-cased method plus the URL without its
/// fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    pub method: String,
    pub url: String,
}

impl RequestKey {
    /// Build a key from raw parts.
    pub fn new(method: &str, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method: method.to_ascii_uppercase(),
            url: url.into(),
        }
    }

    /// Key for an outgoing request.
    pub fn from_request(request: &Request) -> Self {
        Self::new(request.method.as_str(), &request.url)
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// A captured response snapshot.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: RequestKey,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    /// Final URL of the response (after redirects).
    pub response_url: String,
    /// Capture time, ms since epoch.
    pub cached_at: i64,
}

impl CacheEntry {
    /// Snapshot a network response for the given request key.
    pub fn capture(key: RequestKey, response: &Response) -> Self {
        let headers = response
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        Self {
            key,
            status: response.status.as_u16(),
            headers,
            body: response.body.clone(),
            response_url: response.url.to_string(),
            cached_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Rebuild a response marked as served from cache.
    pub fn to_response(&self) -> StoreResult<Response> {
        let status = StatusCode::from_u16(self.status)
            .map_err(|e| StoreError::InvalidEntry(e.to_string()))?;
        let url = Url::parse(&self.response_url)
            .map_err(|e| StoreError::InvalidEntry(e.to_string()))?;

        let mut headers = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| StoreError::InvalidEntry(e.to_string()))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| StoreError::InvalidEntry(e.to_string()))?;
            headers.append(name, value);
        }

        Ok(Response {
            url,
            status,
            headers,
            body: self.body.clone(),
            source: ResponseSource::Cache,
        })
    }
}

// ==================== Storage ====================

/// Named collection of version-scoped stores.
pub trait CacheStorage: Send + Sync {
    /// Open a store, creating it if missing.
    fn open(&self, name: &StoreName) -> StoreResult<()>;

    /// Check whether a store exists.
    fn has(&self, name: &StoreName) -> StoreResult<bool>;

    /// All store names, sorted.
    fn keys(&self) -> StoreResult<Vec<StoreName>>;

    /// Delete a store and every entry in it. Returns whether it existed.
    fn delete(&self, name: &StoreName) -> StoreResult<bool>;

    /// Write an entry, replacing any entry with the same key. Creates the
    /// store if needed.
    fn put(&self, name: &StoreName, entry: CacheEntry) -> StoreResult<()>;

    /// Look up an entry in one store.
    fn match_request(&self, name: &StoreName, key: &RequestKey) -> StoreResult<Option<CacheEntry>>;

    /// Number of entries in a store (0 if it does not exist).
    fn entry_count(&self, name: &StoreName) -> StoreResult<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_key_drops_fragment() {
        let a = RequestKey::new("get", &Url::parse("https://example.com/page?q=1#top").unwrap());
        let b = RequestKey::new("GET", &Url::parse("https://example.com/page?q=1").unwrap());
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "GET https://example.com/page?q=1");
    }

    #[test]
    fn test_request_key_query_is_significant() {
        let a = RequestKey::new("GET", &Url::parse("https://example.com/?a=1").unwrap());
        let b = RequestKey::new("GET", &Url::parse("https://example.com/?a=2").unwrap());
        assert_ne!(a, b);
    }

    #[test]
    fn test_capture_and_restore() {
        let url = Url::parse("https://example.com/app.js").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/javascript"));
        headers.append("set-cookie", HeaderValue::from_static("a=1"));
        headers.append("set-cookie", HeaderValue::from_static("b=2"));
        let response = Response::new(
            url.clone(),
            StatusCode::OK,
            headers,
            Bytes::from_static(b"console.log(1)"),
        );

        let entry = CacheEntry::capture(RequestKey::new("GET", &url), &response);
        assert_eq!(entry.status, 200);
        assert_eq!(entry.headers.len(), 3);

        let restored = entry.to_response().unwrap();
        assert_eq!(restored.source, ResponseSource::Cache);
        assert_eq!(restored.status, StatusCode::OK);
        assert_eq!(restored.body, Bytes::from_static(b"console.log(1)"));
        assert_eq!(restored.headers.get_all("set-cookie").iter().count(), 2);
    }
}
