//! # Satchel Net
//!
//! Request/response model, the network seam and the passthrough policy used
//! by the cache proxy worker.
//!
//! ## Design Goals
//!
//! 1. **Async fetch seam**: the worker talks to the network through [`Fetcher`]
//! 2. **Cheap snapshots**: response bodies are [`Bytes`], so cloning a response
//!    for the store does not copy the body
//! 3. **Passthrough rules**: non-GET, non-http(s) and excluded traffic is never
//!    intercepted

use bytes::Bytes;
use futures::future::BoxFuture;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use satchel_common::SatchelError;
use thiserror::Error;
use url::Url;

pub mod intercept;
pub mod loader;

pub use intercept::{InterceptDecision, PassthroughPolicy, PassthroughReason, UrlPattern};
pub use loader::{HttpFetcher, LoaderConfig};

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

impl From<NetError> for SatchelError {
    fn from(err: NetError) -> Self {
        SatchelError::network_with_source("fetch failed", err)
    }
}

/// HTTP request as seen by the worker.
#[derive(Debug, Clone)]
pub struct Request {
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl Request {
    /// Create a request with an arbitrary method.
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            url,
            method,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// Parse a URL and create a GET request.
    pub fn get_str(url: &str) -> Result<Self, NetError> {
        let url = Url::parse(url).map_err(|e| NetError::InvalidUrl(e.to_string()))?;
        Ok(Self::get(url))
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Whether the URL scheme is http or https.
    pub fn is_http(&self) -> bool {
        matches!(self.url.scheme(), "http" | "https")
    }
}

/// Where a response body came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Network,
    Cache,
}

impl ResponseSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseSource::Network => "network",
            ResponseSource::Cache => "cache",
        }
    }
}

/// HTTP response with a fully buffered body.
#[derive(Debug, Clone)]
pub struct Response {
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub source: ResponseSource,
}

impl Response {
    /// Create a network response.
    pub fn new(url: Url, status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            url,
            status,
            headers,
            body,
            source: ResponseSource::Network,
        }
    }

    /// Check if request was successful (2xx).
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Whether the final response URL is http or https.
    pub fn is_http(&self) -> bool {
        matches!(self.url.scheme(), "http" | "https")
    }

    /// Get the body as text.
    pub fn text(&self) -> Result<String, NetError> {
        String::from_utf8(self.body.to_vec()).map_err(|e| NetError::RequestFailed(e.to_string()))
    }
}

/// Future returned by [`Fetcher::fetch`].
pub type FetchFuture<'a> = BoxFuture<'a, Result<Response, NetError>>;

/// The network as seen from the worker.
pub trait Fetcher: Send + Sync {
    /// Perform the request against the network.
    fn fetch(&self, request: Request) -> FetchFuture<'_>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let url = Url::parse("https://example.com").unwrap();
        let request = Request::get(url.clone()).header(
            HeaderName::from_static("accept"),
            HeaderValue::from_static("text/html"),
        );

        assert_eq!(request.url, url);
        assert_eq!(request.method, Method::GET);
        assert!(request.headers.contains_key("accept"));
        assert!(request.is_http());
    }

    #[test]
    fn test_get_str_rejects_garbage() {
        assert!(matches!(
            Request::get_str("not a url"),
            Err(NetError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_response_ok_and_text() {
        let response = Response::new(
            Url::parse("https://example.com/").unwrap(),
            StatusCode::OK,
            HeaderMap::new(),
            Bytes::from_static(b"<h1>hi</h1>"),
        );
        assert!(response.ok());
        assert!(response.is_http());
        assert_eq!(response.source, ResponseSource::Network);
        assert_eq!(response.text().unwrap(), "<h1>hi</h1>");

        let missing = Response {
            status: StatusCode::NOT_FOUND,
            ..response
        };
        assert!(!missing.ok());
    }
}
