//! Offline layer configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use url::Url;

use crate::error::{ConfigError, ConfigResult};
use crate::types::{StoreName, VersionTag};

/// Worker script file name, resolved under the base path
pub const WORKER_SCRIPT: &str = "sw.js";

/// Entry document pre-populated next to the base root
pub const ENTRY_DOCUMENT: &str = "index.html";

/// A request class the worker never intercepts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionRule {
    /// URL path starts with the given prefix
    PathPrefix(String),
    /// URL host contains the given fragment
    HostContains(String),
    /// Raw substring match against the full serialized URL
    UrlContains(String),
}

/// Offline layer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
    /// Origin the portal is served from
    pub origin: Url,

    /// Deployment base path (always starts and ends with `/`)
    pub base_path: String,

    /// Store name prefix
    pub namespace: String,

    /// Current deployment version
    pub version: VersionTag,

    /// Traffic classes passed through untouched
    pub exclusions: Vec<ExclusionRule>,

    /// Extra assets (relative to the base path) pre-populated on install
    pub precache: Vec<String>,

    /// Activate right after install instead of waiting for old pages to close
    pub skip_waiting_on_install: bool,

    /// SQLite file backing the persistent store
    pub store_path: PathBuf,

    /// User agent for network fetches
    pub user_agent: String,

    /// Log level name
    pub log_level: String,

    /// Log format name (pretty, compact, json)
    pub log_format: String,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            origin: Url::parse("http://localhost:8080/").expect("static origin is valid"),
            base_path: "/".to_string(),
            namespace: "site-static-".to_string(),
            version: VersionTag::new("v1.0.0"),
            exclusions: default_exclusions(),
            precache: Vec::new(),
            skip_waiting_on_install: true,
            store_path: dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("satchel")
                .join("cache.sqlite3"),
            user_agent: format!("Satchel/{}", env!("CARGO_PKG_VERSION")),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// API endpoints plus the document-store and auth backends, matched as
/// substrings of the full URL. This over-matches (a query string naming
/// `/api/` is excluded too); the typed rules are available to narrow it.
fn default_exclusions() -> Vec<ExclusionRule> {
    [
        "/api/",
        "firestore.googleapis.com",
        "firebaseio.com",
        "identitytoolkit",
        "securetoken",
    ]
    .into_iter()
    .map(|fragment| ExclusionRule::UrlContains(fragment.to_string()))
    .collect()
}

impl OfflineConfig {
    /// Load a JSON config file; missing fields take their defaults
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: OfflineConfig = serde_json::from_str(&raw)?;
        config.normalize()?;
        Ok(config)
    }

    /// Validate fields and canonicalize the base path
    pub fn normalize(&mut self) -> ConfigResult<()> {
        if !matches!(self.origin.scheme(), "http" | "https") {
            return Err(ConfigError::invalid(
                "origin",
                format!("scheme '{}' is not http or https", self.origin.scheme()),
            ));
        }
        if self.version.as_str().is_empty() {
            return Err(ConfigError::invalid("version", "must not be empty"));
        }
        if self.namespace.is_empty() {
            return Err(ConfigError::invalid("namespace", "must not be empty"));
        }

        let trimmed = self.base_path.trim_matches('/');
        self.base_path = if trimmed.is_empty() {
            "/".to_string()
        } else {
            format!("/{}/", trimmed)
        };
        Ok(())
    }

    /// Name of the store owned by the configured version
    pub fn store_name(&self) -> StoreName {
        StoreName::versioned(&self.namespace, &self.version)
    }

    /// Registration scope: the base path on the origin
    pub fn scope_url(&self) -> ConfigResult<Url> {
        Ok(self.origin.join(&self.base_path)?)
    }

    /// Worker script location derived from the base path
    pub fn script_url(&self) -> ConfigResult<Url> {
        Ok(self.scope_url()?.join(WORKER_SCRIPT)?)
    }

    /// Critical assets pre-populated on install, without duplicates
    pub fn precache_urls(&self) -> ConfigResult<Vec<Url>> {
        let scope = self.scope_url()?;
        let mut urls = vec![scope.clone(), scope.join(ENTRY_DOCUMENT)?];
        for asset in &self.precache {
            let url = scope.join(asset.trim_start_matches('/'))?;
            if !urls.contains(&url) {
                urls.push(url);
            }
        }
        Ok(urls)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_store_name() {
        let config = OfflineConfig::default();
        assert_eq!(config.store_name().as_str(), "site-static-v1.0.0");
    }

    #[test]
    fn test_default_exclusions_are_url_substrings() {
        let config = OfflineConfig::default();
        assert_eq!(config.exclusions.len(), 5);
        assert!(config
            .exclusions
            .iter()
            .all(|rule| matches!(rule, ExclusionRule::UrlContains(_))));
        assert!(config
            .exclusions
            .contains(&ExclusionRule::UrlContains("/api/".to_string())));
    }

    #[test]
    fn test_base_path_normalization() {
        let mut config = OfflineConfig {
            base_path: "tools".to_string(),
            ..Default::default()
        };
        config.normalize().unwrap();
        assert_eq!(config.base_path, "/tools/");
        assert_eq!(
            config.script_url().unwrap().as_str(),
            "http://localhost:8080/tools/sw.js"
        );
        assert_eq!(
            config.scope_url().unwrap().as_str(),
            "http://localhost:8080/tools/"
        );
    }

    #[test]
    fn test_precache_urls() {
        let mut config = OfflineConfig {
            base_path: "/tools/".to_string(),
            precache: vec!["/index.html".to_string(), "app.css".to_string()],
            ..Default::default()
        };
        config.normalize().unwrap();

        let urls: Vec<String> = config
            .precache_urls()
            .unwrap()
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(
            urls,
            vec![
                "http://localhost:8080/tools/",
                "http://localhost:8080/tools/index.html",
                "http://localhost:8080/tools/app.css",
            ]
        );
    }

    #[test]
    fn test_rejects_non_http_origin() {
        let mut config = OfflineConfig {
            origin: Url::parse("ftp://example.com/").unwrap(),
            ..Default::default()
        };
        assert!(matches!(
            config.normalize(),
            Err(ConfigError::Invalid { field: "origin", .. })
        ));
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "origin": "https://tools.example.edu/",
                "version": "v1.0.3",
                "exclusions": [{{"path_prefix": "/api/"}}, {{"url_contains": "firebase"}}]
            }}"#
        )
        .unwrap();

        let config = OfflineConfig::load(file.path()).unwrap();
        assert_eq!(config.store_name().as_str(), "site-static-v1.0.3");
        assert_eq!(config.base_path, "/");
        assert!(config.skip_waiting_on_install);
        assert_eq!(
            config.exclusions,
            vec![
                ExclusionRule::PathPrefix("/api/".to_string()),
                ExclusionRule::UrlContains("firebase".to_string()),
            ]
        );
    }

    #[test]
    fn test_load_malformed_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(matches!(
            OfflineConfig::load(file.path()),
            Err(ConfigError::Json(_))
        ));
    }
}
