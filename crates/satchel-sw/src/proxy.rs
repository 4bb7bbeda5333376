//! The cache proxy worker: install, activate and fetch handlers.
//!
//! None of the handlers return an error. Failures inside a handler are
//! logged and recorded in its report so the lifecycle step itself always
//! completes.

use std::sync::Arc;

use futures::future::join_all;
use satchel_core::{OfflineConfig, StoreName};
use satchel_net::{
    Fetcher, InterceptDecision, NetError, PassthroughPolicy, PassthroughReason, Request, Response,
};
use satchel_store::{CacheEntry, CacheStorage, RequestKey};
use serde::Serialize;
use tracing::{debug, info, warn};
use url::Url;

use crate::ServiceWorkerError;

/// Result of the install handler.
#[derive(Debug, Clone, Serialize)]
pub struct InstallReport {
    /// Store opened for this version.
    pub store: StoreName,
    /// Assets written to the store.
    pub precached: Vec<Url>,
    /// Assets that could not be fetched or stored, with the reason.
    pub failed: Vec<(Url, String)>,
    /// Whether the worker asked to skip the waiting phase.
    pub skip_waiting: bool,
}

/// Result of the activate handler.
#[derive(Debug, Clone, Serialize)]
pub struct ActivationReport {
    /// The surviving store.
    pub current: StoreName,
    /// Superseded stores that were purged.
    pub deleted: Vec<StoreName>,
    /// Stores that could not be enumerated or deleted, with the reason.
    pub failed: Vec<(String, String)>,
}

/// What the fetch handler did with a request.
#[derive(Debug)]
pub enum FetchOutcome {
    /// Not intercepted; the caller forwards the request to the network as is.
    Passthrough {
        request: Request,
        reason: PassthroughReason,
    },
    /// Answered from the network or, after a network failure, from the store.
    Responded(Response),
    /// Network failed and the store had nothing for this request.
    Failed(NetError),
}

/// Network-first caching worker bound to one version-tagged store.
pub struct CacheProxyWorker {
    store_name: StoreName,
    precache: Vec<Url>,
    policy: PassthroughPolicy,
    skip_waiting: bool,
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
}

impl CacheProxyWorker {
    /// Build a worker for the configured version.
    pub fn new(
        config: &OfflineConfig,
        storage: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self, ServiceWorkerError> {
        Ok(Self {
            store_name: config.store_name(),
            precache: config.precache_urls()?,
            policy: PassthroughPolicy::from_rules(&config.exclusions),
            skip_waiting: config.skip_waiting_on_install,
            storage,
            fetcher,
        })
    }

    /// Name of the store this worker writes to.
    pub fn store_name(&self) -> &StoreName {
        &self.store_name
    }

    /// Network used by this worker.
    pub fn fetcher(&self) -> Arc<dyn Fetcher> {
        Arc::clone(&self.fetcher)
    }

    /// Install: open the store and pre-populate the critical assets.
    ///
    /// Every asset is attempted independently; one failure neither cancels
    /// the others nor fails the install.
    pub async fn install(&self) -> InstallReport {
        info!(store = %self.store_name, assets = self.precache.len(), "Installing worker");

        let mut report = InstallReport {
            store: self.store_name.clone(),
            precached: Vec::new(),
            failed: Vec::new(),
            skip_waiting: self.skip_waiting,
        };

        if let Err(e) = self.storage.open(&self.store_name) {
            warn!(store = %self.store_name, error = %e, "Failed to open store");
        }

        let attempts = self
            .precache
            .iter()
            .map(|url| async move { (url.clone(), self.precache_one(url.clone()).await) });

        for (url, result) in join_all(attempts).await {
            match result {
                Ok(()) => report.precached.push(url),
                Err(e) => {
                    warn!(url = %url, error = %e, "Pre-population failed, skipping asset");
                    report.failed.push((url, e.to_string()));
                }
            }
        }

        info!(
            store = %self.store_name,
            precached = report.precached.len(),
            failed = report.failed.len(),
            "Install settled"
        );
        report
    }

    async fn precache_one(&self, url: Url) -> Result<(), ServiceWorkerError> {
        let request = Request::get(url);
        let key = RequestKey::from_request(&request);
        let response = self.fetcher.fetch(request).await?;
        if !response.ok() {
            return Err(ServiceWorkerError::UnexpectedStatus(response.status));
        }
        self.storage
            .put(&self.store_name, CacheEntry::capture(key, &response))?;
        Ok(())
    }

    /// Activate: delete every store that is not this worker's store.
    pub async fn activate(&self) -> ActivationReport {
        info!(store = %self.store_name, "Activating worker");

        let mut report = ActivationReport {
            current: self.store_name.clone(),
            deleted: Vec::new(),
            failed: Vec::new(),
        };

        let names = match self.storage.keys() {
            Ok(names) => names,
            Err(e) => {
                warn!(error = %e, "Failed to enumerate stores");
                report.failed.push(("*".to_string(), e.to_string()));
                return report;
            }
        };

        for name in names.into_iter().filter(|name| *name != self.store_name) {
            match self.storage.delete(&name) {
                Ok(_) => {
                    info!(store = %name, "Deleted superseded store");
                    report.deleted.push(name);
                }
                Err(e) => {
                    warn!(store = %name, error = %e, "Failed to delete superseded store");
                    report.failed.push((name.to_string(), e.to_string()));
                }
            }
        }

        report
    }

    /// Fetch: network first, store on failure.
    pub async fn handle_fetch(&self, request: Request) -> FetchOutcome {
        if let InterceptDecision::Passthrough(reason) = self.policy.classify(&request) {
            debug!(url = %request.url, ?reason, "Passing request through");
            return FetchOutcome::Passthrough { request, reason };
        }

        let key = RequestKey::from_request(&request);

        match self.fetcher.fetch(request).await {
            Ok(response) => {
                if response.ok() && response.is_http() {
                    let entry = CacheEntry::capture(key.clone(), &response);
                    if let Err(e) = self.storage.put(&self.store_name, entry) {
                        warn!(request = %key, error = %e, "Failed to store response");
                    }
                }
                debug!(request = %key, status = %response.status, "Served from network");
                FetchOutcome::Responded(response)
            }
            Err(network_error) => {
                match self.storage.match_request(&self.store_name, &key) {
                    Ok(Some(entry)) => match entry.to_response() {
                        Ok(response) => {
                            debug!(request = %key, error = %network_error, "Network failed, served from store");
                            return FetchOutcome::Responded(response);
                        }
                        Err(e) => warn!(request = %key, error = %e, "Stored entry is unreadable"),
                    },
                    Ok(None) => {}
                    Err(e) => warn!(request = %key, error = %e, "Store lookup failed"),
                }
                debug!(request = %key, error = %network_error, "Network failed, nothing stored");
                FetchOutcome::Failed(network_error)
            }
        }
    }
}
