//! Wiring of config, storage, network and container for one CLI run.

use std::sync::Arc;

use futures::FutureExt;
use satchel_common::Result;
use satchel_core::OfflineConfig;
use satchel_net::{
    FetchFuture, Fetcher, HttpFetcher, LoaderConfig, NetError, Request, Response,
};
use satchel_store::{CacheStorage, SqliteCacheStorage};
use satchel_sw::{
    CacheProxyWorker, FetchEvent, RegisterOutcome, RegistrationOptions, ServiceWorkerContainer,
};
use tracing::debug;

/// Network that is never reachable.
struct Unreachable;

impl Fetcher for Unreachable {
    fn fetch(&self, request: Request) -> FetchFuture<'_> {
        let url = request.url;
        async move { Err(NetError::RequestFailed(format!("offline: {}", url))) }.boxed()
    }
}

/// A container with the configured version registered against it.
pub struct Session {
    pub container: ServiceWorkerContainer,
    pub client_id: String,
    pub outcome: RegisterOutcome,
}

impl Session {
    /// Open storage, build the network and register the worker.
    pub async fn start(config: OfflineConfig, offline: bool) -> Result<Self> {
        let storage: Arc<dyn CacheStorage> =
            Arc::new(SqliteCacheStorage::open_path(&config.store_path)?);

        let network: Arc<dyn Fetcher> = if offline {
            Arc::new(Unreachable)
        } else {
            Arc::new(HttpFetcher::new(LoaderConfig {
                user_agent: config.user_agent.clone(),
                ..Default::default()
            })?)
        };

        let (container, _events) = ServiceWorkerContainer::new(Arc::clone(&network));
        let worker = CacheProxyWorker::new(&config, storage, network)?;

        let options = RegistrationOptions {
            scope: Some(config.base_path.clone()),
        };
        let outcome = container
            .register(config.script_url()?.as_str(), options, worker)
            .await?;

        let client = container.open_client(config.scope_url()?).await;
        debug!(client = %client.id, "Opened page client");

        Ok(Self {
            container,
            client_id: client.id,
            outcome,
        })
    }

    /// Issue a GET from the page.
    pub async fn get(&self, url: &str) -> Result<Response> {
        let request = Request::get_str(url)?;
        Ok(self
            .container
            .dispatch_fetch(FetchEvent::subresource(request, self.client_id.clone()))
            .await?)
    }
}
