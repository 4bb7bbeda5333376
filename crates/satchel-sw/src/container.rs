//! The worker container: registration, lifecycle driving, fetch dispatch
//! and the page-to-worker command channel.

use std::sync::Arc;

use hashbrown::HashMap;
use satchel_net::{Fetcher, Request, Response};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::clients::{Client, Clients};
use crate::proxy::{ActivationReport, CacheProxyWorker, FetchOutcome, InstallReport};
use crate::registration::{ServiceWorker, ServiceWorkerRegistration};
use crate::{
    ServiceWorkerError, ServiceWorkerEvent, ServiceWorkerId, ServiceWorkerState, WorkerCommand,
    WorkerMessage,
};

/// Options for service worker registration.
#[derive(Debug, Clone, Default)]
pub struct RegistrationOptions {
    /// Scope URL. Defaults to the directory of the script.
    pub scope: Option<String>,
}

/// What a call to [`ServiceWorkerContainer::register`] did.
#[derive(Debug, Clone, Serialize)]
pub struct RegisterOutcome {
    pub scope: String,
    pub worker_id: ServiceWorkerId,
    /// Absent when the version was already registered and nothing was
    /// installed.
    pub install: Option<InstallReport>,
    /// Present when the worker was activated right after installing.
    pub activation: Option<ActivationReport>,
}

/// A request leaving a page.
#[derive(Debug, Clone)]
pub struct FetchEvent {
    /// The request.
    pub request: Request,

    /// Client that issued the request.
    pub client_id: Option<String>,

    /// Is navigation request.
    pub is_navigation: bool,
}

impl FetchEvent {
    /// Subresource request from a client.
    pub fn subresource(request: Request, client_id: impl Into<String>) -> Self {
        Self {
            request,
            client_id: Some(client_id.into()),
            is_navigation: false,
        }
    }

    /// Navigation request.
    pub fn navigation(request: Request, client_id: Option<String>) -> Self {
        Self {
            request,
            client_id,
            is_navigation: true,
        }
    }
}

/// Service worker container.
pub struct ServiceWorkerContainer {
    /// Registrations by scope.
    registrations: Arc<RwLock<HashMap<String, ServiceWorkerRegistration>>>,

    /// Clients.
    pub clients: Arc<RwLock<Clients>>,

    /// Network used when no worker intercepts.
    network: Arc<dyn Fetcher>,

    /// Event sender for lifecycle notifications.
    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,

    command_tx: mpsc::UnboundedSender<WorkerMessage>,
    command_rx: Mutex<Option<mpsc::UnboundedReceiver<WorkerMessage>>>,
}

impl ServiceWorkerContainer {
    /// Create a new container.
    pub fn new(network: Arc<dyn Fetcher>) -> (Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        (
            Self {
                registrations: Arc::new(RwLock::new(HashMap::new())),
                clients: Arc::new(RwLock::new(Clients::new())),
                network,
                event_tx,
                command_tx,
                command_rx: Mutex::new(Some(command_rx)),
            },
            event_rx,
        )
    }

    fn emit(&self, event: ServiceWorkerEvent) {
        // Nobody listening is fine.
        let _ = self.event_tx.send(event);
    }

    fn emit_state(
        &self,
        scope: &str,
        worker_id: ServiceWorkerId,
        new_state: ServiceWorkerState,
        controller: Option<ServiceWorkerId>,
    ) {
        self.emit(ServiceWorkerEvent::StateChange {
            scope: scope.to_string(),
            worker_id,
            new_state,
            controller,
        });
    }

    /// Register a worker script and run it through install, then activation
    /// when it asks to skip waiting or nothing is active yet.
    ///
    /// Registering the version the newest worker already runs is a no-op.
    pub async fn register(
        &self,
        script_url: &str,
        options: RegistrationOptions,
        worker: CacheProxyWorker,
    ) -> Result<RegisterOutcome, ServiceWorkerError> {
        let script_url = Url::parse(script_url)
            .map_err(|e| ServiceWorkerError::RegistrationFailed(e.to_string()))?;

        let scope = match options.scope {
            Some(s) => script_url
                .join(&s)
                .map_err(|e| ServiceWorkerError::RegistrationFailed(e.to_string()))?,
            None => script_url
                .join("./")
                .map_err(|e| ServiceWorkerError::RegistrationFailed(e.to_string()))?,
        };

        if scope.origin() != script_url.origin() {
            return Err(ServiceWorkerError::RegistrationFailed(format!(
                "scope {} is not same-origin with {}",
                scope, script_url
            )));
        }

        let scope_str = scope.to_string();

        let (worker_id, proxy, controller, superseded) = {
            let mut registrations = self.registrations.write().await;
            let registration = registrations
                .entry(scope_str.clone())
                .or_insert_with(|| ServiceWorkerRegistration::new(scope.clone()));

            if let Some(current) = registration
                .newest()
                .filter(|w| w.store_name() == worker.store_name())
            {
                debug!(
                    scope = %scope_str,
                    worker = current.id.raw(),
                    store = %current.store_name(),
                    "Version unchanged, keeping registered worker"
                );
                return Ok(RegisterOutcome {
                    scope: scope_str,
                    worker_id: current.id,
                    install: None,
                    activation: None,
                });
            }

            let worker = ServiceWorker::new(
                script_url,
                scope_str.clone(),
                worker,
                self.command_tx.clone(),
            );
            let handle = (worker.id, worker.proxy());
            let superseded = registration.update(worker);
            (handle.0, handle.1, registration.controller_id(), superseded)
        };

        if let Some(old) = superseded {
            self.emit_state(&scope_str, old, ServiceWorkerState::Redundant, controller);
        }

        info!(scope = %scope_str, worker = worker_id.raw(), "Update found, installing");
        self.emit(ServiceWorkerEvent::UpdateFound {
            scope: scope_str.clone(),
            worker_id,
        });
        self.emit_state(&scope_str, worker_id, ServiceWorkerState::Installing, controller);

        // Install runs without any lock so the current worker keeps serving.
        let install = proxy.install().await;

        let (controller, stale) = {
            let mut registrations = self.registrations.write().await;
            let registration = registrations
                .get_mut(&scope_str)
                .ok_or_else(|| ServiceWorkerError::NotFound(scope_str.clone()))?;
            let stale = registration.install_complete(worker_id)?;
            (registration.controller_id(), stale)
        };

        if let Some(old) = stale {
            self.emit_state(&scope_str, old, ServiceWorkerState::Redundant, controller);
        }
        info!(scope = %scope_str, worker = worker_id.raw(), "Worker installed, waiting");
        self.emit_state(&scope_str, worker_id, ServiceWorkerState::Installed, controller);

        // With no active worker there is nothing to wait for.
        let activation = if install.skip_waiting || controller.is_none() {
            self.activate_waiting(&scope_str).await?
        } else {
            None
        };

        Ok(RegisterOutcome {
            scope: scope_str,
            worker_id,
            install: Some(install),
            activation,
        })
    }

    /// Activate the waiting worker of `scope`, if there is one.
    ///
    /// The old active worker becomes redundant and every client in scope is
    /// claimed by the new one. Returns `None` when nothing was waiting.
    pub async fn activate_waiting(
        &self,
        scope: &str,
    ) -> Result<Option<ActivationReport>, ServiceWorkerError> {
        let (worker_id, scope_url, report) = {
            let mut registrations = self.registrations.write().await;
            let registration = registrations
                .get_mut(scope)
                .ok_or_else(|| ServiceWorkerError::NotFound(scope.to_string()))?;

            let previous = registration.controller_id();
            let Some((worker_id, proxy)) = registration.begin_activation() else {
                debug!(scope, "Nothing waiting, skip-waiting ignored");
                return Ok(None);
            };
            self.emit_state(scope, worker_id, ServiceWorkerState::Activating, previous);

            // Fetches for this scope queue behind the activate handler.
            let report = proxy.activate().await;

            if let Some(old) = registration.finish_activation() {
                self.emit_state(scope, old, ServiceWorkerState::Redundant, Some(worker_id));
            }
            self.emit_state(scope, worker_id, ServiceWorkerState::Activated, Some(worker_id));
            (worker_id, registration.scope.clone(), report)
        };

        info!(
            scope,
            worker = worker_id.raw(),
            purged = report.deleted.len(),
            "Worker activated"
        );

        let claimed = self.clients.write().await.claim(&scope_url, worker_id);
        for client_id in claimed {
            self.emit(ServiceWorkerEvent::ControllerChange {
                client_id,
                worker_id,
            });
        }

        Ok(Some(report))
    }

    /// The waiting worker of `scope`.
    pub async fn waiting(&self, scope: &str) -> Option<ServiceWorker> {
        self.registrations
            .read()
            .await
            .get(scope)
            .and_then(|r| r.waiting.clone())
    }

    /// The active worker of `scope`.
    pub async fn active(&self, scope: &str) -> Option<ServiceWorker> {
        self.registrations
            .read()
            .await
            .get(scope)
            .and_then(|r| r.active.clone())
    }

    /// The worker controlling a client.
    pub async fn controller(&self, client_id: &str) -> Option<ServiceWorkerId> {
        self.clients
            .read()
            .await
            .get(client_id)
            .and_then(|c| c.controller)
    }

    /// Open a window client. It is controlled by the active worker whose
    /// scope covers `url`, if any.
    pub async fn open_client(&self, url: Url) -> Client {
        let controller = {
            let registrations = self.registrations.read().await;
            matching_scope(&registrations, &url).and_then(|r| r.controller_id())
        };
        self.clients.write().await.open_window(url, controller)
    }

    /// Get all registration scopes.
    pub async fn get_registrations(&self) -> Vec<String> {
        let mut scopes: Vec<String> = self.registrations.read().await.keys().cloned().collect();
        scopes.sort();
        scopes
    }

    /// Unregister a scope. Its workers become redundant and release their
    /// clients.
    pub async fn unregister(&self, scope: &str) -> bool {
        let Some(mut registration) = self.registrations.write().await.remove(scope) else {
            return false;
        };

        let workers = registration.unregister();
        for worker_id in &workers {
            self.emit_state(scope, *worker_id, ServiceWorkerState::Redundant, None);
        }
        self.clients.write().await.release(&workers);
        info!(scope, "Unregistered");
        true
    }

    /// Route a request through the worker controlling it, or straight to the
    /// network when no worker intercepts.
    pub async fn dispatch_fetch(&self, event: FetchEvent) -> Result<Response, ServiceWorkerError> {
        let FetchEvent {
            request,
            client_id,
            is_navigation,
        } = event;

        let worker = if is_navigation {
            let registrations = self.registrations.read().await;
            let active = matching_scope(&registrations, &request.url)
                .and_then(|r| r.active.as_ref())
                .filter(|w| w.state.can_intercept_fetch())
                .map(|w| (w.id, w.proxy()));
            drop(registrations);

            if let Some(client_id) = &client_id {
                if let Some(client) = self.clients.write().await.get_mut(client_id) {
                    client.url = request.url.clone();
                    client.controller = active.as_ref().map(|(id, _)| *id);
                }
            }
            active.map(|(_, proxy)| proxy)
        } else {
            match client_id.as_deref() {
                Some(client_id) => match self.controller(client_id).await {
                    Some(controller) => self.active_proxy(controller).await,
                    None => None,
                },
                None => None,
            }
        };

        let Some(worker) = worker else {
            debug!(url = %request.url, "No active worker, going to network");
            return Ok(self.network.fetch(request).await?);
        };

        match worker.handle_fetch(request).await {
            FetchOutcome::Responded(response) => Ok(response),
            FetchOutcome::Passthrough { request, .. } => Ok(self.network.fetch(request).await?),
            FetchOutcome::Failed(e) => Err(e.into()),
        }
    }

    async fn active_proxy(&self, id: ServiceWorkerId) -> Option<Arc<CacheProxyWorker>> {
        self.registrations
            .read()
            .await
            .values()
            .filter_map(|r| r.active.as_ref())
            .find(|w| w.id == id && w.state.can_intercept_fetch())
            .map(|w| w.proxy())
    }

    async fn handle_command(&self, message: WorkerMessage) {
        match message.command {
            WorkerCommand::SkipWaiting => {
                let targeted = self
                    .waiting(&message.scope)
                    .await
                    .is_some_and(|w| w.id == message.target);
                if !targeted {
                    debug!(
                        scope = %message.scope,
                        worker = message.target.raw(),
                        "Skip-waiting for a worker that is not waiting"
                    );
                    return;
                }
                if let Err(e) = self.activate_waiting(&message.scope).await {
                    warn!(scope = %message.scope, error = %e, "Skip-waiting failed");
                }
            }
        }
    }

    /// Process every command queued so far. Returns how many were handled.
    pub async fn pump_commands(&self) -> usize {
        let mut handled = 0;
        loop {
            let message = {
                let mut rx = self.command_rx.lock().await;
                match rx.as_mut() {
                    Some(rx) => rx.try_recv().ok(),
                    None => None,
                }
            };
            let Some(message) = message else {
                return handled;
            };
            self.handle_command(message).await;
            handled += 1;
        }
    }

    /// Process commands on a background task for the container's lifetime.
    pub async fn spawn_command_loop(
        self: &Arc<Self>,
    ) -> Result<JoinHandle<()>, ServiceWorkerError> {
        let mut rx = self
            .command_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| ServiceWorkerError::StateError("command loop already running".into()))?;

        let container = Arc::clone(self);
        Ok(tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                container.handle_command(message).await;
            }
        }))
    }
}

/// The registration with the longest scope that prefixes `url`.
fn matching_scope<'a>(
    registrations: &'a HashMap<String, ServiceWorkerRegistration>,
    url: &Url,
) -> Option<&'a ServiceWorkerRegistration> {
    registrations
        .iter()
        .filter(|(scope, _)| url.as_str().starts_with(scope.as_str()))
        .max_by_key(|(scope, _)| scope.len())
        .map(|(_, registration)| registration)
}
