//! Worker handles and the per-scope registration state machine.

use std::fmt;
use std::sync::Arc;

use satchel_core::StoreName;
use tokio::sync::mpsc;
use tracing::debug;
use url::Url;

use crate::proxy::CacheProxyWorker;
use crate::{ServiceWorkerError, ServiceWorkerId, ServiceWorkerState, WorkerCommand, WorkerMessage};

// ==================== Service Worker ====================

/// A service worker instance.
#[derive(Clone)]
pub struct ServiceWorker {
    /// Unique ID.
    pub id: ServiceWorkerId,

    /// Script URL.
    pub script_url: Url,

    /// Current state.
    pub state: ServiceWorkerState,

    scope: String,
    worker: Arc<CacheProxyWorker>,
    commands: mpsc::UnboundedSender<WorkerMessage>,
}

impl ServiceWorker {
    /// Create a new service worker in the `Parsed` state.
    pub(crate) fn new(
        script_url: Url,
        scope: String,
        worker: CacheProxyWorker,
        commands: mpsc::UnboundedSender<WorkerMessage>,
    ) -> Self {
        Self {
            id: ServiceWorkerId::new(),
            script_url,
            state: ServiceWorkerState::Parsed,
            scope,
            worker: Arc::new(worker),
            commands,
        }
    }

    /// Set state.
    pub fn set_state(&mut self, state: ServiceWorkerState) {
        debug!(
            worker = self.id.raw(),
            from = self.state.as_str(),
            to = state.as_str(),
            "Worker state change"
        );
        self.state = state;
    }

    /// Check if active.
    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Activated
    }

    /// Check if redundant.
    pub fn is_redundant(&self) -> bool {
        self.state == ServiceWorkerState::Redundant
    }

    /// Registration scope this worker belongs to.
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Store owned by this worker's version.
    pub fn store_name(&self) -> &StoreName {
        self.worker.store_name()
    }

    /// The proxy running inside this worker.
    pub fn proxy(&self) -> Arc<CacheProxyWorker> {
        Arc::clone(&self.worker)
    }

    /// Post a command to the worker. Fire and forget.
    pub fn post_message(&self, command: WorkerCommand) -> Result<(), ServiceWorkerError> {
        if self.is_redundant() {
            return Err(ServiceWorkerError::StateError(
                "Cannot post message to redundant worker".to_string(),
            ));
        }
        self.commands
            .send(WorkerMessage {
                scope: self.scope.clone(),
                target: self.id,
                command,
            })
            .map_err(|_| ServiceWorkerError::StateError("Worker container is gone".to_string()))
    }
}

impl fmt::Debug for ServiceWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceWorker")
            .field("id", &self.id)
            .field("script_url", &self.script_url.as_str())
            .field("state", &self.state)
            .field("store", &self.store_name().as_str())
            .finish()
    }
}

// ==================== Registration ====================

/// A service worker registration.
#[derive(Debug)]
pub struct ServiceWorkerRegistration {
    /// Scope URL.
    pub scope: Url,

    /// Installing worker.
    pub installing: Option<ServiceWorker>,

    /// Waiting worker (installed but not active).
    pub waiting: Option<ServiceWorker>,

    /// Worker whose activate handler is running.
    pub activating: Option<ServiceWorker>,

    /// Active worker.
    pub active: Option<ServiceWorker>,
}

impl ServiceWorkerRegistration {
    /// Create a new registration.
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            activating: None,
            active: None,
        }
    }

    /// ID of the worker that controls pages in this scope.
    pub fn controller_id(&self) -> Option<ServiceWorkerId> {
        self.active.as_ref().map(|worker| worker.id)
    }

    /// Find a worker of this registration by ID.
    pub fn worker(&self, id: ServiceWorkerId) -> Option<&ServiceWorker> {
        [&self.installing, &self.waiting, &self.activating, &self.active]
            .into_iter()
            .flatten()
            .find(|worker| worker.id == id)
    }

    /// The most recently installed worker: waiting, else active.
    pub fn newest(&self) -> Option<&ServiceWorker> {
        self.waiting.as_ref().or(self.active.as_ref())
    }

    /// Start installing a new worker. A worker still installing is replaced
    /// and its ID returned.
    pub fn update(&mut self, mut worker: ServiceWorker) -> Option<ServiceWorkerId> {
        worker.set_state(ServiceWorkerState::Installing);
        self.installing.replace(worker).map(|mut superseded| {
            superseded.set_state(ServiceWorkerState::Redundant);
            superseded.id
        })
    }

    /// Transition the installing worker to waiting. Returns the previously
    /// waiting worker, which becomes redundant.
    ///
    /// Fails when `id` is no longer the installing worker.
    pub fn install_complete(
        &mut self,
        id: ServiceWorkerId,
    ) -> Result<Option<ServiceWorkerId>, ServiceWorkerError> {
        match self.installing.take() {
            Some(mut worker) if worker.id == id => {
                worker.set_state(ServiceWorkerState::Installed);
                Ok(self.waiting.replace(worker).map(|mut stale| {
                    stale.set_state(ServiceWorkerState::Redundant);
                    stale.id
                }))
            }
            other => {
                self.installing = other;
                Err(ServiceWorkerError::StateError(format!(
                    "worker {} was superseded while installing",
                    id.raw()
                )))
            }
        }
    }

    /// Move the waiting worker into the activating slot.
    pub fn begin_activation(&mut self) -> Option<(ServiceWorkerId, Arc<CacheProxyWorker>)> {
        let mut worker = self.waiting.take()?;
        worker.set_state(ServiceWorkerState::Activating);
        let handle = (worker.id, worker.proxy());
        self.activating = Some(worker);
        Some(handle)
    }

    /// Promote the activating worker. Returns the worker it superseded.
    pub fn finish_activation(&mut self) -> Option<ServiceWorkerId> {
        let mut worker = self.activating.take()?;
        worker.set_state(ServiceWorkerState::Activated);

        self.active.replace(worker).map(|mut old| {
            old.set_state(ServiceWorkerState::Redundant);
            old.id
        })
    }

    /// Unregister: every worker becomes redundant. Returns their IDs.
    pub fn unregister(&mut self) -> Vec<ServiceWorkerId> {
        [
            self.active.take(),
            self.activating.take(),
            self.waiting.take(),
            self.installing.take(),
        ]
        .into_iter()
        .flatten()
        .map(|mut worker| {
            worker.set_state(ServiceWorkerState::Redundant);
            worker.id
        })
        .collect()
    }
}
