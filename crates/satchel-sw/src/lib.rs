//! # Satchel Service Worker
//!
//! The cache proxy worker and the lifecycle machinery around it.
//!
//! ## Features
//!
//! - **Lifecycle**: install, activate and fetch handlers, each returning a
//!   report once everything inside it has settled
//! - **Network-first fetch**: live responses are preferred and snapshotted;
//!   the current store is only consulted when the network fails
//! - **Version scoping**: activation purges every store not owned by the
//!   activating version
//! - **Commands**: fire-and-forget skip-waiting messages from the page
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerContainer
//!     │
//!     ├── ServiceWorkerRegistration (per scope)
//!     │       ├── installing ─→ waiting ─→ activating ─→ active ─→ redundant
//!     │       └── each ServiceWorker wraps a CacheProxyWorker
//!     │
//!     ├── Clients (controlled pages)
//!     │
//!     ├── events ──→ ServiceWorkerEvent (update found, state change, controller change)
//!     └── commands ←── WorkerMessage (skip waiting)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use http::StatusCode;
use satchel_common::SatchelError;
use satchel_core::ConfigError;
use satchel_net::NetError;
use satchel_store::StoreError;
use serde::Serialize;
use thiserror::Error;

pub mod clients;
pub mod container;
pub mod proxy;
pub mod registration;

pub use clients::{Client, Clients};
pub use container::{FetchEvent, RegisterOutcome, RegistrationOptions, ServiceWorkerContainer};
pub use proxy::{ActivationReport, CacheProxyWorker, FetchOutcome, InstallReport};
pub use registration::{ServiceWorker, ServiceWorkerRegistration};

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("Unexpected status: {0}")]
    UnexpectedStatus(StatusCode),

    #[error("Cache error: {0}")]
    Cache(#[from] StoreError),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<ServiceWorkerError> for SatchelError {
    fn from(err: ServiceWorkerError) -> Self {
        match err {
            ServiceWorkerError::Network(e) => e.into(),
            ServiceWorkerError::Cache(e) => e.into(),
            ServiceWorkerError::Config(e) => e.into(),
            ServiceWorkerError::NotFound(what) => SatchelError::NotFound(what),
            other => SatchelError::lifecycle_with_source("service worker failure", other),
        }
    }
}

// ==================== Types ====================

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceWorkerState {
    /// Created, install not started.
    #[default]
    Parsed,
    /// Install handler running.
    Installing,
    /// Installed and waiting for activation.
    Installed,
    /// Activate handler running.
    Activating,
    /// Active and intercepting fetches.
    Activated,
    /// Replaced by a newer worker or unregistered.
    Redundant,
}

impl ServiceWorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceWorkerState::Parsed => "parsed",
            ServiceWorkerState::Installing => "installing",
            ServiceWorkerState::Installed => "installed",
            ServiceWorkerState::Activating => "activating",
            ServiceWorkerState::Activated => "activated",
            ServiceWorkerState::Redundant => "redundant",
        }
    }

    /// Only an activated worker sees fetches.
    pub fn can_intercept_fetch(&self) -> bool {
        *self == ServiceWorkerState::Activated
    }
}

/// Command sent from a page to a worker. No payload, no acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerCommand {
    /// Activate the waiting worker immediately.
    SkipWaiting,
}

/// A command addressed to one worker of one registration.
#[derive(Debug, Clone)]
pub struct WorkerMessage {
    pub scope: String,
    pub target: ServiceWorkerId,
    pub command: WorkerCommand,
}

/// Lifecycle notifications observed by pages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerEvent {
    /// A new worker started installing.
    UpdateFound {
        scope: String,
        worker_id: ServiceWorkerId,
    },
    /// A worker changed state. `controller` is the registration's active
    /// worker at the moment of the transition.
    StateChange {
        scope: String,
        worker_id: ServiceWorkerId,
        new_state: ServiceWorkerState,
        controller: Option<ServiceWorkerId>,
    },
    /// A client is now controlled by a different worker.
    ControllerChange {
        client_id: String,
        worker_id: ServiceWorkerId,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_activated_intercepts() {
        assert!(ServiceWorkerState::Activated.can_intercept_fetch());
        for state in [
            ServiceWorkerState::Parsed,
            ServiceWorkerState::Installing,
            ServiceWorkerState::Installed,
            ServiceWorkerState::Activating,
            ServiceWorkerState::Redundant,
        ] {
            assert!(!state.can_intercept_fetch(), "{}", state.as_str());
        }
    }

    #[test]
    fn test_worker_ids_unique() {
        assert_ne!(ServiceWorkerId::new(), ServiceWorkerId::new());
    }

    #[test]
    fn test_error_maps_to_category() {
        let err: SatchelError =
            ServiceWorkerError::Network(NetError::RequestFailed("offline".into())).into();
        assert_eq!(err.category(), "network");

        let err: SatchelError = ServiceWorkerError::StateError("nothing waiting".into()).into();
        assert_eq!(err.category(), "lifecycle");
    }
}
