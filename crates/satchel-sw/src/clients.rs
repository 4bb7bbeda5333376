//! Pages controlled (or controllable) by a worker.

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use url::Url;

use crate::ServiceWorkerId;

/// A client (controlled page).
#[derive(Debug, Clone)]
pub struct Client {
    /// Client ID.
    pub id: String,

    /// Client URL.
    pub url: Url,

    /// Worker controlling this client, if any.
    pub controller: Option<ServiceWorkerId>,
}

impl Client {
    /// Whether the client URL falls inside `scope`.
    pub fn in_scope(&self, scope: &Url) -> bool {
        self.url.as_str().starts_with(scope.as_str())
    }
}

/// Clients API.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<String, Client>,
}

impl Clients {
    /// Create new clients manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a client by ID.
    pub fn get(&self, id: &str) -> Option<&Client> {
        self.clients.get(id)
    }

    /// Get a client by ID for mutation.
    pub fn get_mut(&mut self, id: &str) -> Option<&mut Client> {
        self.clients.get_mut(id)
    }

    /// Open a window client at `url`.
    pub fn open_window(&mut self, url: Url, controller: Option<ServiceWorkerId>) -> Client {
        let client = Client {
            id: next_client_id(),
            url,
            controller,
        };
        self.clients.insert(client.id.clone(), client.clone());
        client
    }

    /// Make `worker_id` the controller of every client in `scope`.
    /// Returns the IDs of clients whose controller changed.
    pub fn claim(&mut self, scope: &Url, worker_id: ServiceWorkerId) -> Vec<String> {
        let mut claimed: Vec<String> = self
            .clients
            .values_mut()
            .filter(|c| c.in_scope(scope) && c.controller != Some(worker_id))
            .map(|c| {
                c.controller = Some(worker_id);
                c.id.clone()
            })
            .collect();
        claimed.sort();
        claimed
    }

    /// Drop control by any of `workers`.
    pub fn release(&mut self, workers: &[ServiceWorkerId]) {
        for client in self.clients.values_mut() {
            if client.controller.is_some_and(|id| workers.contains(&id)) {
                client.controller = None;
            }
        }
    }
}

fn next_client_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    format!("client-{}", COUNTER.fetch_add(1, Ordering::Relaxed))
}
