//! # Satchel Coordinator
//!
//! Page-side reconciliation of connectivity, pending updates and install
//! prompt availability into one [`AppState`].
//!
//! ```text
//! PlatformEvent ──┐
//! UserAction ─────┼──→ UpdateCoordinator ──→ watch<AppState> ──→ UI
//! ServiceWorkerEvent ┘        │
//!                             └──→ skip-waiting command, page reload
//! ```
//!
//! All inputs are handled on one task, so state mutations never race.

use std::fmt;

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::oneshot;

pub mod coordinator;

pub use coordinator::{UpdateCoordinator, WorkerSupport};

/// UI-facing snapshot of the offline layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppState {
    /// Latest connectivity signal.
    pub is_online: bool,
    /// Set by the first offline signal and never cleared.
    pub was_offline: bool,
    /// A new version is installed and waiting.
    pub is_update_available: bool,
    /// An install prompt is being held.
    pub is_installable: bool,
}

/// What the user chose when shown the install prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptOutcome {
    Accepted,
    Dismissed,
}

/// A deferred install prompt. Consumed by showing it.
pub trait InstallPrompt: Send {
    fn prompt(self: Box<Self>) -> BoxFuture<'static, PromptOutcome>;
}

/// The page hosting the coordinator.
pub trait PageHost: Send + Sync {
    /// Force a full reload of the page.
    fn reload(&self);
}

/// Notifications from the platform.
pub enum PlatformEvent {
    Online,
    Offline,
    /// The page finished loading.
    Load,
    /// The platform offered to install the app. Its default UI is
    /// suppressed and the prompt is kept for later.
    BeforeInstallPrompt(Box<dyn InstallPrompt>),
}

impl fmt::Debug for PlatformEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlatformEvent::Online => f.write_str("Online"),
            PlatformEvent::Offline => f.write_str("Offline"),
            PlatformEvent::Load => f.write_str("Load"),
            PlatformEvent::BeforeInstallPrompt(_) => f.write_str("BeforeInstallPrompt"),
        }
    }
}

/// Actions triggered from the UI.
#[derive(Debug)]
pub enum UserAction {
    /// Activate the waiting version and reload.
    UpdateApp,
    /// Show the held install prompt; replies whether it was accepted.
    InstallApp(oneshot::Sender<bool>),
    /// Hide the update notice.
    DismissUpdate,
}
