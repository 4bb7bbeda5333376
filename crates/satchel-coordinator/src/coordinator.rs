//! The update/connectivity coordinator.

use std::sync::Arc;

use satchel_core::OfflineConfig;
use satchel_net::Fetcher;
use satchel_store::CacheStorage;
use satchel_sw::{
    CacheProxyWorker, RegistrationOptions, ServiceWorkerContainer, ServiceWorkerEvent,
    ServiceWorkerId, ServiceWorkerState, WorkerCommand,
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::{AppState, InstallPrompt, PageHost, PlatformEvent, PromptOutcome, UserAction};

/// What the coordinator needs to register a worker. Absent when the
/// platform has no worker support.
#[derive(Clone)]
pub struct WorkerSupport {
    pub container: Arc<ServiceWorkerContainer>,
    pub storage: Arc<dyn CacheStorage>,
    pub network: Arc<dyn Fetcher>,
}

/// Reconciles platform and worker signals into [`AppState`].
pub struct UpdateCoordinator {
    config: OfflineConfig,
    support: Option<WorkerSupport>,
    host: Arc<dyn PageHost>,
    state: AppState,
    state_tx: watch::Sender<AppState>,
    prompt: Option<Box<dyn InstallPrompt>>,
    scope: Option<String>,
    client_id: Option<String>,
    installing: Option<ServiceWorkerId>,
}

impl UpdateCoordinator {
    /// Create a coordinator. `initial_online` is the platform's connectivity
    /// at startup.
    pub fn new(
        config: OfflineConfig,
        support: Option<WorkerSupport>,
        host: Arc<dyn PageHost>,
        initial_online: bool,
    ) -> Self {
        let state = AppState {
            is_online: initial_online,
            ..AppState::default()
        };
        let (state_tx, _) = watch::channel(state);

        if support.is_none() {
            info!("No worker support, tracking connectivity only");
        }

        Self {
            config,
            support,
            host,
            state,
            state_tx,
            prompt: None,
            scope: None,
            client_id: None,
            installing: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> AppState {
        self.state
    }

    /// Receive every state change.
    pub fn subscribe(&self) -> watch::Receiver<AppState> {
        self.state_tx.subscribe()
    }

    /// The page client registered on load.
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    fn publish(&mut self, state: AppState) {
        if state != self.state {
            debug!(?state, "App state changed");
            self.state = state;
            self.state_tx.send_replace(state);
        }
    }

    /// Apply a platform notification.
    pub async fn handle_platform_event(&mut self, event: PlatformEvent) {
        let mut state = self.state;
        match event {
            PlatformEvent::Online => {
                info!("Back online");
                state.is_online = true;
            }
            PlatformEvent::Offline => {
                info!("Connection lost");
                state.is_online = false;
                state.was_offline = true;
            }
            PlatformEvent::Load => {
                self.register_worker().await;
                return;
            }
            PlatformEvent::BeforeInstallPrompt(prompt) => {
                debug!("Holding install prompt");
                self.prompt = Some(prompt);
                state.is_installable = true;
            }
        }
        self.publish(state);
    }

    async fn register_worker(&mut self) {
        let Some(support) = self.support.clone() else {
            return;
        };

        let (script_url, scope_url) = match (self.config.script_url(), self.config.scope_url()) {
            (Ok(script), Ok(scope)) => (script, scope),
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "Cannot derive worker location, skipping registration");
                return;
            }
        };

        let client = support.container.open_client(scope_url).await;
        self.client_id = Some(client.id);

        let worker = match CacheProxyWorker::new(
            &self.config,
            Arc::clone(&support.storage),
            Arc::clone(&support.network),
        ) {
            Ok(worker) => worker,
            Err(e) => {
                warn!(error = %e, "Cannot build worker, skipping registration");
                return;
            }
        };

        let options = RegistrationOptions {
            scope: Some(self.config.base_path.clone()),
        };
        match support
            .container
            .register(script_url.as_str(), options, worker)
            .await
        {
            Ok(outcome) => {
                info!(scope = %outcome.scope, "Worker registered");
                self.scope = Some(outcome.scope);
            }
            Err(e) => {
                warn!(error = %e, "Worker registration failed");
                return;
            }
        }

        self.check_waiting().await;
    }

    /// Surface a worker that is already waiting.
    async fn check_waiting(&mut self) {
        let (Some(support), Some(scope)) = (&self.support, &self.scope) else {
            return;
        };
        if support.container.waiting(scope).await.is_some() {
            let mut state = self.state;
            state.is_update_available = true;
            self.publish(state);
        }
    }

    /// Apply a worker lifecycle notification.
    pub fn handle_worker_event(&mut self, event: ServiceWorkerEvent) {
        match event {
            ServiceWorkerEvent::UpdateFound { scope, worker_id } => {
                debug!(%scope, worker = worker_id.raw(), "Update found");
                self.installing = Some(worker_id);
            }
            ServiceWorkerEvent::StateChange {
                worker_id,
                new_state: ServiceWorkerState::Installed,
                controller,
                ..
            } if self.installing == Some(worker_id) => {
                self.installing = None;
                // A first install has no other controller.
                if controller.is_some_and(|c| c != worker_id) {
                    info!(worker = worker_id.raw(), "New version waiting");
                    let mut state = self.state;
                    state.is_update_available = true;
                    self.publish(state);
                }
            }
            ServiceWorkerEvent::StateChange {
                worker_id,
                new_state: ServiceWorkerState::Redundant,
                ..
            } if self.installing == Some(worker_id) => {
                debug!(worker = worker_id.raw(), "Installing worker superseded");
                self.installing = None;
            }
            ServiceWorkerEvent::StateChange { .. } => {}
            ServiceWorkerEvent::ControllerChange {
                client_id,
                worker_id,
            } => {
                debug!(%client_id, worker = worker_id.raw(), "Controller changed");
            }
        }
    }

    /// Tell the waiting worker to take over, then reload the page.
    /// Returns false, doing nothing, when no worker is waiting.
    pub async fn update_app(&mut self) -> bool {
        let (Some(support), Some(scope)) = (&self.support, &self.scope) else {
            return false;
        };
        let Some(waiting) = support.container.waiting(scope).await else {
            debug!("No waiting worker, update ignored");
            return false;
        };

        if let Err(e) = waiting.post_message(WorkerCommand::SkipWaiting) {
            warn!(error = %e, "Failed to send skip-waiting");
        }
        info!(worker = waiting.id.raw(), "Reloading onto new version");
        self.host.reload();

        // The reloaded page starts without a pending update.
        let mut state = self.state;
        state.is_update_available = false;
        self.publish(state);
        true
    }

    /// Show the held install prompt. The prompt is single-use and is
    /// dropped whatever the user chose.
    pub async fn install_app(&mut self) -> bool {
        let prompt = self.prompt.take();
        let mut state = self.state;
        state.is_installable = false;
        self.publish(state);

        let Some(prompt) = prompt else {
            return false;
        };
        let outcome = prompt.prompt().await;
        info!(?outcome, "Install prompt answered");
        outcome == PromptOutcome::Accepted
    }

    /// Hide the update notice without touching the worker.
    pub fn dismiss_update(&mut self) {
        let mut state = self.state;
        state.is_update_available = false;
        self.publish(state);
    }

    /// Serve platform, UI and worker inputs until the platform channel closes.
    pub async fn run(
        mut self,
        mut platform: mpsc::UnboundedReceiver<PlatformEvent>,
        mut actions: mpsc::UnboundedReceiver<UserAction>,
        mut worker_events: Option<mpsc::UnboundedReceiver<ServiceWorkerEvent>>,
    ) {
        loop {
            let worker_event = async {
                match worker_events.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                event = platform.recv() => match event {
                    Some(event) => self.handle_platform_event(event).await,
                    None => break,
                },
                Some(action) = actions.recv() => match action {
                    UserAction::UpdateApp => {
                        self.update_app().await;
                    }
                    UserAction::InstallApp(reply) => {
                        let accepted = self.install_app().await;
                        let _ = reply.send(accepted);
                    }
                    UserAction::DismissUpdate => self.dismiss_update(),
                },
                event = worker_event => match event {
                    Some(event) => self.handle_worker_event(event),
                    None => worker_events = None,
                },
            }
        }
        debug!("Coordinator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::future::BoxFuture;
    use futures::FutureExt;
    use http::{HeaderMap, StatusCode};
    use satchel_core::VersionTag;
    use satchel_net::{FetchFuture, NetError, Request, Response};
    use satchel_store::MemoryCacheStorage;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;
    use url::Url;

    struct Ok200;

    impl Fetcher for Ok200 {
        fn fetch(&self, request: Request) -> FetchFuture<'_> {
            let response = Response::new(
                request.url.clone(),
                StatusCode::OK,
                HeaderMap::new(),
                Bytes::from_static(b"ok"),
            );
            async move { Ok::<_, NetError>(response) }.boxed()
        }
    }

    #[derive(Default)]
    struct CountingHost {
        reloads: AtomicUsize,
    }

    impl PageHost for CountingHost {
        fn reload(&self) {
            self.reloads.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FixedPrompt(PromptOutcome);

    impl InstallPrompt for FixedPrompt {
        fn prompt(self: Box<Self>) -> BoxFuture<'static, PromptOutcome> {
            let outcome = self.0;
            async move { outcome }.boxed()
        }
    }

    struct Page {
        coordinator: UpdateCoordinator,
        events: mpsc::UnboundedReceiver<ServiceWorkerEvent>,
        support: WorkerSupport,
        host: Arc<CountingHost>,
    }

    fn config(version: &str, skip_waiting: bool) -> OfflineConfig {
        OfflineConfig {
            origin: Url::parse("https://tools.example.edu/").unwrap(),
            version: VersionTag::new(version),
            skip_waiting_on_install: skip_waiting,
            ..Default::default()
        }
    }

    fn page(config: OfflineConfig) -> Page {
        let network: Arc<dyn Fetcher> = Arc::new(Ok200);
        let (container, events) = ServiceWorkerContainer::new(Arc::clone(&network));
        let support = WorkerSupport {
            container: Arc::new(container),
            storage: Arc::new(MemoryCacheStorage::new()),
            network,
        };
        let host = Arc::new(CountingHost::default());
        let coordinator = UpdateCoordinator::new(config, Some(support.clone()), host.clone(), true);
        Page {
            coordinator,
            events,
            support,
            host,
        }
    }

    /// Register a version from elsewhere while the page is open.
    async fn deploy(support: &WorkerSupport, config: &OfflineConfig) {
        let worker = CacheProxyWorker::new(
            config,
            Arc::clone(&support.storage),
            Arc::clone(&support.network),
        )
        .unwrap();
        support
            .container
            .register(
                config.script_url().unwrap().as_str(),
                RegistrationOptions::default(),
                worker,
            )
            .await
            .unwrap();
    }

    impl Page {
        fn pump_worker_events(&mut self) {
            while let Ok(event) = self.events.try_recv() {
                self.coordinator.handle_worker_event(event);
            }
        }

        async fn deploy(&self, config: &OfflineConfig) {
            deploy(&self.support, config).await;
        }
    }

    #[tokio::test]
    async fn test_offline_is_sticky() {
        let host = Arc::new(CountingHost::default());
        let mut coordinator = UpdateCoordinator::new(OfflineConfig::default(), None, host, true);
        assert!(coordinator.state().is_online);

        coordinator.handle_platform_event(PlatformEvent::Offline).await;
        assert!(!coordinator.state().is_online);
        assert!(coordinator.state().was_offline);

        coordinator.handle_platform_event(PlatformEvent::Online).await;
        let state = coordinator.state();
        assert!(state.is_online);
        assert!(state.was_offline);
    }

    #[tokio::test]
    async fn test_first_install_is_not_an_update() {
        let mut page = page(config("v1.0.2", true));

        page.coordinator.handle_platform_event(PlatformEvent::Load).await;
        page.pump_worker_events();

        assert!(page.coordinator.client_id().is_some());
        assert!(!page.coordinator.state().is_update_available);
    }

    #[tokio::test]
    async fn test_new_version_sets_update_flag() {
        let mut page = page(config("v1.0.2", true));
        page.coordinator.handle_platform_event(PlatformEvent::Load).await;
        page.pump_worker_events();

        page.deploy(&config("v1.0.3", false)).await;
        page.pump_worker_events();
        assert!(page.coordinator.state().is_update_available);

        page.coordinator.dismiss_update();
        assert!(!page.coordinator.state().is_update_available);
        // Dismissing leaves the worker waiting.
        assert!(page
            .support
            .container
            .waiting("https://tools.example.edu/")
            .await
            .is_some());
    }

    #[tokio::test]
    async fn test_same_version_registration_is_not_an_update() {
        let mut page = page(config("v1.0.2", true));
        page.coordinator.handle_platform_event(PlatformEvent::Load).await;
        page.pump_worker_events();

        page.deploy(&config("v1.0.2", true)).await;
        page.pump_worker_events();
        assert!(!page.coordinator.state().is_update_available);

        // Reloading the page on the same deployment.
        page.coordinator.handle_platform_event(PlatformEvent::Load).await;
        page.pump_worker_events();
        assert!(!page.coordinator.state().is_update_available);
    }

    #[tokio::test]
    async fn test_superseded_waiting_worker_keeps_flag() {
        let mut page = page(config("v1.0.2", true));
        page.coordinator.handle_platform_event(PlatformEvent::Load).await;
        page.pump_worker_events();

        page.deploy(&config("v1.0.3", false)).await;
        page.deploy(&config("v1.0.4", false)).await;
        page.pump_worker_events();

        assert!(page.coordinator.state().is_update_available);
        assert!(page.coordinator.installing.is_none());
    }

    #[tokio::test]
    async fn test_redundant_installing_worker_is_forgotten() {
        let mut page = page(config("v1.0.2", true));
        page.coordinator.handle_platform_event(PlatformEvent::Load).await;
        page.pump_worker_events();

        page.deploy(&config("v1.0.3", false)).await;
        let events: Vec<ServiceWorkerEvent> = std::iter::from_fn(|| page.events.try_recv().ok())
            .collect();
        let (scope, installing) = events
            .iter()
            .find_map(|event| match event {
                ServiceWorkerEvent::UpdateFound { scope, worker_id } => {
                    Some((scope.clone(), *worker_id))
                }
                _ => None,
            })
            .unwrap();

        page.coordinator
            .handle_worker_event(ServiceWorkerEvent::UpdateFound {
                scope: scope.clone(),
                worker_id: installing,
            });
        page.coordinator
            .handle_worker_event(ServiceWorkerEvent::StateChange {
                scope,
                worker_id: installing,
                new_state: ServiceWorkerState::Redundant,
                controller: None,
            });
        assert!(page.coordinator.installing.is_none());

        // A late install notice for the forgotten worker is ignored.
        for event in events {
            if matches!(
                event,
                ServiceWorkerEvent::StateChange {
                    new_state: ServiceWorkerState::Installed,
                    ..
                }
            ) {
                page.coordinator.handle_worker_event(event);
            }
        }
        assert!(!page.coordinator.state().is_update_available);
    }

    #[tokio::test]
    async fn test_update_app_activates_and_reloads() {
        let mut page = page(config("v1.0.2", true));
        page.coordinator.handle_platform_event(PlatformEvent::Load).await;
        page.deploy(&config("v1.0.3", false)).await;
        page.pump_worker_events();

        assert!(page.coordinator.update_app().await);
        assert_eq!(page.host.reloads.load(Ordering::SeqCst), 1);

        assert_eq!(page.support.container.pump_commands().await, 1);
        let scope = "https://tools.example.edu/";
        assert!(page.support.container.waiting(scope).await.is_none());

        let client = page.coordinator.client_id().unwrap().to_string();
        let active = page.support.container.active(scope).await.unwrap();
        assert_eq!(
            page.support.container.controller(&client).await,
            Some(active.id)
        );
    }

    #[tokio::test]
    async fn test_update_app_without_waiting_is_noop() {
        let mut page = page(config("v1.0.2", true));
        page.coordinator.handle_platform_event(PlatformEvent::Load).await;

        assert!(!page.coordinator.update_app().await);
        assert_eq!(page.host.reloads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_startup_surfaces_waiting_worker() {
        // An older version is active before this page loads.
        let mut page = page(config("v1.0.3", false));
        page.deploy(&config("v1.0.2", true)).await;

        page.coordinator.handle_platform_event(PlatformEvent::Load).await;

        assert!(page.coordinator.state().is_update_available);
    }

    #[tokio::test]
    async fn test_install_prompt_single_use() {
        let host = Arc::new(CountingHost::default());
        let mut coordinator = UpdateCoordinator::new(OfflineConfig::default(), None, host, true);

        coordinator
            .handle_platform_event(PlatformEvent::BeforeInstallPrompt(Box::new(FixedPrompt(
                PromptOutcome::Dismissed,
            ))))
            .await;
        assert!(coordinator.state().is_installable);

        assert!(!coordinator.install_app().await);
        assert!(!coordinator.state().is_installable);

        // Handle is gone.
        assert!(!coordinator.install_app().await);

        coordinator
            .handle_platform_event(PlatformEvent::BeforeInstallPrompt(Box::new(FixedPrompt(
                PromptOutcome::Accepted,
            ))))
            .await;
        assert!(coordinator.install_app().await);
    }

    #[tokio::test]
    async fn test_without_worker_support_load_is_harmless() {
        let host = Arc::new(CountingHost::default());
        let mut coordinator = UpdateCoordinator::new(OfflineConfig::default(), None, host, false);

        coordinator.handle_platform_event(PlatformEvent::Load).await;
        assert!(!coordinator.update_app().await);
        assert_eq!(
            coordinator.state(),
            AppState {
                is_online: false,
                ..AppState::default()
            }
        );
    }

    #[tokio::test]
    async fn test_run_loop_publishes_state() {
        let host = Arc::new(CountingHost::default());
        let coordinator = UpdateCoordinator::new(OfflineConfig::default(), None, host, true);
        let mut state_rx = coordinator.subscribe();

        let (platform_tx, platform_rx) = mpsc::unbounded_channel();
        let (action_tx, action_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(coordinator.run(platform_rx, action_rx, None));

        platform_tx.send(PlatformEvent::Offline).unwrap();
        state_rx.changed().await.unwrap();
        assert!(state_rx.borrow().was_offline);

        let (reply_tx, reply_rx) = oneshot::channel();
        action_tx.send(UserAction::InstallApp(reply_tx)).unwrap();
        assert!(!reply_rx.await.unwrap());

        drop(platform_tx);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_run_loop_applies_worker_events() {
        let Page {
            coordinator,
            events,
            support,
            host,
        } = page(config("v1.0.2", true));
        let mut state_rx = coordinator.subscribe();
        let scope = "https://tools.example.edu/";

        let (platform_tx, platform_rx) = mpsc::unbounded_channel();
        let (action_tx, action_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(coordinator.run(platform_rx, action_rx, Some(events)));

        platform_tx.send(PlatformEvent::Load).unwrap();
        for _ in 0..100 {
            if support.container.active(scope).await.is_some() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(support.container.active(scope).await.is_some());

        deploy(&support, &config("v1.0.3", false)).await;
        state_rx
            .wait_for(|state| state.is_update_available)
            .await
            .unwrap();

        action_tx.send(UserAction::UpdateApp).unwrap();
        state_rx
            .wait_for(|state| !state.is_update_available)
            .await
            .unwrap();
        assert_eq!(host.reloads.load(Ordering::SeqCst), 1);

        assert_eq!(support.container.pump_commands().await, 1);
        assert!(support.container.waiting(scope).await.is_none());

        drop(platform_tx);
        task.await.unwrap();
    }

    #[test]
    fn test_state_serializes_camel_case() {
        let json = serde_json::to_value(AppState {
            is_online: true,
            ..AppState::default()
        })
        .unwrap();
        assert_eq!(json["isOnline"], true);
        assert_eq!(json["wasOffline"], false);
        assert_eq!(json["isUpdateAvailable"], false);
        assert_eq!(json["isInstallable"], false);
    }
}
