//! Lifecycle runtime: hosts controller versions and delivers events.
//!
//! ```text
//! ServiceWorkerRuntime
//!     ├── ServiceWorkerRegistration
//!     │       ├── installing (ServiceWorker)
//!     │       ├── waiting (ServiceWorker)
//!     │       └── active (ServiceWorker)
//!     └── Clients (open pages, each optionally controlled)
//! ```
//!
//! Events reach a worker only through [`ServiceWorkerRuntime::dispatch`],
//! which maps each [`EventKind`] to the matching controller handler.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use hashbrown::HashMap;
use shellcache_net::{Fetcher, Request};
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::controller::{
    ActivateReport, CacheController, FetchResponse, InstallReport, MessageAction,
};
use crate::ServiceWorkerError;

// ==================== Types ====================

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Unique identifier for a client page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

impl ClientId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServiceWorkerState {
    /// Registered, install not started.
    #[default]
    Parsed,
    /// Install handler running.
    Installing,
    /// Installed, waiting for activation.
    Installed,
    /// Activate handler running.
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Replaced by a newer version.
    Redundant,
}

// ==================== Service Worker ====================

/// One controller version known to the runtime.
#[derive(Debug, Clone)]
pub struct ServiceWorker {
    pub id: ServiceWorkerId,
    pub state: ServiceWorkerState,
    pub state_changed_at: Instant,
    controller: Arc<CacheController>,
}

impl ServiceWorker {
    fn new(controller: Arc<CacheController>) -> Self {
        Self {
            id: ServiceWorkerId::new(),
            state: ServiceWorkerState::Parsed,
            state_changed_at: Instant::now(),
            controller,
        }
    }

    fn set_state(&mut self, state: ServiceWorkerState) {
        self.state = state;
        self.state_changed_at = Instant::now();
    }

    /// Bucket owned by this version.
    pub fn cache_name(&self) -> &str {
        self.controller.cache_name()
    }

    pub fn controller(&self) -> &Arc<CacheController> {
        &self.controller
    }
}

// ==================== Registration ====================

/// The installing / waiting / active slots for one scope.
#[derive(Debug)]
pub struct ServiceWorkerRegistration {
    pub scope: Url,
    pub installing: Option<ServiceWorker>,
    pub waiting: Option<ServiceWorker>,
    pub active: Option<ServiceWorker>,
}

impl ServiceWorkerRegistration {
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
        }
    }

    /// Move the installing worker to waiting. A previously waiting worker
    /// becomes redundant and is returned.
    fn install_complete(
        &mut self,
        id: ServiceWorkerId,
    ) -> Result<Option<ServiceWorker>, ServiceWorkerError> {
        if self.installing.as_ref().map(|w| w.id) != Some(id) {
            return Err(ServiceWorkerError::StateError(format!(
                "worker {id:?} was superseded during install"
            )));
        }
        let Some(mut worker) = self.installing.take() else {
            return Ok(None);
        };
        worker.set_state(ServiceWorkerState::Installed);
        Ok(self.waiting.replace(worker).map(|mut replaced| {
            replaced.set_state(ServiceWorkerState::Redundant);
            replaced
        }))
    }

    /// Promote the active worker; the previous active becomes redundant.
    fn promote(&mut self, mut worker: ServiceWorker) -> Option<ServiceWorker> {
        worker.set_state(ServiceWorkerState::Activated);
        let old = self.active.replace(worker);
        old.map(|mut old| {
            old.set_state(ServiceWorkerState::Redundant);
            old
        })
    }

    fn in_scope(&self, url: &Url) -> bool {
        url.as_str().starts_with(self.scope.as_str())
    }
}

// ==================== Clients ====================

/// An open page.
#[derive(Debug, Clone)]
pub struct Client {
    pub id: ClientId,
    pub url: Url,
    /// Worker currently controlling this page.
    pub controller: Option<ServiceWorkerId>,
}

/// Open pages.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<ClientId, Client>,
}

impl Clients {
    pub fn get(&self, id: ClientId) -> Option<&Client> {
        self.clients.get(&id)
    }

    fn add(&mut self, client: Client) {
        self.clients.insert(client.id, client);
    }

    fn remove(&mut self, id: ClientId) -> Option<Client> {
        self.clients.remove(&id)
    }

    /// Number of clients controlled by `worker`.
    pub fn controlled_by(&self, worker: ServiceWorkerId) -> usize {
        self.clients
            .values()
            .filter(|c| c.controller == Some(worker))
            .count()
    }

    /// Make `worker` the controller of every client; returns the clients
    /// whose controller changed.
    fn claim(&mut self, worker: ServiceWorkerId) -> Vec<ClientId> {
        self.clients
            .values_mut()
            .filter(|c| c.controller != Some(worker))
            .map(|c| {
                c.controller = Some(worker);
                c.id
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

// ==================== Events ====================

/// Kinds of events a worker handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Install,
    Activate,
    Fetch,
    Message,
}

/// An event delivered to a worker.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Install,
    Activate,
    Fetch(Request),
    Message(serde_json::Value),
}

impl WorkerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            WorkerEvent::Install => EventKind::Install,
            WorkerEvent::Activate => EventKind::Activate,
            WorkerEvent::Fetch(_) => EventKind::Fetch,
            WorkerEvent::Message(_) => EventKind::Message,
        }
    }
}

/// Completion signal of a dispatched event.
#[derive(Debug)]
pub enum EventOutcome {
    Installed(InstallReport),
    Activated(ActivateReport),
    Fetched(Result<Option<FetchResponse>, ServiceWorkerError>),
    Message(MessageAction),
}

/// Notifications published by the runtime.
#[derive(Debug, Clone)]
pub enum RuntimeNotification {
    /// A new version started installing.
    UpdateFound { scope: Url },
    /// A worker changed state.
    StateChange {
        worker_id: ServiceWorkerId,
        new_state: ServiceWorkerState,
    },
    /// A client's controller changed.
    ControllerChange {
        client_id: ClientId,
        worker_id: ServiceWorkerId,
    },
}

/// Commands accepted by [`ServiceWorkerRuntime::run`].
#[derive(Debug)]
pub enum RuntimeCommand {
    Register {
        controller: Arc<CacheController>,
        reply: oneshot::Sender<ServiceWorkerId>,
    },
    Fetch {
        client: Option<ClientId>,
        request: Request,
        reply: oneshot::Sender<Result<Option<FetchResponse>, ServiceWorkerError>>,
    },
    Message {
        data: serde_json::Value,
        reply: oneshot::Sender<MessageAction>,
    },
    SkipWaiting,
}

// ==================== Runtime ====================

/// Hosts controller versions for one scope.
pub struct ServiceWorkerRuntime {
    registration: RwLock<ServiceWorkerRegistration>,
    clients: RwLock<Clients>,
    network: Arc<dyn Fetcher>,
    event_tx: mpsc::UnboundedSender<RuntimeNotification>,
}

impl ServiceWorkerRuntime {
    /// Create a runtime. `network` serves requests from uncontrolled pages.
    pub fn new(
        scope: Url,
        network: Arc<dyn Fetcher>,
    ) -> (Self, mpsc::UnboundedReceiver<RuntimeNotification>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                registration: RwLock::new(ServiceWorkerRegistration::new(scope)),
                clients: RwLock::new(Clients::default()),
                network,
                event_tx,
            },
            event_rx,
        )
    }

    fn notify(&self, notification: RuntimeNotification) {
        let _ = self.event_tx.send(notification);
    }

    fn state_change(&self, worker_id: ServiceWorkerId, new_state: ServiceWorkerState) {
        debug!(?worker_id, ?new_state, "Worker state changed");
        self.notify(RuntimeNotification::StateChange {
            worker_id,
            new_state,
        });
    }

    /// Route an event to the handler for its kind.
    pub async fn dispatch(&self, worker: &ServiceWorker, event: WorkerEvent) -> EventOutcome {
        let controller = worker.controller();
        match event {
            WorkerEvent::Install => EventOutcome::Installed(controller.install().await),
            WorkerEvent::Activate => EventOutcome::Activated(controller.activate().await),
            WorkerEvent::Fetch(request) => {
                EventOutcome::Fetched(controller.handle_fetch(&request).await)
            }
            WorkerEvent::Message(data) => EventOutcome::Message(controller.handle_message(&data)),
        }
    }

    /// Install a new controller version.
    ///
    /// The version activates straight away when its install requests skip
    /// waiting or when no older version controls any page; otherwise it
    /// stays waiting.
    pub async fn register(
        &self,
        controller: Arc<CacheController>,
    ) -> Result<ServiceWorkerId, ServiceWorkerError> {
        let mut worker = ServiceWorker::new(controller);
        worker.set_state(ServiceWorkerState::Installing);
        let id = worker.id;

        {
            let mut registration = self.registration.write().await;
            if let Some(mut previous) = registration.installing.replace(worker.clone()) {
                previous.set_state(ServiceWorkerState::Redundant);
                self.state_change(previous.id, ServiceWorkerState::Redundant);
            }
            self.notify(RuntimeNotification::UpdateFound {
                scope: registration.scope.clone(),
            });
        }
        self.state_change(id, ServiceWorkerState::Installing);
        info!(cache = %worker.cache_name(), "Installing service worker");

        let report = match self.dispatch(&worker, WorkerEvent::Install).await {
            EventOutcome::Installed(report) => report,
            other => {
                return Err(ServiceWorkerError::StateError(format!(
                    "install produced {other:?}"
                )))
            }
        };

        let old_active = {
            let mut registration = self.registration.write().await;
            if let Some(replaced) = registration.install_complete(id)? {
                self.state_change(replaced.id, ServiceWorkerState::Redundant);
            }
            registration.active.as_ref().map(|w| w.id)
        };
        self.state_change(id, ServiceWorkerState::Installed);

        let old_in_use = match old_active {
            Some(old) => self.clients.read().await.controlled_by(old) > 0,
            None => false,
        };

        if report.skip_waiting || !old_in_use {
            self.activate_waiting().await?;
        } else {
            info!(?id, "Installed worker waiting for open pages to close");
        }

        Ok(id)
    }

    /// Activate the waiting worker, if any.
    pub async fn skip_waiting(&self) -> Result<Option<ActivateReport>, ServiceWorkerError> {
        self.activate_waiting().await
    }

    async fn activate_waiting(&self) -> Result<Option<ActivateReport>, ServiceWorkerError> {
        let worker = {
            let mut registration = self.registration.write().await;
            match registration.waiting.take() {
                Some(mut worker) => {
                    worker.set_state(ServiceWorkerState::Activating);
                    worker
                }
                None => return Ok(None),
            }
        };
        self.state_change(worker.id, ServiceWorkerState::Activating);

        // Let the outgoing version finish its cache writes before the
        // stale buckets are enumerated.
        let outgoing = self
            .registration
            .read()
            .await
            .active
            .as_ref()
            .map(|w| Arc::clone(w.controller()));
        if let Some(outgoing) = &outgoing {
            outgoing.wait_for_background_writes().await;
        }

        let report = match self.dispatch(&worker, WorkerEvent::Activate).await {
            EventOutcome::Activated(report) => report,
            other => {
                return Err(ServiceWorkerError::StateError(format!(
                    "activate produced {other:?}"
                )))
            }
        };

        let id = worker.id;
        let retired = self.registration.write().await.promote(worker);
        if let Some(old) = retired {
            self.state_change(old.id, ServiceWorkerState::Redundant);
            old.controller().wait_for_background_writes().await;
        }
        self.state_change(id, ServiceWorkerState::Activated);
        info!(cache = %report.kept, deleted = report.deleted.len(), "Service worker activated");

        if report.claim_clients {
            let changed = self.clients.write().await.claim(id);
            for client_id in changed {
                self.notify(RuntimeNotification::ControllerChange {
                    client_id,
                    worker_id: id,
                });
            }
        }

        Ok(Some(report))
    }

    /// Open a page. A page inside the scope is controlled by the active
    /// worker from the start.
    pub async fn open_client(&self, url: Url) -> ClientId {
        let controller = {
            let registration = self.registration.read().await;
            if registration.in_scope(&url) {
                registration.active.as_ref().map(|w| w.id)
            } else {
                None
            }
        };
        let client = Client {
            id: ClientId::new(),
            url,
            controller,
        };
        let id = client.id;
        self.clients.write().await.add(client);
        id
    }

    /// Close a page. Closing the last page held by the old version lets a
    /// waiting worker activate.
    pub async fn close_client(&self, id: ClientId) -> Result<(), ServiceWorkerError> {
        let removed = self.clients.write().await.remove(id);
        if removed.is_none() {
            return Err(ServiceWorkerError::NotFound(format!("client {id:?}")));
        }

        let (has_waiting, active) = {
            let registration = self.registration.read().await;
            (
                registration.waiting.is_some(),
                registration.active.as_ref().map(|w| w.id),
            )
        };
        if has_waiting {
            let in_use = match active {
                Some(active) => self.clients.read().await.controlled_by(active) > 0,
                None => false,
            };
            if !in_use {
                self.activate_waiting().await?;
            }
        }
        Ok(())
    }

    /// Handle a request from a page.
    ///
    /// Navigations inside the scope and sub-resource requests from a
    /// controlled page go to the active worker; everything else goes
    /// straight to the network.
    pub async fn fetch(
        &self,
        client: Option<ClientId>,
        request: Request,
    ) -> Result<Option<FetchResponse>, ServiceWorkerError> {
        let worker = self.worker_for(client, &request).await;

        match worker {
            Some(worker) => match self.dispatch(&worker, WorkerEvent::Fetch(request)).await {
                EventOutcome::Fetched(result) => result,
                other => Err(ServiceWorkerError::StateError(format!(
                    "fetch produced {other:?}"
                ))),
            },
            None => {
                debug!(url = %request.url, "Uncontrolled request, using network");
                let response = self.network.fetch(&request).await?;
                Ok(Some(FetchResponse::from_network(response)))
            }
        }
    }

    async fn worker_for(&self, client: Option<ClientId>, request: &Request) -> Option<ServiceWorker> {
        let registration = self.registration.read().await;
        let active = registration.active.as_ref()?;

        if request.is_navigation() {
            return registration.in_scope(&request.url).then(|| active.clone());
        }

        let client = client?;
        let controlled = self
            .clients
            .read()
            .await
            .get(client)
            .and_then(|c| c.controller)
            == Some(active.id);
        controlled.then(|| active.clone())
    }

    /// Post a message from a page to the newest worker (waiting, else
    /// active). A skip-waiting message activates the waiting worker.
    pub async fn post_message(
        &self,
        data: serde_json::Value,
    ) -> Result<MessageAction, ServiceWorkerError> {
        let target = {
            let registration = self.registration.read().await;
            registration
                .waiting
                .clone()
                .or_else(|| registration.active.clone())
        };
        let Some(worker) = target else {
            return Err(ServiceWorkerError::NotFound("no worker to message".into()));
        };

        let action = match self.dispatch(&worker, WorkerEvent::Message(data)).await {
            EventOutcome::Message(action) => action,
            other => {
                return Err(ServiceWorkerError::StateError(format!(
                    "message produced {other:?}"
                )))
            }
        };

        if action == MessageAction::SkipWaiting {
            self.skip_waiting().await?;
        }
        Ok(action)
    }

    /// Current state of a worker.
    pub async fn state_of(&self, id: ServiceWorkerId) -> Option<ServiceWorkerState> {
        let registration = self.registration.read().await;
        let state = [
            &registration.installing,
            &registration.waiting,
            &registration.active,
        ]
        .into_iter()
        .flatten()
        .find(|w| w.id == id)
        .map(|w| w.state);
        state
    }

    /// The active worker's id.
    pub async fn active(&self) -> Option<ServiceWorkerId> {
        self.registration.read().await.active.as_ref().map(|w| w.id)
    }

    /// The waiting worker's id.
    pub async fn waiting(&self) -> Option<ServiceWorkerId> {
        self.registration.read().await.waiting.as_ref().map(|w| w.id)
    }

    /// The worker controlling a client.
    pub async fn controller_of(&self, client: ClientId) -> Option<ServiceWorkerId> {
        self.clients.read().await.get(client).and_then(|c| c.controller)
    }

    /// Process commands one at a time until the sender side closes.
    ///
    /// Fetches run on their own task so a slow network call never holds
    /// up the queue.
    pub async fn run(self: Arc<Self>, mut commands: mpsc::UnboundedReceiver<RuntimeCommand>) {
        while let Some(command) = commands.recv().await {
            match command {
                RuntimeCommand::Register { controller, reply } => match self.register(controller).await {
                    Ok(id) => {
                        let _ = reply.send(id);
                    }
                    Err(e) => warn!(error = %e, "Registration failed"),
                },
                RuntimeCommand::Fetch {
                    client,
                    request,
                    reply,
                } => {
                    let runtime = Arc::clone(&self);
                    tokio::spawn(async move {
                        let _ = reply.send(runtime.fetch(client, request).await);
                    });
                }
                RuntimeCommand::Message { data, reply } => match self.post_message(data).await {
                    Ok(action) => {
                        let _ = reply.send(action);
                    }
                    Err(e) => warn!(error = %e, "Message delivery failed"),
                },
                RuntimeCommand::SkipWaiting => {
                    if let Err(e) = self.skip_waiting().await {
                        warn!(error = %e, "Skip waiting failed");
                    }
                }
            }
        }
        debug!("Runtime command queue closed");
    }
}
