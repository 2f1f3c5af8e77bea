// In-process lock cluster: one server, any number of clients, with links
// that can be cut to simulate unresponsive or restarted peers.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use strata_dlm::client::{LockClient, LockObserver};
use strata_dlm::config::DlmConfig;
use strata_dlm::export::{ConnectFlags, Export};
use strata_dlm::rpc::{DlmRequest, RpcError, RpcResult, Transport};
use strata_dlm::server::LockServer;
use strata_dlm::types::LockHandle;
use tokio::sync::oneshot;

/// Client-to-server link. Requests go straight into
/// [`LockServer::handle_request`] on the link's export.
pub struct ServerLink {
    server: Mutex<Weak<LockServer>>,
    export: Mutex<Option<Arc<Export>>>,
    partitioned: AtomicBool,
    generation: AtomicU64,
    recoveries: AtomicU64,
    cancels: Mutex<Vec<Vec<LockHandle>>>,
}

impl ServerLink {
    fn new(server: &Arc<LockServer>, export: Arc<Export>) -> Self {
        Self {
            server: Mutex::new(Arc::downgrade(server)),
            export: Mutex::new(Some(export)),
            partitioned: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            recoveries: AtomicU64::new(0),
            cancels: Mutex::new(Vec::new()),
        }
    }

    /// Point the link at a (possibly new) server through a new export.
    pub fn reconnect(&self, server: &Arc<LockServer>, export: Arc<Export>) {
        *self.server.lock() = Arc::downgrade(server);
        *self.export.lock() = Some(export);
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn export(&self) -> Option<Arc<Export>> {
        self.export.lock().clone()
    }

    pub fn recoveries(&self) -> u64 {
        self.recoveries.load(Ordering::SeqCst)
    }

    /// Handles of every cancel request sent, one entry per request.
    pub fn cancels(&self) -> Vec<Vec<LockHandle>> {
        self.cancels.lock().clone()
    }

    fn route(&self, request: &DlmRequest) -> Option<(Arc<LockServer>, Arc<Export>)> {
        if self.partitioned.load(Ordering::SeqCst) {
            return None;
        }
        if let DlmRequest::Cancel(cancel) = request {
            self.cancels.lock().push(cancel.handles.clone());
        }
        let server = self.server.lock().upgrade()?;
        let export = self.export.lock().clone()?;
        Some((server, export))
    }
}

async fn deliver(
    target: Option<(Arc<LockServer>, Arc<Export>)>,
    request: DlmRequest,
    timeout: Duration,
) -> RpcResult {
    let Some((server, export)) = target else {
        return Err(RpcError::NotConnected);
    };
    match tokio::time::timeout(timeout, server.handle_request(&export, request)).await {
        Ok(result) => result,
        Err(_) => Err(RpcError::Timeout),
    }
}

#[async_trait]
impl Transport for ServerLink {
    async fn send_and_wait(&self, request: DlmRequest, timeout: Duration) -> RpcResult {
        let target = self.route(&request);
        deliver(target, request, timeout).await
    }

    fn send_async(&self, request: DlmRequest, timeout: Duration) -> oneshot::Receiver<RpcResult> {
        let (tx, rx) = oneshot::channel();
        let target = self.route(&request);
        tokio::spawn(async move {
            let _ = tx.send(deliver(target, request, timeout).await);
        });
        rx
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn is_valid(&self) -> bool {
        !self.partitioned.load(Ordering::SeqCst)
    }

    fn start_recovery(&self) {
        self.recoveries.fetch_add(1, Ordering::SeqCst);
    }
}

/// Server-to-client link carrying callbacks into
/// [`LockClient::handle_callback`].
#[derive(Default)]
pub struct CallbackLink {
    client: Mutex<Weak<LockClient>>,
    partitioned: AtomicBool,
    disconnected: AtomicBool,
    received: Mutex<HashMap<&'static str, usize>>,
}

impl CallbackLink {
    fn attach(&self, client: &Arc<LockClient>) {
        *self.client.lock() = Arc::downgrade(client);
    }

    /// Callbacks of kind `name` ("blocking", "completion", "glimpse")
    /// delivered so far.
    pub fn received(&self, name: &str) -> usize {
        self.received.lock().get(name).copied().unwrap_or(0)
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    fn target(&self, request: &DlmRequest) -> std::result::Result<Arc<LockClient>, RpcError> {
        if self.partitioned.load(Ordering::SeqCst) {
            return Err(RpcError::Timeout);
        }
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(RpcError::NotConnected);
        }
        let client = self.client.lock().upgrade().ok_or(RpcError::NotConnected)?;
        *self.received.lock().entry(request.name()).or_default() += 1;
        Ok(client)
    }
}

#[async_trait]
impl Transport for CallbackLink {
    async fn send_and_wait(&self, request: DlmRequest, _timeout: Duration) -> RpcResult {
        let client = self.target(&request)?;
        client.handle_callback(request).await
    }

    fn send_async(&self, request: DlmRequest, _timeout: Duration) -> oneshot::Receiver<RpcResult> {
        let (tx, rx) = oneshot::channel();
        let target = self.target(&request);
        tokio::spawn(async move {
            let result = match target {
                Ok(client) => client.handle_callback(request).await,
                Err(e) => Err(e),
            };
            let _ = tx.send(result);
        });
        rx
    }

    fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }
}

/// One connected client and both of its links.
pub struct SimulatedClient {
    pub client: Arc<LockClient>,
    pub link: Arc<ServerLink>,
    pub callbacks: Arc<CallbackLink>,
}

impl SimulatedClient {
    pub fn export(&self) -> Arc<Export> {
        self.link.export().expect("client has no export")
    }

    /// Stop answering callbacks and sending requests.
    pub fn partition(&self) {
        self.callbacks.partitioned.store(true, Ordering::SeqCst);
        self.link.partitioned.store(true, Ordering::SeqCst);
    }

    pub fn heal(&self) {
        self.callbacks.partitioned.store(false, Ordering::SeqCst);
        self.link.partitioned.store(false, Ordering::SeqCst);
    }
}

/// A lock server and its clients, all in one process.
pub struct SimulatedCluster {
    pub server: Arc<LockServer>,
    config: DlmConfig,
}

impl SimulatedCluster {
    pub fn new(config: DlmConfig) -> Self {
        Self {
            server: LockServer::start("sim-server", config.clone()),
            config,
        }
    }

    /// Connect a client with default connect flags.
    pub fn connect(&self, name: &str) -> SimulatedClient {
        self.connect_with(name, self.config.clone(), ConnectFlags::default())
    }

    pub fn connect_with(&self, name: &str, config: DlmConfig, flags: ConnectFlags) -> SimulatedClient {
        self.attach(name, config, flags, None)
    }

    /// Connect a client whose locks report to `observer`.
    pub fn connect_observed(&self, name: &str, observer: Arc<dyn LockObserver>) -> SimulatedClient {
        self.attach(name, self.config.clone(), ConnectFlags::default(), Some(observer))
    }

    fn attach(
        &self,
        name: &str,
        config: DlmConfig,
        flags: ConnectFlags,
        observer: Option<Arc<dyn LockObserver>>,
    ) -> SimulatedClient {
        let callbacks = Arc::new(CallbackLink::default());
        let export = self.server.connect(name, callbacks.clone(), false, flags);
        let link = Arc::new(ServerLink::new(&self.server, export));
        let mut builder = LockClient::builder(name, config, link.clone()).connect_flags(flags);
        if let Some(observer) = observer {
            builder = builder.observer(observer);
        }
        let client = builder.start();
        callbacks.attach(&client);
        SimulatedClient {
            client,
            link,
            callbacks,
        }
    }

    /// Replace the server with a fresh one, as after a server restart, and
    /// reconnect `clients` to it. The caller replays their locks.
    pub async fn restart_server(&mut self, clients: &[&SimulatedClient]) {
        let _ = self.server.shutdown(true).await;
        self.server = LockServer::start("sim-server", self.config.clone());
        for sim in clients {
            let flags = sim.client.connect_flags();
            let export = self.server.connect(
                sim.client.namespace().name(),
                sim.callbacks.clone(),
                false,
                flags,
            );
            sim.link.reconnect(&self.server, export);
        }
    }
}
