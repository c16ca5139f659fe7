//! Module client pool.
//!
//! # Responsibilities
//! - Keep one client per registered module
//! - Probe module reachability over TCP with a connect timeout
//! - Fail fast when a module's channel is not ready
//! - Reconnect dropped clients from one supervised health loop
//!
//! # Design Decisions
//! - Each client backs off exponentially between reconnects
//! - Liveness of a ready channel is a non-blocking read probe
//! - The pool map is a `DashMap`; no lock is held across an await

use std::fmt;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};

use crate::inspector::Protocol;
use crate::lifecycle::supervisor::{BackgroundTask, StopOutcome};
use crate::resilience::backoff::Backoff;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("invalid target for module {name}: {reason}")]
    InvalidTarget { name: String, reason: String },

    #[error("client {0} already exists")]
    AlreadyExists(String),

    #[error("client {0} not found")]
    NotFound(String),

    #[error("connection to {name} not ready: {state:?}")]
    NotReady { name: String, state: ClientState },

    #[error("failed to connect to module {name} at {target}: {reason}")]
    ConnectFailed {
        name: String,
        target: String,
        reason: String,
    },
}

/// Channel state of one module client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

/// Dial and retry parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientSettings {
    pub connect_timeout: Duration,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub health_check_interval: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            reconnect_base_delay: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug)]
struct Channel {
    state: ClientState,
    stream: Option<TcpStream>,
    backoff: Backoff,
    next_retry: Option<Instant>,
    last_used: Option<Instant>,
}

/// Client for one registered module.
pub struct ModuleClient {
    name: String,
    protocol: Protocol,
    target: String,
    connect_timeout: Duration,
    channel: Mutex<Channel>,
}

impl fmt::Debug for ModuleClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleClient")
            .field("name", &self.name)
            .field("target", &self.target)
            .field("state", &self.state())
            .finish()
    }
}

impl ModuleClient {
    pub fn new(
        name: &str,
        protocol: Protocol,
        address: &str,
        port: u16,
        settings: &ClientSettings,
    ) -> Result<Self, ClientError> {
        let invalid = |reason: &str| ClientError::InvalidTarget {
            name: name.to_string(),
            reason: reason.to_string(),
        };
        if address.trim().is_empty() {
            return Err(invalid("empty address"));
        }
        if port == 0 {
            return Err(invalid("port must be non-zero"));
        }

        Ok(Self {
            name: name.to_string(),
            protocol,
            target: format!("{address}:{port}"),
            connect_timeout: settings.connect_timeout,
            channel: Mutex::new(Channel {
                state: ClientState::Idle,
                stream: None,
                backoff: Backoff::new(settings.reconnect_base_delay, settings.reconnect_max_delay),
                next_retry: None,
                last_used: None,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn state(&self) -> ClientState {
        self.channel.lock().expect("client channel lock poisoned").state
    }

    pub fn is_healthy(&self) -> bool {
        self.state() == ClientState::Ready
    }

    /// Dial the module unless already ready or a dial is in flight.
    pub async fn connect(&self) -> Result<(), ClientError> {
        {
            let mut channel = self.channel.lock().expect("client channel lock poisoned");
            match channel.state {
                ClientState::Ready | ClientState::Connecting => return Ok(()),
                _ => channel.state = ClientState::Connecting,
            }
        }

        let result = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.target)).await;

        let mut channel = self.channel.lock().expect("client channel lock poisoned");
        // Closed while dialing.
        if channel.state == ClientState::Shutdown {
            return Ok(());
        }

        let reason = match result {
            Ok(Ok(stream)) => {
                channel.stream = Some(stream);
                channel.state = ClientState::Ready;
                channel.backoff.reset();
                channel.next_retry = None;
                channel.last_used = Some(Instant::now());
                drop(channel);
                tracing::info!(module = %self.name, target = %self.target, "Connected to module");
                return Ok(());
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {:?}", self.connect_timeout),
        };

        channel.stream = None;
        channel.state = ClientState::TransientFailure;
        let delay = channel.backoff.next_delay();
        channel.next_retry = Some(Instant::now() + delay);
        let attempts = channel.backoff.attempts();
        drop(channel);

        tracing::warn!(
            module = %self.name,
            target = %self.target,
            error = %reason,
            attempts,
            retry_in = ?delay,
            "Failed to connect to module"
        );
        Err(ClientError::ConnectFailed {
            name: self.name.clone(),
            target: self.target.clone(),
            reason,
        })
    }

    /// Peer address of a ready channel. Fails fast otherwise.
    pub fn get_connection(&self) -> Result<SocketAddr, ClientError> {
        let mut channel = self.channel.lock().expect("client channel lock poisoned");
        let not_ready = |state| ClientError::NotReady {
            name: self.name.clone(),
            state,
        };
        if channel.state != ClientState::Ready {
            return Err(not_ready(channel.state));
        }
        let peer = channel
            .stream
            .as_ref()
            .and_then(|s| s.peer_addr().ok())
            .ok_or_else(|| not_ready(ClientState::TransientFailure))?;
        channel.last_used = Some(Instant::now());
        Ok(peer)
    }

    /// Non-blocking liveness probe of a ready channel.
    ///
    /// Marks the client as failed when the module closed its end.
    pub fn check_liveness(&self) -> ClientState {
        let mut channel = self.channel.lock().expect("client channel lock poisoned");
        if channel.state != ClientState::Ready {
            return channel.state;
        }

        let mut probe = [0u8; 1];
        let alive = match channel.stream.as_ref().map(|s| s.try_read(&mut probe)) {
            Some(Ok(0)) | None => false,
            Some(Ok(_)) => true,
            Some(Err(e)) if e.kind() == ErrorKind::WouldBlock => true,
            Some(Err(_)) => false,
        };

        if !alive {
            channel.stream = None;
            channel.state = ClientState::TransientFailure;
            channel.next_retry = Some(Instant::now());
            tracing::warn!(module = %self.name, target = %self.target, "Module connection lost");
        }
        channel.state
    }

    fn due_for_retry(&self, now: Instant) -> bool {
        let channel = self.channel.lock().expect("client channel lock poisoned");
        match channel.state {
            ClientState::Idle => true,
            ClientState::TransientFailure => channel.next_retry.map_or(true, |at| now >= at),
            _ => false,
        }
    }

    pub fn close(&self) {
        let mut channel = self.channel.lock().expect("client channel lock poisoned");
        channel.stream = None;
        channel.state = ClientState::Shutdown;
        drop(channel);
        tracing::info!(module = %self.name, "Module client closed");
    }

    pub fn status(&self) -> ClientStatus {
        let channel = self.channel.lock().expect("client channel lock poisoned");
        ClientStatus {
            name: self.name.clone(),
            protocol: self.protocol,
            target: self.target.clone(),
            state: channel.state,
            failed_attempts: channel.backoff.attempts(),
            idle_secs: channel.last_used.map(|t| t.elapsed().as_secs()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientStatus {
    pub name: String,
    pub protocol: Protocol,
    pub target: String,
    pub state: ClientState,
    pub failed_attempts: u32,
    pub idle_secs: Option<u64>,
}

type ClientKey = (Protocol, String);

/// Clients for every registered module.
pub struct ClientPool {
    clients: DashMap<ClientKey, Arc<ModuleClient>>,
    settings: ClientSettings,
    task: Mutex<Option<BackgroundTask>>,
}

impl fmt::Debug for ClientPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientPool")
            .field("clients", &self.clients.len())
            .field("settings", &self.settings)
            .finish()
    }
}

impl ClientPool {
    pub fn new(settings: ClientSettings) -> Self {
        Self {
            clients: DashMap::new(),
            settings,
            task: Mutex::new(None),
        }
    }

    /// Add a client and try one initial connect.
    ///
    /// A failed initial connect is not an error; the health loop retries.
    pub async fn add_client(
        &self,
        name: &str,
        protocol: Protocol,
        address: &str,
        port: u16,
    ) -> Result<Arc<ModuleClient>, ClientError> {
        let client = Arc::new(ModuleClient::new(name, protocol, address, port, &self.settings)?);

        match self.clients.entry((protocol, name.to_string())) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(ClientError::AlreadyExists(name.to_string()));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(client.clone());
            }
        }
        tracing::info!(module = %name, protocol = %protocol, target = %client.target(), "Client added to pool");

        if client.connect().await.is_err() {
            tracing::warn!(module = %name, "Initial connection failed, will retry");
        }
        Ok(client)
    }

    pub fn remove_client(&self, protocol: Protocol, name: &str) -> Result<(), ClientError> {
        let (_, client) = self
            .clients
            .remove(&(protocol, name.to_string()))
            .ok_or_else(|| ClientError::NotFound(name.to_string()))?;
        client.close();
        tracing::info!(module = %name, protocol = %protocol, "Client removed from pool");
        Ok(())
    }

    pub fn get_client(&self, protocol: Protocol, name: &str) -> Result<Arc<ModuleClient>, ClientError> {
        self.clients
            .get(&(protocol, name.to_string()))
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ClientError::NotFound(name.to_string()))
    }

    pub fn get_connection(&self, protocol: Protocol, name: &str) -> Result<SocketAddr, ClientError> {
        self.get_client(protocol, name)?.get_connection()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Status of every client, sorted by protocol then name.
    pub fn statuses(&self) -> Vec<ClientStatus> {
        let mut out: Vec<ClientStatus> = self.snapshot().iter().map(|c| c.status()).collect();
        out.sort_by(|a, b| (a.protocol, &a.name).cmp(&(b.protocol, &b.name)));
        out
    }

    fn snapshot(&self) -> Vec<Arc<ModuleClient>> {
        self.clients.iter().map(|entry| entry.value().clone()).collect()
    }

    /// One health pass: probe ready clients, redial the ones that are due.
    ///
    /// Returns how many clients were redialed.
    pub async fn health_check_once(&self) -> usize {
        let now = Instant::now();
        let mut dials = JoinSet::new();

        for client in self.snapshot() {
            client.check_liveness();
            if client.due_for_retry(now) {
                dials.spawn(async move {
                    let _ = client.connect().await;
                });
            }
        }

        let redialed = dials.len();
        while dials.join_next().await.is_some() {}
        if redialed > 0 {
            tracing::debug!(redialed, "Client pool health check completed");
        }
        redialed
    }

    pub fn start(self: &Arc<Self>) {
        let mut slot = self.task.lock().expect("client pool task lock poisoned");
        if slot.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let pool = Arc::clone(self);
        *slot = Some(BackgroundTask::spawn("client-pool-health", move |shutdown| {
            pool.health_loop(shutdown)
        }));
    }

    async fn health_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let every = self.settings.health_check_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.health_check_once().await;
                }
                _ = shutdown.recv() => break,
            }
        }
    }

    pub(crate) fn take_task(&self) -> Option<BackgroundTask> {
        self.task.lock().expect("client pool task lock poisoned").take()
    }

    /// Stop the health loop and close every client.
    pub async fn stop(&self, timeout: Duration) -> Option<StopOutcome> {
        let outcome = match self.take_task() {
            Some(task) => Some(task.stop(timeout).await),
            None => None,
        };
        self.close_all();
        outcome
    }

    pub fn close_all(&self) {
        for client in self.snapshot() {
            client.close();
        }
        self.clients.clear();
    }
}
