//! Registry client
//!
//! Session lifecycle against a coordination service, ephemeral self-registration,
//! membership and data watches, and versioned node data.
//!
//! State machine:
//!
//! ```text
//! Disconnected --get_connect ok--> Connected
//! Connected --session expired--> Expired --backoff + get_connect--> Connected | Disconnected
//! any --close--> Disconnected
//! ```

pub mod backend;
pub mod memory;
mod watch;
#[cfg(feature = "zookeeper")]
pub mod zookeeper;

pub use backend::{Connector, CreateMode, Session, SessionEvent, Stat, WatchEvent, Watcher};
pub use memory::MemoryRegistry;
pub use watch::WatchChannels;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::RegistryConfig;
use backend::parent_path;
use watch::{spawn_watch, WatchSettings};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Failed to connect to registry: {0}")]
    Connection(String),

    #[error("No registry connection")]
    NotConnected,

    #[error("Registry session expired")]
    SessionExpired,

    #[error("Node does not exist: {0}")]
    NoNode(String),

    #[error("Node already exists: {0}")]
    NodeExists(String),

    #[error("Version mismatch updating {0}")]
    BadVersion(String),

    #[error("Watch on {path} terminated: {reason}")]
    WatchTerminated { path: String, reason: String },

    #[error("Registry operation failed: {0}")]
    Operation(String),
}

/// Coordination service implementation
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RegistryBackend {
    /// In-process registry, shared by every client built from the same process
    #[default]
    Memory,
    /// ZooKeeper ensemble (requires the `zookeeper` cargo feature)
    Zookeeper,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Expired,
}

/// Timing and buffering knobs for a [`RegistryClient`]
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub session_timeout: Duration,
    pub connect_timeout: Duration,
    /// Delay before the automatic reconnect that follows session expiry
    pub reconnect_backoff: Duration,
    /// Bound on each snapshot send in a watch loop
    pub send_timeout: Duration,
    /// Bound on each wait for a watch event; the watch is re-armed when it elapses
    pub watch_timeout: Duration,
    pub channel_capacity: usize,
    pub verbose: bool,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            reconnect_backoff: Duration::from_secs(1),
            send_timeout: Duration::from_secs(5),
            watch_timeout: Duration::from_secs(30),
            channel_capacity: 10,
            verbose: false,
        }
    }
}

impl From<&RegistryConfig> for RegistrySettings {
    fn from(config: &RegistryConfig) -> Self {
        Self {
            session_timeout: Duration::from_secs(config.session_timeout_seconds),
            connect_timeout: Duration::from_secs(config.connect_timeout_seconds),
            reconnect_backoff: Duration::from_millis(config.reconnect_backoff_ms),
            send_timeout: Duration::from_millis(config.send_timeout_ms),
            watch_timeout: Duration::from_secs(config.watch_timeout_seconds),
            channel_capacity: config.channel_capacity,
            verbose: config.verbose,
        }
    }
}

/// `<prefix>/<group>`, the durable node that holds a service group's members
pub fn group_path(prefix: &str, group: &str) -> String {
    format!("{}/{}", prefix.trim_end_matches('/'), group.trim_matches('/'))
}

/// `<group_path>/<host>`, one ephemeral member node
pub fn member_path(group_path: &str, host: &str) -> String {
    format!("{}/{}", group_path.trim_end_matches('/'), host)
}

struct Connection {
    state: SessionState,
    session: Option<Arc<dyn Session>>,
    /// Bumped on every new session and on close, so stale monitors stand down
    generation: u64,
}

struct Shared {
    hosts: Vec<String>,
    connector: Arc<dyn Connector>,
    settings: RegistrySettings,
    connection: RwLock<Connection>,
    connect_lock: tokio::sync::Mutex<()>,
    /// (group path, host) pairs to restore on every new session
    registrations: Mutex<Vec<(String, String)>>,
    /// Set by `close`, cleared by the next explicit `get_connect`
    closed: AtomicBool,
}

/// Handle to one registry session. Clones share the session and its watch loops.
#[derive(Clone)]
pub struct RegistryClient {
    shared: Arc<Shared>,
}

impl RegistryClient {
    /// Create a disconnected client; call [`get_connect`](Self::get_connect) before use
    pub fn new(hosts: Vec<String>, connector: Arc<dyn Connector>, settings: RegistrySettings) -> Self {
        Self {
            shared: Arc::new(Shared {
                hosts,
                connector,
                settings,
                connection: RwLock::new(Connection {
                    state: SessionState::Disconnected,
                    session: None,
                    generation: 0,
                }),
                connect_lock: tokio::sync::Mutex::new(()),
                registrations: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn hosts(&self) -> &[String] {
        &self.shared.hosts
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.shared.settings
    }

    pub fn state(&self) -> SessionState {
        self.shared.connection.read().state
    }

    pub fn is_connected(&self) -> bool {
        let connection = self.shared.connection.read();
        connection.state == SessionState::Connected
            && connection.session.as_ref().is_some_and(|s| s.is_connected())
    }

    /// Establish a session, or reuse the current one if it is still live.
    ///
    /// A new session re-creates the ephemeral members registered through this client.
    pub async fn get_connect(&self) -> Result<(), RegistryError> {
        self.shared.closed.store(false, Ordering::SeqCst);
        self.connect_session().await
    }

    async fn connect_session(&self) -> Result<(), RegistryError> {
        let _connecting = self.shared.connect_lock.lock().await;

        let (stale, started) = {
            let mut connection = self.shared.connection.write();
            let live = connection.session.as_ref().is_some_and(|s| s.is_connected());
            if live {
                connection.state = SessionState::Connected;
                return Ok(());
            }
            connection.state = SessionState::Connecting;
            (connection.session.take(), connection.generation)
        };
        if let Some(stale) = stale {
            stale.close().await;
        }

        let settings = &self.shared.settings;
        let connect = self
            .shared
            .connector
            .connect(&self.shared.hosts, settings.session_timeout);
        let session = match tokio::time::timeout(settings.connect_timeout, connect).await {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                self.shared.connection.write().state = SessionState::Disconnected;
                return Err(e);
            }
            Err(_) => {
                self.shared.connection.write().state = SessionState::Disconnected;
                return Err(RegistryError::Connection(format!(
                    "timed out after {:?} connecting to [{}]",
                    settings.connect_timeout,
                    self.shared.hosts.join(",")
                )));
            }
        };

        let events = session.events();
        let installed = {
            let mut connection = self.shared.connection.write();
            // `close` bumps the generation; a session opened across it is discarded
            if connection.generation != started || self.shared.closed.load(Ordering::SeqCst) {
                connection.state = SessionState::Disconnected;
                None
            } else {
                connection.generation += 1;
                connection.session = Some(session.clone());
                connection.state = SessionState::Connected;
                Some(connection.generation)
            }
        };
        let Some(generation) = installed else {
            tracing::debug!(hosts = ?self.shared.hosts, "Client closed while connecting, dropping session");
            session.close().await;
            return Err(RegistryError::NotConnected);
        };
        self.spawn_monitor(events, generation);

        tracing::info!(
            backend = self.shared.connector.name(),
            hosts = ?self.shared.hosts,
            "Connected to registry"
        );
        self.restore_registrations().await;
        Ok(())
    }

    /// Release the session. Registrations made through this client are forgotten.
    pub async fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        let session = {
            let mut connection = self.shared.connection.write();
            connection.state = SessionState::Disconnected;
            connection.generation += 1;
            connection.session.take()
        };
        self.shared.registrations.lock().clear();

        if let Some(session) = session {
            session.close().await;
            tracing::info!(hosts = ?self.shared.hosts, "Registry session closed");
        }
    }

    /// Ensure the durable group node exists, then create an ephemeral member named `host`
    /// under it. Idempotent. The registration is restored after an automatic reconnect.
    pub async fn register_server_path(&self, group_path: &str, host: &str) -> Result<(), RegistryError> {
        self.create_member(group_path, host).await?;

        let mut registrations = self.shared.registrations.lock();
        if !registrations
            .iter()
            .any(|(group, member)| group == group_path && member == host)
        {
            registrations.push((group_path.to_string(), host.to_string()));
        }
        Ok(())
    }

    /// One-shot list of the member names under `group_path`
    pub async fn get_server_list_by_path(&self, group_path: &str) -> Result<Vec<String>, RegistryError> {
        self.session()?.children(group_path).await
    }

    /// Watch the children of `group_path`. Every change delivers a fresh snapshot; the
    /// loop ends on the first registry error.
    pub fn watch_server_list_by_path(&self, group_path: &str) -> WatchChannels<Vec<String>> {
        spawn_watch(
            self.clone(),
            group_path.to_string(),
            "children",
            |session: Arc<dyn Session>, path: String| async move { session.children_w(&path).await },
        )
    }

    /// Watch the data of a single node
    pub fn watch_path_data(&self, node_path: &str) -> WatchChannels<Vec<u8>> {
        spawn_watch(
            self.clone(),
            node_path.to_string(),
            "data",
            |session: Arc<dyn Session>, path: String| async move {
                let (data, _stat, watcher) = session.get_data_w(&path).await?;
                Ok((data, watcher))
            },
        )
    }

    pub async fn get_path_data(&self, node_path: &str) -> Result<(Vec<u8>, Stat), RegistryError> {
        self.session()?.get_data(node_path).await
    }

    /// Write node data, creating the node (and missing ancestors) when absent.
    ///
    /// An existing node is updated with compare-and-swap: against `version` when given,
    /// otherwise against the version read just before the write.
    pub async fn set_path_data(
        &self,
        node_path: &str,
        data: &[u8],
        version: Option<i32>,
    ) -> Result<Stat, RegistryError> {
        let session = self.session()?;

        if session.exists(node_path).await?.is_none() {
            if let Some(parent) = parent_path(node_path) {
                ensure_path(session.as_ref(), parent).await?;
            }
            match session.create(node_path, data, CreateMode::Persistent).await {
                Ok(()) => {
                    return session
                        .exists(node_path)
                        .await?
                        .ok_or_else(|| RegistryError::NoNode(node_path.to_string()));
                }
                // Created concurrently; fall through to the versioned update
                Err(RegistryError::NodeExists(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let expected = match version {
            Some(version) => version,
            None => session.get_data(node_path).await?.1.version,
        };
        let stat = session.set_data(node_path, data, Some(expected)).await?;

        if self.shared.settings.verbose {
            tracing::info!(path = %node_path, version = stat.version, "Node data updated");
        } else {
            tracing::debug!(path = %node_path, version = stat.version, "Node data updated");
        }
        Ok(stat)
    }

    pub(crate) fn session(&self) -> Result<Arc<dyn Session>, RegistryError> {
        let connection = self.shared.connection.read();
        match (&connection.session, connection.state) {
            (Some(session), _) => Ok(session.clone()),
            (None, SessionState::Expired) => Err(RegistryError::SessionExpired),
            (None, _) => Err(RegistryError::NotConnected),
        }
    }

    pub(crate) fn watch_settings(&self) -> WatchSettings {
        let settings = &self.shared.settings;
        WatchSettings {
            send_timeout: settings.send_timeout,
            watch_timeout: settings.watch_timeout,
            capacity: settings.channel_capacity,
            verbose: settings.verbose,
        }
    }

    async fn create_member(&self, group_path: &str, host: &str) -> Result<(), RegistryError> {
        if host.is_empty() || host.contains('/') {
            return Err(RegistryError::Operation(format!(
                "invalid member name '{}'",
                host
            )));
        }
        let session = self.session()?;
        ensure_path(session.as_ref(), group_path).await?;

        let member = member_path(group_path, host);
        if session.exists(&member).await?.is_none() {
            match session.create(&member, &[], CreateMode::Ephemeral).await {
                Ok(()) | Err(RegistryError::NodeExists(_)) => {}
                Err(e) => return Err(e),
            }
        }

        tracing::info!(path = %member, "Registered ephemeral member");
        Ok(())
    }

    fn generation(&self) -> u64 {
        self.shared.connection.read().generation
    }

    fn spawn_monitor(&self, mut events: tokio::sync::watch::Receiver<SessionEvent>, generation: u64) {
        let shared = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            while events.changed().await.is_ok() {
                let event = *events.borrow_and_update();
                let Some(shared) = shared.upgrade() else {
                    return;
                };
                let client = RegistryClient { shared };
                if client.generation() != generation {
                    return;
                }

                let verbose = client.shared.settings.verbose;
                match event {
                    SessionEvent::Connected => {
                        client.shared.connection.write().state = SessionState::Connected;
                        if verbose {
                            tracing::info!("Registry connection restored");
                        }
                    }
                    SessionEvent::Disconnected => {
                        client.shared.connection.write().state = SessionState::Disconnected;
                        if verbose {
                            tracing::info!("Registry connection lost");
                        } else {
                            tracing::debug!("Registry connection lost");
                        }
                    }
                    SessionEvent::Expired => {
                        client.handle_expiry(generation);
                        return;
                    }
                    SessionEvent::Closed => return,
                }
            }
        });
    }

    fn handle_expiry(&self, generation: u64) {
        let expired = {
            let mut connection = self.shared.connection.write();
            if connection.generation != generation {
                return;
            }
            connection.state = SessionState::Expired;
            connection.session.take()
        };
        tracing::warn!(hosts = ?self.shared.hosts, "Registry session expired");

        let client = self.clone();
        tokio::spawn(async move {
            if let Some(session) = expired {
                session.close().await;
            }
            tokio::time::sleep(client.shared.settings.reconnect_backoff).await;

            if client.shared.closed.load(Ordering::SeqCst) {
                return;
            }
            match client.connect_session().await {
                Ok(()) => {
                    tracing::info!("Reconnected to registry after session expiry");
                }
                Err(e) => {
                    tracing::error!(error = %e, "Reconnect after session expiry failed");
                }
            }
        });
    }

    async fn restore_registrations(&self) {
        let registrations = self.shared.registrations.lock().clone();
        for (group, host) in registrations {
            tracing::debug!(group = %group, host = %host, "Restoring registration");
            if let Err(e) = self.create_member(&group, &host).await {
                tracing::error!(group = %group, host = %host, error = %e, "Failed to restore registration");
            }
        }
    }
}

/// Create `path` and any missing ancestors as persistent nodes
async fn ensure_path(session: &dyn Session, path: &str) -> Result<(), RegistryError> {
    let mut chain = Vec::new();
    let mut current = Some(path);
    while let Some(p) = current {
        chain.push(p);
        current = parent_path(p);
    }

    for p in chain.into_iter().rev() {
        if session.exists(p).await?.is_some() {
            continue;
        }
        match session.create(p, &[], CreateMode::Persistent).await {
            Ok(()) | Err(RegistryError::NodeExists(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Build a client for the configured backend. The client starts disconnected.
pub fn build_client(config: &RegistryConfig) -> Result<RegistryClient, RegistryError> {
    let connector: Arc<dyn Connector> = match config.backend {
        RegistryBackend::Memory => Arc::new(MemoryRegistry::new()),
        #[cfg(feature = "zookeeper")]
        RegistryBackend::Zookeeper => Arc::new(zookeeper::ZookeeperConnector),
        #[cfg(not(feature = "zookeeper"))]
        RegistryBackend::Zookeeper => {
            return Err(RegistryError::Operation(
                "zookeeper backend requires building with the `zookeeper` feature".to_string(),
            ))
        }
    };
    Ok(RegistryClient::new(
        config.hosts.clone(),
        connector,
        RegistrySettings::from(config),
    ))
}
