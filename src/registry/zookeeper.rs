//! ZooKeeper backend, built on `zookeeper-client`

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use zookeeper_client as zk;

use super::backend::{Connector, CreateMode, Session, SessionEvent, Stat, WatchEvent, Watcher};
use super::RegistryError;

/// Opens ZooKeeper sessions against a comma-joined host list
pub struct ZookeeperConnector;

#[async_trait]
impl Connector for ZookeeperConnector {
    async fn connect(
        &self,
        hosts: &[String],
        session_timeout: Duration,
    ) -> Result<Arc<dyn Session>, RegistryError> {
        let cluster = hosts.join(",");
        let client = zk::Client::connector()
            .session_timeout(session_timeout)
            .connect(&cluster)
            .await
            .map_err(|e| RegistryError::Connection(format!("{}: {}", cluster, e)))?;

        let (tx, rx) = watch::channel(SessionEvent::Connected);
        let mut states = client.state_watcher();
        tokio::spawn(async move {
            loop {
                let event = session_event(states.changed().await);
                let terminal = matches!(event, SessionEvent::Expired | SessionEvent::Closed);
                tx.send_replace(event);
                if terminal {
                    return;
                }
            }
        });

        Ok(Arc::new(ZookeeperSession {
            client: RwLock::new(Some(client)),
            events: rx,
        }))
    }

    fn name(&self) -> &'static str {
        "zookeeper"
    }
}

pub struct ZookeeperSession {
    client: RwLock<Option<zk::Client>>,
    events: watch::Receiver<SessionEvent>,
}

impl ZookeeperSession {
    fn client(&self) -> Result<zk::Client, RegistryError> {
        self.client.read().clone().ok_or(RegistryError::NotConnected)
    }
}

fn session_event(state: zk::SessionState) -> SessionEvent {
    match state {
        zk::SessionState::SyncConnected | zk::SessionState::ConnectedReadOnly => SessionEvent::Connected,
        zk::SessionState::Expired => SessionEvent::Expired,
        zk::SessionState::Closed | zk::SessionState::AuthFailed => SessionEvent::Closed,
        _ => SessionEvent::Disconnected,
    }
}

fn map_error(path: &str, error: zk::Error) -> RegistryError {
    match error {
        zk::Error::NoNode => RegistryError::NoNode(path.to_string()),
        zk::Error::NodeExists => RegistryError::NodeExists(path.to_string()),
        zk::Error::BadVersion => RegistryError::BadVersion(path.to_string()),
        zk::Error::SessionExpired => RegistryError::SessionExpired,
        zk::Error::ConnectionLoss => RegistryError::Connection(format!("connection lost on {}", path)),
        other => RegistryError::Operation(format!("{}: {}", path, other)),
    }
}

fn convert_stat(stat: &zk::Stat) -> Stat {
    Stat {
        version: stat.version,
        num_children: stat.num_children,
        ephemeral: stat.ephemeral_owner != 0,
    }
}

fn into_watcher(watcher: zk::OneshotWatcher) -> Watcher {
    Box::pin(async move {
        let event = watcher.changed().await;
        let path = event.path.to_string();
        match event.event_type {
            zk::EventType::NodeCreated => Ok(WatchEvent::NodeCreated(path)),
            zk::EventType::NodeDeleted => Ok(WatchEvent::NodeDeleted(path)),
            zk::EventType::NodeDataChanged => Ok(WatchEvent::DataChanged(path)),
            zk::EventType::NodeChildrenChanged => Ok(WatchEvent::ChildrenChanged(path)),
            _ => match session_event(event.session_state) {
                SessionEvent::Expired => Err(RegistryError::SessionExpired),
                SessionEvent::Closed => Err(RegistryError::NotConnected),
                _ => Err(RegistryError::Connection(format!(
                    "watch on {} interrupted: {:?}",
                    path, event.session_state
                ))),
            },
        }
    })
}

#[async_trait]
impl Session for ZookeeperSession {
    fn events(&self) -> watch::Receiver<SessionEvent> {
        self.events.clone()
    }

    fn is_connected(&self) -> bool {
        self.client.read().is_some() && *self.events.borrow() == SessionEvent::Connected
    }

    async fn exists(&self, path: &str) -> Result<Option<Stat>, RegistryError> {
        let stat = self
            .client()?
            .check_stat(path)
            .await
            .map_err(|e| map_error(path, e))?;
        Ok(stat.as_ref().map(convert_stat))
    }

    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<(), RegistryError> {
        let mode = match mode {
            CreateMode::Persistent => zk::CreateMode::Persistent,
            CreateMode::Ephemeral => zk::CreateMode::Ephemeral,
        };
        let options = mode.with_acls(zk::Acls::anyone_all());
        self.client()?
            .create(path, data, &options)
            .await
            .map_err(|e| map_error(path, e))?;
        Ok(())
    }

    async fn get_data(&self, path: &str) -> Result<(Vec<u8>, Stat), RegistryError> {
        let (data, stat) = self
            .client()?
            .get_data(path)
            .await
            .map_err(|e| map_error(path, e))?;
        Ok((data, convert_stat(&stat)))
    }

    async fn set_data(
        &self,
        path: &str,
        data: &[u8],
        version: Option<i32>,
    ) -> Result<Stat, RegistryError> {
        let stat = self
            .client()?
            .set_data(path, data, version)
            .await
            .map_err(|e| map_error(path, e))?;
        Ok(convert_stat(&stat))
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, RegistryError> {
        self.client()?
            .list_children(path)
            .await
            .map_err(|e| map_error(path, e))
    }

    async fn children_w(&self, path: &str) -> Result<(Vec<String>, Watcher), RegistryError> {
        let (children, watcher) = self
            .client()?
            .list_and_watch_children(path)
            .await
            .map_err(|e| map_error(path, e))?;
        Ok((children, into_watcher(watcher)))
    }

    async fn get_data_w(&self, path: &str) -> Result<(Vec<u8>, Stat, Watcher), RegistryError> {
        let (data, stat, watcher) = self
            .client()?
            .get_and_watch_data(path)
            .await
            .map_err(|e| map_error(path, e))?;
        Ok((data, convert_stat(&stat), into_watcher(watcher)))
    }

    async fn close(&self) {
        // The session ends once the last client handle is dropped
        self.client.write().take();
    }
}
