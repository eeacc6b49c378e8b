//! In-process coordination service
//!
//! Implements the same node model as a ZooKeeper ensemble: a tree of versioned nodes,
//! persistent and ephemeral lifetimes, one-shot data and children watches, and sessions
//! that can be expired from the outside. Used for single-process deployments and as the
//! registry test double.

use async_trait::async_trait;
use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};

use super::backend::{
    parent_path, Connector, CreateMode, Session, SessionEvent, Stat, WatchEvent, Watcher,
};
use super::RegistryError;

type WatchSender = oneshot::Sender<Result<WatchEvent, RegistryError>>;
type WatchTable = HashMap<String, Vec<(u64, WatchSender)>>;

#[derive(Debug)]
struct Node {
    data: Vec<u8>,
    version: i32,
    /// Owning session for ephemeral nodes
    owner: Option<u64>,
}

#[derive(Default)]
struct Tree {
    nodes: BTreeMap<String, Node>,
    sessions: HashMap<u64, watch::Sender<SessionEvent>>,
    next_session: u64,
    data_watches: WatchTable,
    child_watches: WatchTable,
    unreachable: bool,
}

impl Tree {
    fn children(&self, path: &str) -> Vec<String> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let rest = &key[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    fn stat(&self, path: &str) -> Option<Stat> {
        let node = self.nodes.get(path)?;
        Some(Stat {
            version: node.version,
            num_children: self.children(path).len() as i32,
            ephemeral: node.owner.is_some(),
        })
    }

    fn fire(table: &mut WatchTable, path: &str, event: WatchEvent) {
        if let Some(pending) = table.remove(path) {
            for (_, tx) in pending {
                let _ = tx.send(Ok(event.clone()));
            }
        }
    }

    fn arm(table: &mut WatchTable, path: &str, session: u64) -> Watcher {
        let (tx, rx) = oneshot::channel();
        table.entry(path.to_string()).or_default().push((session, tx));
        Box::pin(async move { rx.await.unwrap_or(Err(RegistryError::NotConnected)) })
    }

    fn remove_node(&mut self, path: &str) {
        if self.nodes.remove(path).is_none() {
            return;
        }
        Self::fire(&mut self.data_watches, path, WatchEvent::NodeDeleted(path.to_string()));
        Self::fire(&mut self.child_watches, path, WatchEvent::NodeDeleted(path.to_string()));
        if let Some(parent) = parent_path(path) {
            Self::fire(
                &mut self.child_watches,
                parent,
                WatchEvent::ChildrenChanged(parent.to_string()),
            );
        }
    }

    /// Drop a session: fail its pending watches and delete its ephemeral nodes
    fn end_session(&mut self, id: u64, event: SessionEvent) -> bool {
        let Some(state) = self.sessions.remove(&id) else {
            return false;
        };
        state.send_replace(event);

        let error = match event {
            SessionEvent::Expired => RegistryError::SessionExpired,
            _ => RegistryError::NotConnected,
        };
        for table in [&mut self.data_watches, &mut self.child_watches] {
            for pending in table.values_mut() {
                let (owned, kept): (Vec<_>, Vec<_>) = std::mem::take(pending)
                    .into_iter()
                    .partition(|(owner, _)| *owner == id);
                *pending = kept;
                for (_, tx) in owned {
                    let _ = tx.send(Err(error.clone()));
                }
            }
            table.retain(|_, pending| !pending.is_empty());
        }

        let ephemerals: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.owner == Some(id))
            .map(|(path, _)| path.clone())
            .collect();
        for path in ephemerals {
            self.remove_node(&path);
        }
        true
    }
}

/// Shared in-memory registry; clones see the same tree
#[derive(Clone, Default)]
pub struct MemoryRegistry {
    tree: Arc<Mutex<Tree>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expire every live session, as a cluster does after losing contact with its clients.
    /// Returns how many sessions were expired.
    pub fn expire_all_sessions(&self) -> usize {
        let mut tree = self.tree.lock();
        let ids: Vec<u64> = tree.sessions.keys().copied().collect();
        ids.into_iter()
            .filter(|id| tree.end_session(*id, SessionEvent::Expired))
            .count()
    }

    /// While set, new connection attempts fail. Existing sessions are not affected.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.tree.lock().unreachable = unreachable;
    }

    pub fn session_count(&self) -> usize {
        self.tree.lock().sessions.len()
    }

    /// Children of `path`, empty when the node does not exist
    pub fn children_of(&self, path: &str) -> Vec<String> {
        self.tree.lock().children(path)
    }

    pub fn data_of(&self, path: &str) -> Option<Vec<u8>> {
        self.tree.lock().nodes.get(path).map(|node| node.data.clone())
    }
}

#[async_trait]
impl Connector for MemoryRegistry {
    async fn connect(
        &self,
        hosts: &[String],
        _session_timeout: Duration,
    ) -> Result<Arc<dyn Session>, RegistryError> {
        let mut tree = self.tree.lock();
        if tree.unreachable {
            return Err(RegistryError::Connection(format!(
                "registry at [{}] is unreachable",
                hosts.join(",")
            )));
        }

        tree.next_session += 1;
        let id = tree.next_session;
        let (tx, rx) = watch::channel(SessionEvent::Connected);
        tree.sessions.insert(id, tx);

        Ok(Arc::new(MemorySession {
            id,
            tree: self.tree.clone(),
            state: rx,
        }))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Session handle into a [`MemoryRegistry`]. Dropping it closes the session.
pub struct MemorySession {
    id: u64,
    tree: Arc<Mutex<Tree>>,
    state: watch::Receiver<SessionEvent>,
}

impl MemorySession {
    pub fn id(&self) -> u64 {
        self.id
    }

    fn live_tree(&self) -> Result<MutexGuard<'_, Tree>, RegistryError> {
        let tree = self.tree.lock();
        if tree.sessions.contains_key(&self.id) {
            return Ok(tree);
        }
        match *self.state.borrow() {
            SessionEvent::Expired => Err(RegistryError::SessionExpired),
            _ => Err(RegistryError::NotConnected),
        }
    }
}

#[async_trait]
impl Session for MemorySession {
    fn events(&self) -> watch::Receiver<SessionEvent> {
        self.state.clone()
    }

    fn is_connected(&self) -> bool {
        *self.state.borrow() == SessionEvent::Connected
    }

    async fn exists(&self, path: &str) -> Result<Option<Stat>, RegistryError> {
        Ok(self.live_tree()?.stat(path))
    }

    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<(), RegistryError> {
        let mut tree = self.live_tree()?;
        if tree.nodes.contains_key(path) {
            return Err(RegistryError::NodeExists(path.to_string()));
        }
        let parent = parent_path(path);
        if let Some(parent) = parent {
            if !tree.nodes.contains_key(parent) {
                return Err(RegistryError::NoNode(parent.to_string()));
            }
        }

        let owner = match mode {
            CreateMode::Persistent => None,
            CreateMode::Ephemeral => Some(self.id),
        };
        tree.nodes.insert(
            path.to_string(),
            Node {
                data: data.to_vec(),
                version: 0,
                owner,
            },
        );

        if let Some(parent) = parent {
            Tree::fire(
                &mut tree.child_watches,
                parent,
                WatchEvent::ChildrenChanged(parent.to_string()),
            );
        }
        Ok(())
    }

    async fn get_data(&self, path: &str) -> Result<(Vec<u8>, Stat), RegistryError> {
        let tree = self.live_tree()?;
        let stat = tree
            .stat(path)
            .ok_or_else(|| RegistryError::NoNode(path.to_string()))?;
        let data = tree.nodes.get(path).map(|node| node.data.clone()).unwrap_or_default();
        Ok((data, stat))
    }

    async fn set_data(
        &self,
        path: &str,
        data: &[u8],
        version: Option<i32>,
    ) -> Result<Stat, RegistryError> {
        let mut tree = self.live_tree()?;
        let node = tree
            .nodes
            .get_mut(path)
            .ok_or_else(|| RegistryError::NoNode(path.to_string()))?;
        if let Some(expected) = version {
            if expected != node.version {
                return Err(RegistryError::BadVersion(path.to_string()));
            }
        }
        node.data = data.to_vec();
        node.version += 1;

        Tree::fire(&mut tree.data_watches, path, WatchEvent::DataChanged(path.to_string()));
        tree.stat(path)
            .ok_or_else(|| RegistryError::NoNode(path.to_string()))
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, RegistryError> {
        let tree = self.live_tree()?;
        if !tree.nodes.contains_key(path) {
            return Err(RegistryError::NoNode(path.to_string()));
        }
        Ok(tree.children(path))
    }

    async fn children_w(&self, path: &str) -> Result<(Vec<String>, Watcher), RegistryError> {
        let mut tree = self.live_tree()?;
        if !tree.nodes.contains_key(path) {
            return Err(RegistryError::NoNode(path.to_string()));
        }
        let children = tree.children(path);
        let watcher = Tree::arm(&mut tree.child_watches, path, self.id);
        Ok((children, watcher))
    }

    async fn get_data_w(&self, path: &str) -> Result<(Vec<u8>, Stat, Watcher), RegistryError> {
        let mut tree = self.live_tree()?;
        let stat = tree
            .stat(path)
            .ok_or_else(|| RegistryError::NoNode(path.to_string()))?;
        let data = tree.nodes.get(path).map(|node| node.data.clone()).unwrap_or_default();
        let watcher = Tree::arm(&mut tree.data_watches, path, self.id);
        Ok((data, stat, watcher))
    }

    async fn close(&self) {
        self.tree.lock().end_session(self.id, SessionEvent::Closed);
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.tree.lock().end_session(self.id, SessionEvent::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connect(registry: &MemoryRegistry) -> Arc<dyn Session> {
        registry
            .connect(&["memory".to_string()], Duration::from_secs(10))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_requires_parent() {
        let registry = MemoryRegistry::new();
        let session = connect(&registry).await;

        assert_eq!(
            session.create("/a/b", b"", CreateMode::Persistent).await,
            Err(RegistryError::NoNode("/a".to_string()))
        );
        session.create("/a", b"", CreateMode::Persistent).await.unwrap();
        session.create("/a/b", b"x", CreateMode::Persistent).await.unwrap();
        assert_eq!(
            session.create("/a/b", b"", CreateMode::Persistent).await,
            Err(RegistryError::NodeExists("/a/b".to_string()))
        );

        let stat = session.exists("/a").await.unwrap().unwrap();
        assert_eq!(stat.num_children, 1);
        assert_eq!(session.children("/a").await.unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_children_are_direct_only() {
        let registry = MemoryRegistry::new();
        let session = connect(&registry).await;
        for path in ["/g", "/g/x", "/g/x/deep", "/g/y", "/gz"] {
            session.create(path, b"", CreateMode::Persistent).await.unwrap();
        }
        assert_eq!(session.children("/g").await.unwrap(), vec!["x", "y"]);
    }

    #[tokio::test]
    async fn test_set_data_checks_version() {
        let registry = MemoryRegistry::new();
        let session = connect(&registry).await;
        session.create("/conf", b"v0", CreateMode::Persistent).await.unwrap();

        let stat = session.set_data("/conf", b"v1", Some(0)).await.unwrap();
        assert_eq!(stat.version, 1);
        assert_eq!(
            session.set_data("/conf", b"v2", Some(0)).await,
            Err(RegistryError::BadVersion("/conf".to_string()))
        );
        session.set_data("/conf", b"v2", None).await.unwrap();

        let (data, stat) = session.get_data("/conf").await.unwrap();
        assert_eq!(data, b"v2");
        assert_eq!(stat.version, 2);
    }

    #[tokio::test]
    async fn test_ephemeral_removed_with_session() {
        let registry = MemoryRegistry::new();
        let owner = connect(&registry).await;
        let observer = connect(&registry).await;

        owner.create("/g", b"", CreateMode::Persistent).await.unwrap();
        owner.create("/g/m1", b"", CreateMode::Ephemeral).await.unwrap();
        let (children, watcher) = observer.children_w("/g").await.unwrap();
        assert_eq!(children, vec!["m1"]);

        owner.close().await;
        assert_eq!(watcher.await, Ok(WatchEvent::ChildrenChanged("/g".to_string())));
        assert!(observer.children("/g").await.unwrap().is_empty());
        assert_eq!(owner.exists("/g").await, Err(RegistryError::NotConnected));
    }

    #[tokio::test]
    async fn test_dropping_session_closes_it() {
        let registry = MemoryRegistry::new();
        {
            let session = connect(&registry).await;
            session.create("/g", b"", CreateMode::Persistent).await.unwrap();
            session.create("/g/m1", b"", CreateMode::Ephemeral).await.unwrap();
            assert_eq!(registry.session_count(), 1);
        }
        assert_eq!(registry.session_count(), 0);
        assert!(registry.children_of("/g").is_empty());
    }

    #[tokio::test]
    async fn test_data_watch_fires_once() {
        let registry = MemoryRegistry::new();
        let session = connect(&registry).await;
        session.create("/conf", b"a", CreateMode::Persistent).await.unwrap();

        let (data, _, watcher) = session.get_data_w("/conf").await.unwrap();
        assert_eq!(data, b"a");
        session.set_data("/conf", b"b", None).await.unwrap();
        assert_eq!(watcher.await, Ok(WatchEvent::DataChanged("/conf".to_string())));
    }

    #[tokio::test]
    async fn test_expiry_fails_pending_watches() {
        let registry = MemoryRegistry::new();
        let session = connect(&registry).await;
        session.create("/g", b"", CreateMode::Persistent).await.unwrap();
        let mut events = session.events();
        let (_, watcher) = session.children_w("/g").await.unwrap();

        assert_eq!(registry.expire_all_sessions(), 1);
        assert_eq!(watcher.await, Err(RegistryError::SessionExpired));
        assert_eq!(*events.borrow_and_update(), SessionEvent::Expired);
        assert!(!session.is_connected());
        assert_eq!(session.children("/g").await, Err(RegistryError::SessionExpired));
    }

    #[tokio::test]
    async fn test_unreachable_rejects_connect() {
        let registry = MemoryRegistry::new();
        registry.set_unreachable(true);
        let result = registry
            .connect(&["zk1:2181".to_string()], Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(RegistryError::Connection(_))));

        registry.set_unreachable(false);
        let _session = connect(&registry).await;
        assert_eq!(registry.session_count(), 1);
    }
}
