//! Coordination service backend seam
//!
//! [`RegistryClient`](super::RegistryClient) owns the session state machine and the
//! watch loops; a backend only has to provide a [`Connector`] that opens sessions and a
//! [`Session`] exposing the raw node operations. Watches are one-shot: each `*_w` call
//! returns the current value plus a future that resolves on the next change.

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use super::RegistryError;

/// Node lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Survives the creating session
    Persistent,
    /// Removed when the creating session ends
    Ephemeral,
}

/// Connection-level notifications published by a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    Expired,
    Closed,
}

/// What fired a one-shot watch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    NodeCreated(String),
    NodeDeleted(String),
    DataChanged(String),
    ChildrenChanged(String),
}

impl WatchEvent {
    pub fn path(&self) -> &str {
        match self {
            WatchEvent::NodeCreated(path)
            | WatchEvent::NodeDeleted(path)
            | WatchEvent::DataChanged(path)
            | WatchEvent::ChildrenChanged(path) => path,
        }
    }
}

/// Node metadata
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stat {
    /// Data version, bumped by every successful `set_data`
    pub version: i32,
    pub num_children: i32,
    pub ephemeral: bool,
}

/// One-shot watch, resolves once with the event or the error that ended it
pub type Watcher = BoxFuture<'static, Result<WatchEvent, RegistryError>>;

/// A live session with the coordination service
#[async_trait]
pub trait Session: Send + Sync {
    /// Session state stream; the current value is the latest event
    fn events(&self) -> watch::Receiver<SessionEvent>;

    fn is_connected(&self) -> bool;

    async fn exists(&self, path: &str) -> Result<Option<Stat>, RegistryError>;

    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<(), RegistryError>;

    async fn get_data(&self, path: &str) -> Result<(Vec<u8>, Stat), RegistryError>;

    /// Replace node data. `version` of `None` skips the version check.
    async fn set_data(
        &self,
        path: &str,
        data: &[u8],
        version: Option<i32>,
    ) -> Result<Stat, RegistryError>;

    async fn children(&self, path: &str) -> Result<Vec<String>, RegistryError>;

    async fn children_w(&self, path: &str) -> Result<(Vec<String>, Watcher), RegistryError>;

    async fn get_data_w(&self, path: &str) -> Result<(Vec<u8>, Stat, Watcher), RegistryError>;

    /// End the session; ephemeral nodes it created go away
    async fn close(&self);
}

/// Opens sessions against a set of hosts
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        hosts: &[String],
        session_timeout: Duration,
    ) -> Result<Arc<dyn Session>, RegistryError>;

    fn name(&self) -> &'static str;
}

/// Parent of a slash-separated node path, `None` for the root and top-level nodes
pub fn parent_path(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) | None => None,
        Some(idx) => Some(&trimmed[..idx]),
    }
}
