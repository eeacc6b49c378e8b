use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use super::{MembershipError, MembershipSource, Observer, Subject};
use crate::registry::{RegistryClient, WatchChannels};

/// Membership pushed by a registry children watch on the service group node.
///
/// Each member node name is a backend address. The watch loop ends on any registry
/// error, so `watch_conf` reconnects if needed and re-subscribes after
/// `resubscribe_delay`, for the lifetime of the process.
pub struct RegistryWatchSource {
    client: RegistryClient,
    group_path: String,
    resubscribe_delay: Duration,
    subject: Subject,
}

impl RegistryWatchSource {
    pub fn new(client: RegistryClient, group_path: String, resubscribe_delay: Duration) -> Self {
        Self {
            client,
            group_path,
            resubscribe_delay,
            subject: Subject::default(),
        }
    }

    pub fn group_path(&self) -> &str {
        &self.group_path
    }

    /// Load the current member list once, without subscribing
    pub async fn refresh(&self) -> Result<(), MembershipError> {
        let members = self.client.get_server_list_by_path(&self.group_path).await?;
        self.update_conf(members);
        Ok(())
    }

    /// Follow one subscription until it ends
    async fn follow(&self) {
        let channels = self.client.watch_server_list_by_path(&self.group_path);
        self.drain(channels).await;
    }

    /// Apply every snapshot, then report why the watch stopped. The watch task
    /// queues its error before dropping the snapshot sender, so it is visible once
    /// the snapshots run dry.
    async fn drain(&self, (mut snapshots, mut errors): WatchChannels<Vec<String>>) {
        while let Some(members) = snapshots.recv().await {
            self.update_conf(members);
        }
        if let Ok(e) = errors.try_recv() {
            tracing::warn!(path = %self.group_path, error = %e, "Membership watch ended");
        }
    }
}

#[async_trait]
impl MembershipSource for RegistryWatchSource {
    fn get_conf(&self) -> Vec<String> {
        self.subject.entries()
    }

    fn attach(&self, observer: Arc<dyn Observer>) {
        self.subject.attach(observer);
    }

    async fn watch_conf(&self) -> Result<(), MembershipError> {
        loop {
            if !self.client.is_connected() {
                if let Err(e) = self.client.get_connect().await {
                    tracing::warn!(error = %e, "Registry unavailable, retrying");
                    tokio::time::sleep(self.resubscribe_delay).await;
                    continue;
                }
            }

            self.follow().await;
            tokio::time::sleep(self.resubscribe_delay).await;
            tracing::info!(path = %self.group_path, "Re-subscribing to membership watch");
        }
    }

    fn update_conf(&self, conf: Vec<String>) {
        if conf == self.subject.entries() {
            tracing::trace!(path = %self.group_path, "Membership unchanged");
        } else {
            tracing::info!(path = %self.group_path, members = ?conf, "Membership changed");
        }
        self.subject.publish(conf);
    }

    fn name(&self) -> &'static str {
        "registry"
    }
}
