//! Watch loops
//!
//! One task per watched path. Each iteration arms a one-shot watch on the client's
//! current session, pushes the snapshot into a bounded channel and waits for the next
//! event. Both the send and the wait are timeout-guarded: a slow consumer loses a
//! snapshot instead of stalling the loop, and a quiet path is re-armed periodically.
//! Any registry error ends the loop; it is reported once as `WatchTerminated` on the
//! error channel and both channels close.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::SendTimeoutError};

use super::backend::{Session, Watcher};
use super::{RegistryClient, RegistryError};

/// Snapshot and error channels returned by the watch functions
pub type WatchChannels<T> = (mpsc::Receiver<T>, mpsc::Receiver<RegistryError>);

#[derive(Debug, Clone, Copy)]
pub(crate) struct WatchSettings {
    pub send_timeout: Duration,
    pub watch_timeout: Duration,
    pub capacity: usize,
    pub verbose: bool,
}

enum Outcome {
    Event(String),
    TimedOut,
    ConsumerGone,
    Failed(RegistryError),
}

pub(crate) fn spawn_watch<T, F, Fut>(
    client: RegistryClient,
    path: String,
    kind: &'static str,
    arm: F,
) -> WatchChannels<T>
where
    T: Send + 'static,
    F: Fn(Arc<dyn Session>, String) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(T, Watcher), RegistryError>> + Send + 'static,
{
    let settings = client.watch_settings();
    let (snapshot_tx, snapshot_rx) = mpsc::channel(settings.capacity.max(1));
    let (error_tx, error_rx) = mpsc::channel(1);

    tokio::spawn(async move {
        let reason = loop {
            let session = match client.session() {
                Ok(session) => session,
                Err(e) => break e,
            };
            let (snapshot, watcher) = match arm(session, path.clone()).await {
                Ok(armed) => armed,
                Err(e) => break e,
            };

            match snapshot_tx.send_timeout(snapshot, settings.send_timeout).await {
                Ok(()) => {}
                Err(SendTimeoutError::Timeout(_)) => {
                    if settings.verbose {
                        tracing::info!(path = %path, kind, "Snapshot channel full, dropping update");
                    } else {
                        tracing::debug!(path = %path, kind, "Snapshot channel full, dropping update");
                    }
                }
                Err(SendTimeoutError::Closed(_)) => {
                    tracing::debug!(path = %path, kind, "Watch consumer gone, stopping");
                    return;
                }
            }

            let outcome = tokio::select! {
                waited = tokio::time::timeout(settings.watch_timeout, watcher) => match waited {
                    Ok(Ok(event)) => Outcome::Event(format!("{:?}", event)),
                    Ok(Err(e)) => Outcome::Failed(e),
                    Err(_) => Outcome::TimedOut,
                },
                _ = snapshot_tx.closed() => Outcome::ConsumerGone,
            };

            match outcome {
                Outcome::Event(event) => {
                    if settings.verbose {
                        tracing::info!(path = %path, kind, event = %event, "Watch event");
                    } else {
                        tracing::debug!(path = %path, kind, event = %event, "Watch event");
                    }
                }
                Outcome::TimedOut => {
                    if settings.verbose {
                        tracing::info!(path = %path, kind, "Watch wait timed out, re-arming");
                    } else {
                        tracing::trace!(path = %path, kind, "Watch wait timed out, re-arming");
                    }
                }
                Outcome::ConsumerGone => {
                    tracing::debug!(path = %path, kind, "Watch consumer gone, stopping");
                    return;
                }
                Outcome::Failed(e) => break e,
            }
        };

        tracing::warn!(path = %path, kind, error = %reason, "Watch loop terminated");
        let _ = error_tx.try_send(RegistryError::WatchTerminated {
            path: path.clone(),
            reason: reason.to_string(),
        });
    });

    (snapshot_rx, error_rx)
}
