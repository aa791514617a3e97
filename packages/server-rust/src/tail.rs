//! Change-log tailing.
//!
//! A [`ChangeStream`] is a live, cancellable subscription to the change log
//! starting strictly after a cursor. A background task polls a
//! [`ChangeSource`] in batches and, once caught up, waits for either an
//! in-process commit notification or the poll interval, so writes committed
//! by other broker instances are picked up as well. The same task tails a
//! local [`Broker`](crate::broker::Broker) or a remote one through
//! [`ClientQuerier`](crate::querier::ClientQuerier).
//!
//! Entries arrive in ascending global version order. Restarting from the last
//! delivered version neither skips nor repeats entries.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::Stream;
use gatebroker_core::{BrokerError, ChangeEntry};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::storage::StorageBackend;

/// Anything that can hand out bounded batches of the change log.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Up to `limit` entries with a global version greater than `after`.
    async fn fetch_changes(
        &self,
        after: u64,
        limit: usize,
    ) -> Result<Vec<ChangeEntry>, BrokerError>;
}

#[async_trait]
impl<T: StorageBackend + ?Sized> ChangeSource for T {
    async fn fetch_changes(
        &self,
        after: u64,
        limit: usize,
    ) -> Result<Vec<ChangeEntry>, BrokerError> {
        self.changes_after(after, limit).await
    }
}

/// Polling behaviour of a tail task.
#[derive(Debug, Clone, Copy)]
pub struct TailSettings {
    /// Upper bound on the wait between polls when no commit is signalled.
    pub poll_interval: Duration,
    /// Entries fetched per poll.
    pub batch_size: usize,
}

impl Default for TailSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 256,
        }
    }
}

/// Live change-log subscription.
///
/// Yields `Ok(entry)` for every change after the starting cursor. A
/// non-retryable source error is delivered once and ends the stream.
/// Dropping the stream cancels the background task.
#[derive(Debug)]
pub struct ChangeStream {
    rx: mpsc::Receiver<Result<ChangeEntry, BrokerError>>,
    cancel: CancellationToken,
}

impl ChangeStream {
    /// Spawns the tail task on the current tokio runtime.
    ///
    /// A `commits` channel whose sender is gone leaves the task on plain
    /// interval polling.
    pub(crate) fn spawn(
        source: Arc<dyn ChangeSource>,
        commits: watch::Receiver<u64>,
        from_version: u64,
        settings: TailSettings,
    ) -> Self {
        let batch_size = settings.batch_size.max(1);
        let (tx, rx) = mpsc::channel(batch_size);
        let cancel = CancellationToken::new();

        let task = TailTask {
            source,
            commits,
            cursor: from_version,
            settings: TailSettings {
                batch_size,
                ..settings
            },
            tx,
            cancel: cancel.clone(),
        };
        tokio::spawn(task.run());

        Self { rx, cancel }
    }

    /// Waits for the next entry. `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<Result<ChangeEntry, BrokerError>> {
        self.rx.recv().await
    }

    /// Stops the subscription. Entries already buffered are still returned.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Stream for ChangeStream {
    type Item = Result<ChangeEntry, BrokerError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for ChangeStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct TailTask {
    source: Arc<dyn ChangeSource>,
    commits: watch::Receiver<u64>,
    cursor: u64,
    settings: TailSettings,
    tx: mpsc::Sender<Result<ChangeEntry, BrokerError>>,
    cancel: CancellationToken,
}

impl TailTask {
    async fn run(mut self) {
        debug!(from = self.cursor, "tail started");
        let mut commits_open = true;

        loop {
            let batch = tokio::select! {
                () = self.cancel.cancelled() => break,
                batch = self.source.fetch_changes(self.cursor, self.settings.batch_size) => batch,
            };

            match batch {
                Ok(entries) => {
                    let full = entries.len() >= self.settings.batch_size;
                    for entry in entries {
                        let version = entry.version;
                        let sent = tokio::select! {
                            () = self.cancel.cancelled() => false,
                            sent = self.tx.send(Ok(entry)) => sent.is_ok(),
                        };
                        if !sent {
                            debug!(cursor = self.cursor, "tail consumer gone");
                            return;
                        }
                        self.cursor = version;
                    }
                    if full {
                        continue;
                    }
                }
                Err(err) if err.is_retryable() => {
                    warn!(cursor = self.cursor, error = %err, "tail poll failed, retrying");
                }
                Err(err) => {
                    warn!(cursor = self.cursor, error = %err, "tail stopped");
                    let _ = self.tx.send(Err(err)).await;
                    return;
                }
            }

            tokio::select! {
                () = self.cancel.cancelled() => break,
                changed = self.commits.changed(), if commits_open => {
                    if changed.is_err() {
                        commits_open = false;
                    }
                }
                () = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }
        debug!(cursor = self.cursor, "tail cancelled");
    }
}
