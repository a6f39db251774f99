//! Per-follower replication task.
//!
//! A cursor subscribes to the WAL head watch, streams entries to its
//! follower in strictly ascending offset order, and publishes each acked
//! offset to the commit tracker. Transport failures are retried with
//! exponential backoff and never fail the leader; eviction of a persistently
//! lagging follower is the coordinator's call, not ours.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::commit_tracker::CommitTracker;
use crate::proto::{AddEntryRequest, Epoch, Offset};
use crate::rpc::ReplicationClient;
use crate::wal::Wal;

const ADD_ENTRY_BACKOFF_BASE: Duration = Duration::from_millis(100);
const ADD_ENTRY_BACKOFF_MAX: Duration = Duration::from_secs(10);
const ADD_ENTRY_BACKOFF_MAX_SHIFT: u32 = 6;
/// Consecutive failures after which the follower is reported as lagging.
const LAGGING_AFTER: u32 = 10;

/// Handle to one running cursor. Dropping the handle does not stop the task;
/// call `stop` so teardown is observed before the epoch moves on.
pub struct FollowerCursor {
    name: String,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl FollowerCursor {
    pub fn start(
        name: String,
        epoch: Epoch,
        start_offset: Offset,
        client: Arc<dyn ReplicationClient>,
        wal: Arc<dyn Wal>,
        tracker: Arc<CommitTracker>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task_name = name.clone();
        let task = tokio::spawn(async move {
            run_cursor(
                task_name,
                epoch,
                start_offset,
                client,
                wal,
                tracker,
                shutdown_rx,
            )
            .await;
        });
        Self {
            name,
            shutdown_tx,
            task,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signal shutdown and wait for the task to exit.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }
}

async fn run_cursor(
    name: String,
    epoch: Epoch,
    start_offset: Offset,
    client: Arc<dyn ReplicationClient>,
    wal: Arc<dyn Wal>,
    tracker: Arc<CommitTracker>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut head_rx = wal.watch_head();
    let mut next = start_offset.max(0);
    let mut failures: u32 = 0;

    loop {
        // Wait until the WAL has an entry at `next` or we are told to stop.
        loop {
            if *shutdown_rx.borrow() {
                return;
            }
            if *head_rx.borrow_and_update() >= next {
                break;
            }
            tokio::select! {
                changed = head_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = shutdown_rx.changed() => {}
            }
        }

        let entry = match wal.read(next) {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                // Head moved backward under us (leader-side truncation);
                // wait for the log to grow again.
                tokio::select! {
                    changed = head_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    _ = shutdown_rx.changed() => {}
                }
                continue;
            }
            Err(err) => {
                error!(follower = %name, offset = next, error = ?err, "wal read failed, stopping cursor");
                return;
            }
        };

        let request = AddEntryRequest {
            epoch,
            entry,
            commit_offset: tracker.commit_offset(),
        };
        // Shutdown must be able to interrupt a call that the follower never
        // answers; re-sending after a spurious wakeup is harmless.
        let result = tokio::select! {
            result = client.add_entry(&name, request) => result,
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return;
                }
                continue;
            }
        };
        match result {
            Ok(response) => {
                failures = 0;
                tracker.update_follower(&name, response.offset);
                next += 1;
            }
            Err(err) => {
                failures = failures.saturating_add(1);
                if failures == LAGGING_AFTER {
                    warn!(
                        follower = %name,
                        offset = next,
                        failures,
                        error = ?err,
                        "follower is lagging, will keep retrying"
                    );
                } else {
                    debug!(follower = %name, offset = next, failures, error = ?err, "add entry failed");
                }
                let delay = backoff_delay(failures);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_rx.changed() => {}
                }
            }
        }
    }
}

fn backoff_delay(failures: u32) -> Duration {
    let shift = failures.saturating_sub(1).min(ADD_ENTRY_BACKOFF_MAX_SHIFT);
    let delay = ADD_ENTRY_BACKOFF_BASE.saturating_mul(1 << shift);
    delay.min(ADD_ENTRY_BACKOFF_MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use bytes::Bytes;

    use crate::proto::{
        AddEntryResponse, LogEntry, TruncateRequest, TruncateResponse, INVALID_OFFSET,
    };
    use crate::wal::MemoryWal;

    /// Acks every entry and remembers the offsets it saw.
    struct AckingClient {
        seen: Mutex<Vec<Offset>>,
    }

    #[async_trait]
    impl ReplicationClient for AckingClient {
        async fn add_entry(
            &self,
            _follower: &str,
            request: AddEntryRequest,
        ) -> anyhow::Result<AddEntryResponse> {
            let offset = request.entry.offset;
            self.seen
                .lock()
                .unwrap_or_else(|err| err.into_inner())
                .push(offset);
            Ok(AddEntryResponse { offset })
        }

        async fn truncate(
            &self,
            _follower: &str,
            _request: TruncateRequest,
        ) -> anyhow::Result<TruncateResponse> {
            unreachable!("cursor never truncates")
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(backoff_delay(1), Duration::from_millis(100));
        assert_eq!(backoff_delay(2), Duration::from_millis(200));
        assert!(backoff_delay(60) <= ADD_ENTRY_BACKOFF_MAX);
    }

    #[tokio::test]
    async fn cursor_streams_backlog_in_order() {
        let wal: Arc<dyn Wal> = Arc::new(MemoryWal::new());
        for i in 0..3 {
            wal.append(&LogEntry {
                epoch: 1,
                offset: i,
                value: Bytes::from_static(b"x"),
            })
            .unwrap();
        }

        let mut followers = HashMap::new();
        followers.insert("f1".to_string(), INVALID_OFFSET);
        let tracker = Arc::new(CommitTracker::new(2, 2, followers));
        let client = Arc::new(AckingClient {
            seen: Mutex::new(Vec::new()),
        });

        let cursor = FollowerCursor::start(
            "f1".to_string(),
            1,
            0,
            client.clone(),
            wal.clone(),
            tracker.clone(),
        );

        tracker.wait_committed(2).await.unwrap();
        assert_eq!(
            *client.seen.lock().unwrap_or_else(|err| err.into_inner()),
            vec![0, 1, 2]
        );

        // New appends reach the follower too.
        wal.append(&LogEntry {
            epoch: 1,
            offset: 3,
            value: Bytes::from_static(b"y"),
        })
        .unwrap();
        tracker.update_leader(3);
        tracker.wait_committed(3).await.unwrap();

        cursor.stop().await;
    }
}
