//! Quorum accounting for one leadership term.
//!
//! Every ensemble member (the leader included) reports the highest offset it
//! has durably persisted; the tracker derives the commit offset as the
//! highest offset persisted by a write quorum and publishes it on a watch
//! channel. The published value never regresses within a term.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::watch;

use crate::error::ShardError;
use crate::proto::{Offset, INVALID_OFFSET};

pub fn quorum(replication_factor: u32) -> usize {
    (replication_factor as usize / 2) + 1
}

#[derive(Clone, Copy, Debug)]
pub struct CommitSnapshot {
    pub offset: Offset,
    pub closed: bool,
}

struct TrackerState {
    leader_offset: Offset,
    followers: HashMap<String, Offset>,
}

pub struct CommitTracker {
    replication_factor: u32,
    state: Mutex<TrackerState>,
    commit_tx: watch::Sender<CommitSnapshot>,
}

impl CommitTracker {
    /// `leader_offset` is the leader's own durable head at term start;
    /// `followers` maps each admitted follower to its persisted offset.
    pub fn new(
        replication_factor: u32,
        leader_offset: Offset,
        followers: HashMap<String, Offset>,
    ) -> Self {
        let state = TrackerState {
            leader_offset,
            followers,
        };
        let offset = committed_offset(replication_factor, &state);
        let (commit_tx, _) = watch::channel(CommitSnapshot {
            offset,
            closed: false,
        });
        Self {
            replication_factor,
            state: Mutex::new(state),
            commit_tx,
        }
    }

    pub fn commit_offset(&self) -> Offset {
        self.commit_tx.borrow().offset
    }

    pub fn watch_commit(&self) -> watch::Receiver<CommitSnapshot> {
        self.commit_tx.subscribe()
    }

    pub fn update_leader(&self, offset: Offset) {
        let mut state = self.lock();
        if offset > state.leader_offset {
            state.leader_offset = offset;
        }
        self.publish(&state);
    }

    pub fn update_follower(&self, name: &str, offset: Offset) {
        let mut state = self.lock();
        match state.followers.get_mut(name) {
            Some(current) => {
                if offset > *current {
                    *current = offset;
                }
            }
            // Unknown follower: the cursor outlived its admission; drop the ack.
            None => return,
        }
        self.publish(&state);
    }

    pub fn add_follower(&self, name: &str, offset: Offset) {
        let mut state = self.lock();
        state.followers.insert(name.to_string(), offset);
        self.publish(&state);
    }

    /// Wait until `offset` is committed. Fails with `InvalidStatus` once the
    /// term is closed (fence or shutdown), which is how in-flight writes are
    /// aborted.
    pub async fn wait_committed(&self, offset: Offset) -> Result<(), ShardError> {
        let mut rx = self.commit_tx.subscribe();
        loop {
            let snapshot = *rx.borrow_and_update();
            if snapshot.offset >= offset {
                return Ok(());
            }
            if snapshot.closed {
                return Err(ShardError::InvalidStatus);
            }
            if rx.changed().await.is_err() {
                return Err(ShardError::InvalidStatus);
            }
        }
    }

    /// Mark the term over. Wakes every waiter with `InvalidStatus`.
    pub fn close(&self) {
        self.commit_tx.send_modify(|snapshot| snapshot.closed = true);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn publish(&self, state: &TrackerState) {
        let offset = committed_offset(self.replication_factor, state);
        self.commit_tx.send_if_modified(|snapshot| {
            // Never regress within a term.
            if offset > snapshot.offset {
                snapshot.offset = offset;
                true
            } else {
                false
            }
        });
    }
}

fn committed_offset(replication_factor: u32, state: &TrackerState) -> Offset {
    let mut offsets: Vec<Offset> = Vec::with_capacity(state.followers.len() + 1);
    offsets.push(state.leader_offset);
    offsets.extend(state.followers.values().copied());
    offsets.sort_unstable_by(|a, b| b.cmp(a));

    let needed = quorum(replication_factor);
    if offsets.len() < needed {
        return INVALID_OFFSET;
    }
    offsets[needed - 1]
}
