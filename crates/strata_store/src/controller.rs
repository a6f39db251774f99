//! Per-shard leader controller.
//!
//! The controller is the shard's state machine: it owns the WAL and the KV
//! database, participates in the epoch hand-off with the coordinator, drives
//! replication through follower cursors, and serves client reads and writes
//! against committed state.
//!
//! Lifecycle: `NotMember` after open (epoch loaded from the KV), `Fenced`
//! once a strictly greater epoch is installed, `Leader` after a matching
//! `BecomeLeader`. Fencing tears the previous term down (cursors stopped and
//! awaited, in-flight writes aborted) before the new epoch becomes durable.
//!
//! Write path: status check, offset assignment, and the durable append all
//! happen under the controller guard so a concurrent fence cannot interleave;
//! the caller then waits for the term's applier to commit and apply its
//! entry. The applier is the only KV writer during a term, which keeps apply
//! order equal to offset order and makes each entry apply exactly once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::commit_tracker::CommitTracker;
use crate::error::{Result, ShardError};
use crate::follower_cursor::FollowerCursor;
use crate::kv::{Db, DbFactory};
use crate::proto::{
    decode_write_request, encode_write_request, AddFollowerRequest, AddFollowerResponse,
    BecomeLeaderRequest, BecomeLeaderResponse, EntryId, Epoch, FenceRequest, FenceResponse,
    GetStatusResponse, LogEntry, Offset, ReadRequest, ReadResponse, ShardStatus, TruncateRequest,
    WriteRequest, WriteResponse, INVALID_OFFSET,
};
use crate::rpc::ReplicationClient;
use crate::wal::{Wal, WalFactory};

type PendingWrites =
    Arc<std::sync::Mutex<HashMap<Offset, oneshot::Sender<Result<WriteResponse>>>>>;

pub struct LeaderController {
    shard: u64,
    client: Arc<dyn ReplicationClient>,
    wal: Arc<dyn Wal>,
    db: Arc<dyn Db>,
    state: Mutex<ControllerState>,
}

struct ControllerState {
    epoch: Epoch,
    status: ShardStatus,
    term: Option<LeaderTerm>,
}

/// Everything scoped to one leadership term. Created by `become_leader`,
/// destroyed by fence/close/storage failure.
struct LeaderTerm {
    replication_factor: u32,
    tracker: Arc<CommitTracker>,
    cursors: HashMap<String, FollowerCursor>,
    pending: PendingWrites,
    applier: JoinHandle<()>,
    applier_shutdown: watch::Sender<bool>,
    healthy: Arc<AtomicBool>,
}

impl LeaderTerm {
    /// Stop cursors, the applier, and every waiting writer, in that order.
    /// Cursor teardown is awaited so a stale `AddEntry` cannot surface at a
    /// follower once the caller moves on to a new epoch.
    async fn shutdown(mut self) {
        for (_, cursor) in self.cursors.drain() {
            cursor.stop().await;
        }
        self.tracker.close();
        let _ = self.applier_shutdown.send(true);
        let _ = self.applier.await;
        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(|err| err.into_inner());
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(ShardError::InvalidStatus));
        }
    }
}

impl LeaderController {
    pub fn new(
        shard: u64,
        client: Arc<dyn ReplicationClient>,
        wal_factory: &dyn WalFactory,
        db_factory: &dyn DbFactory,
    ) -> Result<Self> {
        let wal = wal_factory.wal(shard)?;
        let db = db_factory.db(shard)?;
        let epoch = db.epoch()?;
        let controller = Self {
            shard,
            client,
            wal,
            db,
            state: Mutex::new(ControllerState {
                epoch,
                status: ShardStatus::NotMember,
                term: None,
            }),
        };
        controller.reconcile_db()?;
        info!(shard, epoch, "shard controller opened");
        Ok(controller)
    }

    pub async fn epoch(&self) -> Epoch {
        self.state.lock().await.epoch
    }

    pub async fn status(&self) -> ShardStatus {
        self.state.lock().await.status
    }

    pub async fn get_status(&self) -> GetStatusResponse {
        let state = self.state.lock().await;
        GetStatusResponse {
            epoch: state.epoch,
            status: state.status,
        }
    }

    /// Install a strictly greater epoch and sever the current term.
    ///
    /// After a successful fence the controller accepts no reads, writes, or
    /// follower changes until `become_leader` at the fenced epoch.
    pub async fn fence(&self, request: FenceRequest) -> Result<FenceResponse> {
        let mut state = self.state.lock().await;
        if request.epoch <= state.epoch {
            warn!(
                shard = self.shard,
                epoch = request.epoch,
                current = state.epoch,
                "rejecting fence with non-advancing epoch"
            );
            return Err(ShardError::InvalidEpoch);
        }

        // Term teardown strictly precedes persisting the new epoch.
        if let Some(term) = state.term.take() {
            term.shutdown().await;
        }
        self.db.update_epoch(request.epoch)?;
        state.epoch = request.epoch;
        state.status = ShardStatus::Fenced;
        let head_index = self.wal.head_index();
        info!(
            shard = self.shard,
            epoch = request.epoch,
            head_offset = head_index.offset,
            "fenced"
        );
        Ok(FenceResponse { head_index })
    }

    /// Start a leadership term at the fenced epoch.
    ///
    /// Before admitting writes: every locally durable log entry is applied to
    /// the KV (a write acked by a previous leader must be readable here), and
    /// each follower is rolled back to a log position consistent with ours.
    pub async fn become_leader(
        &self,
        request: BecomeLeaderRequest,
    ) -> Result<BecomeLeaderResponse> {
        let mut state = self.state.lock().await;
        if request.epoch != state.epoch || state.status != ShardStatus::Fenced {
            warn!(
                shard = self.shard,
                epoch = request.epoch,
                current = state.epoch,
                status = ?state.status,
                "rejecting become-leader"
            );
            return Err(ShardError::InvalidEpoch);
        }

        self.reconcile_db()?;
        let leader_head = self.wal.head_index();

        let mut follower_offsets = HashMap::with_capacity(request.follower_maps.len());
        let mut starts = HashMap::with_capacity(request.follower_maps.len());
        for (name, follower_head) in &request.follower_maps {
            let start = self
                .resolve_follower_start(request.epoch, name, *follower_head, leader_head)
                .await?;
            follower_offsets.insert(name.clone(), start - 1);
            starts.insert(name.clone(), start);
        }

        let tracker = Arc::new(CommitTracker::new(
            request.replication_factor,
            leader_head.offset,
            follower_offsets,
        ));
        let pending: PendingWrites = Arc::new(std::sync::Mutex::new(HashMap::new()));
        let healthy = Arc::new(AtomicBool::new(true));
        let (applier, applier_shutdown) = spawn_applier(
            self.shard,
            self.wal.clone(),
            self.db.clone(),
            tracker.clone(),
            pending.clone(),
            healthy.clone(),
        );

        let mut cursors = HashMap::with_capacity(starts.len());
        for (name, start) in starts {
            let cursor = FollowerCursor::start(
                name.clone(),
                request.epoch,
                start,
                self.client.clone(),
                self.wal.clone(),
                tracker.clone(),
            );
            cursors.insert(name, cursor);
        }

        info!(
            shard = self.shard,
            epoch = request.epoch,
            replication_factor = request.replication_factor,
            followers = cursors.len(),
            head_offset = leader_head.offset,
            "became leader"
        );
        state.term = Some(LeaderTerm {
            replication_factor: request.replication_factor,
            tracker,
            cursors,
            pending,
            applier,
            applier_shutdown,
            healthy,
        });
        state.status = ShardStatus::Leader;
        Ok(BecomeLeaderResponse::default())
    }

    /// Admit one more follower to the current term.
    pub async fn add_follower(&self, request: AddFollowerRequest) -> Result<AddFollowerResponse> {
        let mut state = self.state.lock().await;
        if request.epoch != state.epoch || state.status != ShardStatus::Leader {
            return Err(ShardError::InvalidEpoch);
        }
        let epoch = state.epoch;
        let leader_head = self.wal.head_index();
        let term = state.term.as_mut().ok_or(ShardError::InvalidStatus)?;
        if term.cursors.contains_key(&request.follower_name) {
            return Err(ShardError::AlreadyPresent(request.follower_name));
        }
        // The leader itself counts as one ensemble member.
        if term.cursors.len() + 1 >= term.replication_factor as usize {
            return Err(ShardError::EnsembleFull);
        }

        let start = self
            .resolve_follower_start(epoch, &request.follower_name, request.follower_head_index, leader_head)
            .await?;
        term.tracker.add_follower(&request.follower_name, start - 1);
        let cursor = FollowerCursor::start(
            request.follower_name.clone(),
            epoch,
            start,
            self.client.clone(),
            self.wal.clone(),
            term.tracker.clone(),
        );
        term.cursors.insert(request.follower_name.clone(), cursor);
        info!(
            shard = self.shard,
            epoch,
            follower = %request.follower_name,
            start_offset = start,
            "follower admitted"
        );
        Ok(AddFollowerResponse::default())
    }

    /// Append a mutation batch, wait for quorum commit, and return the
    /// per-mutation results produced when the entry is applied.
    pub async fn write(&self, request: WriteRequest) -> Result<WriteResponse> {
        let rx = {
            let mut state = self.state.lock().await;
            if state.status != ShardStatus::Leader {
                return Err(ShardError::InvalidStatus);
            }
            let epoch = state.epoch;
            let unhealthy = state
                .term
                .as_ref()
                .map(|term| !term.healthy.load(Ordering::Acquire))
                .unwrap_or(true);
            if unhealthy {
                return Err(self.fail_term(&mut state).await);
            }
            let term = state.term.as_ref().ok_or(ShardError::InvalidStatus)?;

            let offset = self.wal.head_index().offset + 1;
            let value = encode_write_request(&request);
            let (tx, rx) = oneshot::channel();
            term.pending
                .lock()
                .unwrap_or_else(|err| err.into_inner())
                .insert(offset, tx);

            if let Err(err) = self.wal.append(&LogEntry {
                epoch,
                offset,
                value,
            }) {
                term.pending
                    .lock()
                    .unwrap_or_else(|err| err.into_inner())
                    .remove(&offset);
                return Err(err.into());
            }
            term.tracker.update_leader(offset);
            rx
        };

        match rx.await {
            Ok(result) => result,
            // The term went away without answering; treat like an abort.
            Err(_) => Err(ShardError::InvalidStatus),
        }
    }

    /// Serve gets/lists from the committed KV state.
    pub async fn read(&self, request: ReadRequest) -> Result<ReadResponse> {
        {
            let mut state = self.state.lock().await;
            if state.status != ShardStatus::Leader {
                return Err(ShardError::InvalidStatus);
            }
            let unhealthy = state
                .term
                .as_ref()
                .map(|term| !term.healthy.load(Ordering::Acquire))
                .unwrap_or(true);
            if unhealthy {
                return Err(self.fail_term(&mut state).await);
            }
        }

        let mut response = ReadResponse::default();
        for get in &request.gets {
            response.gets.push(self.db.get(get)?);
        }
        for list in &request.lists {
            response.lists.push(self.db.list(list)?);
        }
        Ok(response)
    }

    /// Stop everything and release resources. Idempotent.
    pub async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(term) = state.term.take() {
            term.shutdown().await;
        }
        state.status = ShardStatus::NotMember;
        self.wal.close()?;
        self.db.close()?;
        Ok(())
    }

    /// Apply every locally durable log entry above the applied offset.
    fn reconcile_db(&self) -> Result<()> {
        let head = self.wal.head_index();
        if head.offset == INVALID_OFFSET {
            return Ok(());
        }
        let mut applied = self.db.applied_offset()?;
        while applied < head.offset {
            let next = applied + 1;
            let entry = self.wal.read(next)?.ok_or_else(|| {
                ShardError::Storage(anyhow::anyhow!("wal entry {next} missing during catch-up"))
            })?;
            let request = decode_write_request(&entry.value)?;
            self.db.apply(&request, next, unix_time_ms())?;
            applied = next;
        }
        Ok(())
    }

    /// Work out where a follower's replication stream must resume, telling
    /// the follower to truncate its log first when it has diverged from ours.
    async fn resolve_follower_start(
        &self,
        epoch: Epoch,
        name: &str,
        follower_head: EntryId,
        leader_head: EntryId,
    ) -> Result<Offset> {
        if follower_head.offset == INVALID_OFFSET {
            return Ok(0);
        }
        if leader_head.offset == INVALID_OFFSET || follower_head.offset > leader_head.offset {
            // The follower is ahead of everything we have; cut it back to our
            // head and resume from there.
            let response = self
                .client
                .truncate(
                    name,
                    TruncateRequest {
                        epoch,
                        head_index: leader_head,
                    },
                )
                .await?;
            return Ok(response.head_index.offset + 1);
        }

        let entry = self.wal.read(follower_head.offset)?.ok_or_else(|| {
            ShardError::Storage(anyhow::anyhow!(
                "wal entry {} missing during follower catch-up",
                follower_head.offset
            ))
        })?;
        if entry.epoch == follower_head.epoch {
            return Ok(follower_head.offset + 1);
        }

        // Diverged: roll the follower back to the newest offset we hold under
        // its head epoch, or to the very beginning when there is none.
        let mut target = EntryId::invalid();
        let mut offset = follower_head.offset - 1;
        while offset >= 0 {
            let candidate = self.wal.read(offset)?.ok_or_else(|| {
                ShardError::Storage(anyhow::anyhow!(
                    "wal entry {offset} missing during follower catch-up"
                ))
            })?;
            if candidate.epoch == follower_head.epoch {
                target = candidate.entry_id();
                break;
            }
            offset -= 1;
        }
        warn!(
            shard = self.shard,
            follower = %name,
            follower_epoch = follower_head.epoch,
            follower_offset = follower_head.offset,
            resume_offset = target.offset + 1,
            "follower log diverged, truncating"
        );
        let response = self
            .client
            .truncate(
                name,
                TruncateRequest {
                    epoch,
                    head_index: target,
                },
            )
            .await?;
        Ok(response.head_index.offset + 1)
    }

    /// Storage failed mid-term: tear the term down and step out of the
    /// ensemble so the coordinator can react.
    async fn fail_term(&self, state: &mut ControllerState) -> ShardError {
        if let Some(term) = state.term.take() {
            term.shutdown().await;
        }
        state.status = ShardStatus::NotMember;
        error!(shard = self.shard, "storage failure, controller stepped down");
        ShardError::Storage(anyhow::anyhow!("shard storage failed"))
    }
}

/// The term's single KV writer: applies committed entries in offset order and
/// answers the writers waiting on them.
fn spawn_applier(
    shard: u64,
    wal: Arc<dyn Wal>,
    db: Arc<dyn Db>,
    tracker: Arc<CommitTracker>,
    pending: PendingWrites,
    healthy: Arc<AtomicBool>,
) -> (JoinHandle<()>, watch::Sender<bool>) {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        let mut commit_rx = tracker.watch_commit();
        let mut applied = match db.applied_offset() {
            Ok(offset) => offset,
            Err(err) => {
                error!(shard, error = ?err, "applier failed reading applied offset");
                healthy.store(false, Ordering::Release);
                return;
            }
        };

        loop {
            let snapshot = *commit_rx.borrow_and_update();
            while applied < snapshot.offset {
                let next = applied + 1;
                match apply_one(wal.as_ref(), db.as_ref(), next) {
                    Ok(response) => {
                        applied = next;
                        let waiter = pending
                            .lock()
                            .unwrap_or_else(|err| err.into_inner())
                            .remove(&next);
                        if let Some(tx) = waiter {
                            let _ = tx.send(Ok(response));
                        }
                    }
                    Err(err) => {
                        error!(shard, offset = next, error = ?err, "apply failed, stopping applier");
                        healthy.store(false, Ordering::Release);
                        let mut pending =
                            pending.lock().unwrap_or_else(|err| err.into_inner());
                        for (_, tx) in pending.drain() {
                            let _ = tx.send(Err(ShardError::Storage(anyhow::anyhow!(
                                "apply failed at offset {next}"
                            ))));
                        }
                        return;
                    }
                }
            }
            if snapshot.closed {
                return;
            }
            tokio::select! {
                changed = commit_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return;
                    }
                }
            }
        }
    });
    (handle, shutdown_tx)
}

fn apply_one(wal: &dyn Wal, db: &dyn Db, offset: Offset) -> anyhow::Result<WriteResponse> {
    let entry = wal
        .read(offset)?
        .ok_or_else(|| anyhow::anyhow!("committed wal entry {offset} missing"))?;
    let request = decode_write_request(&entry.value)?;
    db.apply(&request, offset, unix_time_ms())
}

fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .min(u128::from(u64::MAX)) as u64
}
