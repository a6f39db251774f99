//! Transport contracts and the node-level dispatcher.
//!
//! The store is transport-agnostic: the leader talks to followers through
//! the `ReplicationClient` trait, and coordinator/client calls reach a shard
//! through the `Node` dispatcher. Concrete wire adapters (gRPC or otherwise)
//! wrap these seams; test harnesses plug in channel-backed mocks.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::controller::LeaderController;
use crate::error::{Result, ShardError};
use crate::kv::DbFactory;
use crate::proto::{
    AddEntryRequest, AddEntryResponse, AddFollowerRequest, AddFollowerResponse,
    BecomeLeaderRequest, BecomeLeaderResponse, FenceRequest, FenceResponse, GetStatusResponse,
    ReadRequest, ReadResponse, TruncateRequest, TruncateResponse, WriteRequest, WriteResponse,
};
use crate::wal::WalFactory;

/// Leader-to-follower RPC surface.
#[async_trait]
pub trait ReplicationClient: Send + Sync + 'static {
    async fn add_entry(
        &self,
        follower: &str,
        request: AddEntryRequest,
    ) -> anyhow::Result<AddEntryResponse>;

    async fn truncate(
        &self,
        follower: &str,
        request: TruncateRequest,
    ) -> anyhow::Result<TruncateResponse>;
}

/// Client for deployments with no follower transport wired (single-replica
/// shards). Any attempt to replicate is an error.
pub struct DisconnectedClient;

#[async_trait]
impl ReplicationClient for DisconnectedClient {
    async fn add_entry(
        &self,
        follower: &str,
        _request: AddEntryRequest,
    ) -> anyhow::Result<AddEntryResponse> {
        anyhow::bail!("no follower transport configured (tried to reach {follower})")
    }

    async fn truncate(
        &self,
        follower: &str,
        _request: TruncateRequest,
    ) -> anyhow::Result<TruncateResponse> {
        anyhow::bail!("no follower transport configured (tried to reach {follower})")
    }
}

#[derive(Serialize)]
struct ShardSnapshot {
    shard: u64,
    epoch: i64,
    status: crate::proto::ShardStatus,
}

/// Owns the per-shard controllers of one node and routes RPCs to them.
pub struct Node {
    controllers: HashMap<u64, Arc<LeaderController>>,
}

impl Node {
    pub fn new(
        shards: &[u64],
        client: Arc<dyn ReplicationClient>,
        wal_factory: &dyn WalFactory,
        db_factory: &dyn DbFactory,
    ) -> Result<Self> {
        let mut controllers = HashMap::with_capacity(shards.len());
        for &shard in shards {
            let controller =
                LeaderController::new(shard, client.clone(), wal_factory, db_factory)?;
            controllers.insert(shard, Arc::new(controller));
        }
        Ok(Self { controllers })
    }

    pub fn shard(&self, shard: u64) -> Result<&Arc<LeaderController>> {
        self.controllers
            .get(&shard)
            .ok_or(ShardError::UnknownShard(shard))
    }

    pub async fn fence(&self, request: FenceRequest) -> Result<FenceResponse> {
        self.shard(request.shard_id)?.fence(request).await
    }

    pub async fn become_leader(
        &self,
        request: BecomeLeaderRequest,
    ) -> Result<BecomeLeaderResponse> {
        self.shard(request.shard_id)?.become_leader(request).await
    }

    pub async fn add_follower(&self, request: AddFollowerRequest) -> Result<AddFollowerResponse> {
        self.shard(request.shard_id)?.add_follower(request).await
    }

    pub async fn get_status(&self, shard: u64) -> Result<GetStatusResponse> {
        Ok(self.shard(shard)?.get_status().await)
    }

    pub async fn write(&self, request: WriteRequest) -> Result<WriteResponse> {
        let shard = request.shard_id.ok_or(ShardError::InvalidStatus)?;
        self.shard(shard)?.write(request).await
    }

    pub async fn read(&self, request: ReadRequest) -> Result<ReadResponse> {
        let shard = request.shard_id.ok_or(ShardError::InvalidStatus)?;
        self.shard(shard)?.read(request).await
    }

    pub async fn close(&self) -> Result<()> {
        for controller in self.controllers.values() {
            controller.close().await?;
        }
        Ok(())
    }

    /// Human-facing JSON snapshot of every shard's epoch and status.
    pub async fn status_json(&self) -> anyhow::Result<String> {
        let mut shards = Vec::with_capacity(self.controllers.len());
        for (&shard, controller) in &self.controllers {
            let status = controller.get_status().await;
            shards.push(ShardSnapshot {
                shard,
                epoch: status.epoch,
                status: status.status,
            });
        }
        shards.sort_by_key(|snapshot| snapshot.shard);
        Ok(serde_json::to_string(&shards)?)
    }
}
