//! Shared helpers for integration tests.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use strata_store::kv::FjallDbFactory;
use strata_store::proto::{
    AddEntryRequest, AddEntryResponse, TruncateRequest, TruncateResponse,
};
use strata_store::rpc::ReplicationClient;

/// Channel-backed replication client: the leader's outbound calls surface as
/// requests on the handle, and the test decides when and how to answer.
pub struct MockReplicationClient {
    add_entry_reqs: mpsc::UnboundedSender<AddEntryRequest>,
    add_entry_resps: Mutex<mpsc::UnboundedReceiver<AddEntryResponse>>,
    truncate_reqs: mpsc::UnboundedSender<TruncateRequest>,
    truncate_resps: Mutex<mpsc::UnboundedReceiver<TruncateResponse>>,
}

/// Test side of the mock: consume requests, feed responses.
pub struct MockRpcHandle {
    pub add_entry_reqs: mpsc::UnboundedReceiver<AddEntryRequest>,
    pub add_entry_resps: mpsc::UnboundedSender<AddEntryResponse>,
    pub truncate_reqs: mpsc::UnboundedReceiver<TruncateRequest>,
    pub truncate_resps: mpsc::UnboundedSender<TruncateResponse>,
}

pub fn mock_rpc_client() -> (Arc<MockReplicationClient>, MockRpcHandle) {
    let (add_req_tx, add_req_rx) = mpsc::unbounded_channel();
    let (add_resp_tx, add_resp_rx) = mpsc::unbounded_channel();
    let (trunc_req_tx, trunc_req_rx) = mpsc::unbounded_channel();
    let (trunc_resp_tx, trunc_resp_rx) = mpsc::unbounded_channel();

    let client = Arc::new(MockReplicationClient {
        add_entry_reqs: add_req_tx,
        add_entry_resps: Mutex::new(add_resp_rx),
        truncate_reqs: trunc_req_tx,
        truncate_resps: Mutex::new(trunc_resp_rx),
    });
    let handle = MockRpcHandle {
        add_entry_reqs: add_req_rx,
        add_entry_resps: add_resp_tx,
        truncate_reqs: trunc_req_rx,
        truncate_resps: trunc_resp_tx,
    };
    (client, handle)
}

#[async_trait]
impl ReplicationClient for MockReplicationClient {
    async fn add_entry(
        &self,
        _follower: &str,
        request: AddEntryRequest,
    ) -> anyhow::Result<AddEntryResponse> {
        self.add_entry_reqs
            .send(request)
            .map_err(|_| anyhow::anyhow!("mock rpc closed"))?;
        let mut resps = self.add_entry_resps.lock().await;
        resps
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("mock rpc closed"))
    }

    async fn truncate(
        &self,
        _follower: &str,
        request: TruncateRequest,
    ) -> anyhow::Result<TruncateResponse> {
        self.truncate_reqs
            .send(request)
            .map_err(|_| anyhow::anyhow!("mock rpc closed"))?;
        let mut resps = self.truncate_resps.lock().await;
        resps
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("mock rpc closed"))
    }
}

/// Ack every `AddEntry` with the offset it carried and answer every
/// `Truncate` with the head index it asked for. Runs until the mock closes.
pub fn auto_ack(handle: MockRpcHandle) -> JoinHandle<()> {
    let MockRpcHandle {
        mut add_entry_reqs,
        add_entry_resps,
        mut truncate_reqs,
        truncate_resps,
    } = handle;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                request = add_entry_reqs.recv() => {
                    let Some(request) = request else { return };
                    let response = AddEntryResponse {
                        offset: request.entry.offset,
                    };
                    if add_entry_resps.send(response).is_err() {
                        return;
                    }
                }
                request = truncate_reqs.recv() => {
                    let Some(request) = request else { return };
                    let response = TruncateResponse {
                        head_index: request.head_index,
                    };
                    if truncate_resps.send(response).is_err() {
                        return;
                    }
                }
            }
        }
    })
}

pub fn test_db_factory() -> (tempfile::TempDir, FjallDbFactory) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let factory = FjallDbFactory::open(dir.path()).expect("open fjall keyspace");
    (dir, factory)
}
