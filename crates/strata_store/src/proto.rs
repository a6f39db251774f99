//! Wire-level types shared by the controller, replication, and storage layers.
//!
//! These types are kept in a small, dependency-light module because they are
//! used by the state machine, the transport contracts, and the storage
//! encode/decode paths alike. Offsets and epochs are 64-bit signed with `-1`
//! sentinels on the wire; in-memory code distinguishes "absent" from zero
//! through those sentinels explicitly.

use std::collections::HashMap;

use bytes::Bytes;
use serde::Serialize;

/// Leadership term identifier. Strictly increasing per shard.
pub type Epoch = i64;
/// Position of an entry in a shard's log. Dense from 0.
pub type Offset = i64;

pub const INVALID_EPOCH: Epoch = -1;
pub const INVALID_OFFSET: Offset = -1;

/// Identifies a log position across epochs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct EntryId {
    pub epoch: Epoch,
    pub offset: Offset,
}

impl EntryId {
    pub const fn invalid() -> Self {
        Self {
            epoch: INVALID_EPOCH,
            offset: INVALID_OFFSET,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.epoch != INVALID_EPOCH && self.offset != INVALID_OFFSET
    }
}

/// One durable log record: the epoch that wrote it, its offset, and the
/// serialized mutation batch it carries.
#[derive(Clone, Debug, PartialEq)]
pub struct LogEntry {
    pub epoch: Epoch,
    pub offset: Offset,
    pub value: Bytes,
}

impl LogEntry {
    pub fn entry_id(&self) -> EntryId {
        EntryId {
            epoch: self.epoch,
            offset: self.offset,
        }
    }
}

/// Wire-level status codes, also used per-mutation inside batched responses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Status {
    Ok,
    UnexpectedVersion,
    KeyNotFound,
    InvalidEpoch,
    InvalidStatus,
}

/// Controller membership state for one shard.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ShardStatus {
    NotMember,
    Fenced,
    Leader,
    Follower,
}

/// Per-key metadata returned alongside reads and successful writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Stat {
    pub version: i64,
    pub created_ts: u64,
    pub modified_ts: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PutRequest {
    pub key: String,
    pub payload: Bytes,
    /// `None` skips the check; `-1` requires the key to not exist yet.
    pub expected_version: Option<i64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DeleteRequest {
    pub key: String,
    pub expected_version: Option<i64>,
}

/// Removes all keys in the half-open interval `[key_min, key_max)`.
#[derive(Clone, Debug, PartialEq)]
pub struct DeleteRangeRequest {
    pub key_min: String,
    pub key_max: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct GetRequest {
    pub key: String,
    pub include_payload: bool,
}

/// Lists keys in the half-open interval `[key_min, key_max)`, ascending.
#[derive(Clone, Debug, PartialEq)]
pub struct ListRequest {
    pub key_min: String,
    pub key_max: String,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct WriteRequest {
    pub shard_id: Option<u64>,
    pub puts: Vec<PutRequest>,
    pub deletes: Vec<DeleteRequest>,
    pub delete_ranges: Vec<DeleteRangeRequest>,
}

#[derive(Clone, Debug, Default)]
pub struct ReadRequest {
    pub shard_id: Option<u64>,
    pub gets: Vec<GetRequest>,
    pub lists: Vec<ListRequest>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PutResponse {
    pub status: Status,
    pub stat: Option<Stat>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DeleteResponse {
    pub status: Status,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DeleteRangeResponse {
    pub status: Status,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct WriteResponse {
    pub puts: Vec<PutResponse>,
    pub deletes: Vec<DeleteResponse>,
    pub delete_ranges: Vec<DeleteRangeResponse>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct GetResponse {
    pub status: Status,
    pub payload: Option<Bytes>,
    pub stat: Option<Stat>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ListResponse {
    pub keys: Vec<String>,
}

#[derive(Clone, Debug, Default)]
pub struct ReadResponse {
    pub gets: Vec<GetResponse>,
    pub lists: Vec<ListResponse>,
}

// Coordinator-facing requests.

#[derive(Clone, Debug)]
pub struct FenceRequest {
    pub shard_id: u64,
    pub epoch: Epoch,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FenceResponse {
    pub head_index: EntryId,
}

#[derive(Clone, Debug)]
pub struct BecomeLeaderRequest {
    pub shard_id: u64,
    pub epoch: Epoch,
    pub replication_factor: u32,
    /// Follower name to the head index that follower reported at fencing time.
    pub follower_maps: HashMap<String, EntryId>,
}

#[derive(Clone, Debug, Default)]
pub struct BecomeLeaderResponse {}

#[derive(Clone, Debug)]
pub struct AddFollowerRequest {
    pub shard_id: u64,
    pub epoch: Epoch,
    pub follower_name: String,
    pub follower_head_index: EntryId,
}

#[derive(Clone, Debug, Default)]
pub struct AddFollowerResponse {}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct GetStatusResponse {
    pub epoch: Epoch,
    pub status: ShardStatus,
}

// Follower-facing requests (sent by the leader).

#[derive(Clone, Debug)]
pub struct AddEntryRequest {
    pub epoch: Epoch,
    pub entry: LogEntry,
    pub commit_offset: Offset,
}

#[derive(Clone, Debug)]
pub struct AddEntryResponse {
    /// Offset the follower has durably persisted.
    pub offset: Offset,
}

#[derive(Clone, Debug)]
pub struct TruncateRequest {
    pub epoch: Epoch,
    pub head_index: EntryId,
}

#[derive(Clone, Debug)]
pub struct TruncateResponse {
    pub head_index: EntryId,
}

/// Serialize a mutation batch into the opaque value carried by a log entry.
pub fn encode_write_request(request: &WriteRequest) -> Bytes {
    let mut out = Vec::with_capacity(64);
    match request.shard_id {
        Some(shard) => {
            out.push(1);
            out.extend_from_slice(&shard.to_be_bytes());
        }
        None => out.push(0),
    }

    out.extend_from_slice(&(request.puts.len() as u32).to_be_bytes());
    for put in &request.puts {
        write_str(&mut out, &put.key);
        write_slice(&mut out, &put.payload);
        write_opt_i64(&mut out, put.expected_version);
    }

    out.extend_from_slice(&(request.deletes.len() as u32).to_be_bytes());
    for delete in &request.deletes {
        write_str(&mut out, &delete.key);
        write_opt_i64(&mut out, delete.expected_version);
    }

    out.extend_from_slice(&(request.delete_ranges.len() as u32).to_be_bytes());
    for range in &request.delete_ranges {
        write_str(&mut out, &range.key_min);
        write_str(&mut out, &range.key_max);
    }

    Bytes::from(out)
}

/// Decode the mutation batch carried by a log entry value.
pub fn decode_write_request(data: &[u8]) -> anyhow::Result<WriteRequest> {
    let mut offset = 0usize;
    let shard_id = match read_u8(data, &mut offset)? {
        0 => None,
        _ => Some(read_u64(data, &mut offset)?),
    };

    let put_count = read_u32(data, &mut offset)? as usize;
    let mut puts = Vec::with_capacity(put_count);
    for _ in 0..put_count {
        let key = read_string(data, &mut offset)?;
        let payload = read_slice(data, &mut offset)?;
        let expected_version = read_opt_i64(data, &mut offset)?;
        puts.push(PutRequest {
            key,
            payload: Bytes::from(payload),
            expected_version,
        });
    }

    let delete_count = read_u32(data, &mut offset)? as usize;
    let mut deletes = Vec::with_capacity(delete_count);
    for _ in 0..delete_count {
        let key = read_string(data, &mut offset)?;
        let expected_version = read_opt_i64(data, &mut offset)?;
        deletes.push(DeleteRequest {
            key,
            expected_version,
        });
    }

    let range_count = read_u32(data, &mut offset)? as usize;
    let mut delete_ranges = Vec::with_capacity(range_count);
    for _ in 0..range_count {
        let key_min = read_string(data, &mut offset)?;
        let key_max = read_string(data, &mut offset)?;
        delete_ranges.push(DeleteRangeRequest { key_min, key_max });
    }

    Ok(WriteRequest {
        shard_id,
        puts,
        deletes,
        delete_ranges,
    })
}

fn write_str(out: &mut Vec<u8>, value: &str) {
    out.extend_from_slice(&(value.len() as u32).to_be_bytes());
    out.extend_from_slice(value.as_bytes());
}

fn write_slice(out: &mut Vec<u8>, value: &[u8]) {
    out.extend_from_slice(&(value.len() as u32).to_be_bytes());
    out.extend_from_slice(value);
}

fn write_opt_i64(out: &mut Vec<u8>, value: Option<i64>) {
    match value {
        Some(v) => {
            out.push(1);
            out.extend_from_slice(&v.to_be_bytes());
        }
        None => out.push(0),
    }
}

pub(crate) fn read_u8(data: &[u8], offset: &mut usize) -> anyhow::Result<u8> {
    anyhow::ensure!(*offset + 1 <= data.len(), "short u8");
    let out = data[*offset];
    *offset += 1;
    Ok(out)
}

pub(crate) fn read_u32(data: &[u8], offset: &mut usize) -> anyhow::Result<u32> {
    anyhow::ensure!(*offset + 4 <= data.len(), "short u32");
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[*offset..*offset + 4]);
    *offset += 4;
    Ok(u32::from_be_bytes(buf))
}

pub(crate) fn read_u64(data: &[u8], offset: &mut usize) -> anyhow::Result<u64> {
    anyhow::ensure!(*offset + 8 <= data.len(), "short u64");
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[*offset..*offset + 8]);
    *offset += 8;
    Ok(u64::from_be_bytes(buf))
}

pub(crate) fn read_i64(data: &[u8], offset: &mut usize) -> anyhow::Result<i64> {
    anyhow::ensure!(*offset + 8 <= data.len(), "short i64");
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[*offset..*offset + 8]);
    *offset += 8;
    Ok(i64::from_be_bytes(buf))
}

fn read_opt_i64(data: &[u8], offset: &mut usize) -> anyhow::Result<Option<i64>> {
    match read_u8(data, offset)? {
        0 => Ok(None),
        _ => Ok(Some(read_i64(data, offset)?)),
    }
}

pub(crate) fn read_slice(data: &[u8], offset: &mut usize) -> anyhow::Result<Vec<u8>> {
    let len = read_u32(data, offset)? as usize;
    anyhow::ensure!(*offset + len <= data.len(), "short slice");
    let out = data[*offset..*offset + len].to_vec();
    *offset += len;
    Ok(out)
}

fn read_string(data: &[u8], offset: &mut usize) -> anyhow::Result<String> {
    let raw = read_slice(data, offset)?;
    String::from_utf8(raw).map_err(|_| anyhow::anyhow!("invalid utf-8 key"))
}
