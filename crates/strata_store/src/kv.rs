//! Shard key/value database on top of fjall.
//!
//! Each shard owns two partitions: `records_{shard}` for user keys and
//! `internal_{shard}` for reserved state (`epoch`, applied offset) that must
//! never collide with the user keyspace. A mutation batch is applied in one
//! fjall batch together with the applied-offset bump, so replaying the same
//! log entry after a crash is a no-op.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use anyhow::Context;
use bytes::Bytes;
use fjall::{Keyspace, PartitionCreateOptions, PersistMode};

use crate::proto::{
    read_i64, read_slice, read_u64, DeleteRangeResponse, DeleteResponse, GetRequest, GetResponse,
    ListRequest, ListResponse, Offset, PutResponse, Stat, Status, WriteRequest, WriteResponse,
    Epoch, INVALID_EPOCH, INVALID_OFFSET,
};

const KEY_EPOCH: &[u8] = b"epoch";
const KEY_APPLIED_OFFSET: &[u8] = b"applied-offset";

/// Storage surface the controller applies committed log entries to.
pub trait Db: Send + Sync + 'static {
    /// Shard epoch persisted across restarts (`INVALID_EPOCH` before first fence).
    fn epoch(&self) -> anyhow::Result<Epoch>;
    fn update_epoch(&self, epoch: Epoch) -> anyhow::Result<()>;
    /// Highest log offset whose mutations have been applied.
    fn applied_offset(&self) -> anyhow::Result<Offset>;
    /// Apply one decoded mutation batch atomically, recording `offset` as applied.
    fn apply(
        &self,
        request: &WriteRequest,
        offset: Offset,
        timestamp: u64,
    ) -> anyhow::Result<WriteResponse>;
    fn get(&self, request: &GetRequest) -> anyhow::Result<GetResponse>;
    fn list(&self, request: &ListRequest) -> anyhow::Result<ListResponse>;
    fn close(&self) -> anyhow::Result<()>;
}

pub trait DbFactory: Send + Sync + 'static {
    fn db(&self, shard: u64) -> anyhow::Result<Arc<dyn Db>>;
}

#[derive(Clone, Debug)]
struct Record {
    payload: Bytes,
    stat: Stat,
}

/// Fjall-backed shard database.
pub struct FjallDb {
    keyspace: Arc<Keyspace>,
    records: fjall::PartitionHandle,
    internal: fjall::PartitionHandle,
    lock: RwLock<()>,
}

impl FjallDb {
    pub fn open_shard(keyspace: Arc<Keyspace>, shard: u64) -> anyhow::Result<Self> {
        let records = keyspace
            .open_partition(&format!("records_{shard}"), PartitionCreateOptions::default())?;
        let internal = keyspace
            .open_partition(&format!("internal_{shard}"), PartitionCreateOptions::default())?;
        Ok(Self {
            keyspace,
            records,
            internal,
            lock: RwLock::new(()),
        })
    }

    fn read_internal_i64(&self, key: &[u8], default: i64) -> anyhow::Result<i64> {
        match self.internal.get(key)? {
            Some(bytes) => {
                let mut offset = 0usize;
                read_i64(&bytes, &mut offset)
            }
            None => Ok(default),
        }
    }

    /// Latest record for `key`, reading through the in-flight batch overlay.
    fn current(
        &self,
        overlay: &BTreeMap<String, Option<Record>>,
        key: &str,
    ) -> anyhow::Result<Option<Record>> {
        if let Some(staged) = overlay.get(key) {
            return Ok(staged.clone());
        }
        match self.records.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(decode_record(&bytes)?)),
            None => Ok(None),
        }
    }

    fn apply_put(
        &self,
        batch: &mut fjall::Batch,
        overlay: &mut BTreeMap<String, Option<Record>>,
        put: &crate::proto::PutRequest,
        timestamp: u64,
    ) -> anyhow::Result<PutResponse> {
        let current = self.current(overlay, &put.key)?;
        if !version_matches(put.expected_version, current.as_ref()) {
            return Ok(PutResponse {
                status: Status::UnexpectedVersion,
                stat: None,
            });
        }
        let stat = match current {
            Some(existing) => Stat {
                version: existing.stat.version + 1,
                created_ts: existing.stat.created_ts,
                modified_ts: timestamp,
            },
            None => Stat {
                version: 0,
                created_ts: timestamp,
                modified_ts: timestamp,
            },
        };
        let record = Record {
            payload: put.payload.clone(),
            stat,
        };
        batch.insert(&self.records, put.key.as_bytes(), encode_record(&record));
        overlay.insert(put.key.clone(), Some(record));
        Ok(PutResponse {
            status: Status::Ok,
            stat: Some(stat),
        })
    }

    fn apply_delete(
        &self,
        batch: &mut fjall::Batch,
        overlay: &mut BTreeMap<String, Option<Record>>,
        delete: &crate::proto::DeleteRequest,
    ) -> anyhow::Result<DeleteResponse> {
        let current = self.current(overlay, &delete.key)?;
        if current.is_none() {
            return Ok(DeleteResponse {
                status: Status::KeyNotFound,
            });
        }
        if !version_matches(delete.expected_version, current.as_ref()) {
            return Ok(DeleteResponse {
                status: Status::UnexpectedVersion,
            });
        }
        batch.remove(&self.records, delete.key.as_bytes());
        overlay.insert(delete.key.clone(), None);
        Ok(DeleteResponse { status: Status::Ok })
    }

    fn apply_delete_range(
        &self,
        batch: &mut fjall::Batch,
        overlay: &mut BTreeMap<String, Option<Record>>,
        range: &crate::proto::DeleteRangeRequest,
    ) -> anyhow::Result<DeleteRangeResponse> {
        // Half-open interval: an empty or inverted range removes nothing.
        if range.key_min >= range.key_max {
            return Ok(DeleteRangeResponse { status: Status::Ok });
        }
        let mut doomed: Vec<String> = Vec::new();
        for item in self
            .records
            .range(range.key_min.as_bytes()..range.key_max.as_bytes())
        {
            let (key, _) = item?;
            let key = decode_key(&key)?;
            // Overlay state wins over what is on disk.
            if !overlay.contains_key(&key) {
                doomed.push(key);
            }
        }
        let staged: Vec<String> = overlay
            .range(range.key_min.clone()..range.key_max.clone())
            .filter(|(_, record)| record.is_some())
            .map(|(key, _)| key.clone())
            .collect();
        doomed.extend(staged);

        for key in doomed {
            batch.remove(&self.records, key.as_bytes());
            overlay.insert(key, None);
        }
        // No removed-count in the response; a range delete that matched
        // nothing is still a success.
        Ok(DeleteRangeResponse { status: Status::Ok })
    }
}

impl Db for FjallDb {
    fn epoch(&self) -> anyhow::Result<Epoch> {
        self.read_internal_i64(KEY_EPOCH, INVALID_EPOCH)
    }

    fn update_epoch(&self, epoch: Epoch) -> anyhow::Result<()> {
        let _guard = write_guard(&self.lock);
        self.internal.insert(KEY_EPOCH, epoch.to_be_bytes())?;
        self.keyspace
            .persist(PersistMode::SyncAll)
            .context("persist epoch")?;
        Ok(())
    }

    fn applied_offset(&self) -> anyhow::Result<Offset> {
        self.read_internal_i64(KEY_APPLIED_OFFSET, INVALID_OFFSET)
    }

    fn apply(
        &self,
        request: &WriteRequest,
        offset: Offset,
        timestamp: u64,
    ) -> anyhow::Result<WriteResponse> {
        let _guard = write_guard(&self.lock);
        let mut batch = self.keyspace.batch();
        let mut overlay: BTreeMap<String, Option<Record>> = BTreeMap::new();
        let mut response = WriteResponse::default();

        for put in &request.puts {
            response
                .puts
                .push(self.apply_put(&mut batch, &mut overlay, put, timestamp)?);
        }
        for delete in &request.deletes {
            response
                .deletes
                .push(self.apply_delete(&mut batch, &mut overlay, delete)?);
        }
        for range in &request.delete_ranges {
            response
                .delete_ranges
                .push(self.apply_delete_range(&mut batch, &mut overlay, range)?);
        }

        batch.insert(&self.internal, KEY_APPLIED_OFFSET, offset.to_be_bytes());
        batch.commit().context("commit kv batch")?;
        Ok(response)
    }

    fn get(&self, request: &GetRequest) -> anyhow::Result<GetResponse> {
        let _guard = read_guard(&self.lock);
        match self.records.get(request.key.as_bytes())? {
            Some(bytes) => {
                let record = decode_record(&bytes)?;
                Ok(GetResponse {
                    status: Status::Ok,
                    payload: request.include_payload.then(|| record.payload.clone()),
                    stat: Some(record.stat),
                })
            }
            None => Ok(GetResponse {
                status: Status::KeyNotFound,
                payload: None,
                stat: None,
            }),
        }
    }

    fn list(&self, request: &ListRequest) -> anyhow::Result<ListResponse> {
        let _guard = read_guard(&self.lock);
        if request.key_min >= request.key_max {
            return Ok(ListResponse { keys: Vec::new() });
        }
        let mut keys = Vec::new();
        for item in self
            .records
            .range(request.key_min.as_bytes()..request.key_max.as_bytes())
        {
            let (key, _) = item?;
            keys.push(decode_key(&key)?);
        }
        Ok(ListResponse { keys })
    }

    fn close(&self) -> anyhow::Result<()> {
        self.keyspace
            .persist(PersistMode::SyncAll)
            .context("persist keyspace on close")?;
        Ok(())
    }
}

/// Factory sharing one fjall keyspace across shard databases.
pub struct FjallDbFactory {
    keyspace: Arc<Keyspace>,
}

impl FjallDbFactory {
    pub fn new(keyspace: Arc<Keyspace>) -> Self {
        Self { keyspace }
    }

    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let keyspace = fjall::Config::new(path)
            .open()
            .context("open fjall keyspace")?;
        Ok(Self {
            keyspace: Arc::new(keyspace),
        })
    }
}

impl DbFactory for FjallDbFactory {
    fn db(&self, shard: u64) -> anyhow::Result<Arc<dyn Db>> {
        Ok(Arc::new(FjallDb::open_shard(self.keyspace.clone(), shard)?))
    }
}

fn version_matches(expected: Option<i64>, current: Option<&Record>) -> bool {
    match expected {
        None => true,
        // -1 means the key must not exist yet.
        Some(-1) => current.is_none(),
        Some(version) => current
            .map(|record| record.stat.version == version)
            .unwrap_or(false),
    }
}

fn write_guard(lock: &RwLock<()>) -> std::sync::RwLockWriteGuard<'_, ()> {
    lock.write().unwrap_or_else(|err| err.into_inner())
}

fn read_guard(lock: &RwLock<()>) -> std::sync::RwLockReadGuard<'_, ()> {
    lock.read().unwrap_or_else(|err| err.into_inner())
}

fn decode_key(raw: &[u8]) -> anyhow::Result<String> {
    String::from_utf8(raw.to_vec()).map_err(|_| anyhow::anyhow!("non utf-8 record key"))
}

fn encode_record(record: &Record) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + 8 + 8 + 4 + record.payload.len());
    out.extend_from_slice(&record.stat.version.to_be_bytes());
    out.extend_from_slice(&record.stat.created_ts.to_be_bytes());
    out.extend_from_slice(&record.stat.modified_ts.to_be_bytes());
    out.extend_from_slice(&(record.payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&record.payload);
    out
}

fn decode_record(data: &[u8]) -> anyhow::Result<Record> {
    let mut offset = 0usize;
    let version = read_i64(data, &mut offset)?;
    let created_ts = read_u64(data, &mut offset)?;
    let modified_ts = read_u64(data, &mut offset)?;
    let payload = read_slice(data, &mut offset)?;
    Ok(Record {
        payload: Bytes::from(payload),
        stat: Stat {
            version,
            created_ts,
            modified_ts,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{DeleteRangeRequest, DeleteRequest, PutRequest};

    fn open_db() -> (tempfile::TempDir, Arc<dyn Db>) {
        let dir = tempfile::tempdir().unwrap();
        let factory = FjallDbFactory::open(dir.path()).unwrap();
        let db = factory.db(1).unwrap();
        (dir, db)
    }

    fn put(key: &str, payload: &[u8]) -> PutRequest {
        PutRequest {
            key: key.to_string(),
            payload: Bytes::copy_from_slice(payload),
            expected_version: None,
        }
    }

    fn write_one(db: &Arc<dyn Db>, offset: Offset, request: WriteRequest) -> WriteResponse {
        db.apply(&request, offset, 1_000).unwrap()
    }

    #[test]
    fn put_versions_increment_from_zero() {
        let (_dir, db) = open_db();

        let resp = write_one(
            &db,
            0,
            WriteRequest {
                puts: vec![put("a", b"v0")],
                ..Default::default()
            },
        );
        assert_eq!(resp.puts[0].status, Status::Ok);
        assert_eq!(resp.puts[0].stat.unwrap().version, 0);

        let resp = write_one(
            &db,
            1,
            WriteRequest {
                puts: vec![put("a", b"v1")],
                ..Default::default()
            },
        );
        assert_eq!(resp.puts[0].stat.unwrap().version, 1);
        assert_eq!(db.applied_offset().unwrap(), 1);
    }

    #[test]
    fn expected_version_checks() {
        let (_dir, db) = open_db();
        write_one(
            &db,
            0,
            WriteRequest {
                puts: vec![put("a", b"v0")],
                ..Default::default()
            },
        );

        // Must-not-exist fails on an existing key.
        let resp = write_one(
            &db,
            1,
            WriteRequest {
                puts: vec![PutRequest {
                    expected_version: Some(-1),
                    ..put("a", b"clobber")
                }],
                ..Default::default()
            },
        );
        assert_eq!(resp.puts[0].status, Status::UnexpectedVersion);

        // Wrong version fails, right version succeeds.
        let resp = write_one(
            &db,
            2,
            WriteRequest {
                puts: vec![
                    PutRequest {
                        expected_version: Some(5),
                        ..put("a", b"nope")
                    },
                    PutRequest {
                        expected_version: Some(0),
                        ..put("a", b"yes")
                    },
                ],
                ..Default::default()
            },
        );
        assert_eq!(resp.puts[0].status, Status::UnexpectedVersion);
        assert_eq!(resp.puts[1].status, Status::Ok);
        assert_eq!(resp.puts[1].stat.unwrap().version, 1);
    }

    #[test]
    fn delete_semantics() {
        let (_dir, db) = open_db();
        write_one(
            &db,
            0,
            WriteRequest {
                puts: vec![put("a", b"v")],
                ..Default::default()
            },
        );

        let resp = write_one(
            &db,
            1,
            WriteRequest {
                deletes: vec![
                    DeleteRequest {
                        key: "missing".to_string(),
                        expected_version: None,
                    },
                    DeleteRequest {
                        key: "a".to_string(),
                        expected_version: Some(7),
                    },
                    DeleteRequest {
                        key: "a".to_string(),
                        expected_version: Some(0),
                    },
                ],
                ..Default::default()
            },
        );
        assert_eq!(resp.deletes[0].status, Status::KeyNotFound);
        assert_eq!(resp.deletes[1].status, Status::UnexpectedVersion);
        assert_eq!(resp.deletes[2].status, Status::Ok);

        let get = db
            .get(&GetRequest {
                key: "a".to_string(),
                include_payload: false,
            })
            .unwrap();
        assert_eq!(get.status, Status::KeyNotFound);
    }

    #[test]
    fn delete_range_is_half_open() {
        let (_dir, db) = open_db();
        write_one(
            &db,
            0,
            WriteRequest {
                puts: vec![put("a", b"1"), put("b", b"2"), put("c", b"3"), put("d", b"4")],
                ..Default::default()
            },
        );

        write_one(
            &db,
            1,
            WriteRequest {
                delete_ranges: vec![DeleteRangeRequest {
                    key_min: "b".to_string(),
                    key_max: "d".to_string(),
                }],
                ..Default::default()
            },
        );

        let list = db
            .list(&ListRequest {
                key_min: "a".to_string(),
                key_max: "z".to_string(),
            })
            .unwrap();
        assert_eq!(list.keys, vec!["a".to_string(), "d".to_string()]);
    }

    #[test]
    fn batch_reads_through_its_own_writes() {
        let (_dir, db) = open_db();
        // One batch: create key then delete it through a range; the delete
        // must observe the put staged earlier in the same batch.
        let resp = write_one(
            &db,
            0,
            WriteRequest {
                puts: vec![put("k1", b"v")],
                delete_ranges: vec![DeleteRangeRequest {
                    key_min: "k0".to_string(),
                    key_max: "k9".to_string(),
                }],
                ..Default::default()
            },
        );
        assert_eq!(resp.puts[0].status, Status::Ok);

        let get = db
            .get(&GetRequest {
                key: "k1".to_string(),
                include_payload: false,
            })
            .unwrap();
        assert_eq!(get.status, Status::KeyNotFound);
    }

    #[test]
    fn epoch_and_applied_offset_persist() {
        let dir = tempfile::tempdir().unwrap();
        let factory = FjallDbFactory::open(dir.path()).unwrap();
        {
            let db = factory.db(1).unwrap();
            assert_eq!(db.epoch().unwrap(), INVALID_EPOCH);
            assert_eq!(db.applied_offset().unwrap(), INVALID_OFFSET);
            db.update_epoch(5).unwrap();
            write_one(
                &db,
                0,
                WriteRequest {
                    puts: vec![put("a", b"v")],
                    ..Default::default()
                },
            );
            db.close().unwrap();
        }
        let db = factory.db(1).unwrap();
        assert_eq!(db.epoch().unwrap(), 5);
        assert_eq!(db.applied_offset().unwrap(), 0);
    }
}
