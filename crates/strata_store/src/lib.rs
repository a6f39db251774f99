//! Strata: a sharded, replicated, strongly-consistent key/value store node.
//!
//! Each shard is served by at most one leader per epoch. The leader owns the
//! shard's write-ahead log and key/value database, replicates log entries to
//! followers through per-follower cursors, advances a quorum commit offset,
//! and serves client reads and writes against committed state. Leadership
//! hand-off is coordinated externally through fence/become-leader calls.

pub mod commit_tracker;
pub mod controller;
pub mod error;
pub mod follower_cursor;
pub mod kv;
pub mod proto;
pub mod rpc;
pub mod wal;

pub use controller::LeaderController;
pub use error::ShardError;
pub use rpc::{Node, ReplicationClient};
