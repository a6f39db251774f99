//! Error taxonomy for the shard controller surface.
//!
//! Protocol errors are typed so callers can match on them; storage failures
//! flow through as `anyhow` chains. Per-mutation semantic outcomes
//! (`UnexpectedVersion`, `KeyNotFound`) are carried inline in batched
//! responses, never as a call-level error.

#[derive(thiserror::Error, Debug)]
pub enum ShardError {
    /// Fence/leadership call carried an epoch the controller cannot accept.
    #[error("invalid epoch")]
    InvalidEpoch,
    /// Operation attempted while the controller is in the wrong state.
    #[error("invalid controller status")]
    InvalidStatus,
    #[error("follower already present: {0}")]
    AlreadyPresent(String),
    #[error("ensemble is already at the replication factor")]
    EnsembleFull,
    #[error("unknown shard: {0}")]
    UnknownShard(u64),
    /// WAL/KV failure. Fatal to the controller.
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ShardError>;
