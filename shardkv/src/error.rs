//! Service-level errors.

use serde::Deserialize;
use serde::Serialize;
use shard_raft::StartError;

/// The ways a service request can fail.
///
/// The `Display` forms are the wire-visible error strings. Clerks retry
/// every variant; only `NoKey` surfaces to the application, as an empty
/// value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum KvError {
    /// The key does not exist.
    #[error("ErrNoKey")]
    NoKey,
    /// The key's shard is not assigned to this group in the current
    /// configuration.
    #[error("ErrWrongGroup")]
    WrongGroup,
    /// The shard is assigned to this group but its contents have not yet
    /// arrived from the previous owner.
    #[error("Waiting for shard")]
    WaitingForShard,
    /// This replica is not its group's Raft leader.
    #[error("Wrong Leader")]
    WrongLeader,
    /// Leadership changed and a different command took this request's log slot.
    #[error("Replaced by concurrent request")]
    Replaced,
    /// The request did not reach consensus within the deadline.
    #[error("Timeout")]
    Timeout,
}

impl From<StartError> for KvError {
    fn from(err: StartError) -> Self {
        match err {
            StartError::WrongLeader => KvError::WrongLeader,
            StartError::Replaced => KvError::Replaced,
            StartError::Timeout => KvError::Timeout,
        }
    }
}

/// The result type carried in service RPC replies.
pub type KvResult<T> = Result<T, KvError>;
