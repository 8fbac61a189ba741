//! Error types exposed by this crate.

use serde::Deserialize;
use serde::Serialize;

/// Error variants related to configuration.
#[derive(Debug, thiserror::Error, PartialEq)]
#[non_exhaustive]
pub enum ConfigError {
    /// The min & max election timeout values are invalid: max must be greater than min.
    #[error("the minimum election timeout must be less than the maximum election timeout")]
    InvalidElectionTimeoutMinMax,
    /// The election timeout must be greater than the heartbeat interval, else
    /// followers would start elections while a leader is healthy.
    #[error("the election timeout must be greater than the heartbeat interval")]
    InvalidElectionTimeoutHeartbeat,
    /// The apply channel must be able to hold at least one entry.
    #[error("the apply channel capacity must be greater than zero")]
    InvalidApplyChannelCapacity,
}

/// The ways a driver-initiated command can fail to produce a reply.
///
/// The `Display` forms of these variants are wire-visible: services embed
/// them verbatim in their RPC replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum StartError {
    /// This node is not the Raft leader; retry against another replica.
    #[error("Wrong Leader")]
    WrongLeader,
    /// Leadership changed and a different command committed at the index
    /// this request was assigned.
    #[error("Replaced by concurrent request")]
    Replaced,
    /// The command did not apply within the consensus timeout. It may still
    /// commit later; the caller must retry with the same operation id.
    #[error("Timeout")]
    Timeout,
}

/// Errors from waiting on a metrics condition.
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    /// Timed out waiting for the condition to become true.
    #[error("timeout after {0:?} when {1}")]
    Timeout(std::time::Duration, String),
    /// The node shut down and will never report the awaited state.
    #[error("raft node is shut down")]
    Shutdown,
}
