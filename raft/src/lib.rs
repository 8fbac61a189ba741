//! A Raft consensus engine with log compaction, plus the generic driver that
//! turns a Raft cluster into a replicated state machine.
//!
//! The engine replicates opaque, application-typed commands. The application
//! hands commands to [`Raft::start`], consumes committed entries from the
//! apply channel, and may compact its prefix of the log into a snapshot at
//! any time via [`Raft::compact`]. The [`rsm`] module layers request/reply
//! correlation and duplicate-aware dispatch on top of the raw apply stream.
//!
//! Networking and durable storage are pluggable: implement [`RaftNetwork`]
//! for the transport and [`Persistence`] for the two opaque blobs a replica
//! keeps (raft state and snapshot).

pub mod config;
mod core;
pub mod error;
pub mod message;
pub mod metrics;
pub mod network;
pub mod persist;
pub mod rsm;
pub mod subs;

use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::Serialize;

pub use crate::config::Config;
pub use crate::core::Raft;
pub use crate::core::Role;
pub use crate::error::StartError;
pub use crate::message::AppendEntriesRequest;
pub use crate::message::AppendEntriesResponse;
pub use crate::message::ApplyMsg;
pub use crate::message::Entry;
pub use crate::message::EntryPayload;
pub use crate::message::InstallSnapshotRequest;
pub use crate::message::InstallSnapshotResponse;
pub use crate::message::VoteRequest;
pub use crate::message::VoteResponse;
pub use crate::metrics::RaftMetrics;
pub use crate::network::RaftNetwork;
pub use crate::persist::Persistence;
pub use crate::rsm::OpId;
pub use crate::rsm::Rsm;
pub use crate::rsm::StateMachine;

/// A Raft node's ID.
pub type NodeId = u64;

/// A trait defining application specific commands carried by the Raft log.
///
/// The engine never inspects a command; it only replicates, persists, and
/// eventually delivers it on the apply channel. The bounds exist so that
/// commands can cross task boundaries and be encoded into the persisted log
/// blob by any self-describing serializer.
pub trait AppCommand: Clone + Debug + PartialEq + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> AppCommand for T where T: Clone + Debug + PartialEq + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// A trait for producing compact one-line summaries of messages for logging.
pub trait MessageSummary {
    /// Return a short human readable summary of this message.
    fn summary(&self) -> String;
}
