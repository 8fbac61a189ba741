//! RPC argument and reply types for both services.
//!
//! Every type here derives serde's traits so that any self-describing,
//! length-prefixed transport can carry it. The in-memory router used by the
//! test suites passes them as typed values.

use std::collections::BTreeMap;
use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;
use shard_raft::OpId;

use crate::config::Gid;
use crate::config::ShardConfig;
use crate::error::KvResult;

//////////////////////////////////////////////////////////////////////////////////////////////////
// Shard master RPCs.

/// Add new replica groups, rebalancing shards onto them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JoinArgs {
    /// The joining groups: GID to server names.
    pub servers: BTreeMap<Gid, Vec<String>>,
    pub id: OpId,
}

/// Remove replica groups, rebalancing their shards onto the remainder.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LeaveArgs {
    pub gids: Vec<Gid>,
    pub id: OpId,
}

/// Explicitly assign one shard to one group. Never rebalances.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MoveArgs {
    pub shard: u64,
    pub gid: Gid,
    pub id: OpId,
}

/// Read one configuration. `None` (or a number beyond the latest) reads the
/// latest.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryArgs {
    pub num: Option<u64>,
    pub id: OpId,
}

pub type JoinReply = KvResult<()>;
pub type LeaveReply = KvResult<()>;
pub type MoveReply = KvResult<()>;
pub type QueryReply = KvResult<ShardConfig>;

//////////////////////////////////////////////////////////////////////////////////////////////////
// KV RPCs.

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GetArgs {
    pub key: String,
    pub id: OpId,
}

/// Whether a `PutAppend` overwrites or appends.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PutAppendOp {
    Put,
    Append,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PutAppendArgs {
    pub key: String,
    pub value: String,
    pub op: PutAppendOp,
    pub id: OpId,
}

pub type GetReply = KvResult<String>;
pub type PutAppendReply = KvResult<()>;

//////////////////////////////////////////////////////////////////////////////////////////////////
// Shard migration RPCs and commands.

/// A shard payload owed by a donor group to a donee.
///
/// Retained by the donor until the donee confirms receipt via
/// `DeleteTransfer`, and tagged with the configuration that caused the
/// handoff so retries can never install a stale payload. The latest-op map
/// travels with the data so duplicate suppression survives the move.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ShardTransfer {
    /// The destination group.
    pub gid: Gid,
    /// The shard being moved.
    pub sid: u64,
    /// The configuration number that reassigned the shard.
    pub cid: u64,
    /// The shard's keys and values.
    pub shard: HashMap<String, String>,
    /// The donor's per-client duplicate-suppression map.
    pub latest_ops: HashMap<u64, u64>,
}

/// Ask a donor for the shard payload it owes us under configuration `cid`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FetchShardArgs {
    /// The requesting (destination) group.
    pub gid: Gid,
    pub sid: u64,
    pub cid: u64,
}

pub type FetchShardReply = KvResult<ShardTransfer>;

/// Tell a donor the payload has been installed and may be dropped.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeleteTransferArgs {
    pub gid: Gid,
    pub sid: u64,
    pub cid: u64,
    pub id: OpId,
}

pub type DeleteTransferReply = KvResult<()>;

/// Adopt a new configuration. Submitted through a group's own Raft by its
/// master-poll loop.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpdateConfigArgs {
    pub config: ShardConfig,
    pub id: OpId,
}

/// Install a fetched shard payload. Submitted through the donee's own Raft
/// so every replica incorporates it at the same log index.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommitShardTransferArgs {
    pub transfer: ShardTransfer,
    pub id: OpId,
}
