//! A sharded, linearizable key/value store built on `shard-raft`.
//!
//! Two services compose the system. The [shard master](master) is a single
//! Raft-replicated allocator producing a monotonic sequence of
//! configurations, each assigning every key-space shard to one replica
//! group. Each [group](group) is its own Raft-replicated KV state machine:
//! it polls the master, serves `Get`/`Put`/`Append` for the shards it owns,
//! and hands shards over to their new owners as configurations change.
//!
//! The RPC transport is pluggable: implement [`ServiceNetwork`] to carry
//! the service-level RPC surface, and `shard_raft::RaftNetwork` for the
//! consensus traffic inside each group.

pub mod config;
pub mod error;
pub mod group;
pub mod master;
pub mod network;
pub mod rpc;

pub use crate::config::key_to_shard;
pub use crate::config::Gid;
pub use crate::config::ShardConfig;
pub use crate::config::NSHARDS;
pub use crate::config::UNASSIGNED;
pub use crate::error::KvError;
pub use crate::error::KvResult;
pub use crate::group::KvClerk;
pub use crate::group::ShardKv;
pub use crate::master::MasterClerk;
pub use crate::master::ShardMaster;
pub use crate::network::ServiceNetwork;
