//! The Raft network interface.

use anyhow::Result;
use async_trait::async_trait;

use crate::message::AppendEntriesRequest;
use crate::message::AppendEntriesResponse;
use crate::message::InstallSnapshotRequest;
use crate::message::InstallSnapshotResponse;
use crate::message::VoteRequest;
use crate::message::VoteResponse;
use crate::AppCommand;
use crate::NodeId;

/// A trait defining the interface for the Raft RPC transport.
///
/// The transport is free to drop, delay, reorder, or duplicate messages; an
/// `Err` models a send that never produced a reply. The engine treats every
/// failure the same way: discard and retry on its own schedule, so
/// implementations should not retry internally.
#[async_trait]
pub trait RaftNetwork<C>: Send + Sync + 'static
where
    C: AppCommand,
{
    /// Send a RequestVote RPC to the target Raft node.
    async fn send_vote(&self, target: NodeId, rpc: VoteRequest) -> Result<VoteResponse>;

    /// Send an AppendEntries RPC to the target Raft node.
    async fn send_append_entries(
        &self,
        target: NodeId,
        rpc: AppendEntriesRequest<C>,
    ) -> Result<AppendEntriesResponse>;

    /// Send an InstallSnapshot RPC to the target Raft node.
    async fn send_install_snapshot(
        &self,
        target: NodeId,
        rpc: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse>;
}
