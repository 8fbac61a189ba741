//! The service-level network interface.

use anyhow::Result;
use async_trait::async_trait;

use crate::rpc::DeleteTransferArgs;
use crate::rpc::DeleteTransferReply;
use crate::rpc::FetchShardArgs;
use crate::rpc::FetchShardReply;
use crate::rpc::GetArgs;
use crate::rpc::GetReply;
use crate::rpc::JoinArgs;
use crate::rpc::JoinReply;
use crate::rpc::LeaveArgs;
use crate::rpc::LeaveReply;
use crate::rpc::MoveArgs;
use crate::rpc::MoveReply;
use crate::rpc::PutAppendArgs;
use crate::rpc::PutAppendReply;
use crate::rpc::QueryArgs;
use crate::rpc::QueryReply;

/// A trait defining the transport for the service RPC surface, addressed by
/// server name.
///
/// Clerks use it to reach masters and groups; groups use it to reach each
/// other for shard handoff. As with the Raft transport, delivery is
/// unreliable — an `Err` models a dropped or unanswered request and callers
/// retry on their own schedule — so handlers must be idempotent.
#[async_trait]
pub trait ServiceNetwork: Send + Sync + 'static {
    /// Call `ShardMaster.Join` on the target server.
    async fn join(&self, target: &str, args: JoinArgs) -> Result<JoinReply>;

    /// Call `ShardMaster.Leave` on the target server.
    async fn leave(&self, target: &str, args: LeaveArgs) -> Result<LeaveReply>;

    /// Call `ShardMaster.Move` on the target server.
    async fn move_shard(&self, target: &str, args: MoveArgs) -> Result<MoveReply>;

    /// Call `ShardMaster.Query` on the target server.
    async fn query(&self, target: &str, args: QueryArgs) -> Result<QueryReply>;

    /// Call `KV.Get` on the target server.
    async fn get(&self, target: &str, args: GetArgs) -> Result<GetReply>;

    /// Call `KV.PutAppend` on the target server.
    async fn put_append(&self, target: &str, args: PutAppendArgs) -> Result<PutAppendReply>;

    /// Call `ShardKV.FetchShard` on the target server.
    async fn fetch_shard(&self, target: &str, args: FetchShardArgs) -> Result<FetchShardReply>;

    /// Call `ShardKV.DeleteTransfer` on the target server.
    async fn delete_transfer(&self, target: &str, args: DeleteTransferArgs) -> Result<DeleteTransferReply>;
}
