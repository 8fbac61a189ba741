//! A sharded KV replica group.
//!
//! Each group is a Raft-replicated state machine over its assigned shards.
//! A leader-side poller watches the shard master for the successor
//! configuration; adopting one is itself a replicated command, so every
//! replica switches at the same log index. Shards gained from another group
//! are fetched from the donor and installed through the group's own log;
//! shards lost are retained as [`ShardTransfer`] payloads until the new
//! owner confirms receipt, which makes handoff retries harmless across
//! leader failures on either side.

mod clerk;

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use shard_raft::metrics::Wait;
use shard_raft::AppendEntriesRequest;
use shard_raft::AppendEntriesResponse;
use shard_raft::Config;
use shard_raft::InstallSnapshotRequest;
use shard_raft::InstallSnapshotResponse;
use shard_raft::NodeId;
use shard_raft::OpId;
use shard_raft::Persistence;
use shard_raft::Raft;
use shard_raft::RaftMetrics;
use shard_raft::RaftNetwork;
use shard_raft::Rsm;
use shard_raft::StateMachine;
use shard_raft::VoteRequest;
use shard_raft::VoteResponse;
use tokio::time::sleep;
use tracing_futures::Instrument;

pub use clerk::KvClerk;

use crate::config::key_to_shard;
use crate::config::Gid;
use crate::config::ShardConfig;
use crate::config::UNASSIGNED;
use crate::error::KvError;
use crate::error::KvResult;
use crate::master::MasterClerk;
use crate::network::ServiceNetwork;
use crate::rpc::CommitShardTransferArgs;
use crate::rpc::DeleteTransferArgs;
use crate::rpc::DeleteTransferReply;
use crate::rpc::FetchShardArgs;
use crate::rpc::FetchShardReply;
use crate::rpc::GetArgs;
use crate::rpc::GetReply;
use crate::rpc::PutAppendArgs;
use crate::rpc::PutAppendOp;
use crate::rpc::PutAppendReply;
use crate::rpc::ShardTransfer;
use crate::rpc::UpdateConfigArgs;

/// How often the leader polls the master and retries missing shards.
const POLL_PERIOD: Duration = Duration::from_millis(100);

/// Snapshot when the raft state reaches this share of the configured budget.
const SNAPSHOT_THRESHOLD: f64 = 0.95;

/// The commands replicated through a group's Raft log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum KvCommand {
    Get(GetArgs),
    PutAppend(PutAppendArgs),
    UpdateConfig(UpdateConfigArgs),
    CommitShardTransfer(CommitShardTransferArgs),
    DeleteTransfer(DeleteTransferArgs),
}

/// The result of one applied group command.
#[derive(Clone, Debug)]
pub enum KvResponse {
    Get(KvResult<String>),
    PutAppend(KvResult<()>),
    /// An internal command completed (or was dropped by its guards).
    Done,
}

/// The replicated state of one group. This is exactly what a snapshot
/// captures.
#[derive(Serialize, Deserialize)]
struct KvState {
    /// The index of the most recently applied entry; snapshots are taken at
    /// this boundary and the apply path asserts it never skips.
    last_included_index: u64,
    /// Per-shard key/value storage.
    storage: HashMap<u64, HashMap<String, String>>,
    /// Per-client duplicate suppression.
    latest_op: HashMap<u64, u64>,
    /// The configuration this group currently operates under.
    config: ShardConfig,
    /// Shards owned in the current config whose contents have not yet
    /// arrived, mapped to the donor's server names.
    waiting_from: HashMap<u64, Vec<String>>,
    /// Shard payloads owed to other groups, retained until the donee
    /// confirms via `DeleteTransfer`.
    to_transfer: Vec<ShardTransfer>,
}

impl KvState {
    fn new() -> Self {
        Self {
            last_included_index: 0,
            storage: HashMap::new(),
            latest_op: HashMap::new(),
            config: ShardConfig::empty(),
            waiting_from: HashMap::new(),
            to_transfer: Vec::new(),
        }
    }

    fn serves(&self, gid: Gid, sid: u64) -> bool {
        self.config.owner(sid) == gid
    }

    fn received(&self, sid: u64) -> bool {
        !self.waiting_from.contains_key(&sid)
    }
}

/// The group's replicated state machine.
pub struct KvMachine<S: ServiceNetwork> {
    gid: Gid,
    state: Mutex<KvState>,
    net: Arc<S>,
}

impl<S: ServiceNetwork> KvMachine<S> {
    fn new(gid: Gid, net: Arc<S>) -> Self {
        Self {
            gid,
            state: Mutex::new(KvState::new()),
            net,
        }
    }

    fn state(&self) -> MutexGuard<'_, KvState> {
        self.state.lock().expect("kv state mutex poisoned")
    }

    fn apply_get(&self, st: &mut KvState, args: GetArgs) -> (OpId, KvResponse) {
        let sid = key_to_shard(&args.key);
        if !st.serves(self.gid, sid) {
            return (args.id, KvResponse::Get(Err(KvError::WrongGroup)));
        }
        if !st.received(sid) {
            return (args.id, KvResponse::Get(Err(KvError::WaitingForShard)));
        }

        let value = st.storage.get(&sid).and_then(|shard| shard.get(&args.key)).cloned();
        let result = match value {
            Some(value) => Ok(value),
            None => Err(KvError::NoKey),
        };
        (args.id, KvResponse::Get(result))
    }

    fn apply_put_append(&self, st: &mut KvState, args: PutAppendArgs) -> (OpId, KvResponse) {
        let sid = key_to_shard(&args.key);
        if !st.serves(self.gid, sid) {
            return (args.id, KvResponse::PutAppend(Err(KvError::WrongGroup)));
        }
        if !st.received(sid) {
            return (args.id, KvResponse::PutAppend(Err(KvError::WaitingForShard)));
        }

        if args.id.seq > st.latest_op.get(&args.id.client).copied().unwrap_or(0) {
            let shard = st.storage.entry(sid).or_default();
            match args.op {
                PutAppendOp::Put => {
                    shard.insert(args.key.clone(), args.value.clone());
                }
                PutAppendOp::Append => {
                    shard.entry(args.key.clone()).or_default().push_str(&args.value);
                }
            }
            st.latest_op.insert(args.id.client, args.id.seq);
        }

        (args.id, KvResponse::PutAppend(Ok(())))
    }

    fn apply_update_config(&self, st: &mut KvState, args: UpdateConfigArgs) -> (OpId, KvResponse) {
        if args.config.num <= st.config.num {
            tracing::debug!(gid = self.gid, num = args.config.num, "not adopting config: out of date");
            return (args.id, KvResponse::Done);
        }
        if !st.waiting_from.is_empty() {
            tracing::debug!(gid = self.gid, num = args.config.num, "not adopting config: still transitioning");
            return (args.id, KvResponse::Done);
        }

        // Shard arrays are visited in index order, so the transition is
        // computed identically on every replica.
        let mut lost = Vec::new();
        let mut gained = Vec::new();
        for sid in 0..st.config.shards.len() as u64 {
            let old = st.config.owner(sid);
            let new = args.config.owner(sid);
            if old == self.gid && new != self.gid {
                lost.push(sid);
            }
            if old != self.gid && new == self.gid {
                gained.push(sid);
            }
        }
        tracing::debug!(
            gid = self.gid,
            num = args.config.num,
            "adopting config: lost {:?}, gained {:?}",
            lost,
            gained
        );

        // Retain a payload for every shard we owe, then drop the live copy.
        for sid in lost.iter() {
            let to_gid = args.config.owner(*sid);
            if to_gid == UNASSIGNED {
                continue;
            }

            let transfer = ShardTransfer {
                gid: to_gid,
                sid: *sid,
                cid: args.config.num,
                shard: st.storage.get(sid).cloned().unwrap_or_default(),
                latest_ops: st.latest_op.clone(),
            };
            store_transfer(&mut st.to_transfer, transfer);
        }
        for sid in lost.iter() {
            assert!(st.received(*sid));
            st.storage.remove(sid);
        }

        // Gained shards that were really owned before must be waited for;
        // formerly unassigned shards are served right away.
        for sid in gained.iter() {
            let from_gid = st.config.owner(*sid);
            if from_gid == UNASSIGNED {
                assert!(st.received(*sid));
                continue;
            }
            st.waiting_from.insert(*sid, st.config.groups[&from_gid].clone());
        }

        st.config = args.config.clone();
        (args.id, KvResponse::Done)
    }

    fn apply_commit_shard_transfer(&self, st: &mut KvState, args: CommitShardTransferArgs) -> (OpId, KvResponse) {
        let transfer = args.transfer;
        assert_eq!(transfer.gid, self.gid, "transfer delivered to the wrong group");
        assert!(transfer.cid <= st.config.num);

        if transfer.cid < st.config.num {
            tracing::debug!(gid = self.gid, sid = transfer.sid, "not installing transfer: out of date");
            return (args.id, KvResponse::Done);
        }
        if st.received(transfer.sid) {
            tracing::debug!(gid = self.gid, sid = transfer.sid, "not installing transfer: already received");
            return (args.id, KvResponse::Done);
        }

        let donors = st.waiting_from.remove(&transfer.sid).expect("shard was waiting");
        assert!(!donors.is_empty());

        st.storage.insert(transfer.sid, transfer.shard.clone());

        // Merge the donor's duplicate-suppression map element-wise so a
        // client's suppression never regresses.
        for (client, seq) in transfer.latest_ops.iter() {
            let latest = st.latest_op.entry(*client).or_insert(0);
            *latest = std::cmp::max(*latest, *seq);
        }

        // Tell the donor it may drop the retained payload. Best-effort and
        // replicated on the donor's side, so duplicates are harmless.
        let net = self.net.clone();
        let del = DeleteTransferArgs {
            gid: transfer.gid,
            sid: transfer.sid,
            cid: transfer.cid,
            id: OpId::new(rand::random(), 1),
        };
        tokio::spawn(
            async move {
                for server in donors.iter() {
                    if let Ok(Ok(())) = net.delete_transfer(server, del.clone()).await {
                        return;
                    }
                }
                tracing::debug!(sid = del.sid, cid = del.cid, "could not confirm transfer deletion");
            }
            .instrument(tracing::debug_span!("delete-transfer")),
        );

        (args.id, KvResponse::Done)
    }

    fn apply_delete_transfer(&self, st: &mut KvState, args: DeleteTransferArgs) -> (OpId, KvResponse) {
        st.to_transfer
            .retain(|t| !(t.sid == args.sid && t.cid == args.cid && t.gid == args.gid));
        (args.id, KvResponse::Done)
    }

    fn retrieve_transfer(&self, sid: u64, cid: u64, gid: Gid) -> Option<ShardTransfer> {
        let st = self.state();
        st.to_transfer
            .iter()
            .find(|t| t.sid == sid && t.cid == cid && t.gid == gid)
            .cloned()
    }

    fn encode(&self) -> (u64, Vec<u8>) {
        let st = self.state();
        let blob = match serde_json::to_vec(&*st) {
            Ok(blob) => blob,
            Err(err) => panic!("failed to encode kv snapshot: {}", err),
        };
        (st.last_included_index, blob)
    }
}

fn store_transfer(to_transfer: &mut Vec<ShardTransfer>, transfer: ShardTransfer) {
    let exists = to_transfer
        .iter()
        .any(|t| t.sid == transfer.sid && t.cid == transfer.cid && t.gid == transfer.gid);
    if !exists {
        to_transfer.push(transfer);
    }
}

#[async_trait]
impl<S: ServiceNetwork> StateMachine<KvCommand> for KvMachine<S> {
    type Response = KvResponse;

    async fn apply(&self, index: u64, command: KvCommand) -> (OpId, KvResponse) {
        let mut st = self.state();
        assert_eq!(
            index,
            st.last_included_index + 1,
            "apply skipped an index (have {}, got {})",
            st.last_included_index,
            index
        );
        st.last_included_index = index;

        match command {
            KvCommand::Get(args) => self.apply_get(&mut st, args),
            KvCommand::PutAppend(args) => self.apply_put_append(&mut st, args),
            KvCommand::UpdateConfig(args) => self.apply_update_config(&mut st, args),
            KvCommand::CommitShardTransfer(args) => self.apply_commit_shard_transfer(&mut st, args),
            KvCommand::DeleteTransfer(args) => self.apply_delete_transfer(&mut st, args),
        }
    }

    async fn restore(&self, snapshot: Vec<u8>) {
        if snapshot.is_empty() {
            return;
        }

        let decoded: KvState = match serde_json::from_slice(&snapshot) {
            Ok(decoded) => decoded,
            // A corrupt snapshot is not recoverable.
            Err(err) => panic!("failed to decode kv snapshot: {}", err),
        };

        let mut st = self.state();
        tracing::debug!(
            gid = self.gid,
            last_included_index = decoded.last_included_index,
            "restoring state from snapshot"
        );
        *st = decoded;
    }
}

/// One replica of a sharded KV group.
pub struct ShardKv<N, P, S>
where
    N: RaftNetwork<KvCommand>,
    P: Persistence,
    S: ServiceNetwork,
{
    gid: Gid,
    me: NodeId,
    rsm: Arc<Rsm<KvCommand, KvMachine<S>, N, P>>,
    persister: Arc<P>,
    masters: MasterClerk<S>,
    /// Snapshot once the raft state blob approaches this many bytes.
    /// `None` disables snapshotting.
    max_raft_state: Option<usize>,
    active: Arc<AtomicBool>,
}

impl<N, P, S> ShardKv<N, P, S>
where
    N: RaftNetwork<KvCommand>,
    P: Persistence,
    S: ServiceNetwork,
{
    /// Start one group replica and its background loops.
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        gid: Gid,
        me: NodeId,
        peers: Vec<NodeId>,
        master_servers: Vec<String>,
        config: Arc<Config>,
        raft_network: Arc<N>,
        persister: Arc<P>,
        service_network: Arc<S>,
        max_raft_state: Option<usize>,
    ) -> Result<Arc<Self>> {
        let machine = Arc::new(KvMachine::new(gid, service_network.clone()));

        // Restore previous application state if any exists. The raft
        // recovery below lines its apply cursor up with the same boundary.
        let snapshot = persister.read_snapshot().await?;
        machine.restore(snapshot).await;

        let (raft, apply_rx) = Raft::new(me, peers, config.clone(), raft_network, persister.clone()).await?;
        let rsm = Rsm::new(raft, apply_rx, machine, config);

        let this = Arc::new(Self {
            gid,
            me,
            rsm,
            persister,
            masters: MasterClerk::new(service_network, master_servers),
            max_raft_state,
            active: Arc::new(AtomicBool::new(true)),
        });

        tokio::spawn(
            this.clone()
                .poll_config_loop()
                .instrument(tracing::debug_span!("poll-config", gid, me)),
        );
        tokio::spawn(
            this.clone()
                .fetch_loop()
                .instrument(tracing::debug_span!("fetch-shards", gid, me)),
        );
        if this.max_raft_state.is_some() {
            tokio::spawn(
                this.clone()
                    .snapshot_loop()
                    .instrument(tracing::debug_span!("snapshot", gid, me)),
            );
        }

        Ok(this)
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// The identity this replica uses for the commands it originates itself
    /// (config adoptions, transfer installs).
    fn internal_client(&self) -> u64 {
        self.gid.wrapping_shl(32) | self.me
    }

    /// The `KV.Get` RPC handler.
    pub async fn get(&self, args: GetArgs) -> GetReply {
        if !self.is_active() {
            return Err(KvError::WrongLeader);
        }
        match self.rsm.start(args.id, KvCommand::Get(args)).await? {
            KvResponse::Get(result) => result,
            _ => unreachable!("get applied to a non-get result"),
        }
    }

    /// The `KV.PutAppend` RPC handler.
    pub async fn put_append(&self, args: PutAppendArgs) -> PutAppendReply {
        if !self.is_active() {
            return Err(KvError::WrongLeader);
        }
        match self.rsm.start(args.id, KvCommand::PutAppend(args)).await? {
            KvResponse::PutAppend(result) => result,
            _ => unreachable!("put_append applied to a non-put_append result"),
        }
    }

    /// The `ShardKV.FetchShard` RPC handler: hand a donee the payload we
    /// retained for it.
    ///
    /// Transfers are immutable snapshots; the reply carries a clone, so the
    /// caller may do with it as it pleases.
    pub async fn fetch_shard(&self, args: FetchShardArgs) -> FetchShardReply {
        if !self.is_active() || !self.rsm.raft().is_leader().await {
            return Err(KvError::WrongLeader);
        }

        match self.rsm.machine().retrieve_transfer(args.sid, args.cid, args.gid) {
            Some(transfer) => Ok(transfer),
            // We have not caught up to the configuration that creates this
            // payload; the donee will come back.
            None => Err(KvError::WaitingForShard),
        }
    }

    /// The `ShardKV.DeleteTransfer` RPC handler: the donee has installed the
    /// payload, so drop it. Replicated, and repeatable without effect.
    pub async fn delete_transfer(&self, args: DeleteTransferArgs) -> DeleteTransferReply {
        if !self.is_active() {
            return Err(KvError::WrongLeader);
        }
        self.rsm.start(args.id, KvCommand::DeleteTransfer(args)).await?;
        Ok(())
    }

    /// Raft RPC ingress, for the transport to deliver consensus traffic.
    pub async fn raft_vote(&self, rpc: VoteRequest) -> Result<VoteResponse> {
        self.rsm.raft().vote(rpc).await
    }

    /// See [`ShardKv::raft_vote`].
    pub async fn raft_append_entries(&self, rpc: AppendEntriesRequest<KvCommand>) -> Result<AppendEntriesResponse> {
        self.rsm.raft().append_entries(rpc).await
    }

    /// See [`ShardKv::raft_vote`].
    pub async fn raft_install_snapshot(&self, rpc: InstallSnapshotRequest) -> Result<InstallSnapshotResponse> {
        self.rsm.raft().install_snapshot(rpc).await
    }

    /// A handle to this replica's Raft metrics.
    pub fn metrics(&self) -> tokio::sync::watch::Receiver<RaftMetrics> {
        self.rsm.raft().metrics()
    }

    /// A handle to wait on this replica's Raft metrics.
    pub fn wait(&self, timeout: Option<Duration>) -> Wait {
        self.rsm.raft().wait(timeout)
    }

    /// The configuration this replica currently operates under.
    pub fn current_config(&self) -> ShardConfig {
        self.rsm.machine().state().config.clone()
    }

    /// Shut this replica down.
    pub async fn shutdown(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.rsm.shutdown().await;
    }

    /// Poll the master for the successor configuration, leader-only, and
    /// submit its adoption through the log. Configurations are stepped one
    /// at a time so no transition is ever skipped.
    async fn poll_config_loop(self: Arc<Self>) {
        loop {
            if !self.is_active() {
                return;
            }
            self.poll_config_once().await;
            sleep(POLL_PERIOD).await;
        }
    }

    async fn poll_config_once(&self) {
        if !self.rsm.raft().is_leader().await {
            return;
        }

        let current_num = {
            let st = self.rsm.machine().state();
            if !st.waiting_from.is_empty() {
                // Mid-transition: finish moving shards before changing again.
                return;
            }
            st.config.num
        };

        let next = match self.masters.query_once(Some(current_num + 1)).await {
            Some(next) => next,
            None => {
                tracing::debug!(gid = self.gid, "failed to query the shard master");
                return;
            }
        };

        if !self.is_active() {
            return;
        }
        {
            let st = self.rsm.machine().state();
            if !st.waiting_from.is_empty() || next.num <= st.config.num {
                return;
            }
        }

        tracing::debug!(gid = self.gid, from = current_num, to = next.num, "submitting config adoption");
        let id = OpId::new(self.internal_client(), next.num);
        let _ = self
            .rsm
            .start(id, KvCommand::UpdateConfig(UpdateConfigArgs { config: next, id }))
            .await;
    }

    /// Chase the shards this group is still owed, leader-only.
    async fn fetch_loop(self: Arc<Self>) {
        loop {
            if !self.is_active() {
                return;
            }
            Self::fetch_missing_shards(&self).await;
            sleep(POLL_PERIOD).await;
        }
    }

    async fn fetch_missing_shards(this: &Arc<Self>) {
        if !this.rsm.raft().is_leader().await {
            return;
        }

        let waiting: Vec<u64> = this.rsm.machine().state().waiting_from.keys().copied().collect();
        for sid in waiting {
            let gid = this.gid;
            tokio::spawn(
                this.clone()
                    .fetch_missing_shard(sid)
                    .instrument(tracing::debug_span!("fetch-shard", gid, sid)),
            );
        }
    }

    async fn fetch_missing_shard(self: Arc<Self>, sid: u64) {
        if !self.is_active() {
            return;
        }

        let (args, donors) = {
            let st = self.rsm.machine().state();
            let donors = match st.waiting_from.get(&sid) {
                Some(donors) => donors.clone(),
                // Someone fetched this shard in the meantime.
                None => return,
            };
            (
                FetchShardArgs {
                    gid: self.gid,
                    sid,
                    cid: st.config.num,
                },
                donors,
            )
        };
        assert!(!donors.is_empty());

        for server in donors.iter() {
            match self.rsm.machine().net.fetch_shard(server, args.clone()).await {
                Ok(Ok(transfer)) => {
                    self.commit_shard_transfer(transfer).await;
                    return;
                }
                Ok(Err(err)) => {
                    tracing::debug!(gid = self.gid, sid, server = %server, error = %err, "fetch refused");
                }
                Err(err) => {
                    tracing::debug!(gid = self.gid, sid, server = %server, error = %err, "fetch failed");
                }
            }
        }
    }

    /// Run a fetched payload through our own log so every replica installs
    /// it deterministically.
    async fn commit_shard_transfer(&self, transfer: ShardTransfer) {
        if !self.is_active() {
            return;
        }

        let id = OpId::new(self.internal_client(), transfer.sid);
        let _ = self
            .rsm
            .start(id, KvCommand::CommitShardTransfer(CommitShardTransferArgs { transfer, id }))
            .await;
    }

    /// Snapshot the application state whenever the raft state blob
    /// approaches its budget.
    async fn snapshot_loop(self: Arc<Self>) {
        let tick = Duration::from_millis(10);
        loop {
            if !self.is_active() {
                return;
            }
            self.try_snapshot().await;
            sleep(tick).await;
        }
    }

    async fn try_snapshot(&self) {
        let budget = match self.max_raft_state {
            Some(budget) => budget,
            None => return,
        };

        let threshold = (budget as f64 * SNAPSHOT_THRESHOLD) as usize;
        if self.persister.raft_state_size().await <= threshold {
            return;
        }

        let (last_included_index, snapshot) = self.rsm.machine().encode();
        tracing::debug!(gid = self.gid, me = self.me, last_included_index, "compacting log into snapshot");
        self.rsm.raft().compact(last_included_index, snapshot).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    use crate::rpc::JoinReply;
    use crate::rpc::LeaveReply;
    use crate::rpc::MoveReply;
    use crate::rpc::QueryArgs;
    use crate::rpc::QueryReply;

    /// A transport that drops everything, for exercising the machine alone.
    struct DeadNet;

    #[async_trait]
    impl ServiceNetwork for DeadNet {
        async fn join(&self, _: &str, _: crate::rpc::JoinArgs) -> Result<JoinReply> {
            Err(anyhow!("dead"))
        }
        async fn leave(&self, _: &str, _: crate::rpc::LeaveArgs) -> Result<LeaveReply> {
            Err(anyhow!("dead"))
        }
        async fn move_shard(&self, _: &str, _: crate::rpc::MoveArgs) -> Result<MoveReply> {
            Err(anyhow!("dead"))
        }
        async fn query(&self, _: &str, _: QueryArgs) -> Result<QueryReply> {
            Err(anyhow!("dead"))
        }
        async fn get(&self, _: &str, _: GetArgs) -> Result<GetReply> {
            Err(anyhow!("dead"))
        }
        async fn put_append(&self, _: &str, _: PutAppendArgs) -> Result<PutAppendReply> {
            Err(anyhow!("dead"))
        }
        async fn fetch_shard(&self, _: &str, _: FetchShardArgs) -> Result<FetchShardReply> {
            Err(anyhow!("dead"))
        }
        async fn delete_transfer(&self, _: &str, _: DeleteTransferArgs) -> Result<DeleteTransferReply> {
            Err(anyhow!("dead"))
        }
    }

    fn machine(gid: Gid) -> KvMachine<DeadNet> {
        KvMachine::new(gid, Arc::new(DeadNet))
    }

    fn config(num: u64, owners: [Gid; crate::config::NSHARDS]) -> ShardConfig {
        let mut groups = std::collections::BTreeMap::new();
        for gid in owners.iter() {
            if *gid != UNASSIGNED {
                groups.entry(*gid).or_insert_with(|| vec![format!("g{}-0", gid)]);
            }
        }
        ShardConfig {
            num,
            shards: owners,
            groups,
        }
    }

    fn adopt(m: &KvMachine<DeadNet>, conf: ShardConfig) {
        let mut st = m.state();
        let id = OpId::new(1, conf.num);
        m.apply_update_config(&mut st, UpdateConfigArgs { config: conf, id });
    }

    fn put(m: &KvMachine<DeadNet>, key: &str, value: &str, id: OpId) -> KvResponse {
        let mut st = m.state();
        let (_, res) = m.apply_put_append(
            &mut st,
            PutAppendArgs {
                key: key.into(),
                value: value.into(),
                op: PutAppendOp::Append,
                id,
            },
        );
        res
    }

    fn get(m: &KvMachine<DeadNet>, key: &str, id: OpId) -> KvResult<String> {
        let mut st = m.state();
        match m.apply_get(&mut st, GetArgs { key: key.into(), id }) {
            (_, KvResponse::Get(res)) => res,
            _ => panic!("get produced a non-get response"),
        }
    }

    // "b" maps to shard 8, "d" to shard 0.
    const ALL_TO_G1: [Gid; 10] = [1; 10];

    #[test]
    fn test_rejects_keys_outside_the_group() {
        let m = machine(2);
        adopt(&m, config(1, ALL_TO_G1));

        assert_eq!(get(&m, "b", OpId::new(9, 1)), Err(KvError::WrongGroup));
        match put(&m, "b", "x", OpId::new(9, 2)) {
            KvResponse::PutAppend(res) => assert_eq!(res, Err(KvError::WrongGroup)),
            _ => panic!("unexpected response"),
        }
    }

    #[test]
    fn test_duplicate_append_applies_once() {
        let m = machine(1);
        adopt(&m, config(1, ALL_TO_G1));

        let id = OpId::new(9, 1);
        put(&m, "b", "a", id);
        put(&m, "b", "a", id);
        assert_eq!(get(&m, "b", OpId::new(9, 2)), Ok("a".into()));

        put(&m, "b", "a", OpId::new(9, 3));
        assert_eq!(get(&m, "b", OpId::new(9, 4)), Ok("aa".into()));
    }

    #[test]
    fn test_missing_key_reports_no_key() {
        let m = machine(1);
        adopt(&m, config(1, ALL_TO_G1));
        assert_eq!(get(&m, "b", OpId::new(9, 1)), Err(KvError::NoKey));
    }

    #[test]
    fn test_losing_a_shard_retains_a_transfer() {
        let m = machine(1);
        adopt(&m, config(1, ALL_TO_G1));
        put(&m, "b", "v", OpId::new(9, 1));

        // Shard 8 moves to group 2.
        let mut owners = ALL_TO_G1;
        owners[8] = 2;
        adopt(&m, config(2, owners));

        let transfer = m.retrieve_transfer(8, 2, 2).expect("transfer retained for the donee");
        assert_eq!(transfer.shard.get("b"), Some(&"v".to_string()));
        assert_eq!(transfer.latest_ops.get(&9), Some(&1));

        // The live copy is gone.
        assert_eq!(get(&m, "b", OpId::new(9, 2)), Err(KvError::WrongGroup));
    }

    #[test]
    fn test_gaining_an_owned_shard_waits_for_the_donor() {
        let mut owners = ALL_TO_G1;
        owners[8] = 2;

        let m = machine(2);
        adopt(&m, config(1, owners));
        // Shard 8 was unassigned before config 1: served right away.
        assert_eq!(get(&m, "b", OpId::new(9, 1)), Err(KvError::NoKey));

        // Now gain shard 0 from group 1.
        let mut owners2 = owners;
        owners2[0] = 2;
        adopt(&m, config(2, owners2));

        assert_eq!(get(&m, "d", OpId::new(9, 2)), Err(KvError::WaitingForShard));
        assert_eq!(m.state().waiting_from.get(&0), Some(&vec!["g1-0".to_string()]));
    }

    #[tokio::test]
    async fn test_commit_transfer_installs_and_merges_latest_ops() {
        let mut owners = ALL_TO_G1;
        owners[8] = 2;

        let m = machine(2);
        adopt(&m, config(1, ALL_TO_G1));
        adopt(&m, config(2, owners));
        assert_eq!(get(&m, "b", OpId::new(9, 1)), Err(KvError::WaitingForShard));

        let transfer = ShardTransfer {
            gid: 2,
            sid: 8,
            cid: 2,
            shard: vec![("b".to_string(), "v".to_string())].into_iter().collect(),
            latest_ops: vec![(9, 5)].into_iter().collect(),
        };
        {
            let mut st = m.state();
            m.apply_commit_shard_transfer(
                &mut st,
                CommitShardTransferArgs {
                    transfer: transfer.clone(),
                    id: OpId::new(2, 8),
                },
            );
        }

        assert_eq!(get(&m, "b", OpId::new(9, 6)), Ok("v".into()));

        // Suppression merged: seq 5 must now be a duplicate.
        match put(&m, "b", "x", OpId::new(9, 5)) {
            KvResponse::PutAppend(res) => assert_eq!(res, Ok(())),
            _ => panic!("unexpected response"),
        }
        assert_eq!(get(&m, "b", OpId::new(9, 7)), Ok("v".into()));

        // Replaying the install is a no-op.
        {
            let mut st = m.state();
            m.apply_commit_shard_transfer(
                &mut st,
                CommitShardTransferArgs {
                    transfer,
                    id: OpId::new(2, 8),
                },
            );
        }
        assert_eq!(get(&m, "b", OpId::new(9, 8)), Ok("v".into()));
    }

    #[test]
    fn test_config_adoption_blocked_while_transitioning() {
        let mut owners = ALL_TO_G1;
        owners[8] = 2;

        let m = machine(2);
        adopt(&m, config(1, ALL_TO_G1));
        adopt(&m, config(2, owners));
        assert!(!m.state().waiting_from.is_empty());

        // A further config must not apply until shard 8 arrives.
        let mut owners3 = owners;
        owners3[0] = 2;
        adopt(&m, config(3, owners3));
        assert_eq!(m.state().config.num, 2);
    }

    #[test]
    fn test_delete_transfer_is_idempotent() {
        let m = machine(1);
        adopt(&m, config(1, ALL_TO_G1));
        put(&m, "b", "v", OpId::new(9, 1));

        let mut owners = ALL_TO_G1;
        owners[8] = 2;
        adopt(&m, config(2, owners));
        assert!(m.retrieve_transfer(8, 2, 2).is_some());

        let del = DeleteTransferArgs {
            gid: 2,
            sid: 8,
            cid: 2,
            id: OpId::new(7, 1),
        };
        {
            let mut st = m.state();
            m.apply_delete_transfer(&mut st, del.clone());
        }
        assert!(m.retrieve_transfer(8, 2, 2).is_none());

        // Deleting again changes nothing.
        {
            let mut st = m.state();
            m.apply_delete_transfer(&mut st, del);
        }
        assert!(m.retrieve_transfer(8, 2, 2).is_none());
    }

    #[test]
    fn test_snapshot_round_trip() {
        let m = machine(1);
        adopt(&m, config(1, ALL_TO_G1));
        put(&m, "b", "v", OpId::new(9, 1));
        {
            let mut st = m.state();
            st.last_included_index = 3;
        }

        let (last_included, blob) = m.encode();
        assert_eq!(last_included, 3);

        let restored: KvState = serde_json::from_slice(&blob).unwrap();
        assert_eq!(restored.last_included_index, 3);
        assert_eq!(restored.config.num, 1);
        assert_eq!(restored.storage.get(&8).and_then(|s| s.get("b")), Some(&"v".to_string()));
        assert_eq!(restored.latest_op.get(&9), Some(&1));
    }
}
