//! The shard master: a Raft-replicated allocator of shards to groups.

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

pub use clerk::MasterClerk;

use crate::config::Gid;
use crate::config::ShardConfig;
use crate::config::UNASSIGNED;
use crate::error::KvError;
use crate::rpc::JoinArgs;
use crate::rpc::JoinReply;
use crate::rpc::LeaveArgs;
use crate::rpc::LeaveReply;
use crate::rpc::MoveArgs;
use crate::rpc::MoveReply;
use crate::rpc::QueryArgs;
use crate::rpc::QueryReply;

/// The commands replicated through the master's Raft log.
///
/// Queries go through the log too, which is what makes reads linearizable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum MasterCommand {
    Join(JoinArgs),
    Leave(LeaveArgs),
    Move(MoveArgs),
    Query(QueryArgs),
}

/// The result of one applied master command.
#[derive(Clone, Debug)]
pub enum MasterResponse {
    /// The configuration a `Query` resolved to.
    Config(ShardConfig),
    /// A write completed (or was suppressed as a duplicate).
    Done,
}

struct MasterState {
    /// The configuration history, indexed by configuration number.
    configs: Vec<ShardConfig>,
    /// Per-client duplicate suppression for writes.
    latest_op: HashMap<u64, u64>,
}

/// The master's replicated state machine.
pub struct MasterMachine {
    state: Mutex<MasterState>,
}

impl MasterMachine {
    fn new() -> Self {
        Self {
            state: Mutex::new(MasterState {
                configs: vec![ShardConfig::empty()],
                latest_op: HashMap::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, MasterState> {
        self.state.lock().expect("master state mutex poisoned")
    }

    fn apply_query(&self, args: QueryArgs) -> (OpId, MasterResponse) {
        let st = self.state();
        let last = (st.configs.len() - 1) as u64;
        let num = match args.num {
            Some(num) if num <= last => num,
            _ => last,
        };
        (args.id, MasterResponse::Config(st.configs[num as usize].clone()))
    }

    fn apply_join(&self, args: JoinArgs) -> (OpId, MasterResponse) {
        let mut st = self.state();
        if args.id.seq > st.latest_op.get(&args.id.client).copied().unwrap_or(0) {
            let mut conf = st.configs.last().expect("configuration history is never empty").clone();
            conf.num += 1;

            for (gid, servers) in args.servers.iter() {
                conf.groups.insert(*gid, servers.clone());
            }

            reassign_shards(&mut conf);
            tracing::debug!(num = conf.num, "join produced configuration: {:?}", conf.shards);
            st.configs.push(conf);
            st.latest_op.insert(args.id.client, args.id.seq);
        }
        (args.id, MasterResponse::Done)
    }

    fn apply_leave(&self, args: LeaveArgs) -> (OpId, MasterResponse) {
        let mut st = self.state();
        if args.id.seq > st.latest_op.get(&args.id.client).copied().unwrap_or(0) {
            let mut conf = st.configs.last().expect("configuration history is never empty").clone();
            conf.num += 1;

            for gid in args.gids.iter() {
                conf.groups.remove(gid);
                for owner in conf.shards.iter_mut() {
                    if owner == gid {
                        *owner = UNASSIGNED;
                    }
                }
            }

            reassign_shards(&mut conf);
            tracing::debug!(num = conf.num, "leave produced configuration: {:?}", conf.shards);
            st.configs.push(conf);
            st.latest_op.insert(args.id.client, args.id.seq);
        }
        (args.id, MasterResponse::Done)
    }

    fn apply_move(&self, args: MoveArgs) -> (OpId, MasterResponse) {
        let mut st = self.state();
        if args.id.seq > st.latest_op.get(&args.id.client).copied().unwrap_or(0) {
            let mut conf = st.configs.last().expect("configuration history is never empty").clone();
            conf.num += 1;

            // An explicit move; deliberately no rebalancing.
            conf.shards[args.shard as usize] = args.gid;

            st.configs.push(conf);
            st.latest_op.insert(args.id.client, args.id.seq);
        }
        (args.id, MasterResponse::Done)
    }
}

#[async_trait]
impl StateMachine<MasterCommand> for MasterMachine {
    type Response = MasterResponse;

    async fn apply(&self, _index: u64, command: MasterCommand) -> (OpId, MasterResponse) {
        match command {
            MasterCommand::Query(args) => self.apply_query(args),
            MasterCommand::Join(args) => self.apply_join(args),
            MasterCommand::Leave(args) => self.apply_leave(args),
            MasterCommand::Move(args) => self.apply_move(args),
        }
    }

    async fn restore(&self, _snapshot: Vec<u8>) {
        // The master never compacts: its configuration history is the state.
        unreachable!("shard master received a snapshot")
    }
}

/// Count the shards assigned to each group and return the lightest and
/// heaviest, breaking ties by ascending GID. `groups` must be non-empty.
fn find_min_max_assigned(conf: &ShardConfig) -> (Gid, usize, Gid, usize) {
    let mut min: Option<(Gid, usize)> = None;
    let mut max: Option<(Gid, usize)> = None;

    // BTreeMap iteration is ascending by GID, so strict comparisons pick the
    // lowest GID among equals.
    for gid in conf.groups.keys() {
        assert!(*gid != UNASSIGNED);
        let count = conf.shards.iter().filter(|owner| *owner == gid).count();

        if min.map(|(_, c)| count < c).unwrap_or(true) {
            min = Some((*gid, count));
        }
        if max.map(|(_, c)| count > c).unwrap_or(true) {
            max = Some((*gid, count));
        }
    }

    let (min_gid, min_assigned) = min.expect("no groups to balance across");
    let (max_gid, max_assigned) = max.expect("no groups to balance across");
    assert!(max_assigned >= min_assigned);

    (min_gid, min_assigned, max_gid, max_assigned)
}

/// Rebalance `conf.shards` after a group-set change.
///
/// Step 1 hands every unassigned shard to the group with the fewest shards.
/// Step 2 moves one shard at a time from the heaviest group to the lightest
/// until the counts differ by at most one. Shards are visited in array
/// order and ties break by ascending GID, so the result is identical on
/// every replica.
fn reassign_shards(conf: &mut ShardConfig) {
    if conf.groups.is_empty() {
        for owner in conf.shards.iter_mut() {
            *owner = UNASSIGNED;
        }
        return;
    }

    for sid in 0..conf.shards.len() {
        if conf.shards[sid] != UNASSIGNED {
            continue;
        }
        let (min_gid, _, _, _) = find_min_max_assigned(conf);
        conf.shards[sid] = min_gid;
    }

    loop {
        let (min_gid, min_assigned, max_gid, max_assigned) = find_min_max_assigned(conf);
        if max_assigned - min_assigned <= 1 {
            break;
        }

        for owner in conf.shards.iter_mut() {
            if *owner == max_gid {
                *owner = min_gid;
                break;
            }
        }
    }
}

/// The shard master service: one Raft-replicated instance of the allocator.
pub struct ShardMaster<N, P>
where
    N: RaftNetwork<MasterCommand>,
    P: Persistence,
{
    rsm: Arc<Rsm<MasterCommand, MasterMachine, N, P>>,
    active: AtomicBool,
}

impl<N, P> ShardMaster<N, P>
where
    N: RaftNetwork<MasterCommand>,
    P: Persistence,
{
    /// Start one master replica.
    pub async fn new(
        id: NodeId,
        peers: Vec<NodeId>,
        config: Arc<Config>,
        network: Arc<N>,
        persister: Arc<P>,
    ) -> Result<Arc<Self>> {
        let (raft, apply_rx) = Raft::new(id, peers, config.clone(), network, persister).await?;
        let rsm = Rsm::new(raft, apply_rx, Arc::new(MasterMachine::new()), config);

        Ok(Arc::new(Self {
            rsm,
            active: AtomicBool::new(true),
        }))
    }

    /// The `ShardMaster.Join` RPC handler.
    pub async fn join(&self, args: JoinArgs) -> JoinReply {
        if !self.active.load(Ordering::SeqCst) {
            return Err(KvError::WrongLeader);
        }
        self.rsm.start(args.id, MasterCommand::Join(args)).await?;
        Ok(())
    }

    /// The `ShardMaster.Leave` RPC handler.
    pub async fn leave(&self, args: LeaveArgs) -> LeaveReply {
        if !self.active.load(Ordering::SeqCst) {
            return Err(KvError::WrongLeader);
        }
        self.rsm.start(args.id, MasterCommand::Leave(args)).await?;
        Ok(())
    }

    /// The `ShardMaster.Move` RPC handler.
    pub async fn move_shard(&self, args: MoveArgs) -> MoveReply {
        if !self.active.load(Ordering::SeqCst) {
            return Err(KvError::WrongLeader);
        }
        self.rsm.start(args.id, MasterCommand::Move(args)).await?;
        Ok(())
    }

    /// The `ShardMaster.Query` RPC handler.
    pub async fn query(&self, args: QueryArgs) -> QueryReply {
        if !self.active.load(Ordering::SeqCst) {
            return Err(KvError::WrongLeader);
        }
        match self.rsm.start(args.id, MasterCommand::Query(args)).await? {
            MasterResponse::Config(config) => Ok(config),
            MasterResponse::Done => unreachable!("query applied to a non-config result"),
        }
    }

    /// Raft RPC ingress, for the transport to deliver consensus traffic.
    pub async fn raft_vote(&self, rpc: VoteRequest) -> Result<VoteResponse> {
        self.rsm.raft().vote(rpc).await
    }

    /// See [`ShardMaster::raft_vote`].
    pub async fn raft_append_entries(
        &self,
        rpc: AppendEntriesRequest<MasterCommand>,
    ) -> Result<AppendEntriesResponse> {
        self.rsm.raft().append_entries(rpc).await
    }

    /// See [`ShardMaster::raft_vote`].
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

    /// Shut this replica down.
    pub async fn shutdown(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.rsm.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;

    fn joined(gids: &[Gid]) -> ShardConfig {
        let mut conf = ShardConfig::empty();
        for gid in gids {
            conf.groups.insert(*gid, vec![format!("g{}-0", gid)]);
        }
        conf.num = 1;
        reassign_shards(&mut conf);
        conf
    }

    fn count(conf: &ShardConfig, gid: Gid) -> usize {
        conf.shards.iter().filter(|owner| **owner == gid).count()
    }

    #[test]
    fn test_rebalance_single_group_takes_everything() {
        let conf = joined(&[1]);
        assert_eq!(count(&conf, 1), 10);
    }

    #[test]
    fn test_rebalance_is_minimal_variance() {
        let conf = joined(&[1, 2, 3]);
        let counts: Vec<usize> = [1, 2, 3].iter().map(|gid| count(&conf, *gid)).collect();
        assert_eq!(counts.iter().sum::<usize>(), 10);
        assert!(counts.iter().max().unwrap() - counts.iter().min().unwrap() <= 1);
    }

    #[test]
    fn test_rebalance_is_deterministic() {
        let a = joined(&[7, 3, 5]);
        let b = joined(&[7, 3, 5]);
        assert_eq!(a.shards, b.shards);
    }

    #[test]
    fn test_leave_of_all_groups_unassigns_everything() {
        let mut conf = joined(&[1, 2]);
        conf.groups.clear();
        reassign_shards(&mut conf);
        assert!(conf.shards.iter().all(|owner| *owner == UNASSIGNED));
    }

    #[test]
    fn test_leave_rebalances_within_difference_of_one() {
        // Three groups at {4, 3, 3}; dropping the 4-shard group must settle
        // at {5, 5} (difference <= 1).
        let mut conf = joined(&[1, 2, 3]);
        let heavy = *conf.groups.keys().find(|gid| count(&conf, **gid) == 4).unwrap();
        conf.groups.remove(&heavy);
        for owner in conf.shards.iter_mut() {
            if *owner == heavy {
                *owner = UNASSIGNED;
            }
        }
        reassign_shards(&mut conf);

        let counts: Vec<usize> = conf.groups.keys().map(|gid| count(&conf, *gid)).collect();
        assert_eq!(counts.iter().sum::<usize>(), 10);
        assert!(counts.iter().max().unwrap() - counts.iter().min().unwrap() <= 1);
    }

    #[test]
    fn test_join_moves_only_what_it_must() {
        // With {1} owning all ten shards, a join of {2} should move five
        // shards, not reshuffle everything.
        let conf1 = joined(&[1]);

        let mut conf2 = conf1.clone();
        conf2.groups.insert(2, vec!["g2-0".into()]);
        conf2.num += 1;
        reassign_shards(&mut conf2);

        assert_eq!(count(&conf2, 1), 5);
        assert_eq!(count(&conf2, 2), 5);
    }

    #[test]
    fn test_duplicate_join_is_suppressed() {
        let machine = MasterMachine::new();
        let args = JoinArgs {
            servers: btreemap! { 1 => vec!["g1-0".to_string()] },
            id: OpId::new(42, 1),
        };

        machine.apply_join(args.clone());
        assert_eq!(machine.state().configs.len(), 2);

        machine.apply_join(args);
        assert_eq!(machine.state().configs.len(), 2, "duplicate join must not produce a config");
    }

    #[test]
    fn test_query_clamps_to_latest() {
        let machine = MasterMachine::new();
        machine.apply_join(JoinArgs {
            servers: btreemap! { 1 => vec!["g1-0".to_string()] },
            id: OpId::new(42, 1),
        });

        let (_, latest) = machine.apply_query(QueryArgs {
            num: None,
            id: OpId::new(43, 1),
        });
        let (_, beyond) = machine.apply_query(QueryArgs {
            num: Some(99),
            id: OpId::new(43, 2),
        });
        let (_, exact) = machine.apply_query(QueryArgs {
            num: Some(0),
            id: OpId::new(43, 3),
        });

        match (latest, beyond, exact) {
            (MasterResponse::Config(a), MasterResponse::Config(b), MasterResponse::Config(c)) => {
                assert_eq!(a.num, 1);
                assert_eq!(b.num, 1);
                assert_eq!(c.num, 0);
            }
            _ => panic!("queries must resolve to configurations"),
        }
    }
}
