//! An in-memory service router with fault injection.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Context as _;
use anyhow::Result;
use async_trait::async_trait;
use rand::thread_rng;
use rand::Rng;
use shard_kv::group::KvCommand;
use shard_kv::master::MasterCommand;
use shard_kv::rpc::DeleteTransferArgs;
use shard_kv::rpc::DeleteTransferReply;
use shard_kv::rpc::FetchShardArgs;
use shard_kv::rpc::FetchShardReply;
use shard_kv::rpc::GetArgs;
use shard_kv::rpc::GetReply;
use shard_kv::rpc::JoinArgs;
use shard_kv::rpc::JoinReply;
use shard_kv::rpc::LeaveArgs;
use shard_kv::rpc::LeaveReply;
use shard_kv::rpc::MoveArgs;
use shard_kv::rpc::MoveReply;
use shard_kv::rpc::PutAppendArgs;
use shard_kv::rpc::PutAppendReply;
use shard_kv::rpc::QueryArgs;
use shard_kv::rpc::QueryReply;
use shard_kv::Gid;
use shard_kv::KvClerk;
use shard_kv::MasterClerk;
use shard_kv::ServiceNetwork;
use shard_kv::ShardKv;
use shard_kv::ShardMaster;
use shard_raft::metrics::Wait;
use shard_raft::AppendEntriesRequest;
use shard_raft::AppendEntriesResponse;
use shard_raft::Config;
use shard_raft::InstallSnapshotRequest;
use shard_raft::InstallSnapshotResponse;
use shard_raft::NodeId;
use shard_raft::RaftMetrics;
use shard_raft::RaftNetwork;
use shard_raft::Role;
use shard_raft::VoteRequest;
use shard_raft::VoteResponse;
use tokio::sync::RwLock;
use tokio::time::sleep;

use crate::persist::MemPersistence;

/// A shard master replica wired to the in-memory transports.
pub type MemMaster = ShardMaster<MasterRaftNet, MemPersistence>;
/// A group replica wired to the in-memory transports.
pub type MemShardKv = ShardKv<KvRaftNet, MemPersistence, Router>;

/// A running service instance reachable through the router.
pub enum ServiceHandle {
    Master(Arc<MemMaster>),
    Kv(Arc<MemShardKv>),
}

/// Everything needed to restart a crashed node in place.
enum NodeSpec {
    Master {
        members: Vec<String>,
        index: u64,
    },
    Kv {
        gid: Gid,
        members: Vec<String>,
        index: u64,
        masters: Vec<String>,
        max_raft_state: Option<usize>,
    },
}

/// A type which emulates the network: routes service RPCs by server name
/// and Raft RPCs inside each group, and injects faults on demand.
pub struct Router {
    /// The Raft runtime config all spawned nodes use.
    config: Arc<Config>,
    /// The table of live nodes. Crashed nodes are absent.
    nodes: RwLock<BTreeMap<String, ServiceHandle>>,
    /// Isolated nodes can neither send nor receive frames.
    isolated: RwLock<HashSet<String>>,
    /// Each node's persistence, retained across crashes.
    persisters: Mutex<HashMap<String, Arc<MemPersistence>>>,
    /// Each node's construction recipe, for restarts.
    specs: Mutex<HashMap<String, NodeSpec>>,
    /// Percentage of messages to drop.
    drop_rate: AtomicU32,
    /// Upper bound of the random delay added to each send, in milliseconds.
    send_delay: AtomicU64,
}

impl Router {
    /// Create a new instance.
    pub fn new(config: Arc<Config>) -> Arc<Self> {
        Arc::new(Self {
            config,
            nodes: RwLock::new(BTreeMap::new()),
            isolated: RwLock::new(HashSet::new()),
            persisters: Mutex::new(HashMap::new()),
            specs: Mutex::new(HashMap::new()),
            drop_rate: AtomicU32::new(0),
            send_delay: AtomicU64::new(0),
        })
    }

    /// Drop this percentage of messages at random.
    pub fn set_drop_rate(&self, percent: u32) {
        self.drop_rate.store(percent, Ordering::SeqCst);
    }

    /// Delay each send by a random amount up to `ms` milliseconds.
    pub fn network_send_delay(&self, ms: u64) {
        self.send_delay.store(ms, Ordering::SeqCst);
    }

    /// Cut a node off: it can neither send nor receive.
    pub async fn isolate_node(&self, name: &str) {
        self.isolated.write().await.insert(name.to_string());
    }

    /// Restore an isolated node's connectivity.
    pub async fn restore_node(&self, name: &str) {
        self.isolated.write().await.remove(name);
    }

    async fn chaos(&self) -> Result<()> {
        let delay = self.send_delay.load(Ordering::SeqCst);
        if delay > 0 {
            let ms = thread_rng().gen_range(0..delay);
            sleep(Duration::from_millis(ms)).await;
        }

        let drop = self.drop_rate.load(Ordering::SeqCst);
        if drop > 0 && thread_rng().gen_range(0..100) < drop {
            return Err(anyhow!("message dropped"));
        }
        Ok(())
    }

    /// Gate a Raft frame: both endpoints must be connected.
    async fn raft_gate(&self, from: &str, to: &str) -> Result<()> {
        let isolated = self.isolated.read().await;
        if isolated.contains(from) || isolated.contains(to) {
            return Err(anyhow!("node is isolated"));
        }
        drop(isolated);
        self.chaos().await
    }

    /// Gate a service frame: the target must be connected.
    async fn service_gate(&self, to: &str) -> Result<()> {
        if self.isolated.read().await.contains(to) {
            return Err(anyhow!("node is isolated"));
        }
        self.chaos().await
    }

    async fn master_handle(&self, name: &str) -> Result<Arc<MemMaster>> {
        match self.nodes.read().await.get(name) {
            Some(ServiceHandle::Master(handle)) => Ok(handle.clone()),
            Some(ServiceHandle::Kv(_)) => Err(anyhow!("{} is not a shard master", name)),
            None => Err(anyhow!("no node named {}", name)),
        }
    }

    async fn kv_handle(&self, name: &str) -> Result<Arc<MemShardKv>> {
        match self.nodes.read().await.get(name) {
            Some(ServiceHandle::Kv(handle)) => Ok(handle.clone()),
            Some(ServiceHandle::Master(_)) => Err(anyhow!("{} is not a kv server", name)),
            None => Err(anyhow!("no node named {}", name)),
        }
    }

    fn persister_for(&self, name: &str) -> Arc<MemPersistence> {
        let mut persisters = self.persisters.lock().expect("router persisters mutex poisoned");
        persisters
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemPersistence::new()))
            .clone()
    }

    /// A node's retained persistence, whether it is live or crashed.
    pub fn persister(&self, name: &str) -> Arc<MemPersistence> {
        self.persister_for(name)
    }

    /// Spawn an `n`-replica shard master cluster; returns its server names.
    pub async fn spawn_masters(self: &Arc<Self>, n: u64) -> Result<Vec<String>> {
        let names: Vec<String> = (0..n).map(|i| format!("master-{}", i)).collect();
        for index in 0..n {
            let spec = NodeSpec::Master {
                members: names.clone(),
                index,
            };
            self.spawn_node(&names[index as usize], spec).await?;
        }
        Ok(names)
    }

    /// Spawn an `n`-replica KV group; returns its server names.
    pub async fn spawn_group(
        self: &Arc<Self>,
        gid: Gid,
        n: u64,
        masters: Vec<String>,
        max_raft_state: Option<usize>,
    ) -> Result<Vec<String>> {
        let names: Vec<String> = (0..n).map(|i| format!("g{}-{}", gid, i)).collect();
        for index in 0..n {
            let spec = NodeSpec::Kv {
                gid,
                members: names.clone(),
                index,
                masters: masters.clone(),
                max_raft_state,
            };
            self.spawn_node(&names[index as usize], spec).await?;
        }
        Ok(names)
    }

    async fn spawn_node(self: &Arc<Self>, name: &str, spec: NodeSpec) -> Result<()> {
        let persister = self.persister_for(name);

        let handle = match &spec {
            NodeSpec::Master { members, index } => {
                let network = Arc::new(MasterRaftNet {
                    router: self.clone(),
                    local: name.to_string(),
                    members: members.clone(),
                });
                let peers: Vec<NodeId> = (0..members.len() as u64).collect();
                let master = ShardMaster::new(*index, peers, self.config.clone(), network, persister).await?;
                ServiceHandle::Master(master)
            }
            NodeSpec::Kv {
                gid,
                members,
                index,
                masters,
                max_raft_state,
            } => {
                let network = Arc::new(KvRaftNet {
                    router: self.clone(),
                    local: name.to_string(),
                    members: members.clone(),
                });
                let peers: Vec<NodeId> = (0..members.len() as u64).collect();
                let kv = ShardKv::new(
                    *gid,
                    *index,
                    peers,
                    masters.clone(),
                    self.config.clone(),
                    network,
                    persister,
                    self.clone(),
                    *max_raft_state,
                )
                .await?;
                ServiceHandle::Kv(kv)
            }
        };

        self.specs.lock().expect("router specs mutex poisoned").insert(name.to_string(), spec);
        self.nodes.write().await.insert(name.to_string(), handle);
        Ok(())
    }

    /// Crash a node: shut it down and unplug it. Its persistence survives.
    pub async fn crash_node(&self, name: &str) -> Result<()> {
        tracing::info!(name, "crashing node");
        let handle = self
            .nodes
            .write()
            .await
            .remove(name)
            .with_context(|| format!("no node named {}", name))?;

        match handle {
            ServiceHandle::Master(master) => master.shutdown().await,
            ServiceHandle::Kv(kv) => kv.shutdown().await,
        }
        Ok(())
    }

    /// Restart a crashed node from its retained persistence.
    pub async fn restart_node(self: &Arc<Self>, name: &str) -> Result<()> {
        tracing::info!(name, "restarting node");
        let spec = self
            .specs
            .lock()
            .expect("router specs mutex poisoned")
            .remove(name)
            .with_context(|| format!("{} was never spawned", name))?;
        self.spawn_node(name, spec).await
    }

    /// The latest metrics payload of one node.
    pub async fn metrics(&self, name: &str) -> Result<RaftMetrics> {
        let nodes = self.nodes.read().await;
        let metrics = match nodes.get(name).with_context(|| format!("no node named {}", name))? {
            ServiceHandle::Master(master) => master.metrics().borrow().clone(),
            ServiceHandle::Kv(kv) => kv.metrics().borrow().clone(),
        };
        Ok(metrics)
    }

    /// A handle to await a metrics condition on one node.
    pub async fn wait(&self, name: &str, timeout: Option<Duration>) -> Result<Wait> {
        let nodes = self.nodes.read().await;
        let wait = match nodes.get(name).with_context(|| format!("no node named {}", name))? {
            ServiceHandle::Master(master) => master.wait(timeout),
            ServiceHandle::Kv(kv) => kv.wait(timeout),
        };
        Ok(wait)
    }

    /// Wait for every listed node to hold and have applied `want_log`.
    pub async fn wait_for_log(&self, names: &[String], want_log: u64, timeout: Option<Duration>, msg: &str) -> Result<()> {
        for name in names {
            self.wait(name, timeout).await?.log(want_log, msg).await?;
        }
        Ok(())
    }

    /// The connected leader among `names`, if one exists right now.
    pub async fn leader(&self, names: &[String]) -> Option<String> {
        let isolated = self.isolated.read().await;
        for name in names {
            if isolated.contains(name) {
                continue;
            }
            if let Ok(metrics) = self.metrics(name).await {
                if metrics.role == Role::Leader {
                    return Some(name.clone());
                }
            }
        }
        None
    }

    /// Wait until `names` has a connected leader and return it.
    pub async fn wait_for_leader(&self, names: &[String], timeout: Duration) -> Result<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(leader) = self.leader(names).await {
                return Ok(leader);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(anyhow!("no leader among {:?} within {:?}", names, timeout));
            }
            sleep(Duration::from_millis(20)).await;
        }
    }

    /// The configuration one group replica currently operates under.
    pub async fn group_config(&self, name: &str) -> Result<shard_kv::ShardConfig> {
        Ok(self.kv_handle(name).await?.current_config())
    }

    /// A clerk for the shard master service.
    pub fn master_clerk(self: &Arc<Self>, masters: Vec<String>) -> MasterClerk<Router> {
        MasterClerk::new(self.clone(), masters)
    }

    /// A clerk for the sharded KV service.
    pub fn kv_clerk(self: &Arc<Self>, masters: Vec<String>) -> KvClerk<Router> {
        KvClerk::new(self.clone(), masters)
    }

    /// Shut every live node down.
    pub async fn shutdown_all(&self) {
        let nodes: Vec<String> = self.nodes.read().await.keys().cloned().collect();
        for name in nodes {
            let _ = self.crash_node(&name).await;
        }
    }
}

#[async_trait]
impl ServiceNetwork for Router {
    async fn join(&self, target: &str, args: JoinArgs) -> Result<JoinReply> {
        self.service_gate(target).await?;
        let handle = self.master_handle(target).await?;
        Ok(handle.join(args).await)
    }

    async fn leave(&self, target: &str, args: LeaveArgs) -> Result<LeaveReply> {
        self.service_gate(target).await?;
        let handle = self.master_handle(target).await?;
        Ok(handle.leave(args).await)
    }

    async fn move_shard(&self, target: &str, args: MoveArgs) -> Result<MoveReply> {
        self.service_gate(target).await?;
        let handle = self.master_handle(target).await?;
        Ok(handle.move_shard(args).await)
    }

    async fn query(&self, target: &str, args: QueryArgs) -> Result<QueryReply> {
        self.service_gate(target).await?;
        let handle = self.master_handle(target).await?;
        Ok(handle.query(args).await)
    }

    async fn get(&self, target: &str, args: GetArgs) -> Result<GetReply> {
        self.service_gate(target).await?;
        let handle = self.kv_handle(target).await?;
        Ok(handle.get(args).await)
    }

    async fn put_append(&self, target: &str, args: PutAppendArgs) -> Result<PutAppendReply> {
        self.service_gate(target).await?;
        let handle = self.kv_handle(target).await?;
        Ok(handle.put_append(args).await)
    }

    async fn fetch_shard(&self, target: &str, args: FetchShardArgs) -> Result<FetchShardReply> {
        self.service_gate(target).await?;
        let handle = self.kv_handle(target).await?;
        Ok(handle.fetch_shard(args).await)
    }

    async fn delete_transfer(&self, target: &str, args: DeleteTransferArgs) -> Result<DeleteTransferReply> {
        self.service_gate(target).await?;
        let handle = self.kv_handle(target).await?;
        Ok(handle.delete_transfer(args).await)
    }
}

/// The Raft transport of one master replica.
pub struct MasterRaftNet {
    router: Arc<Router>,
    local: String,
    members: Vec<String>,
}

#[async_trait]
impl RaftNetwork<MasterCommand> for MasterRaftNet {
    async fn send_vote(&self, target: NodeId, rpc: VoteRequest) -> Result<VoteResponse> {
        let to = &self.members[target as usize];
        self.router.raft_gate(&self.local, to).await?;
        self.router.master_handle(to).await?.raft_vote(rpc).await
    }

    async fn send_append_entries(
        &self,
        target: NodeId,
        rpc: AppendEntriesRequest<MasterCommand>,
    ) -> Result<AppendEntriesResponse> {
        let to = &self.members[target as usize];
        self.router.raft_gate(&self.local, to).await?;
        self.router.master_handle(to).await?.raft_append_entries(rpc).await
    }

    async fn send_install_snapshot(
        &self,
        target: NodeId,
        rpc: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let to = &self.members[target as usize];
        self.router.raft_gate(&self.local, to).await?;
        self.router.master_handle(to).await?.raft_install_snapshot(rpc).await
    }
}

/// The Raft transport of one group replica.
pub struct KvRaftNet {
    router: Arc<Router>,
    local: String,
    members: Vec<String>,
}

#[async_trait]
impl RaftNetwork<KvCommand> for KvRaftNet {
    async fn send_vote(&self, target: NodeId, rpc: VoteRequest) -> Result<VoteResponse> {
        let to = &self.members[target as usize];
        self.router.raft_gate(&self.local, to).await?;
        self.router.kv_handle(to).await?.raft_vote(rpc).await
    }

    async fn send_append_entries(
        &self,
        target: NodeId,
        rpc: AppendEntriesRequest<KvCommand>,
    ) -> Result<AppendEntriesResponse> {
        let to = &self.members[target as usize];
        self.router.raft_gate(&self.local, to).await?;
        self.router.kv_handle(to).await?.raft_append_entries(rpc).await
    }

    async fn send_install_snapshot(
        &self,
        target: NodeId,
        rpc: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let to = &self.members[target as usize];
        self.router.raft_gate(&self.local, to).await?;
        self.router.kv_handle(to).await?.raft_install_snapshot(rpc).await
    }
}
