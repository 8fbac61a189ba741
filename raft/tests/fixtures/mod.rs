//! Fixtures for testing the Raft engine.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Context as _;
use anyhow::Result;
use async_trait::async_trait;
use memnet::MemPersistence;
use rand::thread_rng;
use rand::Rng;
use shard_raft::metrics::Wait;
use shard_raft::Persistence;
use shard_raft::AppendEntriesRequest;
use shard_raft::AppendEntriesResponse;
use shard_raft::ApplyMsg;
use shard_raft::Config;
use shard_raft::InstallSnapshotRequest;
use shard_raft::InstallSnapshotResponse;
use shard_raft::NodeId;
use shard_raft::Raft;
use shard_raft::RaftNetwork;
use shard_raft::Role;
use shard_raft::VoteRequest;
use shard_raft::VoteResponse;
use tokio::sync::RwLock;
use tokio::time::sleep;
use tracing_subscriber::prelude::*;

/// A concrete Raft type used during testing. Commands are plain numbers.
pub type TestRaft = Raft<u64, RaftRouter, MemPersistence>;

/// The record of everything one node has applied, in order. A snapshot
/// carries the whole record, so restoring one replaces the record.
pub type AppliedLog = Arc<Mutex<Vec<(u64, u64)>>>;

/// Initialize the tracing system.
pub fn init_tracing() {
    let fmt_layer = tracing_subscriber::fmt::Layer::default().with_ansi(false);
    let subscriber = tracing_subscriber::Registry::default()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(fmt_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// One live node and the test's handles onto it.
#[derive(Clone)]
pub struct NodeHandle {
    pub raft: TestRaft,
    pub persister: Arc<MemPersistence>,
    pub applied: AppliedLog,
}

/// A type which emulates a network transport and implements `RaftNetwork`.
pub struct RaftRouter {
    config: Arc<Config>,
    /// The number of cluster members; node ids are `0..n`.
    n: u64,
    /// The table of all live nodes. Crashed nodes are absent.
    nodes: RwLock<BTreeMap<NodeId, NodeHandle>>,
    /// Nodes which can neither send nor receive frames.
    isolated: RwLock<HashSet<NodeId>>,
    /// Percentage of messages to drop.
    drop_rate: AtomicU32,
}

impl RaftRouter {
    /// Create a new instance for an `n`-member cluster.
    pub fn new(n: u64, config: Arc<Config>) -> Arc<Self> {
        Arc::new(Self {
            config,
            n,
            nodes: RwLock::new(BTreeMap::new()),
            isolated: RwLock::new(HashSet::new()),
            drop_rate: AtomicU32::new(0),
        })
    }

    /// Spawn every member on a fresh persister.
    pub async fn spawn_all(self: &Arc<Self>) -> Result<()> {
        for id in 0..self.n {
            self.spawn_node(id, Arc::new(MemPersistence::new())).await?;
        }
        Ok(())
    }

    /// Spawn one member on the given persister (fresh or recovered).
    pub async fn spawn_node(self: &Arc<Self>, id: NodeId, persister: Arc<MemPersistence>) -> Result<()> {
        // As a real application would, restore the applied record from the
        // persisted snapshot; the raft below resumes from the same boundary.
        let snapshot = persister.read_snapshot().await?;
        let restored: Vec<(u64, u64)> = if snapshot.is_empty() {
            Vec::new()
        } else {
            serde_json::from_slice(&snapshot)?
        };

        let peers: Vec<NodeId> = (0..self.n).collect();
        let (raft, mut apply_rx) =
            Raft::new(id, peers, self.config.clone(), self.clone(), persister.clone()).await?;

        let applied: AppliedLog = Arc::new(Mutex::new(restored));
        let consumer_log = applied.clone();
        tokio::spawn(async move {
            while let Some(msg) = apply_rx.recv().await {
                match msg {
                    ApplyMsg::Command { index, command } => {
                        consumer_log.lock().unwrap().push((index, command));
                    }
                    ApplyMsg::Snapshot { data } => {
                        let decoded: Vec<(u64, u64)> =
                            serde_json::from_slice(&data).expect("snapshot blob must decode");
                        *consumer_log.lock().unwrap() = decoded;
                    }
                }
            }
        });

        let handle = NodeHandle {
            raft,
            persister,
            applied,
        };
        self.nodes.write().await.insert(id, handle);
        Ok(())
    }

    /// A handle onto one live node.
    pub async fn node(&self, id: NodeId) -> NodeHandle {
        self.nodes
            .read()
            .await
            .get(&id)
            .unwrap_or_else(|| panic!("node {} does not exist", id))
            .clone()
    }

    /// Shut a node down and unplug it, returning its handle so the test can
    /// restart it from the same persister.
    pub async fn crash_node(&self, id: NodeId) -> Result<NodeHandle> {
        let handle = self
            .nodes
            .write()
            .await
            .remove(&id)
            .with_context(|| format!("node {} does not exist", id))?;
        handle.raft.shutdown().await;
        Ok(handle)
    }

    /// Isolate the network of the specified node.
    pub async fn isolate_node(&self, id: NodeId) {
        self.isolated.write().await.insert(id);
    }

    /// Restore the network of the specified node.
    pub async fn restore_node(&self, id: NodeId) {
        self.isolated.write().await.remove(&id);
    }

    /// Drop this percentage of messages at random.
    pub fn set_drop_rate(&self, percent: u32) {
        self.drop_rate.store(percent, Ordering::SeqCst);
    }

    /// The connected node currently in leader state, if any.
    pub async fn leader(&self) -> Option<NodeId> {
        let isolated = self.isolated.read().await;
        for (id, handle) in self.nodes.read().await.iter() {
            if isolated.contains(id) {
                continue;
            }
            if handle.raft.metrics().borrow().role == Role::Leader {
                return Some(*id);
            }
        }
        None
    }

    /// Wait until the connected majority has a leader and return it.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<NodeId> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(leader) = self.leader().await {
                return Ok(leader);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(anyhow!("no leader within {:?}", timeout));
            }
            sleep(Duration::from_millis(20)).await;
        }
    }

    /// Submit a command on the given node.
    pub async fn start(&self, id: NodeId, command: u64) -> Option<(u64, u64)> {
        self.node(id).await.raft.start(command).await
    }

    /// Submit a command on the current leader, retrying through leadership
    /// churn, and wait until every connected node has applied it.
    ///
    /// Commands must be unique per test: a retry first checks whether an
    /// earlier attempt already committed, so nothing is ever applied twice.
    pub async fn commit_one(&self, command: u64) -> Result<u64> {
        for _ in 0..50 {
            let leader = match self.leader().await {
                Some(leader) => leader,
                None => {
                    sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };

            if let Some((index, _)) = self.applied(leader).await.iter().find(|(_, c)| *c == command) {
                return Ok(*index);
            }

            if let Some((index, _term)) = self.start(leader, command).await {
                let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
                while tokio::time::Instant::now() < deadline {
                    if self.applied(leader).await.iter().any(|(_, c)| *c == command) {
                        return Ok(index);
                    }
                    sleep(Duration::from_millis(20)).await;
                }
            }
            sleep(Duration::from_millis(100)).await;
        }
        Err(anyhow!("could not commit command {}", command))
    }

    /// A copy of everything the node has applied so far.
    pub async fn applied(&self, id: NodeId) -> Vec<(u64, u64)> {
        self.node(id).await.applied.lock().unwrap().clone()
    }

    /// A handle to await a metrics condition on one node.
    pub async fn wait(&self, id: NodeId, timeout: Option<Duration>) -> Wait {
        self.node(id).await.raft.wait(timeout)
    }

    /// Wait until every listed node has applied `want` entries, then assert
    /// that all of their applied records are identical.
    pub async fn wait_for_identical_logs(&self, ids: &[NodeId], want: usize, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        'outer: loop {
            for id in ids {
                if self.applied(*id).await.len() < want {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(anyhow!(
                            "node {} applied {} of {} entries within {:?}",
                            id,
                            self.applied(*id).await.len(),
                            want,
                            timeout
                        ));
                    }
                    sleep(Duration::from_millis(20)).await;
                    continue 'outer;
                }
            }
            break;
        }

        let reference = self.applied(ids[0]).await;
        for id in ids.iter().skip(1) {
            let log = self.applied(*id).await;
            // Committed prefixes must agree entry for entry.
            let prefix = std::cmp::min(reference.len(), log.len());
            assert_eq!(
                &reference[..prefix],
                &log[..prefix],
                "node {} diverges from node {}",
                id,
                ids[0]
            );
        }
        Ok(())
    }
}

#[async_trait]
impl RaftNetwork<u64> for RaftRouter {
    async fn send_vote(&self, target: NodeId, rpc: VoteRequest) -> Result<VoteResponse> {
        self.gate(rpc.candidate_id, target).await?;
        let node = self.lookup(target).await?;
        node.raft.vote(rpc).await
    }

    async fn send_append_entries(&self, target: NodeId, rpc: AppendEntriesRequest<u64>) -> Result<AppendEntriesResponse> {
        self.gate(rpc.leader_id, target).await?;
        let node = self.lookup(target).await?;
        node.raft.append_entries(rpc).await
    }

    async fn send_install_snapshot(&self, target: NodeId, rpc: InstallSnapshotRequest) -> Result<InstallSnapshotResponse> {
        self.gate(rpc.leader_id, target).await?;
        let node = self.lookup(target).await?;
        node.raft.install_snapshot(rpc).await
    }
}

impl RaftRouter {
    async fn gate(&self, from: NodeId, to: NodeId) -> Result<()> {
        let isolated = self.isolated.read().await;
        if isolated.contains(&from) || isolated.contains(&to) {
            return Err(anyhow!("node is isolated"));
        }
        drop(isolated);

        let drop_rate = self.drop_rate.load(Ordering::SeqCst);
        if drop_rate > 0 && thread_rng().gen_range(0..100) < drop_rate {
            return Err(anyhow!("message dropped"));
        }
        Ok(())
    }

    async fn lookup(&self, target: NodeId) -> Result<NodeHandle> {
        self.nodes
            .read()
            .await
            .get(&target)
            .cloned()
            .with_context(|| format!("node {} is down", target))
    }
}
