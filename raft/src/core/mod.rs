//! The core logic of a Raft node.
//!
//! One replica owns a single coarse lock over all of its replicated and
//! volatile state, plus three worker loops (election, heartbeat, applier)
//! which sleep a short tick and retest state under the lock. Leader-side
//! replication and vote fan-out run on ephemeral spawned tasks. The lock is
//! never held across an outgoing RPC: tasks release it, send, re-acquire,
//! and re-validate (`active`, role, term) before acting on the reply.

mod apply;
mod election;
mod replication;
mod snapshot;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use anyhow::Context as _;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tracing_futures::Instrument;

use crate::config::Config;
use crate::message::ApplyMsg;
use crate::message::Entry;
use crate::message::EntryPayload;
use crate::metrics::RaftMetrics;
use crate::metrics::Wait;
use crate::persist;
use crate::persist::PersistedState;
use crate::AppCommand;
use crate::NodeId;
use crate::Persistence;
use crate::RaftNetwork;

/// All possible roles of a Raft node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// The node is replicating logs from the leader.
    Follower,
    /// The node is campaigning to become the cluster leader.
    Candidate,
    /// The node is the cluster leader.
    Leader,
}

impl Role {
    /// Check if currently in follower state.
    pub fn is_follower(&self) -> bool {
        matches!(self, Self::Follower)
    }

    /// Check if currently in candidate state.
    pub fn is_candidate(&self) -> bool {
        matches!(self, Self::Candidate)
    }

    /// Check if currently in leader state.
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader)
    }
}

/// The Raft API.
///
/// This type is the interface to a running Raft node. It is a cheap handle
/// and should be cloned liberally; the node itself lives on the worker tasks
/// spawned by [`Raft::new`] and stops once [`Raft::shutdown`] is called.
pub struct Raft<C: AppCommand, N: RaftNetwork<C>, P: Persistence> {
    inner: Arc<RaftInner<C, N, P>>,
}

impl<C: AppCommand, N: RaftNetwork<C>, P: Persistence> Clone for Raft<C, N, P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: AppCommand, N: RaftNetwork<C>, P: Persistence> std::ops::Deref for Raft<C, N, P> {
    type Target = RaftInner<C, N, P>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

pub struct RaftInner<C: AppCommand, N: RaftNetwork<C>, P: Persistence> {
    /// This node's ID.
    pub(super) id: NodeId,
    /// This node's runtime config.
    pub(super) config: Arc<Config>,
    /// The `RaftNetwork` implementation.
    pub(super) network: Arc<N>,
    /// The `Persistence` implementation.
    pub(super) persister: Arc<P>,
    /// The coarse lock guarding all replicated and volatile state.
    pub(super) state: Mutex<RaftState<C>>,
    /// The sending half of the apply channel. Taken (and thereby closed)
    /// exactly once, by the applier loop, on shutdown.
    pub(super) apply_tx: Mutex<Option<mpsc::Sender<ApplyMsg<C>>>>,
    pub(super) tx_metrics: watch::Sender<RaftMetrics>,
}

/// The replicated and volatile state of one replica.
pub(super) struct RaftState<C: AppCommand> {
    pub id: NodeId,
    /// All members of the cluster, this node included.
    pub peers: Vec<NodeId>,

    pub role: Role,
    pub current_term: u64,

    /// The live log suffix. Position 0 always holds the sentinel at the
    /// snapshot boundary; logical index `i` lives at position
    /// `i - snapshot_last_index`.
    pub log: Vec<Entry<C>>,
    /// The highest log index contained in the snapshot.
    pub snapshot_last_index: u64,

    pub commit_index: u64,
    pub last_applied: u64,

    /// Last message received from the current leader (followers only).
    pub last_heard_from_leader: Instant,
    /// Last heartbeat sent to followers. `None` forces an immediate round.
    pub last_heartbeat: Option<Instant>,
    /// The election timeout currently in force; regenerated when an
    /// election is triggered.
    pub election_timeout: Duration,

    pub votes_granted: u64,

    pub next_index: BTreeMap<NodeId, u64>,
    pub match_index: BTreeMap<NodeId, u64>,

    pub active: bool,
}

impl<C: AppCommand> RaftState<C> {
    /// The logical length of the log, compaction included.
    pub fn log_len(&self) -> u64 {
        self.snapshot_last_index + self.log.len() as u64
    }

    /// The entry at logical index `index`. The index must be live, i.e.
    /// within `[snapshot_last_index, log_len)`.
    pub fn entry(&self, index: u64) -> &Entry<C> {
        assert!(index >= self.snapshot_last_index, "index {} is compacted", index);
        assert!(index < self.log_len(), "index {} is beyond the log", index);
        &self.log[(index - self.snapshot_last_index) as usize]
    }

    /// Clone the live entries in `[from, to]`. Empty when `to < from`.
    pub fn copy_entries_inclusive(&self, from: u64, to: u64) -> Vec<Entry<C>> {
        if to < from {
            return Vec::new();
        }
        let lo = (from - self.snapshot_last_index) as usize;
        let hi = (to - self.snapshot_last_index) as usize;
        self.log[lo..=hi].to_vec()
    }

    /// Drop the compacted prefix, retaining a sentinel at
    /// `last_included_index` which keeps `prev_log_term` lookups valid.
    ///
    /// `commit_index` and `last_applied` must already cover the trimmed
    /// prefix. Persistence is the caller's responsibility so the
    /// state/snapshot pair is never written half-updated.
    pub fn trim_log_head(&mut self, last_included_index: u64) {
        assert!(last_included_index < self.log_len());
        assert!(last_included_index >= self.snapshot_last_index);
        assert!(self.commit_index >= last_included_index);
        assert!(self.last_applied >= last_included_index);

        let mut new_log = vec![Entry::purged_marker(self.entry(last_included_index).term)];
        new_log.extend(self.copy_entries_inclusive(last_included_index + 1, self.log_len() - 1));

        self.log = new_log;
        self.snapshot_last_index = last_included_index;
    }

    /// Drop the (uncommitted) suffix starting at `first_index_to_drop`.
    pub fn trim_log_tail(&mut self, first_index_to_drop: u64) {
        assert!(first_index_to_drop <= self.log_len());
        assert!(self.commit_index <= first_index_to_drop);

        self.log.truncate((first_index_to_drop - self.snapshot_last_index) as usize);
    }

    /// Step down into follower state at `new_term`. Returns true when the
    /// term advanced and the state must be persisted.
    pub fn become_follower(&mut self, new_term: u64) -> bool {
        assert!(new_term >= self.current_term);
        let term_changed = new_term != self.current_term;

        self.role = Role::Follower;
        self.current_term = new_term;

        term_changed
    }

    /// Step down and reset the election timer: the cluster has a live
    /// leader at `new_term`. Returns true when the state must be persisted.
    pub fn acknowledge_leader(&mut self, new_term: u64) -> bool {
        let term_changed = self.become_follower(new_term);
        self.last_heard_from_leader = Instant::now();
        term_changed
    }

    /// Enter candidate state for a fresh term, voting for ourselves.
    pub fn become_candidate(&mut self) {
        assert!(self.role != Role::Leader);

        self.role = Role::Candidate;
        self.current_term += 1;
        self.votes_granted = 1;
        self.last_heard_from_leader = Instant::now();
    }

    /// Record one granted vote, transitioning to leader on a strict majority.
    pub fn receive_vote(&mut self) {
        self.votes_granted += 1;

        if self.votes_granted > (self.peers.len() / 2) as u64 {
            self.become_leader();
        }
    }

    fn become_leader(&mut self) {
        assert!(self.role == Role::Candidate);
        tracing::info!(id = self.id, term = self.current_term, "won election, becoming leader");

        self.role = Role::Leader;
        self.votes_granted = 0;
        // An immediate heartbeat round is sent by the dedicated worker loop.
        self.last_heartbeat = None;

        let log_len = self.log_len();
        for peer in self.peers.clone() {
            if peer == self.id {
                continue;
            }
            self.next_index.insert(peer, log_len);
            self.match_index.insert(peer, 0);
        }
    }

    /// Advance `commit_index` to `index`.
    ///
    /// A leader refuses to commit an entry from a prior term here, even when
    /// a majority holds it; such entries commit implicitly once an entry of
    /// the current term reaches a majority.
    pub fn set_commit_index(&mut self, index: u64) {
        if index < self.snapshot_last_index {
            return;
        }

        assert!(index > self.commit_index);
        assert!(index < self.log_len());

        if self.role == Role::Leader && self.entry(index).term != self.current_term {
            tracing::debug!(id = self.id, index, "not committing entry from a prior term");
            return;
        }

        tracing::debug!(id = self.id, index, "advancing commit index");
        self.commit_index = index;
    }

    /// Record that `peer` holds the log through `index`, then recompute the
    /// commit index from the match indices.
    pub fn set_match_index(&mut self, peer: NodeId, index: u64) {
        if index < self.match_index[&peer] {
            return;
        }
        assert!(index < self.log_len());
        assert!(self.role == Role::Leader);

        self.match_index.insert(peer, index);

        let mut ii = index;
        while ii > self.commit_index {
            // Count ourselves; the leader's log is always the most complete.
            let mut count = 1;
            for (p, matched) in self.match_index.iter() {
                if *p != self.id && *matched >= ii {
                    count += 1;
                }
            }

            if count > self.peers.len() / 2 {
                self.set_commit_index(ii);
                break;
            }
            ii -= 1;
        }
    }

    /// Encode the persistent portion of this state.
    pub fn serialize(&self) -> Vec<u8> {
        persist::encode_state(self.current_term, self.snapshot_last_index, &self.log)
    }

    fn metrics(&self) -> RaftMetrics {
        RaftMetrics {
            id: self.id,
            role: self.role,
            current_term: self.current_term,
            last_log_index: self.log_len() - 1,
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            snapshot_last_index: self.snapshot_last_index,
        }
    }
}

impl<C: AppCommand, N: RaftNetwork<C>, P: Persistence> Raft<C, N, P> {
    /// Create a new Raft node and spawn its worker loops.
    ///
    /// `peers` lists every member of the cluster, this node included; `id`
    /// must be one of them and must be stable across restarts, since the
    /// persisted state read back here is keyed to it by the caller.
    ///
    /// Returns the API handle together with the receiving half of the apply
    /// channel, on which committed commands and installed snapshots are
    /// delivered in log-index order.
    pub async fn new(
        id: NodeId,
        peers: Vec<NodeId>,
        config: Arc<Config>,
        network: Arc<N>,
        persister: Arc<P>,
    ) -> Result<(Self, mpsc::Receiver<ApplyMsg<C>>)> {
        assert!(peers.contains(&id), "node {} is not a member of {:?}", id, peers);

        let mut state = RaftState {
            id,
            peers,
            role: Role::Follower,
            current_term: 0,
            log: vec![Entry::purged_marker(0)],
            snapshot_last_index: 0,
            commit_index: 0,
            last_applied: 0,
            last_heard_from_leader: Instant::now(),
            last_heartbeat: None,
            election_timeout: config.new_rand_election_timeout(),
            votes_granted: 0,
            next_index: BTreeMap::new(),
            match_index: BTreeMap::new(),
            active: true,
        };

        // Recover from state persisted before a crash.
        let blob = persister.read_raft_state().await.context("failed to read persisted raft state")?;
        if !blob.is_empty() {
            let persisted = PersistedState::decode(&blob)?;
            state.current_term = persisted.current_term;
            state.snapshot_last_index = persisted.snapshot_last_index;
            state.log = persisted.log;

            // Avoid erroneously re-applying compacted entries.
            state.commit_index = state.snapshot_last_index;
            state.last_applied = state.snapshot_last_index;
            tracing::info!(
                id,
                term = state.current_term,
                snapshot_last_index = state.snapshot_last_index,
                log_len = state.log_len(),
                "recovered persisted raft state"
            );
        }

        let (apply_tx, apply_rx) = mpsc::channel(config.apply_channel_capacity);
        let (tx_metrics, _) = watch::channel(state.metrics());

        let this = Self {
            inner: Arc::new(RaftInner {
                id,
                config,
                network,
                persister,
                state: Mutex::new(state),
                apply_tx: Mutex::new(Some(apply_tx)),
                tx_metrics,
            }),
        };

        tokio::spawn(this.clone().election_loop().instrument(tracing::debug_span!("election", id)));
        tokio::spawn(this.clone().heartbeat_loop().instrument(tracing::debug_span!("heartbeat", id)));
        tokio::spawn(this.clone().applier_loop().instrument(tracing::debug_span!("applier", id)));

        Ok((this, apply_rx))
    }

    /// Start agreement on the next command to be appended to the log.
    ///
    /// Returns the index the command will appear at if it ever commits,
    /// along with the current term, or `None` when this node is not the
    /// leader (or has been shut down). There is no guarantee the command
    /// commits; callers must correlate on the apply stream.
    #[tracing::instrument(level = "debug", skip(self, command))]
    pub async fn start(&self, command: C) -> Option<(u64, u64)> {
        let mut st = self.state.lock().await;

        if !st.active || st.role != Role::Leader {
            return None;
        }

        let index = st.log_len();
        let term = st.current_term;

        tracing::debug!(id = self.id, index, term, "starting consensus for command");
        st.log.push(Entry {
            term,
            payload: EntryPayload::Normal(command),
        });
        self.persist(&mut st).await;

        for peer in st.peers.clone() {
            if peer == self.id {
                continue;
            }
            tokio::spawn(self.clone().append_loop(peer, term, index));
        }
        st.last_heartbeat = Some(Instant::now());

        self.report_metrics(&st);
        Some((index, term))
    }

    /// The node's current term and whether it believes it is the leader.
    pub async fn current_state(&self) -> (u64, bool) {
        let st = self.state.lock().await;
        (st.current_term, st.role == Role::Leader)
    }

    /// Whether this node currently believes it is the leader.
    pub async fn is_leader(&self) -> bool {
        self.state.lock().await.role == Role::Leader
    }

    /// Mark the node inactive. Every loop and RPC handler observes the flag
    /// and terminates promptly; the applier closes the apply channel.
    pub async fn shutdown(&self) {
        let mut st = self.state.lock().await;
        st.active = false;
    }

    /// Get a handle to the metrics channel.
    pub fn metrics(&self) -> watch::Receiver<RaftMetrics> {
        self.tx_metrics.subscribe()
    }

    /// Get a handle to wait for the metrics to satisfy some condition.
    pub fn wait(&self, timeout: Option<Duration>) -> Wait {
        Wait {
            timeout: timeout.unwrap_or_else(|| Duration::from_millis(500)),
            rx: self.tx_metrics.subscribe(),
        }
    }

    /// Write the persistent state. A storage failure is not recoverable:
    /// the node is shut down.
    pub(super) async fn persist(&self, st: &mut RaftState<C>) {
        let blob = st.serialize();
        if let Err(err) = self.persister.save_raft_state(blob).await {
            tracing::error!(id = self.id, error = %err, "fatal storage error, shutting down");
            st.active = false;
        }
    }

    /// As `persist`, but writing the state and snapshot blobs atomically.
    pub(super) async fn persist_with_snapshot(&self, st: &mut RaftState<C>, snapshot: Vec<u8>) {
        let blob = st.serialize();
        if let Err(err) = self.persister.save_state_and_snapshot(blob, snapshot).await {
            tracing::error!(id = self.id, error = %err, "fatal storage error, shutting down");
            st.active = false;
        }
    }

    /// Report a metrics payload on the current state of this node.
    pub(super) fn report_metrics(&self, st: &RaftState<C>) {
        let _ = self.tx_metrics.send(st.metrics());
    }
}
