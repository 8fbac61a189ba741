//! Log compaction and snapshot installation.

use anyhow::anyhow;
use anyhow::Result;

use crate::core::Raft;
use crate::core::RaftState;
use crate::core::Role;
use crate::message::ApplyMsg;
use crate::message::Entry;
use crate::message::InstallSnapshotRequest;
use crate::message::InstallSnapshotResponse;
use crate::AppCommand;
use crate::MessageSummary;
use crate::NodeId;
use crate::Persistence;
use crate::RaftNetwork;

impl<C: AppCommand, N: RaftNetwork<C>, P: Persistence> Raft<C, N, P> {
    /// Compact the log through `last_included_index`, which the application
    /// has captured in `snapshot`.
    ///
    /// The prefix being discarded must already be applied; the state and
    /// snapshot blobs are written together so a crash can never observe one
    /// without the other. A call which races with a concurrent compaction or
    /// an incoming InstallSnapshot simply returns; the application retries
    /// on its own schedule.
    #[tracing::instrument(level = "debug", skip(self, snapshot), fields(id = self.id, last_included_index))]
    pub async fn compact(&self, last_included_index: u64, snapshot: Vec<u8>) {
        let mut st = self.state.lock().await;
        if !st.active {
            return;
        }

        if last_included_index < st.snapshot_last_index {
            return;
        }

        assert!(st.commit_index >= last_included_index);
        assert!(st.last_applied >= last_included_index);

        st.trim_log_head(last_included_index);
        self.persist_with_snapshot(&mut st, snapshot).await;

        tracing::debug!(id = self.id, last_included_index, "compacted log into snapshot");
        self.report_metrics(&st);
    }

    /// Ship the current snapshot to a peer whose `next_index` fell behind
    /// the snapshot boundary. Called from the append loop, which retries on
    /// failure on its next round.
    pub(super) async fn send_install_snapshot(&self, peer: NodeId, term: u64) {
        let req = {
            let st = self.state.lock().await;

            if !st.active || st.role != Role::Leader || st.current_term != term {
                return;
            }

            let data = match self.persister.read_snapshot().await {
                Ok(data) => data,
                Err(err) => {
                    tracing::error!(id = self.id, error = %err, "failed to read snapshot blob");
                    return;
                }
            };

            InstallSnapshotRequest {
                term: st.current_term,
                leader_id: self.id,
                last_included_index: st.snapshot_last_index,
                last_included_term: st.entry(st.snapshot_last_index).term,
                data,
            }
        };

        tracing::debug!(id = self.id, peer, "sending InstallSnapshot: {}", req.summary());
        let reply = match self.network.send_install_snapshot(peer, req).await {
            Ok(reply) => reply,
            Err(err) => {
                tracing::debug!(id = self.id, peer, error = %err, "InstallSnapshot failed");
                return;
            }
        };

        let mut st = self.state.lock().await;
        tracing::debug!(id = self.id, peer, success = reply.success, "received InstallSnapshot reply");

        if reply.term > st.current_term {
            st.acknowledge_leader(reply.term);
            self.persist(&mut st).await;
            self.report_metrics(&st);
            return;
        }

        if !st.active || st.role != Role::Leader || st.current_term != term || !reply.success {
            return;
        }

        let boundary = st.snapshot_last_index;
        st.next_index.insert(peer, boundary + 1);
        st.set_match_index(peer, boundary);
        self.report_metrics(&st);
    }

    /// The InstallSnapshot RPC handler.
    ///
    /// The snapshot is adopted according to how it overlaps the local log;
    /// see the match below for the cases. The state lock is held across the
    /// apply-channel emission so that no command apply can interleave with
    /// the state machine replacing its state.
    #[tracing::instrument(level = "debug", skip(self, req), fields(id = self.id, req = %req.summary()))]
    pub async fn install_snapshot(&self, req: InstallSnapshotRequest) -> Result<InstallSnapshotResponse> {
        let mut st = self.state.lock().await;
        if !st.active {
            return Err(anyhow!("node {} is shutting down", self.id));
        }

        if req.term < st.current_term {
            return Ok(InstallSnapshotResponse {
                term: st.current_term,
                success: false,
            });
        }

        if st.acknowledge_leader(req.term) {
            self.persist(&mut st).await;
        }

        // Outdated snapshot: we already compacted past it.
        if req.last_included_index < st.snapshot_last_index {
            tracing::debug!(
                id = self.id,
                snapshot_last_index = st.snapshot_last_index,
                "rejecting InstallSnapshot: outdated"
            );
            return Ok(InstallSnapshotResponse {
                term: st.current_term,
                success: false,
            });
        }

        let last_included = req.last_included_index;

        if last_included >= st.log_len() {
            // Far behind: the snapshot strictly extends our log. Replace the
            // whole log with the sentinel.
            tracing::debug!(id = self.id, "InstallSnapshot: replacing log, follower far behind");
            st.commit_index = std::cmp::max(st.commit_index, last_included);
            st.last_applied = std::cmp::max(st.last_applied, last_included);
            st.log = vec![Entry::purged_marker(req.last_included_term)];
            st.snapshot_last_index = last_included;
            self.adopt_snapshot(&mut st, req.data, true).await;
        } else if st.entry(last_included).term != req.last_included_term {
            // Divergent: our entry at the boundary is from the wrong term, so
            // the whole suffix is garbage. None of it may be committed.
            tracing::debug!(id = self.id, "InstallSnapshot: replacing log, local log diverges");
            assert!(st.commit_index < last_included);
            assert!(st.last_applied < last_included);
            st.commit_index = std::cmp::max(st.commit_index, last_included);
            st.last_applied = std::cmp::max(st.last_applied, last_included);
            st.log = vec![Entry::purged_marker(req.last_included_term)];
            st.snapshot_last_index = last_included;
            self.adopt_snapshot(&mut st, req.data, true).await;
        } else if st.commit_index < last_included {
            // The snapshot covers entries we hold but have not committed.
            tracing::debug!(id = self.id, "InstallSnapshot: trimming uncommitted overlap");
            assert!(st.last_applied <= st.commit_index);
            st.commit_index = std::cmp::max(st.commit_index, last_included);
            st.last_applied = std::cmp::max(st.last_applied, last_included);
            st.trim_log_head(last_included);
            self.adopt_snapshot(&mut st, req.data, true).await;
        } else if st.last_applied < last_included {
            // Committed but not yet applied locally.
            tracing::debug!(id = self.id, "InstallSnapshot: trimming unapplied overlap");
            assert!(st.commit_index >= last_included);
            st.last_applied = std::cmp::max(st.last_applied, last_included);
            st.trim_log_head(last_included);
            self.adopt_snapshot(&mut st, req.data, true).await;
        } else {
            // Pure catch-up: everything in the snapshot has already been
            // applied here, so the state machine must not see it again.
            tracing::debug!(id = self.id, "InstallSnapshot: pure catch-up, not emitting");
            assert!(st.last_applied <= st.commit_index);
            st.trim_log_head(last_included);
            self.adopt_snapshot(&mut st, req.data, false).await;
        }

        self.report_metrics(&st);
        Ok(InstallSnapshotResponse {
            term: st.current_term,
            success: true,
        })
    }

    /// Persist the adopted snapshot together with the rewritten state and,
    /// unless it was already applied, emit it to the state machine.
    async fn adopt_snapshot(&self, st: &mut RaftState<C>, data: Vec<u8>, emit: bool) {
        self.persist_with_snapshot(st, data.clone()).await;

        if !emit {
            return;
        }

        let tx = match self.apply_tx.lock().await.clone() {
            Some(tx) => tx,
            None => return,
        };
        // The consumer drains this channel without taking our state lock, so
        // a blocking send here cannot deadlock.
        if tx.send(ApplyMsg::Snapshot { data }).await.is_err() {
            tracing::debug!(id = self.id, "apply channel closed while emitting snapshot");
        }
    }
}
