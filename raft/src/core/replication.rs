//! Log replication: the heartbeat loop, per-peer append loops, and the
//! AppendEntries handler.

use std::time::Instant;

use anyhow::anyhow;
use anyhow::Result;
use tokio::time::sleep;

use crate::core::Raft;
use crate::core::Role;
use crate::message::AppendEntriesRequest;
use crate::message::AppendEntriesResponse;
use crate::message::Conflict;
use crate::AppCommand;
use crate::MessageSummary;
use crate::NodeId;
use crate::Persistence;
use crate::RaftNetwork;

impl<C: AppCommand, N: RaftNetwork<C>, P: Persistence> Raft<C, N, P> {
    /// Tick-driven heartbeat timer. A leader which has not replicated
    /// anything within the heartbeat interval pushes its full log target to
    /// every peer, which doubles as the empty heartbeat for caught-up peers.
    pub(super) async fn heartbeat_loop(self) {
        loop {
            {
                let mut st = self.state.lock().await;
                if !st.active {
                    return;
                }

                let due = match st.last_heartbeat {
                    Some(at) => at.elapsed() >= self.config.heartbeat_interval(),
                    None => true,
                };
                if st.role == Role::Leader && due {
                    tracing::trace!(id = self.id, "sending out heartbeats");
                    let term = st.current_term;
                    let index = st.log_len() - 1;
                    for peer in st.peers.clone() {
                        if peer == self.id {
                            continue;
                        }
                        tokio::spawn(self.clone().append_loop(peer, term, index));
                    }
                    st.last_heartbeat = Some(Instant::now());
                }
            }

            sleep(self.config.tick_interval()).await;
        }
    }

    /// Drive one peer's log to `index`, retrying until it succeeds or the
    /// loop is obsolete (leadership lost, term advanced, or a newer loop
    /// covers a longer log).
    pub(super) async fn append_loop(self, peer: NodeId, term: u64, index: u64) {
        loop {
            let req = {
                let st = self.state.lock().await;

                if !st.active || st.role != Role::Leader || st.current_term != term {
                    return;
                }

                // Non-existent target, or a newer loop has taken over.
                if index >= st.log_len() || st.log_len() > index + 1 {
                    return;
                }

                // Peer lagging behind the snapshot boundary: ship the snapshot first.
                if st.next_index[&peer] <= st.snapshot_last_index {
                    drop(st);
                    self.send_install_snapshot(peer, term).await;
                    continue;
                }

                let prev_log_index = st.next_index[&peer] - 1;
                AppendEntriesRequest {
                    term: st.current_term,
                    leader_id: self.id,
                    prev_log_index,
                    prev_log_term: st.entry(prev_log_index).term,
                    entries: st.copy_entries_inclusive(st.next_index[&peer], index),
                    leader_commit: st.commit_index,
                }
            };

            tracing::debug!(id = self.id, peer, "sending AppendEntries: {}", req.summary());
            let reply = match self.network.send_append_entries(peer, req).await {
                Ok(reply) => reply,
                Err(err) => {
                    tracing::debug!(id = self.id, peer, error = %err, "AppendEntries failed, retrying");
                    sleep(self.config.tick_interval()).await;
                    continue;
                }
            };

            let mut st = self.state.lock().await;
            tracing::debug!(id = self.id, peer, success = reply.success, "received AppendEntries reply");

            if reply.term > st.current_term {
                st.acknowledge_leader(reply.term);
                self.persist(&mut st).await;
                self.report_metrics(&st);
                return;
            }

            if !st.active || st.role != Role::Leader || st.current_term != term {
                return;
            }

            if reply.success {
                st.next_index.insert(peer, index + 1);
                st.set_match_index(peer, index);
                self.report_metrics(&st);
                return;
            }

            // Accelerated backtracking: jump next_index straight to the
            // follower's conflict point instead of probing one entry at a time.
            let conflict = match reply.conflict {
                Some(conflict) => conflict,
                None => continue,
            };

            if conflict.index <= st.snapshot_last_index {
                // The conflict point is already compacted here; the next
                // round will ship the snapshot.
                let boundary = st.snapshot_last_index;
                st.next_index.insert(peer, boundary);
                continue;
            }

            st.next_index.insert(peer, conflict.index);
        }
    }

    /// The AppendEntries RPC handler.
    #[tracing::instrument(level = "debug", skip(self, req), fields(id = self.id, req = %req.summary()))]
    pub async fn append_entries(&self, req: AppendEntriesRequest<C>) -> Result<AppendEntriesResponse> {
        let mut st = self.state.lock().await;
        if !st.active {
            return Err(anyhow!("node {} is shutting down", self.id));
        }

        if req.term < st.current_term {
            tracing::debug!(id = self.id, "rejecting AppendEntries: outdated term");
            return Ok(AppendEntriesResponse {
                term: st.current_term,
                success: false,
                conflict: None,
            });
        }

        if st.acknowledge_leader(req.term) {
            self.persist(&mut st).await;
        }

        // Consistency check a): the leader is probing beyond our log.
        if req.prev_log_index >= st.log_len() {
            tracing::debug!(id = self.id, "rejecting AppendEntries: prev_log_index beyond log");
            return Ok(AppendEntriesResponse {
                term: st.current_term,
                success: false,
                conflict: Some(Conflict {
                    index: st.log_len(),
                    term: None,
                }),
            });
        }

        // Consistency check b): the leader is probing into our compacted
        // prefix, which is committed by definition; restart it just past the
        // boundary.
        if req.prev_log_index < st.snapshot_last_index {
            tracing::debug!(id = self.id, "rejecting AppendEntries: prev_log_index compacted");
            return Ok(AppendEntriesResponse {
                term: st.current_term,
                success: false,
                conflict: Some(Conflict {
                    index: st.snapshot_last_index + 1,
                    term: None,
                }),
            });
        }

        // Consistency check c): term mismatch at the probe point. Report the
        // earliest index we hold of the conflicting term.
        let local_prev_term = st.entry(req.prev_log_index).term;
        if local_prev_term != req.prev_log_term {
            let mut conflict_index = req.prev_log_index;
            let mut ii = req.prev_log_index;
            while ii > st.snapshot_last_index {
                ii -= 1;
                if st.entry(ii).term != local_prev_term {
                    break;
                }
                conflict_index = ii;
            }

            tracing::debug!(id = self.id, conflict_index, "rejecting AppendEntries: conflicting term");
            return Ok(AppendEntriesResponse {
                term: st.current_term,
                success: false,
                conflict: Some(Conflict {
                    index: conflict_index,
                    term: Some(local_prev_term),
                }),
            });
        }

        // Append the entries, truncating our divergent suffix if one exists.
        let mut changed = false;
        for (ii, entry) in req.entries.iter().enumerate() {
            let index = req.prev_log_index + ii as u64 + 1;

            if index < st.log_len() && st.entry(index).term != entry.term {
                st.trim_log_tail(index);
            }

            if index >= st.log_len() {
                st.log.extend(req.entries[ii..].iter().cloned());
                changed = true;
                break;
            }

            assert!(st.entry(index).term == entry.term);
        }
        if changed {
            self.persist(&mut st).await;
        }

        let target = std::cmp::min(req.leader_commit, st.log_len() - 1);
        if target > st.commit_index {
            st.set_commit_index(target);
        }

        self.report_metrics(&st);
        Ok(AppendEntriesResponse {
            term: st.current_term,
            success: true,
            conflict: None,
        })
    }
}
