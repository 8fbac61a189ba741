//! Leader election: the election timer loop, vote fan-out, and the
//! RequestVote handler.

use anyhow::anyhow;
use anyhow::Result;
use tokio::time::sleep;

use crate::core::Raft;
use crate::core::Role;
use crate::message::VoteRequest;
use crate::message::VoteResponse;
use crate::AppCommand;
use crate::MessageSummary;
use crate::NodeId;
use crate::Persistence;
use crate::RaftNetwork;

impl<C: AppCommand, N: RaftNetwork<C>, P: Persistence> Raft<C, N, P> {
    /// Tick-driven election timer. A non-leader which has not heard from a
    /// leader within the randomized election timeout becomes a candidate
    /// and solicits votes from every peer in parallel.
    pub(super) async fn election_loop(self) {
        loop {
            {
                let mut st = self.state.lock().await;
                if !st.active {
                    return;
                }

                if st.role != Role::Leader && st.last_heard_from_leader.elapsed() >= st.election_timeout {
                    tracing::debug!(id = self.id, term = st.current_term + 1, "election timeout, starting election");
                    st.become_candidate();
                    self.persist(&mut st).await;

                    let term = st.current_term;
                    for peer in st.peers.clone() {
                        if peer == self.id {
                            continue;
                        }
                        tokio::spawn(self.clone().request_vote(peer, term));
                    }

                    st.election_timeout = self.config.new_rand_election_timeout();
                    self.report_metrics(&st);
                }
            }

            sleep(self.config.tick_interval()).await;
        }
    }

    /// Solicit one peer's vote for `term`. Spawned once per peer per election.
    async fn request_vote(self, peer: NodeId, term: u64) {
        let req = {
            let st = self.state.lock().await;
            if !st.active || st.role != Role::Candidate || st.current_term != term {
                return;
            }

            let last_log_index = st.log_len() - 1;
            VoteRequest {
                term: st.current_term,
                candidate_id: self.id,
                last_log_index,
                last_log_term: st.entry(last_log_index).term,
            }
        };

        // No retry on transport failure: the next election timeout covers it,
        // and a peer must stay free to grant the same vote twice.
        tracing::debug!(id = self.id, peer, "sending RequestVote: {}", req.summary());
        let reply = match self.network.send_vote(peer, req).await {
            Ok(reply) => reply,
            Err(err) => {
                tracing::debug!(id = self.id, peer, error = %err, "RequestVote failed");
                return;
            }
        };

        let mut st = self.state.lock().await;
        tracing::debug!(id = self.id, peer, granted = reply.vote_granted, "received RequestVote reply");

        if reply.term > st.current_term {
            st.acknowledge_leader(reply.term);
            self.persist(&mut st).await;
            self.report_metrics(&st);
            return;
        }

        if !st.active || !reply.vote_granted || st.role != Role::Candidate || st.current_term != term {
            return;
        }

        st.receive_vote();
        self.report_metrics(&st);
    }

    /// The RequestVote RPC handler.
    ///
    /// A vote is granted iff the request's term is strictly newer than ours
    /// and the candidate's log is at least as up-to-date, comparing
    /// `(last_log_term, last_log_index)` lexicographically. Observing the
    /// newer term forces a step-down either way, which is what bounds
    /// vote-granting to once per term.
    #[tracing::instrument(level = "debug", skip(self, req), fields(id = self.id, req = %req.summary()))]
    pub async fn vote(&self, req: VoteRequest) -> Result<VoteResponse> {
        let mut st = self.state.lock().await;
        if !st.active {
            return Err(anyhow!("node {} is shutting down", self.id));
        }

        if req.term <= st.current_term {
            tracing::debug!(id = self.id, "rejecting RequestVote: outdated or concurrent term");
            return Ok(VoteResponse {
                term: st.current_term,
                vote_granted: false,
            });
        }

        // There is a higher term out there; step down regardless of our vote.
        st.become_follower(req.term);
        self.persist(&mut st).await;

        let last_log_index = st.log_len() - 1;
        let last_log_term = st.entry(last_log_index).term;

        if last_log_term > req.last_log_term
            || (last_log_term == req.last_log_term && last_log_index > req.last_log_index)
        {
            tracing::debug!(
                id = self.id,
                last_log_index,
                last_log_term,
                "rejecting RequestVote: candidate log is not up-to-date"
            );
            self.report_metrics(&st);
            return Ok(VoteResponse {
                term: st.current_term,
                vote_granted: false,
            });
        }

        tracing::debug!(id = self.id, candidate = req.candidate_id, "vote granted");
        st.acknowledge_leader(req.term);
        self.report_metrics(&st);

        Ok(VoteResponse {
            term: req.term,
            vote_granted: true,
        })
    }
}
