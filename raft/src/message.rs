//! Log entry and RPC data types.

use serde::Deserialize;
use serde::Serialize;

use crate::AppCommand;
use crate::MessageSummary;
use crate::NodeId;

/// A Raft log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry<C: AppCommand> {
    /// The term in which this entry was created.
    pub term: u64,
    /// This entry's payload.
    #[serde(bound = "C: AppCommand")]
    pub payload: EntryPayload<C>,
}

impl<C: AppCommand> Entry<C> {
    /// Create the sentinel entry retained at the snapshot boundary.
    ///
    /// The sentinel keeps `prev_log_term` lookups valid for the first live
    /// entry after a compaction; a pristine log is `[purged_marker(0)]`.
    pub fn purged_marker(term: u64) -> Self {
        Entry {
            term,
            payload: EntryPayload::PurgedMarker,
        }
    }
}

/// Log entry payload variants.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EntryPayload<C: AppCommand> {
    /// An entry before which all logs have been compacted into a snapshot.
    PurgedMarker,
    /// A normal application command.
    #[serde(bound = "C: AppCommand")]
    Normal(C),
}

/// A message delivered on the apply channel, in log-index order.
#[derive(Clone, Debug, PartialEq)]
pub enum ApplyMsg<C: AppCommand> {
    /// A committed command ready to be applied to the state machine.
    Command {
        /// The log index of the command.
        index: u64,
        /// The command itself.
        command: C,
    },
    /// A snapshot installed from the leader. The state machine must replace
    /// its entire state with the decoded contents before the next command
    /// applies.
    Snapshot {
        /// The opaque application snapshot blob.
        data: Vec<u8>,
    },
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by candidates to gather votes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteRequest {
    /// The candidate's current term.
    pub term: u64,
    /// The candidate's ID.
    pub candidate_id: NodeId,
    /// The index of the candidate's last log entry.
    pub last_log_index: u64,
    /// The term of the candidate's last log entry.
    pub last_log_term: u64,
}

impl MessageSummary for VoteRequest {
    fn summary(&self) -> String {
        format!(
            "term={}, candidate={}, last_log=({},{})",
            self.term, self.candidate_id, self.last_log_term, self.last_log_index
        )
    }
}

/// The response to a `VoteRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteResponse {
    /// The current term of the responding node, for the candidate to update itself.
    pub term: u64,
    /// Will be true if the candidate received a vote from the responder.
    pub vote_granted: bool,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by a cluster leader to replicate log entries, and as a heartbeat.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesRequest<C: AppCommand> {
    /// The leader's current term.
    pub term: u64,
    /// The leader's ID.
    pub leader_id: NodeId,
    /// The index of the log entry immediately preceding the new entries.
    pub prev_log_index: u64,
    /// The term of the entry at `prev_log_index`.
    pub prev_log_term: u64,
    /// The new log entries to store. Empty for heartbeats.
    #[serde(bound = "C: AppCommand")]
    pub entries: Vec<Entry<C>>,
    /// The leader's commit index.
    pub leader_commit: u64,
}

impl<C: AppCommand> MessageSummary for AppendEntriesRequest<C> {
    fn summary(&self) -> String {
        format!(
            "term={}, leader={}, prev=({},{}), commit={}, n={}",
            self.term,
            self.leader_id,
            self.prev_log_term,
            self.prev_log_index,
            self.leader_commit,
            self.entries.len()
        )
    }
}

/// The response to an `AppendEntriesRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// The responding node's current term, for the leader to update itself.
    pub term: u64,
    /// Whether the follower contained an entry matching `prev_log_index` and `prev_log_term`.
    pub success: bool,
    /// Accelerated backtracking data; present only when `success` is false.
    pub conflict: Option<Conflict>,
}

/// Accelerated log backtracking data.
///
/// Lets the leader jump `next_index` past a whole stale term in one round
/// trip instead of decrementing one entry at a time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    /// The index the leader should try next: the follower's log length when
    /// the leader is too far ahead, one past the snapshot boundary when the
    /// probe hit compacted entries, or the earliest index the follower holds
    /// of the conflicting term.
    pub index: u64,
    /// The follower's term at the probed index, when it holds one.
    pub term: Option<u64>,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by the leader to bring a lagging follower up to speed with a snapshot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    /// The leader's current term.
    pub term: u64,
    /// The leader's ID.
    pub leader_id: NodeId,
    /// The highest log index contained in the snapshot.
    pub last_included_index: u64,
    /// The term of the entry at `last_included_index`.
    pub last_included_term: u64,
    /// The opaque application snapshot blob.
    pub data: Vec<u8>,
}

impl MessageSummary for InstallSnapshotRequest {
    fn summary(&self) -> String {
        format!(
            "term={}, leader={}, last_included=({},{}), len={}",
            self.term,
            self.leader_id,
            self.last_included_term,
            self.last_included_index,
            self.data.len()
        )
    }
}

/// The response to an `InstallSnapshotRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    /// The receiving node's current term, for the leader to update itself.
    pub term: u64,
    /// Whether the snapshot was adopted.
    pub success: bool,
}
