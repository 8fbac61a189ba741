//! Raft metrics, published on a watch channel.
//!
//! A node reports a fresh [`RaftMetrics`] payload whenever its externally
//! observable state changes. Observers — operators and the test suites —
//! consume the channel directly or through the deadline-bounded predicates
//! on [`Wait`].

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::timeout;

use crate::core::Role;
use crate::error::WaitError;
use crate::NodeId;

/// A set of metrics describing the current state of a Raft node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RaftMetrics {
    /// The ID of the Raft node.
    pub id: NodeId,
    /// The role of the Raft node.
    pub role: Role,
    /// The current term of the Raft node.
    pub current_term: u64,
    /// The index of the last log entry.
    pub last_log_index: u64,
    /// The index of the highest committed entry.
    pub commit_index: u64,
    /// The index of the last entry applied to the state machine.
    pub last_applied: u64,
    /// The highest log index contained in the current snapshot.
    pub snapshot_last_index: u64,
}

impl RaftMetrics {
    /// The initial payload published before the node recovers its state.
    pub fn new_initial(id: NodeId) -> Self {
        Self {
            id,
            role: Role::Follower,
            current_term: 0,
            last_log_index: 0,
            commit_index: 0,
            last_applied: 0,
            snapshot_last_index: 0,
        }
    }
}

/// A handle for awaiting a metrics condition with a deadline.
pub struct Wait {
    pub timeout: Duration,
    pub rx: watch::Receiver<RaftMetrics>,
}

impl Wait {
    /// Wait for `func` to return true on a metrics payload, or timeout.
    pub async fn metrics<T>(&self, func: T, msg: &str) -> Result<RaftMetrics, WaitError>
    where
        T: Fn(&RaftMetrics) -> bool + Send,
    {
        let mut rx = self.rx.clone();
        loop {
            let latest = rx.borrow().clone();
            if func(&latest) {
                tracing::debug!("wait for {:?} success", msg);
                return Ok(latest);
            }

            let delta = timeout(self.timeout, rx.changed()).await;
            match delta {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(WaitError::Shutdown),
                Err(_) => return Err(WaitError::Timeout(self.timeout, msg.to_string())),
            }
        }
    }

    /// Wait for `last_log_index` and `last_applied` to reach `want_log`.
    pub async fn log(&self, want_log: u64, msg: &str) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |m| m.last_log_index >= want_log && m.last_applied >= want_log,
            &format!("{} .last_log_index+last_applied >= {}", msg, want_log),
        )
        .await
    }

    /// Wait for the node to assume `want_role`.
    pub async fn role(&self, want_role: Role, msg: &str) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |m| m.role == want_role,
            &format!("{} .role == {:?}", msg, want_role),
        )
        .await
    }

    /// Wait for `snapshot_last_index` to reach `want`.
    pub async fn snapshot(&self, want: u64, msg: &str) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |m| m.snapshot_last_index >= want,
            &format!("{} .snapshot_last_index >= {}", msg, want),
        )
        .await
    }

    /// Wait for the node's term to reach `want`.
    pub async fn term(&self, want: u64, msg: &str) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |m| m.current_term >= want,
            &format!("{} .current_term >= {}", msg, want),
        )
        .await
    }
}
