//! The replicated state machine driver.
//!
//! [`Rsm`] sits between a [`Raft`] instance and an application: it submits
//! commands to the log, drains the apply channel into the application's
//! apply callback, and correlates each RPC handler with the outcome of the
//! log slot its command was assigned. Correlation is by [`OpId`]: if
//! leadership changed and a different command committed at that slot, the
//! caller learns it was replaced rather than receiving a stranger's result.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing_futures::Instrument;

use crate::config::Config;
use crate::error::StartError;
use crate::message::ApplyMsg;
use crate::subs::SubscriptionStore;
use crate::AppCommand;
use crate::Persistence;
use crate::Raft;
use crate::RaftNetwork;

/// Uniquely identifies one client operation, for duplicate suppression and
/// reply correlation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpId {
    /// The issuing client's identity.
    pub client: u64,
    /// The client's monotonically increasing sequence number.
    pub seq: u64,
}

impl OpId {
    pub fn new(client: u64, seq: u64) -> Self {
        Self { client, seq }
    }
}

impl std::fmt::Display for OpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.client, self.seq)
    }
}

/// The value published to subscribers when a log slot applies.
#[derive(Clone, Debug)]
pub struct Notification<R> {
    /// The id of the operation that actually occupied the slot.
    pub id: OpId,
    /// The application's result for that operation.
    pub response: R,
}

/// The apply capability an application offers the driver.
///
/// The server implements this interface and the driver consumes it, which
/// breaks the reference cycle between the server and the driver it owns.
#[async_trait]
pub trait StateMachine<C: AppCommand>: Send + Sync + 'static {
    /// The application's result type for one applied command.
    type Response: Clone + Send + Sync + 'static;

    /// Apply one committed command to the replicated state.
    ///
    /// Called in log-index order on every replica. Must be deterministic,
    /// and must perform its own duplicate suppression: the same `OpId` can
    /// reach here more than once across leader changes.
    async fn apply(&self, index: u64, command: C) -> (OpId, Self::Response);

    /// Replace the entire replicated state with the decoded snapshot.
    async fn restore(&self, snapshot: Vec<u8>);
}

/// A [`Raft`] instance wired to an application state machine.
pub struct Rsm<C, M, N, P>
where
    C: AppCommand,
    M: StateMachine<C>,
    N: RaftNetwork<C>,
    P: Persistence,
{
    raft: Raft<C, N, P>,
    machine: Arc<M>,
    subs: Arc<SubscriptionStore<Notification<M::Response>>>,
    config: Arc<Config>,
    active: AtomicBool,
}

impl<C, M, N, P> Rsm<C, M, N, P>
where
    C: AppCommand,
    M: StateMachine<C>,
    N: RaftNetwork<C>,
    P: Persistence,
{
    /// Wire `machine` to a running Raft instance and spawn the applier.
    ///
    /// `apply_rx` must be the receiver returned by [`Raft::new`] for the
    /// same instance.
    pub fn new(
        raft: Raft<C, N, P>,
        apply_rx: mpsc::Receiver<ApplyMsg<C>>,
        machine: Arc<M>,
        config: Arc<Config>,
    ) -> Arc<Self> {
        let this = Arc::new(Self {
            raft,
            machine,
            subs: Arc::new(SubscriptionStore::new()),
            config,
            active: AtomicBool::new(true),
        });

        tokio::spawn(
            this.clone()
                .applier_loop(apply_rx)
                .instrument(tracing::debug_span!("rsm-applier")),
        );

        this
    }

    /// Submit `command` and wait for the result of the log slot it was
    /// assigned.
    ///
    /// The subscription taken on the slot is released on every exit path.
    /// A `Timeout` does not mean the command failed — it may still commit —
    /// so callers must retry with the same `id` and rely on the state
    /// machine's duplicate suppression.
    pub async fn start(&self, id: OpId, command: C) -> Result<M::Response, StartError> {
        if !self.active.load(Ordering::SeqCst) {
            return Err(StartError::WrongLeader);
        }

        let (index, _term) = match self.raft.start(command).await {
            Some(started) => started,
            None => return Err(StartError::WrongLeader),
        };

        let mut sub = self.subs.subscribe(index);
        let result = match timeout(self.config.consensus_timeout(), sub.recv()).await {
            Ok(Some(notification)) => {
                if notification.id == id {
                    Ok(notification.response)
                } else {
                    // Leadership changed under us and another command won
                    // this slot.
                    Err(StartError::Replaced)
                }
            }
            // The store never drops a live subscriber's sender, so a closed
            // mailbox means shutdown; report it like an expired wait.
            Ok(None) => Err(StartError::Timeout),
            Err(_) => Err(StartError::Timeout),
        };
        self.subs.release(index);

        result
    }

    /// The wrapped Raft handle.
    pub fn raft(&self) -> &Raft<C, N, P> {
        &self.raft
    }

    /// The wrapped application.
    pub fn machine(&self) -> &Arc<M> {
        &self.machine
    }

    /// Shut down the driver and the underlying Raft instance.
    pub async fn shutdown(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.raft.shutdown().await;
    }

    async fn applier_loop(self: Arc<Self>, mut apply_rx: mpsc::Receiver<ApplyMsg<C>>) {
        while let Some(msg) = apply_rx.recv().await {
            if !self.active.load(Ordering::SeqCst) {
                return;
            }

            match msg {
                ApplyMsg::Command { index, command } => {
                    let (id, response) = self.machine.apply(index, command).await;
                    self.subs.notify_all(index, Notification { id, response });
                }
                ApplyMsg::Snapshot { data } => {
                    tracing::debug!("restoring state machine from installed snapshot");
                    self.machine.restore(data).await;
                }
            }
        }
    }
}
