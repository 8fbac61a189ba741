//! The persistence interface and the persisted state layout.

use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;

use crate::message::Entry;
use crate::AppCommand;

/// A trait defining the interface to the durable byte-blob store.
///
/// Each replica keeps exactly two opaque blobs: the raft state (term,
/// snapshot boundary, and the live log suffix) and the latest application
/// snapshot. `save_state_and_snapshot` must write both atomically so a crash
/// can never observe a state/snapshot pair from different compactions.
///
/// Errors returned from these methods are non-recoverable: the engine logs
/// them and shuts the node down.
#[async_trait]
pub trait Persistence: Send + Sync + 'static {
    /// Overwrite the raft state blob.
    async fn save_raft_state(&self, state: Vec<u8>) -> Result<()>;

    /// Atomically overwrite both the raft state blob and the snapshot blob.
    async fn save_state_and_snapshot(&self, state: Vec<u8>, snapshot: Vec<u8>) -> Result<()>;

    /// Read the raft state blob. Empty for a pristine replica.
    async fn read_raft_state(&self) -> Result<Vec<u8>>;

    /// Read the snapshot blob. Empty when no snapshot has been taken.
    async fn read_snapshot(&self) -> Result<Vec<u8>>;

    /// The current size of the raft state blob in bytes.
    ///
    /// Applications use this to decide when to trigger log compaction.
    async fn raft_state_size(&self) -> usize;
}

/// The owned form of the persisted raft state, decoded at startup.
#[derive(Debug, Serialize, Deserialize)]
pub struct PersistedState<C: AppCommand> {
    /// The last term this node has observed.
    pub current_term: u64,
    /// The highest log index contained in the snapshot blob.
    pub snapshot_last_index: u64,
    /// The live log suffix, starting with the sentinel at the snapshot boundary.
    #[serde(bound = "C: AppCommand")]
    pub log: Vec<Entry<C>>,
}

/// A borrowing view of the raft state used when encoding, so a persist does
/// not clone the log.
#[derive(Serialize)]
pub(crate) struct PersistedStateRef<'a, C: AppCommand> {
    pub current_term: u64,
    pub snapshot_last_index: u64,
    #[serde(bound = "C: AppCommand")]
    pub log: &'a [Entry<C>],
}

impl<C: AppCommand> PersistedState<C> {
    /// Decode a persisted raft state blob.
    ///
    /// A decode failure means the blob is corrupt, which is not recoverable.
    pub fn decode(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).context("failed to decode persisted raft state")
    }
}

pub(crate) fn encode_state<C: AppCommand>(
    current_term: u64,
    snapshot_last_index: u64,
    log: &[Entry<C>],
) -> Vec<u8> {
    let state = PersistedStateRef {
        current_term,
        snapshot_last_index,
        log,
    };
    match serde_json::to_vec(&state) {
        Ok(bytes) => bytes,
        // Log entries are plain data and always encode.
        Err(err) => panic!("failed to encode raft state: {}", err),
    }
}
