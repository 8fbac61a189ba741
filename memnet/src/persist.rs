//! An in-memory implementation of the `shard_raft::Persistence` trait.

use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use shard_raft::Persistence;

struct Blobs {
    raft_state: Vec<u8>,
    snapshot: Vec<u8>,
}

/// A replica's two durable blobs, held in memory.
///
/// Survives crash/restart cycles in tests because the harness retains the
/// `Arc` across them, exactly the way a disk would retain the files.
pub struct MemPersistence {
    inner: Mutex<Blobs>,
}

impl Default for MemPersistence {
    fn default() -> Self {
        Self::new()
    }
}

impl MemPersistence {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Blobs {
                raft_state: Vec::new(),
                snapshot: Vec::new(),
            }),
        }
    }
}

#[async_trait]
impl Persistence for MemPersistence {
    async fn save_raft_state(&self, state: Vec<u8>) -> Result<()> {
        let mut inner = self.inner.lock().expect("persistence mutex poisoned");
        inner.raft_state = state;
        Ok(())
    }

    async fn save_state_and_snapshot(&self, state: Vec<u8>, snapshot: Vec<u8>) -> Result<()> {
        let mut inner = self.inner.lock().expect("persistence mutex poisoned");
        inner.raft_state = state;
        inner.snapshot = snapshot;
        Ok(())
    }

    async fn read_raft_state(&self) -> Result<Vec<u8>> {
        Ok(self.inner.lock().expect("persistence mutex poisoned").raft_state.clone())
    }

    async fn read_snapshot(&self) -> Result<Vec<u8>> {
        Ok(self.inner.lock().expect("persistence mutex poisoned").snapshot.clone())
    }

    async fn raft_state_size(&self) -> usize {
        self.inner.lock().expect("persistence mutex poisoned").raft_state.len()
    }
}
