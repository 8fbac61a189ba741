//! The shard master clerk.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use shard_raft::OpId;
use tokio::time::sleep;

use crate::config::Gid;
use crate::config::ShardConfig;
use crate::network::ServiceNetwork;
use crate::rpc::JoinArgs;
use crate::rpc::LeaveArgs;
use crate::rpc::MoveArgs;
use crate::rpc::QueryArgs;

/// How long a clerk sleeps between full sweeps of the master servers.
const RETRY_PERIOD: Duration = Duration::from_millis(100);

/// A client of the shard master service.
///
/// Retries every transient failure indefinitely, sweeping the master
/// servers until one of them is a leader that answers. Each clerk carries a
/// random client identity and a monotonic sequence so the master can
/// suppress duplicates when a retried write already applied.
pub struct MasterClerk<S: ServiceNetwork> {
    net: Arc<S>,
    servers: Vec<String>,
    client: u64,
    next_seq: AtomicU64,
}

impl<S: ServiceNetwork> MasterClerk<S> {
    /// Create a clerk talking to the given master servers.
    pub fn new(net: Arc<S>, servers: Vec<String>) -> Self {
        Self {
            net,
            servers,
            client: rand::random(),
            next_seq: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> OpId {
        OpId::new(self.client, self.next_seq.fetch_add(1, Ordering::SeqCst))
    }

    /// Read a configuration, retrying until a leader answers. `None` reads
    /// the latest.
    pub async fn query(&self, num: Option<u64>) -> ShardConfig {
        let args = QueryArgs { num, id: self.next_id() };
        loop {
            for server in self.servers.iter() {
                if let Ok(Ok(config)) = self.net.query(server, args.clone()).await {
                    return config;
                }
            }
            sleep(RETRY_PERIOD).await;
        }
    }

    /// Read a configuration with a single sweep of the servers. Used by
    /// pollers which would rather come back later than block.
    pub async fn query_once(&self, num: Option<u64>) -> Option<ShardConfig> {
        let args = QueryArgs { num, id: self.next_id() };
        for server in self.servers.iter() {
            if let Ok(Ok(config)) = self.net.query(server, args.clone()).await {
                return Some(config);
            }
        }
        None
    }

    /// Add replica groups.
    pub async fn join(&self, servers: BTreeMap<Gid, Vec<String>>) {
        let args = JoinArgs {
            servers,
            id: self.next_id(),
        };
        loop {
            for server in self.servers.iter() {
                if let Ok(Ok(())) = self.net.join(server, args.clone()).await {
                    return;
                }
            }
            sleep(RETRY_PERIOD).await;
        }
    }

    /// Remove replica groups.
    pub async fn leave(&self, gids: Vec<Gid>) {
        let args = LeaveArgs { gids, id: self.next_id() };
        loop {
            for server in self.servers.iter() {
                if let Ok(Ok(())) = self.net.leave(server, args.clone()).await {
                    return;
                }
            }
            sleep(RETRY_PERIOD).await;
        }
    }

    /// Explicitly assign one shard to one group.
    pub async fn move_shard(&self, shard: u64, gid: Gid) {
        let args = MoveArgs {
            shard,
            gid,
            id: self.next_id(),
        };
        loop {
            for server in self.servers.iter() {
                if let Ok(Ok(())) = self.net.move_shard(server, args.clone()).await {
                    return;
                }
            }
            sleep(RETRY_PERIOD).await;
        }
    }
}
