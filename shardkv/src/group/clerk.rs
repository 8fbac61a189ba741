//! The sharded KV clerk.

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use rand::thread_rng;
use rand::Rng;
use shard_raft::OpId;
use tokio::time::sleep;

use crate::config::key_to_shard;
use crate::config::Gid;
use crate::config::ShardConfig;
use crate::config::UNASSIGNED;
use crate::error::KvError;
use crate::master::MasterClerk;
use crate::network::ServiceNetwork;
use crate::rpc::GetArgs;
use crate::rpc::PutAppendArgs;
use crate::rpc::PutAppendOp;

/// How long the clerk sleeps before refreshing its configuration and
/// retrying.
const RETRY_PERIOD: Duration = Duration::from_millis(100);

/// A client of the sharded KV service.
///
/// Routes each key to the group owning its shard under the clerk's cached
/// configuration, keeps a sticky guess of each group's leader, and retries
/// transient failures forever: another server on `Wrong Leader` or a
/// timeout, a fresh configuration from the master on `ErrWrongGroup`.
/// `ErrNoKey` is the one error that surfaces, as an empty value.
pub struct KvClerk<S: ServiceNetwork> {
    net: Arc<S>,
    masters: MasterClerk<S>,
    client: u64,
    next_seq: AtomicU64,
    config: Mutex<ShardConfig>,
    leader_guess: Mutex<HashMap<Gid, usize>>,
}

impl<S: ServiceNetwork> KvClerk<S> {
    /// Create a clerk routing through the given master servers.
    pub fn new(net: Arc<S>, master_servers: Vec<String>) -> Self {
        Self {
            masters: MasterClerk::new(net.clone(), master_servers),
            net,
            client: rand::random(),
            next_seq: AtomicU64::new(1),
            config: Mutex::new(ShardConfig::empty()),
            leader_guess: Mutex::new(HashMap::new()),
        }
    }

    fn next_id(&self) -> OpId {
        OpId::new(self.client, self.next_seq.fetch_add(1, Ordering::SeqCst))
    }

    /// Fetch the current value for a key; `""` when the key does not exist.
    pub async fn get(&self, key: &str) -> String {
        let args = GetArgs {
            key: key.to_string(),
            id: self.next_id(),
        };

        loop {
            if let Some(value) = self.try_group(&args.key, |server| {
                let net = self.net.clone();
                let args = args.clone();
                async move {
                    match net.get(&server, args).await {
                        Ok(Ok(value)) => Attempt::Done(value),
                        Ok(Err(KvError::NoKey)) => Attempt::Done(String::new()),
                        Ok(Err(KvError::WrongGroup)) => Attempt::WrongGroup,
                        _ => Attempt::NextServer,
                    }
                }
            })
            .await
            {
                return value;
            }

            sleep(RETRY_PERIOD).await;
            self.refresh_config().await;
        }
    }

    /// Overwrite a key.
    pub async fn put(&self, key: &str, value: &str) {
        self.put_append(key, value, PutAppendOp::Put).await
    }

    /// Append to a key, treating a missing key as empty.
    pub async fn append(&self, key: &str, value: &str) {
        self.put_append(key, value, PutAppendOp::Append).await
    }

    async fn put_append(&self, key: &str, value: &str, op: PutAppendOp) {
        let args = PutAppendArgs {
            key: key.to_string(),
            value: value.to_string(),
            op,
            id: self.next_id(),
        };

        loop {
            if let Some(()) = self.try_group(&args.key, |server| {
                let net = self.net.clone();
                let args = args.clone();
                async move {
                    match net.put_append(&server, args).await {
                        Ok(Ok(())) => Attempt::Done(()),
                        Ok(Err(KvError::WrongGroup)) => Attempt::WrongGroup,
                        _ => Attempt::NextServer,
                    }
                }
            })
            .await
            {
                return;
            }

            sleep(RETRY_PERIOD).await;
            self.refresh_config().await;
        }
    }

    /// One pass over the group currently owning `key`'s shard: start at the
    /// sticky leader guess and hop to another server at random on failure.
    /// `None` means the pass was unfruitful and the configuration should be
    /// refreshed.
    async fn try_group<T, F, Fut>(&self, key: &str, attempt: F) -> Option<T>
    where
        F: Fn(String) -> Fut,
        Fut: std::future::Future<Output = Attempt<T>>,
    {
        let sid = key_to_shard(key);
        let (gid, servers) = {
            let config = self.config.lock().expect("clerk config mutex poisoned");
            let gid = config.owner(sid);
            (gid, config.groups.get(&gid).cloned().unwrap_or_default())
        };

        if gid == UNASSIGNED || servers.is_empty() {
            return None;
        }

        let mut index = self.guess(gid, servers.len());
        for _ in 0..servers.len() {
            match attempt(servers[index].clone()).await {
                Attempt::Done(value) => {
                    self.save_guess(gid, index);
                    return Some(value);
                }
                Attempt::WrongGroup => return None,
                Attempt::NextServer => {
                    index = thread_rng().gen_range(0..servers.len());
                }
            }
        }
        None
    }

    async fn refresh_config(&self) {
        let latest = self.masters.query(None).await;
        let mut config = self.config.lock().expect("clerk config mutex poisoned");
        *config = latest;
    }

    fn guess(&self, gid: Gid, n: usize) -> usize {
        let guesses = self.leader_guess.lock().expect("clerk guess mutex poisoned");
        guesses.get(&gid).copied().unwrap_or(0).min(n - 1)
    }

    fn save_guess(&self, gid: Gid, index: usize) {
        let mut guesses = self.leader_guess.lock().expect("clerk guess mutex poisoned");
        guesses.insert(gid, index);
    }
}

enum Attempt<T> {
    /// The request succeeded with this value.
    Done(T),
    /// The group disowned the shard; the configuration must be refreshed.
    WrongGroup,
    /// Try another server of the same group.
    NextServer,
}
