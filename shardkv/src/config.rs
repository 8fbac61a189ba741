//! Shard configurations: the assignment of key-space shards to groups.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

/// The number of key-space shards. Fixed for the lifetime of a cluster.
pub const NSHARDS: usize = 10;

/// The GID reserved for unassigned shards.
pub const UNASSIGNED: Gid = 0;

/// A replica group's ID. Real groups have non-zero GIDs.
pub type Gid = u64;

/// One configuration: a numbered assignment of every shard to a group.
///
/// Configurations form a dense sequence starting from the empty
/// configuration at `num = 0`; the shard master appends a new one for every
/// `Join`/`Leave`/`Move`. `groups` maps each member GID to its server
/// names; a `BTreeMap` keeps iteration deterministic, which the rebalancer
/// relies on to produce identical results on every replica.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardConfig {
    /// The configuration number.
    pub num: u64,
    /// The owning GID of each shard, indexed by shard id.
    pub shards: [Gid; NSHARDS],
    /// The servers of every group participating in this configuration.
    pub groups: BTreeMap<Gid, Vec<String>>,
}

impl ShardConfig {
    /// The empty configuration: number 0, no groups, all shards unassigned.
    pub fn empty() -> Self {
        Self {
            num: 0,
            shards: [UNASSIGNED; NSHARDS],
            groups: BTreeMap::new(),
        }
    }

    /// The GID owning `shard` in this configuration.
    pub fn owner(&self, shard: u64) -> Gid {
        self.shards[shard as usize]
    }
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self::empty()
    }
}

/// Map a key to its shard.
pub fn key_to_shard(key: &str) -> u64 {
    let b = key.as_bytes().first().copied().unwrap_or(0);
    b as u64 % NSHARDS as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_to_shard_is_stable_and_in_range() {
        assert_eq!(key_to_shard(""), 0);
        assert_eq!(key_to_shard("a"), (b'a' % 10) as u64);
        for key in &["", "a", "zebra", "0", "\u{00e9}clair"] {
            assert!(key_to_shard(key) < NSHARDS as u64);
            assert_eq!(key_to_shard(key), key_to_shard(key));
        }
    }

    #[test]
    fn test_empty_config() {
        let cfg = ShardConfig::empty();
        assert_eq!(cfg.num, 0);
        assert!(cfg.groups.is_empty());
        assert!(cfg.shards.iter().all(|gid| *gid == UNASSIGNED));
    }
}
