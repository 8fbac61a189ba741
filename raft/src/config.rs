//! Raft runtime configuration.

use std::time::Duration;

use rand::thread_rng;
use rand::Rng;

use crate::error::ConfigError;

/// Default minimum election timeout, in milliseconds.
pub const DEFAULT_ELECTION_TIMEOUT_MIN: u64 = 400;
/// Default maximum election timeout, in milliseconds.
pub const DEFAULT_ELECTION_TIMEOUT_MAX: u64 = 800;
/// Default interval between leader heartbeats, in milliseconds.
pub const DEFAULT_HEARTBEAT_INTERVAL: u64 = 110;
/// Default worker loop tick, in milliseconds.
pub const DEFAULT_TICK_INTERVAL: u64 = 10;
/// Default deadline for a driver-initiated command, in milliseconds.
pub const DEFAULT_CONSENSUS_TIMEOUT: u64 = 500;
/// Default capacity of the apply channel.
pub const DEFAULT_APPLY_CHANNEL_CAPACITY: usize = 1024;
/// Default bounded wait when handing an entry to a slow consumer, in milliseconds.
pub const DEFAULT_APPLY_SEND_TIMEOUT: u64 = 1;

/// The runtime configuration for a Raft node.
///
/// Create instances through the builder: validation guards against
/// configurations which could never elect a leader.
///
/// ```
/// use shard_raft::Config;
///
/// let config = Config::build("cluster".into())
///     .heartbeat_interval(150)
///     .validate()
///     .expect("config is invalid");
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// The name of the cluster this node belongs to. Used only for logging.
    pub cluster_name: String,
    /// The minimum election timeout in milliseconds.
    pub election_timeout_min: u64,
    /// The maximum election timeout in milliseconds.
    pub election_timeout_max: u64,
    /// The interval at which leaders send heartbeats, in milliseconds.
    pub heartbeat_interval: u64,
    /// The sleep period of the worker loops, in milliseconds.
    pub tick_interval: u64,
    /// How long the RSM driver waits for a started command to apply, in milliseconds.
    pub consensus_timeout: u64,
    /// Capacity of the bounded channel carrying committed entries to the application.
    pub apply_channel_capacity: usize,
    /// How long the applier waits on a full apply channel before giving up
    /// the tick, in milliseconds.
    pub apply_send_timeout: u64,
}

impl Config {
    /// Start the builder process for a new `Config` instance.
    pub fn build(cluster_name: String) -> ConfigBuilder {
        ConfigBuilder {
            cluster_name,
            election_timeout_min: None,
            election_timeout_max: None,
            heartbeat_interval: None,
            tick_interval: None,
            consensus_timeout: None,
            apply_channel_capacity: None,
            apply_send_timeout: None,
        }
    }

    /// Generate a new random election timeout within the configured range.
    pub fn new_rand_election_timeout(&self) -> Duration {
        let ms = thread_rng().gen_range(self.election_timeout_min..self.election_timeout_max);
        Duration::from_millis(ms)
    }

    /// The heartbeat interval as a `Duration`.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }

    /// The worker tick as a `Duration`.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval)
    }

    /// The consensus timeout as a `Duration`.
    pub fn consensus_timeout(&self) -> Duration {
        Duration::from_millis(self.consensus_timeout)
    }

    /// The apply channel send timeout as a `Duration`.
    pub fn apply_send_timeout(&self) -> Duration {
        Duration::from_millis(self.apply_send_timeout)
    }
}

/// A configuration builder.
pub struct ConfigBuilder {
    cluster_name: String,
    election_timeout_min: Option<u64>,
    election_timeout_max: Option<u64>,
    heartbeat_interval: Option<u64>,
    tick_interval: Option<u64>,
    consensus_timeout: Option<u64>,
    apply_channel_capacity: Option<usize>,
    apply_send_timeout: Option<u64>,
}

impl ConfigBuilder {
    /// Set the minimum election timeout in milliseconds.
    pub fn election_timeout_min(mut self, val: u64) -> Self {
        self.election_timeout_min = Some(val);
        self
    }

    /// Set the maximum election timeout in milliseconds.
    pub fn election_timeout_max(mut self, val: u64) -> Self {
        self.election_timeout_max = Some(val);
        self
    }

    /// Set the heartbeat interval in milliseconds.
    pub fn heartbeat_interval(mut self, val: u64) -> Self {
        self.heartbeat_interval = Some(val);
        self
    }

    /// Set the worker loop tick in milliseconds.
    pub fn tick_interval(mut self, val: u64) -> Self {
        self.tick_interval = Some(val);
        self
    }

    /// Set the consensus timeout in milliseconds.
    pub fn consensus_timeout(mut self, val: u64) -> Self {
        self.consensus_timeout = Some(val);
        self
    }

    /// Set the capacity of the apply channel.
    pub fn apply_channel_capacity(mut self, val: usize) -> Self {
        self.apply_channel_capacity = Some(val);
        self
    }

    /// Set the apply channel send timeout in milliseconds.
    pub fn apply_send_timeout(mut self, val: u64) -> Self {
        self.apply_send_timeout = Some(val);
        self
    }

    /// Validate the state of this builder and produce a new `Config`.
    pub fn validate(self) -> Result<Config, ConfigError> {
        let election_timeout_min = self.election_timeout_min.unwrap_or(DEFAULT_ELECTION_TIMEOUT_MIN);
        let election_timeout_max = self.election_timeout_max.unwrap_or(DEFAULT_ELECTION_TIMEOUT_MAX);
        let heartbeat_interval = self.heartbeat_interval.unwrap_or(DEFAULT_HEARTBEAT_INTERVAL);
        let tick_interval = self.tick_interval.unwrap_or(DEFAULT_TICK_INTERVAL);
        let consensus_timeout = self.consensus_timeout.unwrap_or(DEFAULT_CONSENSUS_TIMEOUT);
        let apply_channel_capacity = self.apply_channel_capacity.unwrap_or(DEFAULT_APPLY_CHANNEL_CAPACITY);
        let apply_send_timeout = self.apply_send_timeout.unwrap_or(DEFAULT_APPLY_SEND_TIMEOUT);

        if election_timeout_min >= election_timeout_max {
            return Err(ConfigError::InvalidElectionTimeoutMinMax);
        }
        if election_timeout_min <= heartbeat_interval {
            return Err(ConfigError::InvalidElectionTimeoutHeartbeat);
        }
        if apply_channel_capacity == 0 {
            return Err(ConfigError::InvalidApplyChannelCapacity);
        }

        Ok(Config {
            cluster_name: self.cluster_name,
            election_timeout_min,
            election_timeout_max,
            heartbeat_interval,
            tick_interval,
            consensus_timeout,
            apply_channel_capacity,
            apply_send_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let cfg = Config::build("test".into()).validate().unwrap();
        assert_eq!(cfg.election_timeout_min, 400);
        assert_eq!(cfg.election_timeout_max, 800);
        assert_eq!(cfg.heartbeat_interval, 110);
        assert_eq!(cfg.tick_interval, 10);
        assert_eq!(cfg.consensus_timeout, 500);
        assert_eq!(cfg.apply_channel_capacity, 1024);
    }

    #[test]
    fn test_invalid_election_timeout_config_produces_error() {
        let res = Config::build("test".into())
            .election_timeout_min(300)
            .election_timeout_max(200)
            .validate();
        assert!(matches!(res, Err(ConfigError::InvalidElectionTimeoutMinMax)));
    }

    #[test]
    fn test_rand_election_timeout_is_in_range() {
        let cfg = Config::build("test".into()).validate().unwrap();
        for _ in 0..100 {
            let t = cfg.new_rand_election_timeout();
            assert!(t >= Duration::from_millis(400));
            assert!(t < Duration::from_millis(800));
        }
    }
}
