//! Configuration constants and defaults for the flash-sale layer
//!
//! Every component takes a [`Config`]. The defaults below are the values the
//! layer is tuned for; override them through [`ConfigBuilder`].

use std::time::Duration;

/// Tunables shared by the lock, id, cache, admission and consumer components
#[derive(Debug, Clone)]
pub struct Config {
    /// Consumer group reading the reservation stream
    pub group: String,

    /// Consumer name inside the group, owner of its pending list
    pub consumer: String,

    /// Maximum time a blocking stream read waits for a new reservation
    pub read_block: Duration,

    /// Pause between two failed attempts on the pending list
    pub pending_backoff: Duration,

    /// TTL of the per-user lock held while an order is persisted
    pub order_lock_ttl: Duration,

    /// TTL of the empty marker written for missing entities
    pub cache_null_ttl: Duration,

    /// TTL of the per-key rebuild lock
    pub cache_lock_ttl: Duration,

    /// Sleep of a caller that lost the rebuild lock before looking again
    pub mutex_retry_delay: Duration,

    /// Lookups a caller makes while another caller rebuilds the entry
    pub mutex_max_retries: u32,

    /// Background rebuilds allowed to run at the same time
    pub rebuild_workers: usize,

    /// Seconds since the unix epoch from which id timestamps are counted
    pub id_epoch: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            group: DEFAULT_GROUP.to_owned(),
            consumer: DEFAULT_CONSUMER.to_owned(),
            read_block: READ_BLOCK,
            pending_backoff: PENDING_BACKOFF,
            order_lock_ttl: ORDER_LOCK_TTL,
            cache_null_ttl: CACHE_NULL_TTL,
            cache_lock_ttl: CACHE_LOCK_TTL,
            mutex_retry_delay: MUTEX_RETRY_DELAY,
            mutex_max_retries: MUTEX_MAX_RETRIES,
            rebuild_workers: REBUILD_WORKERS,
            id_epoch: ID_EPOCH,
        }
    }
}

pub const DEFAULT_GROUP: &str = "g1";

pub const DEFAULT_CONSUMER: &str = "c1";

/// Blocking read timeout of the order consumer
///
/// Also bounds how long a shutdown request waits for the loop to notice it.
pub const READ_BLOCK: Duration = Duration::from_secs(2);

pub const PENDING_BACKOFF: Duration = Duration::from_millis(20);

/// Per-user order lock TTL
///
/// Must exceed the time a single order takes to persist, otherwise a second
/// delivery of the same reservation could run concurrently.
pub const ORDER_LOCK_TTL: Duration = Duration::from_secs(10);

pub const CACHE_NULL_TTL: Duration = Duration::from_secs(2 * 60);

pub const CACHE_LOCK_TTL: Duration = Duration::from_secs(10);

pub const MUTEX_RETRY_DELAY: Duration = Duration::from_millis(50);

pub const MUTEX_MAX_RETRIES: u32 = 50;

pub const REBUILD_WORKERS: usize = 10;

/// 2022-01-01T00:00:00Z
pub const ID_EPOCH: i64 = 1_640_995_200;

/// Configuration builder for customizing the layer
#[derive(Debug)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.config.group = group.into();
        self
    }

    pub fn consumer(mut self, consumer: impl Into<String>) -> Self {
        self.config.consumer = consumer.into();
        self
    }

    pub fn read_block(mut self, value: Duration) -> Self {
        self.config.read_block = value;
        self
    }

    pub fn pending_backoff(mut self, value: Duration) -> Self {
        self.config.pending_backoff = value;
        self
    }

    pub fn order_lock_ttl(mut self, value: Duration) -> Self {
        self.config.order_lock_ttl = value;
        self
    }

    pub fn cache_null_ttl(mut self, value: Duration) -> Self {
        self.config.cache_null_ttl = value;
        self
    }

    pub fn cache_lock_ttl(mut self, value: Duration) -> Self {
        self.config.cache_lock_ttl = value;
        self
    }

    pub fn mutex_retry_delay(mut self, value: Duration) -> Self {
        self.config.mutex_retry_delay = value;
        self
    }

    pub fn mutex_max_retries(mut self, value: u32) -> Self {
        self.config.mutex_max_retries = value;
        self
    }

    /// Clamped to at least one worker
    pub fn rebuild_workers(mut self, value: usize) -> Self {
        self.config.rebuild_workers = value.max(1);
        self
    }

    pub fn id_epoch(mut self, value: i64) -> Self {
        self.config.id_epoch = value;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
