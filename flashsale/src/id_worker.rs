use chrono::Utc;
use flashsale_store::{keys, Store};

use crate::{
    config::Config,
    error::{Error, Result},
};

const COUNT_BITS: u32 = 32;

/// Globally unique 64-bit ids: seconds since the epoch in the high bits, a
/// per-namespace per-day counter from the store in the low 32 bits.
///
/// The counter restarts every UTC day, which is safe only because the
/// timestamp part has moved on by then.
#[derive(Clone)]
pub struct IdWorker {
    store: Store,
    epoch: i64,
}

impl IdWorker {
    pub fn new(store: Store, config: &Config) -> Self {
        Self {
            store,
            epoch: config.id_epoch,
        }
    }

    pub async fn next_id(&self, namespace: &str) -> Result<u64> {
        let now = Utc::now();
        let timestamp =
            u64::try_from(now.timestamp() - self.epoch).map_err(|_| Error::ClockBeforeEpoch)?;

        let key = keys::sequence(namespace, now.format("%Y:%m:%d"));
        let count = self.store.incr(&key).await?;

        let count = u64::try_from(count)
            .ok()
            .filter(|count| *count <= u64::from(u32::MAX))
            .ok_or_else(|| Error::SequenceOverflow(key))?;

        Ok(timestamp << COUNT_BITS | count)
    }

    pub fn timestamp_of(id: u64) -> u64 {
        id >> COUNT_BITS
    }

    pub fn sequence_of(id: u64) -> u64 {
        id & u64::from(u32::MAX)
    }
}
