use async_trait::async_trait;
use dyn_clone::DynClone;
use std::{collections::HashMap, time::Duration};

use crate::error::{Result, StoreError};

#[cfg(feature = "memory")]
mod memory;
#[cfg(feature = "redis")]
mod redis;

#[cfg(feature = "memory")]
pub use self::memory::*;
#[cfg(feature = "redis")]
pub use self::redis::*;

/// Where a group read starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOffset {
    /// Messages never delivered to the group (`>`).
    New,
    /// The consumer's own delivered-but-unacknowledged messages, from the start (`0`).
    Pending,
}

impl ReadOffset {
    pub fn as_id(&self) -> &'static str {
        match self {
            ReadOffset::New => ">",
            ReadOffset::Pending => "0",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    pub id: String,
    pub fields: HashMap<String, String>,
}

impl StreamMessage {
    pub fn field(&self, name: &str) -> Result<&str> {
        self.fields
            .get(name)
            .map(|v| v.as_str())
            .ok_or_else(|| StoreError::InvalidMessage(format!("{} has no field {name}", self.id)))
    }
}

#[async_trait]
pub trait Engine: DynClone + Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Set-if-absent with expiry, as one operation.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<bool>;

    /// Deletes `key` only while it still holds `expected`.
    async fn delete_if_eq(&self, key: &str, expected: &str) -> Result<bool>;

    async fn incr(&self, key: &str) -> Result<i64>;

    async fn scard(&self, key: &str) -> Result<u64>;

    /// Atomic flash-sale admission: `0` admitted, `1` insufficient stock,
    /// `2` user already admitted. On `0` the stock is decremented, the user
    /// recorded and a reservation appended to [`crate::keys::ORDER_STREAM`].
    async fn seckill(&self, voucher_id: &str, user_id: &str, order_id: &str) -> Result<i64>;

    async fn create_group(&self, stream: &str, group: &str) -> Result<()>;

    async fn add(&self, stream: &str, fields: &[(String, String)]) -> Result<String>;

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Option<Duration>,
        offset: ReadOffset,
    ) -> Result<Vec<StreamMessage>>;

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<bool>;

    async fn pending(&self, stream: &str, group: &str) -> Result<u64>;
}

dyn_clone::clone_trait_object!(Engine);
