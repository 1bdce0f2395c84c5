use flashsale_store::{keys, Store};
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Proof of ownership returned by [`Lock::try_acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    resource: String,
    token: String,
}

impl LockToken {
    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

/// Mutual exclusion keyed by resource name, stored under `lock:<resource>`.
///
/// Acquire never blocks or retries; callers own their retry policy. Every
/// lock carries a TTL so a crashed holder cannot block others forever.
#[derive(Clone)]
pub struct Lock {
    store: Store,
}

impl Lock {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn try_acquire(&self, resource: &str, ttl: Duration) -> Result<LockToken> {
        let token = Uuid::new_v4().to_string();

        if !self
            .store
            .set_nx(&keys::lock(resource), &token, ttl)
            .await?
        {
            return Err(Error::AlreadyHeld(resource.to_owned()));
        }

        Ok(LockToken {
            resource: resource.to_owned(),
            token,
        })
    }

    /// Fails with [`Error::NotOwner`] and leaves the key untouched when the lock
    /// expired and was taken by someone else in the meantime.
    pub async fn release(&self, token: &LockToken) -> Result<()> {
        if self
            .store
            .delete_if_eq(&keys::lock(&token.resource), &token.token)
            .await?
        {
            return Ok(());
        }

        warn!(
            "lock {} released by token {} that no longer owns it",
            token.resource, token.token
        );

        Err(Error::NotOwner(token.resource.to_owned()))
    }
}
