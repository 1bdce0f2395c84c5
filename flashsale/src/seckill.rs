use chrono::{DateTime, Utc};
use flashsale_store::{keys, Store};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    error::{Error, Result},
    id_worker::IdWorker,
    order::FlashSale,
    repository::Repository,
};

/// Why a purchase attempt was turned away. A business answer, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    InsufficientStock,
    DuplicateOrder,
    NotStarted,
    Ended,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Rejection::InsufficientStock => "insufficient stock",
            Rejection::DuplicateOrder => "user already ordered this voucher",
            Rejection::NotStarted => "flash sale has not started",
            Rejection::Ended => "flash sale has ended",
        };

        f.write_str(reason)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// One unit is reserved. The order is persisted asynchronously by the
    /// [`crate::OrderConsumer`], so it may not be readable yet.
    Admitted { order_id: u64 },
    Rejected(Rejection),
}

impl Admission {
    pub fn order_id(&self) -> Option<u64> {
        match self {
            Admission::Admitted { order_id } => Some(*order_id),
            Admission::Rejected(_) => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SaleWindow {
    begin_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
}

impl SaleWindow {
    /// Half-open: `begin_time` is inside the window, `end_time` is not.
    fn rejection_at(&self, at: DateTime<Utc>) -> Option<Rejection> {
        if at < self.begin_time {
            return Some(Rejection::NotStarted);
        }

        if at >= self.end_time {
            return Some(Rejection::Ended);
        }

        None
    }
}

/// Admission side of the flash-sale pipeline.
#[derive(Clone)]
pub struct Seckill {
    store: Store,
    repository: Box<dyn Repository>,
    ids: IdWorker,
}

impl Seckill {
    pub fn new<R: Repository + 'static>(store: Store, repository: R, config: &Config) -> Self {
        Self {
            ids: IdWorker::new(store.clone(), config),
            store,
            repository: Box::new(repository),
        }
    }

    /// Persists the promotion, then seeds the stock counter and sale window
    /// and forgets users admitted to any previous sale on the same voucher.
    pub async fn create_flash_sale(&self, sale: &FlashSale) -> Result<()> {
        self.repository.save_flash_sale(sale).await?;

        let voucher_id = sale.voucher_id;

        self.store.delete(&keys::admitted(voucher_id)).await?;
        self.store
            .set_json(
                &keys::window(voucher_id),
                &SaleWindow {
                    begin_time: sale.begin_time,
                    end_time: sale.end_time,
                },
                None,
            )
            .await?;
        self.store
            .set(&keys::stock(voucher_id), &sale.stock.to_string(), None)
            .await?;

        info!("flash sale on voucher {voucher_id} opened with {} units", sale.stock);

        Ok(())
    }

    /// Retires the fast-path state of a promotion. Orders already admitted
    /// are still persisted by the consumer.
    pub async fn end_flash_sale(&self, voucher_id: u64) -> Result<()> {
        self.store.delete(&keys::stock(voucher_id)).await?;
        self.store.delete(&keys::window(voucher_id)).await?;
        self.store.delete(&keys::admitted(voucher_id)).await?;

        info!("flash sale on voucher {voucher_id} retired");

        Ok(())
    }

    /// Decides synchronously whether `user_id` gets one unit of `voucher_id`.
    /// Never waits for persistence.
    pub async fn admit(&self, user_id: u64, voucher_id: u64) -> Result<Admission> {
        if let Some(window) = self
            .store
            .get_json::<SaleWindow>(&keys::window(voucher_id))
            .await?
        {
            if let Some(rejection) = window.rejection_at(Utc::now()) {
                return Ok(Admission::Rejected(rejection));
            }
        }

        let order_id = self.ids.next_id("order").await?;
        let status = self
            .store
            .seckill(
                &voucher_id.to_string(),
                &user_id.to_string(),
                &order_id.to_string(),
            )
            .await?;

        let admission = match status {
            0 => Admission::Admitted { order_id },
            1 => Admission::Rejected(Rejection::InsufficientStock),
            2 => Admission::Rejected(Rejection::DuplicateOrder),
            status => return Err(Error::UnknownScriptStatus(status)),
        };

        debug!("user {user_id} on voucher {voucher_id}: {admission:?}");

        Ok(admission)
    }

    /// Units left on the fast path, `None` when no sale is running.
    pub async fn remaining_stock(&self, voucher_id: u64) -> Result<Option<i64>> {
        let Some(stock) = self.store.get(&keys::stock(voucher_id)).await? else {
            return Ok(None);
        };

        let stock = stock
            .parse::<i64>()
            .map_err(|e| anyhow::anyhow!("stock of voucher {voucher_id}: {e}"))?;

        if stock < 0 {
            warn!("negative stock {stock} observed on voucher {voucher_id}");
        }

        Ok(Some(stock))
    }

    pub async fn admitted_users(&self, voucher_id: u64) -> Result<u64> {
        Ok(self.store.scard(&keys::admitted(voucher_id)).await?)
    }
}
