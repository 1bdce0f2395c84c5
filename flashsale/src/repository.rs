#[cfg(feature = "memory")]
mod memory;
#[cfg(feature = "pg")]
mod pg;

#[cfg(feature = "memory")]
pub use memory::*;
#[cfg(feature = "pg")]
pub use pg::*;

use async_trait::async_trait;
use dyn_clone::DynClone;

use crate::{
    error::Result,
    order::{FlashSale, Order, OrderOutcome},
};

/// Boundary to the durable store, the source of truth for what was sold.
#[async_trait]
pub trait Repository: DynClone + Send + Sync {
    async fn save_flash_sale(&self, sale: &FlashSale) -> Result<()>;

    async fn get_flash_sale(&self, voucher_id: u64) -> Result<Option<FlashSale>>;

    /// Runs as one transaction: duplicate check, conditional stock decrement
    /// (`stock > 0`), then insert.
    async fn create_order(&self, order: &Order) -> Result<OrderOutcome>;

    async fn count_orders(&self, user_id: u64, voucher_id: u64) -> Result<u64>;

    async fn orders_of_voucher(&self, voucher_id: u64) -> Result<Vec<Order>>;
}

dyn_clone::clone_trait_object!(Repository);
