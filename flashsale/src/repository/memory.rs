use async_trait::async_trait;
use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc};

use crate::{
    error::Result,
    order::{FlashSale, Order, OrderOutcome},
    repository::Repository,
};

#[derive(Debug, Default)]
struct Tables {
    flash_sales: HashMap<u64, FlashSale>,
    orders: Vec<Order>,
}

/// In-process repository. The write lock makes `create_order` a single unit.
#[derive(Debug, Clone, Default)]
pub struct MemoryRepository(Arc<RwLock<Tables>>);

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn save_flash_sale(&self, sale: &FlashSale) -> Result<()> {
        self.0
            .write()
            .flash_sales
            .insert(sale.voucher_id, sale.clone());

        Ok(())
    }

    async fn get_flash_sale(&self, voucher_id: u64) -> Result<Option<FlashSale>> {
        Ok(self.0.read().flash_sales.get(&voucher_id).cloned())
    }

    async fn create_order(&self, order: &Order) -> Result<OrderOutcome> {
        let mut tables = self.0.write();

        if tables
            .orders
            .iter()
            .any(|o| o.user_id == order.user_id && o.voucher_id == order.voucher_id)
        {
            return Ok(OrderOutcome::Duplicate);
        }

        match tables.flash_sales.get_mut(&order.voucher_id) {
            Some(sale) if sale.stock > 0 => sale.stock -= 1,
            _ => return Ok(OrderOutcome::SoldOut),
        };

        tables.orders.push(order.clone());

        Ok(OrderOutcome::Persisted)
    }

    async fn count_orders(&self, user_id: u64, voucher_id: u64) -> Result<u64> {
        let count = self
            .0
            .read()
            .orders
            .iter()
            .filter(|o| o.user_id == user_id && o.voucher_id == voucher_id)
            .count();

        Ok(u64::try_from(count)?)
    }

    async fn orders_of_voucher(&self, voucher_id: u64) -> Result<Vec<Order>> {
        Ok(self
            .0
            .read()
            .orders
            .iter()
            .filter(|o| o.voucher_id == voucher_id)
            .cloned()
            .collect())
    }
}
