use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::debug;

use crate::{
    error::Result,
    order::{FlashSale, Order, OrderOutcome},
    repository::Repository,
};

type OrderRow = (i64, i64, i64, DateTime<Utc>);

fn to_order((id, user_id, voucher_id, created_at): OrderRow) -> Result<Order> {
    Ok(Order {
        id: u64::try_from(id)?,
        user_id: u64::try_from(user_id)?,
        voucher_id: u64::try_from(voucher_id)?,
        created_at,
    })
}

/// Postgres repository. Tables are `<prefix>_flash_sale` and `<prefix>_order`,
/// see `tests/fixtures/pg`.
#[derive(Debug, Clone)]
pub struct PgRepository {
    pool: PgPool,
    prefix: Option<String>,
}

impl PgRepository {
    pub fn new(pool: &PgPool) -> Self {
        Self {
            pool: pool.clone(),
            prefix: None,
        }
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());

        self
    }

    pub fn table(&self, name: impl Into<String>) -> String {
        format!(
            "{}_{}",
            self.prefix.as_deref().unwrap_or("fs"),
            name.into()
        )
    }

    pub fn table_flash_sale(&self) -> String {
        self.table("flash_sale")
    }

    pub fn table_order(&self) -> String {
        self.table("order")
    }
}

#[async_trait]
impl Repository for PgRepository {
    async fn save_flash_sale(&self, sale: &FlashSale) -> Result<()> {
        let table_flash_sale = self.table_flash_sale();

        sqlx::query(
            format!(
                r#"
            INSERT INTO {table_flash_sale} (voucher_id, stock, begin_time, end_time)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (voucher_id)
            DO
                UPDATE SET stock = $2, begin_time = $3, end_time = $4
            "#
            )
            .as_str(),
        )
        .bind(i64::try_from(sale.voucher_id)?)
        .bind(i64::from(sale.stock))
        .bind(sale.begin_time)
        .bind(sale.end_time)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_flash_sale(&self, voucher_id: u64) -> Result<Option<FlashSale>> {
        let table_flash_sale = self.table_flash_sale();

        let row = sqlx::query_as::<_, (i64, i64, DateTime<Utc>, DateTime<Utc>)>(
            format!(
                r#"
            SELECT voucher_id, stock, begin_time, end_time
            FROM {table_flash_sale} WHERE voucher_id = $1
            "#
            )
            .as_str(),
        )
        .bind(i64::try_from(voucher_id)?)
        .fetch_optional(&self.pool)
        .await?;

        let Some((voucher_id, stock, begin_time, end_time)) = row else {
            return Ok(None);
        };

        Ok(Some(FlashSale {
            voucher_id: u64::try_from(voucher_id)?,
            stock: u32::try_from(stock)?,
            begin_time,
            end_time,
        }))
    }

    async fn create_order(&self, order: &Order) -> Result<OrderOutcome> {
        let table_flash_sale = self.table_flash_sale();
        let table_order = self.table_order();
        let user_id = i64::try_from(order.user_id)?;
        let voucher_id = i64::try_from(order.voucher_id)?;

        let mut tx = self.pool.begin().await?;

        let (count,) = sqlx::query_as::<_, (i64,)>(
            format!(
                r#"
            SELECT COUNT(*) FROM {table_order} WHERE user_id = $1 AND voucher_id = $2
            "#
            )
            .as_str(),
        )
        .bind(user_id)
        .bind(voucher_id)
        .fetch_one(&mut *tx)
        .await?;

        if count > 0 {
            return Ok(OrderOutcome::Duplicate);
        }

        let decremented = sqlx::query(
            format!(
                r#"
            UPDATE {table_flash_sale}
            SET stock = stock - 1
            WHERE voucher_id = $1 AND stock > 0
            "#
            )
            .as_str(),
        )
        .bind(voucher_id)
        .execute(&mut *tx)
        .await?;

        if decremented.rows_affected() == 0 {
            return Ok(OrderOutcome::SoldOut);
        }

        let inserted = sqlx::query(
            format!(
                r#"
            INSERT INTO {table_order} (id, user_id, voucher_id, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id, voucher_id) DO NOTHING
            "#
            )
            .as_str(),
        )
        .bind(i64::try_from(order.id)?)
        .bind(user_id)
        .bind(voucher_id)
        .bind(order.created_at)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            debug!(
                "order of user {} on voucher {} raced in, rolling back",
                order.user_id, order.voucher_id
            );

            tx.rollback().await?;

            return Ok(OrderOutcome::Duplicate);
        }

        tx.commit().await?;

        Ok(OrderOutcome::Persisted)
    }

    async fn count_orders(&self, user_id: u64, voucher_id: u64) -> Result<u64> {
        let table_order = self.table_order();

        let (count,) = sqlx::query_as::<_, (i64,)>(
            format!(
                r#"
            SELECT COUNT(*) FROM {table_order} WHERE user_id = $1 AND voucher_id = $2
            "#
            )
            .as_str(),
        )
        .bind(i64::try_from(user_id)?)
        .bind(i64::try_from(voucher_id)?)
        .fetch_one(&self.pool)
        .await?;

        Ok(u64::try_from(count)?)
    }

    async fn orders_of_voucher(&self, voucher_id: u64) -> Result<Vec<Order>> {
        let table_order = self.table_order();

        let rows = sqlx::query_as::<_, OrderRow>(
            format!(
                r#"
            SELECT id, user_id, voucher_id, created_at
            FROM {table_order} WHERE voucher_id = $1
            ORDER BY created_at, id
            "#
            )
            .as_str(),
        )
        .bind(i64::try_from(voucher_id)?)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(to_order).collect()
    }
}
