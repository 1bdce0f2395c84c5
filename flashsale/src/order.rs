use chrono::{DateTime, Utc};
use flashsale_store::StreamMessage;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A limited-stock promotion on a voucher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashSale {
    pub voucher_id: u64,
    pub stock: u32,
    pub begin_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// The durable record of one sold unit. At most one per `(user_id, voucher_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: u64,
    pub user_id: u64,
    pub voucher_id: u64,
    pub created_at: DateTime<Utc>,
}

/// An admitted purchase waiting in the reservation stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    /// Stream message id, used to acknowledge the reservation.
    pub id: String,
    pub order_id: u64,
    pub user_id: u64,
    pub voucher_id: u64,
    pub reserved_at: Option<DateTime<Utc>>,
}

impl Reservation {
    pub fn order(&self) -> Order {
        Order {
            id: self.order_id,
            user_id: self.user_id,
            voucher_id: self.voucher_id,
            created_at: Utc::now(),
        }
    }
}

impl TryFrom<&StreamMessage> for Reservation {
    type Error = Error;

    fn try_from(message: &StreamMessage) -> Result<Self> {
        let number = |name: &str| -> Result<u64> {
            let value = message.field(name)?;

            value.parse::<u64>().map_err(|_| {
                Error::InvalidReservation(format!("{}: {name} = {value}", message.id))
            })
        };

        let reserved_at = message
            .id
            .split_once('-')
            .and_then(|(ms, _)| ms.parse::<i64>().ok())
            .and_then(DateTime::<Utc>::from_timestamp_millis);

        Ok(Self {
            id: message.id.to_owned(),
            order_id: number("id")?,
            user_id: number("userId")?,
            voucher_id: number("voucherId")?,
            reserved_at,
        })
    }
}

/// Result of the transactional persistence step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderOutcome {
    Persisted,
    /// The user already owns an order for this voucher.
    Duplicate,
    /// The durable stock was already exhausted.
    SoldOut,
}
