//! Key namespaces shared by every engine.
//!
//! The admission script builds its keys from these prefixes on the store side,
//! so they must not change without changing the script.

use std::fmt::Display;

/// Remaining units of a flash sale, `seckill:stock:<voucherId>`.
pub const SECKILL_STOCK_KEY: &str = "seckill:stock:";

/// Users already admitted to a flash sale, `seckill:order:<voucherId>`.
pub const SECKILL_ORDER_KEY: &str = "seckill:order:";

/// Sale window of a flash sale, `seckill:window:<voucherId>`.
pub const SECKILL_WINDOW_KEY: &str = "seckill:window:";

/// Stream receiving one reservation per admission.
pub const ORDER_STREAM: &str = "stream.orders";

pub const LOCK_KEY: &str = "lock:";

pub const SEQ_KEY: &str = "seq:";

pub fn stock(voucher_id: impl Display) -> String {
    format!("{SECKILL_STOCK_KEY}{voucher_id}")
}

pub fn admitted(voucher_id: impl Display) -> String {
    format!("{SECKILL_ORDER_KEY}{voucher_id}")
}

pub fn window(voucher_id: impl Display) -> String {
    format!("{SECKILL_WINDOW_KEY}{voucher_id}")
}

pub fn lock(resource: impl Display) -> String {
    format!("{LOCK_KEY}{resource}")
}

/// `seq:<prefix>:<yyyy:mm:dd>`
pub fn sequence(prefix: impl Display, day: impl Display) -> String {
    format!("{SEQ_KEY}{prefix}:{day}")
}
