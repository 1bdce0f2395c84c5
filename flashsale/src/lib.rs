#![forbid(unsafe_code)]

pub mod cache;
pub mod config;
mod consumer;
mod error;
mod id_worker;
mod lock;
mod order;
pub mod repository;
mod seckill;

pub use cache::{CacheClient, CacheStrategy};
pub use config::{Config, ConfigBuilder};
pub use consumer::*;
pub use error::*;
pub use id_worker::*;
pub use lock::*;
pub use order::*;
pub use repository::Repository;
pub use seckill::*;

pub use flashsale_store as store;
