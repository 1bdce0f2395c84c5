#![forbid(unsafe_code)]

mod engine;
mod error;
pub mod keys;
mod store;

pub use engine::*;
pub use error::*;
pub use store::*;
