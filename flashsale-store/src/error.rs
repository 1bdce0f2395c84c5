#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("consumer group `{group}` does not exist on stream `{stream}`")]
    NoGroup { stream: String, group: String },

    #[error("value at `{0}` is not an integer")]
    NotAnInteger(String),

    #[error("invalid stream message `{0}`")]
    InvalidMessage(String),

    #[cfg(feature = "redis")]
    #[error("redis `{0}`")]
    Redis(#[from] redis::RedisError),

    #[error("serde_json `{0}`")]
    SerdeJson(#[from] serde_json::Error),

    #[error("{0}")]
    Any(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;
