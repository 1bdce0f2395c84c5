use flashsale_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("lock `{0}` is already held")]
    AlreadyHeld(String),

    #[error("lock `{0}` is not owned by the releasing token")]
    NotOwner(String),

    #[error("sequence `{0}` exhausted its 32 bits for today")]
    SequenceOverflow(String),

    #[error("clock is before the id epoch")]
    ClockBeforeEpoch,

    #[error("admission script returned unknown status {0}")]
    UnknownScriptStatus(i64),

    #[error("invalid reservation `{0}`")]
    InvalidReservation(String),

    #[error("cache loader `{0}`")]
    Loader(anyhow::Error),

    #[error("store `{0}`")]
    Store(#[from] StoreError),

    #[cfg(feature = "pg")]
    #[error("sqlx `{0}`")]
    Sqlx(#[from] sqlx::Error),

    #[error("std::num `{0}`")]
    TryFromInt(#[from] std::num::TryFromIntError),

    #[error("serde_json `{0}`")]
    SerdeJson(#[from] serde_json::Error),

    #[error("{0}")]
    Any(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
