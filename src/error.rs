use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config validation error: {0}")]
    ConfigValidation(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("process error: {0}")]
    Process(String),

    #[error("prompt error: {0}")]
    Prompt(String),

    #[error("record store error: {0}")]
    Store(String),

    #[error("review pool is no longer running")]
    PoolClosed,
}

pub type Result<T> = std::result::Result<T, Error>;
