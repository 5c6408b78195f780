use thiserror::Error;

#[derive(Error, Debug)]
pub enum SplatGridError {
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Collective error: {0}")]
    Collective(String),

    #[error("Strategy error: {0}")]
    Strategy(String),

    #[error("Scene error: {0}")]
    Scene(String),

    #[error("Redistribution error: {0}")]
    Redistribution(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),
}

pub type Result<T> = std::result::Result<T, SplatGridError>;
