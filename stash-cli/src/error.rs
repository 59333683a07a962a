use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache error: {0}")]
    Asset(#[from] stash_engine::AssetError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Initialization failed: {0}")]
    Initialization(String),

    #[error("{0} asset(s) could not be fetched")]
    FetchFailed(usize),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
