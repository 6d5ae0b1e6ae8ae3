use thiserror::Error;

/// Errors produced by the nodebridge crates.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("api error: {0}")]
    Api(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid subprotocol: {0}")]
    InvalidSubprotocol(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<reqwest::Error> for BridgeError {
    fn from(e: reqwest::Error) -> Self {
        BridgeError::Api(e.to_string())
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;
