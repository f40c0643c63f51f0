use thiserror::Error;

use crate::StrategyKind;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Exchange API error: {0}")]
    Exchange(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection failed after {attempts} attempts: {reason}")]
    ConnectFailed { attempts: u32, reason: String },

    #[error("{op} rejected by exchange: {reason}")]
    SubscriptionRejected { op: String, reason: String },

    #[error("Unknown strategy '{0}'")]
    UnknownStrategy(String),

    #[error("Invalid {kind} parameter: {reason}")]
    InvalidParameter { kind: StrategyKind, reason: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
