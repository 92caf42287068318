//! Error types for the simulation harness.

use asi_protocol::ProtocolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("hex decoding error: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("invalid bench: {0}")]
    InvalidBench(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type SimResult<T> = Result<T, SimError>;
