use std::time::Duration;

use thiserror::Error;

use crate::codec::CodecError;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PushError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("handshake rejected: {0}")]
    Handshake(String),
    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection closed")]
    Closed,
    #[error("connect attempt cancelled")]
    Cancelled,
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("failed to encode message body: {0}")]
    Encode(String),
    #[error("session manager is no longer running")]
    ManagerGone,
}

impl From<CodecError> for PushError {
    fn from(err: CodecError) -> Self {
        PushError::Encode(err.to_string())
    }
}

pub type PushResult<T> = Result<T, PushError>;
