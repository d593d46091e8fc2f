use thiserror::Error;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("Media error: {0}")]
    Media(String),

    #[error("Signaling transport error: {0}")]
    Transport(#[from] counsel_core::Error),

    #[error("Invalid call state: {0}")]
    InvalidState(String),

    #[error("Call agent has stopped")]
    AgentStopped,
}

pub type CallResult<T> = std::result::Result<T, CallError>;
