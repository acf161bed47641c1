use thiserror::Error;

use crate::llm::registry::RegistryError;

/// Errors returned by session operations.
///
/// Failures that happen after a stream was handed out are reported as
/// `StreamEvent::Error` on the stream instead.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to create native engine from config `{config_path}`")]
    CreateFailed { config_path: String },

    #[error("model is not loaded")]
    NotLoaded,

    #[error("a generation is already in progress")]
    Busy,

    #[error("session has been disposed")]
    Disposed,

    #[error("generation failed: {0}")]
    GenerationFailed(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

pub type Result<T> = std::result::Result<T, SessionError>;
