use thiserror::Error;

use crate::{
    application::render::{DebounceError, RenderConfigError, RenderError},
    config::LoadError,
    infra::error::InfraError,
};

/// Top-level error reported by the binary before exiting.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] LoadError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    RenderConfig(#[from] RenderConfigError),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error(transparent)]
    Debounce(#[from] DebounceError),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Infra(InfraError::Io(err))
    }
}
