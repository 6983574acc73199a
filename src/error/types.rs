use std::fmt::Display;

use futures::task::SpawnError;
use thiserror::Error;

use crate::logging::LoggingError;

/// Unified result type for the view-model stack crate.
pub type Result<T> = std::result::Result<T, StackError>;

/// Errors surfaced by the view-model stack.
#[derive(Debug, Error)]
pub enum StackError {
    #[error("no view-model is mapped for parameters type `{type_name}`")]
    Unmapped { type_name: &'static str },
    #[error("view-model stack has been disposed")]
    Disposed,
    #[error("service handle is detached from its stack")]
    Detached,
    #[error("entry was torn down before it closed")]
    Cancelled,
    #[error("view-model failure: {0}")]
    ViewModel(String),
    #[error("failed to spawn removal task: {0}")]
    Spawn(#[from] SpawnError),
    #[error(transparent)]
    Logging(#[from] LoggingError),
}

impl StackError {
    /// Wrap a failure raised by view-model code (factories, veto callbacks, disposers).
    pub fn view_model(message: impl Display) -> Self {
        Self::ViewModel(message.to_string())
    }
}
