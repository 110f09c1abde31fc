//! Error taxonomy for the recorder.
//!
//! Only [`TransitionError`] is ever surfaced to a caller of the session API.
//! [`DeliveryError`] values are logged or collected into a broadcast report and
//! never interrupt an active recording.

use thiserror::Error;

use crate::types::{ContextId, SessionCommand, SessionState};

/// A command that has no edge out of the current session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cannot {command} while session is {from}")]
pub struct TransitionError {
    pub command: SessionCommand,
    pub from: SessionState,
}

/// Best-effort delivery failures. Expected, recoverable, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The receiving context was closed or navigated away.
    #[error("context {0} is gone")]
    ContextGone(ContextId),

    /// The collector could not be reached or refused the payload.
    #[error("HTTP delivery failed: {0}")]
    Http(String),

    /// No async runtime was available to carry the request.
    #[error("no async runtime available")]
    NoRuntime,
}

/// Errors from setup paths and from talking to the coordinator.
#[derive(Debug, Error)]
pub enum RecorderError {
    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// The coordinator task has shut down.
    #[error("session coordinator is not running")]
    CoordinatorGone,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("no element matches {0:?}")]
    UnknownNode(String),

    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T, E = RecorderError> = std::result::Result<T, E>;
