use std::time::Duration;

use thiserror::Error;

/// Coarse classification of [`VmError`], used by callers that need to tell a
/// timed out wait apart from a protocol violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Allocation,
    NotFound,
    Timeout,
    Transport,
    Protocol,
    Unsupported,
    Internal,
}

#[derive(Error, Debug)]
pub enum VmError {
    #[error("failed to generate token: {0}")]
    TokenGeneration(String),

    #[error("unknown token {0}")]
    UnknownToken(String),

    #[error("shim already connected to token {0}")]
    ShimAlreadyConnected(String),

    #[error("timed out after {0:?} waiting for shim to connect")]
    ShimTimeout(Duration),

    #[error("timed out after {0:?} waiting for process to start")]
    ProcessTimeout(Duration),

    #[error("{command}: {count} tokens given, at most one allowed")]
    TooManyTokens { command: String, count: usize },

    #[error("{0}: tokens are only accepted by newcontainer and execcmd")]
    UnexpectedTokens(String),

    #[error("{command}: process {field} already set to {value}")]
    SequenceAlreadySet {
        command: String,
        field: &'static str,
        value: u64,
    },

    #[error("{command}: malformed payload: {reason}")]
    MalformedCommand { command: String, reason: String },

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("signalling a process without a container is not supported")]
    NoContainer,

    #[error("session has no connected shim")]
    NoClient,

    #[error("client connection closed")]
    ClientClosed,

    #[error("vm {0} already connected")]
    AlreadyConnected(String),

    #[error("vm {0} is closed")]
    VmClosed(String),

    #[error("guest returned an error for {command}: {message}")]
    Guest { command: String, message: String },

    #[error("guest protocol error: {0}")]
    GuestProtocol(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl VmError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VmError::TokenGeneration(_) => ErrorKind::Allocation,
            VmError::UnknownToken(_) => ErrorKind::NotFound,
            VmError::ShimTimeout(_) | VmError::ProcessTimeout(_) => ErrorKind::Timeout,
            VmError::ShimAlreadyConnected(_)
            | VmError::TooManyTokens { .. }
            | VmError::UnexpectedTokens(_)
            | VmError::SequenceAlreadySet { .. }
            | VmError::MalformedCommand { .. }
            | VmError::InvalidPayload(_)
            | VmError::Json(_) => ErrorKind::Protocol,
            VmError::NoContainer => ErrorKind::Unsupported,
            VmError::NoClient
            | VmError::ClientClosed
            | VmError::AlreadyConnected(_)
            | VmError::VmClosed(_)
            | VmError::Internal(_) => ErrorKind::Internal,
            VmError::Guest { .. } | VmError::GuestProtocol(_) | VmError::Io(_) => {
                ErrorKind::Transport
            }
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }
}

pub type Result<T> = std::result::Result<T, VmError>;
