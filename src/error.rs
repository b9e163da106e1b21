//! Error taxonomy for boundary calls.

use std::fmt;
use thiserror::Error;

/// A failure raised by a host operation, shaped like a DOM exception.
///
/// These are the values that end up behind a pending-error handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostError {
    pub name: String,
    pub message: String,
}

impl HostError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }

    pub fn syntax_error(message: impl Into<String>) -> Self {
        Self::new("SyntaxError", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("NotFoundError", message)
    }

    pub fn hierarchy(message: impl Into<String>) -> Self {
        Self::new("HierarchyRequestError", message)
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new("InvalidStateError", message)
    }

    pub fn invalid_character(message: impl Into<String>) -> Self {
        Self::new("InvalidCharacterError", message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new("NetworkError", message)
    }

    pub fn abort(message: impl Into<String>) -> Self {
        Self::new("AbortError", message)
    }
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for HostError {}

/// Errors raised while servicing a call across the boundary.
///
/// `ProtocolViolation` and `Trap` are fatal: they mean the handle table or a
/// closure state can no longer be trusted, and the bridge refuses further
/// calls once one has been observed. The remaining kinds are recoverable and
/// are handed to the guest through the pending-error slot.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BridgeError {
    #[error("decode error: {0}")]
    Decode(String),

    #[error("allocation failure: {0}")]
    AllocationFailure(String),

    #[error("host operation failed: {0}")]
    HostOperation(HostError),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("module trapped: {0}")]
    Trap(String),
}

impl BridgeError {
    pub fn protocol(message: impl Into<String>) -> Self {
        BridgeError::ProtocolViolation(message.into())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BridgeError::ProtocolViolation(_) | BridgeError::Trap(_)
        )
    }

    /// The value a guest observes for a recoverable failure.
    pub fn to_host_error(&self) -> HostError {
        match self {
            BridgeError::HostOperation(err) => err.clone(),
            BridgeError::Decode(msg) => HostError::type_error(msg.clone()),
            BridgeError::AllocationFailure(msg) => HostError::new("RangeError", msg.clone()),
            BridgeError::ProtocolViolation(msg) => HostError::new("ProtocolViolation", msg.clone()),
            BridgeError::Trap(msg) => HostError::new("RuntimeError", msg.clone()),
        }
    }
}

impl From<HostError> for BridgeError {
    fn from(err: HostError) -> Self {
        BridgeError::HostOperation(err)
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;
