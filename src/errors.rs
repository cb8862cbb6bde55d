use crate::types::{ConditionCode, ReturnCode, State};
use thiserror::Error;

/// Error taxonomy for session operations.
///
/// Device and protocol outcomes travel as [`ReturnCode`] values in
/// `Ok`; `Err` is reserved for conditions the caller's code caused:
/// an operation issued outside its legal state range, a container
/// that does not match its declared shape, a threading-bridge action
/// that failed, or misuse of a disposed session.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TwainError {
    #[error("operation requires state {min:?}..={max:?} but session is at {current:?}")]
    State {
        current: State,
        min: State,
        max: State,
    },

    #[error("native call returned {rc:?} (condition code {condition:?})")]
    Protocol {
        rc: ReturnCode,
        condition: ConditionCode,
    },

    #[error("container marshal mismatch: {0}")]
    Marshal(String),

    #[error("threading bridge failure: {0}")]
    Threading(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("session has been disposed")]
    Disposed,
}

impl TwainError {
    pub fn marshal(message: impl Into<String>) -> Self {
        Self::Marshal(message.into())
    }

    pub fn threading(message: impl Into<String>) -> Self {
        Self::Threading(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn protocol(rc: ReturnCode, condition: ConditionCode) -> Self {
        Self::Protocol { rc, condition }
    }

    /// True when the error is the pre-call state guard rejecting the
    /// operation, meaning nothing reached the native manager.
    pub fn is_state_error(&self) -> bool {
        matches!(self, Self::State { .. })
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TwainError>;
