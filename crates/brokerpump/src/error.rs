// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types for pumps, links and settlement.

use thiserror::Error;

/// Result type for pump operations.
pub type Result<T> = std::result::Result<T, PumpError>;

/// Error raised by a user handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Errors reported by the link provider and the management channel.
///
/// `Clone` so a single failure can be handed to every waiter (error handler,
/// termination signal, statistics) without re-wrapping.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LinkError {
    #[error("link '{0}' is closed")]
    Closed(String),

    #[error("no session available on '{0}'")]
    NoSessionAvailable(String),

    #[error("session lock lost for session '{0}'")]
    SessionLockLost(String),

    #[error("message lock lost for lock token '{0}'")]
    MessageLockLost(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("operation timed out")]
    Timeout,

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("transport error: {0}")]
    Transport(String),
}

/// Why a pump stopped.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TerminationCause {
    #[error("cancelled by owner")]
    Cancelled,

    #[error("session acquisition failed: {0}")]
    AcquireFailed(#[source] LinkError),

    #[error("receive link failed: {0}")]
    LinkFailed(#[source] LinkError),

    #[error("connection reported closed by health check")]
    ConnectionClosed,
}

impl TerminationCause {
    /// Cancellation is the only cause that is not a failure.
    pub fn is_failure(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }
}

/// Pump and settlement errors.
#[derive(Debug, Error)]
pub enum PumpError {
    /// Fatal pump stop, normalized with the pump's identity.
    #[error("pump {pump_id} for '{namespace}/{entity_path}' terminated: {cause}")]
    Terminated {
        pump_id: u64,
        namespace: String,
        entity_path: String,
        #[source]
        cause: TerminationCause,
    },

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("session '{0}' has no active receiver")]
    SessionNotFound(String),

    #[error("lock token '{0}' is not held by this receiver")]
    LockTokenNotHeld(String),

    #[error("message '{0}' is already settled")]
    AlreadySettled(String),

    #[error("settlement is not supported in receive-and-delete mode")]
    ReceiveAndDelete,

    #[error("link error: {0}")]
    Link(#[from] LinkError),

    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

impl PumpError {
    /// Cause of a `Terminated` error.
    pub fn termination_cause(&self) -> Option<&TerminationCause> {
        match self {
            Self::Terminated { cause, .. } => Some(cause),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_terminated_display_carries_identity() {
        let err = PumpError::Terminated {
            pump_id: 7,
            namespace: "ns.example.net".into(),
            entity_path: "orders".into(),
            cause: TerminationCause::AcquireFailed(LinkError::Transport("reset".into())),
        };

        let text = err.to_string();
        assert!(text.contains("pump 7"));
        assert!(text.contains("ns.example.net/orders"));
        assert!(text.contains("session acquisition failed"));

        let cause = err.source().expect("cause");
        assert!(cause.source().is_some());
    }

    #[test]
    fn test_cancelled_is_not_failure() {
        assert!(!TerminationCause::Cancelled.is_failure());
        assert!(TerminationCause::ConnectionClosed.is_failure());
        assert!(TerminationCause::LinkFailed(LinkError::Timeout).is_failure());
    }
}
