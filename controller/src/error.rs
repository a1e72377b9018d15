//! Controller error taxonomy.
//!
//! | Variant | Fatal | Raised by |
//! |---------|-------|-----------|
//! | [`EngineError::Protocol`] | Yes | a multicall round trip that could not be correlated |
//! | [`EngineError::Configuration`] | Yes | settings or list files at startup |
//! | [`EngineError::ReadinessTimeout`] | Yes | startup wait for the server |
//! | [`EngineError::Transport`] | Yes | the socket or frame codec |
//! | [`EngineError::Query`] | No | a synchronous query answered with a fault |
//! | [`EngineError::Persistence`] | No | writing a list file |
//!
//! Only the main loop decides what to do with an error. Fatal errors end the
//! loop after the shutdown hook ran; everything else is logged and the tick
//! carries on.

use crate::config::ConfigError;
use crate::rpc::TransportError;
use shared::Fault;
use std::time::Duration;
use thiserror::Error;

/// Error type returned by event and command handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// A whole batch failed, responses can no longer be matched to calls.
    #[error("multicall round trip failed: {0}")]
    Protocol(#[source] TransportError),

    #[error(transparent)]
    Configuration(ConfigError),

    #[error("server did not reach status 'Running - Play' within {0:?}")]
    ReadinessTimeout(Duration),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("{method} failed: {fault}")]
    Query { method: String, fault: Fault },

    #[error("failed to persist {what}: {source}")]
    Persistence {
        what: &'static str,
        #[source]
        source: ConfigError,
    },
}

impl EngineError {
    pub fn query(method: impl Into<String>, fault: Fault) -> Self {
        Self::Query {
            method: method.into(),
            fault,
        }
    }

    /// Whether the controller has to stop after this error.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Query { .. } | Self::Persistence { .. })
    }
}
