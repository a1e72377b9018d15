//! The capability the controller needs from the remote server connection.
//!
//! Everything the controller knows about the server goes through
//! [`RpcSession`]: immediate queries, calls staged for the next multicall,
//! and the callbacks the server pushed since the last poll.

use shared::{Fault, RpcValue};
use std::time::Duration;
use thiserror::Error;

/// Server-pushed notification, e.g. `TrackMania.PlayerConnect`.
#[derive(Debug, Clone, PartialEq)]
pub struct Callback {
    pub method: String,
    pub params: Vec<RpcValue>,
}

impl Callback {
    pub fn new(method: impl Into<String>, params: Vec<RpcValue>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }

    pub fn param(&self, index: usize) -> &RpcValue {
        static NIL: RpcValue = RpcValue::Nil;
        self.params.get(index).unwrap_or(&NIL)
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("unexpected protocol '{0}'")]
    Handshake(String),

    #[error("connection closed by server")]
    Closed,

    #[error("no reply to {method} within {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    #[error("malformed multicall reply: {0}")]
    MalformedBatch(String),
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("{0}")]
    Fault(Fault),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub trait RpcSession {
    /// Sends one call and waits for its reply, outside any batch.
    fn query(&mut self, method: &str, params: Vec<RpcValue>) -> Result<RpcValue, QueryError>;

    /// Adds a call to the current batch and returns its position in it.
    fn stage_batched(&mut self, method: &str, params: Vec<RpcValue>) -> usize;

    /// Sends the current batch in one round trip and clears it.
    ///
    /// The outer error means no reply could be matched to any call. The
    /// returned vector is indexed by the positions [`stage_batched`] handed
    /// out.
    ///
    /// [`stage_batched`]: RpcSession::stage_batched
    fn flush_batch(&mut self) -> Result<Vec<Result<RpcValue, Fault>>, TransportError>;

    /// Callbacks received since the last poll, in arrival order.
    fn poll_callbacks(&mut self) -> Result<Vec<Callback>, TransportError>;

    /// Fault of the most recent failed query.
    fn last_error(&self) -> Option<&Fault>;
}
