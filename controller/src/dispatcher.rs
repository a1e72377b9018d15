//! Multicall dispatcher
//!
//! Calls staged during a tick are collected here and sent to the server in a
//! single `system.multicall` round trip by [`Dispatcher::flush`]. Replies are
//! matched back to their calls strictly by batch index.

use crate::rpc::{RpcSession, TransportError};
use log::{debug, error};
use shared::RpcValue;
use std::collections::{BTreeMap, HashMap};

/// A call waiting for the next flush
#[derive(Debug)]
pub struct PendingCall<K> {
    /// Key under which the reply is kept for [`Dispatcher::response`]
    pub id: Option<String>,
    /// Position in the batch, assigned by the session
    pub index: usize,
    pub on_complete: Option<K>,
    /// Kept for diagnostics only
    pub method: String,
    pub params: Vec<RpcValue>,
}

/// Collects staged calls and correlates the batched replies
///
/// `K` is whatever the owner wants handed back with a reply, typically a
/// completion to run once the call succeeded.
#[derive(Debug)]
pub struct Dispatcher<K> {
    pending: BTreeMap<usize, PendingCall<K>>,
    responses: HashMap<String, RpcValue>,
}

impl<K> Default for Dispatcher<K> {
    fn default() -> Self {
        Self {
            pending: BTreeMap::new(),
            responses: HashMap::new(),
        }
    }
}

impl<K> Dispatcher<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages a call in the session's batch and remembers how to route its reply
    pub fn stage<S: RpcSession + ?Sized>(
        &mut self,
        session: &mut S,
        method: &str,
        params: Vec<RpcValue>,
        id: Option<String>,
        on_complete: Option<K>,
    ) -> usize {
        let index = session.stage_batched(method, params.clone());
        debug!("Staged {} at batch index {}", method, index);

        self.pending.insert(
            index,
            PendingCall {
                id,
                index,
                on_complete,
                method: method.to_string(),
                params,
            },
        );
        index
    }

    /// Sends everything staged since the last flush in one round trip
    ///
    /// Returns the completions of the calls that succeeded, in batch order,
    /// paired with their reply. Faulted items are logged and left out. The
    /// pending table is empty afterwards whatever the outcome; a transport
    /// error means no reply could be matched and nothing is retried.
    pub fn flush<S: RpcSession + ?Sized>(
        &mut self,
        session: &mut S,
    ) -> Result<Vec<(K, RpcValue)>, TransportError> {
        if self.pending.is_empty() {
            return Ok(Vec::new());
        }

        let pending = std::mem::take(&mut self.pending);
        self.responses.clear();

        let outcomes = session.flush_batch()?;
        let mut completions = Vec::new();

        for (index, call) in pending {
            match outcomes.get(index) {
                Some(Ok(value)) => {
                    if let Some(id) = call.id {
                        self.responses.insert(id, value.clone());
                    }
                    if let Some(on_complete) = call.on_complete {
                        completions.push((on_complete, value.clone()));
                    }
                }
                Some(Err(fault)) => {
                    error!("[RPC Error {}] {}", fault.code, fault.message);
                    error!("  failed call: {} {:?}", call.method, call.params);
                }
                None => {
                    error!(
                        "No reply for {} at batch index {} ({} replies)",
                        call.method,
                        index,
                        outcomes.len()
                    );
                }
            }
        }

        Ok(completions)
    }

    /// Reply stored for `id` by the last flush that carried calls
    pub fn response(&self, id: &str) -> Option<&RpcValue> {
        self.responses.get(id)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
