//! In-memory collaborators for driving a controller without a server
//!
//! [`ScriptedSession`] records every query and staged call, answers from a
//! script and hands out queued callbacks. [`MemoryListStore`] keeps every
//! saved ban list so tests can inspect what was persisted.

use crate::config::{ConfigError, Settings};
use crate::engine::Controller;
use crate::moderation::{BanList, ListStore};
use crate::permissions::PermissionRegistry;
use crate::rpc::{Callback, QueryError, RpcSession, TransportError};
use shared::{Fault, RpcValue};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

type Call = (String, Vec<RpcValue>);

#[derive(Debug, Default)]
pub struct ScriptedSession {
    queries: Vec<Call>,
    staged: Vec<Call>,
    batches: Vec<Vec<Call>>,
    replies: HashMap<String, Result<RpcValue, Fault>>,
    replies_once: HashMap<String, VecDeque<Result<RpcValue, Fault>>>,
    batch_replies: HashMap<String, Result<RpcValue, Fault>>,
    fail_next_flush: bool,
    callbacks: VecDeque<Callback>,
    last_error: Option<Fault>,
}

impl ScriptedSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers every query of `method` with `value`
    pub fn reply(&mut self, method: &str, value: RpcValue) {
        self.replies.insert(method.to_string(), Ok(value));
    }

    /// Answers every query of `method` with a fault
    pub fn fault(&mut self, method: &str, fault: Fault) {
        self.replies.insert(method.to_string(), Err(fault));
    }

    /// Answers the next query of `method` only, ahead of [`reply`](Self::reply)
    pub fn reply_once(&mut self, method: &str, value: RpcValue) {
        self.replies_once
            .entry(method.to_string())
            .or_default()
            .push_back(Ok(value));
    }

    /// Answers staged calls of `method` with `value`; unscripted calls get `true`
    pub fn batch_reply(&mut self, method: &str, value: RpcValue) {
        self.batch_replies.insert(method.to_string(), Ok(value));
    }

    pub fn batch_fault(&mut self, method: &str, fault: Fault) {
        self.batch_replies.insert(method.to_string(), Err(fault));
    }

    /// Makes the next flush fail as a whole
    pub fn fail_next_flush(&mut self) {
        self.fail_next_flush = true;
    }

    pub fn push_callback(&mut self, method: &str, params: Vec<RpcValue>) {
        self.callbacks.push_back(Callback::new(method, params));
    }

    /// Parameters of every query of `method`, oldest first
    pub fn queried(&self, method: &str) -> Vec<Vec<RpcValue>> {
        self.queries
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, params)| params.clone())
            .collect()
    }

    pub fn query_methods(&self) -> Vec<&str> {
        self.queries.iter().map(|(m, _)| m.as_str()).collect()
    }

    /// Calls staged since the last flush
    pub fn staged(&self) -> &[Call] {
        &self.staged
    }

    pub fn staged_methods(&self) -> Vec<&str> {
        self.staged.iter().map(|(m, _)| m.as_str()).collect()
    }

    /// Every batch sent so far
    pub fn batches(&self) -> &[Vec<Call>] {
        &self.batches
    }

    /// Methods of every call sent in a batch so far, in order
    pub fn flushed_methods(&self) -> Vec<&str> {
        self.batches
            .iter()
            .flatten()
            .map(|(m, _)| m.as_str())
            .collect()
    }

    pub fn flush_count(&self) -> usize {
        self.batches.len()
    }

    /// Drops the recorded history, keeping the script
    pub fn clear_history(&mut self) {
        self.queries.clear();
        self.batches.clear();
    }
}

impl RpcSession for ScriptedSession {
    fn query(&mut self, method: &str, params: Vec<RpcValue>) -> Result<RpcValue, QueryError> {
        self.queries.push((method.to_string(), params));

        let outcome = self
            .replies_once
            .get_mut(method)
            .and_then(VecDeque::pop_front)
            .or_else(|| self.replies.get(method).cloned())
            .unwrap_or(Ok(RpcValue::Bool(true)));

        match outcome {
            Ok(value) => {
                self.last_error = None;
                Ok(value)
            }
            Err(fault) => {
                self.last_error = Some(fault.clone());
                Err(QueryError::Fault(fault))
            }
        }
    }

    fn stage_batched(&mut self, method: &str, params: Vec<RpcValue>) -> usize {
        self.staged.push((method.to_string(), params));
        self.staged.len() - 1
    }

    fn flush_batch(&mut self) -> Result<Vec<Result<RpcValue, Fault>>, TransportError> {
        let batch = std::mem::take(&mut self.staged);
        let outcomes = batch
            .iter()
            .map(|(method, _)| {
                self.batch_replies
                    .get(method)
                    .cloned()
                    .unwrap_or(Ok(RpcValue::Bool(true)))
            })
            .collect();
        self.batches.push(batch);

        if std::mem::take(&mut self.fail_next_flush) {
            return Err(TransportError::MalformedBatch("scripted failure".to_string()));
        }
        Ok(outcomes)
    }

    fn poll_callbacks(&mut self) -> Result<Vec<Callback>, TransportError> {
        Ok(self.callbacks.drain(..).collect())
    }

    fn last_error(&self) -> Option<&Fault> {
        self.last_error.as_ref()
    }
}

/// Ban list store that keeps every saved version in memory
///
/// Clones share the same history.
#[derive(Debug, Clone, Default)]
pub struct MemoryListStore {
    saves: Rc<RefCell<Vec<Vec<String>>>>,
}

impl MemoryListStore {
    pub fn saves(&self) -> Vec<Vec<String>> {
        self.saves.borrow().clone()
    }
}

impl ListStore for MemoryListStore {
    fn save_banned_ips(&mut self, ips: &[String]) -> Result<(), ConfigError> {
        self.saves.borrow_mut().push(ips.to_vec());
        Ok(())
    }
}

/// Minimal valid settings with `owner` as MasterAdmin
pub fn settings() -> Settings {
    let text = r#"
        [server]
        password = "secret"
        timeout_secs = 5

        [[masteradmins]]
        login = "owner"
    "#;
    match Settings::from_toml_str(text) {
        Ok(settings) => settings,
        Err(e) => panic!("built-in test settings are invalid: {}", e),
    }
}

/// Controller over `session` with no admin lists and an empty ban list
pub fn controller_with(
    session: ScriptedSession,
    settings: Settings,
    store: &MemoryListStore,
) -> Controller<ScriptedSession> {
    let permissions = PermissionRegistry::new(
        settings.masteradmins.clone(),
        Default::default(),
        settings.controller.lock_password.clone(),
    );
    let ban_list = BanList::new(Vec::new(), Box::new(store.clone()));
    Controller::new(session, settings, permissions, ban_list)
}
