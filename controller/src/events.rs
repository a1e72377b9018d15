//! Typed events and the synchronous bus that fans them out
//!
//! Every event the controller emits is one [`Event`] variant. Handlers
//! subscribe to an [`EventKind`] and are run in subscription order on the
//! caller's stack; a failing handler is logged and the remaining handlers
//! still run.

use crate::error::HandlerError;
use crate::players::Player;
use crate::race::{Challenge, RaceResult, Record};
use log::error;
use shared::RpcValue;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

/// A chat line as the server reported it
#[derive(Debug, Clone, PartialEq)]
pub struct ChatLine {
    /// Player id of the author, the server's own id for server messages
    pub uid: i64,
    pub login: String,
    pub text: String,
}

/// A checkpoint crossing
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointInfo {
    pub uid: i64,
    pub login: String,
    pub time_or_score: i64,
    pub lap: i64,
    pub index: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Startup,
    Sync,
    MainLoop,
    EverySecond,
    Shutdown,
    PlayerConnect(Player),
    PlayerConnect2(Player),
    PlayerDisconnect(Player),
    Chat(ChatLine),
    Checkpoint(CheckpointInfo),
    PlayerFinish1(Record),
    PlayerFinish(Record),
    PlayerServerMessageAnswer(Vec<RpcValue>),
    NewChallenge(Challenge),
    NewChallenge2(Challenge),
    /// Instant restart detected at the end of a race
    RestartChallenge(RaceResult),
    /// The restarted challenge began; records were kept
    RestartChallenge2(Challenge),
    EndRace1(RaceResult),
    EndRace(RaceResult),
    BeginRound,
    EndRound,
    StatusChangeTo { code: i32, previous: i32 },
    PlayerInfoChanged(Player),
    PlayerWins(Player),
    ManialinkPageAnswer(Vec<RpcValue>),
    BillUpdated(Vec<RpcValue>),
    ChallengeListModified(Vec<RpcValue>),
    PlayerIncoherence(Vec<RpcValue>),
    TunnelDataReceived(Vec<RpcValue>),
    Echo(Vec<RpcValue>),
    ManualFlowControlTransition(Vec<RpcValue>),
    VoteUpdated(Vec<RpcValue>),
}

/// Subscription key of an [`Event`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Startup,
    Sync,
    MainLoop,
    EverySecond,
    Shutdown,
    PlayerConnect,
    PlayerConnect2,
    PlayerDisconnect,
    Chat,
    Checkpoint,
    PlayerFinish1,
    PlayerFinish,
    PlayerServerMessageAnswer,
    NewChallenge,
    NewChallenge2,
    RestartChallenge,
    RestartChallenge2,
    EndRace1,
    EndRace,
    BeginRound,
    EndRound,
    /// Status changes are subscribed per target status code
    StatusChangeTo(i32),
    PlayerInfoChanged,
    PlayerWins,
    ManialinkPageAnswer,
    BillUpdated,
    ChallengeListModified,
    PlayerIncoherence,
    TunnelDataReceived,
    Echo,
    ManualFlowControlTransition,
    VoteUpdated,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Startup => EventKind::Startup,
            Event::Sync => EventKind::Sync,
            Event::MainLoop => EventKind::MainLoop,
            Event::EverySecond => EventKind::EverySecond,
            Event::Shutdown => EventKind::Shutdown,
            Event::PlayerConnect(_) => EventKind::PlayerConnect,
            Event::PlayerConnect2(_) => EventKind::PlayerConnect2,
            Event::PlayerDisconnect(_) => EventKind::PlayerDisconnect,
            Event::Chat(_) => EventKind::Chat,
            Event::Checkpoint(_) => EventKind::Checkpoint,
            Event::PlayerFinish1(_) => EventKind::PlayerFinish1,
            Event::PlayerFinish(_) => EventKind::PlayerFinish,
            Event::PlayerServerMessageAnswer(_) => EventKind::PlayerServerMessageAnswer,
            Event::NewChallenge(_) => EventKind::NewChallenge,
            Event::NewChallenge2(_) => EventKind::NewChallenge2,
            Event::RestartChallenge(_) => EventKind::RestartChallenge,
            Event::RestartChallenge2(_) => EventKind::RestartChallenge2,
            Event::EndRace1(_) => EventKind::EndRace1,
            Event::EndRace(_) => EventKind::EndRace,
            Event::BeginRound => EventKind::BeginRound,
            Event::EndRound => EventKind::EndRound,
            Event::StatusChangeTo { code, .. } => EventKind::StatusChangeTo(*code),
            Event::PlayerInfoChanged(_) => EventKind::PlayerInfoChanged,
            Event::PlayerWins(_) => EventKind::PlayerWins,
            Event::ManialinkPageAnswer(_) => EventKind::ManialinkPageAnswer,
            Event::BillUpdated(_) => EventKind::BillUpdated,
            Event::ChallengeListModified(_) => EventKind::ChallengeListModified,
            Event::PlayerIncoherence(_) => EventKind::PlayerIncoherence,
            Event::TunnelDataReceived(_) => EventKind::TunnelDataReceived,
            Event::Echo(_) => EventKind::Echo,
            Event::ManualFlowControlTransition(_) => EventKind::ManualFlowControlTransition,
            Event::VoteUpdated(_) => EventKind::VoteUpdated,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::StatusChangeTo(code) => return write!(f, "onStatusChangeTo{}", code),
            EventKind::Startup => "onStartup",
            EventKind::Sync => "onSync",
            EventKind::MainLoop => "onMainLoop",
            EventKind::EverySecond => "onEverySecond",
            EventKind::Shutdown => "onShutdown",
            EventKind::PlayerConnect => "onPlayerConnect",
            EventKind::PlayerConnect2 => "onPlayerConnect2",
            EventKind::PlayerDisconnect => "onPlayerDisconnect",
            EventKind::Chat => "onChat",
            EventKind::Checkpoint => "onCheckpoint",
            EventKind::PlayerFinish1 => "onPlayerFinish1",
            EventKind::PlayerFinish => "onPlayerFinish",
            EventKind::PlayerServerMessageAnswer => "onPlayerServerMessageAnswer",
            EventKind::NewChallenge => "onNewChallenge",
            EventKind::NewChallenge2 => "onNewChallenge2",
            EventKind::RestartChallenge => "onRestartChallenge",
            EventKind::RestartChallenge2 => "onRestartChallenge2",
            EventKind::EndRace1 => "onEndRace1",
            EventKind::EndRace => "onEndRace",
            EventKind::BeginRound => "onBeginRound",
            EventKind::EndRound => "onEndRound",
            EventKind::PlayerInfoChanged => "onPlayerInfoChanged",
            EventKind::PlayerWins => "onPlayerWins",
            EventKind::ManialinkPageAnswer => "onPlayerManialinkPageAnswer",
            EventKind::BillUpdated => "onBillUpdated",
            EventKind::ChallengeListModified => "onChallengeListModified",
            EventKind::PlayerIncoherence => "onPlayerIncoherence",
            EventKind::TunnelDataReceived => "onTunnelDataReceived",
            EventKind::Echo => "onEcho",
            EventKind::ManualFlowControlTransition => "onManualFlowControlTransition",
            EventKind::VoteUpdated => "onVoteUpdated",
        };
        f.write_str(name)
    }
}

pub type Handler<C> = Box<dyn FnMut(&mut C, &Event) -> Result<(), HandlerError>>;

/// Ordered handler lists keyed by event kind
///
/// `C` is the context handed to every handler, so handlers can act on the
/// controller state without reaching for globals.
pub struct EventBus<C> {
    handlers: HashMap<EventKind, Vec<Handler<C>>>,
}

impl<C> Default for EventBus<C> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<C> EventBus<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a handler; handlers run in the order they subscribed
    pub fn subscribe<F>(&mut self, kind: EventKind, handler: F)
    where
        F: FnMut(&mut C, &Event) -> Result<(), HandlerError> + 'static,
    {
        self.handlers.entry(kind).or_default().push(Box::new(handler));
    }

    /// Runs every handler subscribed to the event's kind
    ///
    /// A handler that returns an error or panics is logged and counted; the
    /// remaining handlers still run. Returns the number of handlers that failed.
    pub fn publish(&mut self, context: &mut C, event: &Event) -> usize {
        let kind = event.kind();
        let Some(handlers) = self.handlers.get_mut(&kind) else {
            return 0;
        };

        let mut failed = 0;
        for (position, handler) in handlers.iter_mut().enumerate() {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(context, event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("{} handler #{} failed: {}", kind, position, e);
                    failed += 1;
                }
                Err(payload) => {
                    error!(
                        "{} handler #{} panicked: {}",
                        kind,
                        position,
                        panic_message(&*payload)
                    );
                    failed += 1;
                }
            }
        }
        failed
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers.get(&kind).map_or(0, Vec::len)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

impl<C> fmt::Debug for EventBus<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut counts: Vec<(String, usize)> = self
            .handlers
            .iter()
            .map(|(kind, list)| (kind.to_string(), list.len()))
            .collect();
        counts.sort();
        f.debug_struct("EventBus").field("handlers", &counts).finish()
    }
}
