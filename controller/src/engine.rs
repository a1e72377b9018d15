//! Controller core and callback routing
//!
//! [`Core`] owns every piece of state the controller keeps about the server:
//! the session, the pending multicall, the player and permission registries,
//! the race state and the settings. It is the context handed to every event
//! handler, chat command and call completion.
//!
//! [`Controller`] wraps the core with the event bus and the command registry
//! and turns server callbacks into state changes and events. One tick of the
//! main loop is [`Controller::tick`].

use crate::commands::{parse_command_line, ChatCommand, CommandRegistry};
use crate::config::{format_message, ClientVersion, Settings, DEFAULT_CLIENT_VERSION};
use crate::dispatcher::Dispatcher;
use crate::error::{EngineError, HandlerError};
use crate::events::{ChatLine, CheckpointInfo, Event, EventBus, EventKind};
use crate::moderation::BanList;
use crate::permissions::PermissionRegistry;
use crate::players::{Arrival, Departure, Player, PlayerRegistry, RelayContext, RelayPeer};
use crate::race::{Challenge, GameInfo, Record, RecordList, SessionState};
use crate::rpc::{Callback, QueryError, RpcSession};
use crate::scheduler::SecondTracker;
use crate::utils::unix_secs;
use log::{debug, info, warn};
use shared::{RpcValue, STATUS_PLAYING};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// What to run once a staged call succeeded
pub enum Completion<S> {
    /// Continue the begin-race transition with the fetched challenge
    NewChallenge,
    Custom(Box<dyn FnOnce(&mut Core<S>, &RpcValue) -> Result<(), HandlerError>>),
}

/// What the controller learned about the server it is attached to
#[derive(Debug, Clone, Default)]
pub struct ServerInfo {
    pub login: String,
    /// Player id the server uses for its own chat lines
    pub id: i64,
    pub nickname: String,
    pub name: String,
    pub zone: String,
    pub is_relay: bool,
    /// The server we relay, when `is_relay`
    pub relay_master: Option<RelayPeer>,
    pub game: String,
    pub version: String,
    pub build: String,
}

pub struct Core<S> {
    pub session: S,
    pub dispatcher: Dispatcher<Completion<S>>,
    pub players: PlayerRegistry,
    pub permissions: PermissionRegistry,
    pub state: SessionState,
    /// None until the first challenge was fetched
    pub challenge: Option<Challenge>,
    pub records: RecordList,
    pub game_info: GameInfo,
    pub server: ServerInfo,
    pub settings: Settings,
    pub ban_list: BanList,
}

impl<S: RpcSession> Core<S> {
    pub fn new(
        session: S,
        settings: Settings,
        permissions: PermissionRegistry,
        ban_list: BanList,
    ) -> Self {
        Self {
            session,
            dispatcher: Dispatcher::new(),
            players: PlayerRegistry::new(),
            permissions,
            state: SessionState::default(),
            challenge: None,
            records: RecordList::new(),
            game_info: GameInfo::default(),
            server: ServerInfo::default(),
            settings,
            ban_list,
        }
    }

    /// Stages a call for the next flush, ignoring its reply
    pub fn stage(&mut self, method: &str, params: Vec<RpcValue>) -> usize {
        self.stage_with(method, params, None, None)
    }

    pub fn stage_with(
        &mut self,
        method: &str,
        params: Vec<RpcValue>,
        id: Option<String>,
        completion: Option<Completion<S>>,
    ) -> usize {
        self.dispatcher
            .stage(&mut self.session, method, params, id, completion)
    }

    /// Stages a call and runs `then` with its reply after the flush
    pub fn stage_then<F>(&mut self, method: &str, params: Vec<RpcValue>, then: F) -> usize
    where
        F: FnOnce(&mut Core<S>, &RpcValue) -> Result<(), HandlerError> + 'static,
    {
        self.stage_with(method, params, None, Some(Completion::Custom(Box::new(then))))
    }

    /// Reply stored under `id` by the last flush
    pub fn response(&self, id: &str) -> Option<&RpcValue> {
        self.dispatcher.response(id)
    }

    /// Immediate call outside the batch
    pub fn query(&mut self, method: &str, params: Vec<RpcValue>) -> Result<RpcValue, EngineError> {
        self.session.query(method, params).map_err(|e| match e {
            QueryError::Fault(fault) => EngineError::query(method, fault),
            QueryError::Transport(e) => EngineError::Transport(e),
        })
    }

    /// Like [`query`](Self::query), but a fault is logged and yields None
    pub fn try_query(
        &mut self,
        method: &str,
        params: Vec<RpcValue>,
    ) -> Result<Option<RpcValue>, EngineError> {
        match self.query(method, params) {
            Ok(value) => Ok(Some(value)),
            Err(e @ EngineError::Query { .. }) => {
                warn!("{}", e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Chat line to everyone
    pub fn send_chat(&mut self, message: &str) -> Result<(), EngineError> {
        self.try_query("ChatSendServerMessage", vec![message.into()])?;
        Ok(())
    }

    /// Chat line to one player
    pub fn send_chat_to(&mut self, login: &str, message: &str) -> Result<(), EngineError> {
        self.try_query("ChatSendServerMessageToLogin", vec![message.into(), login.into()])?;
        Ok(())
    }

    pub fn is_relay(&self) -> bool {
        self.server.is_relay
    }

    /// Whether a connected player may use an ability
    pub fn allow_ability(&self, login: &str, ability: &str) -> bool {
        self.players
            .get(login)
            .map_or(false, |player| self.permissions.allow_ability(player, ability))
    }

    /// Sets the unlock flag of a player when the lock password matches
    pub fn unlock(&mut self, login: &str, password: &str) -> bool {
        self.permissions.unlocks(password) && self.players.unlock(login)
    }

    pub(crate) fn refresh_server_options(&mut self) -> Result<(), EngineError> {
        if let Some(options) = self.try_query("GetServerOptions", Vec::new())? {
            self.server.name = options.str_field("Name");
        }
        Ok(())
    }
}

/// Message of a failed unlock attempt or the confirmation
fn unlock_command<S: RpcSession>(core: &mut Core<S>, command: &ChatCommand) -> Result<(), HandlerError> {
    let login = command.author.login.as_str();
    let message = if core.unlock(login, &command.params) {
        info!("player {} unlocked admin commands", login);
        core.settings.messages.unlocked.clone()
    } else {
        warn!("player {} failed to unlock admin commands", login);
        core.settings.messages.unlock_failed.clone()
    };
    core.send_chat_to(login, &message)?;
    Ok(())
}

pub struct Controller<S> {
    pub core: Core<S>,
    bus: EventBus<Core<S>>,
    commands: CommandRegistry<Core<S>>,
    seconds: SecondTracker,
}

impl<S: RpcSession + 'static> Controller<S> {
    pub fn new(
        session: S,
        settings: Settings,
        permissions: PermissionRegistry,
        ban_list: BanList,
    ) -> Self {
        let mut commands = CommandRegistry::new();
        commands.register(
            "unlock",
            "Unlocks admin commands with the lock password",
            true,
            unlock_command::<S>,
        );

        Self {
            core: Core::new(session, settings, permissions, ban_list),
            bus: EventBus::new(),
            commands,
            seconds: SecondTracker::new(),
        }
    }
}

impl<S: RpcSession> Controller<S> {
    pub fn subscribe<F>(&mut self, kind: EventKind, handler: F)
    where
        F: FnMut(&mut Core<S>, &Event) -> Result<(), HandlerError> + 'static,
    {
        self.bus.subscribe(kind, handler);
    }

    pub fn register_command<F>(&mut self, name: &str, help: &str, admin_only: bool, handler: F)
    where
        F: FnMut(&mut Core<S>, &ChatCommand) -> Result<(), HandlerError> + 'static,
    {
        self.commands.register(name, help, admin_only, handler);
    }

    pub fn commands(&self) -> &CommandRegistry<Core<S>> {
        &self.commands
    }

    /// Publishes an event to its subscribers
    pub fn emit(&mut self, event: Event) {
        self.bus.publish(&mut self.core, &event);
    }

    /// One pass of the main loop
    ///
    /// `now_secs` is the wall-clock second the tick runs in.
    pub fn tick(&mut self, now_secs: u64) -> Result<(), EngineError> {
        self.execute_callbacks()?;
        self.execute_calls()?;
        self.emit(Event::MainLoop);

        if self.seconds.advance(now_secs) {
            self.emit(Event::EverySecond);
        }
        Ok(())
    }

    /// Handles every callback received since the last tick, in arrival order
    ///
    /// Returns how many callbacks were handled.
    pub fn execute_callbacks(&mut self) -> Result<usize, EngineError> {
        let callbacks = self.core.session.poll_callbacks()?;
        let count = callbacks.len();

        for callback in callbacks {
            if let Err(e) = self.handle_callback(&callback) {
                if e.is_fatal() {
                    return Err(e);
                }
                warn!("{} not fully handled: {}", callback.method, e);
            }
        }
        Ok(count)
    }

    /// Flushes the staged calls and runs the completions of those that succeeded
    pub fn execute_calls(&mut self) -> Result<(), EngineError> {
        let awaiting_challenge =
            self.core.state.challenge_requested && self.core.dispatcher.pending_len() > 0;
        let completions = self
            .core
            .dispatcher
            .flush(&mut self.core.session)
            .map_err(EngineError::Protocol)?;

        // a faulted challenge request must not block the next one
        if awaiting_challenge
            && !completions
                .iter()
                .any(|(completion, _)| matches!(completion, Completion::NewChallenge))
        {
            warn!("Current challenge could not be fetched, retrying when play resumes");
            self.core.state.challenge_requested = false;
        }

        for (completion, reply) in completions {
            match completion {
                Completion::NewChallenge => {
                    if let Err(e) = self.new_challenge(&reply) {
                        if e.is_fatal() {
                            return Err(e);
                        }
                        warn!("new challenge not fully handled: {}", e);
                    }
                }
                Completion::Custom(then) => {
                    if let Err(e) = then(&mut self.core, &reply) {
                        warn!("call completion failed: {}", e);
                    }
                }
            }
        }
        Ok(())
    }

    pub fn handle_callback(&mut self, callback: &Callback) -> Result<(), EngineError> {
        let params = callback.params.clone();
        match callback.method.as_str() {
            "TrackMania.PlayerConnect" => {
                let login = callback.param(0).as_str().unwrap_or_default().to_string();
                self.player_connect(&login)?;
            }
            "TrackMania.PlayerDisconnect" => {
                let login = callback.param(0).as_str().unwrap_or_default().to_string();
                self.player_disconnect(&login);
            }
            "TrackMania.PlayerChat" => {
                let line = ChatLine {
                    uid: callback.param(0).as_int().unwrap_or(0),
                    login: callback.param(1).as_str().unwrap_or_default().to_string(),
                    text: callback.param(2).as_str().unwrap_or_default().to_string(),
                };
                self.player_chat(&line);
                self.emit(Event::Chat(line));
            }
            "TrackMania.PlayerServerMessageAnswer" => {
                if callback.param(2).as_bool().unwrap_or(false) {
                    self.emit(Event::PlayerServerMessageAnswer(params));
                }
            }
            "TrackMania.PlayerCheckpoint" => {
                if !self.core.is_relay() {
                    let checkpoint = CheckpointInfo {
                        uid: callback.param(0).as_int().unwrap_or(0),
                        login: callback.param(1).as_str().unwrap_or_default().to_string(),
                        time_or_score: callback.param(2).as_int().unwrap_or(0),
                        lap: callback.param(3).as_int().unwrap_or(0),
                        index: callback.param(4).as_int().unwrap_or(0),
                    };
                    self.emit(Event::Checkpoint(checkpoint));
                }
            }
            "TrackMania.PlayerFinish" => {
                let uid = callback.param(0).as_int().unwrap_or(0);
                let login = callback.param(1).as_str().unwrap_or_default().to_string();
                let score = callback.param(2).as_int().unwrap_or(0);
                self.player_finish(uid, &login, score);
            }
            "TrackMania.BeginChallenge" => self.begin_race(&params)?,
            "TrackMania.EndChallenge" => self.end_race(&params)?,
            "TrackMania.BeginRound" => self.begin_round(),
            "TrackMania.EndRound" => self.end_round(),
            "TrackMania.StatusChanged" => {
                let code = callback.param(0).as_int().unwrap_or(0);
                self.status_changed(code as i32)?;
            }
            "TrackMania.PlayerInfoChanged" => self.player_info_changed(callback.param(0)),
            "TrackMania.PlayerManialinkPageAnswer" => self.emit(Event::ManialinkPageAnswer(params)),
            "TrackMania.BillUpdated" => self.emit(Event::BillUpdated(params)),
            "TrackMania.ChallengeListModified" => self.emit(Event::ChallengeListModified(params)),
            "TrackMania.PlayerIncoherence" => self.emit(Event::PlayerIncoherence(params)),
            "TrackMania.TunnelDataReceived" => self.emit(Event::TunnelDataReceived(params)),
            "TrackMania.Echo" => self.emit(Event::Echo(params)),
            "TrackMania.ManualFlowControlTransition" => {
                self.emit(Event::ManualFlowControlTransition(params))
            }
            "TrackMania.VoteUpdated" => self.emit(Event::VoteUpdated(params)),
            other => debug!("Ignoring callback {}", other),
        }
        Ok(())
    }

    /// Connect flow: classify, vet, admit, greet
    pub fn player_connect(&mut self, login: &str) -> Result<(), EngineError> {
        let detailed = self
            .core
            .try_query("GetDetailedPlayerInfo", vec![login.into()])?;
        let basic = self
            .core
            .try_query("GetPlayerInfo", vec![login.into(), 1.into()])?
            .unwrap_or_default();

        let arrival = self.core.players.on_connect(
            login,
            &basic,
            detailed.as_ref(),
            RelayContext {
                is_relay: self.core.server.is_relay,
                server_login: &self.core.server.login,
            },
        );

        match arrival {
            Arrival::Relay(_) | Arrival::Forwarded => Ok(()),
            Arrival::Unresolved { login } => {
                let message = self.core.settings.messages.connect_error.clone();
                self.core.send_chat_to(&login, &message)?;
                self.core.stage("Kick", vec![login.as_str().into()]);
                info!("GetPlayerInfo failed for {} -- notified & kicked", login);
                Ok(())
            }
            Arrival::Player(candidate) => self.admit_player(candidate),
        }
    }

    fn admit_player(&mut self, mut candidate: Player) -> Result<(), EngineError> {
        let login = candidate.login.clone();
        let messages = self.core.settings.messages.clone();

        if !candidate.ip.is_empty() && self.core.ban_list.contains(&candidate.ip) {
            self.core.send_chat_to(&login, &messages.banip_error)?;
            self.core.stage("Ban", vec![login.as_str().into()]);
            info!("Player {} banned from {} -- notified & kicked", login, candidate.ip);
            return Ok(());
        }

        if candidate.client_version.is_empty() {
            candidate.client_version = DEFAULT_CLIENT_VERSION.to_string();
        }
        let version = candidate.client_version.clone();
        let controller = &self.core.settings.controller;
        let outdated = if !controller.player_client.is_empty()
            && ClientVersion::is_below(&version, &controller.player_client)
        {
            Some("player")
        } else if !controller.admin_client.is_empty()
            && self.core.permissions.is_listed(&login)
            && ClientVersion::is_below(&version, &controller.admin_client)
        {
            Some("admin")
        } else {
            None
        };
        if let Some(kind) = outdated {
            self.core.send_chat_to(&login, &messages.client_error)?;
            self.core.stage("Kick", vec![login.as_str().into()]);
            info!(
                "Obsolete {} client version {} for {} -- notified & kicked",
                kind, version, login
            );
            return Ok(());
        }

        let player = self.core.players.admit(candidate).clone();

        let welcome = format_message(
            &messages.welcome,
            &[&player.nickname, &self.core.server.name, VERSION],
        );
        self.core.send_chat_to(&login, &welcome)?;

        if self.core.settings.controller.show_recs_before & 1 == 1 {
            let name = self
                .core
                .challenge
                .as_ref()
                .map_or(String::new(), |c| c.name.clone());
            let message = match self.core.records.first().filter(|r| r.score > 0) {
                Some(record) => format_message(
                    &messages.record_current,
                    &[&name, &self.core.game_info.format_score(record.score), &record.nickname],
                ),
                None => format_message(&messages.record_none, &[&name]),
            };
            self.core.send_chat_to(&login, &message)?;
        }

        self.emit(Event::PlayerConnect(player.clone()));
        self.emit(Event::PlayerConnect2(player));
        Ok(())
    }

    pub fn player_disconnect(&mut self, login: &str) {
        if let Some(Departure::Player(player)) = self.core.players.on_disconnect(login) {
            self.emit(Event::PlayerDisconnect(player));
        }
    }

    fn player_chat(&mut self, line: &ChatLine) {
        if line.login.is_empty() || line.login == "???" {
            warn!("playerUid {} has login [{}]!", line.uid, line.login);
            warn!("playerUid {} attempted to use chat \"{}\"", line.uid, line.text);
            return;
        }

        if let Some(master) = &self.core.server.relay_master {
            if self.core.server.is_relay && master.login == line.login {
                return;
            }
        }

        let Some((token, params)) = parse_command_line(&line.text) else {
            if !line.text.is_empty() {
                self.log_chat(line);
            }
            return;
        };

        if !self.commands.contains(&token) {
            if token == "version" || token == "serverlogin" {
                info!("player {} used built-in command \"{}\"", line.login, line.text);
            } else {
                debug!("player {} used unknown command /{}", line.login, token);
                self.log_chat(line);
            }
            return;
        }

        let Some(author) = self.core.players.get(&line.login).cloned() else {
            warn!(
                "player {} attempted to use chat command \"/{} {}\"",
                line.login, token, params
            );
            return;
        };

        info!("player {} used chat command \"/{} {}\"", line.login, token, params);
        let command = ChatCommand {
            author,
            name: token,
            params,
        };
        self.commands.dispatch(&mut self.core, &command);
    }

    fn log_chat(&self, line: &ChatLine) {
        if self.core.settings.controller.log_all_chat && line.uid != self.core.server.id {
            info!("({}) {}", line.login, line.text);
        }
    }

    fn player_finish(&mut self, uid: i64, login: &str, score: i64) {
        let Some(challenge) = &self.core.challenge else {
            return;
        };
        if uid == 0 || self.core.is_relay() || self.core.state.status != STATUS_PLAYING {
            return;
        }
        let Some(player) = self.core.players.get(login).filter(|p| !p.login.is_empty()) else {
            return;
        };

        let record = Record {
            login: player.login.clone(),
            nickname: player.nickname.clone(),
            score,
            timestamp: unix_secs(),
            is_new: false,
            challenge_uid: challenge.uid.clone(),
        };

        self.emit(Event::PlayerFinish1(record.clone()));
        self.emit(Event::PlayerFinish(record));
    }

    /// Reads the server identity, game settings and the connected players
    pub fn sync(&mut self) -> Result<(), EngineError> {
        let system = self.core.query("GetSystemInfo", Vec::new())?;
        self.core.server.login = system.str_field("ServerLogin");

        let server_login = self.core.server.login.clone();
        if let Some(info) = self
            .core
            .try_query("GetDetailedPlayerInfo", vec![server_login.as_str().into()])?
        {
            self.core.server.id = info.int_field("PlayerId");
            self.core.server.nickname = info.str_field("NickName");
            let path = info.str_field("Path");
            self.core.server.zone = path.strip_prefix("World|").unwrap_or(&path).to_string();
        }

        self.core.server.is_relay = self
            .core
            .try_query("IsRelayServer", Vec::new())?
            .and_then(|value| value.as_bool())
            .unwrap_or(false);
        self.core.server.relay_master = if self.core.server.is_relay {
            self.core
                .try_query("GetMainServerPlayerInfo", vec![1.into()])?
                .map(|master| RelayPeer {
                    login: master.str_field("Login"),
                    nickname: master.str_field("NickName"),
                })
        } else {
            None
        };

        if let Some(game_info) = self.core.try_query("GetCurrentGameInfo", vec![1.into()])? {
            self.core.game_info = GameInfo::from_rpc(&game_info);
        }
        if let Some(status) = self.core.try_query("GetStatus", Vec::new())? {
            self.core.state.status = status.int_field("Code") as i32;
        }
        self.core.refresh_server_options()?;

        self.emit(Event::Sync);

        let list = self
            .core
            .try_query("GetPlayerList", vec![300.into(), 0.into(), 2.into()])?
            .unwrap_or_default();
        let logins: Vec<String> = list
            .as_array()
            .unwrap_or_default()
            .iter()
            .map(|entry| entry.str_field("Login"))
            .filter(|login| !login.is_empty())
            .collect();
        for login in logins {
            self.player_connect(&login)?;
        }
        Ok(())
    }

    /// Announces the public chat commands to the server
    pub fn register_chat_commands(&mut self) -> Result<(), EngineError> {
        self.core.try_query("CleanChatCommand", Vec::new())?;
        let names: Vec<String> = self
            .commands
            .commands()
            .map(|(name, _)| name.to_string())
            .collect();
        for name in names {
            debug!("register chat command: {}", name);
            self.core.try_query("AddChatCommand", vec![name.into()])?;
        }
        Ok(())
    }

    /// Logs the banner and sends the startup message
    pub fn send_header(&mut self) -> Result<(), EngineError> {
        let address = self.core.settings.server.address();
        let server = &self.core.server;

        info!("###############################################################################");
        info!("  trackctl v{} running on {}", VERSION, address);
        info!("  Name   : {} - {}", server.name, server.login);
        if let Some(master) = &server.relay_master {
            info!("  Relays : {} - {}", master.nickname, master.login);
        }
        info!("  Game   : {} - {}", server.game, self.core.game_info.mode.name());
        info!("  Version: {} / {}", server.version, server.build);
        info!("###############################################################################");

        let message = format_message(&self.core.settings.messages.startup, &[VERSION, &address]);
        self.core.send_chat(&message)
    }

    /// Orderly shutdown hook
    pub fn shutdown(&mut self) {
        info!("Shutting down, {} players connected", self.core.players.len());
        self.emit(Event::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, MemoryListStore, ScriptedSession};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn player_info(login: &str, ip: &str, version: &str) -> (RpcValue, RpcValue) {
        let basic = RpcValue::object([
            ("Login", RpcValue::from(login)),
            ("NickName", RpcValue::from(login.to_uppercase())),
            ("PlayerId", RpcValue::from(12)),
            ("Flags", RpcValue::from(0)),
        ]);
        let detailed = RpcValue::object([
            ("Login", RpcValue::from(login)),
            ("IPAddress", RpcValue::from(format!("{}:2350", ip))),
            ("ClientVersion", RpcValue::from(version)),
        ]);
        (basic, detailed)
    }

    fn controller(session: ScriptedSession) -> Controller<ScriptedSession> {
        testing::controller_with(session, testing::settings(), &MemoryListStore::default())
    }

    fn connecting(login: &str, ip: &str, version: &str) -> ScriptedSession {
        let (basic, detailed) = player_info(login, ip, version);
        let mut session = ScriptedSession::new();
        session.reply("GetPlayerInfo", basic);
        session.reply("GetDetailedPlayerInfo", detailed);
        session
    }

    fn record_events(controller: &mut Controller<ScriptedSession>, kinds: &[EventKind]) -> Rc<RefCell<Vec<EventKind>>> {
        let seen = Rc::new(RefCell::new(Vec::new()));
        for kind in kinds {
            let seen = Rc::clone(&seen);
            controller.subscribe(*kind, move |_, event| {
                seen.borrow_mut().push(event.kind());
                Ok(())
            });
        }
        seen
    }

    #[test]
    fn test_player_connect_admits_and_greets() {
        let mut controller = controller(connecting("alice", "10.0.0.5", "TmForever (2.11.26)"));
        let seen = record_events(
            &mut controller,
            &[EventKind::PlayerConnect, EventKind::PlayerConnect2],
        );

        controller
            .handle_callback(&Callback::new("TrackMania.PlayerConnect", vec!["alice".into(), false.into()]))
            .unwrap();

        let player = controller.core.players.get("alice").unwrap();
        assert_eq!(player.ip, "10.0.0.5");
        assert_eq!(player.client_version, "2.11.26");
        assert_eq!(controller.core.session.queried("ChatSendServerMessageToLogin").len(), 1);
        assert_eq!(*seen.borrow(), vec![EventKind::PlayerConnect, EventKind::PlayerConnect2]);
    }

    #[test]
    fn test_banned_ip_is_banned_not_admitted() {
        let mut controller = controller(connecting("alice", "1.2.3.4", "2.11.26"));
        controller.core.ban_list.add("1.2.3.4");
        let seen = record_events(&mut controller, &[EventKind::PlayerConnect]);

        controller.player_connect("alice").unwrap();

        assert!(controller.core.players.get("alice").is_none());
        assert_eq!(controller.core.session.staged_methods(), vec!["Ban"]);
        assert!(seen.borrow().is_empty());
    }

    #[test]
    fn test_outdated_client_is_kicked() {
        let mut settings = testing::settings();
        settings.controller.player_client = "2.11.16".to_string();
        let mut controller = testing::controller_with(
            connecting("alice", "10.0.0.5", ""),
            settings,
            &MemoryListStore::default(),
        );

        // an unreported version counts as 2.11.11
        controller.player_connect("alice").unwrap();

        assert!(controller.core.players.is_empty());
        assert_eq!(controller.core.session.staged_methods(), vec!["Kick"]);
    }

    #[test]
    fn test_admin_client_minimum_applies_to_listed_logins_only() {
        let mut settings = testing::settings();
        settings.controller.admin_client = "2.11.26".to_string();
        let store = MemoryListStore::default();

        let mut controller =
            testing::controller_with(connecting("owner", "10.0.0.5", "2.11.19"), settings.clone(), &store);
        controller.player_connect("owner").unwrap();
        assert!(controller.core.players.is_empty());

        let mut controller =
            testing::controller_with(connecting("alice", "10.0.0.5", "2.11.19"), settings, &store);
        controller.player_connect("alice").unwrap();
        assert_eq!(controller.core.players.len(), 1);
    }

    #[test]
    fn test_unresolved_login_is_kicked() {
        let mut session = ScriptedSession::new();
        session.reply("GetPlayerInfo", RpcValue::object([("Login", RpcValue::from(""))]));
        let mut controller = controller(session);

        controller.player_connect("ghost").unwrap();

        assert!(controller.core.players.is_empty());
        assert_eq!(controller.core.session.staged()[0].1, vec![RpcValue::from("ghost")]);
    }

    #[test]
    fn test_disconnect_emits_with_removed_player() {
        let mut controller = controller(connecting("alice", "10.0.0.5", "2.11.26"));
        controller.player_connect("alice").unwrap();

        let left = Rc::new(RefCell::new(None));
        let sink = Rc::clone(&left);
        controller.subscribe(EventKind::PlayerDisconnect, move |_, event| {
            if let Event::PlayerDisconnect(player) = event {
                *sink.borrow_mut() = Some(player.login.clone());
            }
            Ok(())
        });

        controller.player_disconnect("alice");
        controller.player_disconnect("alice");

        assert_eq!(left.borrow().as_deref(), Some("alice"));
        assert!(controller.core.players.is_empty());
    }

    #[test]
    fn test_unlock_command() {
        let mut settings = testing::settings();
        settings.controller.lock_password = "sesame".to_string();
        let mut controller = testing::controller_with(
            connecting("owner", "10.0.0.5", "2.11.26"),
            settings,
            &MemoryListStore::default(),
        );
        controller.player_connect("owner").unwrap();
        assert!(!controller.core.allow_ability("owner", "kick"));

        let chat = |text: &str| {
            Callback::new(
                "TrackMania.PlayerChat",
                vec![12.into(), "owner".into(), text.into(), true.into()],
            )
        };
        controller.handle_callback(&chat("/unlock wrong")).unwrap();
        assert!(!controller.core.players.get("owner").unwrap().unlocked);

        controller.handle_callback(&chat("/unlock sesame")).unwrap();
        assert!(controller.core.players.get("owner").unwrap().unlocked);
        assert!(controller.core.allow_ability("owner", "kick"));
    }

    #[test]
    fn test_registered_command_needs_live_author() {
        let mut controller = controller(connecting("alice", "10.0.0.5", "2.11.26"));
        let calls = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&calls);
        controller.register_command("+", "Votes for the track", false, move |_, command| {
            sink.borrow_mut().push(format!("{}:{}", command.author.login, command.params));
            Ok(())
        });

        let chat = |login: &str| {
            Callback::new(
                "TrackMania.PlayerChat",
                vec![3.into(), login.into(), "/+ great".into(), true.into()],
            )
        };
        controller.handle_callback(&chat("alice")).unwrap();
        controller.player_connect("alice").unwrap();
        controller.handle_callback(&chat("alice")).unwrap();

        assert_eq!(*calls.borrow(), vec!["alice:great"]);
    }

    #[test]
    fn test_chat_always_emitted() {
        let mut controller = controller(ScriptedSession::new());
        let seen = record_events(&mut controller, &[EventKind::Chat]);

        for (login, text) in [("???", "hi"), ("bob", "/nosuchcommand"), ("bob", "hello")] {
            controller
                .handle_callback(&Callback::new(
                    "TrackMania.PlayerChat",
                    vec![5.into(), login.into(), text.into(), false.into()],
                ))
                .unwrap();
        }

        assert_eq!(seen.borrow().len(), 3);
    }

    #[test]
    fn test_finish_requires_challenge_and_playing_status() {
        let mut controller = controller(connecting("alice", "10.0.0.5", "2.11.26"));
        controller.player_connect("alice").unwrap();
        let seen = record_events(
            &mut controller,
            &[EventKind::PlayerFinish1, EventKind::PlayerFinish],
        );
        let finish = Callback::new(
            "TrackMania.PlayerFinish",
            vec![12.into(), "alice".into(), 41_230.into()],
        );

        controller.handle_callback(&finish).unwrap();
        assert!(seen.borrow().is_empty());

        controller.core.challenge = Some(Challenge {
            uid: "ABC123".into(),
            ..Challenge::default()
        });
        controller.handle_callback(&finish).unwrap();
        assert!(seen.borrow().is_empty());

        controller.core.state.status = STATUS_PLAYING;
        controller.handle_callback(&finish).unwrap();
        assert_eq!(*seen.borrow(), vec![EventKind::PlayerFinish1, EventKind::PlayerFinish]);
    }

    #[test]
    fn test_message_answer_needs_truthy_answer() {
        let mut controller = controller(ScriptedSession::new());
        let seen = record_events(&mut controller, &[EventKind::PlayerServerMessageAnswer]);

        for answer in [0, 1] {
            controller
                .handle_callback(&Callback::new(
                    "TrackMania.PlayerServerMessageAnswer",
                    vec![3.into(), "alice".into(), answer.into()],
                ))
                .unwrap();
        }

        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn test_every_second_once_per_second() {
        let mut controller = controller(ScriptedSession::new());
        let seen = record_events(&mut controller, &[EventKind::MainLoop, EventKind::EverySecond]);

        for now in [100, 100, 100, 101, 101, 103] {
            controller.tick(now).unwrap();
        }

        let seconds = seen
            .borrow()
            .iter()
            .filter(|kind| **kind == EventKind::EverySecond)
            .count();
        assert_eq!(seconds, 3);
        assert_eq!(seen.borrow().len(), 9);
    }

    #[test]
    fn test_custom_completion_runs_after_flush() {
        let mut session = ScriptedSession::new();
        session.batch_reply("GetServerOptions", RpcValue::object([("Name", RpcValue::from("My Server"))]));
        let mut controller = controller(session);

        controller.core.stage_then("GetServerOptions", Vec::new(), |core, reply| {
            core.server.name = reply.str_field("Name");
            Ok(())
        });
        controller.tick(1).unwrap();

        assert_eq!(controller.core.server.name, "My Server");
    }

    #[test]
    fn test_pass_through_and_unknown_callbacks() {
        let mut controller = controller(ScriptedSession::new());
        let seen = record_events(&mut controller, &[EventKind::Echo, EventKind::VoteUpdated]);

        controller.core.session.push_callback("TrackMania.Echo", vec!["a".into(), "b".into()]);
        controller.core.session.push_callback("TrackMania.SomethingNew", vec![]);
        controller.core.session.push_callback("TrackMania.VoteUpdated", vec![]);

        assert_eq!(controller.execute_callbacks().unwrap(), 3);
        assert_eq!(*seen.borrow(), vec![EventKind::Echo, EventKind::VoteUpdated]);
    }
}
