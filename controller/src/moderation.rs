//! Cheat escalation and the banned IP list
//!
//! A detected cheat is always logged with its checkpoint history and then
//! escalated according to the configured [`CheaterAction`]. The order of
//! effects is fixed: log, broadcast the notice, persist the ban list, then
//! stage the transport actions. The ban list is written before the server is
//! asked to enforce it, so a crash in between leaves the list ahead of the
//! server and never behind it.

use crate::config::{format_message, write_banned_ips, ConfigError};
use crate::engine::Core;
use crate::error::EngineError;
use crate::rpc::RpcSession;
use crate::utils::format_time;
use log::{info, warn};
use serde::Deserialize;
use shared::RpcValue;
use std::path::PathBuf;

/// Policy applied to a detected cheater
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "u8")]
pub enum CheaterAction {
    #[default]
    None,
    ForceSpectator,
    Kick,
    Ban,
    BlackListKick,
    BlackListBan,
}

impl TryFrom<u8> for CheaterAction {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(CheaterAction::None),
            1 => Ok(CheaterAction::ForceSpectator),
            2 => Ok(CheaterAction::Kick),
            3 => Ok(CheaterAction::Ban),
            4 => Ok(CheaterAction::BlackListKick),
            5 => Ok(CheaterAction::BlackListBan),
            other => Err(format!("cheater action must be 0-5, got {}", other)),
        }
    }
}

impl CheaterAction {
    fn verb(&self) -> &'static str {
        match self {
            CheaterAction::None => "ignored",
            CheaterAction::ForceSpectator => "forced into spectator",
            CheaterAction::Kick => "kicked",
            CheaterAction::Ban => "banned",
            CheaterAction::BlackListKick => "blacklisted",
            CheaterAction::BlackListBan => "blacklisted & banned",
        }
    }

    fn bans_ip(&self) -> bool {
        matches!(self, CheaterAction::Ban | CheaterAction::BlackListBan)
    }
}

/// What gave the cheater away
#[derive(Debug, Clone, PartialEq)]
pub enum Anomaly {
    /// An impossible checkpoint
    Checkpoint { time: i64, index: i64 },
    /// An impossible finish time
    Finish(i64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheatReport {
    pub login: String,
    /// Checkpoint times so far, in milliseconds
    pub checkpoints: Vec<i64>,
    pub anomaly: Anomaly,
}

/// Durable storage for the banned IP list
pub trait ListStore {
    fn save_banned_ips(&mut self, ips: &[String]) -> Result<(), ConfigError>;
}

/// Writes the list to the configured TOML file
#[derive(Debug, Clone)]
pub struct FileListStore {
    path: PathBuf,
}

impl FileListStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ListStore for FileListStore {
    fn save_banned_ips(&mut self, ips: &[String]) -> Result<(), ConfigError> {
        write_banned_ips(&self.path, ips)
    }
}

pub struct BanList {
    ips: Vec<String>,
    store: Box<dyn ListStore>,
}

impl BanList {
    pub fn new(ips: Vec<String>, store: Box<dyn ListStore>) -> Self {
        Self { ips, store }
    }

    /// Adds an address unless it is already listed
    pub fn add(&mut self, ip: &str) -> bool {
        if ip.is_empty() || self.contains(ip) {
            return false;
        }
        self.ips.push(ip.to_string());
        true
    }

    pub fn contains(&self, ip: &str) -> bool {
        self.ips.iter().any(|banned| banned == ip)
    }

    pub fn ips(&self) -> &[String] {
        &self.ips
    }

    pub fn persist(&mut self) -> Result<(), EngineError> {
        self.store
            .save_banned_ips(&self.ips)
            .map_err(|source| EngineError::Persistence {
                what: "banned IPs",
                source,
            })
    }
}

impl<S: RpcSession> Core<S> {
    /// Escalates a detected cheat according to the configured policy
    pub fn process_cheater(&mut self, report: &CheatReport) -> Result<(), EngineError> {
        let cps = report
            .checkpoints
            .iter()
            .map(|time| format_time(*time))
            .collect::<Vec<_>>()
            .join("/");
        match report.anomaly {
            Anomaly::Checkpoint { time, index } => warn!(
                "Cheat by '{}' detected! CPs: {} Last: {} index: {}",
                report.login,
                cps,
                format_time(time),
                index
            ),
            Anomaly::Finish(time) => warn!(
                "Cheat by '{}' detected! CPs: {} Finish: {}",
                report.login,
                cps,
                format_time(time)
            ),
        }

        let Some(player) = self.players.get(&report.login).cloned() else {
            warn!("Player object for '{}' not found!", report.login);
            return Ok(());
        };

        let action = self.settings.controller.cheater_action;
        if action == CheaterAction::None {
            return Ok(());
        }

        info!("Cheater [{} : {}] {}!", player.login, player.nickname, action.verb());
        let notice = format_message(
            &self.settings.messages.cheater,
            &[&player.nickname, action.verb()],
        );
        self.send_chat(&notice)?;

        if action.bans_ip() {
            self.ban_list.add(&player.ip);
            self.ban_list.persist()?;
        }

        let login = RpcValue::from(player.login.as_str());
        match action {
            CheaterAction::None => {}
            CheaterAction::ForceSpectator => {
                if self
                    .try_query("ForceSpectator", vec![login.clone(), 1.into()])?
                    .is_some()
                {
                    self.try_query("ForceSpectator", vec![login.clone(), 0.into()])?;
                }
                self.stage("ForceSpectatorTarget", vec![login.clone(), "".into(), 2.into()]);
                self.stage("SpectatorReleasePlayerSlot", vec![login]);
            }
            CheaterAction::Kick => {
                self.stage("Kick", vec![login]);
            }
            CheaterAction::Ban => {
                self.stage("Ban", vec![login]);
            }
            CheaterAction::BlackListKick | CheaterAction::BlackListBan => {
                self.stage("BlackList", vec![login.clone()]);
                let enforce = if action == CheaterAction::BlackListKick {
                    "Kick"
                } else {
                    "Ban"
                };
                self.stage(enforce, vec![login]);
                let file = self.settings.controller.blacklist_file.clone();
                self.stage("SaveBlackList", vec![file.into()]);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Controller;
    use crate::players::Player;
    use crate::testing::{self, MemoryListStore, ScriptedSession};
    use shared::Fault;

    fn setup(action: u8, store: &MemoryListStore) -> Controller<ScriptedSession> {
        let mut settings = testing::settings();
        settings.controller.cheater_action = CheaterAction::try_from(action).unwrap();
        let mut controller = testing::controller_with(ScriptedSession::new(), settings, store);

        let mut alice = Player::new("alice");
        alice.nickname = "Alice".to_string();
        alice.ip = "1.2.3.4".to_string();
        controller.core.players.admit(alice);
        controller
    }

    fn report(login: &str) -> CheatReport {
        CheatReport {
            login: login.to_string(),
            checkpoints: vec![12_000, 25_500],
            anomaly: Anomaly::Finish(30_000),
        }
    }

    #[test]
    fn test_action_from_number() {
        assert_eq!(CheaterAction::try_from(0), Ok(CheaterAction::None));
        assert_eq!(CheaterAction::try_from(5), Ok(CheaterAction::BlackListBan));
        assert!(CheaterAction::try_from(6).is_err());
    }

    #[test]
    fn test_ban_list_deduplicates() {
        let store = MemoryListStore::default();
        let mut list = BanList::new(vec!["5.6.7.8".into()], Box::new(store.clone()));

        assert!(list.add("1.2.3.4"));
        assert!(!list.add("1.2.3.4"));
        assert!(!list.add("5.6.7.8"));
        assert!(!list.add(""));
        assert_eq!(list.ips(), ["5.6.7.8", "1.2.3.4"]);

        list.persist().unwrap();
        assert_eq!(store.saves(), vec![vec!["5.6.7.8".to_string(), "1.2.3.4".to_string()]]);
    }

    #[test]
    fn test_ban_policy() {
        let store = MemoryListStore::default();
        let mut controller = setup(3, &store);

        controller.core.process_cheater(&report("alice")).unwrap();

        let session = &controller.core.session;
        assert_eq!(session.queried("ChatSendServerMessage").len(), 1);
        assert_eq!(controller.core.ban_list.ips(), ["1.2.3.4"]);
        assert_eq!(store.saves().len(), 1);
        assert_eq!(session.staged_methods(), vec!["Ban"]);
        assert_eq!(session.staged()[0].1, vec![RpcValue::from("alice")]);
    }

    #[test]
    fn test_repeated_ban_keeps_single_entry() {
        let store = MemoryListStore::default();
        let mut controller = setup(3, &store);

        controller.core.process_cheater(&report("alice")).unwrap();
        controller.core.process_cheater(&report("alice")).unwrap();

        assert_eq!(controller.core.ban_list.ips(), ["1.2.3.4"]);
        assert_eq!(store.saves().len(), 2);
    }

    #[test]
    fn test_blacklist_policies_save_after_blacklisting() {
        let store = MemoryListStore::default();
        let mut controller = setup(4, &store);
        controller.core.process_cheater(&report("alice")).unwrap();

        assert_eq!(
            controller.core.session.staged_methods(),
            vec!["BlackList", "Kick", "SaveBlackList"]
        );
        assert!(store.saves().is_empty());

        let store = MemoryListStore::default();
        let mut controller = setup(5, &store);
        controller.core.process_cheater(&report("alice")).unwrap();

        assert_eq!(
            controller.core.session.staged_methods(),
            vec!["BlackList", "Ban", "SaveBlackList"]
        );
        assert_eq!(store.saves().len(), 1);
    }

    #[test]
    fn test_force_spectator_falls_back_even_when_toggle_fails() {
        let store = MemoryListStore::default();
        let mut controller = setup(1, &store);
        controller
            .core
            .session
            .fault("ForceSpectator", Fault::new(-1000, "Not a player."));

        controller.core.process_cheater(&report("alice")).unwrap();

        let session = &controller.core.session;
        assert_eq!(session.queried("ForceSpectator").len(), 1);
        assert_eq!(
            session.staged_methods(),
            vec!["ForceSpectatorTarget", "SpectatorReleasePlayerSlot"]
        );
    }

    #[test]
    fn test_force_spectator_toggles_back() {
        let store = MemoryListStore::default();
        let mut controller = setup(1, &store);

        controller.core.process_cheater(&report("alice")).unwrap();

        let toggles = controller.core.session.queried("ForceSpectator");
        assert_eq!(toggles.len(), 2);
        assert_eq!(toggles[1][1], RpcValue::from(0));
    }

    #[test]
    fn test_unknown_player_aborts() {
        let store = MemoryListStore::default();
        let mut controller = setup(3, &store);

        controller.core.process_cheater(&report("mallory")).unwrap();

        assert!(controller.core.session.queried("ChatSendServerMessage").is_empty());
        assert!(controller.core.session.staged().is_empty());
        assert!(store.saves().is_empty());
    }

    #[test]
    fn test_policy_none_only_logs() {
        let store = MemoryListStore::default();
        let mut controller = setup(0, &store);

        controller.core.process_cheater(&report("alice")).unwrap();

        assert!(controller.core.session.queried("ChatSendServerMessage").is_empty());
        assert!(controller.core.session.staged().is_empty());
    }

    struct ReadOnlyStore;

    impl ListStore for ReadOnlyStore {
        fn save_banned_ips(&mut self, _ips: &[String]) -> Result<(), ConfigError> {
            Err(ConfigError::WriteFile {
                path: "bannedips.toml".into(),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
            })
        }
    }

    #[test]
    fn test_ban_not_issued_when_list_cannot_be_saved() {
        let mut controller = setup(3, &MemoryListStore::default());
        controller.core.ban_list = BanList::new(Vec::new(), Box::new(ReadOnlyStore));

        let result = controller.core.process_cheater(&report("alice"));

        assert!(matches!(result, Err(EngineError::Persistence { .. })));
        assert!(controller.core.session.staged_methods().is_empty());
    }
}
