//! Settings and list files read at startup.
//!
//! The settings file is TOML:
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 5000
//! login = "SuperAdmin"
//! password = "secret"
//! timeout_secs = 180
//!
//! [[masteradmins]]
//! login = "owner"
//! ip = "10.0.*.*"
//!
//! [controller]
//! cheater_action = 3
//! global_win_multiple = 50
//! adminops_file = "adminops.toml"
//! ```
//!
//! Admin and operator lists live in a separate file, see [`AdminLists`].

use crate::moderation::CheaterAction;
use crate::permissions::AccessEntry;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Version assumed for clients that do not report one.
pub const DEFAULT_CLIENT_VERSION: &str = "2.11.11";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to write '{path}': {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize list: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid value for '{key}': {value}")]
    Invalid { key: String, value: String },

    #[error("missing required setting '{0}'")]
    Missing(&'static str),
}

impl ConfigError {
    pub fn invalid(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.into(),
            value: value.into(),
        }
    }

    fn read_file(path: &Path, source: std::io::Error) -> Self {
        Self::ReadFile {
            path: path.to_path_buf(),
            source,
        }
    }

    fn parse(path: &Path, source: toml::de::Error) -> Self {
        Self::Parse {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server: ServerSettings,
    #[serde(default)]
    pub masteradmins: Vec<AccessEntry>,
    #[serde(default)]
    pub controller: ControllerSettings,
    #[serde(default)]
    pub messages: Messages,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_login")]
    pub login: String,
    pub password: String,
    /// Bound for the startup readiness wait.
    pub timeout_secs: u64,
}

impl ServerSettings {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_login() -> String {
    "SuperAdmin".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControllerSettings {
    /// Empty disables the lock.
    pub lock_password: String,
    pub cheater_action: CheaterAction,
    pub global_win_multiple: u32,
    /// Bit 1: announce the current record in chat when a challenge begins.
    pub show_recs_before: u32,
    /// Bit 1: announce the ranking in chat when a challenge ends.
    pub show_recs_after: u32,
    /// A tick taking longer than this is reported.
    pub script_timeout_secs: u64,
    pub player_client: String,
    pub admin_client: String,
    pub log_all_chat: bool,
    pub adminops_file: PathBuf,
    pub bannedips_file: PathBuf,
    /// Passed to the server, which owns the blacklist file.
    pub blacklist_file: String,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            lock_password: String::new(),
            cheater_action: CheaterAction::None,
            global_win_multiple: 1,
            show_recs_before: 0,
            show_recs_after: 0,
            script_timeout_secs: 60,
            player_client: String::new(),
            admin_client: String::new(),
            log_all_chat: false,
            adminops_file: PathBuf::from("adminops.toml"),
            bannedips_file: PathBuf::from("bannedips.toml"),
            blacklist_file: "blacklist.txt".to_string(),
        }
    }
}

/// Chat templates; `{1}`, `{2}`... are replaced by [`format_message`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Messages {
    pub startup: String,
    pub welcome: String,
    pub record_current: String,
    pub record_none: String,
    pub ranking: String,
    pub ranking_none: String,
    pub ranking_record: String,
    pub win_multi: String,
    pub win_new: String,
    pub connect_error: String,
    pub banip_error: String,
    pub client_error: String,
    pub cheater: String,
    pub unlocked: String,
    pub unlock_failed: String,
}

impl Default for Messages {
    fn default() -> Self {
        Self {
            startup: "*** trackctl {1} running on {2} ***".to_string(),
            welcome: "Welcome {1} to {2}".to_string(),
            record_current: "Current record on {1} is {2} held by {3}".to_string(),
            record_none: "Currently no record on {1}".to_string(),
            ranking: "Ranking on {1} after this challenge:".to_string(),
            ranking_none: "No ranking on {1} after this challenge".to_string(),
            ranking_record: "{1}. {2} {3}".to_string(),
            win_multi: "Congratulations, {1} won their {2}. race!".to_string(),
            win_new: "You won your {1}. race".to_string(),
            connect_error: "Your login could not be resolved, please reconnect".to_string(),
            banip_error: "Your IP address is banned from this server".to_string(),
            client_error: "Your game client is outdated, please update it".to_string(),
            cheater: ">> Cheater {1} {2}!".to_string(),
            unlocked: "Admin commands unlocked".to_string(),
            unlock_failed: "Wrong password".to_string(),
        }
    }
}

/// Replaces `{1}`, `{2}`... with the given arguments in order.
///
/// The template is scanned once, so placeholders inside an argument are kept
/// as they are. Placeholders without an argument stay in the text.
pub fn format_message(template: &str, args: &[&str]) -> String {
    let mut text = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        text.push_str(&rest[..open]);
        let tail = &rest[open..];
        let placeholder = tail.find('}').and_then(|close| {
            let index: usize = tail[1..close].parse().ok()?;
            let arg = args.get(index.checked_sub(1)?)?;
            Some((*arg, close))
        });

        match placeholder {
            Some((arg, close)) => {
                text.push_str(arg);
                rest = &tail[close + 1..];
            }
            None => {
                text.push('{');
                rest = &tail[1..];
            }
        }
    }
    text.push_str(rest);
    text
}

impl Settings {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::read_file(path, e))?;
        let settings: Settings = toml::from_str(&text).map_err(|e| ConfigError::parse(path, e))?;
        settings.validated()
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let settings: Settings =
            toml::from_str(text).map_err(|e| ConfigError::parse(Path::new("<inline>"), e))?;
        settings.validated()
    }

    fn validated(mut self) -> Result<Self, ConfigError> {
        if self.server.timeout_secs == 0 {
            return Err(ConfigError::invalid("server.timeout_secs", "0"));
        }
        if self.masteradmins.iter().all(|entry| entry.login.is_empty()) {
            return Err(ConfigError::Missing("masteradmins"));
        }

        let controller = &mut self.controller;
        if controller.global_win_multiple == 0 {
            controller.global_win_multiple = 1;
        }
        for (key, version) in [
            ("controller.player_client", &controller.player_client),
            ("controller.admin_client", &controller.admin_client),
        ] {
            if !version.is_empty() && ClientVersion::parse(version).is_none() {
                return Err(ConfigError::invalid(key, version.as_str()));
            }
        }

        Ok(self)
    }
}

/// Admin and operator lists plus the per-tier ability switches.
///
/// ```toml
/// [[admins]]
/// login = "alice"
/// ip = "192.168.1.*"
///
/// [[operators]]
/// login = "bob"
///
/// [admin_abilities]
/// kick = true
///
/// [operator_abilities]
/// kick = false
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminLists {
    pub admins: Vec<AccessEntry>,
    pub operators: Vec<AccessEntry>,
    pub admin_abilities: HashMap<String, bool>,
    pub operator_abilities: HashMap<String, bool>,
}

impl AdminLists {
    /// A missing file yields empty lists; a malformed one is an error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Admin/operator list {} not found, no admins or operators", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::read_file(path, e)),
        };
        Self::from_toml_str(&text).map_err(|e| ConfigError::parse(path, e))
    }

    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        let mut lists: AdminLists = toml::from_str(text)?;
        lists.admin_abilities = normalize_abilities(lists.admin_abilities);
        lists.operator_abilities = normalize_abilities(lists.operator_abilities);
        Ok(lists)
    }
}

fn normalize_abilities(abilities: HashMap<String, bool>) -> HashMap<String, bool> {
    abilities
        .into_iter()
        .map(|(name, allowed)| (name.to_uppercase(), allowed))
        .collect()
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct BannedIpsFile {
    #[serde(default)]
    ips: Vec<String>,
}

/// Reads the banned IP list; a missing file is an empty list.
pub fn load_banned_ips(path: impl AsRef<Path>) -> Result<Vec<String>, ConfigError> {
    let path = path.as_ref();
    match std::fs::read_to_string(path) {
        Ok(text) => {
            let file: BannedIpsFile =
                toml::from_str(&text).map_err(|e| ConfigError::parse(path, e))?;
            info!("Loaded {} banned IPs from {}", file.ips.len(), path.display());
            Ok(file.ips)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(ConfigError::read_file(path, e)),
    }
}

pub fn write_banned_ips(path: impl AsRef<Path>, ips: &[String]) -> Result<(), ConfigError> {
    let path = path.as_ref();
    let text = toml::to_string(&BannedIpsFile { ips: ips.to_vec() })?;
    std::fs::write(path, text).map_err(|source| ConfigError::WriteFile {
        path: path.to_path_buf(),
        source,
    })
}

/// Dotted numeric client version, compared component by component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientVersion(Vec<u32>);

impl ClientVersion {
    pub fn parse(text: &str) -> Option<Self> {
        let parts: Option<Vec<u32>> = text.trim().split('.').map(|p| p.parse().ok()).collect();
        parts.filter(|p| p.len() >= 2).map(ClientVersion)
    }

    /// Extracts the version from a reported client string such as
    /// `"TmForever (2.11.26)"`, falling back to [`DEFAULT_CLIENT_VERSION`].
    pub fn from_reported(reported: &str) -> String {
        let inner = match reported.rfind('(') {
            Some(open) => &reported[open + 1..],
            None => reported,
        };
        let version = inner.replace(')', "");
        let version = version.trim();
        if version.is_empty() {
            DEFAULT_CLIENT_VERSION.to_string()
        } else {
            version.to_string()
        }
    }

    /// True when `actual` is older than `minimum`. Unparsable versions are
    /// treated as outdated.
    pub fn is_below(actual: &str, minimum: &str) -> bool {
        match (Self::parse(actual), Self::parse(minimum)) {
            (Some(actual), Some(minimum)) => actual < minimum,
            (None, Some(_)) => true,
            _ => false,
        }
    }
}

impl PartialOrd for ClientVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ClientVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}
